/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Byte-prefixes that specify where decided messages are stored in a user-provided key-value store.
//!
//! |Variable|Type|Description|
//! |---|---|---|
//! |Decided|([`ValidatorPk`], [`SeqNumber`]) -> [`SignedMessage`](crate::messages::SignedMessage)|The decided message for each sequence number of each validator.|
//! |Highest Decided|[`ValidatorPk`] -> [`SeqNumber`]|The highest sequence number that has a Decided entry for each validator.|
//!
//! Each variable is stored as Borsh-serialized values under keys formed by concatenating the variable's
//! one-byte prefix, the Borsh serialization of the validator key, and (for Decided) the big-endian bytes
//! of the sequence number. Big-endian keeps the entries of one validator in sequence order for stores
//! that iterate keys in byte order.

use borsh::BorshSerialize;

use crate::types::data_types::{SeqNumber, ValidatorPk};

pub const DECIDED: [u8; 1] = [0];
pub const HIGHEST_DECIDED: [u8; 1] = [1];

/// Key of the Decided entry for `validator_pk` at `seq_number`.
pub fn decided_key(validator_pk: &ValidatorPk, seq_number: SeqNumber) -> Vec<u8> {
    concat(
        &concat(&DECIDED, &validator_pk.try_to_vec().unwrap()),
        &seq_number.to_be_bytes(),
    )
}

/// Key of the Highest Decided entry for `validator_pk`.
pub fn highest_decided_key(validator_pk: &ValidatorPk) -> Vec<u8> {
    concat(&HIGHEST_DECIDED, &validator_pk.try_to_vec().unwrap())
}

/// Takes references to two byteslices and returns a vector containing the bytes of the first one, and
/// then the bytes of the second one.
pub(crate) fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}
