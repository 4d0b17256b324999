/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Persistence of decided messages.
//!
//! Consensus instances, history sync runs, and sync request handlers all share one [`DecidedStore`].
//! The store records at most one decided [`SignedMessage`] per `(ValidatorPk, SeqNumber)` and keeps
//! track of the highest decided sequence number per validator.
//!
//! ## Insert-if-absent
//!
//! [`save_decided`](DecidedStore::save_decided) never overwrites an existing entry. Saving a decided
//! message for a key that already has one returns [`SaveDecidedOutcome::AlreadyExists`] and leaves the
//! stored entry unchanged, even if the new message carries a different value. Because every writer goes
//! through this compare-and-insert, writers do not need to coordinate with each other.
//!
//! ## Implementations
//!
//! Library users can implement `DecidedStore` directly, or implement the lower-level
//! [`KVStore`](pluggables::KVStore) trait and wrap it in a [`KVDecidedStore`], which lays decided
//! messages out in the key-value store as described in [`variables`].

pub mod kv_decided_store;

pub mod pluggables;

pub mod variables;

pub use kv_decided_store::KVDecidedStore;

use crate::{
    messages::SignedMessage,
    types::data_types::{SeqNumber, ValidatorPk},
};

use self::pluggables::KVGetError;

pub trait DecidedStore: Clone + Send + 'static {
    /// Get the decided message for `validator_pk` at `seq_number`, if one has been saved.
    fn get_decided(
        &self,
        validator_pk: &ValidatorPk,
        seq_number: SeqNumber,
    ) -> Result<Option<SignedMessage>, DecidedStoreError>;

    /// Get the decided message with the highest sequence number saved for `validator_pk`.
    fn get_highest_decided(
        &self,
        validator_pk: &ValidatorPk,
    ) -> Result<Option<SignedMessage>, DecidedStoreError>;

    /// Save `decided` under its `(validator_pk, seq_number)` unless an entry already exists there.
    fn save_decided(
        &mut self,
        decided: &SignedMessage,
    ) -> Result<SaveDecidedOutcome, DecidedStoreError>;

    /// Get the highest decided sequence number saved for `validator_pk`.
    fn highest_decided_seq(
        &self,
        validator_pk: &ValidatorPk,
    ) -> Result<Option<SeqNumber>, DecidedStoreError> {
        Ok(self
            .get_highest_decided(validator_pk)?
            .map(|decided| decided.message.seq_number))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveDecidedOutcome {
    Saved,
    AlreadyExists,
}

#[derive(Debug)]
pub enum DecidedStoreError {
    /// The underlying key-value store returned bytes that could not be read.
    KVGetError(KVGetError),
    /// The store could not be reached. Returned by user-provided implementations.
    Unavailable(String),
}

impl From<KVGetError> for DecidedStoreError {
    fn from(value: KVGetError) -> Self {
        DecidedStoreError::KVGetError(value)
    }
}
