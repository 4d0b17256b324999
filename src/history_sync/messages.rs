/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages that are sent between nodes as part of the history sync protocol.
//!
//! Every request and response names the validator it is about, so that a node running history syncs
//! for several validators at once can route each response to the run that asked for it.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    messages::SignedMessage,
    types::data_types::{SeqNumber, ValidatorPk},
};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum SyncMessage {
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum SyncRequest {
    /// Ask for the highest decided message the peer has for `validator_pk`.
    GetHighest { validator_pk: ValidatorPk },

    /// Ask for the decided messages for `validator_pk` with sequence numbers in `start..=end`.
    GetRange {
        validator_pk: ValidatorPk,
        start: SeqNumber,
        end: SeqNumber,
    },
}

impl SyncRequest {
    pub fn validator_pk(&self) -> &ValidatorPk {
        match self {
            SyncRequest::GetHighest { validator_pk } => validator_pk,
            SyncRequest::GetRange { validator_pk, .. } => validator_pk,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum SyncResponse {
    /// The responder's highest decided message for `validator_pk`, if it has any.
    Highest {
        validator_pk: ValidatorPk,
        decided: Option<SignedMessage>,
    },

    /// The decided messages the responder has in the range requested from `start`, in increasing
    /// sequence order. The responder stops at the first sequence number it does not have.
    Range {
        validator_pk: ValidatorPk,
        start: SeqNumber,
        decided: Vec<SignedMessage>,
    },
}

impl SyncResponse {
    pub fn validator_pk(&self) -> &ValidatorPk {
        match self {
            SyncResponse::Highest { validator_pk, .. } => validator_pk,
            SyncResponse::Range { validator_pk, .. } => validator_pk,
        }
    }
}
