/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for pluggable key-value persistence underneath a [`KVDecidedStore`](super::KVDecidedStore).

use borsh::BorshDeserialize;

use crate::{
    messages::SignedMessage,
    types::data_types::{SeqNumber, ValidatorPk},
};

use super::variables::{decided_key, highest_decided_key};

pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;

    /// Atomically apply every insertion in `wb`.
    fn write(&mut self, wb: Self::WriteBatch);
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn decided(
        &self,
        validator_pk: &ValidatorPk,
        seq_number: SeqNumber,
    ) -> Result<Option<SignedMessage>, KVGetError> {
        let key = decided_key(validator_pk, seq_number);
        match self.get(&key) {
            None => Ok(None),
            Some(bytes) => SignedMessage::deserialize(&mut bytes.as_slice())
                .map(Some)
                .map_err(|err| KVGetError::DeserializeValueError {
                    key: Key::Decided {
                        validator_pk: validator_pk.clone(),
                        seq_number,
                    },
                    source: err,
                }),
        }
    }

    fn highest_decided_seq(
        &self,
        validator_pk: &ValidatorPk,
    ) -> Result<Option<SeqNumber>, KVGetError> {
        match self.get(&highest_decided_key(validator_pk)) {
            None => Ok(None),
            Some(bytes) => SeqNumber::deserialize(&mut bytes.as_slice())
                .map(Some)
                .map_err(|err| KVGetError::DeserializeValueError {
                    key: Key::HighestDecided {
                        validator_pk: validator_pk.clone(),
                    },
                    source: err,
                }),
        }
    }
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
}

#[derive(Debug)]
pub enum KVGetError {
    DeserializeValueError { key: Key, source: std::io::Error },
    ValueExpectedButNotFound { key: Key },
}

#[derive(Debug)]
pub enum Key {
    Decided {
        validator_pk: ValidatorPk,
        seq_number: SeqNumber,
    },
    HighestDecided {
        validator_pk: ValidatorPk,
    },
}
