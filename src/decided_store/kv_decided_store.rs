/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A [`DecidedStore`] on top of a user-provided [`KVStore`].

use std::sync::{Arc, Mutex, PoisonError};

use borsh::BorshSerialize;

use crate::{
    logging::first_seven_base64_chars,
    messages::SignedMessage,
    types::data_types::{SeqNumber, ValidatorPk},
};

use super::{
    pluggables::{KVGet, KVGetError, KVStore, Key, WriteBatch},
    variables::{decided_key, highest_decided_key},
    DecidedStore, DecidedStoreError, SaveDecidedOutcome,
};

/// Stores decided messages in a [`KVStore`] using the layout described in
/// [`variables`](super::variables).
///
/// Clones share the same underlying `KVStore` (as long as the `KVStore` itself shares state between
/// clones) and the same insert lock, so the compare-and-insert in
/// [`save_decided`](DecidedStore::save_decided) is atomic across every clone in the process.
#[derive(Clone)]
pub struct KVDecidedStore<K: KVStore> {
    kv_store: K,
    insert_lock: Arc<Mutex<()>>,
}

impl<K: KVStore> KVDecidedStore<K> {
    pub fn new(kv_store: K) -> Self {
        Self {
            kv_store,
            insert_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn kv_store(&self) -> &K {
        &self.kv_store
    }
}

impl<K: KVStore> DecidedStore for KVDecidedStore<K> {
    fn get_decided(
        &self,
        validator_pk: &ValidatorPk,
        seq_number: SeqNumber,
    ) -> Result<Option<SignedMessage>, DecidedStoreError> {
        Ok(self.kv_store.decided(validator_pk, seq_number)?)
    }

    fn get_highest_decided(
        &self,
        validator_pk: &ValidatorPk,
    ) -> Result<Option<SignedMessage>, DecidedStoreError> {
        let seq_number = match self.kv_store.highest_decided_seq(validator_pk)? {
            Some(seq_number) => seq_number,
            None => return Ok(None),
        };

        match self.kv_store.decided(validator_pk, seq_number)? {
            Some(decided) => Ok(Some(decided)),
            None => Err(KVGetError::ValueExpectedButNotFound {
                key: Key::Decided {
                    validator_pk: validator_pk.clone(),
                    seq_number,
                },
            }
            .into()),
        }
    }

    fn highest_decided_seq(
        &self,
        validator_pk: &ValidatorPk,
    ) -> Result<Option<SeqNumber>, DecidedStoreError> {
        Ok(self.kv_store.highest_decided_seq(validator_pk)?)
    }

    fn save_decided(
        &mut self,
        decided: &SignedMessage,
    ) -> Result<SaveDecidedOutcome, DecidedStoreError> {
        let _guard = self
            .insert_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let validator_pk = &decided.message.validator_pk;
        let seq_number = decided.message.seq_number;

        if let Some(existing) = self.kv_store.decided(validator_pk, seq_number)? {
            if existing.message.value != decided.message.value {
                log::warn!(
                    "Refusing to overwrite decided value {} for validator {} at seq {} with {}",
                    existing.message.value.hash(),
                    first_seven_base64_chars(validator_pk.bytes()),
                    seq_number,
                    decided.message.value.hash(),
                );
            }
            return Ok(SaveDecidedOutcome::AlreadyExists);
        }

        let mut wb = K::WriteBatch::new();
        wb.set(
            &decided_key(validator_pk, seq_number),
            &decided.try_to_vec().unwrap(),
        );
        let highest = self.kv_store.highest_decided_seq(validator_pk)?;
        if highest.map_or(true, |highest| seq_number > highest) {
            wb.set(
                &highest_decided_key(validator_pk),
                &seq_number.try_to_vec().unwrap(),
            );
        }
        self.kv_store.write(wb);

        Ok(SaveDecidedOutcome::Saved)
    }
}
