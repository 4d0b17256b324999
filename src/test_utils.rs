/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! In-memory stand-ins for the pluggable parts of a node, shared by unit tests.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use rand_core::OsRng;

use crate::{
    decided_store::{DecidedStore, DecidedStoreError, SaveDecidedOutcome},
    messages::{Message, MessageType, SignedMessage},
    networking::{Network, NetworkMessage},
    types::{
        committee::{Committee, Node},
        crypto_primitives::SigningKey,
        data_types::{Lambda, NodeID, Round, SeqNumber, ValidatorPk, Value},
    },
};

pub(crate) fn committee_of(n: usize) -> (Vec<SigningKey>, Committee) {
    let keys: Vec<SigningKey> = (0..n).map(|_| SigningKey::generate(&mut OsRng)).collect();
    let committee = keys
        .iter()
        .enumerate()
        .map(|(i, key)| Node::new(NodeID::new(i as u64), key.verifying_key()))
        .collect();
    (keys, committee)
}

pub(crate) fn validator_pk() -> ValidatorPk {
    ValidatorPk::new(vec![0xAB; 48])
}

/// A decided message for `seq_number`, signed by the committee members at `signers`.
pub(crate) fn decided_message(
    keys: &[SigningKey],
    signers: &[usize],
    lambda: &Lambda,
    seq_number: SeqNumber,
    value: &Value,
) -> SignedMessage {
    let message = Message::new(
        MessageType::Decided,
        Round::first(),
        lambda.clone(),
        seq_number,
        validator_pk(),
        value.clone(),
    );
    let signed: Vec<SignedMessage> = signers
        .iter()
        .map(|i| SignedMessage::sign(message.clone(), NodeID::new(*i as u64), &keys[*i]))
        .collect();
    SignedMessage::aggregate(message, &signed)
}

/// A [`DecidedStore`] on a shared map, which can be told to fail its next few saves.
#[derive(Clone, Default)]
pub(crate) struct MemDecidedStore {
    entries: Arc<Mutex<BTreeMap<(ValidatorPk, SeqNumber), SignedMessage>>>,
    failing_saves: Arc<AtomicUsize>,
}

impl MemDecidedStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl DecidedStore for MemDecidedStore {
    fn get_decided(
        &self,
        validator_pk: &ValidatorPk,
        seq_number: SeqNumber,
    ) -> Result<Option<SignedMessage>, DecidedStoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(&(validator_pk.clone(), seq_number))
            .cloned())
    }

    fn get_highest_decided(
        &self,
        validator_pk: &ValidatorPk,
    ) -> Result<Option<SignedMessage>, DecidedStoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|((pk, _), _)| pk == validator_pk)
            .map(|(_, decided)| decided.clone())
            .last())
    }

    fn save_decided(
        &mut self,
        decided: &SignedMessage,
    ) -> Result<SaveDecidedOutcome, DecidedStoreError> {
        let failing = self.failing_saves.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_saves.store(failing - 1, Ordering::SeqCst);
            return Err(DecidedStoreError::Unavailable(String::from("disk full")));
        }

        let key = (
            decided.message.validator_pk.clone(),
            decided.message.seq_number,
        );
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&key) {
            return Ok(SaveDecidedOutcome::AlreadyExists);
        }
        entries.insert(key, decided.clone());
        Ok(SaveDecidedOutcome::Saved)
    }
}

/// A [`Network`] that delivers nothing and remembers every message sent through it.
#[derive(Clone, Default)]
pub(crate) struct RecordingNetwork {
    sent: Arc<Mutex<Vec<(Option<NodeID>, NetworkMessage)>>>,
}

impl RecordingNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The consensus messages broadcasted since the last call.
    pub(crate) fn take_broadcasts(&self) -> Vec<SignedMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
            .into_iter()
            .filter_map(|(peer, msg)| match (peer, msg) {
                (None, NetworkMessage::ConsensusMessage(msg)) => Some(msg),
                _ => None,
            })
            .collect()
    }
}

impl Network for RecordingNetwork {
    fn init_committee(&mut self, _: Committee) {}

    fn broadcast(&mut self, message: NetworkMessage) {
        self.sent.lock().unwrap().push((None, message))
    }

    fn send(&mut self, peer: NodeID, message: NetworkMessage) {
        self.sent.lock().unwrap().push((Some(peer), message))
    }

    fn recv(&mut self) -> Option<(NodeID, NetworkMessage)> {
        None
    }
}
