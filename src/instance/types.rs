/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types specific to the consensus instance.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use crate::{
    messages::SignedMessage,
    types::data_types::{Lambda, NodeID, Round, SeqNumber, ValidatorPk, Value},
};

/// Where an instance is in the current round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Created, but [`start`](super::implementation::Instance::start) has not been called.
    NotStarted,
    /// Waiting for the leader's pre-prepare.
    PrePrepare,
    /// Accepted a pre-prepare and broadcasted a prepare.
    Prepare,
    /// Saw a quorum of prepares and broadcasted a commit.
    Commit,
    /// Moved to a new round and broadcasted a round-change. Waiting for the new round's pre-prepare.
    RoundChange,
    /// Saw a quorum of commits and saved the decided message.
    Decided,
}

/// Timing and threshold parameters of a consensus instance.
///
/// ## Round timeouts
///
/// The timeout of round `r` is `round_change_duration * 2^(r - 1)`, capped at
/// `max_round_change_duration`. Timeouts that grow with the round let nodes whose rounds drifted
/// apart eventually spend long enough in the same round to decide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsensusParams {
    pub round_change_duration: Duration,
    pub max_round_change_duration: Duration,
    /// How long the leader of the first round waits before sending its pre-prepare, giving the other
    /// nodes time to start the same instance.
    pub leader_pre_prepare_delay: Duration,
    /// Overrides the quorum size computed by the [`LeaderPolicy`](crate::leader_policy::LeaderPolicy).
    pub quorum_size: Option<usize>,
}

impl ConsensusParams {
    pub fn round_timeout(&self, round: Round) -> Duration {
        let doublings = round.int().saturating_sub(1).min(31) as u32;
        self.round_change_duration
            .checked_mul(1 << doublings)
            .unwrap_or(self.max_round_change_duration)
            .min(self.max_round_change_duration)
    }
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            round_change_duration: Duration::from_secs(3),
            max_round_change_duration: Duration::from_secs(60),
            leader_pre_prepare_delay: Duration::from_secs(1),
            quorum_size: None,
        }
    }
}

/// Decides whether a proposed value may be prepared. Checked on every pre-prepare before the local node
/// sends its prepare.
pub trait ValueValidator: Send + Sync {
    fn is_valid(&self, lambda: &Lambda, value: &Value) -> bool;
}

/// A [`ValueValidator`] that accepts every value.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllValues;

impl ValueValidator for AcceptAllValues {
    fn is_valid(&self, _: &Lambda, _: &Value) -> bool {
        true
    }
}

/// Messages of one type received in an instance, grouped by round and keyed by signer.
///
/// A signer's later message for a round replaces its earlier one, so a signer is never counted twice
/// towards a quorum.
#[derive(Clone, Debug, Default)]
pub struct MessageTally {
    by_round: BTreeMap<Round, BTreeMap<NodeID, SignedMessage>>,
}

impl MessageTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, signer: NodeID, msg: SignedMessage) {
        self.by_round
            .entry(msg.message.round)
            .or_default()
            .insert(signer, msg);
    }

    pub fn get(&self, round: Round, signer: &NodeID) -> Option<&SignedMessage> {
        self.by_round.get(&round).and_then(|msgs| msgs.get(signer))
    }

    pub fn contains_round(&self, round: Round) -> bool {
        self.by_round
            .get(&round)
            .is_some_and(|msgs| !msgs.is_empty())
    }

    /// Number of distinct signers that sent a message for `round`.
    pub fn count(&self, round: Round) -> usize {
        self.by_round.get(&round).map_or(0, |msgs| msgs.len())
    }

    pub fn messages(&self, round: Round) -> Vec<SignedMessage> {
        self.by_round
            .get(&round)
            .map(|msgs| msgs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// If at least `quorum_size` signers sent a message for `round` with the same value, get that value
    /// and those messages.
    pub fn quorum_for_value(
        &self,
        round: Round,
        quorum_size: usize,
    ) -> Option<(Value, Vec<SignedMessage>)> {
        let msgs = self.by_round.get(&round)?;
        let mut by_value: HashMap<&Value, Vec<&SignedMessage>> = HashMap::new();
        for msg in msgs.values() {
            by_value.entry(&msg.message.value).or_default().push(msg);
        }
        by_value
            .into_iter()
            .find(|(_, msgs)| msgs.len() >= quorum_size)
            .map(|(value, msgs)| (value.clone(), msgs.into_iter().cloned().collect()))
    }

    /// Get the highest round above `current` such that at least `support` distinct signers sent a message
    /// for that round or a higher one.
    pub fn round_with_support_above(&self, current: Round, support: usize) -> Option<Round> {
        let mut highest_per_signer: BTreeMap<NodeID, Round> = BTreeMap::new();
        for (round, msgs) in self.by_round.range((current + 1)..) {
            for signer in msgs.keys() {
                highest_per_signer.insert(*signer, *round);
            }
        }
        if support == 0 || highest_per_signer.len() < support {
            return None;
        }
        let mut rounds: Vec<Round> = highest_per_signer.into_values().collect();
        rounds.sort_unstable_by(|a, b| b.cmp(a));
        Some(rounds[support - 1])
    }

    /// Forget every round lower than `round`.
    pub(crate) fn prune_below(&mut self, round: Round) {
        self.by_round = self.by_round.split_off(&round);
    }
}

/// The state of one consensus instance.
#[derive(Clone, Debug)]
pub struct InstanceState {
    pub lambda: Lambda,
    pub seq_number: SeqNumber,
    pub validator_pk: ValidatorPk,
    pub round: Round,
    pub stage: Stage,
    /// The round and value of the most recent prepare quorum this node saw.
    pub prepared: Option<(Round, Value)>,
    pub decided: Option<SignedMessage>,
    pub pre_prepares: MessageTally,
    pub prepares: MessageTally,
    pub commits: MessageTally,
    pub round_changes: MessageTally,
}

impl InstanceState {
    pub fn new(lambda: Lambda, seq_number: SeqNumber, validator_pk: ValidatorPk) -> Self {
        Self {
            lambda,
            seq_number,
            validator_pk,
            round: Round::first(),
            stage: Stage::NotStarted,
            prepared: None,
            decided: None,
            pre_prepares: MessageTally::new(),
            prepares: MessageTally::new(),
            commits: MessageTally::new(),
            round_changes: MessageTally::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    use super::*;
    use crate::messages::{Message, MessageType};

    fn prepare(round: u64, value: &[u8], signer: u64, key: &SigningKey) -> SignedMessage {
        SignedMessage::sign(
            Message::new(
                MessageType::Prepare,
                Round::new(round),
                Lambda::new(b"l".to_vec()),
                SeqNumber::first(),
                ValidatorPk::new(vec![1]),
                Value::new(value.to_vec()),
            ),
            NodeID::new(signer),
            key,
        )
    }

    #[test]
    fn later_message_from_same_signer_overwrites() {
        let key = SigningKey::generate(&mut OsRng);
        let mut tally = MessageTally::new();
        tally.add(NodeID::new(0), prepare(1, b"a", 0, &key));
        tally.add(NodeID::new(0), prepare(1, b"a", 0, &key));
        tally.add(NodeID::new(0), prepare(1, b"b", 0, &key));
        assert_eq!(tally.count(Round::new(1)), 1);
        assert_eq!(
            tally.get(Round::new(1), &NodeID::new(0)).unwrap().message.value,
            Value::new(b"b".to_vec())
        );
    }

    #[test]
    fn quorum_requires_matching_values() {
        let key = SigningKey::generate(&mut OsRng);
        let mut tally = MessageTally::new();
        tally.add(NodeID::new(0), prepare(1, b"a", 0, &key));
        tally.add(NodeID::new(1), prepare(1, b"a", 1, &key));
        tally.add(NodeID::new(2), prepare(1, b"b", 2, &key));
        assert!(tally.quorum_for_value(Round::new(1), 3).is_none());

        tally.add(NodeID::new(3), prepare(1, b"a", 3, &key));
        let (value, msgs) = tally.quorum_for_value(Round::new(1), 3).unwrap();
        assert_eq!(value, Value::new(b"a".to_vec()));
        assert_eq!(msgs.len(), 3);
        assert!(tally.quorum_for_value(Round::new(2), 1).is_none());
    }

    #[test]
    fn support_above_current_round() {
        let key = SigningKey::generate(&mut OsRng);
        let mut tally = MessageTally::new();
        tally.add(NodeID::new(0), prepare(3, b"", 0, &key));
        tally.add(NodeID::new(1), prepare(5, b"", 1, &key));
        tally.add(NodeID::new(2), prepare(1, b"", 2, &key));

        assert_eq!(tally.round_with_support_above(Round::new(1), 2), Some(Round::new(3)));
        assert_eq!(tally.round_with_support_above(Round::new(1), 1), Some(Round::new(5)));
        assert_eq!(tally.round_with_support_above(Round::new(3), 2), None);

        tally.prune_below(Round::new(3));
        assert!(!tally.contains_round(Round::new(1)));
        assert!(tally.contains_round(Round::new(3)));
    }

    #[test]
    fn round_timeouts_grow_and_cap() {
        let params = ConsensusParams {
            round_change_duration: Duration::from_millis(100),
            max_round_change_duration: Duration::from_millis(700),
            leader_pre_prepare_delay: Duration::ZERO,
            quorum_size: None,
        };
        assert_eq!(params.round_timeout(Round::new(1)), Duration::from_millis(100));
        assert_eq!(params.round_timeout(Round::new(2)), Duration::from_millis(200));
        assert_eq!(params.round_timeout(Round::new(3)), Duration::from_millis(400));
        assert_eq!(params.round_timeout(Round::new(4)), Duration::from_millis(700));
        assert_eq!(params.round_timeout(Round::new(1000)), Duration::from_millis(700));
    }
}
