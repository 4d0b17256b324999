/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable leader-selection and quorum-threshold policy.
//!
//! A consensus instance asks its [`LeaderPolicy`] who the leader of each round is and how many matching
//! votes make a quorum. Every node in a committee must use the same policy, otherwise nodes will disagree
//! on who may send pre-prepares.
//!
//! Two policies are provided:
//! 1. [`RoundRobinLeader`]: rotates leadership over the committee in ascending [`NodeID`] order, keyed
//!    by a counter that increases with both the sequence number and the round.
//! 2. [`FixedLeader`]: the same node leads every round of every instance.

use crate::types::{
    committee::{default_quorum_size, Committee},
    data_types::{NodeID, Round, SeqNumber},
};

pub trait LeaderPolicy: Send + Sync {
    /// Get the node that is allowed to send the pre-prepare of `round` in the instance at `seq_number`.
    fn leader_for(&self, seq_number: SeqNumber, round: Round) -> NodeID;

    /// Get the number of matching votes, out of a committee of `committee_size`, that make a quorum.
    ///
    /// The default is `2f + 1`, which is only safe when `committee_size = 3f + 1`. For other sizes two
    /// quorums may have no member in common, so two different values could be decided for the same
    /// sequence number. Policies for such committees should return
    /// [`intersecting_quorum_size`](crate::types::committee::intersecting_quorum_size) instead.
    fn quorum_size(&self, committee_size: usize) -> usize {
        default_quorum_size(committee_size)
    }
}

/// Deterministic round-robin leader selection.
///
/// The leader of `(seq_number, round)` is the committee member at position
/// `(seq_number + round - 1) mod N` in ascending `NodeID` order. Consecutive instances therefore start
/// with different leaders, and a round change within an instance moves to the next node.
#[derive(Clone, Debug)]
pub struct RoundRobinLeader {
    leaders: Vec<NodeID>,
}

impl RoundRobinLeader {
    pub fn new(committee: &Committee) -> Self {
        assert!(!committee.is_empty(), "The committee cannot be empty!");
        Self {
            leaders: committee.ids().collect(),
        }
    }
}

impl LeaderPolicy for RoundRobinLeader {
    fn leader_for(&self, seq_number: SeqNumber, round: Round) -> NodeID {
        let counter = seq_number.int() + round.int().saturating_sub(1);
        self.leaders[(counter % self.leaders.len() as u64) as usize]
    }
}

/// A policy in which one node leads every round.
#[derive(Clone, Copy, Debug)]
pub struct FixedLeader(pub NodeID);

impl LeaderPolicy for FixedLeader {
    fn leader_for(&self, _: SeqNumber, _: Round) -> NodeID {
        self.0
    }
}

/// Tests that every member leads exactly once in every N consecutive rounds.
#[test]
fn round_robin_fairness_test() {
    use crate::types::committee::Node;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    let mut csprg = OsRng {};
    let n = 7;
    let committee: Committee = (0..n)
        .map(|i| Node::new(NodeID::new(i * 10), SigningKey::generate(&mut csprg).verifying_key()))
        .collect();
    let policy = RoundRobinLeader::new(&committee);

    let seq = SeqNumber::new(5);
    let leader_sequence: Vec<NodeID> = (1..=n)
        .map(|r| policy.leader_for(seq, Round::new(r)))
        .collect();

    committee.ids().for_each(|id| {
        assert_eq!(
            leader_sequence.iter().filter(|leader| **leader == id).count(),
            1
        )
    });

    // The next instance starts with the node after the previous instance's first leader.
    let first = policy.leader_for(seq, Round::first());
    let next = policy.leader_for(seq.next(), Round::first());
    assert_eq!(next, policy.leader_for(seq, Round::new(2)));
    assert_ne!(first, next);
    assert_eq!(policy.quorum_size(committee.len()), 5);
}
