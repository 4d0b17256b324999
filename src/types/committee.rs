/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The fixed set of nodes that run consensus together.
//!
//! A [`Committee`] is configured once when a node starts and never changes during a run. Its size `N`
//! determines the fault tolerance `f = (N - 1) / 3` (rounded down) and the default quorum size `2f + 1`.

use std::collections::{btree_map, BTreeMap};

use super::{crypto_primitives::VerifyingKey, data_types::NodeID};

/// A committee member: its identifier and the public key its messages are verified against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: NodeID,
    pub public_key: VerifyingKey,
}

impl Node {
    pub fn new(id: NodeID, public_key: VerifyingKey) -> Self {
        Self { id, public_key }
    }
}

/// Mapping from [`NodeID`] to [`Node`]. Iteration is in ascending order of `NodeID`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Committee {
    nodes: BTreeMap<NodeID, Node>,
}

impl Committee {
    /// Create an empty committee.
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    /// Add `node` to the committee. A node already present with the same id is replaced.
    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    /// Number of nodes (`N`) in the committee.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Maximum number of faulty nodes (`f`) the committee tolerates.
    pub fn fault_tolerance(&self) -> usize {
        fault_tolerance(self.len())
    }

    /// Default quorum size (`2f + 1`).
    pub fn quorum_size(&self) -> usize {
        default_quorum_size(self.len())
    }

    pub fn contains(&self, id: &NodeID) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &NodeID) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn public_key(&self, id: &NodeID) -> Option<&VerifyingKey> {
        self.nodes.get(id).map(|node| &node.public_key)
    }

    /// Identifiers of all members, in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = NodeID> + '_ {
        self.nodes.keys().copied()
    }

    pub fn nodes(&self) -> btree_map::Values<'_, NodeID, Node> {
        self.nodes.values()
    }
}

impl FromIterator<Node> for Committee {
    fn from_iter<T: IntoIterator<Item = Node>>(iter: T) -> Self {
        let mut committee = Committee::new();
        iter.into_iter().for_each(|node| committee.insert(node));
        committee
    }
}

/// `f = (n - 1) / 3`, rounded down. Zero for an empty committee.
pub fn fault_tolerance(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// `2f + 1` for a committee of size `n`.
///
/// Any two quorums of this size share a correct member only when `n = 3f + 1`. For other sizes they may
/// not: with `n = 6`, two quorums of 3 can be disjoint. Use [`intersecting_quorum_size`] for such
/// committees.
pub fn default_quorum_size(n: usize) -> usize {
    2 * fault_tolerance(n) + 1
}

/// `⌈(2n + 1) / 3⌉`, the smallest quorum size for which any two quorums in a committee of size `n`
/// overlap in more than `f` members. Equal to [`default_quorum_size`] when `n = 3f + 1`.
pub fn intersecting_quorum_size(n: usize) -> usize {
    (2 * n + 3) / 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_size_follows_fault_tolerance() {
        assert_eq!(fault_tolerance(1), 0);
        assert_eq!(default_quorum_size(1), 1);
        assert_eq!(fault_tolerance(4), 1);
        assert_eq!(default_quorum_size(4), 3);
        assert_eq!(fault_tolerance(6), 1);
        assert_eq!(default_quorum_size(6), 3);
        assert_eq!(fault_tolerance(7), 2);
        assert_eq!(default_quorum_size(7), 5);
        assert_eq!(fault_tolerance(0), 0);
    }

    #[test]
    fn intersecting_quorums_overlap_beyond_fault_tolerance() {
        for n in 1..=40 {
            let quorum = intersecting_quorum_size(n);
            assert!(quorum <= n);
            // Two quorums share at least 2q - n members, which must include a correct one.
            assert!(2 * quorum > n + fault_tolerance(n), "n = {}", n);
            if n % 3 == 1 {
                assert_eq!(quorum, default_quorum_size(n));
            }
        }
        assert_eq!(intersecting_quorum_size(6), 5);
        assert!(2 * default_quorum_size(6) <= 6);
    }
}
