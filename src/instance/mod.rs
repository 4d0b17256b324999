/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! One run of the IBFT protocol that decides a single value for a `(Lambda, SeqNumber)`.
//!
//! ## Rounds and stages
//!
//! An instance starts in [round 1](crate::types::data_types::Round::first). In every round:
//! 1. The round's leader, chosen by the [`LeaderPolicy`](crate::leader_policy::LeaderPolicy), broadcasts
//!    a **pre-prepare** carrying a value.
//! 2. Every node that accepts the pre-prepare broadcasts a **prepare** for the same value.
//! 3. On a quorum of matching prepares, a node is *prepared* on that value and broadcasts a **commit**.
//! 4. On a quorum of matching commits, a node aggregates the commits into a **decided** message, saves
//!    it in the [`DecidedStore`](crate::decided_store::DecidedStore), and broadcasts it.
//!
//! ## Round changes
//!
//! If a round does not decide before its timer expires, nodes broadcast a **round-change** for the next
//! round, reporting the value they are prepared on (if any) together with the prepares that justify it.
//! The round timer doubles with every round, up to a maximum.
//!
//! The leader of a round above 1 waits for a quorum of round-changes before proposing. If any of them
//! reports a prepared value, the leader must re-propose the one with the highest prepared round, and it
//! attaches the round-changes to its pre-prepare so that other nodes can check this.
//!
//! A node that sees round-changes from f + 1 nodes for rounds above its own moves to the highest round
//! that all f + 1 of them have reached, without waiting for its own timer.

pub mod implementation;

pub mod runner;

pub mod types;

pub use implementation::InstanceOptions;
pub use runner::InstanceHandle;
pub use types::{AcceptAllValues, ConsensusParams, InstanceState, MessageTally, Stage, ValueValidator};
