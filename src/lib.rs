/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! An implementation of Istanbul BFT (IBFT) consensus instances, together with the decided-message
//! handling and history sync that let lagging nodes catch up.
//!
//! A fixed committee of N nodes agrees, one sequence number at a time, on an opaque value per
//! validator. Up to f = (N - 1) / 3 members may be faulty or silent. Decided values are saved in a
//! pluggable [decided store](decided_store) and served to peers that fell behind.
//!
//! The entry point is [`NodeSpec`](node::NodeSpec), which starts a [`Node`](node::Node) running one
//! [`Controller`](controller::Controller) per validator.

pub mod controller;

pub mod decided_store;

pub(crate) mod event_bus;

pub mod events;

pub mod history_sync;

pub mod instance;

pub mod leader_policy;

pub mod logging;

pub mod messages;

pub mod networking;

pub mod node;

pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;
