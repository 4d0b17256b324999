/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer (P2P) networking.
//!
//! Library users provide an implementation of the [`Network`] trait. The crate sends through it using
//! a [`SenderHandle`](sending::SenderHandle), and a poller thread drains it, splitting
//! incoming messages into consensus messages, sync requests, and sync responses.
//!
//! Delivery may be lossy, duplicated, and out of order. Everything above this module tolerates that.

pub mod network;

pub mod messages;

pub(crate) mod receiving;

pub(crate) mod sending;

pub use messages::NetworkMessage;
pub use network::Network;
