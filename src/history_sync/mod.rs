/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The history sync protocol, which lets a node that fell behind fetch the decided messages it missed.
//!
//! A node falls behind when it misses the messages of instances that the rest of the committee went on
//! to decide. It notices this when it receives a valid decided message
//! for a sequence number above the one it is working on, at which point its
//! [`Controller`](crate::controller::Controller) starts a sync run.
//!
//! The protocol has two sides:
//! - The [client](client) discovers how far the committee has got and saves the missing decided messages
//!   after checking each one.
//! - The [server](server) answers the client's requests from the local decided store.
//!
//! The messages exchanged are defined in [`messages`].

pub mod client;

pub mod messages;

pub(crate) mod server;
