/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use crate::types::{committee::Committee, data_types::NodeID};

use super::messages::NetworkMessage;

pub trait Network: Clone + Send {
    /// Inform the network provider of the committee on wake-up.
    fn init_committee(&mut self, committee: Committee);

    /// Send a message to all peers without blocking. Whether the sender also receives the message is
    /// up to the implementation; consensus handles both.
    fn broadcast(&mut self, message: NetworkMessage);

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: NodeID, message: NetworkMessage);

    /// Receive a message from any peer. Returns immediately with a None if no message is available now.
    fn recv(&mut self) -> Option<(NodeID, NetworkMessage)>;
}
