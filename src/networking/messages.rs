/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumeration of every message variant sent over the [`Network`](super::Network).
//!
//! Messages are serialized with Borsh. Network providers that need bytes on the wire can call
//! `try_to_vec` on a `NetworkMessage` and `NetworkMessage::try_from_slice` on the receiving side.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    history_sync::messages::{SyncMessage, SyncRequest, SyncResponse},
    messages::SignedMessage,
};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum NetworkMessage {
    /// Pre-prepare, prepare, commit, round-change and decided messages.
    ConsensusMessage(SignedMessage),

    /// See: [`SyncMessage`].
    SyncMessage(SyncMessage),
}

impl From<SignedMessage> for NetworkMessage {
    fn from(value: SignedMessage) -> Self {
        NetworkMessage::ConsensusMessage(value)
    }
}

impl From<SyncRequest> for NetworkMessage {
    fn from(value: SyncRequest) -> Self {
        NetworkMessage::SyncMessage(SyncMessage::SyncRequest(value))
    }
}

impl From<SyncResponse> for NetworkMessage {
    fn from(value: SyncResponse) -> Self {
        NetworkMessage::SyncMessage(SyncMessage::SyncResponse(value))
    }
}
