/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Events emitted by consensus instances, controllers, history sync runs, and sync request handlers.
//!
//! An event for a given action indicates that the action has been completed. Library users can
//! register handlers for each event type through the `on_*` setters of
//! [`NodeSpec`](crate::node::NodeSpec). If logging is enabled in the node's
//! [configuration](crate::node::Configuration), every event is also printed by the loggers in
//! [`logging`](crate::logging).

use std::{
    sync::mpsc::Sender,
    time::{Duration, SystemTime},
};

use crate::{
    history_sync::messages::{SyncRequest, SyncResponse},
    messages::SignedMessage,
    types::data_types::{Lambda, NodeID, Round, SeqNumber, ValidatorPk},
};

pub enum Event {
    // Events in the lifecycle of a consensus instance.
    StartInstance(StartInstanceEvent),
    StopInstance(StopInstanceEvent),
    RoundTimeout(RoundTimeoutEvent),
    Decide(DecideEvent),
    // Events that involve broadcasting a consensus message.
    Propose(ProposeEvent),
    Prepare(PrepareEvent),
    Commit(CommitEvent),
    RoundChange(RoundChangeEvent),
    // Events that involve receiving a consensus message.
    ReceiveMessage(ReceiveMessageEvent),
    // History sync events.
    StartSync(StartSyncEvent),
    EndSync(EndSyncEvent),
    SyncFailed(SyncFailedEvent),
    ReceiveSyncRequest(ReceiveSyncRequestEvent),
    SendSyncResponse(SendSyncResponseEvent),
}

impl Event {
    /// Send `self` to the event bus, if there is one. Events published after the event bus has shut
    /// down are dropped.
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

pub struct StartInstanceEvent {
    pub timestamp: SystemTime,
    pub validator_pk: ValidatorPk,
    pub lambda: Lambda,
    pub seq_number: SeqNumber,
}

/// Published when a running instance is stopped before deciding.
pub struct StopInstanceEvent {
    pub timestamp: SystemTime,
    pub lambda: Lambda,
    pub seq_number: SeqNumber,
    pub round: Round,
}

pub struct RoundTimeoutEvent {
    pub timestamp: SystemTime,
    pub lambda: Lambda,
    pub seq_number: SeqNumber,
    pub round: Round,
    pub timeout: Duration,
}

/// Published after the decided message has been saved in the decided store.
pub struct DecideEvent {
    pub timestamp: SystemTime,
    pub decided: SignedMessage,
}

pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub pre_prepare: SignedMessage,
}

pub struct PrepareEvent {
    pub timestamp: SystemTime,
    pub prepare: SignedMessage,
}

pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub commit: SignedMessage,
}

pub struct RoundChangeEvent {
    pub timestamp: SystemTime,
    pub round_change: SignedMessage,
}

/// Published when a consensus message passes validation and is recorded by a running instance.
pub struct ReceiveMessageEvent {
    pub timestamp: SystemTime,
    pub signer: NodeID,
    pub msg: SignedMessage,
}

pub struct StartSyncEvent {
    pub timestamp: SystemTime,
    pub validator_pk: ValidatorPk,
    pub trigger_seq_number: SeqNumber,
}

pub struct EndSyncEvent {
    pub timestamp: SystemTime,
    pub validator_pk: ValidatorPk,
    pub highest_seq_number: Option<SeqNumber>,
    pub entries_saved: u64,
}

pub struct SyncFailedEvent {
    pub timestamp: SystemTime,
    pub validator_pk: ValidatorPk,
    pub reason: String,
}

pub struct ReceiveSyncRequestEvent {
    pub timestamp: SystemTime,
    pub peer: NodeID,
    pub request: SyncRequest,
}

pub struct SendSyncResponseEvent {
    pub timestamp: SystemTime,
    pub peer: NodeID,
    pub response: SyncResponse,
}
