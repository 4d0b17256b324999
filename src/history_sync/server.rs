/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Answers the history sync requests of lagging peers.
//!
//! A [`SyncRequestHandler`] reads from the local [`DecidedStore`] and nothing else. It never touches the
//! state of a running instance or of a controller, so the node runs each request on its own thread
//! without any coordination.
//!
//! - [`GetHighest`](SyncRequest::GetHighest) is answered with the highest decided message on record for
//!   the validator, or nothing if there is none.
//! - [`GetRange`](SyncRequest::GetRange) is answered with the decided messages in the requested range,
//!   in increasing sequence order. At most [`SyncRequestLimit`] entries are returned, and the response
//!   ends at the first sequence number that has no entry, so it never has gaps.
//!
//! The client side of the protocol is explained [here](super::client).

use std::{sync::mpsc::Sender, time::SystemTime};

use crate::{
    decided_store::{DecidedStore, DecidedStoreError},
    events::{Event, ReceiveSyncRequestEvent, SendSyncResponseEvent},
    messages::SignedMessage,
    networking::{sending::SenderHandle, Network},
    types::data_types::{NodeID, SeqNumber, SyncRequestLimit, ValidatorPk},
};

use super::messages::{SyncRequest, SyncResponse};

pub(crate) struct SyncRequestHandler<N: Network, S: DecidedStore> {
    request_limit: SyncRequestLimit,
    decided_store: S,
    sender: SenderHandle<N>,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network, S: DecidedStore> SyncRequestHandler<N, S> {
    pub(crate) fn new(
        request_limit: SyncRequestLimit,
        decided_store: S,
        network: N,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            request_limit,
            decided_store,
            sender: SenderHandle::new(network),
            event_publisher,
        }
    }

    /// Answer `request` from `origin`. If the local store cannot be read, no response is sent and the
    /// peer's request times out.
    pub(crate) fn handle(&mut self, origin: NodeID, request: SyncRequest) {
        Event::ReceiveSyncRequest(ReceiveSyncRequestEvent {
            timestamp: SystemTime::now(),
            peer: origin,
            request: request.clone(),
        })
        .publish(&self.event_publisher);

        let response = match self.response_to(&request) {
            Ok(response) => response,
            Err(err) => {
                log::error!(
                    "Could not answer sync request from node {} for validator {:?}: {:?}",
                    origin,
                    request.validator_pk(),
                    err
                );
                return;
            }
        };

        self.sender.send(origin, response.clone());
        Event::SendSyncResponse(SendSyncResponseEvent {
            timestamp: SystemTime::now(),
            peer: origin,
            response,
        })
        .publish(&self.event_publisher);
    }

    fn response_to(&self, request: &SyncRequest) -> Result<SyncResponse, DecidedStoreError> {
        match request {
            SyncRequest::GetHighest { validator_pk } => Ok(SyncResponse::Highest {
                validator_pk: validator_pk.clone(),
                decided: self.decided_store.get_highest_decided(validator_pk)?,
            }),
            SyncRequest::GetRange {
                validator_pk,
                start,
                end,
            } => Ok(SyncResponse::Range {
                validator_pk: validator_pk.clone(),
                start: *start,
                decided: self.decided_range(validator_pk, *start, *end)?,
            }),
        }
    }

    fn decided_range(
        &self,
        validator_pk: &ValidatorPk,
        start: SeqNumber,
        end: SeqNumber,
    ) -> Result<Vec<SignedMessage>, DecidedStoreError> {
        let mut decided = Vec::new();
        let mut seq_number = start;
        while seq_number <= end && decided.len() < self.request_limit.int() as usize {
            match self.decided_store.get_decided(validator_pk, seq_number)? {
                Some(entry) => decided.push(entry),
                None => break,
            }
            seq_number = seq_number.next();
        }
        Ok(decided)
    }
}
