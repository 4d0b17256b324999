/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for receiving messages from the P2P network.

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use crate::{
    history_sync::messages::{SyncMessage, SyncRequest, SyncResponse},
    messages::SignedMessage,
    types::data_types::{NodeID, ValidatorPk},
};

use super::{messages::NetworkMessage, network::Network};

/// Spawn the poller thread, which polls the [`Network`] for messages and distributes them.
///
/// The kinds of messages that the poller distributes are:
/// 1. Consensus messages (processed by the node's dispatcher thread),
/// 2. Sync requests (processed by [`SyncRequestHandler`][crate::history_sync::server::SyncRequestHandler]s),
///    and
/// 3. Sync responses, which are handed to `sync_responses` for delivery to the
///    [`HistorySync`][crate::history_sync::client::HistorySync] run that asked for them.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    sync_responses: SyncResponseRouter,
    shutdown_signal: Receiver<()>,
) -> (
    JoinHandle<()>,
    Receiver<(NodeID, SignedMessage)>,
    Receiver<(NodeID, SyncRequest)>,
) {
    let (to_consensus_msg_receiver, consensus_msg_receiver) = mpsc::channel();
    let (to_sync_request_receiver, sync_request_receiver) = mpsc::channel();

    let poller_thread = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        if let Some((origin, msg)) = network.recv() {
            match msg {
                NetworkMessage::ConsensusMessage(c_msg) => {
                    let _ = to_consensus_msg_receiver.send((origin, c_msg));
                }
                NetworkMessage::SyncMessage(s_msg) => match s_msg {
                    SyncMessage::SyncRequest(s_req) => {
                        let _ = to_sync_request_receiver.send((origin, s_req));
                    }
                    SyncMessage::SyncResponse(s_res) => sync_responses.route(origin, s_res),
                },
            }
        } else {
            thread::yield_now()
        }
    });
    (poller_thread, consensus_msg_receiver, sync_request_receiver)
}

/// Routes [`SyncResponse`]s to the history sync run of the validator they are about.
///
/// A history sync run [registers](Self::register) its validator before sending requests and gets back a
/// [`SyncClientStub`]. Responses about validators with no registered run are unsolicited and are
/// dropped.
#[derive(Clone, Default)]
pub(crate) struct SyncResponseRouter {
    routes: Arc<Mutex<HashMap<ValidatorPk, (u64, Sender<(NodeID, SyncResponse)>)>>>,
    next_registration: Arc<AtomicU64>,
}

impl SyncResponseRouter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start receiving responses about `validator_pk`. Replaces any earlier registration for the same
    /// validator, which then stops receiving.
    pub(crate) fn register(&self, validator_pk: ValidatorPk) -> SyncClientStub {
        let (sender, responses) = mpsc::channel();
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(validator_pk.clone(), (registration, sender));
        SyncClientStub {
            validator_pk,
            registration,
            responses,
            router: self.clone(),
        }
    }

    pub(crate) fn route(&self, origin: NodeID, response: SyncResponse) {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        match routes.get(response.validator_pk()) {
            Some((_, route)) => {
                let _ = route.send((origin, response));
            }
            None => log::debug!("Dropping unsolicited sync response from node {}", origin),
        }
    }

    /// Remove the route for `validator_pk` if it still belongs to `registration`.
    fn unregister(&self, validator_pk: &ValidatorPk, registration: u64) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        if routes.get(validator_pk).map(|(current, _)| *current) == Some(registration) {
            routes.remove(validator_pk);
        }
    }
}

/// A receiving end for the [`SyncResponse`]s about one validator. Unregisters itself from its
/// [`SyncResponseRouter`] when dropped.
pub(crate) struct SyncClientStub {
    validator_pk: ValidatorPk,
    registration: u64,
    responses: Receiver<(NodeID, SyncResponse)>,
    router: SyncResponseRouter,
}

impl SyncClientStub {
    /// Throw away every response received so far, such as late answers to requests of an earlier phase.
    pub(crate) fn drain(&self) -> usize {
        let mut drained = 0;
        while self.responses.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Receive a [`SyncResponse`] from any peer, waiting until the deadline at most.
    pub(crate) fn recv_any(
        &self,
        deadline: Instant,
    ) -> Result<(NodeID, SyncResponse), SyncResponseReceiveError> {
        while Instant::now() < deadline {
            match self
                .responses
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            {
                Ok((sender, response)) => return Ok((sender, response)),
                Err(RecvTimeoutError::Timeout) => thread::yield_now(),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SyncResponseReceiveError::Disconnected)
                }
            }
        }

        Err(SyncResponseReceiveError::Timeout)
    }
}

impl Drop for SyncClientStub {
    fn drop(&mut self) {
        self.router.unregister(&self.validator_pk, self.registration)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SyncResponseReceiveError {
    Disconnected,
    Timeout,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::data_types::SeqNumber;

    #[test]
    fn responses_are_routed_by_validator() {
        let router = SyncResponseRouter::new();
        let a = ValidatorPk::new(vec![1]);
        let b = ValidatorPk::new(vec![2]);
        let stub_a = router.register(a.clone());
        let stub_b = router.register(b.clone());

        router.route(
            NodeID::new(3),
            SyncResponse::Range {
                validator_pk: b.clone(),
                start: SeqNumber::first(),
                decided: Vec::new(),
            },
        );

        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(
            stub_a.recv_any(deadline).unwrap_err(),
            SyncResponseReceiveError::Timeout
        );
        let (origin, response) = stub_b
            .recv_any(Instant::now() + Duration::from_millis(50))
            .unwrap();
        assert_eq!(origin, NodeID::new(3));
        assert_eq!(response.validator_pk(), &b);
    }

    #[test]
    fn dropped_stub_unregisters() {
        let router = SyncResponseRouter::new();
        let a = ValidatorPk::new(vec![1]);
        drop(router.register(a.clone()));
        assert!(router.routes.lock().unwrap().get(&a).is_none());

        // A stale stub must not remove a newer registration.
        let old = router.register(a.clone());
        let _new = router.register(a.clone());
        drop(old);
        assert!(router.routes.lock().unwrap().get(&a).is_some());
    }

    #[test]
    fn drain_discards_queued_responses() {
        let router = SyncResponseRouter::new();
        let a = ValidatorPk::new(vec![1]);
        let stub = router.register(a.clone());

        for origin in 0..3 {
            router.route(
                NodeID::new(origin),
                SyncResponse::Highest {
                    validator_pk: a.clone(),
                    decided: None,
                },
            );
        }
        assert_eq!(stub.drain(), 3);
        assert_eq!(
            stub.recv_any(Instant::now() + Duration::from_millis(20))
                .unwrap_err(),
            SyncResponseReceiveError::Timeout
        );

        // Responses routed after draining are still received.
        router.route(
            NodeID::new(1),
            SyncResponse::Range {
                validator_pk: a.clone(),
                start: SeqNumber::new(4),
                decided: Vec::new(),
            },
        );
        let (origin, _) = stub
            .recv_any(Instant::now() + Duration::from_millis(50))
            .unwrap();
        assert_eq!(origin, NodeID::new(1));
    }
}
