/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that an [`Instance`] runs on, and the handle that its controller keeps.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, RecvTimeoutError, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use crate::{
    decided_store::DecidedStore,
    events::{Event, StopInstanceEvent},
    messages::SignedMessage,
    networking::Network,
    types::data_types::{Lambda, Round, SeqNumber},
};

use super::implementation::Instance;

/// Longest time the instance thread blocks waiting for a message before checking its flags again.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(50);

/// Flags that the instance thread and its [`InstanceHandle`] both read.
pub(crate) struct InstanceShared {
    stopped: AtomicBool,
    decided: AtomicBool,
    round: AtomicU64,
}

impl InstanceShared {
    pub(crate) fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            decided: AtomicBool::new(false),
            round: AtomicU64::new(Round::first().int()),
        }
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn set_decided(&self) {
        self.decided.store(true, Ordering::SeqCst)
    }

    pub(crate) fn is_decided(&self) -> bool {
        self.decided.load(Ordering::SeqCst)
    }

    pub(crate) fn set_round(&self, round: Round) {
        self.round.store(round.int(), Ordering::SeqCst)
    }

    pub(crate) fn round(&self) -> Round {
        Round::new(self.round.load(Ordering::SeqCst))
    }
}

/// A running (or finished) consensus instance, as seen from its controller.
///
/// Dropping the handle stops the instance.
pub struct InstanceHandle {
    lambda: Lambda,
    seq_number: SeqNumber,
    inbox: Sender<SignedMessage>,
    shared: Arc<InstanceShared>,
    thread: Option<JoinHandle<()>>,
}

impl InstanceHandle {
    pub fn lambda(&self) -> &Lambda {
        &self.lambda
    }

    pub fn seq_number(&self) -> SeqNumber {
        self.seq_number
    }

    /// The round the instance is currently in.
    pub fn round(&self) -> Round {
        self.shared.round()
    }

    pub fn is_decided(&self) -> bool {
        self.shared.is_decided()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Whether the instance still takes part in consensus, i.e., it has neither decided nor been stopped.
    pub fn is_running(&self) -> bool {
        !self.is_decided() && !self.is_stopped()
    }

    /// Stop the instance. After this returns, the instance does not send any more messages. Calling
    /// `stop` more than once has no further effect.
    pub fn stop(&mut self) {
        self.shared.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!(
                    "Instance thread for {:?} seq {} panicked",
                    self.lambda,
                    self.seq_number
                );
            }
        }
    }

    /// Hand `msg` to the instance. Messages delivered after the instance has exited are dropped.
    pub(crate) fn deliver(&self, msg: SignedMessage) {
        let _ = self.inbox.send(msg);
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        self.stop()
    }
}

/// Start `instance` on its own thread, and get a handle to it.
pub(crate) fn start_instance_thread<N: Network + 'static, S: DecidedStore>(
    mut instance: Instance<N, S>,
    shared: Arc<InstanceShared>,
    event_publisher: Option<Sender<Event>>,
) -> InstanceHandle {
    let (inbox, messages) = mpsc::channel::<SignedMessage>();
    let lambda = instance.state().lambda.clone();
    let seq_number = instance.state().seq_number;

    let thread = thread::spawn(move || {
        instance.start();
        loop {
            if instance.is_stopped() {
                Event::StopInstance(StopInstanceEvent {
                    timestamp: SystemTime::now(),
                    lambda: instance.state().lambda.clone(),
                    seq_number: instance.state().seq_number,
                    round: instance.state().round,
                })
                .publish(&event_publisher);
                return;
            }
            if instance.is_decided() {
                return;
            }

            let wait = instance
                .next_deadline()
                .map_or(MAX_IDLE_WAIT, |deadline| {
                    deadline.saturating_duration_since(Instant::now())
                })
                .min(MAX_IDLE_WAIT);

            match messages.recv_timeout(wait) {
                Ok(msg) => instance.process_message(msg),
                Err(RecvTimeoutError::Timeout) => (),
                // The handle is gone, so the instance was stopped.
                Err(RecvTimeoutError::Disconnected) => instance.stop(),
            }
            instance.tick();
        }
    });

    InstanceHandle {
        lambda,
        seq_number,
        inbox,
        shared,
        thread: Some(thread),
    }
}
