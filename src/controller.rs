/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Owns the consensus instance of one validator, and decides when to abandon it to catch up.
//!
//! A [`Controller`] keeps a single slot per validator holding the handle of the instance it last
//! started, and the status of its history sync. Every operation that reads the slot, or stops and
//! replaces what is in it, does so while holding the slot's lock, so decided messages and consensus
//! messages arriving on different threads never observe a half-replaced instance. The lock is never
//! held across a network round-trip: history sync runs and sync requests are served on their own
//! threads.
//!
//! ## Processing decided messages
//!
//! A decided message from a peer is checked as follows:
//! 1. If it is not a decided message for this validator signed by a quorum, it is
//!    [invalid](DecidedMessageOutcome::Invalid).
//! 2. If the decided store already has an entry for its sequence number, it is a
//!    [duplicate](DecidedMessageOutcome::Duplicate).
//! 3. If the running instance agrees on the same lambda, the message is handed to the instance, which
//!    decides with it whatever round it is in, and no sync is started
//!    ([`LetInstancePlayOut`](DecidedMessageOutcome::LetInstancePlayOut)).
//! 4. If a history sync is already running, [nothing more is done](DecidedMessageOutcome::SyncAlreadyRunning).
//! 5. Otherwise its sequence number is compared with that of the running instance or, if none is running,
//!    the highest decided sequence number on record. If it is higher, the local node is behind: the
//!    instance is stopped and a [history sync is started](DecidedMessageOutcome::SyncStarted). If not,
//!    the message is [stale](DecidedMessageOutcome::Stale).

use std::{
    sync::{mpsc::Sender, Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    decided_store::{DecidedStore, DecidedStoreError},
    events::Event,
    history_sync::{
        client::{HistorySync, HistorySyncConfiguration, HistorySyncState},
        messages::SyncRequest,
        server::SyncRequestHandler,
    },
    instance::{
        implementation::{Instance, InstanceConfiguration, InstanceOptions},
        runner::{start_instance_thread, InstanceHandle, InstanceShared},
        types::{ConsensusParams, ValueValidator},
    },
    leader_policy::LeaderPolicy,
    messages::{MessageType, SignedMessage},
    networking::{receiving::SyncResponseRouter, Network},
    types::{
        committee::Committee,
        crypto_primitives::Keypair,
        data_types::{Lambda, NodeID, Round, SeqNumber, SyncRequestLimit, ValidatorPk, Value},
    },
};

/// Immutable parameters shared by the controllers of a node.
#[derive(Clone)]
pub(crate) struct ControllerConfiguration {
    pub(crate) me: NodeID,
    pub(crate) keypair: Keypair,
    pub(crate) committee: Committee,
    pub(crate) params: ConsensusParams,
    pub(crate) sync_request_limit: SyncRequestLimit,
    pub(crate) sync_response_timeout: Duration,
    pub(crate) sync_max_retries: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Running,
    /// The last history sync run failed. A later decided message from a peer may start another one.
    Failed,
}

/// What [`Controller::process_decided_message`] did with a decided message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecidedMessageOutcome {
    Invalid,
    Duplicate,
    LetInstancePlayOut,
    SyncAlreadyRunning,
    Stale,
    SyncStarted,
}

#[derive(Debug)]
pub enum ControllerError {
    /// An instance that has neither decided nor been stopped is still running for the validator.
    InstanceAlreadyRunning {
        lambda: Lambda,
        seq_number: SeqNumber,
    },
    /// The validator's history is being synced. Start the instance once the sync has ended.
    SyncInProgress,
    DecidedStoreError(DecidedStoreError),
}

impl From<DecidedStoreError> for ControllerError {
    fn from(value: DecidedStoreError) -> Self {
        ControllerError::DecidedStoreError(value)
    }
}

/// A snapshot of the instance in a controller's slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceStatus {
    pub lambda: Lambda,
    pub seq_number: SeqNumber,
    pub round: Round,
    pub decided: bool,
    pub stopped: bool,
}

struct ValidatorSlot {
    running: Option<InstanceHandle>,
    sync: SyncStatus,
    /// Incremented whenever a sync run is started or abandoned. A sync run only reports its result if
    /// the generation is still the one it started with.
    sync_generation: u64,
    caught_up: bool,
}

impl ValidatorSlot {
    fn running_instance(&self) -> Option<&InstanceHandle> {
        self.running.as_ref().filter(|handle| handle.is_running())
    }
}

pub struct Controller<N: Network, S: DecidedStore> {
    validator_pk: ValidatorPk,
    config: ControllerConfiguration,
    quorum_size: usize,
    slot: Arc<Mutex<ValidatorSlot>>,
    network: N,
    decided_store: S,
    leader_policy: Arc<dyn LeaderPolicy>,
    value_validator: Arc<dyn ValueValidator>,
    sync_responses: SyncResponseRouter,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network, S: DecidedStore> Clone for Controller<N, S> {
    fn clone(&self) -> Self {
        Self {
            validator_pk: self.validator_pk.clone(),
            config: self.config.clone(),
            quorum_size: self.quorum_size,
            slot: self.slot.clone(),
            network: self.network.clone(),
            decided_store: self.decided_store.clone(),
            leader_policy: self.leader_policy.clone(),
            value_validator: self.value_validator.clone(),
            sync_responses: self.sync_responses.clone(),
            event_publisher: self.event_publisher.clone(),
        }
    }
}

impl<N: Network + 'static, S: DecidedStore> Controller<N, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        validator_pk: ValidatorPk,
        config: ControllerConfiguration,
        network: N,
        decided_store: S,
        leader_policy: Arc<dyn LeaderPolicy>,
        value_validator: Arc<dyn ValueValidator>,
        sync_responses: SyncResponseRouter,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let quorum_size = config
            .params
            .quorum_size
            .unwrap_or_else(|| leader_policy.quorum_size(config.committee.len()));
        Self {
            validator_pk,
            config,
            quorum_size,
            slot: Arc::new(Mutex::new(ValidatorSlot {
                running: None,
                sync: SyncStatus::Idle,
                sync_generation: 0,
                caught_up: false,
            })),
            network,
            decided_store,
            leader_policy,
            value_validator,
            sync_responses,
            event_publisher,
        }
    }

    pub fn validator_pk(&self) -> &ValidatorPk {
        &self.validator_pk
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    /// Start an instance that agrees on a value for `lambda` at the sequence number after the highest one
    /// decided for the validator, and get that sequence number. The local node proposes `value` in the
    /// rounds it leads.
    pub fn start_instance(&self, lambda: Lambda, value: Value) -> Result<SeqNumber, ControllerError> {
        let mut slot = self.lock_slot();
        if slot.sync == SyncStatus::Running {
            return Err(ControllerError::SyncInProgress);
        }
        if let Some(running) = slot.running_instance() {
            return Err(ControllerError::InstanceAlreadyRunning {
                lambda: running.lambda().clone(),
                seq_number: running.seq_number(),
            });
        }

        let seq_number = self
            .decided_store
            .highest_decided_seq(&self.validator_pk)?
            .map_or(SeqNumber::first(), |highest| highest.next());

        let shared = Arc::new(InstanceShared::new());
        let instance = Instance::new(
            InstanceConfiguration {
                me: self.config.me,
                keypair: self.config.keypair.clone(),
                committee: self.config.committee.clone(),
                params: self.config.params,
            },
            InstanceOptions {
                lambda,
                seq_number,
                validator_pk: self.validator_pk.clone(),
                value,
            },
            self.leader_policy.clone(),
            self.value_validator.clone(),
            self.network.clone(),
            self.decided_store.clone(),
            shared.clone(),
            self.event_publisher.clone(),
        );

        // The previous instance, if any, has already decided or stopped.
        slot.running = Some(start_instance_thread(
            instance,
            shared,
            self.event_publisher.clone(),
        ));
        Ok(seq_number)
    }

    /// Route a consensus message to the running instance it belongs to. Decided messages are handed to
    /// [`process_decided_message`](Self::process_decided_message).
    pub fn process_message(&self, msg: SignedMessage) {
        if msg.msg_type() == MessageType::Decided {
            if let Err(err) = self.process_decided_message(msg) {
                log::error!(
                    "Could not process decided message for validator {:?}: {:?}",
                    self.validator_pk,
                    err
                );
            }
            return;
        }

        let slot = self.lock_slot();
        match slot.running_instance() {
            Some(running)
                if running.lambda() == &msg.message.lambda
                    && running.seq_number() == msg.message.seq_number =>
            {
                running.deliver(msg)
            }
            _ => log::debug!(
                "Dropping {:?} for {:?} seq {}, no matching instance is running",
                msg.msg_type(),
                msg.message.lambda,
                msg.message.seq_number
            ),
        }
    }

    /// Decide whether a decided message received from a peer shows that the local node is behind, and if
    /// so, stop the running instance and start a history sync.
    pub fn process_decided_message(
        &self,
        msg: SignedMessage,
    ) -> Result<DecidedMessageOutcome, ControllerError> {
        if msg.msg_type() != MessageType::Decided
            || msg.message.validator_pk != self.validator_pk
            || !msg.is_valid_decided(&self.config.committee, self.quorum_size)
        {
            log::debug!(
                "Dropping invalid decided message for validator {:?}, seq {}, {} signatures",
                msg.message.validator_pk,
                msg.message.seq_number,
                msg.signer_count()
            );
            return Ok(DecidedMessageOutcome::Invalid);
        }

        let mut slot = self.lock_slot();

        if self
            .decided_store
            .get_decided(&self.validator_pk, msg.message.seq_number)?
            .is_some()
        {
            return Ok(DecidedMessageOutcome::Duplicate);
        }

        if let Some(running) = slot
            .running_instance()
            .filter(|running| running.lambda() == &msg.message.lambda)
        {
            running.deliver(msg);
            return Ok(DecidedMessageOutcome::LetInstancePlayOut);
        }

        if slot.sync == SyncStatus::Running {
            return Ok(DecidedMessageOutcome::SyncAlreadyRunning);
        }

        let current = match slot.running_instance() {
            Some(running) => Some(running.seq_number()),
            None => self.decided_store.highest_decided_seq(&self.validator_pk)?,
        };
        if current.is_some_and(|current| msg.message.seq_number <= current) {
            return Ok(DecidedMessageOutcome::Stale);
        }

        log::info!(
            "Validator {:?} is behind: local seq {:?}, decided seq {}. Starting history sync",
            self.validator_pk,
            current.map(|seq| seq.int()),
            msg.message.seq_number
        );
        if let Some(mut running) = slot.running.take() {
            running.stop();
        }
        slot.sync = SyncStatus::Running;
        slot.caught_up = false;
        slot.sync_generation += 1;
        self.start_sync_thread(msg, slot.sync_generation);

        Ok(DecidedMessageOutcome::SyncStarted)
    }

    /// Answer a peer's history sync request on a new thread.
    pub fn process_sync_message(&self, origin: NodeID, request: SyncRequest) -> JoinHandle<()> {
        let mut handler = SyncRequestHandler::new(
            self.config.sync_request_limit,
            self.decided_store.clone(),
            self.network.clone(),
            self.event_publisher.clone(),
        );
        thread::spawn(move || handler.handle(origin, request))
    }

    /// Stop the running instance, and abandon the running history sync, if any. Entries a sync run
    /// saves after this are still valid, but its outcome is no longer reported.
    pub fn stop(&self) {
        let mut slot = self.lock_slot();
        if let Some(mut running) = slot.running.take() {
            running.stop();
        }
        if slot.sync == SyncStatus::Running {
            slot.sync = SyncStatus::Idle;
            slot.sync_generation += 1;
        }
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.lock_slot().sync
    }

    /// Whether the local node has shown that it is up to date for the validator, either by completing a
    /// history sync or by deciding an instance itself, and has not fallen behind since.
    pub fn is_caught_up(&self) -> bool {
        let slot = self.lock_slot();
        slot.caught_up
            || slot
                .running
                .as_ref()
                .is_some_and(|running| running.is_decided())
    }

    pub fn current_instance(&self) -> Option<InstanceStatus> {
        self.lock_slot().running.as_ref().map(|running| InstanceStatus {
            lambda: running.lambda().clone(),
            seq_number: running.seq_number(),
            round: running.round(),
            decided: running.is_decided(),
            stopped: running.is_stopped(),
        })
    }

    fn start_sync_thread(&self, trigger: SignedMessage, generation: u64) {
        let mut history_sync = HistorySync::new(
            HistorySyncConfiguration {
                me: self.config.me,
                committee: self.config.committee.clone(),
                quorum_size: self.quorum_size,
                request_limit: self.config.sync_request_limit,
                response_timeout: self.config.sync_response_timeout,
                max_retries: self.config.sync_max_retries,
            },
            self.validator_pk.clone(),
            self.decided_store.clone(),
            self.network.clone(),
            self.sync_responses.register(self.validator_pk.clone()),
            self.event_publisher.clone(),
        );
        let slot = self.slot.clone();
        let validator_pk = self.validator_pk.clone();

        thread::spawn(move || {
            let result = history_sync.run(&trigger);

            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.sync_generation != generation {
                return;
            }
            match result {
                Ok(summary) => {
                    log::info!(
                        "History sync for validator {:?} ended at seq {:?}, {} entries saved",
                        validator_pk,
                        summary.highest_seq_number.map(|seq| seq.int()),
                        summary.entries_saved
                    );
                    slot.caught_up = true;
                }
                Err(err) => log::warn!(
                    "History sync for validator {:?} failed: {:?}",
                    validator_pk,
                    err
                ),
            }
            slot.sync = match history_sync.state() {
                HistorySyncState::Failed => SyncStatus::Failed,
                _ => SyncStatus::Idle,
            };
        });
    }

    fn lock_slot(&self) -> MutexGuard<'_, ValidatorSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
