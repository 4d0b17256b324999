/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a node.
//!
//! A node is one member of a fixed [committee](crate::types::committee::Committee). It runs a
//! [`Controller`] for each validator whose values it helps agree on, and the background threads that
//! feed those controllers with messages from the network.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the node](NodeSpec) with:
//!   1. `NodeSpec::builder` to construct a `NodeSpecBuilder`,
//!   2. The setters of the `NodeSpecBuilder`, and
//!   3. The `NodeSpecBuilder::build` method to construct a [`NodeSpec`],
//! - The function to [start](NodeSpec::start) a [`Node`] given its specification, which refuses to start
//!   a node whose keypair does not match its committee entry,
//! - [The type](Node) which keeps the node alive.
//!
//! ## Starting a node
//!
//! ```ignore
//! let node =
//!     NodeSpec::builder()
//!     .network(network)
//!     .decided_store(KVDecidedStore::new(kv_store))
//!     .configuration(configuration)
//!     .validators(vec![validator_pk])
//!     .on_decide(decide_handler)
//!     .build()
//!     .start()?;
//!
//! let seq_number = node.controller(&validator_pk).unwrap().start_instance(lambda, value)?;
//! ```
//!
//! ### Required setters
//!
//! - `.network(...)`
//! - `.decided_store(...)`
//! - `.configuration(...)`
//! - `.validators(...)`
//!
//! ### Optional setters
//!
//! - `.leader_policy(...)`, defaults to [`RoundRobinLeader`] over the committee.
//! - `.value_validator(...)`, defaults to [`AcceptAllValues`].
//! - One `.on_*(...)` setter per event in [`crate::events`], to register a handler for it.
//!
//! The node's [configuration](Configuration) is also built using the builder pattern:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(NodeID::new(0))
//!     .keypair(signing_key)
//!     .committee(committee)
//!     .round_change_duration(Duration::from_secs(2))
//!     .sync_request_limit(SyncRequestLimit::new(10))
//!     .log_events(true)
//!     .build();
//! ```

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::{
    controller::{Controller, ControllerConfiguration},
    decided_store::DecidedStore,
    event_bus::*,
    events::*,
    history_sync::messages::SyncRequest,
    instance::types::{AcceptAllValues, ConsensusParams, ValueValidator},
    leader_policy::{LeaderPolicy, RoundRobinLeader},
    messages::{MessageType, SignedMessage},
    networking::{
        receiving::{start_polling, SyncResponseRouter},
        Network,
    },
    types::{
        committee::Committee,
        crypto_primitives::Keypair,
        data_types::{NodeID, SyncRequestLimit, ValidatorPk},
    },
};

/// Stores the user-defined parameters required to start the node, that is:
/// 1. The node's identity: its [`NodeID`], its keypair, and the committee it belongs to.
/// 2. The round timing of consensus instances, see [`ConsensusParams`].
/// 3. An optional quorum size that overrides the one computed by the leader policy.
/// 4. The history sync parameters: how many entries to request at once, how long to wait for each
///    response, and how many failed requests a sync run tolerates.
/// 5. The "Log Events" flag. If set to "true", every event is logged.
///
/// ## Log Events
///
/// This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.keypair(...)`
    - `.committee(...)`
    - `.log_events(...)`

    Optional:
    - `.round_change_duration(...)`
    - `.max_round_change_duration(...)`
    - `.leader_pre_prepare_delay(...)`
    - `.quorum_size(...)`
    - `.sync_request_limit(...)`
    - `.sync_response_timeout(...)`
    - `.sync_max_retries(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the ID of the node in the committee. Required."))]
    pub me: NodeID,
    #[builder(setter(doc = "Set the node's keypair, used to sign messages. Its verifying key must be the one the committee lists for `me`. Required."))]
    pub keypair: SigningKey,
    #[builder(setter(doc = "Set the committee, which is fixed for the lifetime of the node. Required."))]
    pub committee: Committee,
    #[builder(default = ConsensusParams::default().round_change_duration,
    setter(doc = "Set the timeout of the first round. Later rounds time out after twice as long as the round before. Defaults to 3 seconds."))]
    pub round_change_duration: Duration,
    #[builder(default = ConsensusParams::default().max_round_change_duration,
    setter(doc = "Set the longest a round can last before timing out. Defaults to 60 seconds."))]
    pub max_round_change_duration: Duration,
    #[builder(default = ConsensusParams::default().leader_pre_prepare_delay,
    setter(doc = "Set how long the leader of the first round waits before proposing. Defaults to 1 second."))]
    pub leader_pre_prepare_delay: Duration,
    #[builder(default, setter(strip_option, doc = "Override the quorum size computed by the leader policy. Optional."))]
    pub quorum_size: Option<usize>,
    #[builder(default = SyncRequestLimit::new(10),
    setter(doc = "Set the largest number of decided messages requested from a peer at once when syncing. Defaults to 10."))]
    pub sync_request_limit: SyncRequestLimit,
    #[builder(default = Duration::from_secs(3),
    setter(doc = "Set how long to wait for a peer's sync response. Defaults to 3 seconds."))]
    pub sync_response_timeout: Duration,
    #[builder(default = 5,
    setter(doc = "Set how many sync requests can fail before a history sync run gives up. Defaults to 5."))]
    pub sync_max_retries: u32,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

impl From<Configuration> for ControllerConfiguration {
    fn from(value: Configuration) -> Self {
        ControllerConfiguration {
            me: value.me,
            keypair: Keypair::new(value.keypair),
            committee: value.committee,
            params: ConsensusParams {
                round_change_duration: value.round_change_duration,
                max_round_change_duration: value.max_round_change_duration,
                leader_pre_prepare_delay: value.leader_pre_prepare_delay,
                quorum_size: value.quorum_size,
            },
            sync_request_limit: value.sync_request_limit,
            sync_response_timeout: value.sync_response_timeout,
            sync_max_retries: value.sync_max_retries,
        }
    }
}

/// Stores all necessary parameters and trait implementations required to run the [`Node`].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [NodeSpec]. On the builder call the following methods to construct a valid [NodeSpec].

    Required:
    - `.network(...)`
    - `.decided_store(...)`
    - `.configuration(...)`
    - `.validators(...)`

    Optional:
    - `.leader_policy(...)`
    - `.value_validator(...)`
    - `.on_start_instance(...)`
    - `.on_stop_instance(...)`
    - `.on_round_timeout(...)`
    - `.on_decide(...)`
    - `.on_propose(...)`
    - `.on_prepare(...)`
    - `.on_commit(...)`
    - `.on_round_change(...)`
    - `.on_receive_message(...)`
    - `.on_start_sync(...)`
    - `.on_end_sync(...)`
    - `.on_sync_failed(...)`
    - `.on_receive_sync_request(...)`
    - `.on_send_sync_response(...)`
"))]
pub struct NodeSpec<N: Network + 'static, S: DecidedStore> {
    // Required parameters
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the store that decided messages are saved in. The argument must implement the [DecidedStore](crate::decided_store::DecidedStore) trait. Required."))]
    decided_store: S,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a node. Required."))]
    configuration: Configuration,
    #[builder(setter(doc = "Set the validators that this node runs consensus instances for. Required."))]
    validators: Vec<ValidatorPk>,
    // Optional parameters
    #[builder(default, setter(transform = |leader_policy: impl LeaderPolicy + 'static| Some(Arc::new(leader_policy) as Arc<dyn LeaderPolicy>),
    doc = "Set the policy that picks the leader of every round. Defaults to round-robin over the committee. Optional."))]
    leader_policy: Option<Arc<dyn LeaderPolicy>>,
    #[builder(default, setter(transform = |value_validator: impl ValueValidator + 'static| Some(Arc::new(value_validator) as Arc<dyn ValueValidator>),
    doc = "Set the check that proposed values must pass before the node prepares them. Defaults to accepting every value. Optional."))]
    value_validator: Option<Arc<dyn ValueValidator>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartInstanceEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartInstanceEvent>),
    doc = "Register a handler closure to be invoked after an instance starts. Optional."))]
    on_start_instance: Option<HandlerPtr<StartInstanceEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StopInstanceEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StopInstanceEvent>),
    doc = "Register a handler closure to be invoked after an instance is stopped before deciding. Optional."))]
    on_stop_instance: Option<HandlerPtr<StopInstanceEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RoundTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RoundTimeoutEvent>),
    doc = "Register a handler closure to be invoked after a round times out. Optional."))]
    on_round_timeout: Option<HandlerPtr<RoundTimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DecideEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DecideEvent>),
    doc = "Register a handler closure to be invoked after an instance decides and saves the decided message. Optional."))]
    on_decide: Option<HandlerPtr<DecideEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeEvent>),
    doc = "Register a handler closure to be invoked after the node broadcasts a pre-prepare. Optional."))]
    on_propose: Option<HandlerPtr<ProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PrepareEvent>),
    doc = "Register a handler closure to be invoked after the node broadcasts a prepare. Optional."))]
    on_prepare: Option<HandlerPtr<PrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitEvent>),
    doc = "Register a handler closure to be invoked after the node broadcasts a commit. Optional."))]
    on_commit: Option<HandlerPtr<CommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RoundChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RoundChangeEvent>),
    doc = "Register a handler closure to be invoked after the node broadcasts a round-change. Optional."))]
    on_round_change: Option<HandlerPtr<RoundChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveMessageEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveMessageEvent>),
    doc = "Register a handler closure to be invoked after an instance accepts a consensus message. Optional."))]
    on_receive_message: Option<HandlerPtr<ReceiveMessageEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartSyncEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartSyncEvent>),
    doc = "Register a handler closure to be invoked after a history sync run starts. Optional."))]
    on_start_sync: Option<HandlerPtr<StartSyncEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EndSyncEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EndSyncEvent>),
    doc = "Register a handler closure to be invoked after a history sync run succeeds. Optional."))]
    on_end_sync: Option<HandlerPtr<EndSyncEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SyncFailedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SyncFailedEvent>),
    doc = "Register a handler closure to be invoked after a history sync run fails. Optional."))]
    on_sync_failed: Option<HandlerPtr<SyncFailedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveSyncRequestEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveSyncRequestEvent>),
    doc = "Register a handler closure to be invoked after the node receives a sync request from a peer. Optional."))]
    on_receive_sync_request: Option<HandlerPtr<ReceiveSyncRequestEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SendSyncResponseEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SendSyncResponseEvent>),
    doc = "Register a handler closure to be invoked after the node sends a sync response to a peer. Optional."))]
    on_send_sync_response: Option<HandlerPtr<SendSyncResponseEvent>>,
}

impl<N: Network + 'static, S: DecidedStore> NodeSpec<N, S> {
    /// Starts all threads and channels associated with running a node, and returns the handles to them
    /// in a [`Node`] struct.
    ///
    /// Fails without starting anything if `me` is not a member of the committee, or if the keypair does
    /// not match the public key the committee has for `me`.
    pub fn start(mut self) -> Result<Node<N, S>, NodeStartError> {
        let committee = self.configuration.committee.clone();
        let me = self.configuration.me;
        match committee.public_key(&me) {
            Some(public_key) if *public_key == self.configuration.keypair.verifying_key() => (),
            Some(_) => return Err(NodeStartError::KeypairMismatch { me }),
            None => return Err(NodeStartError::NotACommitteeMember { me }),
        }
        self.network.init_committee(committee.clone());

        let log_events = self.configuration.log_events;
        let controller_config: ControllerConfiguration = self.configuration.into();

        let event_handlers = EventHandlers::new(
            log_events,
            self.on_start_instance,
            self.on_stop_instance,
            self.on_round_timeout,
            self.on_decide,
            self.on_propose,
            self.on_prepare,
            self.on_commit,
            self.on_round_change,
            self.on_receive_message,
            self.on_start_sync,
            self.on_end_sync,
            self.on_sync_failed,
            self.on_receive_sync_request,
            self.on_send_sync_response,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let sync_responses = SyncResponseRouter::new();
        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, consensus_msgs, sync_requests) = start_polling(
            self.network.clone(),
            sync_responses.clone(),
            poller_shutdown_receiver,
        );

        let leader_policy = self
            .leader_policy
            .unwrap_or_else(|| Arc::new(RoundRobinLeader::new(&committee)));
        let value_validator = self
            .value_validator
            .unwrap_or_else(|| Arc::new(AcceptAllValues));

        let controllers: HashMap<ValidatorPk, Controller<N, S>> = self
            .validators
            .into_iter()
            .map(|validator_pk| {
                let controller = Controller::new(
                    validator_pk.clone(),
                    controller_config.clone(),
                    self.network.clone(),
                    self.decided_store.clone(),
                    leader_policy.clone(),
                    value_validator.clone(),
                    sync_responses.clone(),
                    event_publisher.clone(),
                );
                (validator_pk, controller)
            })
            .collect();

        let (dispatcher_shutdown, dispatcher_shutdown_receiver) = mpsc::channel();
        let dispatcher = start_dispatcher(
            controllers.clone(),
            consensus_msgs,
            sync_requests,
            dispatcher_shutdown_receiver,
        );

        let (event_bus_shutdown, event_bus_shutdown_receiver) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let event_bus = match (event_subscriber, event_bus_shutdown_receiver) {
            (Some(event_subscriber), Some(event_bus_shutdown_receiver)) => Some(start_event_bus(
                event_handlers,
                event_subscriber,
                event_bus_shutdown_receiver,
            )),
            _ => None,
        };

        Ok(Node {
            me,
            decided_store: self.decided_store,
            controllers,
            poller: Some(poller),
            poller_shutdown,
            dispatcher: Some(dispatcher),
            dispatcher_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum NodeStartError {
    /// The committee has no entry for the local node.
    NotACommitteeMember { me: NodeID },
    /// The keypair's public key differs from the one the committee has for the local node.
    KeypairMismatch { me: NodeID },
}

/// Route consensus messages and sync requests from the poller to the controller of the validator they
/// are about.
fn start_dispatcher<N: Network + 'static, S: DecidedStore>(
    controllers: HashMap<ValidatorPk, Controller<N, S>>,
    consensus_msgs: Receiver<(NodeID, SignedMessage)>,
    sync_requests: Receiver<(NodeID, SyncRequest)>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Dispatcher thread disconnected from main thread")
            }
        }

        let mut idle = true;

        if let Ok((origin, msg)) = consensus_msgs.try_recv() {
            idle = false;
            match controllers.get(&msg.message.validator_pk) {
                // Evaluating a decided message may stop an instance, so it runs on its own thread.
                Some(controller) if msg.msg_type() == MessageType::Decided => {
                    let controller = controller.clone();
                    thread::spawn(move || controller.process_message(msg));
                }
                Some(controller) => controller.process_message(msg),
                None => log::debug!(
                    "Dropping {:?} from node {} for unknown validator {:?}",
                    msg.msg_type(),
                    origin,
                    msg.message.validator_pk
                ),
            }
        }

        if let Ok((origin, request)) = sync_requests.try_recv() {
            idle = false;
            match controllers.get(request.validator_pk()) {
                Some(controller) => {
                    controller.process_sync_message(origin, request);
                }
                None => log::debug!(
                    "Dropping sync request from node {} for unknown validator {:?}",
                    origin,
                    request.validator_pk()
                ),
            }
        }

        if idle {
            thread::sleep(Duration::from_millis(1));
        }
    })
}

/// A handle to the background threads of a node. When this value is dropped, every running instance is
/// stopped and all background threads are gracefully shut down.
pub struct Node<N: Network + 'static, S: DecidedStore> {
    me: NodeID,
    decided_store: S,
    controllers: HashMap<ValidatorPk, Controller<N, S>>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    dispatcher: Option<JoinHandle<()>>,
    dispatcher_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<N: Network + 'static, S: DecidedStore> Node<N, S> {
    pub fn me(&self) -> NodeID {
        self.me
    }

    /// Get the controller of `validator_pk`, if the node was started with it.
    pub fn controller(&self, validator_pk: &ValidatorPk) -> Option<&Controller<N, S>> {
        self.controllers.get(validator_pk)
    }

    pub fn decided_store(&self) -> &S {
        &self.decided_store
    }

    /// Stop every running instance and abandon every running history sync. The node keeps answering the
    /// sync requests of its peers.
    pub fn stop(&self) {
        self.controllers.values().for_each(|controller| controller.stop())
    }
}

impl<N: Network + 'static, S: DecidedStore> Drop for Node<N, S> {
    fn drop(&mut self) {
        // The dispatcher receives messages from the poller, so it is shut down first.
        let _ = self.dispatcher_shutdown.send(());
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                log::error!("Dispatcher thread of node {} panicked", self.me);
            }
        }

        self.stop();

        if let Some(event_bus_shutdown) = &self.event_bus_shutdown {
            let _ = event_bus_shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            if event_bus.join().is_err() {
                log::error!("Event bus thread of node {} panicked", self.me);
            }
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                log::error!("Poller thread of node {} panicked", self.me);
            }
        }
    }
}
