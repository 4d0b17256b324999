/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The round-based state machine that drives one `(Lambda, SeqNumber)` to a decision.

use std::{
    collections::{BTreeSet, VecDeque},
    sync::{mpsc::Sender, Arc},
    time::{Instant, SystemTime},
};

use crate::{
    decided_store::DecidedStore,
    events::*,
    leader_policy::LeaderPolicy,
    messages::{Message, MessageType, SignedMessage},
    networking::{sending::SenderHandle, Network},
    types::{
        committee::Committee,
        crypto_primitives::Keypair,
        data_types::{Lambda, NodeID, Round, SeqNumber, ValidatorPk, Value},
    },
};

use super::{
    runner::InstanceShared,
    types::{ConsensusParams, InstanceState, Stage, ValueValidator},
};

/// Parameters that every instance run by a controller shares.
#[derive(Clone)]
pub(crate) struct InstanceConfiguration {
    pub(crate) me: NodeID,
    pub(crate) keypair: Keypair,
    pub(crate) committee: Committee,
    pub(crate) params: ConsensusParams,
}

/// What a particular instance agrees on, and the value the local node proposes when it leads.
#[derive(Clone, Debug)]
pub struct InstanceOptions {
    pub lambda: Lambda,
    pub seq_number: SeqNumber,
    pub validator_pk: ValidatorPk,
    pub value: Value,
}

pub(crate) struct Instance<N: Network, S: DecidedStore> {
    config: InstanceConfiguration,
    quorum_size: usize,
    state: InstanceState,
    proposal: Value,
    leader_policy: Arc<dyn LeaderPolicy>,
    value_validator: Arc<dyn ValueValidator>,
    sender: SenderHandle<N>,
    decided_store: S,
    shared: Arc<InstanceShared>,
    event_publisher: Option<Sender<Event>>,

    /// The prepares that justify `state.prepared`, attached to the round-changes this node sends.
    prepared_justification: Vec<SignedMessage>,
    /// The round this node last sent a pre-prepare for.
    proposed_round: Option<Round>,
    round_deadline: Option<Instant>,
    /// When the leader of the first round should send its pre-prepare.
    propose_at: Option<Instant>,
    /// A decided message that could not be saved yet.
    pending_decision: Option<SignedMessage>,
    /// Messages sent by this node, waiting to be processed by this node.
    loopback: VecDeque<SignedMessage>,
}

impl<N: Network, S: DecidedStore> Instance<N, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: InstanceConfiguration,
        options: InstanceOptions,
        leader_policy: Arc<dyn LeaderPolicy>,
        value_validator: Arc<dyn ValueValidator>,
        network: N,
        decided_store: S,
        shared: Arc<InstanceShared>,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let quorum_size = config
            .params
            .quorum_size
            .unwrap_or_else(|| leader_policy.quorum_size(config.committee.len()));
        Self {
            config,
            quorum_size,
            state: InstanceState::new(options.lambda, options.seq_number, options.validator_pk),
            proposal: options.value,
            leader_policy,
            value_validator,
            sender: SenderHandle::new(network),
            decided_store,
            shared,
            event_publisher,
            prepared_justification: Vec::new(),
            proposed_round: None,
            round_deadline: None,
            propose_at: None,
            pending_decision: None,
            loopback: VecDeque::new(),
        }
    }

    pub(crate) fn state(&self) -> &InstanceState {
        &self.state
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    pub(crate) fn stop(&self) {
        self.shared.stop()
    }

    pub(crate) fn is_decided(&self) -> bool {
        self.state.stage == Stage::Decided
    }

    /// The earliest instant at which [`tick`](Self::tick) has something to do.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match (self.round_deadline, self.propose_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Enter the first round, start the round timer, and, if the local node leads the first round,
    /// schedule its pre-prepare.
    pub(crate) fn start(&mut self) {
        if self.is_stopped() || self.state.stage != Stage::NotStarted {
            return;
        }

        let now = Instant::now();
        self.state.stage = Stage::PrePrepare;
        self.state.round = Round::first();
        self.round_deadline = Some(now + self.config.params.round_timeout(Round::first()));

        Event::StartInstance(StartInstanceEvent {
            timestamp: SystemTime::now(),
            validator_pk: self.state.validator_pk.clone(),
            lambda: self.state.lambda.clone(),
            seq_number: self.state.seq_number,
        })
        .publish(&self.event_publisher);

        if self.is_leader(Round::first()) {
            self.propose_at = Some(now + self.config.params.leader_pre_prepare_delay);
        }
        self.tick();
    }

    /// Validate `msg` and, if it is valid, record it and act on it.
    pub(crate) fn process_message(&mut self, msg: SignedMessage) {
        self.loopback.push_back(msg);
        self.drain_loopback();
    }

    /// Act on the passage of time: retry saving a pending decision, send the first round's pre-prepare,
    /// and change round if the round timer has expired.
    pub(crate) fn tick(&mut self) {
        if self.is_stopped() || self.is_decided() {
            return;
        }

        if self.pending_decision.is_some() {
            self.try_persist_decision();
            return;
        }

        let now = Instant::now();
        if self.propose_at.is_some_and(|propose_at| now >= propose_at) {
            self.propose_at = None;
            self.propose(Round::first(), self.proposal.clone(), Vec::new());
        }

        if self.round_deadline.is_some_and(|deadline| now >= deadline) {
            self.on_round_timeout();
        }

        self.drain_loopback();
    }

    fn drain_loopback(&mut self) {
        while let Some(msg) = self.loopback.pop_front() {
            self.handle(msg);
        }
    }

    fn handle(&mut self, msg: SignedMessage) {
        if self.is_stopped() || self.is_decided() || self.pending_decision.is_some() {
            return;
        }

        if !self.is_for_this_instance(&msg.message) {
            log::debug!(
                "Dropping {:?} for another instance: {:?} seq {}",
                msg.msg_type(),
                msg.message.lambda,
                msg.message.seq_number
            );
            return;
        }

        // Decided messages carry their own quorum and bypass round ordering.
        if msg.msg_type() == MessageType::Decided {
            self.on_receive_decided(msg);
            return;
        }

        let signer = match msg.single_signer() {
            Some(signer) => signer,
            None => {
                log::debug!("Dropping {:?} without exactly one signer", msg.msg_type());
                return;
            }
        };

        if !msg.is_correctly_signed(&self.config.committee) {
            log::debug!(
                "Dropping {:?} from node {} with an invalid signature, seq {}, round {}",
                msg.msg_type(),
                signer,
                msg.message.seq_number,
                msg.message.round
            );
            return;
        }

        if msg.message.round < self.state.round {
            log::debug!(
                "Dropping stale {:?} from node {} for round {}, current round {}",
                msg.msg_type(),
                signer,
                msg.message.round,
                self.state.round
            );
            return;
        }

        Event::ReceiveMessage(ReceiveMessageEvent {
            timestamp: SystemTime::now(),
            signer,
            msg: msg.clone(),
        })
        .publish(&self.event_publisher);

        match msg.msg_type() {
            MessageType::PrePrepare => self.on_receive_pre_prepare(signer, msg),
            MessageType::Prepare => self.on_receive_prepare(signer, msg),
            MessageType::Commit => self.on_receive_commit(signer, msg),
            MessageType::RoundChange => self.on_receive_round_change(signer, msg),
            MessageType::Decided => (),
        }
    }

    fn on_receive_pre_prepare(&mut self, signer: NodeID, pre_prepare: SignedMessage) {
        let round = pre_prepare.message.round;
        if signer != self.leader_policy.leader_for(self.state.seq_number, round) {
            log::debug!(
                "Dropping pre-prepare from node {} which does not lead round {}",
                signer,
                round
            );
            return;
        }

        if self.state.pre_prepares.contains_round(round) {
            return;
        }

        if round > Round::first() {
            match self.justified_value(round, &pre_prepare.justification) {
                None => {
                    log::debug!("Dropping unjustified pre-prepare for round {}", round);
                    return;
                }
                Some(Some(value)) if value != pre_prepare.message.value => {
                    log::debug!(
                        "Dropping pre-prepare for round {} that does not re-propose the prepared value",
                        round
                    );
                    return;
                }
                Some(_) => (),
            }
        }

        if !self
            .value_validator
            .is_valid(&self.state.lambda, &pre_prepare.message.value)
        {
            log::warn!(
                "Dropping pre-prepare with an invalid value, lambda {:?}, seq {}, round {}",
                self.state.lambda,
                self.state.seq_number,
                round
            );
            return;
        }

        if round > self.state.round {
            self.enter_round(round);
        }

        let value = pre_prepare.message.value.clone();
        self.state.pre_prepares.add(signer, pre_prepare);

        if matches!(self.state.stage, Stage::PrePrepare | Stage::RoundChange) {
            let prepare = self.sign(Message::new(
                MessageType::Prepare,
                round,
                self.state.lambda.clone(),
                self.state.seq_number,
                self.state.validator_pk.clone(),
                value,
            ));
            self.state.stage = Stage::Prepare;
            self.broadcast(prepare.clone());
            Event::Prepare(PrepareEvent {
                timestamp: SystemTime::now(),
                prepare,
            })
            .publish(&self.event_publisher);
        }

        self.check_prepare_quorum(round);
    }

    fn on_receive_prepare(&mut self, signer: NodeID, prepare: SignedMessage) {
        let round = prepare.message.round;
        self.state.prepares.add(signer, prepare);
        self.check_prepare_quorum(round);
    }

    fn on_receive_commit(&mut self, signer: NodeID, commit: SignedMessage) {
        let round = commit.message.round;
        self.state.commits.add(signer, commit);
        self.check_commit_quorum(round);
    }

    fn on_receive_round_change(&mut self, signer: NodeID, round_change: SignedMessage) {
        if !self.is_valid_prepared_justification(&round_change) {
            log::debug!(
                "Dropping round-change from node {} with an unjustified prepared value",
                signer
            );
            return;
        }
        self.state.round_changes.add(signer, round_change);

        // f + 1 nodes in higher rounds include at least one correct node, so follow them.
        let support = self.config.committee.fault_tolerance() + 1;
        if let Some(round) = self
            .state
            .round_changes
            .round_with_support_above(self.state.round, support)
        {
            self.change_round(round);
        }

        self.try_propose_after_round_change();
    }

    fn on_receive_decided(&mut self, decided: SignedMessage) {
        if !decided.is_valid_decided(&self.config.committee, self.quorum_size) {
            log::debug!(
                "Dropping invalid decided message for seq {} with {} signatures",
                decided.message.seq_number,
                decided.signer_count()
            );
            return;
        }

        log::info!(
            "Deciding lambda {:?}, seq {} in round {} from a decided message for round {}",
            self.state.lambda,
            self.state.seq_number,
            self.state.round,
            decided.message.round
        );
        self.pending_decision = Some(decided);
        self.round_deadline = None;
        self.propose_at = None;
        self.try_persist_decision();
    }

    fn check_prepare_quorum(&mut self, round: Round) {
        if round != self.state.round
            || !matches!(
                self.state.stage,
                Stage::PrePrepare | Stage::Prepare | Stage::RoundChange
            )
        {
            return;
        }

        if let Some((value, prepares)) = self.state.prepares.quorum_for_value(round, self.quorum_size)
        {
            self.state.prepared = Some((round, value.clone()));
            self.prepared_justification = prepares;

            let commit = self.sign(Message::new(
                MessageType::Commit,
                round,
                self.state.lambda.clone(),
                self.state.seq_number,
                self.state.validator_pk.clone(),
                value,
            ));
            self.state.stage = Stage::Commit;
            self.broadcast(commit.clone());
            Event::Commit(CommitEvent {
                timestamp: SystemTime::now(),
                commit,
            })
            .publish(&self.event_publisher);
        }
    }

    fn check_commit_quorum(&mut self, round: Round) {
        if let Some((value, commits)) = self.state.commits.quorum_for_value(round, self.quorum_size) {
            let decided_msg = Message::new(
                MessageType::Decided,
                round,
                self.state.lambda.clone(),
                self.state.seq_number,
                self.state.validator_pk.clone(),
                value,
            );
            self.pending_decision = Some(SignedMessage::aggregate(decided_msg, &commits));
            self.round_deadline = None;
            self.propose_at = None;
            self.try_persist_decision();
        }
    }

    /// Save the pending decided message. The instance only becomes [`Stage::Decided`] once the save
    /// succeeds, otherwise the decision stays pending and is retried on the next tick.
    fn try_persist_decision(&mut self) {
        let decided = match &self.pending_decision {
            Some(decided) => decided.clone(),
            None => return,
        };

        match self.decided_store.save_decided(&decided) {
            Ok(_) => {
                self.pending_decision = None;
                self.state.stage = Stage::Decided;
                self.state.decided = Some(decided.clone());
                self.shared.set_decided();
                self.sender.broadcast(decided.clone());
                Event::Decide(DecideEvent {
                    timestamp: SystemTime::now(),
                    decided,
                })
                .publish(&self.event_publisher);
            }
            Err(err) => log::error!(
                "Could not save decided message, lambda {:?}, seq {}, round {}: {:?}",
                self.state.lambda,
                self.state.seq_number,
                decided.message.round,
                err
            ),
        }
    }

    fn on_round_timeout(&mut self) {
        let timeout = self.config.params.round_timeout(self.state.round);
        Event::RoundTimeout(RoundTimeoutEvent {
            timestamp: SystemTime::now(),
            lambda: self.state.lambda.clone(),
            seq_number: self.state.seq_number,
            round: self.state.round,
            timeout,
        })
        .publish(&self.event_publisher);

        self.change_round(self.state.round + 1);
    }

    /// Move to `round` and tell the committee with a round-change carrying this node's prepared value.
    fn change_round(&mut self, round: Round) {
        if round <= self.state.round && self.state.stage == Stage::RoundChange {
            return;
        }
        self.enter_round(round);

        let round_change = self
            .sign(Message::round_change(
                round,
                self.state.lambda.clone(),
                self.state.seq_number,
                self.state.validator_pk.clone(),
                self.state.prepared.clone(),
            ))
            .with_justification(self.prepared_justification.clone());
        self.broadcast(round_change.clone());
        Event::RoundChange(RoundChangeEvent {
            timestamp: SystemTime::now(),
            round_change,
        })
        .publish(&self.event_publisher);

        self.check_prepare_quorum(round);
        self.check_commit_quorum(round);
    }

    /// Set the current round and restart the round timer. Tallies from rounds before the one just left
    /// are forgotten.
    fn enter_round(&mut self, round: Round) {
        let previous = self.state.round;
        self.state.round = round;
        self.state.stage = Stage::RoundChange;
        self.shared.set_round(round);
        self.propose_at = None;
        self.round_deadline = Some(Instant::now() + self.config.params.round_timeout(round));

        self.state.pre_prepares.prune_below(previous);
        self.state.prepares.prune_below(previous);
        self.state.commits.prune_below(previous);
        self.state.round_changes.prune_below(previous);
    }

    /// If the local node leads the current round and a quorum of round-changes for it is present,
    /// re-propose the highest justified prepared value, or its own value if none was prepared.
    fn try_propose_after_round_change(&mut self) {
        let round = self.state.round;
        if round == Round::first()
            || !self.is_leader(round)
            || self.proposed_round == Some(round)
            || self.state.round_changes.count(round) < self.quorum_size
        {
            return;
        }

        let round_changes = self.state.round_changes.messages(round);
        let value = match self.justified_value(round, &round_changes) {
            Some(Some(prepared_value)) => prepared_value,
            Some(None) => self.proposal.clone(),
            None => return,
        };
        self.propose(round, value, round_changes);
    }

    fn propose(&mut self, round: Round, value: Value, justification: Vec<SignedMessage>) {
        if self.proposed_round == Some(round) {
            return;
        }
        self.proposed_round = Some(round);

        let pre_prepare = self
            .sign(Message::new(
                MessageType::PrePrepare,
                round,
                self.state.lambda.clone(),
                self.state.seq_number,
                self.state.validator_pk.clone(),
                value,
            ))
            .with_justification(justification);
        self.broadcast(pre_prepare.clone());
        Event::Propose(ProposeEvent {
            timestamp: SystemTime::now(),
            pre_prepare,
        })
        .publish(&self.event_publisher);
    }

    /// Check the round-changes that justify a pre-prepare for `round`.
    ///
    /// Returns `None` if they do not include a quorum of valid round-changes for `round`. Otherwise
    /// returns the prepared value with the highest prepared round among them, which the pre-prepare must
    /// re-propose, or `Some(None)` if none of them prepared anything.
    fn justified_value(&self, round: Round, round_changes: &[SignedMessage]) -> Option<Option<Value>> {
        let mut signers = BTreeSet::new();
        let mut highest: Option<(Round, &Value)> = None;
        for round_change in round_changes {
            if round_change.msg_type() != MessageType::RoundChange
                || round_change.message.round != round
                || !self.is_for_this_instance(&round_change.message)
            {
                continue;
            }
            let signer = match round_change.single_signer() {
                Some(signer) => signer,
                None => continue,
            };
            if signers.contains(&signer)
                || !round_change.is_correctly_signed(&self.config.committee)
                || !self.is_valid_prepared_justification(round_change)
            {
                continue;
            }
            signers.insert(signer);
            if let Some((prepared_round, value)) = round_change.message.prepared() {
                if highest.map_or(true, |(highest_round, _)| prepared_round > highest_round) {
                    highest = Some((prepared_round, value));
                }
            }
        }

        if signers.len() < self.quorum_size {
            return None;
        }
        Some(highest.map(|(_, value)| value.clone()))
    }

    /// Check that a round-change reporting a prepared value carries a quorum of valid prepares for that
    /// value in an earlier round. Round-changes that report nothing are always valid.
    fn is_valid_prepared_justification(&self, round_change: &SignedMessage) -> bool {
        let (prepared_round, value) = match round_change.message.prepared() {
            Some(prepared) => prepared,
            None => return true,
        };
        if prepared_round >= round_change.message.round {
            return false;
        }

        let signers: BTreeSet<NodeID> = round_change
            .justification
            .iter()
            .filter(|prepare| {
                prepare.msg_type() == MessageType::Prepare
                    && prepare.message.round == prepared_round
                    && &prepare.message.value == value
                    && self.is_for_this_instance(&prepare.message)
                    && prepare.is_correctly_signed(&self.config.committee)
            })
            .filter_map(|prepare| prepare.single_signer())
            .collect();
        signers.len() >= self.quorum_size
    }

    fn is_for_this_instance(&self, msg: &Message) -> bool {
        msg.lambda == self.state.lambda
            && msg.seq_number == self.state.seq_number
            && msg.validator_pk == self.state.validator_pk
    }

    fn is_leader(&self, round: Round) -> bool {
        self.leader_policy.leader_for(self.state.seq_number, round) == self.config.me
    }

    fn sign(&self, message: Message) -> SignedMessage {
        SignedMessage::sign_with(message, self.config.me, &self.config.keypair)
    }

    /// Send `msg` to the committee, and queue it to be processed by this node too.
    fn broadcast(&mut self, msg: SignedMessage) {
        self.sender.broadcast(msg.clone());
        self.loopback.push_back(msg);
    }
}
