use std::{
    thread,
    time::{Duration, Instant},
};

use ed25519_dalek::SigningKey;
use ibft_rs::{
    controller::Controller,
    decided_store::{DecidedStore, KVDecidedStore},
    events::{DecideEvent, EndSyncEvent, RoundChangeEvent, StartSyncEvent, SyncFailedEvent},
    leader_policy::FixedLeader,
    messages::{Message, MessageType, SignedMessage},
    node::{Configuration, Node, NodeSpec},
    types::{
        committee::{Committee, Node as CommitteeMember},
        data_types::{Lambda, NodeID, Round, SeqNumber, SyncRequestLimit, ValidatorPk, Value},
    },
};
use rand_core::OsRng;

use super::{
    logging::{first_seven_base64_chars, log_with_context},
    mem_db::MemDB,
    network::NetworkStub,
};

pub(crate) type TestStore = KVDecidedStore<MemDB>;

/// Timing parameters short enough for tests.
#[derive(Clone, Copy)]
pub(crate) struct TestTiming {
    pub(crate) round_change_duration: Duration,
    pub(crate) leader_pre_prepare_delay: Duration,
    pub(crate) sync_response_timeout: Duration,
    pub(crate) sync_max_retries: u32,
}

impl Default for TestTiming {
    fn default() -> Self {
        Self {
            round_change_duration: Duration::from_millis(1000),
            leader_pre_prepare_delay: Duration::from_millis(100),
            sync_response_timeout: Duration::from_millis(500),
            sync_max_retries: 5,
        }
    }
}

/// Generate `n` keypairs and the committee they form, with node `i` holding `keys[i]`.
pub(crate) fn committee_of(n: usize) -> (Vec<SigningKey>, Committee) {
    let keys: Vec<SigningKey> = (0..n).map(|_| SigningKey::generate(&mut OsRng)).collect();
    let committee = keys
        .iter()
        .enumerate()
        .map(|(i, key)| CommitteeMember::new(NodeID::new(i as u64), key.verifying_key()))
        .collect();
    (keys, committee)
}

pub(crate) fn validator_pk() -> ValidatorPk {
    ValidatorPk::new(vec![0xAB; 48])
}

/// Build a decided message for `seq_number` signed by the committee members at `signers`.
pub(crate) fn decided_message(
    keys: &[SigningKey],
    signers: &[usize],
    lambda: &Lambda,
    seq_number: SeqNumber,
    value: &Value,
) -> SignedMessage {
    let message = Message::new(
        MessageType::Decided,
        Round::first(),
        lambda.clone(),
        seq_number,
        validator_pk(),
        value.clone(),
    );
    let signed: Vec<SignedMessage> = signers
        .iter()
        .map(|i| SignedMessage::sign(message.clone(), NodeID::new(*i as u64), &keys[*i]))
        .collect();
    SignedMessage::aggregate(message, &signed)
}

/// Save valid decided messages for sequence numbers `1..=up_to` in `store`.
pub(crate) fn fill_store(store: &mut TestStore, keys: &[SigningKey], up_to: u64) {
    for seq in 1..=up_to {
        let decided = decided_message(
            keys,
            &[0, 1, 2],
            &Lambda::new(format!("duty-{}", seq).into_bytes()),
            SeqNumber::new(seq),
            &Value::new(vec![seq as u8]),
        );
        store.save_decided(&decided).unwrap();
    }
}

pub(crate) fn start_node(
    me: NodeID,
    keypair: SigningKey,
    committee: Committee,
    network: NetworkStub,
    decided_store: TestStore,
    timing: TestTiming,
    fixed_leader: Option<NodeID>,
) -> Node<NetworkStub, TestStore> {
    node_spec(me, keypair, committee, network, decided_store, timing, fixed_leader)
        .start()
        .expect("Node refused to start!")
}

pub(crate) fn node_spec(
    me: NodeID,
    keypair: SigningKey,
    committee: Committee,
    network: NetworkStub,
    decided_store: TestStore,
    timing: TestTiming,
    fixed_leader: Option<NodeID>,
) -> NodeSpec<NetworkStub, TestStore> {
    let configuration = Configuration::builder()
        .me(me)
        .keypair(keypair)
        .committee(committee)
        .round_change_duration(timing.round_change_duration)
        .max_round_change_duration(Duration::from_secs(10))
        .leader_pre_prepare_delay(timing.leader_pre_prepare_delay)
        .sync_request_limit(SyncRequestLimit::new(3))
        .sync_response_timeout(timing.sync_response_timeout)
        .sync_max_retries(timing.sync_max_retries)
        .log_events(false)
        .build();

    let spec = NodeSpec::builder()
        .network(network)
        .decided_store(decided_store)
        .configuration(configuration)
        .validators(vec![validator_pk()])
        .on_decide(decide_handler(me))
        .on_round_change(round_change_handler(me))
        .on_start_sync(start_sync_handler(me))
        .on_end_sync(end_sync_handler(me))
        .on_sync_failed(sync_failed_handler(me));

    match fixed_leader {
        Some(leader) => spec.leader_policy(FixedLeader(leader)).build(),
        None => spec.build(),
    }
}

pub(crate) fn controller(node: &Node<NetworkStub, TestStore>) -> &Controller<NetworkStub, TestStore> {
    node.controller(&validator_pk())
        .expect("Node was started without the test validator!")
}

pub(crate) fn decided_at(node: &Node<NetworkStub, TestStore>, seq: u64) -> Option<SignedMessage> {
    node.decided_store()
        .get_decided(&validator_pk(), SeqNumber::new(seq))
        .unwrap()
}

/// Poll `condition` until it holds or `timeout` passes. Returns whether it held.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn decide_handler(me: NodeID) -> impl Fn(&DecideEvent) + Send + 'static {
    move |decide_event| {
        log_with_context(
            Some(me),
            &format!(
                "Decided, lambda: {}, seq: {}, round: {}, value hash: {}, no. of signatures: {}",
                first_seven_base64_chars(decide_event.decided.message.lambda.bytes()),
                decide_event.decided.message.seq_number,
                decide_event.decided.message.round,
                decide_event.decided.message.value.hash(),
                decide_event.decided.signer_count()
            ),
        );
    }
}

fn round_change_handler(me: NodeID) -> impl Fn(&RoundChangeEvent) + Send + 'static {
    move |round_change_event| {
        log_with_context(
            Some(me),
            &format!(
                "Round change, seq: {}, round: {}, prepared round: {:?}",
                round_change_event.round_change.message.seq_number,
                round_change_event.round_change.message.round,
                round_change_event.round_change.message.prepared_round
            ),
        );
    }
}

fn start_sync_handler(me: NodeID) -> impl Fn(&StartSyncEvent) + Send + 'static {
    move |start_sync_event| {
        log_with_context(
            Some(me),
            &format!(
                "Started sync, trigger seq: {}",
                start_sync_event.trigger_seq_number
            ),
        );
    }
}

fn end_sync_handler(me: NodeID) -> impl Fn(&EndSyncEvent) + Send + 'static {
    move |end_sync_event| {
        log_with_context(
            Some(me),
            &format!(
                "Ended sync, highest seq: {:?}, entries saved: {}",
                end_sync_event.highest_seq_number,
                end_sync_event.entries_saved
            ),
        );
    }
}

fn sync_failed_handler(me: NodeID) -> impl Fn(&SyncFailedEvent) + Send + 'static {
    move |sync_failed_event| {
        log_with_context(
            Some(me),
            &format!("Sync failed: {}", sync_failed_event.reason),
        );
    }
}
