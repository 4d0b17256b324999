use std::{thread, time::Duration};

use ibft_rs::{
    controller::{DecidedMessageOutcome, SyncStatus},
    decided_store::KVDecidedStore,
    messages::MessageType,
    networking::Network,
    types::data_types::{Lambda, NodeID, Round, SeqNumber, Value},
};
use log::LevelFilter;

mod common;

use common::{
    logging::{log_with_context, setup_logger},
    mem_db::MemDB,
    network::mock_network,
    node::{committee_of, controller, decided_at, start_node, wait_until, TestTiming},
};

/// Tests that a committee of 4 decides the value of a fixed leader in the first round.
#[test]
fn committee_decides_leader_value_test() {
    setup_logger(LevelFilter::Info);

    // 1. Initialize test components.

    // 1.1. Generate signing keys and the committee of 4 nodes (f = 1, quorum = 3).
    let (keys, committee) = committee_of(4);

    // 1.2. Create a mock network connecting the 4 nodes.
    let network_stubs = mock_network(committee.ids());

    // 1.3. Start the 4 nodes, all following node 0 as the leader of every round.
    let nodes: Vec<_> = keys
        .iter()
        .cloned()
        .zip(network_stubs)
        .enumerate()
        .map(|(i, (keypair, network))| {
            start_node(
                NodeID::new(i as u64),
                keypair,
                committee.clone(),
                network,
                KVDecidedStore::new(MemDB::new()),
                TestTiming::default(),
                Some(NodeID::new(0)),
            )
        })
        .collect();

    // 2. Start an instance on every node, each with its own value.
    let lambda = Lambda::new(b"attestation-duty".to_vec());
    for (i, node) in nodes.iter().enumerate() {
        let seq_number = controller(node)
            .start_instance(lambda.clone(), Value::new(vec![i as u8; 8]))
            .unwrap();
        assert_eq!(seq_number, SeqNumber::first());
    }

    // 3. Wait until every node has saved a decided message for sequence number 1.
    log_with_context(None, "Waiting for every node to decide");
    assert!(wait_until(Duration::from_secs(10), || nodes
        .iter()
        .all(|node| decided_at(node, 1).is_some())));

    // 4. Every node decided node 0's value, in round 1, backed by a quorum of commit signatures.
    for node in &nodes {
        let decided = decided_at(node, 1).unwrap();
        assert_eq!(decided.msg_type(), MessageType::Decided);
        assert_eq!(decided.message.lambda, lambda);
        assert_eq!(decided.message.value, Value::new(vec![0; 8]));
        assert_eq!(decided.message.round, Round::first());
        assert!(decided.is_valid_decided(&committee, 3));
        assert!(controller(node).is_caught_up());
    }

    // 5. The next instance runs at the next sequence number.
    assert_eq!(
        controller(&nodes[2])
            .start_instance(Lambda::new(b"next-duty".to_vec()), Value::new(vec![9]))
            .unwrap(),
        SeqNumber::new(2)
    );
}

/// Tests that an instance still decides when the leader of the first round is silent.
///
/// With round-robin leader selection, node 1 leads round 1 of sequence number 1 and node 2 leads round 2.
/// Node 1 is never started, so the round 1 timer expires at the other three nodes, they change round, and
/// node 2 proposes in round 2.
#[test]
fn silent_leader_round_change_test() {
    setup_logger(LevelFilter::Info);

    // 1. Initialize test components.
    let (keys, committee) = committee_of(4);
    let network_stubs = mock_network(committee.ids());
    let timing = TestTiming {
        round_change_duration: Duration::from_millis(500),
        ..TestTiming::default()
    };

    // 2. Start every node except node 1.
    let nodes: Vec<_> = keys
        .iter()
        .cloned()
        .zip(network_stubs)
        .enumerate()
        .filter(|(i, _)| *i != 1)
        .map(|(i, (keypair, network))| {
            start_node(
                NodeID::new(i as u64),
                keypair,
                committee.clone(),
                network,
                KVDecidedStore::new(MemDB::new()),
                timing,
                None,
            )
        })
        .collect();

    // 3. Start an instance on the three live nodes.
    let lambda = Lambda::new(b"proposer-duty".to_vec());
    for node in &nodes {
        controller(node)
            .start_instance(lambda.clone(), Value::new(node.me().int().to_be_bytes().to_vec()))
            .unwrap();
    }

    // 4. Wait until the three live nodes decide.
    log_with_context(None, "Waiting for the live nodes to decide after a round change");
    assert!(wait_until(Duration::from_secs(15), || nodes
        .iter()
        .all(|node| decided_at(node, 1).is_some())));

    // 5. They decided the same value, in a round after the first, and it is one of the live nodes' own
    //    values since node 1 never proposed anything.
    let decided: Vec<_> = nodes.iter().map(|node| decided_at(node, 1).unwrap()).collect();
    for each in &decided {
        assert_eq!(each.message.value, decided[0].message.value);
        assert!(each.message.round > Round::first());
    }
    assert!([0u64, 2, 3]
        .iter()
        .any(|i| decided[0].message.value == Value::new(i.to_be_bytes().to_vec())));
}

/// Tests that a node which starts an instance after the rest of the committee has decided it, and so can
/// never gather a quorum of commits itself, decides from the decided message of a peer.
#[test]
fn late_node_decides_from_decided_message_test() {
    setup_logger(LevelFilter::Info);

    // 1. Initialize test components.
    let (keys, committee) = committee_of(4);
    let mut network_stubs = mock_network(committee.ids());
    let mut late_network = network_stubs.pop().unwrap();

    // 2. Start nodes 0, 1, and 2 with node 0 leading, and let them decide lambda L at sequence number 1.
    let nodes: Vec<_> = keys
        .iter()
        .cloned()
        .zip(network_stubs)
        .enumerate()
        .map(|(i, (keypair, network))| {
            start_node(
                NodeID::new(i as u64),
                keypair,
                committee.clone(),
                network,
                KVDecidedStore::new(MemDB::new()),
                TestTiming::default(),
                Some(NodeID::new(0)),
            )
        })
        .collect();
    let lambda = Lambda::new(b"late-duty".to_vec());
    for node in &nodes {
        controller(node)
            .start_instance(lambda.clone(), Value::new(vec![7]))
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(10), || nodes
        .iter()
        .all(|node| decided_at(node, 1).is_some())));

    // 3. Once the decided messages have gone out, throw away what was sent to node 3 while it was down.
    //    Then start it and its instance for L.
    thread::sleep(Duration::from_millis(300));
    while late_network.recv().is_some() {}
    let late = start_node(
        NodeID::new(3),
        keys[3].clone(),
        committee.clone(),
        late_network,
        KVDecidedStore::new(MemDB::new()),
        TestTiming {
            round_change_duration: Duration::from_millis(300),
            ..TestTiming::default()
        },
        Some(NodeID::new(0)),
    );
    assert_eq!(
        controller(&late)
            .start_instance(lambda.clone(), Value::new(vec![7]))
            .unwrap(),
        SeqNumber::first()
    );

    // 4. Hand node 3 the decided message of node 0. Its instance decides with it, without a sync.
    let decided = decided_at(&nodes[0], 1).unwrap();
    assert_eq!(
        controller(&late)
            .process_decided_message(decided.clone())
            .unwrap(),
        DecidedMessageOutcome::LetInstancePlayOut
    );
    assert!(wait_until(Duration::from_secs(5), || decided_at(&late, 1).is_some()));
    assert_eq!(decided_at(&late, 1), Some(decided));
    assert!(controller(&late).current_instance().unwrap().decided);
    assert_eq!(controller(&late).sync_status(), SyncStatus::Idle);

    // 5. Node 3 is no longer blocked, and runs its next instance at sequence number 2.
    assert_eq!(
        controller(&late)
            .start_instance(Lambda::new(b"next-duty".to_vec()), Value::new(vec![8]))
            .unwrap(),
        SeqNumber::new(2)
    );
}
