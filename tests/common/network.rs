use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use ibft_rs::{
    networking::{Network, NetworkMessage},
    types::{committee::Committee, data_types::NodeID},
};

/// A mock network stub which passes messages from and to threads using channels.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    me: NodeID,
    all_peers: HashMap<NodeID, Sender<(NodeID, NetworkMessage)>>,
    inbox: Arc<Mutex<Receiver<(NodeID, NetworkMessage)>>>,
}

impl Network for NetworkStub {
    fn init_committee(&mut self, _: Committee) {}

    fn send(&mut self, peer: NodeID, message: NetworkMessage) {
        if let Some(peer) = self.all_peers.get(&peer) {
            let _ = peer.send((self.me, message));
        }
    }

    fn broadcast(&mut self, message: NetworkMessage) {
        for (peer_id, peer) in &self.all_peers {
            if *peer_id != self.me {
                let _ = peer.send((self.me, message.clone()));
            }
        }
    }

    fn recv(&mut self) -> Option<(NodeID, NetworkMessage)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(o_m) => Some(o_m),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }
}

pub(crate) fn mock_network(peers: impl Iterator<Item = NodeID>) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(NodeID, Receiver<(NodeID, NetworkMessage)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    peer_and_inboxes
        .into_iter()
        .map(|(me, inbox)| NetworkStub {
            me,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect()
}
