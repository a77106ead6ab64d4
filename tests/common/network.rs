use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    time::SystemTime,
};

use raft::eraftpb::Message;
use raft_chain::{
    networking::network::{PeerNetwork, Transport, TransportError},
    types::{address::Address, data_types::RaftId},
};

/// Connects the transports of all the nodes in a test, by raft id.
#[derive(Clone, Default)]
pub(crate) struct TransportHub(Arc<Mutex<HashMap<RaftId, Sender<Message>>>>);

impl TransportHub {
    pub(crate) fn new() -> TransportHub {
        TransportHub::default()
    }

    /// Create the transport of node `raft_id`, replacing the one it had before a restart.
    pub(crate) fn connect(&self, raft_id: RaftId) -> ChannelTransport {
        let (sender, inbox) = mpsc::channel();
        self.0.lock().unwrap().insert(raft_id, sender);
        ChannelTransport {
            hub: self.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// A mock transport stub which passes messages from and to threads using channels. Like a real
/// transport's reply route, it delivers to nodes that have not been added as peers yet.
#[derive(Clone)]
pub(crate) struct ChannelTransport {
    hub: TransportHub,
    inbox: Arc<Mutex<Receiver<Message>>>,
    peers: Arc<Mutex<HashMap<RaftId, SystemTime>>>,
}

impl Transport for ChannelTransport {
    fn add_peer(&mut self, address: &Address) {
        self.peers
            .lock()
            .unwrap()
            .insert(address.raft_id, SystemTime::now());
    }

    fn remove_peer(&mut self, raft_id: RaftId) {
        self.peers.lock().unwrap().remove(&raft_id);
    }

    fn send(&mut self, message: Message) -> Result<(), TransportError> {
        let to = RaftId::from_raft(message.to).ok_or(TransportError::UnknownPeer(message.to))?;
        let peer = self
            .hub
            .0
            .lock()
            .unwrap()
            .get(&to)
            .cloned()
            .ok_or(TransportError::UnknownPeer(message.to))?;
        peer.send(message).map_err(|_| TransportError::Disconnected(to))
    }

    fn recv(&mut self) -> Option<Message> {
        self.inbox.lock().unwrap().try_recv().ok()
    }

    fn active_since(&self, raft_id: RaftId) -> Option<SystemTime> {
        self.peers.lock().unwrap().get(&raft_id).copied()
    }
}

/// Records which members the data-plane network is connected to.
#[derive(Clone, Default)]
pub(crate) struct RecordingNetwork {
    peers: Arc<Mutex<BTreeSet<RaftId>>>,
}

impl RecordingNetwork {
    pub(crate) fn peers(&self) -> Vec<RaftId> {
        self.peers.lock().unwrap().iter().copied().collect()
    }
}

impl PeerNetwork for RecordingNetwork {
    fn add_peer(&mut self, address: &Address) {
        self.peers.lock().unwrap().insert(address.raft_id);
    }

    fn remove_peer(&mut self, address: &Address) {
        self.peers.lock().unwrap().remove(&address.raft_id);
    }
}
