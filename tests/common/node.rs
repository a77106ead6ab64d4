use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use ed25519_dalek::SigningKey;
use raft_chain::{
    api::RaftApi,
    node::{Configuration, Node, NodeSpec},
    persistence::file_kv_store::FileKVStore,
    types::{
        address::PeerDescriptor,
        block::Transaction,
        data_types::{AccountAddress, CryptoHash, NodeId, RaftId},
    },
};
use rand_core::OsRng;

use super::{
    logging::{log_with_context, short},
    mem_chain::{ChainRegistry, MemChain},
    network::{ChannelTransport, RecordingNetwork, TransportHub},
    tx_pool::MemTxPool,
};

pub(crate) const APPLIED_INDEX_FILE: &str = "applied-index";

/// What the nodes of one test share: the transport hub, the chain registry chains synchronise
/// through, and the bootstrap list.
pub(crate) struct TestCluster {
    pub(crate) hub: TransportHub,
    pub(crate) registry: ChainRegistry,
    pub(crate) bootstrap_nodes: Vec<PeerDescriptor>,
}

/// Things the nodes will have in common:
/// - Bootstrap list.
/// - Configuration, apart from identity.
///
/// Things that they will differ in:
/// - Chain and transaction pool.
/// - Transport and data-plane network.
/// - Data directory.
/// - Keypair.
pub(crate) struct TestNode {
    pub(crate) raft_id: RaftId,
    keypair: SigningKey,
    index: u16,
    pub(crate) chain: MemChain,
    pub(crate) tx_pool: MemTxPool,
    pub(crate) network: RecordingNetwork,
    data_dir: PathBuf,
    join_existing: bool,
    bootstrap_nodes: Vec<PeerDescriptor>,
    hub: TransportHub,
    minted: Arc<Mutex<Vec<CryptoHash>>>,
    node: Option<Node<ChannelTransport>>,
}

impl TestNode {
    fn new(
        raft_id: RaftId,
        keypair: SigningKey,
        index: u16,
        join_existing: bool,
        dir: &Path,
        cluster: &TestCluster,
    ) -> TestNode {
        let node_id = NodeId::new(keypair.verifying_key().to_bytes());
        let chain = MemChain::new(node_id, cluster.registry.clone());
        let mut node = TestNode {
            raft_id,
            keypair,
            index,
            tx_pool: MemTxPool::new(chain.clone()),
            chain,
            network: RecordingNetwork::default(),
            data_dir: dir.join(format!("node-{}", index)),
            join_existing,
            bootstrap_nodes: cluster.bootstrap_nodes.clone(),
            hub: cluster.hub.clone(),
            minted: Arc::new(Mutex::new(Vec::new())),
            node: None,
        };
        node.start();
        node
    }

    /// Start (or restart) the node against its data directory.
    pub(crate) fn start(&mut self) {
        assert!(self.node.is_none(), "node {} is already running", self.raft_id);

        let configuration = Configuration::builder()
            .me(self.keypair.clone())
            .raft_id(self.raft_id)
            .host("127.0.0.1")
            .p2p_port(p2p_port(self.index))
            .raft_port(raft_port(self.index))
            .data_dir(self.data_dir.clone())
            .bootstrap_nodes(self.bootstrap_nodes.clone())
            .join_existing(self.join_existing)
            .block_time(Duration::from_millis(10))
            .tick_interval(Duration::from_millis(20))
            .log_events(true)
            .build();

        let raft_id = self.raft_id;
        let minted = self.minted.clone();
        let node = NodeSpec::builder()
            .chain(self.chain.clone())
            .tx_pool(self.tx_pool.clone())
            .kv_store(FileKVStore::open(self.applied_index_path()).unwrap())
            .transport(self.hub.connect(self.raft_id))
            .peer_network(self.network.clone())
            .configuration(configuration)
            .on_mint_block(move |event| minted.lock().unwrap().push(event.block.hash()))
            .on_insert_block(move |event| {
                log_with_context(
                    raft_id,
                    &format!(
                        "Inserted block #{} ({}) at index {}",
                        event.block.number(),
                        short(&event.block.hash()),
                        event.raft_index
                    ),
                )
            })
            .build()
            .start()
            .unwrap();

        self.node = Some(node);
    }

    /// Stop the node, waiting for all of its threads to exit.
    pub(crate) fn stop(&mut self) {
        self.node = None;
    }

    pub(crate) fn api(&self) -> &RaftApi<ChannelTransport> {
        self.node
            .as_ref()
            .expect("node is not running")
            .api()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.node.as_ref().map_or(true, |node| node.is_shut_down())
    }

    pub(crate) fn descriptor(&self) -> PeerDescriptor {
        descriptor(&self.keypair, self.index)
    }

    /// Hashes of the blocks this node minted.
    pub(crate) fn minted(&self) -> Vec<CryptoHash> {
        self.minted.lock().unwrap().clone()
    }

    pub(crate) fn applied_index_path(&self) -> PathBuf {
        self.data_dir.join(APPLIED_INDEX_FILE)
    }
}

fn p2p_port(index: u16) -> u16 {
    21000 + index
}

fn raft_port(index: u16) -> u16 {
    50400 + index
}

fn descriptor(keypair: &SigningKey, index: u16) -> PeerDescriptor {
    PeerDescriptor {
        node_id: NodeId::new(keypair.verifying_key().to_bytes()),
        host: "127.0.0.1".to_string(),
        p2p_port: p2p_port(index),
        raft_port: Some(raft_port(index)),
    }
}

/// Bootstrap a cluster of `size` nodes, with raft ids `1..=size`, keeping their data in `dir`.
pub(crate) fn bootstrap_cluster(size: u16, dir: &Path) -> (TestCluster, Vec<TestNode>) {
    let keypairs: Vec<SigningKey> = (0..size).map(|_| SigningKey::generate(&mut OsRng)).collect();
    let cluster = TestCluster {
        hub: TransportHub::new(),
        registry: ChainRegistry::default(),
        bootstrap_nodes: keypairs
            .iter()
            .enumerate()
            .map(|(index, keypair)| descriptor(keypair, index as u16 + 1))
            .collect(),
    };

    let nodes = keypairs
        .into_iter()
        .enumerate()
        .map(|(index, keypair)| {
            let index = index as u16 + 1;
            TestNode::new(RaftId::new(index), keypair, index, false, dir, &cluster)
        })
        .collect();

    (cluster, nodes)
}

/// A node that is not part of the cluster yet, with its own keypair and ports. Start it with
/// [`join`] once a member has added it.
pub(crate) struct Newcomer {
    keypair: SigningKey,
    index: u16,
}

impl Newcomer {
    pub(crate) fn new(index: u16) -> Newcomer {
        Newcomer {
            keypair: SigningKey::generate(&mut OsRng),
            index,
        }
    }

    pub(crate) fn descriptor(&self) -> PeerDescriptor {
        descriptor(&self.keypair, self.index)
    }

    pub(crate) fn join(self, raft_id: RaftId, dir: &Path, cluster: &TestCluster) -> TestNode {
        TestNode::new(raft_id, self.keypair, self.index, true, dir, cluster)
    }
}

/// Poll `condition` until it holds, failing the test after `timeout`.
pub(crate) fn wait_until(timeout: Duration, what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting until {}", what);
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Wait until one of `nodes` leads and every other running node knows it, and return its position.
pub(crate) fn wait_for_leader(nodes: &[TestNode]) -> usize {
    wait_until(Duration::from_secs(10), "a leader is elected", || {
        let running: Vec<&TestNode> = nodes.iter().filter(|node| !node.is_shut_down()).collect();
        let leaders = running
            .iter()
            .filter(|node| node.api().role() == "minter")
            .count();
        leaders == 1 && running.iter().all(|node| node.api().leader().is_ok())
    });
    nodes
        .iter()
        .position(|node| !node.is_shut_down() && node.api().role() == "minter")
        .unwrap()
}

pub(crate) fn transaction(sender: u8, nonce: u64) -> Transaction {
    Transaction {
        from: AccountAddress::new([sender; 20]),
        nonce,
        gas_price: 1,
        gas: 21_000,
        to: Some(AccountAddress::new([0xff; 20])),
        value: 1,
        payload: Vec::new(),
    }
}

/// Submit `transaction` to every running node's pool, the way a gossiping p2p network would.
pub(crate) fn submit_everywhere(nodes: &[TestNode], transaction: &Transaction) {
    for node in nodes.iter().filter(|node| !node.is_shut_down()) {
        node.tx_pool.submit(transaction.clone());
    }
}
