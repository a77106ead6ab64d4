/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Restoring durable state and constructing the event loop's [`Coordinator`].
//!
//! A node starts in exactly one of three modes:
//! - **Restart**: a WAL exists in the data directory. The latest snapshot is installed, the WAL is
//!   replayed on top of it, and the node reconnects to the members the snapshot lists.
//! - **Join**: `join_existing` is set. Storage starts empty and the node waits for the leader to
//!   send it a snapshot describing the cluster.
//! - **Bootstrap**: neither of the above. The bootstrap list, in order, becomes members `1..=n`, and
//!   an initial snapshot recording them as voters is written before the consensus library starts.

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::sync::mpsc::Sender;

use raft::eraftpb::{HardState, Snapshot};
use raft::RawNode;
use slog::Drain;

use crate::chain::Chain;
use crate::events::Event;
use crate::minter::MinterEvent;
use crate::networking::network::{PeerNetwork, Transport};
use crate::node::Configuration;
use crate::persistence::{
    applied_index::{reconcile_applied_index, write_applied_index},
    pluggables::{KVGetError, KVStore, KVStoreError},
    snapshotter::{Snapshotter, SnapshotterError},
    wal::{Wal, WalError, WalSnapshot},
    SNAP_DIR, WAL_DIR,
};
use crate::shutdown::Shutdown;
use crate::types::{
    address::{Address, AddressError},
    data_types::{NodeId, RaftId},
    encoding::VersionedEncoding,
};

use super::event_loop::Coordinator;
use super::raft_storage::RaftStorage;
use super::snapshot::{decode_payload, SnapshotPayload};
use super::state::SharedClusterState;

/// How the durable state found at startup was turned into raft storage.
enum Restored {
    Restart { snapshot: Option<Snapshot> },
    Join,
    Bootstrap { snapshot: Snapshot },
}

pub(crate) struct Started<C: Chain, K: KVStore, T: Transport, N: PeerNetwork> {
    pub(crate) coordinator: Coordinator<C, K, T, N>,
    pub(crate) state: SharedClusterState,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn start_coordinator<C: Chain, K: KVStore, T: Transport, N: PeerNetwork>(
    config: &Configuration,
    chain: C,
    mut kv_store: K,
    transport: T,
    peer_network: N,
    to_minter: Sender<MinterEvent>,
    to_role_handler: Sender<bool>,
    event_publisher: Option<Sender<Event>>,
    shutdown: &Shutdown,
) -> Result<Started<C, K, T, N>, StartError> {
    let bootstrap_size = if config.join_existing {
        0
    } else {
        bootstrap_size(config.bootstrap_nodes.len())?
    };

    let wal_dir = config.data_dir.join(WAL_DIR);
    let snap_dir = config.data_dir.join(SNAP_DIR);
    fs::create_dir_all(&wal_dir)?;
    let snapshotter = Snapshotter::new(&snap_dir)?;

    let stored_applied_index = kv_store.applied_index()?.unwrap_or(0);
    let me = own_address(config);
    let raft_id = me.raft_id;

    let storage = RaftStorage::new();
    let (wal, restored) = if Wal::exists(&wal_dir) {
        log::info!("{}: restarting from {}", raft_id, config.data_dir.display());
        let snapshot = snapshotter.load()?;
        let marker = match &snapshot {
            Some(snapshot) => {
                storage.apply_snapshot(snapshot.clone())?;
                WalSnapshot {
                    index: snapshot.get_metadata().index,
                    term: snapshot.get_metadata().term,
                }
            }
            None => WalSnapshot::default(),
        };

        let mut wal = Wal::open(&wal_dir)?;
        let (mut hard_state, entries) = wal.read_all(marker)?;
        if hard_state != HardState::default() {
            hard_state.commit = hard_state.commit.max(marker.index);
            storage.set_hard_state(hard_state);
        }
        storage.append(&entries)?;
        log::info!(
            "{}: replayed {} entries after snapshot {}",
            raft_id,
            entries.len(),
            marker.index
        );
        (wal, Restored::Restart { snapshot })
    } else if config.join_existing {
        log::info!("{}: joining an existing cluster", raft_id);
        (Wal::create(&wal_dir)?, Restored::Join)
    } else {
        log::info!("{}: bootstrapping a new cluster", raft_id);
        let snapshot = bootstrap_snapshot(config, &me, &chain)?;
        let mut wal = Wal::create(&wal_dir)?;
        wal.save_snapshot(WalSnapshot { index: 1, term: 1 })?;
        snapshotter.save(&snapshot)?;
        storage.apply_snapshot(snapshot.clone())?;
        (wal, Restored::Bootstrap { snapshot })
    };

    let snapshot_index = match &restored {
        Restored::Restart { snapshot: Some(snapshot) } | Restored::Bootstrap { snapshot } => {
            snapshot.get_metadata().index
        }
        _ => 0,
    };
    let committed = storage.hard_state().commit;
    let applied_index = reconcile_applied_index(stored_applied_index, committed, snapshot_index);
    if applied_index != stored_applied_index {
        write_applied_index(&mut kv_store, applied_index)?;
    }

    let raft_config = raft::Config {
        id: raft_id.to_raft(),
        election_tick: config.election_tick,
        heartbeat_tick: config.heartbeat_tick,
        max_size_per_msg: config.max_size_per_msg,
        max_inflight_msgs: config.max_inflight_msgs,
        applied: applied_index,
        pre_vote: config.pre_vote,
        check_quorum: !config.pre_vote,
        ..Default::default()
    };
    raft_config.validate()?;
    let logger = slog::Logger::root(slog_stdlog::StdLog.fuse(), slog::o!());
    let raw_node = RawNode::new(&raft_config, storage.clone(), &logger)?;

    let state = SharedClusterState::new(me, bootstrap_size);
    state.set_applied_index(applied_index);
    state.set_snapshot_index(snapshot_index);

    let mut coordinator = Coordinator {
        raw_node,
        storage,
        wal,
        snapshotter,
        kv_store,
        chain,
        transport,
        peer_network,
        state: state.clone(),
        to_minter,
        to_role_handler,
        event_publisher,
        snapshot_period: config.snapshot_period,
        shutdown: shutdown.clone(),
        shutdown_signal: shutdown.subscribe(),
        is_leader: false,
        exit_after_applying: false,
    };

    match restored {
        Restored::Restart { snapshot: Some(snapshot) } | Restored::Bootstrap { snapshot } => {
            state.set_conf_state(snapshot.get_metadata().get_conf_state().clone());
            coordinator.update_cluster_membership(&decode_payload(&snapshot));
        }
        Restored::Restart { snapshot: None } | Restored::Join => (),
    }

    if state.is_removed(raft_id) {
        return Err(StartError::Removed(raft_id));
    }

    Ok(Started { coordinator, state })
}

fn own_address(config: &Configuration) -> Address {
    Address {
        raft_id: config.raft_id,
        node_id: NodeId::new(config.me.verifying_key().to_bytes()),
        host: config.host.clone(),
        p2p_port: config.p2p_port,
        raft_port: config.raft_port,
    }
}

// Raft ids are u16 and start from 1, so at most u16::MAX members can be listed.
fn bootstrap_size(len: usize) -> Result<u16, StartError> {
    u16::try_from(len).map_err(|_| StartError::TooManyBootstrapNodes(len))
}

// Members are numbered by their position in the bootstrap list, starting from 1.
fn bootstrap_snapshot<C: Chain>(
    config: &Configuration,
    me: &Address,
    chain: &C,
) -> Result<Snapshot, StartError> {
    if config.bootstrap_nodes.is_empty() {
        return Err(StartError::NoBootstrapNodes);
    }
    bootstrap_size(config.bootstrap_nodes.len())?;

    let mut addresses = Vec::with_capacity(config.bootstrap_nodes.len());
    for (position, descriptor) in config.bootstrap_nodes.iter().enumerate() {
        let raft_id = RaftId::new(bootstrap_size(position + 1)?);
        addresses.push(Address::new(raft_id, descriptor)?);
    }

    let listed_as = addresses
        .iter()
        .find(|address| address.node_id == me.node_id)
        .map(|address| address.raft_id);
    if listed_as != Some(me.raft_id) {
        return Err(StartError::NotABootstrapNode(me.raft_id));
    }

    let payload = SnapshotPayload {
        addresses,
        removed_raft_ids: Vec::new(),
        head_block_hash: chain.current_block().hash(),
    };

    let mut snapshot = Snapshot::default();
    snapshot.data = payload.encode().into();
    let metadata = snapshot.mut_metadata();
    metadata.index = 1;
    metadata.term = 1;
    metadata.mut_conf_state().voters = payload
        .addresses
        .iter()
        .map(|address| address.raft_id.to_raft())
        .collect();
    Ok(snapshot)
}

#[derive(Debug)]
pub enum StartError {
    Io(std::io::Error),
    Wal(WalError),
    Snapshotter(SnapshotterError),
    AppliedIndex(KVGetError),
    KVStore(KVStoreError),
    Address(AddressError),
    NoBootstrapNodes,
    /// More bootstrap nodes are listed than there are raft ids.
    TooManyBootstrapNodes(usize),
    /// This node's key is not at the position of its raft id in the bootstrap list.
    NotABootstrapNode(RaftId),
    /// The latest snapshot records this node as removed from the cluster.
    Removed(RaftId),
    Raft(raft::Error),
}

impl Display for StartError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StartError::Io(err) => write!(f, "cannot prepare data directory: {}", err),
            StartError::Wal(err) => write!(f, "cannot restore from wal: {}", err),
            StartError::Snapshotter(err) => write!(f, "cannot load snapshot: {}", err),
            StartError::AppliedIndex(err) => write!(f, "cannot read applied index: {}", err),
            StartError::KVStore(err) => write!(f, "cannot write applied index: {}", err),
            StartError::Address(err) => write!(f, "invalid bootstrap node: {}", err),
            StartError::NoBootstrapNodes => write!(f, "no bootstrap nodes configured"),
            StartError::TooManyBootstrapNodes(len) => {
                write!(f, "{} bootstrap nodes listed, at most {} are allowed", len, u16::MAX)
            }
            StartError::NotABootstrapNode(raft_id) => {
                write!(f, "this node is not bootstrap node {}", raft_id)
            }
            StartError::Removed(raft_id) => write!(f, "node {} was removed from the cluster", raft_id),
            StartError::Raft(err) => write!(f, "cannot start consensus: {}", err),
        }
    }
}

impl std::error::Error for StartError {}

impl From<std::io::Error> for StartError {
    fn from(err: std::io::Error) -> Self {
        StartError::Io(err)
    }
}

impl From<WalError> for StartError {
    fn from(err: WalError) -> Self {
        StartError::Wal(err)
    }
}

impl From<SnapshotterError> for StartError {
    fn from(err: SnapshotterError) -> Self {
        StartError::Snapshotter(err)
    }
}

impl From<KVGetError> for StartError {
    fn from(err: KVGetError) -> Self {
        StartError::AppliedIndex(err)
    }
}

impl From<KVStoreError> for StartError {
    fn from(err: KVStoreError) -> Self {
        StartError::KVStore(err)
    }
}

impl From<AddressError> for StartError {
    fn from(err: AddressError) -> Self {
        StartError::Address(err)
    }
}

impl From<raft::Error> for StartError {
    fn from(err: raft::Error) -> Self {
        StartError::Raft(err)
    }
}
