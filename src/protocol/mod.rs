/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The protocol manager: runs Raft for the chain and applies what it commits.
//!
//! The work is split across four threads, all started by [`Node`](crate::node::Node):
//! 1. The [event loop](event_loop), which owns the consensus library and every piece of durable
//!    state, persists and sends what the library produces, and applies committed entries.
//! 2. The [proposal forwarder](proposals), which serializes this node's own proposals into the event
//!    loop.
//! 3. The transport poller, which steps messages from other members into the event loop.
//! 4. The role handler, which starts and stops the [minter](crate::minter) as leadership changes.
//!
//! [`ProtocolManager`] is the part that other threads call into: the membership operations and
//! read-only queries behind the [administrative API](crate::api).

pub(crate) mod event_loop;

mod membership;

pub(crate) mod proposals;

pub(crate) mod raft_storage;

pub(crate) mod snapshot;

pub mod startup;

pub mod state;

pub use proposals::ProposeError;
pub use startup::StartError;

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use raft::eraftpb::{ConfChange, ConfChangeType};

use crate::api::{ApiError, ClusterInfo};
use crate::chain::Chain;
use crate::minter::Minter;
use crate::networking::network::Transport;
use crate::shutdown::ShutdownSignal;
use crate::types::{
    address::{Address, AddressError, PeerDescriptor},
    data_types::RaftId,
    encoding::VersionedEncoding,
};

use proposals::ProposalHandle;
use state::{NodeInfo, Role, SharedClusterState};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct ProtocolManager<T: Transport> {
    state: SharedClusterState,
    proposals: ProposalHandle,
    transport: Mutex<T>,
}

impl<T: Transport> ProtocolManager<T> {
    pub(crate) fn new(
        state: SharedClusterState,
        proposals: ProposalHandle,
        transport: T,
    ) -> ProtocolManager<T> {
        ProtocolManager {
            state,
            proposals,
            transport: Mutex::new(transport),
        }
    }

    /// Propose adding the node `descriptor` describes as a voter, or as a learner if `is_learner`.
    /// Returns the raft id assigned to it once the proposal is in this node's log.
    pub(crate) fn propose_new_peer(&self, descriptor: &str, is_learner: bool) -> Result<RaftId, ApiError> {
        let me = self.ensure_member()?;
        if self.state.is_learner(me) {
            return Err(ApiError::LearnerCannotAddPeers);
        }

        let descriptor = parse_descriptor(descriptor)?;
        descriptor.validate().map_err(descriptor_error)?;

        let raft_id = self.state.next_raft_id().ok_or(ApiError::RaftIdsExhausted)?;
        let address = Address::new(raft_id, &descriptor).map_err(descriptor_error)?;
        if let Some(existing) = self.state.find_clash(&address) {
            return Err(ApiError::NodeAlreadyInCluster(existing));
        }

        let mut change = ConfChange::default();
        change.set_change_type(if is_learner {
            ConfChangeType::AddLearnerNode
        } else {
            ConfChangeType::AddNode
        });
        change.node_id = raft_id.to_raft();
        change.context = address.encode().into();

        log::info!("Proposing to add {} as member {}", descriptor, raft_id);
        self.proposals.propose_conf_change(change)?;
        Ok(raft_id)
    }

    /// Propose making learner `raft_id` a voter.
    pub(crate) fn promote_to_peer(&self, raft_id: RaftId) -> Result<bool, ApiError> {
        self.ensure_member()?;
        if !self.state.is_learner(raft_id) {
            return Err(ApiError::NotALearner(raft_id));
        }

        let mut change = ConfChange::default();
        change.set_change_type(ConfChangeType::AddNode);
        change.node_id = raft_id.to_raft();

        log::info!("Proposing to promote learner {}", raft_id);
        self.proposals.propose_conf_change(change)?;
        Ok(true)
    }

    pub(crate) fn propose_peer_removal(&self, raft_id: RaftId) -> Result<(), ApiError> {
        let me = self.ensure_member()?;
        if self.state.is_learner(me) && raft_id != me {
            return Err(ApiError::LearnerCannotRemoveOthers);
        }
        if raft_id != me && !self.state.has_peer(raft_id) {
            return Err(ApiError::NodeNotFound);
        }

        let mut change = ConfChange::default();
        change.set_change_type(ConfChangeType::RemoveNode);
        change.node_id = raft_id.to_raft();

        log::info!("Proposing to remove member {}", raft_id);
        self.proposals.propose_conf_change(change)?;
        Ok(())
    }

    pub(crate) fn leader_address(&self) -> Result<Address, ApiError> {
        match self.state.leader() {
            None => Err(ApiError::NoLeaderElected),
            Some(leader) if leader == self.state.raft_id() => Ok(self.state.address()),
            Some(leader) => self
                .state
                .peer(leader)
                .map(|peer| peer.address)
                .ok_or(ApiError::UnknownLeader(leader)),
        }
    }

    pub(crate) fn role(&self) -> Role {
        self.state.role_of(self.state.raft_id())
    }

    pub(crate) fn node_info(&self) -> NodeInfo {
        self.state.node_info()
    }

    /// Every member this node knows of, itself included, in raft id order.
    pub(crate) fn cluster(&self) -> Result<Vec<ClusterInfo>, ApiError> {
        if self.state.leader().is_none() {
            return Err(ApiError::NoLeaderElected);
        }

        let me = self.state.raft_id();
        let transport = self.transport.lock().unwrap();
        let mut members: Vec<Address> = self
            .state
            .peers()
            .into_iter()
            .map(|peer| peer.address)
            .collect();
        members.push(self.state.address());
        members.sort_by_key(|address| address.raft_id);

        Ok(members
            .into_iter()
            .map(|address| {
                let raft_id = address.raft_id;
                ClusterInfo {
                    role: self.state.role_of(raft_id),
                    node_active: raft_id == me || transport.active_since(raft_id).is_some(),
                    address,
                }
            })
            .collect())
    }

    pub(crate) fn fetch_raft_id(&self, descriptor: &str) -> Result<RaftId, ApiError> {
        let descriptor = parse_descriptor(descriptor)?;
        self.state
            .raft_id_of(&descriptor.node_id)
            .ok_or(ApiError::NodeNotFound)
    }

    fn ensure_member(&self) -> Result<RaftId, ApiError> {
        let me = self.state.raft_id();
        if self.state.is_removed(me) {
            return Err(ApiError::NodeRemoved);
        }
        Ok(me)
    }
}

fn parse_descriptor(descriptor: &str) -> Result<PeerDescriptor, ApiError> {
    descriptor.parse().map_err(descriptor_error)
}

fn descriptor_error(err: AddressError) -> ApiError {
    match err {
        AddressError::MissingRaftPort => ApiError::MissingRaftPort,
        err => ApiError::MalformedDescriptor(err),
    }
}

/// Start and stop `minter` as the event loop reports this node gaining (`true`) and losing
/// (`false`) leadership.
pub(crate) fn start_role_handler<C: Chain>(
    minter: Minter<C>,
    role_changes: Receiver<bool>,
    shutdown_signal: ShutdownSignal,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match role_changes.recv_timeout(POLL_INTERVAL) {
            Ok(true) => {
                log::info!("Became leader, starting minter");
                minter.start();
            }
            Ok(false) => {
                if minter.is_minting() {
                    log::info!("Lost leadership, stopping minter");
                    minter.stop();
                }
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
        if shutdown_signal.received() {
            return;
        }
    })
}
