/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The administrative API: membership changes and cluster queries, for an operator or an RPC layer
//! to call.
//!
//! Members are named by [`RaftId`] and described to the outside world by their `enode://`
//! [descriptor](crate::types::address::PeerDescriptor).

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use crate::networking::network::Transport;
use crate::protocol::state::{NodeInfo, Role};
use crate::protocol::{ProposeError, ProtocolManager};
use crate::types::{
    address::{Address, AddressError},
    data_types::RaftId,
};

/// One member of the cluster, as [`RaftApi::cluster`] reports it.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    pub address: Address,
    pub role: Role,
    /// Whether the consensus transport currently has a live connection to the member. Always true
    /// for the node answering the query.
    pub node_active: bool,
}

pub struct RaftApi<T: Transport> {
    manager: Arc<ProtocolManager<T>>,
}

impl<T: Transport> Clone for RaftApi<T> {
    fn clone(&self) -> Self {
        RaftApi {
            manager: self.manager.clone(),
        }
    }
}

impl<T: Transport> RaftApi<T> {
    pub(crate) fn new(manager: ProtocolManager<T>) -> RaftApi<T> {
        RaftApi {
            manager: Arc::new(manager),
        }
    }

    /// `"minter"`, `"verifier"`, `"learner"`, or `""` if no leader is known or this node was removed.
    pub fn role(&self) -> String {
        self.manager.role().to_string()
    }

    /// Add the node described by the `enode://` URL `descriptor` as a voter. Returns once the
    /// change is in this node's log.
    pub fn add_peer(&self, descriptor: &str) -> Result<RaftId, ApiError> {
        self.manager.propose_new_peer(descriptor, false)
    }

    pub fn add_learner(&self, descriptor: &str) -> Result<RaftId, ApiError> {
        self.manager.propose_new_peer(descriptor, true)
    }

    pub fn promote_to_peer(&self, raft_id: RaftId) -> Result<bool, ApiError> {
        self.manager.promote_to_peer(raft_id)
    }

    pub fn remove_peer(&self, raft_id: RaftId) -> Result<(), ApiError> {
        self.manager.propose_peer_removal(raft_id)
    }

    /// The `enode://` URL of the current leader.
    pub fn leader(&self) -> Result<String, ApiError> {
        Ok(self.manager.leader_address()?.descriptor().to_string())
    }

    pub fn cluster(&self) -> Result<Vec<ClusterInfo>, ApiError> {
        self.manager.cluster()
    }

    pub fn get_raft_id(&self, descriptor: &str) -> Result<RaftId, ApiError> {
        self.manager.fetch_raft_id(descriptor)
    }

    pub fn node_info(&self) -> NodeInfo {
        self.manager.node_info()
    }
}

#[derive(Debug)]
pub enum ApiError {
    NoLeaderElected,
    /// The leader is not among this node's peers yet.
    UnknownLeader(RaftId),
    NodeAlreadyInCluster(RaftId),
    NotALearner(RaftId),
    MalformedDescriptor(AddressError),
    MissingRaftPort,
    LearnerCannotAddPeers,
    LearnerCannotRemoveOthers,
    /// This node was removed from the cluster.
    NodeRemoved,
    NodeNotFound,
    RaftIdsExhausted,
    ProposalRejected(ProposeError),
    ProposalChannelClosed,
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::NoLeaderElected => write!(f, "no leader is currently elected"),
            ApiError::UnknownLeader(raft_id) => write!(f, "unknown leader {}", raft_id),
            ApiError::NodeAlreadyInCluster(raft_id) => {
                write!(f, "node is already in the cluster as member {}", raft_id)
            }
            ApiError::NotALearner(raft_id) => write!(f, "member {} is not a learner", raft_id),
            ApiError::MalformedDescriptor(err) => write!(f, "invalid node url: {}", err),
            ApiError::MissingRaftPort => write!(f, "node url must specify a raftport"),
            ApiError::LearnerCannotAddPeers => write!(f, "learner cannot add peers"),
            ApiError::LearnerCannotRemoveOthers => write!(f, "learner cannot remove other peers"),
            ApiError::NodeRemoved => write!(f, "node is not in the cluster"),
            ApiError::NodeNotFound => write!(f, "node not found in the cluster"),
            ApiError::RaftIdsExhausted => write!(f, "no raft ids left to assign"),
            ApiError::ProposalRejected(err) => write!(f, "proposal rejected: {}", err),
            ApiError::ProposalChannelClosed => write!(f, "proposal channel closed"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<ProposeError> for ApiError {
    fn from(err: ProposeError) -> Self {
        match err {
            ProposeError::Stopped => ApiError::ProposalChannelClosed,
            err => ApiError::ProposalRejected(err),
        }
    }
}
