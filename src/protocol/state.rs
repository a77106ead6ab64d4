/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! What the coordinator knows about the cluster, shared between the event loop and the
//! administrative API.
//!
//! All access goes through the accessor methods of [`SharedClusterState`], each of which takes the
//! lock for exactly the duration of the call. No method hands out a guard, so the lock can never be
//! held across a call into the minter, the chain, or the network.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use raft::eraftpb::ConfState;

use crate::types::{
    address::Address,
    data_types::{NodeId, RaftId},
};

/// A connected cluster member.
#[derive(Clone, Debug)]
pub struct Peer {
    pub address: Address,
    pub connected_at: SystemTime,
}

/// The role of a cluster member, as shown by the administrative API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The leader, which mints blocks.
    Minter,
    /// A voting follower.
    Verifier,
    /// A non-voting follower.
    Learner,
    /// No leader is known, or the member has been removed.
    None,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Role::Minter => write!(f, "minter"),
            Role::Verifier => write!(f, "verifier"),
            Role::Learner => write!(f, "learner"),
            Role::None => Ok(()),
        }
    }
}

/// A point-in-time copy of the coordinator's view of the cluster.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub cluster_size: usize,
    pub role: Role,
    pub address: Address,
    pub peer_addresses: Vec<Address>,
    pub removed_peers: Vec<RaftId>,
    pub applied_index: u64,
    pub snapshot_index: u64,
}

struct ClusterState {
    address: Address,
    peers: BTreeMap<RaftId, Peer>,
    removed: BTreeSet<RaftId>,
    leader: Option<RaftId>,
    conf_state: ConfState,
    applied_index: u64,
    snapshot_index: u64,
    // Members 1..=bootstrap_size were connected at startup from the bootstrap list.
    bootstrap_size: u16,
}

#[derive(Clone)]
pub(crate) struct SharedClusterState(Arc<RwLock<ClusterState>>);

impl SharedClusterState {
    pub(crate) fn new(address: Address, bootstrap_size: u16) -> SharedClusterState {
        SharedClusterState(Arc::new(RwLock::new(ClusterState {
            address,
            peers: BTreeMap::new(),
            removed: BTreeSet::new(),
            leader: None,
            conf_state: ConfState::default(),
            applied_index: 0,
            snapshot_index: 0,
            bootstrap_size,
        })))
    }

    /* ↓↓↓ Identity ↓↓↓ */

    pub(crate) fn raft_id(&self) -> RaftId {
        self.0.read().unwrap().address.raft_id
    }

    pub(crate) fn address(&self) -> Address {
        self.0.read().unwrap().address.clone()
    }

    pub(crate) fn set_address(&self, address: Address) {
        self.0.write().unwrap().address = address;
    }

    pub(crate) fn is_bootstrap_id(&self, raft_id: RaftId) -> bool {
        let bootstrap_size = self.0.read().unwrap().bootstrap_size;
        (1..=bootstrap_size).contains(&raft_id.int())
    }

    /* ↓↓↓ Peers ↓↓↓ */

    pub(crate) fn peer(&self, raft_id: RaftId) -> Option<Peer> {
        self.0.read().unwrap().peers.get(&raft_id).cloned()
    }

    pub(crate) fn peers(&self) -> Vec<Peer> {
        self.0.read().unwrap().peers.values().cloned().collect()
    }

    pub(crate) fn has_peer(&self, raft_id: RaftId) -> bool {
        self.0.read().unwrap().peers.contains_key(&raft_id)
    }

    pub(crate) fn insert_peer(&self, address: Address) {
        self.0.write().unwrap().peers.insert(
            address.raft_id,
            Peer {
                address,
                connected_at: SystemTime::now(),
            },
        );
    }

    pub(crate) fn remove_peer(&self, raft_id: RaftId) -> Option<Peer> {
        self.0.write().unwrap().peers.remove(&raft_id)
    }

    /// One more than the highest raft id ever seen. Ids are never reused.
    pub(crate) fn next_raft_id(&self) -> Option<RaftId> {
        let state = self.0.read().unwrap();
        let highest = state
            .peers
            .keys()
            .chain(state.removed.iter())
            .copied()
            .fold(state.address.raft_id, RaftId::max);
        highest.int().checked_add(1).map(RaftId::new)
    }

    /// The member, if any, this node or one of its peers already is that clashes with `candidate`:
    /// same node id, or same host with the same p2p or raft port.
    pub(crate) fn find_clash(&self, candidate: &Address) -> Option<RaftId> {
        let state = self.0.read().unwrap();
        std::iter::once(&state.address)
            .chain(state.peers.values().map(|peer| &peer.address))
            .find(|member| {
                member.node_id == candidate.node_id
                    || (member.host == candidate.host
                        && (member.p2p_port == candidate.p2p_port
                            || member.raft_port == candidate.raft_port))
            })
            .map(|member| member.raft_id)
    }

    pub(crate) fn raft_id_of(&self, node_id: &NodeId) -> Option<RaftId> {
        let state = self.0.read().unwrap();
        std::iter::once(&state.address)
            .chain(state.peers.values().map(|peer| &peer.address))
            .find(|member| member.node_id == *node_id)
            .map(|member| member.raft_id)
    }

    /* ↓↓↓ Removed members ↓↓↓ */

    pub(crate) fn is_removed(&self, raft_id: RaftId) -> bool {
        self.0.read().unwrap().removed.contains(&raft_id)
    }

    pub(crate) fn mark_removed(&self, raft_id: RaftId) {
        self.0.write().unwrap().removed.insert(raft_id);
    }

    pub(crate) fn removed(&self) -> Vec<RaftId> {
        self.0.read().unwrap().removed.iter().copied().collect()
    }

    /* ↓↓↓ Leadership and roles ↓↓↓ */

    pub(crate) fn leader(&self) -> Option<RaftId> {
        self.0.read().unwrap().leader
    }

    pub(crate) fn set_leader(&self, leader: Option<RaftId>) {
        self.0.write().unwrap().leader = leader;
    }

    pub(crate) fn is_learner(&self, raft_id: RaftId) -> bool {
        self.0
            .read()
            .unwrap()
            .conf_state
            .learners
            .contains(&raft_id.to_raft())
    }

    /// The role of member `raft_id` as seen from this node.
    pub(crate) fn role_of(&self, raft_id: RaftId) -> Role {
        let state = self.0.read().unwrap();
        if state.removed.contains(&raft_id) || state.leader.is_none() {
            Role::None
        } else if state.leader == Some(raft_id) {
            Role::Minter
        } else if state.conf_state.learners.contains(&raft_id.to_raft()) {
            Role::Learner
        } else {
            Role::Verifier
        }
    }

    pub(crate) fn conf_state(&self) -> ConfState {
        self.0.read().unwrap().conf_state.clone()
    }

    pub(crate) fn set_conf_state(&self, conf_state: ConfState) {
        self.0.write().unwrap().conf_state = conf_state;
    }

    /* ↓↓↓ Indices ↓↓↓ */

    pub(crate) fn applied_index(&self) -> u64 {
        self.0.read().unwrap().applied_index
    }

    pub(crate) fn set_applied_index(&self, applied_index: u64) {
        self.0.write().unwrap().applied_index = applied_index;
    }

    pub(crate) fn snapshot_index(&self) -> u64 {
        self.0.read().unwrap().snapshot_index
    }

    pub(crate) fn set_snapshot_index(&self, snapshot_index: u64) {
        self.0.write().unwrap().snapshot_index = snapshot_index;
    }

    pub(crate) fn node_info(&self) -> NodeInfo {
        let role = self.role_of(self.raft_id());
        let state = self.0.read().unwrap();
        NodeInfo {
            cluster_size: state.peers.len() + 1,
            role,
            address: state.address.clone(),
            peer_addresses: state.peers.values().map(|peer| peer.address.clone()).collect(),
            removed_peers: state.removed.iter().copied().collect(),
            applied_index: state.applied_index,
            snapshot_index: state.snapshot_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::address::PeerDescriptor;

    fn address(raft_id: u16, host: &str, p2p_port: u16, raft_port: u16) -> Address {
        let descriptor = PeerDescriptor {
            node_id: NodeId::new([raft_id as u8; 32]),
            host: host.to_string(),
            p2p_port,
            raft_port: Some(raft_port),
        };
        Address::new(RaftId::new(raft_id), &descriptor).unwrap()
    }

    #[test]
    fn next_raft_id_skips_removed_ids() {
        let state = SharedClusterState::new(address(2, "10.0.0.2", 30303, 50400), 3);
        state.insert_peer(address(1, "10.0.0.1", 30303, 50400));
        state.insert_peer(address(3, "10.0.0.3", 30303, 50400));
        assert_eq!(state.next_raft_id(), Some(RaftId::new(4)));

        state.mark_removed(RaftId::new(7));
        assert_eq!(state.next_raft_id(), Some(RaftId::new(8)));
        assert!(state.is_removed(RaftId::new(7)));
        assert!(!state.has_peer(RaftId::new(7)));
    }

    #[test]
    fn clashes_on_node_id_or_shared_port() {
        let state = SharedClusterState::new(address(1, "10.0.0.1", 30303, 50400), 1);
        state.insert_peer(address(2, "10.0.0.2", 30303, 50400));

        assert_eq!(state.find_clash(&address(1, "10.0.0.9", 1, 2)), Some(RaftId::new(1)));
        assert_eq!(state.find_clash(&address(9, "10.0.0.2", 30303, 2)), Some(RaftId::new(2)));
        assert_eq!(state.find_clash(&address(9, "10.0.0.2", 1, 50400)), Some(RaftId::new(2)));
        assert_eq!(state.find_clash(&address(9, "10.0.0.2", 1, 2)), None);
    }

    #[test]
    fn roles_follow_leader_and_conf_state() {
        let state = SharedClusterState::new(address(1, "10.0.0.1", 30303, 50400), 2);
        assert_eq!(state.role_of(RaftId::new(1)), Role::None);

        let mut conf_state = ConfState::default();
        conf_state.voters = vec![1, 2];
        conf_state.learners = vec![3];
        state.set_conf_state(conf_state);
        state.set_leader(Some(RaftId::new(2)));

        assert_eq!(state.role_of(RaftId::new(1)), Role::Verifier);
        assert_eq!(state.role_of(RaftId::new(2)), Role::Minter);
        assert_eq!(state.role_of(RaftId::new(3)), Role::Learner);
        assert_eq!(Role::Learner.to_string(), "learner");
        assert_eq!(Role::None.to_string(), "");

        state.mark_removed(RaftId::new(3));
        assert_eq!(state.role_of(RaftId::new(3)), Role::None);
    }
}
