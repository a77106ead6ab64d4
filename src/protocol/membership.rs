/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Applying committed membership changes.
//!
//! Removal is permanent: a removed id is tombstoned, never reconnected, and never handed out again.
//! Every change that alters who this node talks to is followed by a forced snapshot before the
//! applied index moves past it, so that a restart always recovers the right peer set.

use std::time::SystemTime;

use raft::eraftpb::{ConfChange, ConfChangeType};

use crate::chain::Chain;
use crate::events::{AddPeerEvent, Event, RemovePeerEvent};
use crate::networking::network::{PeerNetwork, Transport};
use crate::persistence::pluggables::KVStore;
use crate::types::{address::Address, data_types::RaftId, encoding::VersionedEncoding};

use super::event_loop::{fatal, Coordinator};

impl<C: Chain, K: KVStore, T: Transport, N: PeerNetwork> Coordinator<C, K, T, N> {
    pub(super) fn apply_conf_change(&mut self, index: u64, term: u64, change: ConfChange) {
        let Some(raft_id) = RaftId::from_raft(change.node_id) else {
            log::warn!("Ignoring membership change for invalid id {} at {}", change.node_id, index);
            return;
        };

        match self.raw_node.apply_conf_change(&change) {
            Ok(conf_state) => self.state.set_conf_state(conf_state),
            Err(err) => {
                log::error!("Failed to apply membership change at {}: {}", index, err);
                return;
            }
        }

        match change.get_change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                if self.state.is_removed(raft_id) {
                    log::info!("Ignoring add of permanently removed member {}", raft_id);
                    return;
                }

                if raft_id == self.state.raft_id() || self.state.has_peer(raft_id) {
                    if self.state.is_bootstrap_id(raft_id) {
                        log::debug!("Member {} is already connected from the bootstrap list", raft_id);
                    } else {
                        log::info!("Member {} promoted to voter", raft_id);
                    }
                } else {
                    let address = match Address::decode(&change.context) {
                        Ok(address) => address,
                        Err(err) => fatal("undecodable address in membership change", err),
                    };
                    self.connect_peer(address);
                }
            }
            ConfChangeType::RemoveNode => {
                if self.state.is_removed(raft_id) {
                    log::info!("Ignoring removal of already removed member {}", raft_id);
                    return;
                }

                log::info!("Removing member {} at index {}", raft_id, index);
                if raft_id == self.state.raft_id() {
                    self.exit_after_applying = true;
                }
                self.state.mark_removed(raft_id);
                self.disconnect_peer(raft_id);
                Event::publish(
                    &self.event_publisher,
                    Event::RemovePeer(RemovePeerEvent {
                        timestamp: SystemTime::now(),
                        raft_id,
                    }),
                );
            }
        }

        // Persist the new peer set before the applied index moves past this change.
        self.trigger_snapshot(index, term);
    }

    pub(super) fn connect_peer(&mut self, address: Address) {
        log::info!(
            "{}: connecting to member {} at {}:{}",
            self.state.raft_id(),
            address.raft_id,
            address.host,
            address.raft_port
        );
        self.transport.add_peer(&address);
        self.peer_network.add_peer(&address);
        self.state.insert_peer(address.clone());

        Event::publish(
            &self.event_publisher,
            Event::AddPeer(AddPeerEvent {
                timestamp: SystemTime::now(),
                address,
            }),
        );
    }

    pub(super) fn disconnect_peer(&mut self, raft_id: RaftId) {
        if let Some(peer) = self.state.remove_peer(raft_id) {
            self.transport.remove_peer(raft_id);
            self.peer_network.remove_peer(&peer.address);
        }
    }
}
