/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Taking and applying snapshots.
//!
//! A snapshot records what a member needs to rejoin the cluster after the log prefix it covers is
//! gone: every member's address, every id ever removed, and the hash of the chain head at the
//! snapshot's index. Blocks themselves are not in the snapshot; a member that lacks the head block
//! downloads the chain from a peer.

use std::time::{Duration, SystemTime};

use borsh::{BorshDeserialize, BorshSerialize};
use rand::seq::SliceRandom;
use raft::eraftpb::Snapshot;

use crate::chain::Chain;
use crate::events::{ApplySnapshotEvent, Event, TakeSnapshotEvent};
use crate::networking::network::{PeerNetwork, Transport};
use crate::persistence::{pluggables::KVStore, wal::WalSnapshot};
use crate::types::{
    address::Address,
    data_types::{CryptoHash, RaftId},
    encoding::VersionedEncoding,
};

use super::event_loop::{fatal, Coordinator};
use super::state::SharedClusterState;

const SYNC_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// The `data` of every snapshot.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub(crate) struct SnapshotPayload {
    /// Sorted by raft id, this node included.
    pub(crate) addresses: Vec<Address>,
    /// Sorted.
    pub(crate) removed_raft_ids: Vec<RaftId>,
    pub(crate) head_block_hash: CryptoHash,
}

impl VersionedEncoding for SnapshotPayload {
    const VERSION: u8 = 1;
}

impl SnapshotPayload {
    pub(crate) fn build(state: &SharedClusterState, head_block_hash: CryptoHash) -> SnapshotPayload {
        let mut addresses: Vec<Address> = state.peers().into_iter().map(|peer| peer.address).collect();
        addresses.push(state.address());
        addresses.sort_by_key(|address| address.raft_id);

        SnapshotPayload {
            addresses,
            removed_raft_ids: state.removed(),
            head_block_hash,
        }
    }
}

impl<C: Chain, K: KVStore, T: Transport, N: PeerNetwork> Coordinator<C, K, T, N> {
    /// Snapshot the cluster as of applied entry `index` (of `term`), persist it, and compact the log.
    pub(super) fn trigger_snapshot(&mut self, index: u64, term: u64) {
        log::info!("{}: taking snapshot at index {}", self.state.raft_id(), index);

        let payload = SnapshotPayload::build(&self.state, self.chain.current_block().hash());
        let snapshot = match self.storage.create_snapshot(
            index,
            term,
            self.state.conf_state(),
            payload.encode(),
        ) {
            Ok(snapshot) => snapshot,
            Err(err) => fatal("failed to create snapshot", err),
        };
        self.save_snapshot(&snapshot);
        self.state.set_snapshot_index(index);

        Event::publish(
            &self.event_publisher,
            Event::TakeSnapshot(TakeSnapshotEvent {
                timestamp: SystemTime::now(),
                index,
            }),
        );
    }

    pub(super) fn maybe_trigger_snapshot(&mut self) {
        let applied_index = self.state.applied_index();
        if applied_index.saturating_sub(self.state.snapshot_index()) < self.snapshot_period {
            return;
        }
        match raft::Storage::term(&self.storage, applied_index) {
            Ok(term) => self.trigger_snapshot(applied_index, term),
            Err(err) => log::warn!("Cannot snapshot at {}: {}", applied_index, err),
        }
    }

    // WAL marker first, so that a WAL replay never starts from a snapshot that does not exist.
    pub(super) fn save_snapshot(&mut self, snapshot: &Snapshot) {
        let metadata = snapshot.get_metadata();
        let marker = WalSnapshot {
            index: metadata.index,
            term: metadata.term,
        };
        if let Err(err) = self.wal.save_snapshot(marker) {
            fatal("failed to record snapshot in the WAL", err);
        }
        if let Err(err) = self.snapshotter.save(snapshot) {
            fatal("failed to save snapshot", err);
        }
        self.release_log();
    }

    // Drop the WAL prefix and the snapshot files that no snapshot still on disk needs. Failing to is
    // not fatal: the log only stays longer.
    fn release_log(&mut self) {
        match self.wal.release() {
            Ok(Some(kept)) => {
                if let Err(err) = self.snapshotter.release_before(kept.index) {
                    log::warn!("Failed to delete snapshots older than {}: {}", kept.index, err);
                }
            }
            Ok(None) => (),
            Err(err) => log::warn!("Failed to compact the WAL: {}", err),
        }
    }

    /// Handle a snapshot sent by the leader: persist it, install it, and catch the chain up to it.
    pub(super) fn on_snapshot(&mut self, snapshot: Snapshot) {
        let index = snapshot.get_metadata().index;
        log::info!("{}: applying snapshot at index {}", self.state.raft_id(), index);

        self.save_snapshot(&snapshot);
        if let Err(err) = self.storage.apply_snapshot(snapshot.clone()) {
            fatal("failed to apply snapshot to raft storage", err);
        }

        let payload = decode_payload(&snapshot);
        self.state
            .set_conf_state(snapshot.get_metadata().get_conf_state().clone());
        self.update_cluster_membership(&payload);
        self.sync_chain_to(&payload.head_block_hash);

        self.state.set_snapshot_index(index);
        self.advance_applied_index(index);

        Event::publish(
            &self.event_publisher,
            Event::ApplySnapshot(ApplySnapshotEvent {
                timestamp: SystemTime::now(),
                index,
                head: payload.head_block_hash,
            }),
        );
    }

    /// Bring the peer set in line with `payload`: adopt this node's own address, connect members
    /// not yet connected, and tombstone removed members.
    pub(super) fn update_cluster_membership(&mut self, payload: &SnapshotPayload) {
        let me = self.state.raft_id();

        for removed in &payload.removed_raft_ids {
            if *removed == me {
                log::warn!("{}: this node was removed from the cluster", me);
                self.exit_after_applying = true;
            }
            self.state.mark_removed(*removed);
            self.disconnect_peer(*removed);
        }

        for address in &payload.addresses {
            if address.raft_id == me {
                self.state.set_address(address.clone());
            } else if !self.state.has_peer(address.raft_id) && !self.state.is_removed(address.raft_id) {
                self.connect_peer(address.clone());
            }
        }
    }

    // Blocks until the chain has `head`, retrying with a random peer, unless shutdown intervenes.
    fn sync_chain_to(&mut self, head: &CryptoHash) {
        while !self.chain.has_block(head) {
            let peers = self.state.peers();
            let live: Vec<_> = peers
                .iter()
                .filter(|peer| self.transport.active_since(peer.address.raft_id).is_some())
                .collect();
            let candidates = if live.is_empty() {
                peers.iter().collect()
            } else {
                live
            };

            match candidates.choose(&mut rand::thread_rng()) {
                Some(peer) => {
                    log::info!("Synchronising chain to {} from {}", head, peer.address.raft_id);
                    if let Err(err) = self.chain.synchronise(&peer.address, head) {
                        log::warn!("Chain synchronisation failed: {}", err);
                    }
                }
                None => log::warn!("No peer to synchronise chain to {} from", head),
            }

            if self.chain.has_block(head) || self.shutdown_signal.wait(SYNC_RETRY_INTERVAL) {
                return;
            }
        }
    }
}

pub(super) fn decode_payload(snapshot: &Snapshot) -> SnapshotPayload {
    match SnapshotPayload::decode(&snapshot.data) {
        Ok(payload) => payload,
        Err(err) => fatal("undecodable snapshot payload", err),
    }
}
