/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event loop: the one thread that drives the consensus library and applies what it commits.
//!
//! The loop owns the [`RawNode`] and every piece of durable state (WAL, snapshotter, applied index
//! store). Each iteration it feeds in one input (a local proposal or a message from a peer), ticks
//! the raft clock when a tick interval has passed, and then processes at most one ready batch.
//!
//! ## Processing a ready batch
//!
//! 1. Note leadership changes and tell the role handler.
//! 2. Write the hard state and new entries to the WAL, fsynced.
//! 3. Save and apply an incoming snapshot, if any.
//! 4. Append the new entries and hard state to volatile storage.
//! 5. Send outbound messages.
//! 6. Apply committed entries in log order, persisting the applied index after each.
//! 7. Advance the raw node, then handle the resulting light ready the same way.
//! 8. Take a periodic snapshot if enough entries were applied since the last one.
//!
//! Only then is the next batch considered.

use std::slice;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant, SystemTime};

use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, Entry, EntryType, HardState, Message, MessageType, Snapshot};
use raft::{RawNode, SnapshotStatus, StateRole};

use crate::chain::{Chain, ChainError};
use crate::events::*;
use crate::minter::MinterEvent;
use crate::networking::network::{PeerNetwork, Transport};
use crate::persistence::{
    applied_index::write_applied_index, pluggables::KVStore, snapshotter::Snapshotter, wal::Wal,
};
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::types::{block::Block, data_types::RaftId, encoding::VersionedEncoding};

use super::proposals::{Accepted, ProposeError};
use super::raft_storage::RaftStorage;
use super::state::SharedClusterState;

/// What the event loop reacts to besides the passage of time.
pub(crate) enum RaftInput {
    Propose { data: Vec<u8>, accepted: Accepted },
    ProposeConfChange { change: ConfChange, accepted: Accepted },
    Step(Message),
}

impl From<Message> for RaftInput {
    fn from(msg: Message) -> Self {
        RaftInput::Step(msg)
    }
}

/// Whether the event loop carries on after a ready batch.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Exit,
}

pub(crate) struct Coordinator<C: Chain, K: KVStore, T: Transport, N: PeerNetwork> {
    pub(super) raw_node: RawNode<RaftStorage>,
    pub(super) storage: RaftStorage,
    pub(super) wal: Wal,
    pub(super) snapshotter: Snapshotter,
    pub(super) kv_store: K,
    pub(super) chain: C,
    pub(super) transport: T,
    pub(super) peer_network: N,
    pub(super) state: SharedClusterState,
    pub(super) to_minter: Sender<MinterEvent>,
    pub(super) to_role_handler: Sender<bool>,
    pub(super) event_publisher: Option<Sender<Event>>,
    pub(super) snapshot_period: u64,
    pub(super) shutdown: Shutdown,
    pub(super) shutdown_signal: ShutdownSignal,
    pub(super) is_leader: bool,
    // Set when an entry removing this node is applied.
    pub(super) exit_after_applying: bool,
}

/// Log `context` and `err`, then panic. For conditions that mean on-disk corruption or a broken
/// invariant between the consensus library and the chain.
pub(crate) fn fatal(context: &str, err: impl std::fmt::Display) -> ! {
    log::error!("{}: {}", context, err);
    panic!("{}: {}", context, err)
}

impl<C: Chain, K: KVStore, T: Transport, N: PeerNetwork> Coordinator<C, K, T, N> {
    pub(crate) fn run(mut self, inputs: Receiver<RaftInput>, tick_interval: Duration) {
        let mut last_tick = Instant::now();
        loop {
            if self.shutdown_signal.received() {
                return;
            }

            let timeout = tick_interval.saturating_sub(last_tick.elapsed());
            match inputs.recv_timeout(timeout) {
                Ok(input) => self.on_input(input),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }

            if last_tick.elapsed() >= tick_interval {
                self.raw_node.tick();
                last_tick = Instant::now();
            }

            if self.on_ready() == Flow::Exit {
                if self.exit_after_applying {
                    log::info!("{}: removed from the cluster, shutting down", self.state.raft_id());
                } else {
                    log::info!("{}: chain is shutting down, stopping the event loop", self.state.raft_id());
                }
                self.shutdown.trigger();
                return;
            }
        }
    }

    fn on_input(&mut self, input: RaftInput) {
        match input {
            RaftInput::Propose { data, accepted } => {
                let result = self
                    .raw_node
                    .propose(Vec::new(), data)
                    .map_err(|_| ProposeError::Dropped);
                let _ = accepted.send(result);
            }
            RaftInput::ProposeConfChange { change, accepted } => {
                let result = self
                    .raw_node
                    .propose_conf_change(Vec::new(), change)
                    .map_err(|err| match err {
                        raft::Error::ProposalDropped => ProposeError::Dropped,
                        err => ProposeError::InvalidConfChange(err.to_string()),
                    });
                let _ = accepted.send(result);
            }
            RaftInput::Step(msg) => {
                if let Some(from) = RaftId::from_raft(msg.from) {
                    if self.state.is_removed(from) {
                        log::debug!("Ignoring message from removed member {}", from);
                        return;
                    }
                }
                if let Err(err) = self.raw_node.step(msg) {
                    log::debug!("Failed to step message: {}", err);
                }
            }
        }
    }

    /// Process one ready batch, if the raw node has one.
    pub(crate) fn on_ready(&mut self) -> Flow {
        if !self.raw_node.has_ready() {
            return Flow::Continue;
        }
        let mut ready = self.raw_node.ready();

        if let Some(soft_state) = ready.ss() {
            self.on_soft_state(soft_state.leader_id, soft_state.raft_state);
        }

        if ready.hs().is_some() || !ready.entries().is_empty() {
            if let Err(err) = self.wal.save(ready.hs(), ready.entries()) {
                fatal("failed to write to the WAL", err);
            }
        }

        if *ready.snapshot() != Snapshot::default() {
            let snapshot = ready.snapshot().clone();
            self.on_snapshot(snapshot);
        }

        if let Err(err) = self.storage.append(ready.entries()) {
            fatal("failed to append entries to raft storage", err);
        }
        if let Some(hard_state) = ready.hs() {
            self.storage.set_hard_state(hard_state.clone());
        }

        self.send_messages(ready.take_messages());
        self.send_messages(ready.take_persisted_messages());

        let mut flow = self.apply_committed(ready.take_committed_entries());
        // A snapshot can also tell this node that it was removed.
        if self.exit_after_applying {
            flow = Flow::Exit;
        }

        let mut light_ready = self.raw_node.advance(ready);
        if let Some(commit) = light_ready.commit_index() {
            self.storage.set_commit(commit);
            let hard_state: HardState = self.storage.hard_state();
            if let Err(err) = self.wal.save(Some(&hard_state), &[]) {
                fatal("failed to write to the WAL", err);
            }
        }
        self.send_messages(light_ready.take_messages());
        if flow == Flow::Continue {
            flow = self.apply_committed(light_ready.take_committed_entries());
        }

        if flow == Flow::Continue {
            self.maybe_trigger_snapshot();
        }
        self.raw_node.advance_apply();
        flow
    }

    fn on_soft_state(&mut self, leader_id: u64, raft_state: StateRole) {
        let leader = RaftId::from_raft(leader_id);
        self.state.set_leader(leader);

        let is_leader = raft_state == StateRole::Leader;
        if is_leader == self.is_leader {
            return;
        }
        self.is_leader = is_leader;
        let _ = self.to_role_handler.send(is_leader);

        if is_leader {
            Event::publish(
                &self.event_publisher,
                Event::BecomeLeader(BecomeLeaderEvent {
                    timestamp: SystemTime::now(),
                    term: self.raw_node.raft.term,
                }),
            );
        } else {
            Event::publish(
                &self.event_publisher,
                Event::StepDown(StepDownEvent {
                    timestamp: SystemTime::now(),
                    leader,
                }),
            );
        }
    }

    // Each message is handed to the transport once. The consensus library retransmits.
    fn send_messages(&mut self, msgs: Vec<Message>) {
        for msg in msgs {
            let to = msg.to;
            let is_snapshot = msg.get_msg_type() == MessageType::MsgSnapshot;
            if let Err(err) = self.transport.send(msg) {
                log::debug!("Failed to send to {}: {}", to, err);
                self.raw_node.report_unreachable(to);
                if is_snapshot {
                    log::warn!("Failed to send snapshot to {}", to);
                    self.raw_node.report_snapshot(to, SnapshotStatus::Failure);
                }
            }
        }
    }

    /// Apply `entries` in order. Stops early, returning [`Flow::Exit`], once this node's own removal
    /// is applied or the chain refuses blocks because it is shutting down.
    fn apply_committed(&mut self, entries: Vec<Entry>) -> Flow {
        for entry in entries {
            if entry.index <= self.state.applied_index() {
                continue;
            }

            match entry.get_entry_type() {
                EntryType::EntryNormal => {
                    if self.apply_normal(&entry).is_err() {
                        log::info!("Chain stopped accepting blocks at index {}", entry.index);
                        return Flow::Exit;
                    }
                }
                EntryType::EntryConfChange => {
                    let mut change = ConfChange::default();
                    if let Err(err) = change.merge_from_bytes(&entry.data) {
                        fatal("undecodable membership change in committed entry", err);
                    }
                    self.apply_conf_change(entry.index, entry.term, change);
                }
                EntryType::EntryConfChangeV2 => {
                    log::warn!("Ignoring unsupported joint membership change at {}", entry.index);
                }
            }

            self.advance_applied_index(entry.index);
            if self.exit_after_applying {
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    // Errs only if the chain aborted the insert.
    fn apply_normal(&mut self, entry: &Entry) -> Result<(), ChainError> {
        // Empty entries are appended by new leaders.
        if entry.data.is_empty() {
            return Ok(());
        }

        let block = match Block::decode(&entry.data) {
            Ok(block) => block,
            Err(err) => fatal("undecodable block in committed entry", err),
        };
        let hash = block.hash();

        if self.chain.has_block(&hash) {
            log::warn!("Not applying already-applied block {} at index {}", hash, entry.index);
            Event::publish(
                &self.event_publisher,
                Event::SkipBlock(SkipBlockEvent {
                    timestamp: SystemTime::now(),
                    block: hash,
                    raft_index: entry.index,
                }),
            );
            return Ok(());
        }

        let head = self.chain.current_block();
        if block.parent_hash() != head.hash() {
            log::warn!(
                "Non-extending block {} (parent is {}; current head is {})",
                hash,
                block.parent_hash(),
                head.hash()
            );
            let head_hash = head.hash();
            let _ = self.to_minter.send(MinterEvent::InvalidOrdering {
                head,
                invalid: hash,
            });
            Event::publish(
                &self.event_publisher,
                Event::InvalidOrdering(InvalidOrderingEvent {
                    timestamp: SystemTime::now(),
                    invalid: hash,
                    head: head_hash,
                    raft_index: entry.index,
                }),
            );
            return Ok(());
        }

        if let Err(err) = self.chain.validate_body(&block) {
            fatal(&format!("failed to validate committed block {}", hash), err);
        }
        match self.chain.insert_chain(slice::from_ref(&block)) {
            Ok(()) => (),
            Err(ChainError::Aborted) => return Err(ChainError::Aborted),
            Err(err) => fatal(&format!("failed to extend chain with {}", hash), err),
        }
        log::debug!("Extended chain with {} at index {}", hash, entry.index);

        let _ = self.to_minter.send(MinterEvent::NewHead(block.clone()));
        Event::publish(
            &self.event_publisher,
            Event::InsertBlock(InsertBlockEvent {
                timestamp: SystemTime::now(),
                block,
                raft_index: entry.index,
            }),
        );
        Ok(())
    }

    pub(super) fn advance_applied_index(&mut self, index: u64) {
        if index <= self.state.applied_index() {
            return;
        }
        if let Err(err) = write_applied_index(&mut self.kv_store, index) {
            fatal("failed to persist the applied index", err);
        }
        self.state.set_applied_index(index);
    }
}
