/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events a node reports to user-registered handlers and to the logger.
//!
//! An event for a given action indicates that the action has been completed. Events only report;
//! nothing in the node waits on their handlers.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::{
    address::Address,
    block::Block,
    data_types::{CryptoHash, RaftId},
};

pub enum Event {
    // Events from applying committed entries.
    InsertBlock(InsertBlockEvent),
    SkipBlock(SkipBlockEvent),
    InvalidOrdering(InvalidOrderingEvent),
    // Events from the minter.
    MintBlock(MintBlockEvent),
    ProposeBlock(ProposeBlockEvent),
    // Leadership events.
    BecomeLeader(BecomeLeaderEvent),
    StepDown(StepDownEvent),
    // Membership events.
    AddPeer(AddPeerEvent),
    RemovePeer(RemovePeerEvent),
    // Snapshot events.
    TakeSnapshot(TakeSnapshotEvent),
    ApplySnapshot(ApplySnapshotEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus stops before the threads publishing to it.
            let _ = event_publisher.send(event);
        }
    }
}

/// A committed block was inserted into the chain.
pub struct InsertBlockEvent {
    pub timestamp: SystemTime,
    pub block: Block,
    pub raft_index: u64,
}

/// A committed block was already in the chain, so applying it was a no-op.
pub struct SkipBlockEvent {
    pub timestamp: SystemTime,
    pub block: CryptoHash,
    pub raft_index: u64,
}

/// A committed block did not extend the chain's head and was not inserted.
pub struct InvalidOrderingEvent {
    pub timestamp: SystemTime,
    pub invalid: CryptoHash,
    pub head: CryptoHash,
    pub raft_index: u64,
}

pub struct MintBlockEvent {
    pub timestamp: SystemTime,
    pub block: Block,
}

/// The consensus library accepted a minted block into its log.
pub struct ProposeBlockEvent {
    pub timestamp: SystemTime,
    pub block: CryptoHash,
}

pub struct BecomeLeaderEvent {
    pub timestamp: SystemTime,
    pub term: u64,
}

pub struct StepDownEvent {
    pub timestamp: SystemTime,
    pub leader: Option<RaftId>,
}

pub struct AddPeerEvent {
    pub timestamp: SystemTime,
    pub address: Address,
}

pub struct RemovePeerEvent {
    pub timestamp: SystemTime,
    pub raft_id: RaftId,
}

pub struct TakeSnapshotEvent {
    pub timestamp: SystemTime,
    pub index: u64,
}

pub struct ApplySnapshotEvent {
    pub timestamp: SystemTime,
    pub index: u64,
    pub head: CryptoHash,
}
