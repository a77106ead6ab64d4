/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::fmt::{self, Display, Formatter};
use std::time::SystemTime;

use raft::eraftpb::Message;

use crate::types::{address::Address, data_types::RaftId};

/// The host client's data-plane p2p network. The node tells it which cluster members to keep
/// connections to, so that blocks reach every member.
pub trait PeerNetwork: Clone + Send + 'static {
    /// Keep a connection to `address` open, reconnecting when it drops.
    fn add_peer(&mut self, address: &Address);

    /// Stop connecting to `address` and drop existing connections.
    fn remove_peer(&mut self, address: &Address);
}

/// Carries raft messages between cluster members.
pub trait Transport: Clone + Send + 'static {
    /// Start delivering messages to the member at `address`.
    fn add_peer(&mut self, address: &Address);

    /// Stop delivering messages to `raft_id` and forget it.
    fn remove_peer(&mut self, raft_id: RaftId);

    /// Send a message to the member named in `message.to` without blocking. An `Err` means the
    /// message certainly did not leave this node; an `Ok` promises nothing about delivery.
    fn send(&mut self, message: Message) -> Result<(), TransportError>;

    /// Receive a message from any member. Returns immediately with a None if no message is available now.
    fn recv(&mut self) -> Option<Message>;

    /// When the transport most recently established a working connection to `raft_id`, or None if
    /// it currently has none.
    fn active_since(&self, raft_id: RaftId) -> Option<SystemTime>;
}

#[derive(Debug)]
pub enum TransportError {
    /// `to` is not a valid member id, or the transport has no route to it.
    UnknownPeer(u64),
    /// The outbound queue to the member is full.
    Backlogged(RaftId),
    /// The connection to the member is gone.
    Disconnected(RaftId),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::UnknownPeer(to) => write!(f, "no route to raft member {}", to),
            TransportError::Backlogged(raft_id) => write!(f, "outbound queue to {} is full", raft_id),
            TransportError::Disconnected(raft_id) => write!(f, "connection to {} is gone", raft_id),
        }
    }
}

impl std::error::Error for TransportError {}
