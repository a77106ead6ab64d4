/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable networking.
//!
//! A node talks on two planes: the data-plane [`PeerNetwork`](network::PeerNetwork), which carries
//! blocks and transactions and is owned by the host blockchain client, and the consensus
//! [`Transport`](network::Transport), which carries raft messages between cluster members.
//! [`TcpTransport`](tcp::TcpTransport) is a ready-made consensus transport.

pub mod network;

pub(crate) mod receiving;

pub mod tcp;
