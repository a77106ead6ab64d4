/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Raft-based block ordering for permissioned blockchains.
//!
//! A fixed, known set of nodes orders blocks with Raft. The current leader [mints](minter) blocks
//! out of the pending transactions in its pool and proposes them; every node applies the blocks
//! Raft commits to its [chain](chain::Chain) in log order. The [protocol] module drives Raft and
//! persists what it needs to survive crashes ([persistence]), and [node] wires everything together.

pub mod api;

pub mod chain;

pub(crate) mod event_bus;

pub mod events;

pub mod logging;

pub(crate) mod minter;

pub mod networking;

pub mod node;

pub mod persistence;

pub mod protocol;

pub(crate) mod shutdown;

pub mod tx_pool;

pub mod types;
