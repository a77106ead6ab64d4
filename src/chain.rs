/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for the pluggable chain: block storage and validation ([`Chain`]) and transaction
//! execution ([`WorldState`]).
//!
//! The coordinator uses a `Chain` to apply committed blocks, and the minter uses it to find the
//! state to build new blocks on. Neither validates nor executes anything itself.

use std::fmt::{self, Display, Formatter};

use crate::types::{
    address::Address,
    block::{Block, GasPool, Header, Receipt, Transaction},
    data_types::CryptoHash,
};

pub trait Chain: Clone + Send + Sync + 'static {
    type State: WorldState;

    /// The block at the head of the canonical chain.
    fn current_block(&self) -> Block;

    fn block_by_hash(&self, hash: &CryptoHash) -> Option<Block>;

    fn has_block(&self, hash: &CryptoHash) -> bool;

    /// Validate everything about `block` except its position in the chain.
    fn validate_body(&self, block: &Block) -> Result<(), ChainError>;

    /// Insert `blocks`, in order, on top of the canonical chain. Returns [`ChainError::Aborted`] if
    /// the chain is shutting down.
    fn insert_chain(&self, blocks: &[Block]) -> Result<(), ChainError>;

    /// A mutable copy of the world state with the given root.
    fn state_at(&self, root: &CryptoHash) -> Result<Self::State, ChainError>;

    /// Persist the state a minted block produces, without making the block canonical. The block
    /// becomes canonical only when it is committed through consensus and inserted.
    fn commit_state(
        &self,
        block: &Block,
        receipts: &[Receipt],
        state: Self::State,
    ) -> Result<(), ChainError>;

    fn calc_difficulty(&self, time: u64, parent: &Header) -> u64;

    fn calc_gas_limit(&self, parent: &Header) -> u64;

    /// Download blocks from `peer` until the chain contains `head`.
    fn synchronise(&self, peer: &Address, head: &CryptoHash) -> Result<(), ChainError>;
}

pub trait WorldState: Send {
    /// Take a revision that [`revert_to_snapshot`](Self::revert_to_snapshot) can roll back to.
    fn snapshot(&mut self) -> usize;

    fn revert_to_snapshot(&mut self, revision: usize);

    fn apply_transaction(
        &mut self,
        header: &Header,
        transaction: &Transaction,
        gas_pool: &mut GasPool,
    ) -> Result<Receipt, ExecutionError>;

    fn accumulate_rewards(&mut self, header: &Header);

    fn intermediate_root(&mut self) -> CryptoHash;
}

#[derive(Debug)]
pub enum ChainError {
    /// The chain stopped accepting blocks because it is shutting down.
    Aborted,
    UnknownAncestor(CryptoHash),
    InvalidBlock { block: CryptoHash, reason: String },
    MissingState(CryptoHash),
    SyncFailed(String),
    Storage(String),
}

impl Display for ChainError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Aborted => write!(f, "chain insertion aborted"),
            ChainError::UnknownAncestor(hash) => write!(f, "unknown ancestor {}", hash),
            ChainError::InvalidBlock { block, reason } => {
                write!(f, "invalid block {}: {}", block, reason)
            }
            ChainError::MissingState(root) => write!(f, "missing state {}", root),
            ChainError::SyncFailed(reason) => write!(f, "chain sync failed: {}", reason),
            ChainError::Storage(reason) => write!(f, "chain storage error: {}", reason),
        }
    }
}

impl std::error::Error for ChainError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    GasLimitReached,
    NonceTooLow { expected: u64, got: u64 },
    NonceTooHigh { expected: u64, got: u64 },
    InsufficientFunds,
    Reverted(String),
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::GasLimitReached => write!(f, "gas limit reached"),
            ExecutionError::NonceTooLow { expected, got } => {
                write!(f, "nonce too low: expected {}, got {}", expected, got)
            }
            ExecutionError::NonceTooHigh { expected, got } => {
                write!(f, "nonce too high: expected {}, got {}", expected, got)
            }
            ExecutionError::InsufficientFunds => write!(f, "insufficient funds"),
            ExecutionError::Reverted(reason) => write!(f, "execution reverted: {}", reason),
        }
    }
}

impl std::error::Error for ExecutionError {}
