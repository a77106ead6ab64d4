/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The blocks this node has minted but the cluster has not yet committed.
//!
//! Raft may commit blocks in a different order than they were minted, or not at all when leadership
//! changes while proposals are in flight. The speculative chain keeps the minter building on its own
//! outstanding blocks, and is reconciled with what actually commits through three operations:
//! [`extend`](SpeculativeChain::extend) a newly minted block onto the tail,
//! [`accept`](SpeculativeChain::accept) a committed block from the front, and
//! [`unwind_from`](SpeculativeChain::unwind_from) an invalid block to the tail.
//!
//! ## Invariant
//!
//! `head` is always the tail of the unapplied queue, or the canonical chain head most recently
//! supplied from outside if the queue is empty.

use std::collections::{HashSet, VecDeque};

use crate::types::{
    block::{Block, PendingTransactions},
    data_types::CryptoHash,
};

pub(crate) struct SpeculativeChain {
    head: Block,
    unapplied_blocks: VecDeque<Block>,
    // Descendants of an unwound block, which the coordinator will report invalid one by one.
    expected_invalid_blocks: HashSet<CryptoHash>,
    proposed_txes: HashSet<CryptoHash>,
}

impl SpeculativeChain {
    pub(crate) fn new(head: Block) -> SpeculativeChain {
        SpeculativeChain {
            head,
            unapplied_blocks: VecDeque::new(),
            expected_invalid_blocks: HashSet::new(),
            proposed_txes: HashSet::new(),
        }
    }

    /// The block the next minted block builds on.
    pub(crate) fn head(&self) -> &Block {
        &self.head
    }

    /// Forget every speculative block and build on `head`.
    pub(crate) fn clear(&mut self, head: Block) {
        self.head = head;
        self.unapplied_blocks.clear();
        self.expected_invalid_blocks.clear();
        self.proposed_txes.clear();
    }

    /// Follow the canonical chain while not minting.
    pub(crate) fn set_head(&mut self, head: Block) {
        self.head = head;
    }

    pub(crate) fn extend(&mut self, block: Block) {
        self.proposed_txes
            .extend(block.transactions.iter().map(|tx| tx.hash()));
        self.unapplied_blocks.push_back(block.clone());
        self.head = block;
    }

    /// Reconcile with `committed`, the block the cluster just made canonical.
    pub(crate) fn accept(&mut self, committed: Block) {
        match self.unapplied_blocks.pop_front() {
            None => {
                // Another leader minted it.
                self.release_proposed_txes(&committed);
                self.head = committed;
            }
            Some(earliest) if earliest.hash() == committed.hash() => {
                self.release_proposed_txes(&committed);
            }
            Some(_) => {
                log::info!(
                    "Another node minted {}; clearing speculative state",
                    committed.hash()
                );
                self.clear(committed);
            }
        }
    }

    /// Remove `invalid` and every block after it. `canonical_head` is the chain's head, which `head`
    /// falls back to when the queue empties.
    ///
    /// The descendants of `invalid` are remembered, so that when each of them is later reported
    /// invalid in turn, the report is absorbed instead of unwinding again.
    pub(crate) fn unwind_from(&mut self, invalid: &CryptoHash, canonical_head: &Block) {
        if self.expected_invalid_blocks.remove(invalid) {
            log::info!("Removing expected-invalid block {} from guard", invalid);
            return;
        }

        while let Some(popped) = self.unapplied_blocks.pop_back() {
            self.head = match self.unapplied_blocks.back() {
                Some(tail) => tail.clone(),
                None => canonical_head.clone(),
            };
            self.release_proposed_txes(&popped);

            let popped_hash = popped.hash();
            if popped_hash == *invalid {
                return;
            }
            log::info!(
                "Have not found {} yet; adding descendant {} to guard",
                invalid,
                popped_hash
            );
            self.expected_invalid_blocks.insert(popped_hash);
        }
        log::info!("Popped all blocks from the speculative chain");
    }

    /// `pending` minus every transaction included in an outstanding speculative block. Senders left
    /// with no transactions are dropped.
    pub(crate) fn without_proposed_txes(&self, pending: PendingTransactions) -> PendingTransactions {
        pending
            .into_iter()
            .filter_map(|(sender, txes)| {
                let txes: Vec<_> = txes
                    .into_iter()
                    .filter(|tx| !self.proposed_txes.contains(&tx.hash()))
                    .collect();
                (!txes.is_empty()).then_some((sender, txes))
            })
            .collect()
    }

    /// Whether `hash` is a block this node minted that the speculative chain still accounts for,
    /// either outstanding or expected to be reported invalid.
    pub(crate) fn is_tracked(&self, hash: &CryptoHash) -> bool {
        self.expected_invalid_blocks.contains(hash)
            || self.unapplied_blocks.iter().any(|block| block.hash() == *hash)
    }

    fn release_proposed_txes(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.proposed_txes.remove(&tx.hash());
        }
    }
}
