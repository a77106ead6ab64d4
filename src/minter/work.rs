/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Building one block: choosing transactions, executing them on top of the parent's state, and
//! sealing the result.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chain::{Chain, ChainError, ExecutionError, WorldState};
use crate::types::{
    block::{list_root, Block, ExtraSeal, GasPool, Header, PendingTransactions, Receipt, Transaction},
    crypto_primitives::Keypair,
    data_types::{AccountAddress, CryptoHash, RaftId},
};

/// Pending transactions in the order the minter tries them: highest gas price first, each sender's
/// transactions in nonce order. Ties on price go to the lower sender address.
pub(crate) struct TransactionsByPriceAndNonce {
    queued: BTreeMap<AccountAddress, VecDeque<Transaction>>,
    heads: BinaryHeap<PricedHead>,
}

struct PricedHead(Transaction);

impl PartialEq for PricedHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PricedHead {}

impl PartialOrd for PricedHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PricedHead {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .gas_price
            .cmp(&other.0.gas_price)
            .then_with(|| other.0.from.cmp(&self.0.from))
    }
}

impl TransactionsByPriceAndNonce {
    pub(crate) fn new(pending: PendingTransactions) -> TransactionsByPriceAndNonce {
        let mut queued = BTreeMap::new();
        let mut heads = BinaryHeap::new();
        for (sender, txes) in pending {
            let mut txes: VecDeque<Transaction> = txes.into();
            if let Some(head) = txes.pop_front() {
                heads.push(PricedHead(head));
                queued.insert(sender, txes);
            }
        }
        TransactionsByPriceAndNonce { queued, heads }
    }

    /// The next transaction to try.
    pub(crate) fn peek(&self) -> Option<&Transaction> {
        self.heads.peek().map(|head| &head.0)
    }

    /// Replace the current best transaction with the next one from the same sender.
    pub(crate) fn shift(&mut self) {
        if let Some(PricedHead(best)) = self.heads.pop() {
            if let Some(next) = self.queued.get_mut(&best.from).and_then(|txes| txes.pop_front()) {
                self.heads.push(PricedHead(next));
            }
        }
    }

    /// Drop the current best transaction together with every later transaction from its sender.
    pub(crate) fn pop(&mut self) {
        if let Some(PricedHead(best)) = self.heads.pop() {
            self.queued.remove(&best.from);
        }
    }
}

/// The block under construction and the state it is being built against.
pub(crate) struct Work<S: WorldState> {
    pub(crate) header: Header,
    state: S,
    gas_pool: GasPool,
}

impl<S: WorldState> Work<S> {
    /// Start a block on top of `parent`, against a copy of `parent`'s state.
    pub(crate) fn new<C: Chain<State = S>>(
        chain: &C,
        parent: &Block,
        coinbase: AccountAddress,
    ) -> Result<Work<S>, ChainError> {
        let time = nano_timestamp(parent);
        let gas_limit = chain.calc_gas_limit(&parent.header);
        let header = Header {
            parent_hash: parent.hash(),
            coinbase,
            state_root: CryptoHash::default(),
            transactions_root: CryptoHash::default(),
            receipts_root: CryptoHash::default(),
            difficulty: chain.calc_difficulty(time, &parent.header),
            number: parent.number() + 1,
            gas_limit,
            gas_used: 0,
            time,
            extra: Vec::new(),
        };
        let state = chain.state_at(&parent.header.state_root)?;

        Ok(Work {
            header,
            state,
            gas_pool: GasPool::new(gas_limit),
        })
    }

    /// Execute transactions in `txes` order until they run out or the block is full. A transaction
    /// that fails is rolled back, and its sender's later transactions are skipped this round.
    pub(crate) fn commit_transactions(
        &mut self,
        mut txes: TransactionsByPriceAndNonce,
    ) -> (Vec<Transaction>, Vec<Receipt>) {
        let mut committed = Vec::new();
        let mut receipts = Vec::new();

        while let Some(tx) = txes.peek().cloned() {
            let revision = self.state.snapshot();
            match self.state.apply_transaction(&self.header, &tx, &mut self.gas_pool) {
                Ok(mut receipt) => {
                    self.header.gas_used += receipt.gas_used;
                    receipt.cumulative_gas_used = self.header.gas_used;
                    let tx_index = committed.len() as u32;
                    for log in receipt.logs.iter_mut() {
                        log.tx_hash = receipt.tx_hash;
                        log.tx_index = tx_index;
                    }
                    receipts.push(receipt);
                    committed.push(tx);
                    txes.shift();
                }
                Err(ExecutionError::GasLimitReached) => {
                    self.state.revert_to_snapshot(revision);
                    log::debug!("Block gas limit reached after {} transactions", committed.len());
                    break;
                }
                Err(err) => {
                    self.state.revert_to_snapshot(revision);
                    log::debug!("Transaction {} failed, will be removed: {}", tx.hash(), err);
                    txes.pop();
                }
            }
        }

        let mut log_index = 0;
        for log in receipts.iter_mut().flat_map(|receipt| receipt.logs.iter_mut()) {
            log.index = log_index;
            log_index += 1;
        }

        (committed, receipts)
    }

    /// Apply rewards, fill in the header's roots, sign it, and stamp the resulting block hash into
    /// every log. Returns the block with its receipts and the state to commit.
    pub(crate) fn finalize(
        mut self,
        transactions: Vec<Transaction>,
        mut receipts: Vec<Receipt>,
        extra_vanity: &[u8],
        raft_id: RaftId,
        keypair: &Keypair,
    ) -> (Block, Vec<Receipt>, S) {
        self.state.accumulate_rewards(&self.header);
        self.header.state_root = self.state.intermediate_root();
        self.header.transactions_root = list_root(transactions.iter().map(|tx| tx.hash()));
        self.header.receipts_root = list_root(receipts.iter().map(receipt_hash));
        ExtraSeal::seal(&mut self.header, extra_vanity, raft_id, keypair);

        let block = Block::new(self.header, transactions);
        let block_hash = block.hash();
        for log in receipts.iter_mut().flat_map(|receipt| receipt.logs.iter_mut()) {
            log.block_hash = block_hash;
        }

        (block, receipts, self.state)
    }
}

fn receipt_hash(receipt: &Receipt) -> CryptoHash {
    let mut bytes = receipt.tx_hash.bytes().to_vec();
    bytes.push(receipt.success as u8);
    bytes.extend(receipt.gas_used.to_le_bytes());
    bytes.extend(receipt.cumulative_gas_used.to_le_bytes());
    crate::types::crypto_primitives::hash(&bytes)
}

/// Nanoseconds since the Unix Epoch, or one more than `parent`'s time if the clock is not ahead of it.
pub(crate) fn nano_timestamp(parent: &Block) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since_epoch| since_epoch.as_nanos() as u64)
        .unwrap_or(0);
    now.max(parent.header.time + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(sender: u8, nonce: u64, gas_price: u64) -> Transaction {
        Transaction {
            from: AccountAddress::new([sender; 20]),
            nonce,
            gas_price,
            gas: 21_000,
            to: None,
            value: 0,
            payload: Vec::new(),
        }
    }

    fn pending_of(txes: &[Transaction]) -> PendingTransactions {
        let mut pending = PendingTransactions::new();
        for tx in txes {
            pending.entry(tx.from).or_default().push(tx.clone());
        }
        pending
    }

    fn drain_with_shift(mut txes: TransactionsByPriceAndNonce) -> Vec<(u8, u64)> {
        let mut order = Vec::new();
        while let Some(tx) = txes.peek() {
            order.push((tx.from.bytes()[0], tx.nonce));
            txes.shift();
        }
        order
    }

    #[test]
    fn orders_by_price_then_nonce() {
        let txes = TransactionsByPriceAndNonce::new(pending_of(&[
            tx(1, 0, 5),
            tx(1, 1, 50),
            tx(2, 0, 10),
            tx(3, 0, 10),
        ]));
        // Sender 1's expensive transaction must wait for its cheap predecessor.
        assert_eq!(
            drain_with_shift(txes),
            vec![(2, 0), (3, 0), (1, 0), (1, 1)]
        );
    }

    #[test]
    fn pop_drops_rest_of_sender() {
        let mut txes = TransactionsByPriceAndNonce::new(pending_of(&[
            tx(1, 0, 9),
            tx(1, 1, 9),
            tx(2, 0, 1),
        ]));
        txes.pop();
        assert_eq!(drain_with_shift(txes), vec![(2, 0)]);
    }

    #[test]
    fn timestamp_is_after_parent() {
        let far_future = u64::MAX - 10;
        let header = Header {
            parent_hash: CryptoHash::default(),
            coinbase: AccountAddress::default(),
            state_root: CryptoHash::default(),
            transactions_root: CryptoHash::default(),
            receipts_root: CryptoHash::default(),
            difficulty: 1,
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            time: far_future,
            extra: Vec::new(),
        };
        let parent = Block::new(header, Vec::new());
        assert_eq!(nano_timestamp(&parent), far_future + 1);
    }
}
