/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the chain types that the minter produces and the coordinator orders: blocks,
//! headers, transactions, receipts and logs, plus the seal a minter signs into every header.
//!
//! These types carry only what block ordering needs. Executing transactions and validating blocks
//! is the job of the [`Chain`](crate::chain::Chain) and [`WorldState`](crate::chain::WorldState)
//! implementations.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::{self, Keypair},
    data_types::{AccountAddress, CryptoHash, NodeId, RaftId, SignatureBytes},
    encoding::{DecodeError, VersionedEncoding},
};

/// Number of bytes at the start of `Header::extra` reserved for operator-chosen vanity data. The
/// [`ExtraSeal`] follows.
pub const EXTRA_VANITY: usize = 32;

/// Pending transactions grouped by sender, each group in nonce order.
pub type PendingTransactions = BTreeMap<AccountAddress, Vec<Transaction>>;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    pub from: AccountAddress,
    pub nonce: u64,
    pub gas_price: u64,
    pub gas: u64,
    pub to: Option<AccountAddress>,
    pub value: u64,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn hash(&self) -> CryptoHash {
        crypto_primitives::hash(&self.try_to_vec().unwrap())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Log {
    pub address: AccountAddress,
    pub topics: Vec<CryptoHash>,
    pub data: Vec<u8>,
    pub block_hash: CryptoHash,
    pub tx_hash: CryptoHash,
    pub tx_index: u32,
    pub index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Receipt {
    pub tx_hash: CryptoHash,
    pub success: bool,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    pub logs: Vec<Log>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Header {
    pub parent_hash: CryptoHash,
    pub coinbase: AccountAddress,
    pub state_root: CryptoHash,
    pub transactions_root: CryptoHash,
    pub receipts_root: CryptoHash,
    pub difficulty: u64,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Nanoseconds since the Unix Epoch. Strictly greater than the parent's.
    pub time: u64,
    pub extra: Vec<u8>,
}

impl Header {
    pub fn hash(&self) -> CryptoHash {
        crypto_primitives::hash(&self.try_to_vec().unwrap())
    }

    /// Hash of this header with an empty `extra`: the message a minter signs.
    pub fn seal_hash(&self) -> CryptoHash {
        let mut unsealed = self.clone();
        unsealed.extra = Vec::new();
        unsealed.hash()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Block {
        Block {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> CryptoHash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> CryptoHash {
        self.header.parent_hash
    }
}

impl VersionedEncoding for Block {
    const VERSION: u8 = 1;
}

/// Root committing to an ordered list of hashes.
pub fn list_root(hashes: impl IntoIterator<Item = CryptoHash>) -> CryptoHash {
    let bytes: Vec<u8> = hashes.into_iter().flat_map(|hash| hash.bytes()).collect();
    crypto_primitives::hash(&bytes)
}

/// Seal a minter embeds in `Header::extra` after the vanity bytes: who minted the block, and their
/// signature over the header's [seal hash](Header::seal_hash).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ExtraSeal {
    pub raft_id: RaftId,
    pub signature: SignatureBytes,
}

impl VersionedEncoding for ExtraSeal {
    const VERSION: u8 = 1;
}

impl ExtraSeal {
    /// Sign `header` and write `vanity ‖ seal` into its `extra`. `vanity` is zero-padded or
    /// truncated to [`EXTRA_VANITY`] bytes.
    pub(crate) fn seal(header: &mut Header, vanity: &[u8], raft_id: RaftId, keypair: &Keypair) {
        let signature = keypair.sign(&header.seal_hash().bytes());
        let mut extra = vanity.to_vec();
        extra.resize(EXTRA_VANITY, 0);
        extra.extend(ExtraSeal { raft_id, signature }.encode());
        header.extra = extra;
    }

    /// Read the seal out of a sealed header.
    pub fn from_header(header: &Header) -> Result<ExtraSeal, DecodeError> {
        if header.extra.len() <= EXTRA_VANITY {
            return Err(DecodeError::Empty);
        }
        ExtraSeal::decode(&header.extra[EXTRA_VANITY..])
    }

    /// Check the seal's signature against the minter's node id.
    pub fn verify(&self, header: &Header, minter: &NodeId) -> bool {
        crypto_primitives::verify(minter, &header.seal_hash().bytes(), &self.signature)
    }
}

/// Remaining gas that transactions in the block being minted may consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasPool(u64);

impl GasPool {
    pub fn new(gas: u64) -> GasPool {
        GasPool(gas)
    }

    pub fn gas(&self) -> u64 {
        self.0
    }

    /// Deduct `amount`, or leave the pool untouched and return `false` if not enough gas remains.
    pub fn sub_gas(&mut self, amount: u64) -> bool {
        match self.0.checked_sub(amount) {
            Some(remaining) => {
                self.0 = remaining;
                true
            }
            None => false,
        }
    }
}
