//! A simple, volatile, in-memory implementation of [`Chain`] whose world state is nothing but
//! account nonces.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use borsh::BorshSerialize;
use raft_chain::{
    chain::{Chain, ChainError, ExecutionError, WorldState},
    types::{
        address::Address,
        block::{list_root, Block, GasPool, Header, Receipt, Transaction},
        crypto_primitives::hash,
        data_types::{AccountAddress, CryptoHash, NodeId},
    },
};

pub(crate) const GAS_LIMIT: u64 = 10_000_000;

/// Every node's chain, by the node's id, so that a node can synchronise from a peer.
pub(crate) type ChainRegistry = Arc<Mutex<HashMap<NodeId, MemChain>>>;

#[derive(Clone, Default)]
pub(crate) struct MemState {
    nonces: BTreeMap<AccountAddress, u64>,
    revisions: Vec<BTreeMap<AccountAddress, u64>>,
}

impl MemState {
    fn root(&self) -> CryptoHash {
        hash(&self.nonces.try_to_vec().unwrap())
    }

    fn nonce(&self, account: &AccountAddress) -> u64 {
        self.nonces.get(account).copied().unwrap_or(0)
    }
}

impl WorldState for MemState {
    fn snapshot(&mut self) -> usize {
        self.revisions.push(self.nonces.clone());
        self.revisions.len() - 1
    }

    fn revert_to_snapshot(&mut self, revision: usize) {
        self.nonces = self.revisions[revision].clone();
        self.revisions.truncate(revision);
    }

    fn apply_transaction(
        &mut self,
        _header: &Header,
        transaction: &Transaction,
        gas_pool: &mut GasPool,
    ) -> Result<Receipt, ExecutionError> {
        let expected = self.nonce(&transaction.from);
        if transaction.nonce < expected {
            return Err(ExecutionError::NonceTooLow { expected, got: transaction.nonce });
        }
        if transaction.nonce > expected {
            return Err(ExecutionError::NonceTooHigh { expected, got: transaction.nonce });
        }
        if !gas_pool.sub_gas(transaction.gas) {
            return Err(ExecutionError::GasLimitReached);
        }
        self.nonces.insert(transaction.from, expected + 1);

        Ok(Receipt {
            tx_hash: transaction.hash(),
            success: true,
            gas_used: transaction.gas,
            cumulative_gas_used: 0,
            logs: Vec::new(),
        })
    }

    fn accumulate_rewards(&mut self, _header: &Header) {}

    fn intermediate_root(&mut self) -> CryptoHash {
        self.root()
    }
}

struct ChainData {
    blocks: HashMap<CryptoHash, Block>,
    canonical: Vec<CryptoHash>,
    states: HashMap<CryptoHash, MemState>,
}

#[derive(Clone)]
pub(crate) struct MemChain {
    data: Arc<Mutex<ChainData>>,
    registry: ChainRegistry,
}

impl MemChain {
    /// Create a chain holding only the genesis block, and register it under `node_id`.
    pub(crate) fn new(node_id: NodeId, registry: ChainRegistry) -> MemChain {
        let genesis_state = MemState::default();
        let genesis = genesis();

        let chain = MemChain {
            data: Arc::new(Mutex::new(ChainData {
                blocks: HashMap::from([(genesis.hash(), genesis.clone())]),
                canonical: vec![genesis.hash()],
                states: HashMap::from([(genesis_state.root(), genesis_state)]),
            })),
            registry,
        };
        chain.registry.lock().unwrap().insert(node_id, chain.clone());
        chain
    }

    pub(crate) fn head_number(&self) -> u64 {
        self.current_block().number()
    }

    /// The canonical chain, genesis excluded.
    pub(crate) fn canonical_blocks(&self) -> Vec<Block> {
        let data = self.data.lock().unwrap();
        data.canonical
            .iter()
            .skip(1)
            .map(|hash| data.blocks[hash].clone())
            .collect()
    }

    pub(crate) fn nonce_of(&self, account: &AccountAddress) -> u64 {
        let data = self.data.lock().unwrap();
        let head = &data.blocks[data.canonical.last().unwrap()];
        data.states[&head.header.state_root].nonce(account)
    }
}

fn genesis() -> Block {
    Block::new(
        Header {
            parent_hash: CryptoHash::default(),
            coinbase: AccountAddress::default(),
            state_root: MemState::default().root(),
            transactions_root: list_root(Vec::new()),
            receipts_root: list_root(Vec::new()),
            difficulty: 1,
            number: 0,
            gas_limit: GAS_LIMIT,
            gas_used: 0,
            time: 0,
            extra: Vec::new(),
        },
        Vec::new(),
    )
}

impl Chain for MemChain {
    type State = MemState;

    fn current_block(&self) -> Block {
        let data = self.data.lock().unwrap();
        data.blocks[data.canonical.last().unwrap()].clone()
    }

    fn block_by_hash(&self, hash: &CryptoHash) -> Option<Block> {
        self.data.lock().unwrap().blocks.get(hash).cloned()
    }

    fn has_block(&self, hash: &CryptoHash) -> bool {
        self.data.lock().unwrap().blocks.contains_key(hash)
    }

    fn validate_body(&self, block: &Block) -> Result<(), ChainError> {
        if block.header.transactions_root != list_root(block.transactions.iter().map(|tx| tx.hash())) {
            return Err(ChainError::InvalidBlock {
                block: block.hash(),
                reason: "transactions root mismatch".to_string(),
            });
        }
        Ok(())
    }

    // Re-executes every block, so that state is available whether or not this node minted it.
    fn insert_chain(&self, blocks: &[Block]) -> Result<(), ChainError> {
        let mut data = self.data.lock().unwrap();
        for block in blocks {
            let head = *data.canonical.last().unwrap();
            if block.parent_hash() != head {
                return Err(ChainError::UnknownAncestor(block.parent_hash()));
            }

            let parent_root = data.blocks[&head].header.state_root;
            let mut state = data
                .states
                .get(&parent_root)
                .cloned()
                .ok_or(ChainError::MissingState(parent_root))?;
            let mut gas_pool = GasPool::new(block.header.gas_limit);
            for tx in &block.transactions {
                state
                    .apply_transaction(&block.header, tx, &mut gas_pool)
                    .map_err(|err| ChainError::InvalidBlock {
                        block: block.hash(),
                        reason: err.to_string(),
                    })?;
            }
            if state.root() != block.header.state_root {
                return Err(ChainError::InvalidBlock {
                    block: block.hash(),
                    reason: "state root mismatch".to_string(),
                });
            }

            data.states.insert(block.header.state_root, state);
            data.blocks.insert(block.hash(), block.clone());
            data.canonical.push(block.hash());
        }
        Ok(())
    }

    fn state_at(&self, root: &CryptoHash) -> Result<MemState, ChainError> {
        let mut state = self
            .data
            .lock()
            .unwrap()
            .states
            .get(root)
            .cloned()
            .ok_or(ChainError::MissingState(*root))?;
        state.revisions.clear();
        Ok(state)
    }

    fn commit_state(&self, block: &Block, _: &[Receipt], state: MemState) -> Result<(), ChainError> {
        self.data
            .lock()
            .unwrap()
            .states
            .insert(block.header.state_root, state);
        Ok(())
    }

    fn calc_difficulty(&self, _time: u64, _parent: &Header) -> u64 {
        1
    }

    fn calc_gas_limit(&self, parent: &Header) -> u64 {
        parent.gas_limit
    }

    fn synchronise(&self, peer: &Address, head: &CryptoHash) -> Result<(), ChainError> {
        let peer_chain = self
            .registry
            .lock()
            .unwrap()
            .get(&peer.node_id)
            .cloned()
            .ok_or_else(|| ChainError::SyncFailed(format!("unknown peer {}", peer.raft_id)))?;

        let peer_blocks = peer_chain.canonical_blocks();
        let Some(end) = peer_blocks.iter().position(|block| block.hash() == *head) else {
            return Err(ChainError::SyncFailed(format!("peer {} lacks {}", peer.raft_id, head)));
        };
        let start = self.head_number() as usize;
        if start > end {
            return Ok(());
        }
        self.insert_chain(&peer_blocks[start..=end])
    }
}
