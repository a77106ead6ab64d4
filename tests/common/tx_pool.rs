//! A transaction pool that hands out every transaction submitted to it until the chain it watches
//! includes it.

use std::sync::{
    mpsc::{self, Receiver, Sender},
    Arc, Mutex,
};

use raft_chain::{
    tx_pool::{NewTransactions, TxPool},
    types::block::{PendingTransactions, Transaction},
};

use super::mem_chain::MemChain;

#[derive(Clone)]
pub(crate) struct MemTxPool {
    chain: MemChain,
    transactions: Arc<Mutex<Vec<Transaction>>>,
    subscribers: Arc<Mutex<Vec<Sender<NewTransactions>>>>,
}

impl MemTxPool {
    pub(crate) fn new(chain: MemChain) -> MemTxPool {
        MemTxPool {
            chain,
            transactions: Arc::new(Mutex::new(Vec::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn submit(&self, transaction: Transaction) {
        self.transactions.lock().unwrap().push(transaction.clone());
        self.subscribers.lock().unwrap().retain(|subscriber| {
            subscriber
                .send(NewTransactions {
                    transactions: vec![transaction.clone()],
                })
                .is_ok()
        });
    }
}

impl TxPool for MemTxPool {
    fn pending(&self) -> PendingTransactions {
        let mut pending = PendingTransactions::new();
        for tx in self.transactions.lock().unwrap().iter() {
            if tx.nonce >= self.chain.nonce_of(&tx.from) {
                pending.entry(tx.from).or_insert_with(Vec::new).push(tx.clone());
            }
        }
        for txes in pending.values_mut() {
            txes.sort_by_key(|tx| tx.nonce);
        }
        pending
    }

    fn subscribe_new_transactions(&self) -> Receiver<NewTransactions> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.lock().unwrap().push(sender);
        receiver
    }
}
