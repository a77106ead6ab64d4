/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait for the pluggable transaction pool the minter draws transactions from.

use std::sync::mpsc::Receiver;

use crate::types::block::{PendingTransactions, Transaction};

pub trait TxPool: Clone + Send + 'static {
    /// Executable transactions, grouped by sender, each group in nonce order.
    fn pending(&self) -> PendingTransactions;

    /// Receive a notification each time transactions enter the pool.
    fn subscribe_new_transactions(&self) -> Receiver<NewTransactions>;
}

/// Notification that `transactions` entered the pool.
#[derive(Clone, Debug)]
pub struct NewTransactions {
    pub transactions: Vec<Transaction>,
}
