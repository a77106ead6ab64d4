/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The minter: while this node leads, turns pending transactions into blocks and proposes them.
//!
//! The minter runs three threads:
//! 1. The **event thread** reacts to [`MinterEvent`]s: blocks the coordinator applied, blocks it
//!    refused as out of order, and new transactions in the pool.
//! 2. The **transaction forwarder** turns the pool's notifications into `MinterEvent`s.
//! 3. The **minting thread** mints one block per minting request, never more often than once per
//!    `block_time`.
//!
//! Minting requests coalesce: any number of requests made while a block is being minted result in
//! one more block, not one per request.
//!
//! Whether the minter is minting is decided from outside, by the coordinator's role handler calling
//! [`Minter::start`] and [`Minter::stop`] as this node gains and loses leadership.

pub(crate) mod speculative_chain;

pub(crate) mod work;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crate::chain::Chain;
use crate::events::{Event, MintBlockEvent};
use crate::protocol::{event_loop::fatal, proposals::ProposalHandle};
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::tx_pool::TxPool;
use crate::types::{
    block::Block,
    crypto_primitives::Keypair,
    data_types::{AccountAddress, CryptoHash, RaftId},
};

use speculative_chain::SpeculativeChain;
use work::{TransactionsByPriceAndNonce, Work};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) enum MinterEvent {
    /// The coordinator inserted `Block` into the chain.
    NewHead(Block),
    NewTransactions,
    /// The coordinator refused block `invalid` because it does not extend `head`.
    InvalidOrdering { head: Block, invalid: CryptoHash },
}

pub(crate) struct MinterConfig {
    pub(crate) raft_id: RaftId,
    pub(crate) keypair: Keypair,
    pub(crate) coinbase: AccountAddress,
    pub(crate) extra_vanity: Vec<u8>,
    pub(crate) block_time: Duration,
}

struct Shared<C: Chain> {
    chain: C,
    speculative_chain: Mutex<SpeculativeChain>,
    minting: AtomicBool,
    should_mint: SyncSender<()>,
}

#[derive(Clone)]
pub(crate) struct Minter<C: Chain> {
    shared: Arc<Shared<C>>,
}

impl<C: Chain> Minter<C> {
    pub(crate) fn start(&self) {
        log::info!("Minter started");
        self.shared.minting.store(true, Ordering::SeqCst);
        self.request_minting();
    }

    /// Stop minting and forget every block minted but not yet applied.
    pub(crate) fn stop(&self) {
        let mut speculative_chain = self.shared.speculative_chain.lock().unwrap();
        speculative_chain.clear(self.shared.chain.current_block());
        self.shared.minting.store(false, Ordering::SeqCst);
        log::info!("Minter stopped");
    }

    pub(crate) fn is_minting(&self) -> bool {
        self.shared.minting.load(Ordering::SeqCst)
    }

    fn request_minting(&self) {
        match self.shared.should_mint.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => (),
            Err(TrySendError::Disconnected(())) => log::debug!("Minting thread has stopped"),
        }
    }

    fn handle_event(&self, event: MinterEvent) {
        match event {
            MinterEvent::NewHead(block) => {
                let mut speculative_chain = self.shared.speculative_chain.lock().unwrap();
                if self.is_minting() {
                    speculative_chain.accept(block);
                    drop(speculative_chain);
                    self.request_minting();
                } else {
                    speculative_chain.set_head(block);
                }
            }
            MinterEvent::NewTransactions => {
                if self.is_minting() {
                    self.request_minting();
                }
            }
            MinterEvent::InvalidOrdering { head, invalid } => {
                let mut speculative_chain = self.shared.speculative_chain.lock().unwrap();
                if speculative_chain.is_tracked(&invalid) {
                    log::info!("Unwinding speculative chain from invalid block {}", invalid);
                    speculative_chain.unwind_from(&invalid, &head);
                } else {
                    log::debug!("Ignoring invalid block {} minted elsewhere", invalid);
                }
            }
        }
    }

    fn mint_new_block<P: TxPool>(
        &self,
        tx_pool: &P,
        config: &MinterConfig,
        proposals: &ProposalHandle,
        event_publisher: &Option<Sender<Event>>,
    ) {
        let block = {
            let mut speculative_chain = self.shared.speculative_chain.lock().unwrap();
            if !self.is_minting() {
                return;
            }

            let pending = speculative_chain.without_proposed_txes(tx_pool.pending());
            if pending.values().all(|txes| txes.is_empty()) {
                log::trace!("Not minting a new block since there are no pending transactions");
                return;
            }

            let parent = speculative_chain.head().clone();
            let mut work = match Work::new(&self.shared.chain, &parent, config.coinbase) {
                Ok(work) => work,
                Err(err) => fatal(&format!("failed to get state for block {}", parent.hash()), err),
            };
            let (transactions, receipts) =
                work.commit_transactions(TransactionsByPriceAndNonce::new(pending));
            if transactions.is_empty() {
                log::debug!("Not minting a new block since every pending transaction failed");
                return;
            }

            let (block, receipts, state) = work.finalize(
                transactions,
                receipts,
                &config.extra_vanity,
                config.raft_id,
                &config.keypair,
            );
            if let Err(err) = self.shared.chain.commit_state(&block, &receipts, state) {
                fatal(&format!("failed to commit state of minted block {}", block.hash()), err);
            }

            log::info!(
                "Generated next block #{} with {} txes ({})",
                block.number(),
                block.transactions.len(),
                block.hash()
            );
            speculative_chain.extend(block.clone());
            block
        };

        Event::publish(
            event_publisher,
            Event::MintBlock(MintBlockEvent {
                timestamp: SystemTime::now(),
                block: block.clone(),
            }),
        );

        let hash = block.hash();
        if let Err(err) = proposals.propose_block(block) {
            log::warn!("Failed to propose minted block {}: {}", hash, err);
        }
    }
}

/// Spawn the minter's threads. The minter starts out not minting.
#[allow(clippy::too_many_arguments)]
pub(crate) fn start_minter<C: Chain, P: TxPool>(
    chain: C,
    tx_pool: P,
    config: MinterConfig,
    proposals: ProposalHandle,
    events: Receiver<MinterEvent>,
    to_minter: Sender<MinterEvent>,
    event_publisher: Option<Sender<Event>>,
    shutdown: &Shutdown,
) -> (Minter<C>, Vec<JoinHandle<()>>) {
    let (should_mint, mint_requests) = mpsc::sync_channel(1);
    let minter = Minter {
        shared: Arc::new(Shared {
            speculative_chain: Mutex::new(SpeculativeChain::new(chain.current_block())),
            chain,
            minting: AtomicBool::new(false),
            should_mint,
        }),
    };

    let event_thread = {
        let minter = minter.clone();
        let shutdown_signal = shutdown.subscribe();
        thread::spawn(move || loop {
            match events.recv_timeout(POLL_INTERVAL) {
                Ok(event) => minter.handle_event(event),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
            if shutdown_signal.received() {
                return;
            }
        })
    };

    let tx_forwarder = {
        let new_transactions = tx_pool.subscribe_new_transactions();
        let shutdown_signal = shutdown.subscribe();
        thread::spawn(move || loop {
            match new_transactions.recv_timeout(POLL_INTERVAL) {
                Ok(_) => {
                    if to_minter.send(MinterEvent::NewTransactions).is_err() {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
            if shutdown_signal.received() {
                return;
            }
        })
    };

    let minting_thread = {
        let minter = minter.clone();
        let shutdown_signal = shutdown.subscribe();
        thread::spawn(move || {
            minting_loop(
                minter,
                tx_pool,
                config,
                proposals,
                mint_requests,
                event_publisher,
                shutdown_signal,
            )
        })
    };

    (minter, vec![event_thread, tx_forwarder, minting_thread])
}

fn minting_loop<C: Chain, P: TxPool>(
    minter: Minter<C>,
    tx_pool: P,
    config: MinterConfig,
    proposals: ProposalHandle,
    mint_requests: Receiver<()>,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: ShutdownSignal,
) {
    let mut last_mint: Option<Instant> = None;
    loop {
        match mint_requests.recv_timeout(POLL_INTERVAL) {
            Ok(()) => (),
            Err(RecvTimeoutError::Timeout) => {
                if shutdown_signal.received() {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }

        // Throttle to one block per block time.
        if let Some(last_mint) = last_mint {
            let wait = (last_mint + config.block_time).saturating_duration_since(Instant::now());
            if !wait.is_zero() && shutdown_signal.wait(wait) {
                return;
            }
        }
        if shutdown_signal.received() {
            return;
        }

        minter.mint_new_block(&tx_pool, &config, &proposals, &event_publisher);
        last_mint = Some(Instant::now());
    }
}
