/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a node.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the node](NodeSpec) with:
//!   1. `NodeSpec::builder` to construct a `NodeSpecBuilder`,
//!   2. The setters of the `NodeSpecBuilder`, and
//!   3. The `NodeSpecBuilder::build` method to construct a [NodeSpec],
//! - The function to [start](NodeSpec::start) a [Node] given its specification,
//! - [The type](Node) which keeps the node alive.
//!
//! ## Starting a node
//!
//! ```ignore
//! let node =
//!     NodeSpec::builder()
//!     .chain(chain)
//!     .tx_pool(tx_pool)
//!     .kv_store(kv_store)
//!     .transport(transport)
//!     .peer_network(peer_network)
//!     .configuration(configuration)
//!     .on_insert_block(insert_block_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//!
//! The required setters are for providing the trait implementations required to run a node:
//! - `.chain(...)`
//! - `.tx_pool(...)`
//! - `.kv_store(...)`
//! - `.transport(...)`
//! - `.peer_network(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! The optional setters are for registering user-defined event handlers for events from [crate::events]:
//! - `.on_insert_block(...)`
//! - `.on_skip_block(...)`
//! - `.on_invalid_ordering(...)`
//! - `.on_mint_block(...)`
//! - `.on_propose_block(...)`
//! - `.on_become_leader(...)`
//! - `.on_step_down(...)`
//! - `.on_add_peer(...)`
//! - `.on_remove_peer(...)`
//! - `.on_take_snapshot(...)`
//! - `.on_apply_snapshot(...)`
//!
//! ## Stopping a node
//!
//! Dropping the [Node] stops every thread it started. A node also stops on its own once the removal
//! of its own raft id from the cluster is applied; [Node::is_shut_down] tells when that happened.

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::api::RaftApi;
use crate::chain::Chain;
use crate::event_bus::*;
use crate::events::*;
use crate::minter::{start_minter, MinterConfig};
use crate::networking::network::{PeerNetwork, Transport};
use crate::networking::receiving::start_polling;
use crate::persistence::pluggables::KVStore;
use crate::protocol::event_loop::RaftInput;
use crate::protocol::proposals::start_forwarder;
use crate::protocol::startup::{start_coordinator, StartError, Started};
use crate::protocol::{start_role_handler, ProtocolManager};
use crate::shutdown::Shutdown;
use crate::tx_pool::TxPool;
use crate::types::{
    address::PeerDescriptor,
    crypto_primitives::Keypair,
    data_types::{AccountAddress, RaftId},
};

/// Stores the user-defined parameters required to start the node.
///
/// ## Start modes
///
/// If `data_dir` already holds a write-ahead log, the node restarts from it and `bootstrap_nodes`
/// and `join_existing` are ignored. Otherwise, with `join_existing` set the node waits to be sent the
/// cluster's state by its leader (it must already have been added with
/// [`RaftApi::add_peer`](crate::api::RaftApi::add_peer) or
/// [`add_learner`](crate::api::RaftApi::add_learner) on a member, which is where `raft_id` comes
/// from). Without it, the node bootstraps a new cluster of `bootstrap_nodes`, in which it must appear
/// at position `raft_id` (counting from 1).
///
/// ## Ticks
///
/// Raft measures time in ticks of `tick_interval`. A follower that hears nothing from a leader for
/// `election_tick` ticks starts an election; a leader sends heartbeats every `heartbeat_tick` ticks.
///
/// ## Log Events
///
/// The node logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.raft_id(...)`
    - `.host(...)`
    - `.p2p_port(...)`
    - `.raft_port(...)`
    - `.data_dir(...)`

    Optional:
    - `.bootstrap_nodes(...)`
    - `.join_existing(...)`
    - `.block_time(...)`
    - `.tick_interval(...)`
    - `.election_tick(...)`
    - `.heartbeat_tick(...)`
    - `.snapshot_period(...)`
    - `.max_size_per_msg(...)`
    - `.max_inflight_msgs(...)`
    - `.pre_vote(...)`
    - `.coinbase(...)`
    - `.extra_vanity(...)`
    - `.log_events(...)`
"
))]
pub struct Configuration {
    #[builder(setter(doc = "Set the node's keypair, used to seal minted blocks. Its public key is the node id. Required."))]
    pub me: SigningKey,
    #[builder(setter(doc = "Set the node's raft id. Required."))]
    pub raft_id: RaftId,
    #[builder(setter(into, doc = "Set the host other members reach this node at. Required."))]
    pub host: String,
    #[builder(setter(doc = "Set the port of this node's data-plane p2p network. Required."))]
    pub p2p_port: u16,
    #[builder(setter(doc = "Set the port of this node's consensus transport. Required."))]
    pub raft_port: u16,
    #[builder(setter(into, doc = "Set the directory the write-ahead log and snapshots are kept in. Required."))]
    pub data_dir: PathBuf,
    #[builder(default, setter(doc = "Set the members of a new cluster, in raft id order. Required to bootstrap a cluster."))]
    pub bootstrap_nodes: Vec<PeerDescriptor>,
    #[builder(default = false, setter(doc = "Join an existing cluster instead of bootstrapping one. Default: false."))]
    pub join_existing: bool,
    #[builder(default = Duration::from_millis(50), setter(doc = "Set the minimum time between two minted blocks. Default: 50ms."))]
    pub block_time: Duration,
    #[builder(default = Duration::from_millis(100), setter(doc = "Set the length of a Raft tick. Default: 100ms."))]
    pub tick_interval: Duration,
    #[builder(default = 10, setter(doc = "Set the number of ticks without a leader before an election. Default: 10."))]
    pub election_tick: usize,
    #[builder(default = 1, setter(doc = "Set the number of ticks between leader heartbeats. Default: 1."))]
    pub heartbeat_tick: usize,
    #[builder(default = 250, setter(doc = "Set the number of applied entries between periodic snapshots. Default: 250."))]
    pub snapshot_period: u64,
    #[builder(default = 4096, setter(doc = "Set the maximum size in bytes of one append message. Default: 4096."))]
    pub max_size_per_msg: u64,
    #[builder(default = 256, setter(doc = "Set the maximum number of in-flight append messages per follower. Default: 256."))]
    pub max_inflight_msgs: usize,
    #[builder(default = false, setter(doc = "Enable pre-vote elections. Check quorum is enabled exactly when this is not. Default: false."))]
    pub pre_vote: bool,
    #[builder(default, setter(doc = "Set the account minted blocks pay rewards to. Default: the zero address."))]
    pub coinbase: AccountAddress,
    #[builder(default, setter(doc = "Set the vanity bytes placed before the seal in minted blocks' extra data. Default: zeroes."))]
    pub extra_vanity: Vec<u8>,
    #[builder(default = false, setter(doc = "Enable logging of events? Default: false."))]
    pub log_events: bool,
}

/// Stores all necessary parameters and trait implementations required to run the [Node].
#[derive(TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [NodeSpec]. On the builder call the following methods to construct a valid [NodeSpec].

    Required:
    - `.chain(...)`
    - `.tx_pool(...)`
    - `.kv_store(...)`
    - `.transport(...)`
    - `.peer_network(...)`
    - `.configuration(...)`

    Optional:
    - `.on_insert_block(...)`
    - `.on_skip_block(...)`
    - `.on_invalid_ordering(...)`
    - `.on_mint_block(...)`
    - `.on_propose_block(...)`
    - `.on_become_leader(...)`
    - `.on_step_down(...)`
    - `.on_add_peer(...)`
    - `.on_remove_peer(...)`
    - `.on_take_snapshot(...)`
    - `.on_apply_snapshot(...)`
"
))]
pub struct NodeSpec<C: Chain, P: TxPool, K: KVStore, T: Transport, N: PeerNetwork> {
    // Required parameters
    #[builder(setter(doc = "Set the chain that committed blocks are inserted into. The argument must implement the [Chain](crate::chain::Chain) trait. Required."))]
    chain: C,
    #[builder(setter(doc = "Set the transaction pool the minter draws from. The argument must implement the [TxPool](crate::tx_pool::TxPool) trait. Required."))]
    tx_pool: P,
    #[builder(setter(doc = "Set the store the applied index is kept in. The argument must implement the [KVStore](crate::persistence::pluggables::KVStore) trait. Required."))]
    kv_store: K,
    #[builder(setter(doc = "Set the transport Raft messages are exchanged over. The argument must implement the [Transport](crate::networking::network::Transport) trait. Required."))]
    transport: T,
    #[builder(setter(doc = "Set the data-plane p2p network to keep in line with cluster membership. The argument must implement the [PeerNetwork](crate::networking::network::PeerNetwork) trait. Required."))]
    peer_network: N,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a node. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&InsertBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<InsertBlockEvent>),
    doc = "Register a handler closure to be invoked after a committed block is inserted into the chain. Optional."))]
    on_insert_block: Option<HandlerPtr<InsertBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SkipBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SkipBlockEvent>),
    doc = "Register a handler closure to be invoked after a committed block already in the chain is skipped. Optional."))]
    on_skip_block: Option<HandlerPtr<SkipBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&InvalidOrderingEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<InvalidOrderingEvent>),
    doc = "Register a handler closure to be invoked after a committed block that does not extend the chain head is refused. Optional."))]
    on_invalid_ordering: Option<HandlerPtr<InvalidOrderingEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&MintBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<MintBlockEvent>),
    doc = "Register a handler closure to be invoked after the node mints a block. Optional."))]
    on_mint_block: Option<HandlerPtr<MintBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeBlockEvent>),
    doc = "Register a handler closure to be invoked after a minted block is accepted into the node's Raft log. Optional."))]
    on_propose_block: Option<HandlerPtr<ProposeBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&BecomeLeaderEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<BecomeLeaderEvent>),
    doc = "Register a handler closure to be invoked after the node becomes the leader. Optional."))]
    on_become_leader: Option<HandlerPtr<BecomeLeaderEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StepDownEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StepDownEvent>),
    doc = "Register a handler closure to be invoked after the node stops being the leader. Optional."))]
    on_step_down: Option<HandlerPtr<StepDownEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&AddPeerEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AddPeerEvent>),
    doc = "Register a handler closure to be invoked after the node connects to a new member. Optional."))]
    on_add_peer: Option<HandlerPtr<AddPeerEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RemovePeerEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RemovePeerEvent>),
    doc = "Register a handler closure to be invoked after a member is removed from the cluster. Optional."))]
    on_remove_peer: Option<HandlerPtr<RemovePeerEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TakeSnapshotEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TakeSnapshotEvent>),
    doc = "Register a handler closure to be invoked after the node takes a snapshot. Optional."))]
    on_take_snapshot: Option<HandlerPtr<TakeSnapshotEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ApplySnapshotEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ApplySnapshotEvent>),
    doc = "Register a handler closure to be invoked after the node applies a snapshot sent by the leader. Optional."))]
    on_apply_snapshot: Option<HandlerPtr<ApplySnapshotEvent>>,
}

impl<C: Chain, P: TxPool, K: KVStore, T: Transport, N: PeerNetwork> NodeSpec<C, P, K, T, N> {
    /// Restores the node's durable state, starts all threads and channels associated with running a
    /// node, and returns the handles to them in a [Node] struct.
    pub fn start(self) -> Result<Node<T>, StartError> {
        let event_handlers = EventHandlers::new(
            self.configuration.log_events,
            self.on_insert_block,
            self.on_skip_block,
            self.on_invalid_ordering,
            self.on_mint_block,
            self.on_propose_block,
            self.on_become_leader,
            self.on_step_down,
            self.on_add_peer,
            self.on_remove_peer,
            self.on_take_snapshot,
            self.on_apply_snapshot,
        );

        let (event_publisher, event_subscriber) =
            if !event_handlers.is_empty() {
                Some(mpsc::channel()).unzip()
            } else { (None, None) };

        let shutdown = Shutdown::new();
        let (to_event_loop, raft_inputs) = mpsc::channel::<RaftInput>();
        let (to_minter, minter_events) = mpsc::channel();
        let (to_role_handler, role_changes) = mpsc::channel();

        let Started { coordinator, state } = start_coordinator(
            &self.configuration,
            self.chain.clone(),
            self.kv_store,
            self.transport.clone(),
            self.peer_network,
            to_minter.clone(),
            to_role_handler,
            event_publisher.clone(),
            &shutdown,
        )?;

        let mut threads = Vec::new();

        let (proposals, forwarder) =
            start_forwarder(to_event_loop.clone(), event_publisher.clone(), shutdown.subscribe());
        threads.push(forwarder);

        let minter_config = MinterConfig {
            raft_id: self.configuration.raft_id,
            keypair: Keypair::new(self.configuration.me.clone()),
            coinbase: self.configuration.coinbase,
            extra_vanity: self.configuration.extra_vanity.clone(),
            block_time: self.configuration.block_time,
        };
        let (minter, minter_threads) = start_minter(
            self.chain,
            self.tx_pool,
            minter_config,
            proposals.clone(),
            minter_events,
            to_minter,
            event_publisher.clone(),
            &shutdown,
        );
        threads.extend(minter_threads);
        threads.push(start_role_handler(minter, role_changes, shutdown.subscribe()));

        threads.push(start_polling(self.transport.clone(), to_event_loop, shutdown.subscribe()));

        let tick_interval = self.configuration.tick_interval;
        threads.push(thread::spawn(move || coordinator.run(raft_inputs, tick_interval)));

        if let Some(event_subscriber) = event_subscriber {
            threads.push(start_event_bus(event_handlers, event_subscriber, shutdown.subscribe()));
        }

        log::info!("{}: node started", self.configuration.raft_id);
        Ok(Node {
            api: RaftApi::new(ProtocolManager::new(state, proposals, self.transport)),
            shutdown,
            threads,
        })
    }
}

/// A handle to the background threads of a node. When this value is dropped, all background threads
/// are gracefully shut down.
pub struct Node<T: Transport> {
    api: RaftApi<T>,
    shutdown: Shutdown,
    threads: Vec<JoinHandle<()>>,
}

impl<T: Transport> Node<T> {
    /// Returns the [administrative API](RaftApi) of this node.
    pub fn api(&self) -> &RaftApi<T> {
        &self.api
    }

    /// Whether the node stopped, either because it was dropped or because it was removed from the
    /// cluster.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_triggered()
    }
}

impl<T: Transport> Drop for Node<T> {
    fn drop(&mut self) {
        self.shutdown.trigger();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                log::error!("A node thread panicked before shutdown");
            }
        }
    }
}
