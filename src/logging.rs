/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the node's
//! [config](crate::node::Configuration).
//!
//! The crate logs using the [log](https://docs.rs/log/latest/log/) crate. Log records emitted by the
//! consensus library itself go through `slog` and are bridged into `log` by `slog-stdlog`, so one
//! logging implementation sees both.
//!
//! ## Log message format
//!
//! Log messages are CSVs with at least two values. The first two values are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, this is how an
//! [InsertBlock](crate::events::InsertBlockEvent) is printed:
//!
//! ```text
//! InsertBlock, 1701329264, fNGCJyk, 12, 3, 41
//! ```
//!
//! In the snippet, the values after the timestamp are the first seven characters of the Base64
//! encoding of the block's hash, the block number, the number of transactions, and the raft log
//! index the block was committed at.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const INSERT_BLOCK: &str = "InsertBlock";
pub const SKIP_BLOCK: &str = "SkipBlock";
pub const INVALID_ORDERING: &str = "InvalidOrdering";

pub const MINT_BLOCK: &str = "MintBlock";
pub const PROPOSE_BLOCK: &str = "ProposeBlock";

pub const BECOME_LEADER: &str = "BecomeLeader";
pub const STEP_DOWN: &str = "StepDown";

pub const ADD_PEER: &str = "AddPeer";
pub const REMOVE_PEER: &str = "RemovePeer";

pub const TAKE_SNAPSHOT: &str = "TakeSnapshot";
pub const APPLY_SNAPSHOT: &str = "ApplySnapshot";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for InsertBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |insert_block_event: &InsertBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                INSERT_BLOCK,
                secs_since_unix_epoch(insert_block_event.timestamp),
                first_seven_base64_chars(&insert_block_event.block.hash().bytes()),
                insert_block_event.block.number(),
                insert_block_event.block.transactions.len(),
                insert_block_event.raft_index
            )
        };
        Box::new(logger)
    }
}

impl Logger for SkipBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |skip_block_event: &SkipBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                SKIP_BLOCK,
                secs_since_unix_epoch(skip_block_event.timestamp),
                first_seven_base64_chars(&skip_block_event.block.bytes()),
                skip_block_event.raft_index
            )
        };
        Box::new(logger)
    }
}

impl Logger for InvalidOrderingEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |invalid_ordering_event: &InvalidOrderingEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                INVALID_ORDERING,
                secs_since_unix_epoch(invalid_ordering_event.timestamp),
                first_seven_base64_chars(&invalid_ordering_event.invalid.bytes()),
                first_seven_base64_chars(&invalid_ordering_event.head.bytes()),
                invalid_ordering_event.raft_index
            )
        };
        Box::new(logger)
    }
}

impl Logger for MintBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |mint_block_event: &MintBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                MINT_BLOCK,
                secs_since_unix_epoch(mint_block_event.timestamp),
                first_seven_base64_chars(&mint_block_event.block.hash().bytes()),
                first_seven_base64_chars(&mint_block_event.block.parent_hash().bytes()),
                mint_block_event.block.number(),
                mint_block_event.block.transactions.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_block_event: &ProposeBlockEvent| {
            log::info!(
                "{}, {}, {}",
                PROPOSE_BLOCK,
                secs_since_unix_epoch(propose_block_event.timestamp),
                first_seven_base64_chars(&propose_block_event.block.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for BecomeLeaderEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |become_leader_event: &BecomeLeaderEvent| {
            log::info!(
                "{}, {}, {}",
                BECOME_LEADER,
                secs_since_unix_epoch(become_leader_event.timestamp),
                become_leader_event.term
            )
        };
        Box::new(logger)
    }
}

impl Logger for StepDownEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |step_down_event: &StepDownEvent| {
            log::info!(
                "{}, {}, {}",
                STEP_DOWN,
                secs_since_unix_epoch(step_down_event.timestamp),
                match step_down_event.leader {
                    Some(leader) => leader.to_string(),
                    None => String::from("none"),
                }
            )
        };
        Box::new(logger)
    }
}

impl Logger for AddPeerEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |add_peer_event: &AddPeerEvent| {
            log::info!(
                "{}, {}, {}, {}, {}:{}",
                ADD_PEER,
                secs_since_unix_epoch(add_peer_event.timestamp),
                add_peer_event.address.raft_id,
                first_seven_base64_chars(&add_peer_event.address.node_id.bytes()),
                add_peer_event.address.host,
                add_peer_event.address.raft_port
            )
        };
        Box::new(logger)
    }
}

impl Logger for RemovePeerEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |remove_peer_event: &RemovePeerEvent| {
            log::info!(
                "{}, {}, {}",
                REMOVE_PEER,
                secs_since_unix_epoch(remove_peer_event.timestamp),
                remove_peer_event.raft_id
            )
        };
        Box::new(logger)
    }
}

impl Logger for TakeSnapshotEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |take_snapshot_event: &TakeSnapshotEvent| {
            log::info!(
                "{}, {}, {}",
                TAKE_SNAPSHOT,
                secs_since_unix_epoch(take_snapshot_event.timestamp),
                take_snapshot_event.index
            )
        };
        Box::new(logger)
    }
}

impl Logger for ApplySnapshotEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |apply_snapshot_event: &ApplySnapshotEvent| {
            log::info!(
                "{}, {}, {}, {}",
                APPLY_SNAPSHOT,
                secs_since_unix_epoch(apply_snapshot_event.timestamp),
                apply_snapshot_event.index,
                first_seven_base64_chars(&apply_snapshot_event.head.bytes())
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
