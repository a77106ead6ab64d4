/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Durable state owned by the coordinator's event loop.
//!
//! A node's data directory holds:
//! - `raft-wal/`: the [write-ahead log](wal) of hard states, entries and snapshot markers.
//! - `raft-snap/`: [snapshot files](snapshotter).
//! - the [applied index](applied_index), in a [`KVStore`](pluggables::KVStore) provided by the
//!   library user ([`FileKVStore`](file_kv_store::FileKVStore) is a ready-made one).
//!
//! The three are written in a fixed order by the event loop so that they are consistent with one
//! another after any crash.

pub mod applied_index;

pub mod file_kv_store;

pub mod pluggables;

pub mod snapshotter;

pub mod wal;

pub(crate) const WAL_DIR: &str = "raft-wal";

pub(crate) const SNAP_DIR: &str = "raft-snap";
