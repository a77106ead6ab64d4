/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The applied index: the last Raft log index whose effects reached the chain.
//!
//! It is stored under a single key as an 8-byte little-endian integer, and written (and fsynced) each
//! time the apply loop finishes an entry.

use super::pluggables::{KVStore, KVStoreError, WriteBatch};

pub(crate) const APPLIED_INDEX: &[u8] = b"applied";

pub(crate) fn write_applied_index<K: KVStore>(
    kv_store: &mut K,
    index: u64,
) -> Result<(), KVStoreError> {
    let mut wb = K::WriteBatch::new();
    wb.set(APPLIED_INDEX, &index.to_le_bytes());
    kv_store.write(wb)
}

/// Decide the applied index to resume from after a restart.
///
/// A node may crash after an entry's effects reached the chain but before the hard state recording
/// that entry as committed was written. The stored applied index is then ahead of `committed`, and
/// is rolled back so that the consensus library does not see an applied index it never committed.
/// Entries between the two are delivered again and skipped because the chain already has them.
///
/// Everything up to the latest snapshot is reflected in the chain, so the result is never below
/// `snapshot_index`.
pub(crate) fn reconcile_applied_index(stored: u64, committed: u64, snapshot_index: u64) -> u64 {
    let applied = if committed < stored {
        log::warn!(
            "rolling applied index back from {} to the last durably committed index {}",
            stored,
            committed
        );
        committed
    } else {
        stored
    };
    applied.max(snapshot_index)
}
