/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Volatile raft log storage.
//!
//! Entries and the hard state live in a [`MemStorage`]; durability comes from the WAL and the
//! snapshotter, which are written before anything reaches this storage. The one thing `MemStorage`
//! cannot do for us is serve snapshots we built ourselves, so the latest snapshot is kept alongside
//! it and handed to the consensus library when a lagging follower needs one.

use std::sync::{Arc, RwLock};

use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use raft::{GetEntriesContext, RaftState, Storage, StorageError};

#[derive(Clone)]
pub(crate) struct RaftStorage {
    mem: MemStorage,
    latest_snapshot: Arc<RwLock<Snapshot>>,
}

impl RaftStorage {
    pub(crate) fn new() -> RaftStorage {
        RaftStorage {
            mem: MemStorage::new(),
            latest_snapshot: Arc::new(RwLock::new(Snapshot::default())),
        }
    }

    /// Replace the log with `snapshot` and remember it as the snapshot to serve.
    pub(crate) fn apply_snapshot(&self, snapshot: Snapshot) -> raft::Result<()> {
        self.mem.wl().apply_snapshot(snapshot.clone())?;
        *self.latest_snapshot.write().unwrap() = snapshot;
        Ok(())
    }

    pub(crate) fn append(&self, entries: &[Entry]) -> raft::Result<()> {
        self.mem.wl().append(entries)
    }

    pub(crate) fn set_hard_state(&self, hard_state: HardState) {
        self.mem.wl().set_hardstate(hard_state);
    }

    pub(crate) fn hard_state(&self) -> HardState {
        self.mem.rl().hard_state().clone()
    }

    pub(crate) fn set_commit(&self, commit: u64) {
        self.mem.wl().mut_hard_state().commit = commit;
    }

    /// Build a snapshot of the log up to `index`, make it the snapshot to serve, and drop the entries
    /// before `index`.
    pub(crate) fn create_snapshot(
        &self,
        index: u64,
        term: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> raft::Result<Snapshot> {
        let mut snapshot = Snapshot::default();
        snapshot.data = data.into();
        let metadata = snapshot.mut_metadata();
        metadata.index = index;
        metadata.term = term;
        metadata.set_conf_state(conf_state);

        *self.latest_snapshot.write().unwrap() = snapshot.clone();
        self.mem.wl().compact(index)?;
        Ok(snapshot)
    }
}

impl Storage for RaftStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let snapshot = self.latest_snapshot.read().unwrap();
        let index = snapshot.get_metadata().index;
        if index == 0 || index < request_index {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> Entry {
        let mut entry = Entry::default();
        entry.index = index;
        entry.term = term;
        entry
    }

    fn snapshot_at(index: u64, term: u64) -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = index;
        snapshot.mut_metadata().term = term;
        snapshot.mut_metadata().mut_conf_state().voters = vec![1];
        snapshot
    }

    #[test]
    fn serves_no_snapshot_until_one_exists() {
        let storage = RaftStorage::new();
        assert!(matches!(
            storage.snapshot(0, 2),
            Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable))
        ));
    }

    #[test]
    fn created_snapshot_compacts_and_is_served() {
        let storage = RaftStorage::new();
        storage.apply_snapshot(snapshot_at(1, 1)).unwrap();
        storage
            .append(&[entry(2, 1), entry(3, 1), entry(4, 2), entry(5, 2)])
            .unwrap();

        let mut conf_state = ConfState::default();
        conf_state.voters = vec![1, 2];
        storage.create_snapshot(4, 2, conf_state, b"payload".to_vec()).unwrap();

        assert_eq!(storage.first_index().unwrap(), 4);
        assert_eq!(storage.last_index().unwrap(), 5);
        let served = storage.snapshot(0, 2).unwrap();
        assert_eq!(served.get_metadata().index, 4);
        assert_eq!(served.get_metadata().get_conf_state().voters, vec![1, 2]);
        assert_eq!(&served.data[..], b"payload");
        assert!(storage.snapshot(5, 2).is_err());
    }
}
