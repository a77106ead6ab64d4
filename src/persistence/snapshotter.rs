/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Snapshot files.
//!
//! Each snapshot is saved as `<term>-<index>.snap` (both as 16 hex digits, so that lexical order is
//! chronological order) containing the SHA256 checksum of the protobuf-encoded snapshot followed by
//! the encoding itself. Loading picks the newest file that passes its checksum; files that do not
//! are renamed to `.broken` and skipped.

use std::{
    fmt::{self, Display, Formatter},
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use protobuf::Message as PbMessage;
use raft::eraftpb::Snapshot;

use crate::types::crypto_primitives;

use super::file_kv_store::sync_dir;

const SNAP_SUFFIX: &str = ".snap";

pub struct Snapshotter {
    dir: PathBuf,
}

impl Snapshotter {
    pub fn new(dir: &Path) -> Result<Snapshotter, SnapshotterError> {
        fs::create_dir_all(dir)?;
        Ok(Snapshotter {
            dir: dir.to_path_buf(),
        })
    }

    /// Durably write `snapshot`. Empty snapshots are not written.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotterError> {
        let metadata = snapshot.get_metadata();
        if metadata.index == 0 {
            return Ok(());
        }
        let body = snapshot.write_to_bytes()?;
        let path = self.dir.join(snapshot_file_name(metadata.term, metadata.index));
        let tmp = path.with_extension("snap.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&crypto_primitives::hash(&body).bytes())?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        sync_dir(&path)?;
        Ok(())
    }

    /// The newest snapshot on disk that can be read, if any.
    pub fn load(&self) -> Result<Option<Snapshot>, SnapshotterError> {
        let mut names: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(SNAP_SUFFIX))
            .collect();
        names.sort();

        for name in names.iter().rev() {
            let path = self.dir.join(name);
            match read_snapshot(&path) {
                Some(snapshot) => return Ok(Some(snapshot)),
                None => {
                    log::warn!("skipping unreadable snapshot {}", path.display());
                    let _ = fs::rename(&path, path.with_extension("broken"));
                }
            }
        }
        Ok(None)
    }

    /// Delete the snapshots older than index `index`.
    pub fn release_before(&self, index: u64) -> Result<(), SnapshotterError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().into_string().ok() else {
                continue;
            };
            if snapshot_index(&name).map_or(false, |snapshot| snapshot < index) {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

fn snapshot_index(file_name: &str) -> Option<u64> {
    let (_, index) = file_name.strip_suffix(SNAP_SUFFIX)?.split_once('-')?;
    u64::from_str_radix(index, 16).ok()
}

fn snapshot_file_name(term: u64, index: u64) -> String {
    format!("{:016x}-{:016x}{}", term, index, SNAP_SUFFIX)
}

fn read_snapshot(path: &Path) -> Option<Snapshot> {
    let bytes = fs::read(path).ok()?;
    if bytes.len() < 32 {
        return None;
    }
    let (checksum, body) = bytes.split_at(32);
    if crypto_primitives::hash(body).bytes() != checksum {
        return None;
    }
    let mut snapshot = Snapshot::default();
    snapshot.merge_from_bytes(body).ok()?;
    Some(snapshot)
}

#[derive(Debug)]
pub enum SnapshotterError {
    Io(std::io::Error),
    Encode(protobuf::ProtobufError),
}

impl Display for SnapshotterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotterError::Io(err) => write!(f, "snapshot io error: {}", err),
            SnapshotterError::Encode(err) => write!(f, "cannot encode snapshot: {}", err),
        }
    }
}

impl std::error::Error for SnapshotterError {}

impl From<std::io::Error> for SnapshotterError {
    fn from(err: std::io::Error) -> Self {
        SnapshotterError::Io(err)
    }
}

impl From<protobuf::ProtobufError> for SnapshotterError {
    fn from(err: protobuf::ProtobufError) -> Self {
        SnapshotterError::Encode(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(term: u64, index: u64, data: &[u8]) -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().term = term;
        snapshot.mut_metadata().index = index;
        snapshot.mut_metadata().mut_conf_state().voters = vec![1, 2, 3];
        snapshot.data = data.to_vec().into();
        snapshot
    }

    #[test]
    fn load_returns_newest() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = Snapshotter::new(dir.path()).unwrap();
        assert!(snapshotter.load().unwrap().is_none());

        snapshotter.save(&snapshot(1, 250, b"old")).unwrap();
        snapshotter.save(&snapshot(2, 500, b"new")).unwrap();
        // Term ordering comes first in the file name.
        snapshotter.save(&snapshot(1, 300, b"stale term")).unwrap();

        let loaded = snapshotter.load().unwrap().unwrap();
        assert_eq!(loaded.get_metadata().index, 500);
        assert_eq!(&loaded.data[..], b"new");
        assert_eq!(loaded.get_metadata().get_conf_state().voters, vec![1, 2, 3]);
    }

    #[test]
    fn broken_newest_falls_back_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = Snapshotter::new(dir.path()).unwrap();
        snapshotter.save(&snapshot(1, 250, b"good")).unwrap();
        snapshotter.save(&snapshot(1, 500, b"bad")).unwrap();
        fs::write(dir.path().join(snapshot_file_name(1, 500)), b"torn").unwrap();

        let loaded = snapshotter.load().unwrap().unwrap();
        assert_eq!(loaded.get_metadata().index, 250);
        assert!(!dir.path().join(snapshot_file_name(1, 500)).exists());
    }

    #[test]
    fn release_deletes_older_snapshots_only() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = Snapshotter::new(dir.path()).unwrap();
        snapshotter.save(&snapshot(1, 1, b"bootstrap")).unwrap();
        snapshotter.save(&snapshot(1, 250, b"kept")).unwrap();
        snapshotter.save(&snapshot(2, 500, b"newest")).unwrap();

        snapshotter.release_before(250).unwrap();
        assert!(!dir.path().join(snapshot_file_name(1, 1)).exists());
        assert!(dir.path().join(snapshot_file_name(1, 250)).exists());
        assert_eq!(snapshotter.load().unwrap().unwrap().get_metadata().index, 500);
    }

    #[test]
    fn empty_snapshot_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = Snapshotter::new(dir.path()).unwrap();
        snapshotter.save(&Snapshot::default()).unwrap();
        assert!(snapshotter.load().unwrap().is_none());
    }
}
