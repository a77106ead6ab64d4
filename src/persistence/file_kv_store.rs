/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A small, durable, file-backed implementation of [`KVStore`].
//!
//! The whole store is held in memory and rewritten on every [`write`](KVStore::write):
//! 1. The new contents, prefixed with their SHA256 checksum, are written to `<path>.tmp` and fsynced.
//! 2. The current file is renamed to `<path>.bak`.
//! 3. `<path>.tmp` is renamed to `<path>`, and the directory is fsynced.
//!
//! On [`open`](FileKVStore::open), a missing or corrupt `<path>` is recovered from `<path>.bak`. Only
//! when both are unreadable does opening fail.
//!
//! This is meant for stores that hold a handful of small keys, like the applied index.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::crypto_primitives;

use super::pluggables::{KVGet, KVStore, KVStoreError, WriteBatch};

type Contents = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Clone)]
pub struct FileKVStore {
    path: PathBuf,
    contents: Arc<Mutex<Contents>>,
}

impl FileKVStore {
    /// Open the store at `path`, creating an empty one if neither `path` nor its backup exist.
    pub fn open(path: impl AsRef<Path>) -> Result<FileKVStore, KVStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let backup = with_suffix(&path, "bak");

        let contents = match (read_contents(&path), read_contents(&backup)) {
            (Some(contents), _) => contents,
            (None, Some(contents)) => {
                log::warn!(
                    "recovered key-value store {} from its backup",
                    path.display()
                );
                persist(&path, &contents)?;
                contents
            }
            (None, None) if !path.exists() && !backup.exists() => Contents::new(),
            (None, None) => {
                return Err(KVStoreError::Unrecoverable {
                    path: path.display().to_string(),
                })
            }
        };

        Ok(FileKVStore {
            path,
            contents: Arc::new(Mutex::new(contents)),
        })
    }
}

impl KVStore for FileKVStore {
    type WriteBatch = FileWriteBatch;

    fn write(&mut self, wb: Self::WriteBatch) -> Result<(), KVStoreError> {
        let mut contents = self.contents.lock().unwrap();
        let mut updated = contents.clone();
        for (key, value) in wb.insertions {
            updated.insert(key, value);
        }
        for key in wb.deletions {
            updated.remove(&key);
        }
        persist(&self.path, &updated)?;
        *contents = updated;
        Ok(())
    }
}

impl KVGet for FileKVStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.contents.lock().unwrap().get(key).cloned()
    }
}

pub struct FileWriteBatch {
    insertions: BTreeMap<Vec<u8>, Vec<u8>>,
    deletions: BTreeSet<Vec<u8>>,
}

impl WriteBatch for FileWriteBatch {
    fn new() -> Self {
        FileWriteBatch {
            insertions: BTreeMap::new(),
            deletions: BTreeSet::new(),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        let _ = self.deletions.remove(key);
        self.insertions.insert(key.to_vec(), value.to_vec());
    }

    fn delete(&mut self, key: &[u8]) {
        let _ = self.insertions.remove(key);
        self.deletions.insert(key.to_vec());
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn read_contents(path: &Path) -> Option<Contents> {
    let bytes = fs::read(path).ok()?;
    if bytes.len() < 32 {
        return None;
    }
    let (checksum, body) = bytes.split_at(32);
    if crypto_primitives::hash(body).bytes() != checksum {
        log::warn!("checksum mismatch in key-value store file {}", path.display());
        return None;
    }
    Contents::try_from_slice(body).ok()
}

fn persist(path: &Path, contents: &Contents) -> Result<(), KVStoreError> {
    let body = contents.try_to_vec()?;
    let tmp = with_suffix(path, "tmp");
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
    if path.exists() {
        fs::rename(path, with_suffix(path, "bak"))?;
    }
    fs::rename(&tmp, path)?;
    sync_dir(path)?;
    Ok(())
}

pub(crate) fn sync_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::applied_index::write_applied_index;

    #[test]
    fn applied_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft-state");

        let mut store = FileKVStore::open(&path).unwrap();
        assert_eq!(store.applied_index().unwrap(), None);
        write_applied_index(&mut store, 42).unwrap();
        write_applied_index(&mut store, 43).unwrap();

        let reopened = FileKVStore::open(&path).unwrap();
        assert_eq!(reopened.applied_index().unwrap(), Some(43));
    }

    #[test]
    fn corrupt_file_recovers_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft-state");

        let mut store = FileKVStore::open(&path).unwrap();
        write_applied_index(&mut store, 7).unwrap();
        write_applied_index(&mut store, 8).unwrap();
        fs::write(&path, b"garbage that is long enough to look like a checksum").unwrap();

        let recovered = FileKVStore::open(&path).unwrap();
        assert_eq!(recovered.applied_index().unwrap(), Some(7));
    }

    #[test]
    fn missing_file_recovers_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft-state");

        let mut store = FileKVStore::open(&path).unwrap();
        write_applied_index(&mut store, 1).unwrap();
        write_applied_index(&mut store, 2).unwrap();
        // A crash between the two renames leaves only the backup behind.
        fs::remove_file(&path).unwrap();

        let recovered = FileKVStore::open(&path).unwrap();
        assert_eq!(recovered.applied_index().unwrap(), Some(1));
    }

    #[test]
    fn corrupt_file_and_backup_is_unrecoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft-state");
        fs::write(&path, b"not a store").unwrap();
        fs::write(with_suffix(&path, "bak"), b"not a store either").unwrap();

        assert!(matches!(
            FileKVStore::open(&path),
            Err(KVStoreError::Unrecoverable { .. })
        ));
    }
}
