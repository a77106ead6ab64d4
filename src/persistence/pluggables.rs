/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for the pluggable key-value store the coordinator keeps its applied index in.

use std::fmt::{self, Display, Formatter};

use super::applied_index::APPLIED_INDEX;

pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;

    /// Atomically and durably apply `wb`. When this returns `Ok`, the writes survive a crash.
    fn write(&mut self, wb: Self::WriteBatch) -> Result<(), KVStoreError>;
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /* ↓↓↓ Applied Index ↓↓↓ */

    /// The last Raft log index applied to the chain, or `None` if the store has never recorded one.
    fn applied_index(&self) -> Result<Option<u64>, KVGetError> {
        match self.get(APPLIED_INDEX) {
            None => Ok(None),
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| KVGetError::MalformedValue {
                        key: Key::AppliedIndex,
                        len: bytes.len(),
                    })?;
                Ok(Some(u64::from_le_bytes(bytes)))
            }
        }
    }
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// Error when a value read from the [key value store][KVStore] does not have the expected layout.
#[derive(Debug)]
pub enum KVGetError {
    MalformedValue { key: Key, len: usize },
}

impl Display for KVGetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KVGetError::MalformedValue { key, len } => {
                write!(f, "{} has an unexpected length of {} bytes", key, len)
            }
        }
    }
}

impl std::error::Error for KVGetError {}

#[derive(Debug)]
pub enum Key {
    AppliedIndex,
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Key::AppliedIndex => write!(f, "Applied Index"),
        }
    }
}

/// Error when opening or writing to a [key value store][KVStore].
#[derive(Debug)]
pub enum KVStoreError {
    Io(std::io::Error),
    /// Neither the store's file nor its backup could be read.
    Unrecoverable { path: String },
}

impl Display for KVStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KVStoreError::Io(err) => write!(f, "key-value store io error: {}", err),
            KVStoreError::Unrecoverable { path } => {
                write!(f, "key-value store at {} is corrupt and has no usable backup", path)
            }
        }
    }
}

impl std::error::Error for KVStoreError {}

impl From<std::io::Error> for KVStoreError {
    fn from(err: std::io::Error) -> Self {
        KVStoreError::Io(err)
    }
}
