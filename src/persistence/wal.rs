/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Write-ahead log of Raft hard states, log entries and snapshot markers.
//!
//! ## Record format
//!
//! The log is a single append-only file of records:
//!
//! ```text
//! | length: u32 LE | checksum: 4 bytes | kind: u8 | payload: length bytes |
//! ```
//!
//! The checksum is the first 4 bytes of the SHA256 of `kind ‖ payload`. Hard states and entries are
//! protobuf-encoded; snapshot markers are borsh-encoded [`WalSnapshot`]s.
//!
//! ## Torn writes
//!
//! A crash in the middle of an append leaves a truncated record at the end of the file. Reading
//! truncates the file back to the last complete record. A complete record with a bad checksum is
//! corruption and is never repaired.
//!
//! ## Compaction
//!
//! [`release`](Wal::release) rewrites the log so that it starts at the second newest snapshot
//! marker, keeping one older snapshot to fall back to. The rewrite goes to a temporary file that
//! is then renamed over the log, so a crash leaves either the old log or the new one.

use std::{
    fmt::{self, Display, Formatter},
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use borsh::{BorshDeserialize, BorshSerialize};
use protobuf::Message as PbMessage;
use raft::eraftpb::{Entry, HardState};

use crate::types::crypto_primitives;

use super::file_kv_store::sync_dir;

const WAL_FILE: &str = "raft.wal";
const WAL_TMP_FILE: &str = "raft.wal.tmp";
const HEADER_LEN: usize = 9;

const KIND_HARD_STATE: u8 = 1;
const KIND_ENTRY: u8 = 2;
const KIND_SNAPSHOT: u8 = 3;

/// Marks the position of a snapshot in the log. Replay starts after the marker matching the snapshot
/// the node restored from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct WalSnapshot {
    pub index: u64,
    pub term: u64,
}

pub struct Wal {
    file: File,
    path: PathBuf,
    // Every snapshot marker in the log, oldest first.
    markers: Vec<WalSnapshot>,
}

// What replaying the log from some snapshot index yields.
struct Replay {
    hard_state: HardState,
    entries: Vec<Entry>,
    markers: Vec<WalSnapshot>,
}

impl Wal {
    pub fn exists(dir: &Path) -> bool {
        dir.join(WAL_FILE).exists()
    }

    /// Create a new, empty log in `dir`. Fails if one exists already.
    pub fn create(dir: &Path) -> Result<Wal, WalError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(WAL_FILE);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)?;
        sync_dir(&path)?;
        let mut wal = Wal {
            file,
            path,
            markers: Vec::new(),
        };
        wal.save_snapshot(WalSnapshot::default())?;
        Ok(wal)
    }

    /// Open the log in `dir`. Call [`read_all`](Wal::read_all) before appending to it.
    pub fn open(dir: &Path) -> Result<Wal, WalError> {
        let path = dir.join(WAL_FILE);
        let file = OpenOptions::new().read(true).append(true).open(&path)?;
        Ok(Wal {
            file,
            path,
            markers: Vec::new(),
        })
    }

    /// Read the whole log back, starting after the marker for `snapshot`.
    ///
    /// Returns the last hard state written and the entries after `snapshot.index`, with entries
    /// overwritten by later appends at the same index (after a leader change) discarded.
    pub fn read_all(&mut self, snapshot: WalSnapshot) -> Result<(HardState, Vec<Entry>), WalError> {
        let bytes = self.read_records()?;
        let replay = replay_from(&bytes, snapshot.index)?;
        if snapshot.index != 0 {
            match replay.markers.iter().find(|marker| marker.index == snapshot.index) {
                None => return Err(WalError::SnapshotNotFound(snapshot)),
                Some(marker) if marker.term != snapshot.term => {
                    return Err(WalError::SnapshotMismatch {
                        wal: *marker,
                        snapshot,
                    })
                }
                Some(_) => (),
            }
        }
        self.markers = replay.markers;
        Ok((replay.hard_state, replay.entries))
    }

    /// Discard every record that only the snapshots older than the second newest one need.
    ///
    /// Returns the oldest snapshot the log can still be replayed from, or `None` if there was
    /// nothing to discard. That is the newest snapshot when the second newest one has a gap in the
    /// entries after it.
    pub fn release(&mut self) -> Result<Option<WalSnapshot>, WalError> {
        if self.markers.len() <= 2 {
            return Ok(None);
        }
        let bytes = self.read_records()?;
        let older = self.markers[self.markers.len() - 2];
        let newest = self.markers[self.markers.len() - 1];
        // A snapshot received from the leader can jump past the entries logged so far, in which
        // case the older snapshot cannot be replayed from anyway.
        let (keep, replay) = match replay_from(&bytes, older.index) {
            Ok(replay) => (older, replay),
            Err(WalError::MissingEntries { .. }) => (newest, replay_from(&bytes, newest.index)?),
            Err(err) => return Err(err),
        };

        let mut buffer = Vec::new();
        let markers: Vec<WalSnapshot> = replay
            .markers
            .into_iter()
            .filter(|marker| marker.index >= keep.index)
            .collect();
        for marker in &markers {
            encode_record(&mut buffer, KIND_SNAPSHOT, &marker.try_to_vec()?);
        }
        for entry in &replay.entries {
            encode_record(&mut buffer, KIND_ENTRY, &entry.write_to_bytes()?);
        }
        if replay.hard_state != HardState::default() {
            encode_record(&mut buffer, KIND_HARD_STATE, &replay.hard_state.write_to_bytes()?);
        }

        // The handle is opened before the rename, so that it keeps following the log.
        let tmp = self.path.with_file_name(WAL_TMP_FILE);
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&tmp)?;
        file.write_all(&buffer)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        sync_dir(&self.path)?;
        self.file = file;

        log::debug!(
            "compacted {} from {} to {} bytes, keeping snapshot {}",
            self.path.display(),
            bytes.len(),
            buffer.len(),
            keep.index
        );
        self.markers = markers;
        Ok(Some(keep))
    }

    // The bytes of every complete record, after truncating a torn tail.
    fn read_records(&mut self) -> Result<Vec<u8>, WalError> {
        let mut bytes = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;

        let mut offset = 0;
        while offset < bytes.len() {
            match parse_record(&bytes[offset..]) {
                Ok(record) => offset += HEADER_LEN + record.payload.len(),
                Err(RecordError::Truncated) => {
                    log::warn!(
                        "truncating torn record at offset {} of {}",
                        offset,
                        self.path.display()
                    );
                    self.file.set_len(offset as u64)?;
                    self.file.sync_all()?;
                    bytes.truncate(offset);
                    break;
                }
                Err(RecordError::Checksum) => return Err(WalError::Corrupted { offset }),
            }
        }
        Ok(bytes)
    }

    /// Append `hard_state` (if any) and `entries`, then fsync.
    pub fn save(&mut self, hard_state: Option<&HardState>, entries: &[Entry]) -> Result<(), WalError> {
        if hard_state.is_none() && entries.is_empty() {
            return Ok(());
        }
        let mut buffer = Vec::new();
        for entry in entries {
            encode_record(&mut buffer, KIND_ENTRY, &entry.write_to_bytes()?);
        }
        if let Some(hard_state) = hard_state {
            encode_record(&mut buffer, KIND_HARD_STATE, &hard_state.write_to_bytes()?);
        }
        self.file.write_all(&buffer)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Append a snapshot marker, then fsync.
    pub fn save_snapshot(&mut self, snapshot: WalSnapshot) -> Result<(), WalError> {
        let mut buffer = Vec::new();
        encode_record(&mut buffer, KIND_SNAPSHOT, &snapshot.try_to_vec()?);
        self.file.write_all(&buffer)?;
        self.file.sync_data()?;
        if self.markers.last() != Some(&snapshot) {
            self.markers.push(snapshot);
        }
        Ok(())
    }
}

// Replays complete records in `bytes`, keeping the entries after `from_index`.
fn replay_from(bytes: &[u8], from_index: u64) -> Result<Replay, WalError> {
    let mut replay = Replay {
        hard_state: HardState::default(),
        entries: Vec::new(),
        markers: Vec::new(),
    };

    let mut offset = 0;
    while offset < bytes.len() {
        let record = match parse_record(&bytes[offset..]) {
            Ok(record) => record,
            Err(_) => return Err(WalError::Corrupted { offset }),
        };
        offset += HEADER_LEN + record.payload.len();

        match record.kind {
            KIND_HARD_STATE => {
                replay.hard_state = HardState::default();
                replay.hard_state.merge_from_bytes(record.payload)?;
            }
            KIND_ENTRY => {
                let mut entry = Entry::default();
                entry.merge_from_bytes(record.payload)?;
                if entry.index <= from_index {
                    continue;
                }
                let position = (entry.index - from_index - 1) as usize;
                if position > replay.entries.len() {
                    return Err(WalError::MissingEntries {
                        expected: from_index + replay.entries.len() as u64 + 1,
                        found: entry.index,
                    });
                }
                replay.entries.truncate(position);
                replay.entries.push(entry);
            }
            KIND_SNAPSHOT => {
                let marker = WalSnapshot::try_from_slice(record.payload)?;
                if replay.markers.last() != Some(&marker) {
                    replay.markers.push(marker);
                }
            }
            kind => return Err(WalError::UnknownRecordKind(kind)),
        }
    }
    Ok(replay)
}

struct Record<'a> {
    kind: u8,
    payload: &'a [u8],
}

enum RecordError {
    Truncated,
    Checksum,
}

fn checksum(kind: u8, payload: &[u8]) -> [u8; 4] {
    let mut bytes = Vec::with_capacity(payload.len() + 1);
    bytes.push(kind);
    bytes.extend_from_slice(payload);
    let hash = crypto_primitives::hash(&bytes).bytes();
    [hash[0], hash[1], hash[2], hash[3]]
}

fn encode_record(buffer: &mut Vec<u8>, kind: u8, payload: &[u8]) {
    buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buffer.extend_from_slice(&checksum(kind, payload));
    buffer.push(kind);
    buffer.extend_from_slice(payload);
}

fn parse_record(bytes: &[u8]) -> Result<Record<'_>, RecordError> {
    if bytes.len() < HEADER_LEN {
        return Err(RecordError::Truncated);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let kind = bytes[8];
    let payload = bytes
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or(RecordError::Truncated)?;
    if bytes[4..8] != checksum(kind, payload) {
        return Err(RecordError::Checksum);
    }
    Ok(Record { kind, payload })
}

#[derive(Debug)]
pub enum WalError {
    Io(std::io::Error),
    Decode(protobuf::ProtobufError),
    Corrupted { offset: usize },
    UnknownRecordKind(u8),
    MissingEntries { expected: u64, found: u64 },
    SnapshotNotFound(WalSnapshot),
    SnapshotMismatch { wal: WalSnapshot, snapshot: WalSnapshot },
}

impl Display for WalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WalError::Io(err) => write!(f, "wal io error: {}", err),
            WalError::Decode(err) => write!(f, "cannot decode wal record: {}", err),
            WalError::Corrupted { offset } => write!(f, "wal record at offset {} is corrupt", offset),
            WalError::UnknownRecordKind(kind) => write!(f, "unknown wal record kind {}", kind),
            WalError::MissingEntries { expected, found } => {
                write!(f, "wal skips from entry {} to entry {}", expected, found)
            }
            WalError::SnapshotNotFound(snapshot) => {
                write!(f, "wal has no marker for snapshot at index {}", snapshot.index)
            }
            WalError::SnapshotMismatch { wal, snapshot } => write!(
                f,
                "wal marker at index {} has term {}, snapshot has term {}",
                wal.index, wal.term, snapshot.term
            ),
        }
    }
}

impl std::error::Error for WalError {}

impl From<std::io::Error> for WalError {
    fn from(err: std::io::Error) -> Self {
        WalError::Io(err)
    }
}

impl From<protobuf::ProtobufError> for WalError {
    fn from(err: protobuf::ProtobufError) -> Self {
        WalError::Decode(err)
    }
}
