/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Versioned binary encoding for values that are persisted or carried inside Raft log entries.
//!
//! Encoded values are a single version byte followed by the borsh encoding of the value. Raft log
//! entries and snapshots outlive the process that wrote them, so a decoder must be able to tell
//! which layout it is looking at before it reads a single field.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

pub trait VersionedEncoding: BorshSerialize + BorshDeserialize {
    /// Layout version written in front of every encoding of this type.
    const VERSION: u8;

    fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![Self::VERSION];
        bytes.extend(self.try_to_vec().unwrap());
        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        match bytes.split_first() {
            None => Err(DecodeError::Empty),
            Some((version, _)) if *version != Self::VERSION => {
                Err(DecodeError::UnsupportedVersion(*version))
            }
            Some((_, body)) => Self::try_from_slice(body).map_err(DecodeError::Malformed),
        }
    }
}

#[derive(Debug)]
pub enum DecodeError {
    Empty,
    UnsupportedVersion(u8),
    Malformed(std::io::Error),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "empty encoding"),
            DecodeError::UnsupportedVersion(version) => {
                write!(f, "unsupported encoding version {}", version)
            }
            DecodeError::Malformed(err) => write!(f, "malformed encoding: {}", err),
        }
    }
}

impl std::error::Error for DecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, BorshSerialize, BorshDeserialize)]
    struct Sample {
        a: u32,
        b: String,
    }

    impl VersionedEncoding for Sample {
        const VERSION: u8 = 3;
    }

    #[test]
    fn version_byte_leads_the_encoding() {
        let bytes = Sample { a: 7, b: "x".into() }.encode();
        assert_eq!(bytes[0], 3);
    }

    #[test]
    fn foreign_version_is_rejected() {
        let mut bytes = Sample { a: 7, b: "x".into() }.encode();
        bytes[0] = 4;
        assert!(matches!(
            Sample::decode(&bytes),
            Err(DecodeError::UnsupportedVersion(4))
        ));
        assert!(matches!(Sample::decode(&[]), Err(DecodeError::Empty)));
    }

    #[test]
    fn truncated_body_is_malformed() {
        let bytes = Sample { a: 7, b: "hello".into() }.encode();
        assert!(matches!(
            Sample::decode(&bytes[..bytes.len() - 2]),
            Err(DecodeError::Malformed(_))
        ));
    }
}
