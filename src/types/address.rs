/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Durable identities of cluster members.
//!
//! An [`Address`] is what the cluster remembers about a member: its [`RaftId`], its [`NodeId`], where
//! to reach it, and on which ports it serves the data-plane p2p protocol and the consensus transport.
//! Addresses travel inside membership-change entries and snapshots, and are never mutated after
//! construction.
//!
//! Operators refer to nodes with [`PeerDescriptor`]s, URLs of the form:
//!
//! ```text
//! enode://<64 hex chars of the node's Ed25519 public key>@<host>:<p2p port>?raftport=<raft port>
//! ```

use std::{
    fmt::{self, Display, Formatter},
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;

use super::{
    data_types::{NodeId, RaftId},
    encoding::VersionedEncoding,
};

const DESCRIPTOR_SCHEME: &str = "enode://";
const RAFT_PORT_PARAM: &str = "raftport";

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Address {
    pub raft_id: RaftId,
    pub node_id: NodeId,
    pub host: String,
    pub p2p_port: u16,
    pub raft_port: u16,
}

impl VersionedEncoding for Address {
    const VERSION: u8 = 1;
}

impl Address {
    /// Build the address of member `raft_id` from a descriptor that already passed
    /// [`PeerDescriptor::validate`].
    pub fn new(raft_id: RaftId, descriptor: &PeerDescriptor) -> Result<Address, AddressError> {
        Ok(Address {
            raft_id,
            node_id: descriptor.node_id,
            host: descriptor.host.clone(),
            p2p_port: descriptor.p2p_port,
            raft_port: descriptor.raft_port.ok_or(AddressError::MissingRaftPort)?,
        })
    }

    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor {
            node_id: self.node_id,
            host: self.host.clone(),
            p2p_port: self.p2p_port,
            raft_port: Some(self.raft_port),
        }
    }

    /// Socket address of this member's consensus transport.
    pub fn raft_socket_addr(&self) -> Result<SocketAddr, AddressError> {
        resolve(&self.host, self.raft_port)
    }
}

/// A parsed `enode://` URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub node_id: NodeId,
    pub host: String,
    pub p2p_port: u16,
    pub raft_port: Option<u16>,
}

impl PeerDescriptor {
    /// Checks that a member could actually be reached through this descriptor: the host resolves to
    /// a usable address and a non-zero consensus transport port is advertised.
    pub fn validate(&self) -> Result<(), AddressError> {
        let resolved = resolve(&self.host, self.p2p_port)?;
        if resolved.ip().is_unspecified() {
            return Err(AddressError::UnusableHost(self.host.clone()));
        }
        match self.raft_port {
            None => Err(AddressError::MissingRaftPort),
            Some(0) => Err(AddressError::InvalidRaftPort("0".to_string())),
            Some(_) => Ok(()),
        }
    }
}

impl FromStr for PeerDescriptor {
    type Err = AddressError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let rest = url
            .strip_prefix(DESCRIPTOR_SCHEME)
            .ok_or(AddressError::MissingScheme)?;
        let (node_id, rest) = rest
            .split_once('@')
            .ok_or_else(|| AddressError::MissingHost(url.to_string()))?;
        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };

        let node_id = parse_node_id(node_id)?;
        let (host, p2p_port) = split_host_port(authority)?;

        let mut raft_port = None;
        for pair in query.into_iter().flat_map(|query| query.split('&')) {
            if let Some((RAFT_PORT_PARAM, value)) = pair.split_once('=') {
                raft_port = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| AddressError::InvalidRaftPort(value.to_string()))?,
                );
            }
        }

        Ok(PeerDescriptor {
            node_id,
            host,
            p2p_port,
            raft_port,
        })
    }
}

impl Display for PeerDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}@", DESCRIPTOR_SCHEME, self.node_id)?;
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.p2p_port)?;
        } else {
            write!(f, "{}:{}", self.host, self.p2p_port)?;
        }
        if let Some(raft_port) = self.raft_port {
            write!(f, "?{}={}", RAFT_PORT_PARAM, raft_port)?;
        }
        Ok(())
    }
}

fn parse_node_id(hex_str: &str) -> Result<NodeId, AddressError> {
    let bytes: [u8; 32] = hex::decode(hex_str)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| AddressError::InvalidNodeId(hex_str.to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| AddressError::InvalidNodeId(hex_str.to_string()))?;
    Ok(NodeId::new(bytes))
}

// Accepts "host:port" and "[v6 address]:port".
fn split_host_port(authority: &str) -> Result<(String, u16), AddressError> {
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, rest) = bracketed
            .split_once(']')
            .ok_or_else(|| AddressError::MissingHost(authority.to_string()))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| AddressError::InvalidPort(authority.to_string()))?;
        (host, port)
    } else {
        authority
            .rsplit_once(':')
            .ok_or_else(|| AddressError::InvalidPort(authority.to_string()))?
    };
    if host.is_empty() {
        return Err(AddressError::MissingHost(authority.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(port.to_string()))?;
    Ok((host.to_string(), port))
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, AddressError> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| AddressError::UnresolvableHost(host.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    MissingScheme,
    MissingHost(String),
    InvalidNodeId(String),
    InvalidPort(String),
    UnresolvableHost(String),
    UnusableHost(String),
    MissingRaftPort,
    InvalidRaftPort(String),
}

impl Display for AddressError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::MissingScheme => write!(f, "peer url must start with {}", DESCRIPTOR_SCHEME),
            AddressError::MissingHost(url) => write!(f, "no host in peer url {}", url),
            AddressError::InvalidNodeId(id) => write!(f, "invalid node id {}", id),
            AddressError::InvalidPort(port) => write!(f, "invalid port {}", port),
            AddressError::UnresolvableHost(host) => write!(f, "cannot resolve host {}", host),
            AddressError::UnusableHost(host) => write!(f, "host {} is not a usable address", host),
            AddressError::MissingRaftPort => write!(f, "peer url must specify a raftport"),
            AddressError::InvalidRaftPort(port) => write!(f, "invalid raftport {}", port),
        }
    }
}

impl std::error::Error for AddressError {}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    use super::*;

    fn node_id_hex() -> String {
        hex::encode(SigningKey::generate(&mut OsRng).verifying_key().to_bytes())
    }

    #[test]
    fn parse_full_descriptor() {
        let id = node_id_hex();
        let descriptor: PeerDescriptor = format!("enode://{}@127.0.0.1:21000?discport=0&raftport=50401", id)
            .parse()
            .unwrap();
        assert_eq!(descriptor.host, "127.0.0.1");
        assert_eq!(descriptor.p2p_port, 21000);
        assert_eq!(descriptor.raft_port, Some(50401));
        assert_eq!(descriptor.node_id.to_string(), id);
        assert!(descriptor.validate().is_ok());
    }

    #[test]
    fn descriptor_display_parses_back() {
        let text = format!("enode://{}@[::1]:30303?raftport=50400", node_id_hex());
        let descriptor: PeerDescriptor = text.parse().unwrap();
        assert_eq!(descriptor.host, "::1");
        assert_eq!(descriptor.to_string(), text);
    }

    #[test]
    fn descriptor_without_raftport_fails_validation() {
        let descriptor: PeerDescriptor = format!("enode://{}@127.0.0.1:21000", node_id_hex())
            .parse()
            .unwrap();
        assert_eq!(descriptor.validate(), Err(AddressError::MissingRaftPort));
        assert_eq!(
            Address::new(RaftId::new(2), &descriptor),
            Err(AddressError::MissingRaftPort)
        );
    }

    #[test]
    fn malformed_descriptors_are_rejected() {
        let id = node_id_hex();
        assert_eq!(
            "http://x@127.0.0.1:1".parse::<PeerDescriptor>(),
            Err(AddressError::MissingScheme)
        );
        assert!(matches!(
            "enode://abcd@127.0.0.1:1".parse::<PeerDescriptor>(),
            Err(AddressError::InvalidNodeId(_))
        ));
        assert!(matches!(
            format!("enode://{}@127.0.0.1", id).parse::<PeerDescriptor>(),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            format!("enode://{}@127.0.0.1:1?raftport=x", id).parse::<PeerDescriptor>(),
            Err(AddressError::InvalidRaftPort(_))
        ));
    }

    #[test]
    fn unspecified_host_is_unusable() {
        let descriptor: PeerDescriptor = format!("enode://{}@0.0.0.0:21000?raftport=1", node_id_hex())
            .parse()
            .unwrap();
        assert!(matches!(
            descriptor.validate(),
            Err(AddressError::UnusableHost(_))
        ));
    }

    #[test]
    fn address_encoding_is_versioned() {
        let descriptor: PeerDescriptor = format!("enode://{}@localhost:21000?raftport=50400", node_id_hex())
            .parse()
            .unwrap();
        let address = Address::new(RaftId::new(3), &descriptor).unwrap();
        let bytes = address.encode();
        assert_eq!(bytes[0], Address::VERSION);
        assert_eq!(Address::decode(&bytes).unwrap(), address);
    }
}
