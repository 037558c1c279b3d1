// Copyright 2021-2022 Farcaster Devs
//
// This library is free software; you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public
// License as published by the Free Software Foundation; either
// version 3 of the License, or (at your option) any later version.
//
// This library is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this library; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301, USA

//! Base currency network and the immutable [`NetworkContext`] handed to every component at
//! construction time. The context carries the network and the three independent versions:
//! the P2P network version (wire compatibility), the local database version (persisted
//! records) and the trade protocol version (trade messages).
//!
//! Persisted records are sealed in an envelope made of magic bytes and the local database
//! version, see [`seal`] and [`open`].

use std::fmt;
use std::io;
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

use crate::consensus::{self, Decodable, Encodable};

/// Version of the P2P network, any bump breaks wire compatibility between nodes.
pub const P2P_NETWORK_VERSION: &str = "A";
/// Version of the locally persisted records.
pub const LOCAL_DB_VERSION: u16 = 1;
/// Version of the trade protocol messages.
pub const TRADE_PROTOCOL_VERSION: u16 = 3;

/// Version compatibility errors. They are never resolved silently: a record or a message carrying
/// another version is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer runs another trade protocol version.
    #[error("Trade protocol version mismatch, expected {expected} found {found}")]
    ProtocolVersionMismatch { expected: u16, found: u16 },
    /// The record was written by another local database version.
    #[error("Local database version mismatch, expected {expected} found {found}")]
    DbVersionMismatch { expected: u16, found: u16 },
    /// The P2P message version differs from ours.
    #[error("P2P message version mismatch, expected {expected} found {found}")]
    MessageVersionMismatch { expected: String, found: String },
    /// The network name is unknown.
    #[error("Unknown network {0}")]
    UnknownNetwork(String),
    /// A version string is not in semantic version format.
    #[error("Version number must be in semantic version format (contain 2 '.'), version={0}")]
    InvalidVersion(String),
}

/// Monero network the node runs on.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network.
    Mainnet,
    /// Local regtest-like network.
    Local,
    /// Public test network.
    Stagenet,
}

impl Network {
    /// Numeric identifier of the network, used as the prefix of the P2P message version.
    pub fn id(&self) -> u8 {
        match self {
            Network::Mainnet => 0,
            Network::Local => 1,
            Network::Stagenet => 2,
        }
    }

    pub fn is_mainnet(&self) -> bool {
        matches!(self, Network::Mainnet)
    }

    /// Local and stagenet are test networks, trades run with short lock times there.
    pub fn is_test_network(&self) -> bool {
        !self.is_mainnet()
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::Mainnet
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "XMR_MAINNET"),
            Network::Local => write!(f, "XMR_LOCAL"),
            Network::Stagenet => write!(f, "XMR_STAGENET"),
        }
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Mainnet" | "mainnet" | "XMR_MAINNET" => Ok(Network::Mainnet),
            "Local" | "local" | "XMR_LOCAL" => Ok(Network::Local),
            "Stagenet" | "stagenet" | "XMR_STAGENET" => Ok(Network::Stagenet),
            _ => Err(Error::UnknownNetwork(s.to_string())),
        }
    }
}

impl Encodable for Network {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            Network::Mainnet => 0x01u8.consensus_encode(writer),
            Network::Local => 0x02u8.consensus_encode(writer),
            Network::Stagenet => 0x03u8.consensus_encode(writer),
        }
    }
}

impl Decodable for Network {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(Network::Mainnet),
            0x02u8 => Ok(Network::Local),
            0x03u8 => Ok(Network::Stagenet),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

impl_strict_encoding!(Network);

/// Immutable network and versions context. Built once at startup and cloned into every service,
/// nothing in the crate reads the network from a global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    network: Network,
    p2p_network_version: String,
    local_db_version: u16,
    trade_protocol_version: u16,
}

impl NetworkContext {
    /// Context with the versions compiled into this crate.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            p2p_network_version: P2P_NETWORK_VERSION.to_string(),
            local_db_version: LOCAL_DB_VERSION,
            trade_protocol_version: TRADE_PROTOCOL_VERSION,
        }
    }

    /// Context with explicit versions, used to simulate a peer or a record from another release.
    pub fn with_versions(
        network: Network,
        p2p_network_version: impl Into<String>,
        local_db_version: u16,
        trade_protocol_version: u16,
    ) -> Self {
        Self {
            network,
            p2p_network_version: p2p_network_version.into(),
            local_db_version,
            trade_protocol_version,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn is_test_network(&self) -> bool {
        self.network.is_test_network()
    }

    pub fn local_db_version(&self) -> u16 {
        self.local_db_version
    }

    pub fn trade_protocol_version(&self) -> u16 {
        self.trade_protocol_version
    }

    /// The network identifier followed by the P2P network version, e.g. `0A` on mainnet.
    pub fn p2p_message_version(&self) -> String {
        format!("{}{}", self.network.id(), self.p2p_network_version)
    }

    pub fn check_trade_protocol_version(&self, found: u16) -> Result<(), Error> {
        if found != self.trade_protocol_version {
            warn!(
                expected = self.trade_protocol_version,
                found, "Rejecting trade protocol version"
            );
            return Err(Error::ProtocolVersionMismatch {
                expected: self.trade_protocol_version,
                found,
            });
        }
        Ok(())
    }

    pub fn check_db_version(&self, found: u16) -> Result<(), Error> {
        if found != self.local_db_version {
            warn!(
                expected = self.local_db_version,
                found, "Rejecting persisted record"
            );
            return Err(Error::DbVersionMismatch {
                expected: self.local_db_version,
                found,
            });
        }
        Ok(())
    }

    pub fn check_p2p_message_version(&self, found: &str) -> Result<(), Error> {
        let expected = self.p2p_message_version();
        if found != expected {
            return Err(Error::MessageVersionMismatch {
                expected,
                found: found.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for NetworkContext {
    fn default() -> Self {
        Self::new(Network::default())
    }
}

/// Address of a peer on the P2P network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host_name: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host_name: impl Into<String>, port: u16) -> Self {
        Self {
            host_name: host_name.into(),
            port,
        }
    }

    pub fn full_address(&self) -> String {
        format!("{}:{}", self.host_name, self.port)
    }

    pub fn is_onion(&self) -> bool {
        self.host_name.ends_with(".onion")
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_name, self.port)
    }
}

impl Encodable for NodeAddress {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let len = self.host_name.consensus_encode(writer)?;
        Ok(len + self.port.consensus_encode(writer)?)
    }
}

impl Decodable for NodeAddress {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self {
            host_name: Decodable::consensus_decode(d)?,
            port: Decodable::consensus_decode(d)?,
        })
    }
}

impl_strict_encoding!(NodeAddress);

/// Errors raised while opening a sealed record.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::Error),
    #[error("Version error: {0}")]
    Version(#[from] Error),
}

/// Seal a record with its magic bytes and the local database version of `ctx`.
pub fn seal<T: Encodable>(
    magic: &[u8; 6],
    ctx: &NetworkContext,
    record: &T,
) -> Result<Vec<u8>, consensus::Error> {
    let mut out = Vec::new();
    magic.consensus_encode(&mut out)?;
    ctx.local_db_version.consensus_encode(&mut out)?;
    record.consensus_encode(&mut out)?;
    Ok(out)
}

/// Open a record sealed with [`seal`]. Magic bytes and database version must both match.
pub fn open<T: Decodable>(
    magic: &[u8; 6],
    ctx: &NetworkContext,
    bytes: &[u8],
) -> Result<T, RecordError> {
    let mut d = io::Cursor::new(bytes);
    let found_magic: [u8; 6] = Decodable::consensus_decode(&mut d)?;
    if &found_magic != magic {
        return Err(consensus::Error::IncorrectMagicBytes.into());
    }
    let version = u16::consensus_decode(&mut d)?;
    ctx.check_db_version(version)?;
    let record = T::consensus_decode(&mut d)?;
    if d.position() as usize != bytes.len() {
        return Err(consensus::Error::ParseFailed("trailing bytes after record").into());
    }
    Ok(record)
}

fn sub_version(version: &str, index: usize) -> Result<u32, Error> {
    let split: Vec<&str> = version.split('.').collect();
    if split.len() != 3 {
        return Err(Error::InvalidVersion(version.to_string()));
    }
    split[index]
        .parse()
        .map_err(|_| Error::InvalidVersion(version.to_string()))
}

fn semantic(version: &str) -> Result<(u32, u32, u32), Error> {
    Ok((
        sub_version(version, 0)?,
        sub_version(version, 1)?,
        sub_version(version, 2)?,
    ))
}

/// Compare two semantic versions `major.minor.patch`.
pub fn compare_versions(a: &str, b: &str) -> Result<std::cmp::Ordering, Error> {
    Ok(semantic(a)?.cmp(&semantic(b)?))
}

/// Whether `new_version` is strictly newer than `current_version`.
pub fn is_new_version(new_version: &str, current_version: &str) -> Result<bool, Error> {
    Ok(compare_versions(new_version, current_version)? == std::cmp::Ordering::Greater)
}
