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

//! Core library of a peer-to-peer Monero exchange.
//!
//! A trade runs between a maker, a taker and an arbitrator. Each party drives its own copy of the
//! trade through the [`protocol`] task pipelines, the [`manager`] routes incoming messages to
//! them. Trust in a peer's payment account comes from the [`witness`] engine, failed trades are
//! resolved through the [`dispute`] engine.
//!
//! Wallet, network, persistence and filter are collaborators behind the traits of [`services`],
//! the library never talks to a daemon itself.

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate serde;

use thiserror::Error;

#[macro_use]
pub mod consensus;

pub mod clock;
pub mod config;
pub mod crypto;
pub mod dispute;
pub mod manager;
pub mod network;
pub mod offer;
pub mod payment;
pub mod price;
pub mod protocol;
pub mod restrictions;
pub mod role;
pub mod services;
pub mod task;
pub mod trade;
pub mod witness;

#[cfg(test)]
mod mock;

/// A list of possible errors when running the exchange core. Each error can wrap the error of
/// the module or the collaborator that raised it.
#[derive(Error, Debug)]
pub enum Error {
    /// A consensus error during encoding/decoding operation or data type missmatch.
    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::Error),
    /// A cryptographic error during key manipulation, signature creation or validation.
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] crypto::Error),
    /// A collaborator (wallet, network, persistence) failed.
    #[error("Service error: {0}")]
    Services(#[from] services::Error),
    /// The configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] config::Error),
    /// A version mismatch with a peer or a record.
    #[error("Network error: {0}")]
    Network(#[from] network::Error),
    /// A persisted record cannot be opened.
    #[error("Record error: {0}")]
    Record(#[from] network::RecordError),
    /// An offer or trade price check failed.
    #[error("Offer error: {0}")]
    Offer(#[from] offer::Error),
    /// A dispute operation was refused.
    #[error("Dispute error: {0}")]
    Dispute(#[from] dispute::Error),
    /// A security deposit percentage is out of range.
    #[error("Security deposit error: {0}")]
    DepositPct(#[from] restrictions::DepositPctError),
    /// A task of a pipeline failed, the pipeline stopped there.
    #[error("Task {task} failed: {message}")]
    Task { task: String, message: String },
    /// A peer supplied value did not pass verification.
    #[error("Verification failed: {0}")]
    Verification(String),
    /// An awaited answer did not arrive in time.
    #[error("Timeout: {0}")]
    Timeout(String),
    /// The operation requires another trade role.
    #[error("Role mismatch: {0}")]
    RoleMismatch(String),
    /// The operation is not allowed in the current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),
    #[error("Unknown trade {0}")]
    UnknownTrade(String),
    #[error("Unknown payment account {0}")]
    UnknownAccount(String),
    #[error("Trade {0} is already closed")]
    TradeAlreadyClosed(String),
}

/// Result of the library operations.
pub type Res<T> = Result<T, Error>;
