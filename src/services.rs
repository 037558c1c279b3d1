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

//! Interfaces of the collaborators the core drives but does not implement: the monero wallet,
//! the P2P network, the persistence layer and the filter (ban list) service.
//!
//! Implementations block the calling thread while they work, the trade protocol calls them from
//! inside a task pipeline that holds the trade lock.

use std::error;
use std::sync::Arc;

use monero::Amount;
use thiserror::Error;

use crate::network::NodeAddress;
use crate::offer::OfferId;
use crate::payment::PaymentAccountPayload;
use crate::protocol::message::NetworkMessage;
use crate::trade::statistics::TradeStatistics;
use crate::witness::signed::SignedWitness;
use crate::witness::AccountAgeWitness;

/// Errors returned by collaborators.
#[derive(Error, Debug)]
pub enum Error {
    /// The wallet refused or failed the operation.
    #[error("Wallet error: {0}")]
    Wallet(String),
    /// The message or payload could not be delivered.
    #[error("Network error: {0}")]
    Network(String),
    /// The record could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(String),
    /// Any collaborator error not part of this list.
    #[error("Service error: {0}")]
    Other(Box<dyn error::Error + Send + Sync>),
}

impl Error {
    /// Creates a new error of type [`Self::Other`] with an arbitrary payload.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// Consumes the `Error`, returning its inner error (if any).
    ///
    /// If this [`enum@Error`] was constructed via [`new`] then this function will return [`Some`],
    /// otherwise it will return [`None`].
    ///
    /// [`new`]: Error::new
    ///
    pub fn into_inner(self) -> Option<Box<dyn error::Error + Send + Sync>> {
        match self {
            Self::Other(error) => Some(error),
            _ => None,
        }
    }
}

/// A transaction created by the local wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxHandle {
    pub hash: String,
    pub hex: String,
    /// Private transaction key, proves the outputs to a verifier.
    pub key: String,
    /// Key images of the spent inputs, frozen in the wallet until the trade ends.
    pub key_images: Vec<String>,
    /// Mining fee.
    pub fee: Amount,
}

/// Values the arbitrator expects in a trader's reserve transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveTxCheck {
    pub offer_id: OfferId,
    pub penalty_fee: Amount,
    pub trade_fee: Amount,
    pub send_amount: Amount,
    pub security_deposit: Amount,
    pub payout_address: String,
    pub tx_hash: String,
    pub tx_hex: String,
    pub tx_key: String,
    pub key_images: Vec<String>,
}

/// Result of a successful reserve transaction verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTx {
    pub hash: String,
    pub fee: Amount,
    pub key_images: Vec<String>,
}

/// Unsigned or partially signed payout transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutTx {
    pub hex: String,
    pub buyer_payout: Amount,
    pub seller_payout: Amount,
}

/// Monero wallet. Every method either succeeds or returns an error describing the mismatch,
/// verifications never return a partially valid result.
pub trait Wallet: Send + Sync {
    /// Height of the best chain known by the wallet daemon.
    fn best_chain_height(&self) -> Result<u64, Error>;

    /// Address receiving the payout of the trade born from `offer_id`.
    fn payout_address(&self, offer_id: &OfferId) -> Result<String, Error>;

    /// Create, but do not relay, a transaction reserving the trade funds: the trade fee, the
    /// send amount and the security deposit, returned to `return_address`.
    fn create_reserve_tx(
        &self,
        trade_fee: Amount,
        send_amount: Amount,
        security_deposit: Amount,
        return_address: &str,
    ) -> Result<TxHandle, Error>;

    /// Check a peer's reserve transaction against the expected values.
    fn verify_reserve_tx(&self, check: &ReserveTxCheck) -> Result<VerifiedTx, Error>;

    /// Create the deposit transaction of the trade, spending the reserved outputs.
    fn create_deposit_tx(
        &self,
        offer_id: &OfferId,
        reserve_tx: &TxHandle,
    ) -> Result<TxHandle, Error>;

    /// Relay the deposit transactions of a trade, all or none.
    fn publish_deposit_txs(&self, deposit_tx_hexes: &[String]) -> Result<(), Error>;

    fn create_payout_tx(
        &self,
        offer_id: &OfferId,
        buyer_payout_address: &str,
        buyer_payout: Amount,
        seller_payout_address: &str,
        seller_payout: Amount,
    ) -> Result<PayoutTx, Error>;

    /// Sign and relay the payout transaction, returns its hash.
    fn sign_and_publish_payout_tx(&self, payout_tx: &PayoutTx) -> Result<String, Error>;

    /// Release frozen outputs of a trade that will not proceed.
    fn thaw_outputs(&self, key_images: &[String]) -> Result<(), Error>;
}

/// Append-only data gossiped on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPayload {
    AccountAgeWitness(AccountAgeWitness),
    SignedWitness(SignedWitness),
    TradeStatistics(TradeStatistics),
}

/// P2P network transport.
pub trait P2pNetwork: Send + Sync {
    /// Add a payload to the append-only store and broadcast it. Returns `false` when the network
    /// already had it.
    fn add_persistable_network_payload(
        &self,
        payload: NetworkPayload,
        is_rebroadcast: bool,
    ) -> Result<bool, Error>;

    /// Send a direct message to a peer.
    fn send_message(&self, peer: &NodeAddress, message: NetworkMessage) -> Result<(), Error>;

    /// Initial data has been received from seed nodes.
    fn is_bootstrapped(&self) -> bool;
}

/// Key value persistence of sealed records.
pub trait Persistence: Send + Sync {
    /// Schedule a write, writes requested in a short window are coalesced.
    fn request_persistence(&self, key: &str, record: Vec<u8>);

    /// Write immediately.
    fn persist_now(&self, key: &str, record: Vec<u8>) -> Result<(), Error>;

    fn read_persisted(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    fn remove(&self, key: &str) -> Result<(), Error>;

    /// Keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, Error>;
}

/// Ban lists distributed by the network operators. Consulted before trusting a peer supplied
/// identity.
pub trait Filter: Send + Sync {
    fn is_node_address_banned(&self, address: &NodeAddress) -> bool;

    /// `pub_key_hex` is the hex encoded signature public key.
    fn is_witness_signer_pub_key_banned(&self, pub_key_hex: &str) -> bool;

    fn is_currency_banned(&self, currency_code: &str) -> bool;

    fn is_payment_method_banned(&self, payment_method_id: &str) -> bool;

    fn are_peers_payment_account_data_banned(&self, payload: &PaymentAccountPayload) -> bool;
}

/// Filter banning nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFilter;

impl Filter for NoFilter {
    fn is_node_address_banned(&self, _: &NodeAddress) -> bool {
        false
    }

    fn is_witness_signer_pub_key_banned(&self, _: &str) -> bool {
        false
    }

    fn is_currency_banned(&self, _: &str) -> bool {
        false
    }

    fn is_payment_method_banned(&self, _: &str) -> bool {
        false
    }

    fn are_peers_payment_account_data_banned(&self, _: &PaymentAccountPayload) -> bool {
        false
    }
}

/// Handles on every collaborator, cloned into the services and process models that need them.
#[derive(Clone)]
pub struct Services {
    pub wallet: Arc<dyn Wallet>,
    pub p2p: Arc<dyn P2pNetwork>,
    pub persistence: Arc<dyn Persistence>,
    pub filter: Arc<dyn Filter>,
}
