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

//! Trades. A trade is created when a taker takes an offer, the maker and the arbitrator create
//! their own copy when they receive the first protocol message.
//!
//! ## Phases
//!
//! ```text
//! Init -> FundsReserved -> ContractSigned -> DepositsPublished -> DepositsConfirmed
//!      -> DepositsUnlocked -> PaymentSent -> PaymentReceived -> PayoutPublished -> Completed
//! ```
//!
//! Phases only move forward. Disputes are tracked by a separate state and never move the phase
//! back.
//!
//! ## Records
//!
//! Trades are persisted sealed with [`TRADE_MAGIC_BYTES`] and the local database version, a
//! record written by another database version is refused.

use std::fmt;
use std::io;

use monero::Amount;
use tracing::{debug, info};

use crate::consensus::{self, Decodable, Encodable};
use crate::crypto::PubKeyRing;
use crate::network::{self, NetworkContext, NodeAddress};
use crate::offer::{Offer, OfferId};
use crate::payment::PaymentAccountPayload;
use crate::role::{PaymentRole, TradeRole};
use crate::{Error, Res};

pub mod contract;
pub mod process_model;
pub mod statistics;

pub use contract::Contract;
pub use process_model::{ProcessModel, TradeContext};

/// Magic bytes of a sealed trade record.
pub const TRADE_MAGIC_BYTES: &[u8; 6] = b"DEXTRD";

/// A trade carries the identifier of the offer it was born from.
pub type TradeId = OfferId;

/// Progress of a trade, totally ordered.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(Debug)]
pub enum TradePhase {
    Init,
    FundsReserved,
    ContractSigned,
    DepositsPublished,
    DepositsConfirmed,
    DepositsUnlocked,
    PaymentSent,
    PaymentReceived,
    PayoutPublished,
    Completed,
}

impl TradePhase {
    fn tag(&self) -> u8 {
        *self as u8 + 1
    }
}

impl Encodable for TradePhase {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.tag().consensus_encode(writer)
    }
}

impl Decodable for TradePhase {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(TradePhase::Init),
            0x02u8 => Ok(TradePhase::FundsReserved),
            0x03u8 => Ok(TradePhase::ContractSigned),
            0x04u8 => Ok(TradePhase::DepositsPublished),
            0x05u8 => Ok(TradePhase::DepositsConfirmed),
            0x06u8 => Ok(TradePhase::DepositsUnlocked),
            0x07u8 => Ok(TradePhase::PaymentSent),
            0x08u8 => Ok(TradePhase::PaymentReceived),
            0x09u8 => Ok(TradePhase::PayoutPublished),
            0x0au8 => Ok(TradePhase::Completed),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

/// Dispute flag of a trade, orthogonal to its phase.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[display(Debug)]
pub enum TradeDisputeState {
    NoDispute,
    DisputeOpened,
    DisputeClosed,
    DisputeReopened,
}

impl Default for TradeDisputeState {
    fn default() -> Self {
        TradeDisputeState::NoDispute
    }
}

impl TradeDisputeState {
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            TradeDisputeState::DisputeOpened | TradeDisputeState::DisputeReopened
        )
    }

    fn can_move_to(&self, next: TradeDisputeState) -> bool {
        use TradeDisputeState::*;
        matches!(
            (self, next),
            (NoDispute, DisputeOpened)
                | (DisputeOpened, DisputeClosed)
                | (DisputeReopened, DisputeClosed)
                | (DisputeClosed, DisputeReopened)
        )
    }
}

impl Encodable for TradeDisputeState {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            TradeDisputeState::NoDispute => 0x01u8.consensus_encode(writer),
            TradeDisputeState::DisputeOpened => 0x02u8.consensus_encode(writer),
            TradeDisputeState::DisputeClosed => 0x03u8.consensus_encode(writer),
            TradeDisputeState::DisputeReopened => 0x04u8.consensus_encode(writer),
        }
    }
}

impl Decodable for TradeDisputeState {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(TradeDisputeState::NoDispute),
            0x02u8 => Ok(TradeDisputeState::DisputeOpened),
            0x03u8 => Ok(TradeDisputeState::DisputeClosed),
            0x04u8 => Ok(TradeDisputeState::DisputeReopened),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

/// What a node knows about one of the three parties of a trade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TradePeer {
    pub node_address: Option<NodeAddress>,
    pub pub_key_ring: Option<PubKeyRing>,
    pub payment_account_id: Option<String>,
    pub payment_account_payload: Option<PaymentAccountPayload>,
    pub payment_account_payload_hash: Option<[u8; 32]>,
    pub payout_address: Option<String>,
    pub reserve_tx_hash: Option<String>,
    pub reserve_tx_hex: Option<String>,
    pub reserve_tx_key: Option<String>,
    pub reserve_tx_key_images: Vec<String>,
    pub deposit_tx_hash: Option<String>,
    pub deposit_tx_hex: Option<String>,
    /// Security deposit net of the reserve transaction mining fee once verified.
    pub security_deposit: Option<Amount>,
    pub account_age_witness_nonce: Option<Vec<u8>>,
    pub account_age_witness_signature: Option<Vec<u8>>,
    pub contract_signature: Option<Vec<u8>>,
    /// Peer's clock when it sent its first message, unix milliseconds.
    pub current_date: Option<i64>,
}

impl_consensus_fields!(TradePeer {
    node_address,
    pub_key_ring,
    payment_account_id,
    payment_account_payload,
    payment_account_payload_hash,
    payout_address,
    reserve_tx_hash,
    reserve_tx_hex,
    reserve_tx_key,
    reserve_tx_key_images,
    deposit_tx_hash,
    deposit_tx_hex,
    security_deposit,
    account_age_witness_nonce,
    account_age_witness_signature,
    contract_signature,
    current_date,
});

/// A trade as seen by one of its three parties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    pub id: TradeId,
    pub protocol_version: u16,
    /// Role of the local node.
    pub role: TradeRole,
    pub offer: Offer,
    pub maker: TradePeer,
    pub taker: TradePeer,
    pub arbitrator: TradePeer,
    pub amount: Amount,
    /// Price scaled by [`crate::offer::PRICE_PRECISION`].
    pub price: u64,
    pub taker_fee: Amount,
    /// Creation date, unix milliseconds.
    pub date: i64,
    pub lock_time: Option<u64>,
    pub phase: TradePhase,
    pub dispute_state: TradeDisputeState,
    pub error_message: Option<String>,
    pub contract: Option<Contract>,
    pub contract_hash: Option<[u8; 32]>,
    pub payout_tx_hash: Option<String>,
}

impl_consensus_fields!(Trade {
    id,
    protocol_version,
    role,
    offer,
    maker,
    taker,
    arbitrator,
    amount,
    price,
    taker_fee,
    date,
    lock_time,
    phase,
    dispute_state,
    error_message,
    contract,
    contract_hash,
    payout_tx_hash,
});

impl_strict_encoding!(Trade);

impl Trade {
    pub fn new(
        role: TradeRole,
        offer: Offer,
        amount: Amount,
        price: u64,
        taker_fee: Amount,
        date: i64,
    ) -> Self {
        let maker = TradePeer {
            node_address: Some(offer.owner_node_address.clone()),
            pub_key_ring: Some(offer.pub_key_ring),
            payment_account_id: Some(offer.maker_payment_account_id.clone()),
            ..TradePeer::default()
        };
        let arbitrator = TradePeer {
            node_address: offer.arbitrator_signer.clone(),
            ..TradePeer::default()
        };
        Self {
            id: offer.id,
            protocol_version: offer.protocol_version,
            role,
            maker,
            taker: TradePeer::default(),
            arbitrator,
            amount,
            price,
            taker_fee,
            date,
            lock_time: None,
            phase: TradePhase::Init,
            dispute_state: TradeDisputeState::NoDispute,
            error_message: None,
            contract: None,
            contract_hash: None,
            payout_tx_hash: None,
            offer,
        }
    }

    pub fn short_id(&self) -> String {
        self.id.short_id()
    }

    /// Payment direction of the local node, `None` for the arbitrator.
    pub fn payment_role(&self) -> Option<PaymentRole> {
        self.role.payment_role(self.offer.direction)
    }

    pub fn is_arbitrator(&self) -> bool {
        self.role == TradeRole::Arbitrator
    }

    pub fn is_buyer(&self) -> bool {
        self.payment_role() == Some(PaymentRole::Buyer)
    }

    pub fn is_seller(&self) -> bool {
        self.payment_role() == Some(PaymentRole::Seller)
    }

    /// The maker buys monero.
    pub fn is_buyer_maker(&self) -> bool {
        self.offer.is_buy_offer()
    }

    pub fn buyer(&self) -> &TradePeer {
        if self.is_buyer_maker() {
            &self.maker
        } else {
            &self.taker
        }
    }

    pub fn seller(&self) -> &TradePeer {
        if self.is_buyer_maker() {
            &self.taker
        } else {
            &self.maker
        }
    }

    pub fn peer(&self, role: TradeRole) -> &TradePeer {
        match role {
            TradeRole::Maker => &self.maker,
            TradeRole::Taker => &self.taker,
            TradeRole::Arbitrator => &self.arbitrator,
        }
    }

    pub fn peer_mut(&mut self, role: TradeRole) -> &mut TradePeer {
        match role {
            TradeRole::Maker => &mut self.maker,
            TradeRole::Taker => &mut self.taker,
            TradeRole::Arbitrator => &mut self.arbitrator,
        }
    }

    /// Record of the local node.
    pub fn self_peer(&self) -> &TradePeer {
        self.peer(self.role)
    }

    pub fn self_peer_mut(&mut self) -> &mut TradePeer {
        self.peer_mut(self.role)
    }

    /// The counterparty of a trader, `None` for the arbitrator which has two.
    pub fn trade_peer(&self) -> Option<&TradePeer> {
        self.role.other().map(|role| self.peer(role))
    }

    pub fn trade_peer_role(&self) -> Option<TradeRole> {
        self.role.other()
    }

    /// Role of the sender of a message, looked up by its public key.
    pub fn role_of(&self, pub_key_ring: &PubKeyRing) -> Option<TradeRole> {
        [TradeRole::Maker, TradeRole::Taker, TradeRole::Arbitrator]
            .into_iter()
            .find(|role| self.peer(*role).pub_key_ring.as_ref() == Some(pub_key_ring))
    }

    pub fn buyer_security_deposit(&self) -> Amount {
        self.offer.buyer_security_deposit(self.amount)
    }

    pub fn seller_security_deposit(&self) -> Amount {
        self.offer.seller_security_deposit(self.amount)
    }

    pub fn has_buyer_as_taker_without_deposit(&self) -> bool {
        self.offer.has_buyer_as_taker_without_deposit()
    }

    /// Move the trade forward. Setting the current phase again is a no-op returning `false`,
    /// moving backwards is refused.
    pub fn set_phase(&mut self, phase: TradePhase) -> Res<bool> {
        if phase == self.phase {
            return Ok(false);
        }
        if phase < self.phase {
            return Err(Error::IllegalState(format!(
                "Trade {} cannot move from phase {} back to {}",
                self.short_id(),
                self.phase,
                phase
            )));
        }
        info!(trade_id = %self.short_id(), from = %self.phase, to = %phase, "Trade phase changed");
        self.phase = phase;
        Ok(true)
    }

    /// Set the lock time once. Returns `false` and keeps the value if already set.
    pub fn set_lock_time(&mut self, lock_time: u64) -> bool {
        match self.lock_time {
            Some(current) => {
                debug!(
                    trade_id = %self.short_id(),
                    current,
                    ignored = lock_time,
                    "Lock time already set"
                );
                false
            }
            None => {
                self.lock_time = Some(lock_time);
                true
            }
        }
    }

    pub fn set_dispute_state(&mut self, state: TradeDisputeState) -> Res<()> {
        if !self.dispute_state.can_move_to(state) {
            return Err(Error::IllegalState(format!(
                "Trade {} dispute state cannot move from {} to {}",
                self.short_id(),
                self.dispute_state,
                state
            )));
        }
        self.dispute_state = state;
        Ok(())
    }

    pub fn is_dispute_open(&self) -> bool {
        self.dispute_state.is_open()
    }

    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
    }

    pub fn is_deposits_published(&self) -> bool {
        self.phase >= TradePhase::DepositsPublished
    }

    pub fn is_payout_published(&self) -> bool {
        self.phase >= TradePhase::PayoutPublished
    }

    pub fn is_completed(&self) -> bool {
        self.phase == TradePhase::Completed
    }

    /// Nonce signed by a trader to prove ownership of its account age witness key.
    pub fn witness_nonce(&self) -> Vec<u8> {
        self.id.0.as_bytes().to_vec()
    }

    pub fn seal(&self, ctx: &NetworkContext) -> Result<Vec<u8>, consensus::Error> {
        network::seal(TRADE_MAGIC_BYTES, ctx, self)
    }

    pub fn open(ctx: &NetworkContext, bytes: &[u8]) -> Res<Self> {
        Ok(network::open(TRADE_MAGIC_BYTES, ctx, bytes)?)
    }
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} trade {} {} XMR, phase {}",
            self.role,
            self.short_id(),
            self.amount,
            self.phase
        )
    }
}
