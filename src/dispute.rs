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

//! Disputes between traders, resolved by the arbitrator of the trade.
//!
//! ## States
//!
//! ```text
//! New --seen--> Open --result--> Closed --reopen--> Reopened --result--> Closed
//! ```
//!
//! A dispute is identified by `{trade_id}_{trader_id}`, one dispute per trade and opener. The
//! chat is append only and deduplicated by message uid. Once resolved, the payment account
//! payloads and the chat beyond the first system message can be scrubbed, the identifier never
//! changes.

use std::error;
use std::fmt;
use std::io;
use std::sync::Arc;

use monero::Amount;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::consensus::{self, Decodable, Encodable};
use crate::crypto::{hash160, KeyRing, PubKeyRing};
use crate::network::{self, NetworkContext, NodeAddress};
use crate::offer::OfferId;
use crate::payment::PaymentAccountPayload;
use crate::protocol::message::{DisputeClosedMessage, NetworkMessage, OpenNewDisputeMessage};
use crate::role::PaymentRole;
use crate::services::{P2pNetwork, Persistence};
use crate::trade::{Contract, Trade};

/// Magic bytes of a sealed dispute record.
pub const DISPUTE_MAGIC_BYTES: &[u8; 6] = b"DEXDSP";

/// Prefix of the persistence keys of disputes.
pub const DISPUTE_KEY_PREFIX: &str = "dispute/";

/// Errors of the dispute engine.
#[derive(Error, Debug)]
pub enum Error {
    /// No dispute with this identifier.
    #[error("Unknown dispute {0}")]
    UnknownDispute(String),
    /// A dispute with this identifier exists already.
    #[error("Dispute {0} already exists")]
    AlreadyExists(String),
    /// The dispute cannot move to the requested state.
    #[error("Dispute {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: String,
        from: DisputeState,
        to: DisputeState,
    },
    /// Closing requires a result.
    #[error("Dispute {0} cannot be closed without a result")]
    MissingResult(String),
    /// The trade has no contract to dispute.
    #[error("Trade {0} has no contract")]
    MissingContract(String),
    /// Any dispute error not part of this list.
    #[error("Dispute error: {0}")]
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

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[display(Debug)]
pub enum DisputeState {
    New,
    Open,
    Reopened,
    Closed,
}

impl DisputeState {
    fn can_move_to(&self, next: DisputeState) -> bool {
        use DisputeState::*;
        matches!(
            (self, next),
            (New, Open) | (Open, Closed) | (Reopened, Closed) | (Closed, Reopened)
        )
    }
}

impl Encodable for DisputeState {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            DisputeState::New => 0x01u8.consensus_encode(writer),
            DisputeState::Open => 0x02u8.consensus_encode(writer),
            DisputeState::Reopened => 0x03u8.consensus_encode(writer),
            DisputeState::Closed => 0x04u8.consensus_encode(writer),
        }
    }
}

impl Decodable for DisputeState {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(DisputeState::New),
            0x02u8 => Ok(DisputeState::Open),
            0x03u8 => Ok(DisputeState::Reopened),
            0x04u8 => Ok(DisputeState::Closed),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

/// Party the arbitrator decided for.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[display(Debug)]
pub enum Winner {
    Buyer,
    Seller,
}

impl From<Winner> for PaymentRole {
    fn from(winner: Winner) -> Self {
        match winner {
            Winner::Buyer => PaymentRole::Buyer,
            Winner::Seller => PaymentRole::Seller,
        }
    }
}

impl Encodable for Winner {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            Winner::Buyer => 0x01u8.consensus_encode(writer),
            Winner::Seller => 0x02u8.consensus_encode(writer),
        }
    }
}

impl Decodable for Winner {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(Winner::Buyer),
            0x02u8 => Ok(Winner::Seller),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[display(Debug)]
pub enum DisputeReason {
    Other,
    Bug,
    Usability,
    ProtocolViolation,
    NoReply,
    Scam,
    BankProblems,
    TradeAlreadySettled,
    PeerWasLate,
}

impl Encodable for DisputeReason {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        (*self as u8 + 1).consensus_encode(writer)
    }
}

impl Decodable for DisputeReason {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(DisputeReason::Other),
            0x02u8 => Ok(DisputeReason::Bug),
            0x03u8 => Ok(DisputeReason::Usability),
            0x04u8 => Ok(DisputeReason::ProtocolViolation),
            0x05u8 => Ok(DisputeReason::NoReply),
            0x06u8 => Ok(DisputeReason::Scam),
            0x07u8 => Ok(DisputeReason::BankProblems),
            0x08u8 => Ok(DisputeReason::TradeAlreadySettled),
            0x09u8 => Ok(DisputeReason::PeerWasLate),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

/// Decision of the arbitrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeResult {
    pub trade_id: OfferId,
    pub trader_id: u32,
    pub winner: Winner,
    pub reason: DisputeReason,
    pub summary_notes: String,
    pub buyer_payout: Amount,
    pub seller_payout: Amount,
    pub close_date: i64,
}

impl_consensus_fields!(DisputeResult {
    trade_id,
    trader_id,
    winner,
    reason,
    summary_notes,
    buyer_payout,
    seller_payout,
    close_date,
});

impl_strict_encoding!(DisputeResult);

/// One message of a dispute chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub trade_id: OfferId,
    pub trader_id: u32,
    pub sender_is_trader: bool,
    pub sender_node_address: NodeAddress,
    pub message: String,
    pub uid: String,
    pub date: i64,
    pub system_message: bool,
    /// Local only, set once displayed to the user.
    pub was_displayed: bool,
}

impl_consensus_fields!(ChatMessage {
    trade_id,
    trader_id,
    sender_is_trader,
    sender_node_address,
    message,
    uid,
    date,
    system_message,
    was_displayed,
});

impl_strict_encoding!(ChatMessage);

impl ChatMessage {
    pub fn new(
        dispute: &Dispute,
        sender_is_trader: bool,
        sender_node_address: NodeAddress,
        message: impl Into<String>,
        date: i64,
    ) -> Self {
        Self {
            trade_id: dispute.trade_id,
            trader_id: dispute.trader_id,
            sender_is_trader,
            sender_node_address,
            message: message.into(),
            uid: Uuid::new_v4().to_string(),
            date,
            system_message: false,
            was_displayed: false,
        }
    }

    pub fn dispute_id(&self) -> String {
        dispute_id(&self.trade_id, self.trader_id)
    }
}

/// Identifier of a trader in disputes, derived from its signature public key.
pub fn trader_id(pub_key_ring: &PubKeyRing) -> u32 {
    let hash = hash160(&pub_key_ring.signature_pub_key_bytes());
    u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]])
}

pub fn dispute_id(trade_id: &OfferId, trader_id: u32) -> String {
    format!("{}_{}", trade_id, trader_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispute {
    pub id: String,
    pub trade_id: OfferId,
    pub trader_id: u32,
    pub opener_is_buyer: bool,
    pub opener_is_maker: bool,
    /// Local only, the node opened the dispute.
    pub is_opener: bool,
    pub trader_pub_key_ring: PubKeyRing,
    pub agent_pub_key_ring: PubKeyRing,
    pub trade_date: i64,
    pub trade_period_end: i64,
    pub contract: Contract,
    pub contract_hash: [u8; 32],
    pub maker_contract_signature: Option<Vec<u8>>,
    pub taker_contract_signature: Option<Vec<u8>>,
    pub maker_payment_account_payload: Option<PaymentAccountPayload>,
    pub taker_payment_account_payload: Option<PaymentAccountPayload>,
    pub chat_messages: Vec<ChatMessage>,
    pub result: Option<DisputeResult>,
    pub state: DisputeState,
    pub opening_date: i64,
    pub payout_tx_id: Option<String>,
    pub extra_data: Vec<(String, String)>,
}

impl_consensus_fields!(Dispute {
    id,
    trade_id,
    trader_id,
    opener_is_buyer,
    opener_is_maker,
    is_opener,
    trader_pub_key_ring,
    agent_pub_key_ring,
    trade_date,
    trade_period_end,
    contract,
    contract_hash,
    maker_contract_signature,
    taker_contract_signature,
    maker_payment_account_payload,
    taker_payment_account_payload,
    chat_messages,
    result,
    state,
    opening_date,
    payout_tx_id,
    extra_data,
});

impl_strict_encoding!(Dispute);

impl Dispute {
    /// Dispute of `trade` opened by the trader owning `opener`. The trade must hold a signed
    /// contract.
    pub fn from_trade(
        trade: &Trade,
        opener: &PubKeyRing,
        agent_pub_key_ring: PubKeyRing,
        opening_date: i64,
        is_opener: bool,
    ) -> Result<Self, Error> {
        let contract = trade
            .contract
            .clone()
            .ok_or_else(|| Error::MissingContract(trade.short_id()))?;
        let contract_hash = match trade.contract_hash {
            Some(hash) => hash,
            None => contract.hash().map_err(Error::new)?,
        };
        let opener_is_maker = contract.maker_pub_key_ring == *opener;
        let opener_is_buyer = contract.buyer_pub_key_ring() == opener;
        let trader_id = trader_id(opener);
        Ok(Self {
            id: dispute_id(&trade.id, trader_id),
            trade_id: trade.id,
            trader_id,
            opener_is_buyer,
            opener_is_maker,
            is_opener,
            trader_pub_key_ring: *opener,
            agent_pub_key_ring,
            trade_date: trade.date,
            trade_period_end: trade.date + trade.offer.max_trade_period,
            contract,
            contract_hash,
            maker_contract_signature: trade.maker.contract_signature.clone(),
            taker_contract_signature: trade.taker.contract_signature.clone(),
            maker_payment_account_payload: trade.maker.payment_account_payload.clone(),
            taker_payment_account_payload: trade.taker.payment_account_payload.clone(),
            chat_messages: Vec::new(),
            result: None,
            state: DisputeState::New,
            opening_date,
            payout_tx_id: trade.payout_tx_hash.clone(),
            extra_data: Vec::new(),
        })
    }

    pub fn short_trade_id(&self) -> String {
        self.trade_id.short_id()
    }

    pub fn is_new(&self) -> bool {
        self.state == DisputeState::New
    }

    /// New, open and reopened disputes are open.
    pub fn is_open(&self) -> bool {
        self.state != DisputeState::Closed
    }

    pub fn is_closed(&self) -> bool {
        self.state == DisputeState::Closed
    }

    fn move_to(&mut self, next: DisputeState) -> Result<(), Error> {
        if !self.state.can_move_to(next) {
            return Err(Error::IllegalTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        info!(dispute_id = %self.id, from = %self.state, to = %next, "Dispute state changed");
        self.state = next;
        Ok(())
    }

    /// First display of a new dispute opens it, later calls are no-ops.
    pub fn set_seen(&mut self) {
        if self.is_new() {
            self.state = DisputeState::Open;
        }
    }

    /// Record the arbitrator's decision and close.
    pub fn close(&mut self, result: DisputeResult) -> Result<(), Error> {
        self.move_to(DisputeState::Closed)?;
        self.result = Some(result);
        Ok(())
    }

    /// Close with the already recorded result.
    pub fn set_closed(&mut self) -> Result<(), Error> {
        if self.result.is_none() {
            return Err(Error::MissingResult(self.id.clone()));
        }
        self.move_to(DisputeState::Closed)
    }

    pub fn reopen(&mut self) -> Result<(), Error> {
        self.move_to(DisputeState::Reopened)
    }

    /// Append a chat message. Returns `false` if a message with the same uid is known.
    pub fn add_chat_message(&mut self, message: ChatMessage) -> bool {
        if self.chat_messages.iter().any(|m| m.uid == message.uid) {
            warn!(dispute_id = %self.id, uid = %message.uid, "Chat message already exists");
            return false;
        }
        self.chat_messages.push(message);
        true
    }

    /// Messages not displayed yet, either from the given side or from the system.
    pub fn unread_message_count(&self, sender_is_trader: bool) -> usize {
        self.chat_messages
            .iter()
            .filter(|m| m.sender_is_trader == sender_is_trader || m.system_message)
            .filter(|m| !m.was_displayed)
            .count()
    }

    /// `1` while the dispute is new or has unread messages, `0` otherwise.
    pub fn alert_level(&self, sender_is_trader: bool) -> u8 {
        u8::from(self.is_new() || self.unread_message_count(sender_is_trader) > 0)
    }

    pub fn set_chat_messages_seen(&mut self) {
        for message in self.chat_messages.iter_mut() {
            message.was_displayed = true;
        }
    }

    /// Drop every chat message but the first one. Returns whether anything was removed.
    pub fn remove_all_chat_messages(&mut self) -> bool {
        if self.chat_messages.len() > 1 {
            self.chat_messages.truncate(1);
            true
        } else {
            false
        }
    }

    /// Scrub the payment account payloads and the chat of a closed dispute.
    pub fn clear_sensitive_data(&mut self) -> bool {
        if !self.is_closed() {
            return false;
        }
        let mut changed = self.maker_payment_account_payload.take().is_some();
        changed |= self.taker_payment_account_payload.take().is_some();
        changed |= self.remove_all_chat_messages();
        if changed {
            info!(trade_id = %self.short_trade_id(), "Cleared sensitive data of dispute");
        }
        changed
    }

    pub fn set_extra_data(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.extra_data.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.extra_data.push((key, value)),
        }
    }

    /// Role of the local trader, for display.
    pub fn role_string(&self) -> &'static str {
        match (self.opener_is_maker, self.opener_is_buyer, self.is_opener) {
            (true, true, true) => "Buyer/Maker",
            (true, true, false) => "Seller/Taker",
            (true, false, true) => "Seller/Maker",
            (true, false, false) => "Buyer/Taker",
            (false, true, true) => "Buyer/Taker",
            (false, true, false) => "Seller/Maker",
            (false, false, true) => "Seller/Taker",
            (false, false, false) => "Buyer/Maker",
        }
    }

    /// Role of the opener, for log files.
    pub fn role_string_for_log_file(&self) -> String {
        format!(
            "{}_{}",
            if self.opener_is_buyer { "BUYER" } else { "SELLER" },
            if self.opener_is_maker { "MAKER" } else { "TAKER" }
        )
    }

    pub fn buyer_payment_account_payload(&self) -> Option<&PaymentAccountPayload> {
        if self.contract.is_buyer_maker_and_seller_taker {
            self.maker_payment_account_payload.as_ref()
        } else {
            self.taker_payment_account_payload.as_ref()
        }
    }

    pub fn seller_payment_account_payload(&self) -> Option<&PaymentAccountPayload> {
        if self.contract.is_buyer_maker_and_seller_taker {
            self.taker_payment_account_payload.as_ref()
        } else {
            self.maker_payment_account_payload.as_ref()
        }
    }

    /// Node address of the trader of this dispute.
    pub fn trader_node_address(&self) -> &NodeAddress {
        if self.opener_is_maker {
            &self.contract.maker_node_address
        } else {
            &self.contract.taker_node_address
        }
    }

    pub fn seal(&self, ctx: &NetworkContext) -> Result<Vec<u8>, consensus::Error> {
        network::seal(DISPUTE_MAGIC_BYTES, ctx, self)
    }

    pub fn open(ctx: &NetworkContext, bytes: &[u8]) -> Result<Self, network::RecordError> {
        network::open(DISPUTE_MAGIC_BYTES, ctx, bytes)
    }
}

impl fmt::Display for Dispute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispute {} of trade {} ({}), {}",
            self.id,
            self.short_trade_id(),
            self.role_string_for_log_file(),
            self.state
        )
    }
}

/// Disputes known by a node: the traders' own disputes, or every dispute an arbitrator handles.
pub struct DisputeList {
    disputes: Mutex<Vec<Dispute>>,
    key_ring: Arc<KeyRing>,
    node_address: NodeAddress,
    p2p: Arc<dyn P2pNetwork>,
    persistence: Arc<dyn Persistence>,
    ctx: NetworkContext,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for DisputeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisputeList")
            .field("node_address", &self.node_address)
            .field("disputes", &self.disputes.lock().len())
            .finish()
    }
}

impl DisputeList {
    pub fn new(
        key_ring: Arc<KeyRing>,
        node_address: NodeAddress,
        p2p: Arc<dyn P2pNetwork>,
        persistence: Arc<dyn Persistence>,
        ctx: NetworkContext,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            disputes: Mutex::new(Vec::new()),
            key_ring,
            node_address,
            p2p,
            persistence,
            ctx,
            clock,
        }
    }

    fn persist(&self, dispute: &Dispute) {
        match dispute.seal(&self.ctx) {
            Ok(record) => self
                .persistence
                .request_persistence(&format!("{}{}", DISPUTE_KEY_PREFIX, dispute.id), record),
            Err(e) => warn!(dispute_id = %dispute.id, error = %e, "Cannot seal dispute"),
        }
    }

    /// Load the persisted disputes. Records of another database version are skipped.
    pub fn restore(&self) -> Result<usize, crate::Error> {
        let mut restored = Vec::new();
        for key in self.persistence.keys(DISPUTE_KEY_PREFIX)? {
            let bytes = match self.persistence.read_persisted(&key)? {
                Some(bytes) => bytes,
                None => continue,
            };
            match Dispute::open(&self.ctx, &bytes) {
                Ok(dispute) => restored.push(dispute),
                Err(e) => warn!(key = %key, error = %e, "Skipping dispute record"),
            }
        }
        let count = restored.len();
        let mut disputes = self.disputes.lock();
        for dispute in restored {
            if !disputes.iter().any(|d| d.id == dispute.id) {
                disputes.push(dispute);
            }
        }
        Ok(count)
    }

    fn insert(&self, dispute: Dispute) -> Result<(), Error> {
        let mut disputes = self.disputes.lock();
        if disputes.iter().any(|d| d.id == dispute.id) {
            return Err(Error::AlreadyExists(dispute.id));
        }
        self.persist(&dispute);
        disputes.push(dispute);
        Ok(())
    }

    fn update<T>(
        &self,
        dispute_id: &str,
        f: impl FnOnce(&mut Dispute) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut disputes = self.disputes.lock();
        let dispute = disputes
            .iter_mut()
            .find(|d| d.id == dispute_id)
            .ok_or_else(|| Error::UnknownDispute(dispute_id.to_string()))?;
        let res = f(dispute)?;
        self.persist(dispute);
        Ok(res)
    }

    /// Open a dispute on `trade` as one of its traders and send it to the arbitrator. A
    /// closed dispute of the same trader is reopened instead.
    pub fn open_dispute(&self, trade: &Trade, reason: &str) -> Result<Dispute, crate::Error> {
        let agent_address = trade
            .arbitrator
            .node_address
            .clone()
            .ok_or_else(|| crate::Error::IllegalState("Trade has no arbitrator".into()))?;
        let agent_pub_key_ring = trade
            .arbitrator
            .pub_key_ring
            .ok_or_else(|| crate::Error::IllegalState("Arbitrator key is unknown".into()))?;
        let opener = *self.key_ring.pub_key_ring();
        let now = self.clock.now_millis();

        let id = dispute_id(&trade.id, trader_id(&opener));
        if let Some(existing) = self.get(&id) {
            if !existing.is_closed() {
                return Err(Error::AlreadyExists(id).into());
            }
            let dispute = self.update(&id, |d| {
                d.reopen()?;
                Ok(d.clone())
            })?;
            self.send(&agent_address, &dispute)?;
            return Ok(dispute);
        }

        let mut dispute = Dispute::from_trade(trade, &opener, agent_pub_key_ring, now, true)?;
        let mut system = ChatMessage::new(&dispute, true, self.node_address.clone(), reason, now);
        system.system_message = true;
        dispute.add_chat_message(system);
        self.insert(dispute.clone())?;
        info!(trade_id = %trade.short_id(), dispute_id = %dispute.id, "Opened dispute");
        self.send(&agent_address, &dispute)?;
        Ok(dispute)
    }

    fn send(&self, agent: &NodeAddress, dispute: &Dispute) -> Result<(), crate::Error> {
        let message = NetworkMessage::OpenNewDisputeMessage(OpenNewDisputeMessage {
            dispute: dispute.clone(),
            sender_node_address: self.node_address.clone(),
            uid: Uuid::new_v4().to_string(),
        });
        Ok(self.p2p.send_message(agent, message)?)
    }

    /// Arbitrator side: record a dispute opened by a trader, or reopen the known one.
    pub fn on_open_new_dispute_message(&self, message: OpenNewDisputeMessage) -> Result<(), Error> {
        let mut dispute = message.dispute;
        dispute.is_opener = false;
        if let Some(existing) = self.get(&dispute.id) {
            if existing.is_closed() {
                return self.update(&dispute.id, |d| d.reopen());
            }
            debug!(dispute_id = %dispute.id, "Dispute already known");
            return Err(Error::AlreadyExists(dispute.id));
        }
        dispute.state = DisputeState::New;
        info!(
            dispute_id = %dispute.id,
            from = %message.sender_node_address,
            "Received new dispute"
        );
        self.insert(dispute)
    }

    /// Send a chat message in a dispute, to the arbitrator or to the trader.
    pub fn send_chat_message(
        &self,
        dispute_id: &str,
        text: &str,
    ) -> Result<ChatMessage, crate::Error> {
        let now = self.clock.now_millis();
        let (message, recipient) = self.update(dispute_id, |d| {
            let sender_is_trader = d.agent_pub_key_ring != *self.key_ring.pub_key_ring();
            let recipient = if sender_is_trader {
                d.contract.arbitrator_node_address.clone()
            } else {
                d.trader_node_address().clone()
            };
            let message =
                ChatMessage::new(d, sender_is_trader, self.node_address.clone(), text, now);
            d.add_chat_message(message.clone());
            Ok((message, recipient))
        })?;
        self.p2p
            .send_message(&recipient, NetworkMessage::ChatMessage(message.clone()))?;
        Ok(message)
    }

    /// Store a received chat message. Returns `false` for a duplicate.
    pub fn on_chat_message(&self, message: ChatMessage) -> Result<bool, Error> {
        let id = message.dispute_id();
        self.update(&id, |d| Ok(d.add_chat_message(message)))
    }

    pub fn set_seen(&self, dispute_id: &str) -> Result<(), Error> {
        self.update(dispute_id, |d| {
            d.set_seen();
            d.set_chat_messages_seen();
            Ok(())
        })
    }

    /// Arbitrator side: close a dispute with `result` and notify the trader.
    pub fn close_dispute(
        &self,
        dispute_id: &str,
        result: DisputeResult,
    ) -> Result<(), crate::Error> {
        let trader = self.update(dispute_id, |d| {
            d.set_seen();
            d.close(result.clone())?;
            Ok(d.trader_node_address().clone())
        })?;
        let message = NetworkMessage::DisputeClosedMessage(DisputeClosedMessage {
            trade_id: result.trade_id,
            sender_node_address: self.node_address.clone(),
            result,
            uid: Uuid::new_v4().to_string(),
        });
        Ok(self.p2p.send_message(&trader, message)?)
    }

    /// Trader side: record the arbitrator's decision. Returns the closed dispute.
    pub fn on_dispute_closed_message(
        &self,
        message: DisputeClosedMessage,
    ) -> Result<Dispute, Error> {
        let id = dispute_id(&message.trade_id, message.result.trader_id);
        self.update(&id, |d| {
            d.set_seen();
            d.close(message.result)?;
            Ok(d.clone())
        })
    }

    pub fn reopen(&self, dispute_id: &str) -> Result<(), Error> {
        self.update(dispute_id, |d| d.reopen())
    }

    /// Scrub the sensitive data of every closed dispute, returns how many changed.
    pub fn clear_sensitive_data(&self) -> usize {
        let mut disputes = self.disputes.lock();
        let mut count = 0;
        for dispute in disputes.iter_mut() {
            if dispute.clear_sensitive_data() {
                self.persist(dispute);
                count += 1;
            }
        }
        count
    }

    pub fn get(&self, dispute_id: &str) -> Option<Dispute> {
        self.disputes.lock().iter().find(|d| d.id == dispute_id).cloned()
    }

    pub fn disputes(&self) -> Vec<Dispute> {
        self.disputes.lock().clone()
    }

    pub fn disputes_for_trade(&self, trade_id: &OfferId) -> Vec<Dispute> {
        self.disputes
            .lock()
            .iter()
            .filter(|d| d.trade_id == *trade_id)
            .cloned()
            .collect()
    }

    pub fn has_open_dispute(&self, trade_id: &OfferId) -> bool {
        self.disputes
            .lock()
            .iter()
            .any(|d| d.trade_id == *trade_id && d.is_open())
    }

    pub fn len(&self) -> usize {
        self.disputes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mock::{key, Gossip, Memory};
    use crate::network::Network;
    use crate::offer::OfferDirection;
    use crate::role::TradeRole;
    use crate::trade::tests::offer;

    /// Trade with a contract, maker sells, taker buys.
    pub(crate) fn contracted_trade() -> Trade {
        let maker = key(1);
        let taker = key(2);
        let o = offer(OfferDirection::Sell);
        let amount = o.amount;
        let mut trade = Trade::new(TradeRole::Taker, o, amount, 42, Amount::from_pico(0), 1_000);
        trade.taker.pub_key_ring = Some(*taker.pub_key_ring());
        trade.taker.node_address = Some(NodeAddress::new("taker.onion", 9999));
        trade.arbitrator.pub_key_ring = Some(*key(9).pub_key_ring());
        let contract = Contract {
            offer_id: trade.id,
            trade_amount: amount,
            trade_price: 42,
            payment_method_id: trade.offer.payment_method_id.clone(),
            counter_currency_code: "EUR".into(),
            lock_time: 100,
            arbitrator_node_address: NodeAddress::new("arbitrator.onion", 9999),
            maker_node_address: NodeAddress::new("maker.onion", 9999),
            taker_node_address: NodeAddress::new("taker.onion", 9999),
            is_buyer_maker_and_seller_taker: false,
            maker_account_id: "maker-account".into(),
            taker_account_id: "taker-account".into(),
            maker_payment_account_payload_hash: [0u8; 32],
            taker_payment_account_payload_hash: [0u8; 32],
            maker_pub_key_ring: *maker.pub_key_ring(),
            taker_pub_key_ring: *taker.pub_key_ring(),
            maker_payout_address: "maker-payout".into(),
            taker_payout_address: "taker-payout".into(),
        };
        trade.contract_hash = Some(contract.hash().unwrap());
        trade.contract = Some(contract);
        trade
    }

    /// Dispute opened by the taker.
    fn opened(trade: &Trade) -> Dispute {
        Dispute::from_trade(trade, key(2).pub_key_ring(), *key(9).pub_key_ring(), 0, true).unwrap()
    }

    fn result(dispute: &Dispute, winner: Winner) -> DisputeResult {
        DisputeResult {
            trade_id: dispute.trade_id,
            trader_id: dispute.trader_id,
            winner,
            reason: DisputeReason::NoReply,
            summary_notes: "seller did not answer".into(),
            buyer_payout: Amount::from_pico(2),
            seller_payout: Amount::from_pico(1),
            close_date: 2_000,
        }
    }

    fn list(me: u8, gossip: Arc<Gossip>) -> DisputeList {
        DisputeList::new(
            Arc::new(key(me)),
            NodeAddress::new(format!("node{}.onion", me), 9999),
            gossip,
            Arc::new(Memory::default()),
            NetworkContext::new(Network::Local),
            Arc::new(ManualClock::new(5_000)),
        )
    }

    #[test]
    fn dispute_id_and_roles() {
        let trade = contracted_trade();
        let opener = *key(2).pub_key_ring();
        let dispute =
            Dispute::from_trade(&trade, &opener, *key(9).pub_key_ring(), 5_000, true).unwrap();
        assert_eq!(dispute.id, format!("{}_{}", trade.id, trader_id(&opener)));
        assert!(dispute.opener_is_buyer);
        assert!(!dispute.opener_is_maker);
        assert_eq!(dispute.role_string(), "Buyer/Taker");
        assert_eq!(dispute.role_string_for_log_file(), "BUYER_TAKER");
        assert_eq!(dispute.trade_period_end, 1_000 + trade.offer.max_trade_period);
        assert_eq!(dispute.trader_node_address(), &NodeAddress::new("taker.onion", 9999));

        let mut no_contract = trade;
        no_contract.contract = None;
        assert!(matches!(
            Dispute::from_trade(&no_contract, &opener, *key(9).pub_key_ring(), 0, true),
            Err(Error::MissingContract(_))
        ));
    }

    #[test]
    fn state_machine() {
        let trade = contracted_trade();
        let mut dispute = opened(&trade);
        let r = result(&dispute, Winner::Buyer);
        assert!(matches!(
            dispute.close(r.clone()),
            Err(Error::IllegalTransition { .. })
        ));
        assert!(dispute.result.is_none());
        assert!(matches!(dispute.set_closed(), Err(Error::MissingResult(_))));
        dispute.set_seen();
        assert_eq!(dispute.state, DisputeState::Open);
        dispute.set_seen();
        assert_eq!(dispute.state, DisputeState::Open);
        dispute.close(r.clone()).unwrap();
        assert!(dispute.is_closed());
        assert!(dispute.reopen().is_ok());
        assert_eq!(dispute.state, DisputeState::Reopened);
        assert!(dispute.is_open());
        dispute.set_closed().unwrap();
        assert!(dispute.reopen().is_ok());
        assert!(dispute.reopen().is_err());
    }

    #[test]
    fn chat_dedupe_unread_and_scrub() {
        let trade = contracted_trade();
        let mut dispute = opened(&trade);
        let id_before = dispute.id.clone();
        let taker = NodeAddress::new("taker.onion", 9999);
        let mut system = ChatMessage::new(&dispute, true, taker, "rules", 1);
        system.system_message = true;
        assert!(dispute.add_chat_message(system.clone()));
        assert!(!dispute.add_chat_message(system));
        let arbitrator = NodeAddress::new("arbitrator.onion", 9999);
        let reply = ChatMessage::new(&dispute, false, arbitrator, "hi", 2);
        assert!(dispute.add_chat_message(reply));
        assert_eq!(dispute.unread_message_count(false), 2);
        assert_eq!(dispute.unread_message_count(true), 1);
        assert_eq!(dispute.alert_level(true), 1);
        dispute.set_seen();
        dispute.set_chat_messages_seen();
        assert_eq!(dispute.alert_level(true), 0);

        assert!(!dispute.clear_sensitive_data());
        dispute.close(result(&dispute, Winner::Seller)).unwrap();
        assert!(dispute.clear_sensitive_data());
        assert_eq!(dispute.chat_messages.len(), 1);
        assert!(dispute.buyer_payment_account_payload().is_none());
        assert_eq!(dispute.id, id_before);
        assert!(!dispute.clear_sensitive_data());
    }

    #[test]
    fn open_chat_and_close_across_nodes() {
        let trader_gossip = Arc::new(Gossip::default());
        let arbitrator_gossip = Arc::new(Gossip::default());
        let trader = list(2, trader_gossip.clone());
        let arbitrator = list(9, arbitrator_gossip.clone());
        let trade = contracted_trade();

        let dispute = trader.open_dispute(&trade, "Payment not received").unwrap();
        assert!(matches!(
            trader.open_dispute(&trade, "again"),
            Err(crate::Error::Dispute(Error::AlreadyExists(_)))
        ));
        let (to, message) = trader_gossip.messages.lock().pop().unwrap();
        assert_eq!(to, NodeAddress::new("arbitrator.onion", 9999));
        match message {
            NetworkMessage::OpenNewDisputeMessage(m) => {
                arbitrator.on_open_new_dispute_message(m).unwrap()
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(arbitrator.get(&dispute.id).unwrap().is_new());
        assert!(arbitrator.has_open_dispute(&trade.id));

        let chat = arbitrator.send_chat_message(&dispute.id, "Please provide a proof").unwrap();
        assert!(!chat.sender_is_trader);
        assert!(trader.on_chat_message(chat.clone()).unwrap());
        assert!(!trader.on_chat_message(chat).unwrap());

        arbitrator.set_seen(&dispute.id).unwrap();
        let r = result(&dispute, Winner::Buyer);
        arbitrator.close_dispute(&dispute.id, r).unwrap();
        let (to, message) = arbitrator_gossip.messages.lock().pop().unwrap();
        assert_eq!(to, NodeAddress::new("taker.onion", 9999));
        let closed = match message {
            NetworkMessage::DisputeClosedMessage(m) => trader.on_dispute_closed_message(m).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        assert!(closed.is_closed());
        assert!(!trader.has_open_dispute(&trade.id));
        assert_eq!(trader.clear_sensitive_data(), 1);

        let reopened = trader.open_dispute(&trade, "Payout is missing").unwrap();
        assert_eq!(reopened.state, DisputeState::Reopened);
        assert_eq!(reopened.id, dispute.id);
    }

    #[test]
    fn disputes_survive_a_restart() {
        let memory = Arc::new(Memory::default());
        let make = |memory: Arc<Memory>| {
            DisputeList::new(
                Arc::new(key(2)),
                NodeAddress::new("taker.onion", 9999),
                Arc::new(Gossip::default()),
                memory,
                NetworkContext::new(Network::Local),
                Arc::new(ManualClock::new(5_000)),
            )
        };
        let before = make(memory.clone());
        let dispute = before.open_dispute(&contracted_trade(), "help").unwrap();
        let after = make(memory);
        assert_eq!(after.restore().unwrap(), 1);
        assert_eq!(after.get(&dispute.id), Some(dispute));
    }
}
