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

//! Direct messages exchanged between the maker, the taker and the arbitrator of a trade.

use std::io;

use monero::Amount;

use crate::consensus::{self, Decodable, Encodable};
use crate::crypto::PubKeyRing;
use crate::dispute::{ChatMessage, Dispute, DisputeResult};
use crate::network::NodeAddress;
use crate::offer::availability::{OfferAvailabilityRequest, OfferAvailabilityResponse};
use crate::offer::{Offer, OfferId};
use crate::payment::PaymentAccountPayload;
use crate::role::TradeRole;
use crate::trade::Contract;
use crate::witness::signed::SignedWitness;

/// `init_trade_request` is sent by the taker to the maker and the arbitrator when taking an
/// offer, and by the maker to the arbitrator once it accepted the taker. It carries the
/// sender's reserve transaction and the proof of ownership of its account age witness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitTradeRequest {
    pub trade_id: OfferId,
    pub sender_node_address: NodeAddress,
    pub sender_pub_key_ring: PubKeyRing,
    pub sender_role: TradeRole,
    pub offer: Offer,
    pub trade_amount: Amount,
    pub trade_price: u64,
    pub taker_fee: Amount,
    /// Taker identity, forwarded by the maker to the arbitrator.
    pub taker_node_address: NodeAddress,
    pub taker_pub_key_ring: PubKeyRing,
    pub payment_account_id: String,
    pub payment_account_payload: PaymentAccountPayload,
    pub payout_address: String,
    /// `None` for a buyer taking an offer without deposit.
    pub reserve_tx_hash: Option<String>,
    pub reserve_tx_hex: Option<String>,
    pub reserve_tx_key: Option<String>,
    pub reserve_tx_key_images: Vec<String>,
    pub account_age_witness_nonce: Vec<u8>,
    pub account_age_witness_signature: Vec<u8>,
    /// Sender's clock, unix milliseconds.
    pub current_date: i64,
    pub protocol_version: u16,
    /// Set by the maker.
    pub lock_time: Option<u64>,
}

impl_consensus_fields!(InitTradeRequest {
    trade_id,
    sender_node_address,
    sender_pub_key_ring,
    sender_role,
    offer,
    trade_amount,
    trade_price,
    taker_fee,
    taker_node_address,
    taker_pub_key_ring,
    payment_account_id,
    payment_account_payload,
    payout_address,
    reserve_tx_hash,
    reserve_tx_hex,
    reserve_tx_key,
    reserve_tx_key_images,
    account_age_witness_nonce,
    account_age_witness_signature,
    current_date,
    protocol_version,
    lock_time,
});

impl_strict_encoding!(InitTradeRequest);

/// `sign_contract_request` is sent by the arbitrator to both traders once both reserve
/// transactions are verified. The contract is the arbitrator's view of the trade.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignContractRequest {
    pub trade_id: OfferId,
    pub sender_node_address: NodeAddress,
    pub sender_pub_key_ring: PubKeyRing,
    pub contract: Contract,
    pub current_date: i64,
}

impl_consensus_fields!(SignContractRequest {
    trade_id,
    sender_node_address,
    sender_pub_key_ring,
    contract,
    current_date,
});

impl_strict_encoding!(SignContractRequest);

/// `sign_contract_response` is sent by a trader to its peer and to the arbitrator after
/// signing the contract. It reveals the trader's payment account to its peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignContractResponse {
    pub trade_id: OfferId,
    pub sender_node_address: NodeAddress,
    pub sender_pub_key_ring: PubKeyRing,
    pub contract_signature: Vec<u8>,
    pub payment_account_payload: PaymentAccountPayload,
    pub account_age_witness_nonce: Vec<u8>,
    pub account_age_witness_signature: Vec<u8>,
    pub current_date: i64,
}

impl_consensus_fields!(SignContractResponse {
    trade_id,
    sender_node_address,
    sender_pub_key_ring,
    contract_signature,
    payment_account_payload,
    account_age_witness_nonce,
    account_age_witness_signature,
    current_date,
});

impl_strict_encoding!(SignContractResponse);

/// `deposit_request` is sent by a trader to the arbitrator once it holds both contract
/// signatures, it hands over the trader's deposit transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepositRequest {
    pub trade_id: OfferId,
    pub sender_node_address: NodeAddress,
    pub sender_pub_key_ring: PubKeyRing,
    pub contract_signature: Vec<u8>,
    /// `None` for a buyer taking an offer without deposit.
    pub deposit_tx_hash: Option<String>,
    pub deposit_tx_hex: Option<String>,
    pub current_date: i64,
}

impl_consensus_fields!(DepositRequest {
    trade_id,
    sender_node_address,
    sender_pub_key_ring,
    contract_signature,
    deposit_tx_hash,
    deposit_tx_hex,
    current_date,
});

impl_strict_encoding!(DepositRequest);

/// `deposit_response` is sent by the arbitrator to both traders after publishing the
/// deposits, or with the reason it could not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepositResponse {
    pub trade_id: OfferId,
    pub sender_node_address: NodeAddress,
    pub sender_pub_key_ring: PubKeyRing,
    pub maker_deposit_tx_hash: Option<String>,
    pub taker_deposit_tx_hash: Option<String>,
    pub error_message: Option<String>,
}

impl_consensus_fields!(DepositResponse {
    trade_id,
    sender_node_address,
    sender_pub_key_ring,
    maker_deposit_tx_hash,
    taker_deposit_tx_hash,
    error_message,
});

impl_strict_encoding!(DepositResponse);

/// `payment_sent_message` is sent by the buyer to the seller and the arbitrator once the
/// counter currency payment is started.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentSentMessage {
    pub trade_id: OfferId,
    pub sender_node_address: NodeAddress,
    pub sender_pub_key_ring: PubKeyRing,
    /// Transaction id of a crypto currency payment.
    pub counter_currency_tx_id: Option<String>,
    pub uid: String,
}

impl_consensus_fields!(PaymentSentMessage {
    trade_id,
    sender_node_address,
    sender_pub_key_ring,
    counter_currency_tx_id,
    uid,
});

impl_strict_encoding!(PaymentSentMessage);

/// `payment_received_message` is sent by the seller to the buyer and the arbitrator with the
/// published payout, and the buyer's witness signature when the trade signed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentReceivedMessage {
    pub trade_id: OfferId,
    pub sender_node_address: NodeAddress,
    pub sender_pub_key_ring: PubKeyRing,
    pub payout_tx_hash: String,
    pub signed_witness: Option<SignedWitness>,
    pub uid: String,
}

impl_consensus_fields!(PaymentReceivedMessage {
    trade_id,
    sender_node_address,
    sender_pub_key_ring,
    payout_tx_hash,
    signed_witness,
    uid,
});

impl_strict_encoding!(PaymentReceivedMessage);

/// `open_new_dispute_message` is sent by a trader to the arbitrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenNewDisputeMessage {
    pub dispute: Dispute,
    pub sender_node_address: NodeAddress,
    pub uid: String,
}

impl_consensus_fields!(OpenNewDisputeMessage {
    dispute,
    sender_node_address,
    uid,
});

impl_strict_encoding!(OpenNewDisputeMessage);

/// `dispute_closed_message` is sent by the arbitrator to both traders with its decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisputeClosedMessage {
    pub trade_id: OfferId,
    pub sender_node_address: NodeAddress,
    pub result: DisputeResult,
    pub uid: String,
}

impl_consensus_fields!(DisputeClosedMessage {
    trade_id,
    sender_node_address,
    result,
    uid,
});

impl_strict_encoding!(DisputeClosedMessage);

/// Every direct message a node handles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkMessage {
    InitTradeRequest(InitTradeRequest),
    SignContractRequest(SignContractRequest),
    SignContractResponse(SignContractResponse),
    DepositRequest(DepositRequest),
    DepositResponse(DepositResponse),
    PaymentSentMessage(PaymentSentMessage),
    PaymentReceivedMessage(PaymentReceivedMessage),
    OfferAvailabilityRequest(OfferAvailabilityRequest),
    OfferAvailabilityResponse(OfferAvailabilityResponse),
    OpenNewDisputeMessage(OpenNewDisputeMessage),
    DisputeClosedMessage(DisputeClosedMessage),
    ChatMessage(ChatMessage),
}

impl NetworkMessage {
    /// Trade, or offer, the message belongs to.
    pub fn trade_id(&self) -> OfferId {
        match self {
            NetworkMessage::InitTradeRequest(m) => m.trade_id,
            NetworkMessage::SignContractRequest(m) => m.trade_id,
            NetworkMessage::SignContractResponse(m) => m.trade_id,
            NetworkMessage::DepositRequest(m) => m.trade_id,
            NetworkMessage::DepositResponse(m) => m.trade_id,
            NetworkMessage::PaymentSentMessage(m) => m.trade_id,
            NetworkMessage::PaymentReceivedMessage(m) => m.trade_id,
            NetworkMessage::OfferAvailabilityRequest(m) => m.offer_id,
            NetworkMessage::OfferAvailabilityResponse(m) => m.offer_id,
            NetworkMessage::OpenNewDisputeMessage(m) => m.dispute.trade_id,
            NetworkMessage::DisputeClosedMessage(m) => m.trade_id,
            NetworkMessage::ChatMessage(m) => m.trade_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NetworkMessage::InitTradeRequest(_) => "InitTradeRequest",
            NetworkMessage::SignContractRequest(_) => "SignContractRequest",
            NetworkMessage::SignContractResponse(_) => "SignContractResponse",
            NetworkMessage::DepositRequest(_) => "DepositRequest",
            NetworkMessage::DepositResponse(_) => "DepositResponse",
            NetworkMessage::PaymentSentMessage(_) => "PaymentSentMessage",
            NetworkMessage::PaymentReceivedMessage(_) => "PaymentReceivedMessage",
            NetworkMessage::OfferAvailabilityRequest(_) => "OfferAvailabilityRequest",
            NetworkMessage::OfferAvailabilityResponse(_) => "OfferAvailabilityResponse",
            NetworkMessage::OpenNewDisputeMessage(_) => "OpenNewDisputeMessage",
            NetworkMessage::DisputeClosedMessage(_) => "DisputeClosedMessage",
            NetworkMessage::ChatMessage(_) => "ChatMessage",
        }
    }

    /// Public key ring of the sender when the message carries one.
    pub fn sender_pub_key_ring(&self) -> Option<&PubKeyRing> {
        match self {
            NetworkMessage::InitTradeRequest(m) => Some(&m.sender_pub_key_ring),
            NetworkMessage::SignContractRequest(m) => Some(&m.sender_pub_key_ring),
            NetworkMessage::SignContractResponse(m) => Some(&m.sender_pub_key_ring),
            NetworkMessage::DepositRequest(m) => Some(&m.sender_pub_key_ring),
            NetworkMessage::DepositResponse(m) => Some(&m.sender_pub_key_ring),
            NetworkMessage::PaymentSentMessage(m) => Some(&m.sender_pub_key_ring),
            NetworkMessage::PaymentReceivedMessage(m) => Some(&m.sender_pub_key_ring),
            _ => None,
        }
    }

    pub fn sender_node_address(&self) -> &NodeAddress {
        match self {
            NetworkMessage::InitTradeRequest(m) => &m.sender_node_address,
            NetworkMessage::SignContractRequest(m) => &m.sender_node_address,
            NetworkMessage::SignContractResponse(m) => &m.sender_node_address,
            NetworkMessage::DepositRequest(m) => &m.sender_node_address,
            NetworkMessage::DepositResponse(m) => &m.sender_node_address,
            NetworkMessage::PaymentSentMessage(m) => &m.sender_node_address,
            NetworkMessage::PaymentReceivedMessage(m) => &m.sender_node_address,
            NetworkMessage::OfferAvailabilityRequest(m) => &m.sender_node_address,
            NetworkMessage::OfferAvailabilityResponse(m) => &m.sender_node_address,
            NetworkMessage::OpenNewDisputeMessage(m) => &m.sender_node_address,
            NetworkMessage::DisputeClosedMessage(m) => &m.sender_node_address,
            NetworkMessage::ChatMessage(m) => &m.sender_node_address,
        }
    }
}

impl Encodable for NetworkMessage {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let tag: u8 = match self {
            NetworkMessage::InitTradeRequest(_) => 0x01,
            NetworkMessage::SignContractRequest(_) => 0x02,
            NetworkMessage::SignContractResponse(_) => 0x03,
            NetworkMessage::DepositRequest(_) => 0x04,
            NetworkMessage::DepositResponse(_) => 0x05,
            NetworkMessage::PaymentSentMessage(_) => 0x06,
            NetworkMessage::PaymentReceivedMessage(_) => 0x07,
            NetworkMessage::OfferAvailabilityRequest(_) => 0x08,
            NetworkMessage::OfferAvailabilityResponse(_) => 0x09,
            NetworkMessage::OpenNewDisputeMessage(_) => 0x0a,
            NetworkMessage::DisputeClosedMessage(_) => 0x0b,
            NetworkMessage::ChatMessage(_) => 0x0c,
        };
        let len = tag.consensus_encode(s)?;
        let body = match self {
            NetworkMessage::InitTradeRequest(m) => m.consensus_encode(s)?,
            NetworkMessage::SignContractRequest(m) => m.consensus_encode(s)?,
            NetworkMessage::SignContractResponse(m) => m.consensus_encode(s)?,
            NetworkMessage::DepositRequest(m) => m.consensus_encode(s)?,
            NetworkMessage::DepositResponse(m) => m.consensus_encode(s)?,
            NetworkMessage::PaymentSentMessage(m) => m.consensus_encode(s)?,
            NetworkMessage::PaymentReceivedMessage(m) => m.consensus_encode(s)?,
            NetworkMessage::OfferAvailabilityRequest(m) => m.consensus_encode(s)?,
            NetworkMessage::OfferAvailabilityResponse(m) => m.consensus_encode(s)?,
            NetworkMessage::OpenNewDisputeMessage(m) => m.consensus_encode(s)?,
            NetworkMessage::DisputeClosedMessage(m) => m.consensus_encode(s)?,
            NetworkMessage::ChatMessage(m) => m.consensus_encode(s)?,
        };
        Ok(len + body)
    }
}

impl Decodable for NetworkMessage {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(NetworkMessage::InitTradeRequest(Decodable::consensus_decode(d)?)),
            0x02u8 => Ok(NetworkMessage::SignContractRequest(Decodable::consensus_decode(d)?)),
            0x03u8 => Ok(NetworkMessage::SignContractResponse(Decodable::consensus_decode(d)?)),
            0x04u8 => Ok(NetworkMessage::DepositRequest(Decodable::consensus_decode(d)?)),
            0x05u8 => Ok(NetworkMessage::DepositResponse(Decodable::consensus_decode(d)?)),
            0x06u8 => Ok(NetworkMessage::PaymentSentMessage(Decodable::consensus_decode(d)?)),
            0x07u8 => Ok(NetworkMessage::PaymentReceivedMessage(Decodable::consensus_decode(d)?)),
            0x08u8 => Ok(NetworkMessage::OfferAvailabilityRequest(Decodable::consensus_decode(d)?)),
            0x09u8 => Ok(NetworkMessage::OfferAvailabilityResponse(
                Decodable::consensus_decode(d)?,
            )),
            0x0au8 => Ok(NetworkMessage::OpenNewDisputeMessage(Decodable::consensus_decode(d)?)),
            0x0bu8 => Ok(NetworkMessage::DisputeClosedMessage(Decodable::consensus_decode(d)?)),
            0x0cu8 => Ok(NetworkMessage::ChatMessage(Decodable::consensus_decode(d)?)),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

impl_strict_encoding!(NetworkMessage);
