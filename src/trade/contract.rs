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

//! The trade contract both traders sign before funding the deposits. Its hash is what the
//! contract signatures cover, disputes keep a copy as evidence.

use monero::Amount;

use crate::consensus::{self, serialize};
use crate::crypto::{sha256, PubKeyRing};
use crate::network::NodeAddress;
use crate::offer::OfferId;
use crate::trade::{Trade, TradePeer};
use crate::{Error, Res};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub offer_id: OfferId,
    pub trade_amount: Amount,
    pub trade_price: u64,
    pub payment_method_id: String,
    pub counter_currency_code: String,
    pub lock_time: u64,
    pub arbitrator_node_address: NodeAddress,
    pub maker_node_address: NodeAddress,
    pub taker_node_address: NodeAddress,
    /// The maker buys monero.
    pub is_buyer_maker_and_seller_taker: bool,
    pub maker_account_id: String,
    pub taker_account_id: String,
    pub maker_payment_account_payload_hash: [u8; 32],
    pub taker_payment_account_payload_hash: [u8; 32],
    pub maker_pub_key_ring: PubKeyRing,
    pub taker_pub_key_ring: PubKeyRing,
    pub maker_payout_address: String,
    pub taker_payout_address: String,
}

fn required<'a, T>(value: &'a Option<T>, what: &str, trade: &Trade) -> Res<&'a T> {
    value.as_ref().ok_or_else(|| {
        Error::IllegalState(format!("Missing {} for contract of trade {}", what, trade.short_id()))
    })
}

impl Contract {
    /// Build the contract from what the arbitrator learned in the init trade requests.
    pub fn from_trade(trade: &Trade) -> Res<Self> {
        let lock_time = *required(&trade.lock_time, "lock time", trade)?;
        type PeerFields = (NodeAddress, PubKeyRing, String, [u8; 32], String);
        let peer = |p: &TradePeer, side: &str| -> Res<PeerFields> {
            Ok((
                required(&p.node_address, &format!("{} node address", side), trade)?.clone(),
                *required(&p.pub_key_ring, &format!("{} pub key ring", side), trade)?,
                required(&p.payment_account_id, &format!("{} account id", side), trade)?.clone(),
                *required(
                    &p.payment_account_payload_hash,
                    &format!("{} payment account hash", side),
                    trade,
                )?,
                required(&p.payout_address, &format!("{} payout address", side), trade)?.clone(),
            ))
        };
        let (maker_node_address, maker_pub_key_ring, maker_account_id, maker_hash, maker_payout) =
            peer(&trade.maker, "maker")?;
        let (taker_node_address, taker_pub_key_ring, taker_account_id, taker_hash, taker_payout) =
            peer(&trade.taker, "taker")?;
        let arbitrator_node_address =
            required(&trade.arbitrator.node_address, "arbitrator node address", trade)?.clone();
        Ok(Contract {
            offer_id: trade.id,
            trade_amount: trade.amount,
            trade_price: trade.price,
            payment_method_id: trade.offer.payment_method_id.clone(),
            counter_currency_code: trade.offer.counter_currency_code.clone(),
            lock_time,
            arbitrator_node_address,
            maker_node_address,
            taker_node_address,
            is_buyer_maker_and_seller_taker: trade.is_buyer_maker(),
            maker_account_id,
            taker_account_id,
            maker_payment_account_payload_hash: maker_hash,
            taker_payment_account_payload_hash: taker_hash,
            maker_pub_key_ring,
            taker_pub_key_ring,
            maker_payout_address: maker_payout,
            taker_payout_address: taker_payout,
        })
    }

    pub fn hash(&self) -> Result<[u8; 32], consensus::Error> {
        Ok(sha256(&serialize(self)?))
    }

    pub fn buyer_node_address(&self) -> &NodeAddress {
        if self.is_buyer_maker_and_seller_taker {
            &self.maker_node_address
        } else {
            &self.taker_node_address
        }
    }

    pub fn seller_node_address(&self) -> &NodeAddress {
        if self.is_buyer_maker_and_seller_taker {
            &self.taker_node_address
        } else {
            &self.maker_node_address
        }
    }

    pub fn buyer_pub_key_ring(&self) -> &PubKeyRing {
        if self.is_buyer_maker_and_seller_taker {
            &self.maker_pub_key_ring
        } else {
            &self.taker_pub_key_ring
        }
    }

    pub fn seller_pub_key_ring(&self) -> &PubKeyRing {
        if self.is_buyer_maker_and_seller_taker {
            &self.taker_pub_key_ring
        } else {
            &self.maker_pub_key_ring
        }
    }

    pub fn buyer_payout_address(&self) -> &str {
        if self.is_buyer_maker_and_seller_taker {
            &self.maker_payout_address
        } else {
            &self.taker_payout_address
        }
    }

    pub fn seller_payout_address(&self) -> &str {
        if self.is_buyer_maker_and_seller_taker {
            &self.taker_payout_address
        } else {
            &self.maker_payout_address
        }
    }
}

impl_consensus_fields!(Contract {
    offer_id,
    trade_amount,
    trade_price,
    payment_method_id,
    counter_currency_code,
    lock_time,
    arbitrator_node_address,
    maker_node_address,
    taker_node_address,
    is_buyer_maker_and_seller_taker,
    maker_account_id,
    taker_account_id,
    maker_payment_account_payload_hash,
    taker_payment_account_payload_hash,
    maker_pub_key_ring,
    taker_pub_key_ring,
    maker_payout_address,
    taker_payout_address,
});

impl_strict_encoding!(Contract);
