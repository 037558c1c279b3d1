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

//! Offers published by makers. An offer states the direction from the maker's point of view
//! (`Buy` means the maker buys monero), the amount range, the price and the fee and deposit
//! percentages both traders commit to.
//!
//! All derived amounts (fees, deposits, amount needed to reserve the offer) are computed here
//! from integer piconero and parts per million.

use std::fmt;
use std::io;
use std::str::FromStr;

use monero::Amount;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::consensus::{self, Decodable, Encodable};
use crate::crypto::{self, KeyRing, PubKeyRing};
use crate::network::NodeAddress;
use crate::payment::{is_traditional_currency, PaymentMethod};
use crate::price::MarketPrice;
use crate::restrictions::{security_deposit, Ppm};

pub mod availability;
pub mod book;

/// Price precision, prices are counter currency units scaled by `10^8` per monero.
pub const PRICE_PRECISION: u32 = 8;

/// Extra data key of the maker's account age witness hash.
pub const ACCOUNT_AGE_WITNESS_HASH: &str = "accountAgeWitnessHash";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A fixed price offer was taken at another price.
    #[error("Takers price does not match offer price. Takers price={taker}; offer price={offer}")]
    PriceMismatch { taker: u64, offer: u64 },
    /// The taker's price deviates too much from the maker's market based price.
    #[error(
        "Taker's trade price is too far away from our calculated price based on the market \
         price.\ntakersPrice={taker}\nmakersPrice={maker}"
    )]
    PriceOutOfTolerance { taker: u64, maker: u64 },
    /// No recent external market price to compute a market based price.
    #[error("Market price required for calculating trade price is not available.")]
    MarketPriceNotAvailable,
    #[error("takersTradePrice must be positive")]
    NonPositivePrice,
    /// Amount outside of the offer range.
    #[error("Amount {amount} is outside of the offer range [{min}, {max}]")]
    AmountOutOfRange {
        amount: Amount,
        min: Amount,
        max: Amount,
    },
}

/// Identifier of an offer, the trade born from the offer carries the same identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
#[display(inner)]
pub struct OfferId(pub Uuid);

impl OfferId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight characters, used in logs and user facing messages.
    pub fn short_id(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl From<Uuid> for OfferId {
    fn from(u: Uuid) -> Self {
        OfferId(u)
    }
}

impl FromStr for OfferId {
    type Err = consensus::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(OfferId(Uuid::parse_str(s).map_err(consensus::Error::new)?))
    }
}

impl Encodable for OfferId {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(writer)
    }
}

impl Decodable for OfferId {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(OfferId(Decodable::consensus_decode(d)?))
    }
}

impl_strict_encoding!(OfferId);

/// Direction of an offer from the maker's point of view.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[display(Debug)]
pub enum OfferDirection {
    Buy,
    Sell,
}

impl OfferDirection {
    /// Direction seen from the taker.
    pub fn mirrored(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl Encodable for OfferDirection {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            OfferDirection::Buy => 0x01u8.consensus_encode(writer),
            OfferDirection::Sell => 0x02u8.consensus_encode(writer),
        }
    }
}

impl Decodable for OfferDirection {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(OfferDirection::Buy),
            0x02u8 => Ok(OfferDirection::Sell),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

/// Price of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OfferPrice {
    /// Fixed price scaled by [`PRICE_PRECISION`].
    Fixed(u64),
    /// Margin over the market price in parts per million, positive margins favour the maker.
    MarketBased { margin_ppm: i32 },
}

impl Encodable for OfferPrice {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            OfferPrice::Fixed(price) => {
                Ok(0x01u8.consensus_encode(writer)? + price.consensus_encode(writer)?)
            }
            OfferPrice::MarketBased { margin_ppm } => {
                Ok(0x02u8.consensus_encode(writer)? + margin_ppm.consensus_encode(writer)?)
            }
        }
    }
}

impl Decodable for OfferPrice {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match u8::consensus_decode(d)? {
            0x01u8 => Ok(OfferPrice::Fixed(Decodable::consensus_decode(d)?)),
            0x02u8 => Ok(OfferPrice::MarketBased {
                margin_ppm: Decodable::consensus_decode(d)?,
            }),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

/// Local state of an offer, never transmitted.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[display(Debug)]
pub enum OfferState {
    Unknown,
    OfferFeeReserved,
    Available,
    NotAvailable,
    Removed,
    MakerOffline,
    Invalid,
}

impl Default for OfferState {
    fn default() -> Self {
        OfferState::Unknown
    }
}

/// An offer as published on the network plus its local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub id: OfferId,
    pub date: i64,
    pub owner_node_address: NodeAddress,
    pub pub_key_ring: PubKeyRing,
    pub direction: OfferDirection,
    pub price: OfferPrice,
    pub amount: Amount,
    pub min_amount: Amount,
    pub counter_currency_code: String,
    pub payment_method_id: String,
    pub maker_payment_account_id: String,
    pub maker_fee_pct: Ppm,
    pub taker_fee_pct: Ppm,
    pub penalty_fee_pct: Ppm,
    pub buyer_security_deposit_pct: Ppm,
    pub seller_security_deposit_pct: Ppm,
    pub max_trade_limit: Amount,
    pub max_trade_period: i64,
    pub protocol_version: u16,
    /// Hash of the passphrase of a private offer.
    pub challenge_hash: Option<String>,
    pub reserve_tx_key_images: Vec<String>,
    pub arbitrator_signer: Option<NodeAddress>,
    pub extra_data: Vec<(String, String)>,
    /// Local only.
    pub state: OfferState,
    /// Local only.
    pub error_message: Option<String>,
}

impl Offer {
    pub fn payment_method(&self) -> Option<&'static PaymentMethod> {
        PaymentMethod::by_id(&self.payment_method_id)
    }

    pub fn short_id(&self) -> String {
        self.id.short_id()
    }

    pub fn is_buy_offer(&self) -> bool {
        self.direction == OfferDirection::Buy
    }

    pub fn mirrored_direction(&self) -> OfferDirection {
        self.direction.mirrored()
    }

    pub fn is_range(&self) -> bool {
        self.amount != self.min_amount
    }

    pub fn is_traditional_offer(&self) -> bool {
        is_traditional_currency(&self.counter_currency_code)
    }

    pub fn is_private_offer(&self) -> bool {
        self.challenge_hash.is_some()
    }

    pub fn is_my_offer(&self, key_ring: &KeyRing) -> bool {
        &self.pub_key_ring == key_ring.pub_key_ring()
    }

    /// A buyer can take this offer without any security deposit.
    pub fn has_buyer_as_taker_without_deposit(&self) -> bool {
        self.direction == OfferDirection::Sell && self.buyer_security_deposit_pct.is_zero()
    }

    pub fn max_maker_fee(&self) -> Amount {
        self.maker_fee_pct.apply(self.amount)
    }

    pub fn maker_fee(&self, trade_amount: Amount) -> Amount {
        self.maker_fee_pct.apply(trade_amount)
    }

    pub fn taker_fee(&self, trade_amount: Amount) -> Amount {
        self.taker_fee_pct.apply(trade_amount)
    }

    pub fn max_buyer_security_deposit(&self) -> Amount {
        self.buyer_security_deposit(self.amount)
    }

    pub fn max_seller_security_deposit(&self) -> Amount {
        self.seller_security_deposit(self.amount)
    }

    pub fn buyer_security_deposit(&self, trade_amount: Amount) -> Amount {
        security_deposit(trade_amount, self.buyer_security_deposit_pct)
    }

    pub fn seller_security_deposit(&self, trade_amount: Amount) -> Amount {
        security_deposit(trade_amount, self.seller_security_deposit_pct)
    }

    /// Amount the maker reserves when posting the offer: its maximum deposit, the maximum maker
    /// fee and, when selling, the offer amount.
    pub fn amount_needed(&self) -> Amount {
        let deposit = match self.direction {
            OfferDirection::Buy => self.max_buyer_security_deposit(),
            OfferDirection::Sell => self.max_seller_security_deposit(),
        };
        let mut needed = deposit.as_pico() + self.max_maker_fee().as_pico();
        if self.direction == OfferDirection::Sell {
            needed += self.amount.as_pico();
        }
        Amount::from_pico(needed)
    }

    pub fn check_amount(&self, amount: Amount) -> Result<(), Error> {
        if amount < self.min_amount || amount > self.amount {
            return Err(Error::AmountOutOfRange {
                amount,
                min: self.min_amount,
                max: self.amount,
            });
        }
        Ok(())
    }

    /// Current price of the offer: the fixed price or the market price with the maker's margin
    /// applied. `None` when a market based offer has no recent external market price.
    pub fn current_price(&self, market_price: Option<&MarketPrice>, now_sec: i64) -> Option<u64> {
        match self.price {
            OfferPrice::Fixed(price) => Some(price),
            OfferPrice::MarketBased { margin_ppm } => {
                let market =
                    market_price.filter(|m| m.is_recent_external_price_available(now_sec))?;
                let margin = margin_ppm as f64 / 1_000_000.0;
                let factor = match self.direction {
                    OfferDirection::Buy => 1.0 - margin,
                    OfferDirection::Sell => 1.0 + margin,
                };
                let scaled = market.price * factor * 10f64.powi(PRICE_PRECISION as i32);
                if scaled.is_finite() && scaled > 0.0 {
                    Some(scaled.round() as u64)
                } else {
                    None
                }
            }
        }
    }

    /// Check the price the taker computed. Fixed prices must match exactly, market based prices
    /// may deviate by `tolerance` since both sides do not see the same market price.
    pub fn verify_trade_price(
        &self,
        price: u64,
        market_price: Option<&MarketPrice>,
        now_sec: i64,
        tolerance: Ppm,
    ) -> Result<(), Error> {
        if let OfferPrice::Fixed(offer_price) = self.price {
            if price != offer_price {
                return Err(Error::PriceMismatch {
                    taker: price,
                    offer: offer_price,
                });
            }
            return Ok(());
        }

        let offer_price = self
            .current_price(market_price, now_sec)
            .ok_or(Error::MarketPriceNotAvailable)?;
        if price == 0 {
            return Err(Error::NonPositivePrice);
        }
        let deviation = (price as i128 - offer_price as i128).unsigned_abs() * 1_000_000
            / offer_price as u128;
        info!(
            offer_id = %self.short_id(),
            currency = %self.counter_currency_code,
            takers_price = price,
            makers_price = offer_price,
            deviation_ppm = deviation as u64,
            "Price at take-offer time"
        );
        if deviation > tolerance.0 as u128 {
            warn!(offer_id = %self.short_id(), "Taker's trade price is out of tolerance");
            return Err(Error::PriceOutOfTolerance {
                taker: price,
                maker: offer_price,
            });
        }
        Ok(())
    }

    pub fn extra_data_value(&self, key: &str) -> Option<&str> {
        self.extra_data
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Hex encoded hash of the maker's account age witness, announced in the extra data.
    pub fn account_age_witness_hash_hex(&self) -> Option<&str> {
        self.extra_data_value(ACCOUNT_AGE_WITNESS_HASH)
    }

    /// Hash of the network payload, local state excluded.
    pub fn payload_hash(&self) -> Result<[u8; 32], consensus::Error> {
        Ok(crypto::sha256(&consensus::serialize(self)?))
    }
}

impl fmt::Display for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Offer {} {} {} XMR/{} via {}",
            self.short_id(),
            self.direction,
            self.amount,
            self.counter_currency_code,
            self.payment_method_id
        )
    }
}

impl Encodable for Offer {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.id.consensus_encode(s)?;
        len += self.date.consensus_encode(s)?;
        len += self.owner_node_address.consensus_encode(s)?;
        len += self.pub_key_ring.consensus_encode(s)?;
        len += self.direction.consensus_encode(s)?;
        len += self.price.consensus_encode(s)?;
        len += self.amount.consensus_encode(s)?;
        len += self.min_amount.consensus_encode(s)?;
        len += self.counter_currency_code.consensus_encode(s)?;
        len += self.payment_method_id.consensus_encode(s)?;
        len += self.maker_payment_account_id.consensus_encode(s)?;
        len += self.maker_fee_pct.consensus_encode(s)?;
        len += self.taker_fee_pct.consensus_encode(s)?;
        len += self.penalty_fee_pct.consensus_encode(s)?;
        len += self.buyer_security_deposit_pct.consensus_encode(s)?;
        len += self.seller_security_deposit_pct.consensus_encode(s)?;
        len += self.max_trade_limit.consensus_encode(s)?;
        len += self.max_trade_period.consensus_encode(s)?;
        len += self.protocol_version.consensus_encode(s)?;
        len += self.challenge_hash.consensus_encode(s)?;
        len += self.reserve_tx_key_images.consensus_encode(s)?;
        len += self.arbitrator_signer.consensus_encode(s)?;
        Ok(len + self.extra_data.consensus_encode(s)?)
    }
}

impl Decodable for Offer {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self {
            id: Decodable::consensus_decode(d)?,
            date: Decodable::consensus_decode(d)?,
            owner_node_address: Decodable::consensus_decode(d)?,
            pub_key_ring: Decodable::consensus_decode(d)?,
            direction: Decodable::consensus_decode(d)?,
            price: Decodable::consensus_decode(d)?,
            amount: Decodable::consensus_decode(d)?,
            min_amount: Decodable::consensus_decode(d)?,
            counter_currency_code: Decodable::consensus_decode(d)?,
            payment_method_id: Decodable::consensus_decode(d)?,
            maker_payment_account_id: Decodable::consensus_decode(d)?,
            maker_fee_pct: Decodable::consensus_decode(d)?,
            taker_fee_pct: Decodable::consensus_decode(d)?,
            penalty_fee_pct: Decodable::consensus_decode(d)?,
            buyer_security_deposit_pct: Decodable::consensus_decode(d)?,
            seller_security_deposit_pct: Decodable::consensus_decode(d)?,
            max_trade_limit: Decodable::consensus_decode(d)?,
            max_trade_period: Decodable::consensus_decode(d)?,
            protocol_version: Decodable::consensus_decode(d)?,
            challenge_hash: Decodable::consensus_decode(d)?,
            reserve_tx_key_images: Decodable::consensus_decode(d)?,
            arbitrator_signer: Decodable::consensus_decode(d)?,
            extra_data: Decodable::consensus_decode(d)?,
            state: OfferState::Unknown,
            error_message: None,
        })
    }
}

impl_strict_encoding!(Offer);
