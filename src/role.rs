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

//! Roles of the participants of a trade. The trade role says who created the offer and who took
//! it, the arbitrator observes both. The payment role is orthogonal and derived from the offer
//! direction: the buyer sends the traditional payment, the seller releases the monero.

use std::io;
use std::str::FromStr;

use crate::consensus::{self, Decodable, Encodable};
use crate::offer::OfferDirection;

/// Possible roles of a node in a trade.
#[derive(Display, Debug, Clone, Hash, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[display(Debug)]
pub enum TradeRole {
    /// Created the offer.
    Maker,
    /// Took the offer.
    Taker,
    /// Verifies reserve transactions of both traders and resolves disputes.
    Arbitrator,
}

impl TradeRole {
    /// The counterparty role of a trader, the arbitrator has none.
    pub fn other(&self) -> Option<Self> {
        match self {
            Self::Maker => Some(Self::Taker),
            Self::Taker => Some(Self::Maker),
            Self::Arbitrator => None,
        }
    }

    pub fn is_trader(&self) -> bool {
        !matches!(self, Self::Arbitrator)
    }

    /// Payment role of a trader given the offer direction, `None` for the arbitrator.
    pub fn payment_role(&self, direction: OfferDirection) -> Option<PaymentRole> {
        match (self, direction) {
            (Self::Maker, OfferDirection::Buy) | (Self::Taker, OfferDirection::Sell) => {
                Some(PaymentRole::Buyer)
            }
            (Self::Maker, OfferDirection::Sell) | (Self::Taker, OfferDirection::Buy) => {
                Some(PaymentRole::Seller)
            }
            (Self::Arbitrator, _) => None,
        }
    }
}

impl Encodable for TradeRole {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            TradeRole::Maker => 0x01u8.consensus_encode(writer),
            TradeRole::Taker => 0x02u8.consensus_encode(writer),
            TradeRole::Arbitrator => 0x03u8.consensus_encode(writer),
        }
    }
}

impl Decodable for TradeRole {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(TradeRole::Maker),
            0x02u8 => Ok(TradeRole::Taker),
            0x03u8 => Ok(TradeRole::Arbitrator),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

impl_strict_encoding!(TradeRole);

impl FromStr for TradeRole {
    type Err = consensus::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Maker" | "maker" => Ok(TradeRole::Maker),
            "Taker" | "taker" => Ok(TradeRole::Taker),
            "Arbitrator" | "arbitrator" => Ok(TradeRole::Arbitrator),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

/// Payment direction of a trader.
#[derive(Display, Debug, Clone, Hash, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[display(Debug)]
pub enum PaymentRole {
    /// Buys monero and sends the traditional payment.
    Buyer,
    /// Sells monero and confirms the reception of the payment.
    Seller,
}

impl PaymentRole {
    pub fn other(&self) -> Self {
        match self {
            Self::Buyer => Self::Seller,
            Self::Seller => Self::Buyer,
        }
    }
}

impl Encodable for PaymentRole {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            PaymentRole::Buyer => 0x01u8.consensus_encode(writer),
            PaymentRole::Seller => 0x02u8.consensus_encode(writer),
        }
    }
}

impl Decodable for PaymentRole {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(PaymentRole::Buyer),
            0x02u8 => Ok(PaymentRole::Seller),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_role_follows_offer_direction() {
        assert_eq!(
            TradeRole::Maker.payment_role(OfferDirection::Buy),
            Some(PaymentRole::Buyer)
        );
        assert_eq!(
            TradeRole::Taker.payment_role(OfferDirection::Buy),
            Some(PaymentRole::Seller)
        );
        assert_eq!(
            TradeRole::Taker.payment_role(OfferDirection::Sell),
            Some(PaymentRole::Buyer)
        );
        assert_eq!(TradeRole::Arbitrator.payment_role(OfferDirection::Sell), None);
    }

    #[test]
    fn parse_and_encode_roles() {
        assert_eq!(TradeRole::from_str("arbitrator").unwrap(), TradeRole::Arbitrator);
        let bytes = consensus::serialize(&TradeRole::Taker).unwrap();
        assert_eq!(bytes, vec![0x02]);
        assert!(consensus::deserialize::<TradeRole>(&[0x09]).is_err());
        assert_eq!(TradeRole::Maker.other(), Some(TradeRole::Taker));
        assert_eq!(TradeRole::Arbitrator.other(), None);
    }
}
