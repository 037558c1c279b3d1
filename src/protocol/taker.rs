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

//! Protocol of the taker: reserve the funds and send the init trade requests, then sign and
//! fund the contract like any trader.

use monero::Amount;

use crate::offer::{Offer, OfferDirection};
use crate::protocol::message::NetworkMessage;
use crate::protocol::tasks::*;
use crate::protocol::{run_pipeline, trader_pipeline, TradeProtocol};
use crate::role::TradeRole;
use crate::task::TaskRunner;
use crate::trade::TradeContext;
use crate::Res;

/// Funds the taker commits when taking an offer, fixed at take time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundsNeeded {
    pub trade_amount: Amount,
    pub taker_fee: Amount,
    pub security_deposit: Amount,
    /// Trade amount when the taker sells, zero otherwise.
    pub send_amount: Amount,
}

impl FundsNeeded {
    pub fn new(offer: &Offer, trade_amount: Amount) -> Self {
        // the taker trades the mirrored direction of the offer
        let (security_deposit, send_amount) = match offer.direction {
            OfferDirection::Sell => (
                offer.buyer_security_deposit(trade_amount),
                Amount::from_pico(0),
            ),
            OfferDirection::Buy => (offer.seller_security_deposit(trade_amount), trade_amount),
        };
        Self {
            trade_amount,
            taker_fee: offer.taker_fee(trade_amount),
            security_deposit,
            send_amount,
        }
    }

    /// Total the taker's wallet must hold.
    pub fn total(&self) -> Amount {
        Amount::from_pico(
            self.taker_fee.as_pico() + self.security_deposit.as_pico() + self.send_amount.as_pico(),
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TakerProtocol;

impl TakerProtocol {
    /// Reserve the funds and send the init trade requests to the maker and the arbitrator.
    pub fn take_offer(&self, ctx: &mut TradeContext) -> Res<()> {
        run_pipeline(
            ctx,
            TaskRunner::new()
                .then(TakerReserveTradeFunds)
                .then(TakerSendInitTradeRequests),
        )
    }
}

impl TradeProtocol for TakerProtocol {
    fn role(&self) -> TradeRole {
        TradeRole::Taker
    }

    fn pipeline_for(&self, message: &NetworkMessage) -> Option<TaskRunner<TradeContext>> {
        trader_pipeline(message)
    }
}
