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

//! Protocol of the arbitrator. It verifies both reserve transactions, writes the contract and
//! publishes the deposits; it follows the payment only to be ready for a dispute.

use crate::protocol::message::NetworkMessage;
use crate::protocol::tasks::*;
use crate::protocol::TradeProtocol;
use crate::role::TradeRole;
use crate::task::TaskRunner;
use crate::trade::TradeContext;

#[derive(Debug, Clone, Copy, Default)]
pub struct ArbitratorProtocol;

impl TradeProtocol for ArbitratorProtocol {
    fn role(&self) -> TradeRole {
        TradeRole::Arbitrator
    }

    fn pipeline_for(&self, message: &NetworkMessage) -> Option<TaskRunner<TradeContext>> {
        let runner = match message {
            NetworkMessage::InitTradeRequest(_) => TaskRunner::new()
                .then(ProcessInitTradeRequest)
                .then(ArbitratorProcessReserveTx)
                .then(ArbitratorSendSignContractRequests),
            NetworkMessage::DepositRequest(_) => TaskRunner::new()
                .then(ArbitratorProcessDepositRequest)
                .then(ArbitratorPublishDepositTxs),
            NetworkMessage::PaymentSentMessage(_) => {
                TaskRunner::new().then(ProcessPaymentSentMessage)
            }
            NetworkMessage::PaymentReceivedMessage(_) => {
                TaskRunner::new().then(ProcessPaymentReceivedMessage)
            }
            _ => return None,
        };
        Some(runner)
    }
}
