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

//! Protocol of the maker: accept the taker, forward its request to the arbitrator, then sign
//! and fund the contract like any trader.

use crate::protocol::message::NetworkMessage;
use crate::protocol::tasks::*;
use crate::protocol::{trader_pipeline, TradeProtocol};
use crate::role::TradeRole;
use crate::task::TaskRunner;
use crate::trade::TradeContext;

#[derive(Debug, Clone, Copy, Default)]
pub struct MakerProtocol;

impl TradeProtocol for MakerProtocol {
    fn role(&self) -> TradeRole {
        TradeRole::Maker
    }

    fn pipeline_for(&self, message: &NetworkMessage) -> Option<TaskRunner<TradeContext>> {
        match message {
            NetworkMessage::InitTradeRequest(_) => Some(
                TaskRunner::new()
                    .then(ProcessInitTradeRequest)
                    .then(VerifyPeersAccountAgeWitness)
                    .then(MakerSetLockTime)
                    .then(MakerSendInitTradeRequestToArbitrator),
            ),
            other => trader_pipeline(other),
        }
    }
}
