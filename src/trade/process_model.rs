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

//! Transient state of one protocol run. Nothing here is persisted, a restarted node rebuilds
//! its process model from the trade record and its services.

use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;
use crate::crypto::KeyRing;
use crate::manager::open_trade_key;
use crate::network::{NetworkContext, NodeAddress};
use crate::offer::OfferId;
use crate::price::PriceFeedService;
use crate::protocol::message::NetworkMessage;
use crate::restrictions::Ppm;
use crate::services::{PayoutTx, Services, TxHandle};
use crate::task::{InterceptHook, TaskContext};
use crate::trade::statistics::TradeStatisticsManager;
use crate::trade::Trade;
use crate::witness::signed::SignedWitness;
use crate::witness::AccountAgeWitnessService;
use crate::{Error, Res};

#[derive(Clone)]
pub struct ProcessModel {
    pub offer_id: OfferId,
    pub services: Services,
    pub witness_service: Arc<AccountAgeWitnessService>,
    pub key_ring: KeyRing,
    /// Address of the local node, sender of every outgoing message.
    pub node_address: NodeAddress,
    pub ctx: NetworkContext,
    pub clock: Arc<dyn Clock>,
    pub price_feed: Option<Arc<PriceFeedService>>,
    pub price_tolerance: Ppm,
    pub statistics: Arc<TradeStatisticsManager>,
    /// Message being processed.
    pub message: Option<NetworkMessage>,
    /// Sender of the message being processed.
    pub temp_peer_node_address: Option<NodeAddress>,
    /// Reserve transaction created by this node.
    pub reserve_tx: Option<TxHandle>,
    /// Deposit transaction created by this node.
    pub deposit_tx: Option<TxHandle>,
    pub payout_tx: Option<PayoutTx>,
    /// Peer's witness signed by this trade.
    pub signed_witness: Option<SignedWitness>,
    pub intercept: Option<InterceptHook>,
}

impl fmt::Debug for ProcessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessModel")
            .field("offer_id", &self.offer_id)
            .field("network", &self.ctx.network())
            .field("message", &self.message.as_ref().map(NetworkMessage::kind))
            .field("temp_peer_node_address", &self.temp_peer_node_address)
            .field("reserve_tx", &self.reserve_tx.as_ref().map(|tx| &tx.hash))
            .field("deposit_tx", &self.deposit_tx.as_ref().map(|tx| &tx.hash))
            .finish()
    }
}

impl ProcessModel {
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Take the message being processed, leaving nothing behind.
    pub fn take_message(&mut self) -> Option<NetworkMessage> {
        self.message.take()
    }
}

/// Context of the trade pipelines: the trade and its process model.
#[derive(Debug)]
pub struct TradeContext {
    pub trade: Trade,
    pub model: ProcessModel,
}

impl TradeContext {
    pub fn new(trade: Trade, model: ProcessModel) -> Self {
        Self { trade, model }
    }

    /// Schedule the write of the trade record.
    pub fn persist(&self) -> Res<()> {
        let record = self.trade.seal(&self.model.ctx)?;
        self.model
            .services
            .persistence
            .request_persistence(&open_trade_key(&self.trade.id), record);
        Ok(())
    }
}

impl TaskContext for TradeContext {
    fn on_task_failed(&mut self, task: &'static str, error: &Error) {
        tracing::warn!(trade_id = %self.trade.short_id(), task, "Trade pipeline aborted");
        self.trade.set_error_message(error.to_string());
    }
}
