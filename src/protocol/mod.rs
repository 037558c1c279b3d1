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

//! Trade protocol. Each party runs the protocol of its [`TradeRole`]: an incoming message or a
//! local event selects a pipeline of [`tasks`] run over the trade.
//!
//! ## Flow
//!
//! ```text
//! taker      --init_trade_request-->       maker, arbitrator
//! maker      --init_trade_request-->       arbitrator
//! arbitrator --sign_contract_request-->    maker, taker
//! trader     --sign_contract_response-->   trader
//! trader     --deposit_request-->          arbitrator
//! arbitrator --deposit_response-->         maker, taker
//! buyer      --payment_sent_message-->     seller, arbitrator
//! seller     --payment_received_message--> buyer, arbitrator
//! ```
//!
//! A failed pipeline leaves the trade as it was before the pipeline, only its error message is
//! kept. A successful pipeline schedules the write of the trade record.

use std::fmt;

use tracing::{info, warn};

use crate::protocol::message::NetworkMessage;
use crate::protocol::tasks::*;
use crate::role::TradeRole;
use crate::task::TaskRunner;
use crate::trade::TradeContext;
use crate::{Error, Res};

pub mod arbitrator;
pub mod maker;
pub mod message;
pub mod taker;
pub mod tasks;

pub use arbitrator::ArbitratorProtocol;
pub use maker::MakerProtocol;
pub use taker::{FundsNeeded, TakerProtocol};

/// Run a pipeline over the trade. On failure the trade is restored to its state before the
/// pipeline, with the error message of the failed task.
pub fn run_pipeline(ctx: &mut TradeContext, runner: TaskRunner<TradeContext>) -> Res<()> {
    let snapshot = ctx.trade.clone();
    let runner = runner.with_intercept(ctx.model.intercept.clone());
    match runner.run(ctx) {
        Ok(()) => ctx.persist(),
        Err(e) => {
            let error_message = ctx.trade.error_message.take();
            ctx.trade = snapshot;
            ctx.trade.error_message = error_message;
            warn!(trade_id = %ctx.trade.short_id(), error = %e, "Trade restored after failure");
            Err(e)
        }
    }
}

/// The protocol run by one role of a trade.
pub trait TradeProtocol: Send + Sync + fmt::Debug {
    fn role(&self) -> TradeRole;

    /// Pipeline processing `message`, `None` when the role does not handle this message.
    fn pipeline_for(&self, message: &NetworkMessage) -> Option<TaskRunner<TradeContext>>;

    fn handle_message(&self, ctx: &mut TradeContext, message: NetworkMessage) -> Res<()> {
        let runner = self.pipeline_for(&message).ok_or_else(|| {
            Error::IllegalState(format!(
                "The {} does not handle {}",
                self.role(),
                message.kind()
            ))
        })?;
        info!(
            trade_id = %ctx.trade.short_id(),
            role = %self.role(),
            message = message.kind(),
            from = %message.sender_node_address(),
            "Handling message"
        );
        ctx.model.temp_peer_node_address = Some(message.sender_node_address().clone());
        ctx.model.message = Some(message);
        let result = run_pipeline(ctx, runner);
        ctx.model.take_message();
        result
    }

    fn on_deposits_confirmed(&self, ctx: &mut TradeContext) -> Res<()> {
        run_pipeline(ctx, TaskRunner::new().then(SetDepositsConfirmed))
    }

    fn on_deposits_unlocked(&self, ctx: &mut TradeContext) -> Res<()> {
        run_pipeline(ctx, TaskRunner::new().then(SetDepositsUnlocked))
    }

    /// The buyer started the counter currency payment.
    fn on_payment_sent(&self, ctx: &mut TradeContext) -> Res<()> {
        if !ctx.trade.is_buyer() {
            return Err(Error::RoleMismatch(format!(
                "Payment sent on trade {} where we are not the buyer",
                ctx.trade.short_id()
            )));
        }
        run_pipeline(ctx, TaskRunner::new().then(BuyerSendPaymentSentMessage))
    }

    /// The seller received the counter currency payment: publish the payout.
    fn on_payment_received(&self, ctx: &mut TradeContext) -> Res<()> {
        if !ctx.trade.is_seller() {
            return Err(Error::RoleMismatch(format!(
                "Payment received on trade {} where we are not the seller",
                ctx.trade.short_id()
            )));
        }
        run_pipeline(
            ctx,
            TaskRunner::new()
                .then(SellerPreparePaymentReceived)
                .then(SellerSignAndPublishPayoutTx)
                .then(SellerMaybeSignPeersWitness)
                .then(SellerSendPaymentReceivedMessage),
        )
    }

    fn on_trade_completed(&self, ctx: &mut TradeContext) -> Res<()> {
        run_pipeline(ctx, TaskRunner::new().then(CompleteTrade))
    }
}

/// Pipelines shared by the maker and the taker.
fn trader_pipeline(message: &NetworkMessage) -> Option<TaskRunner<TradeContext>> {
    let runner = match message {
        NetworkMessage::SignContractRequest(_) => TaskRunner::new()
            .then(ProcessSignContractRequest)
            .then(TraderCreateDepositTx)
            .then(TraderSendSignContractResponse)
            .then(VerifyPeersContract)
            .then(TraderSendDepositRequest),
        NetworkMessage::SignContractResponse(_) => TaskRunner::new()
            .then(ProcessSignContractResponse)
            .then(VerifyPeersContract)
            .then(VerifyPeersAccountAgeWitness)
            .then(TraderSendDepositRequest),
        NetworkMessage::DepositResponse(_) => TaskRunner::new()
            .then(ProcessDepositResponse)
            .then(MaybePublishTradeStatistics),
        NetworkMessage::PaymentSentMessage(_) => TaskRunner::new().then(ProcessPaymentSentMessage),
        NetworkMessage::PaymentReceivedMessage(_) => {
            TaskRunner::new().then(ProcessPaymentReceivedMessage)
        }
        _ => return None,
    };
    Some(runner)
}

/// Protocol of a role.
pub fn protocol_for(role: TradeRole) -> &'static dyn TradeProtocol {
    match role {
        TradeRole::Maker => &MakerProtocol,
        TradeRole::Taker => &TakerProtocol,
        TradeRole::Arbitrator => &ArbitratorProtocol,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::Arc;

    use monero::Amount;

    use crate::clock::ManualClock;
    use crate::mock::{key, Gossip, Memory, MockWallet};
    use crate::network::{Network, NetworkContext, NodeAddress};
    use crate::offer::OfferDirection;
    use crate::restrictions::Ppm;
    use crate::services::{NoFilter, Services};
    use crate::trade::statistics::TradeStatisticsManager;
    use crate::trade::tests::offer;
    use crate::trade::{ProcessModel, Trade, TradePhase};
    use crate::witness::signed::SignedWitnessService;
    use crate::witness::AccountAgeWitnessService;

    pub(crate) fn context(
        role: TradeRole,
        direction: OfferDirection,
    ) -> (TradeContext, Arc<Gossip>, Arc<Memory>) {
        let gossip = Arc::new(Gossip::default());
        let memory = Arc::new(Memory::default());
        let key_ring = Arc::new(key(2));
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let services = Services {
            wallet: Arc::new(MockWallet::default()),
            p2p: gossip.clone(),
            persistence: memory.clone(),
            filter: Arc::new(NoFilter),
        };
        let signed = Arc::new(SignedWitnessService::new(
            key_ring.clone(),
            gossip.clone(),
            Arc::new(NoFilter),
            clock.clone(),
        ));
        let witness_service = Arc::new(AccountAgeWitnessService::new(
            key_ring.clone(),
            gossip.clone(),
            Arc::new(NoFilter),
            clock.clone(),
            signed,
            16,
        ));
        let o = offer(direction);
        let amount = o.amount;
        let trade = Trade::new(
            role,
            o,
            amount,
            150_0000_0000,
            Amount::from_pico(0),
            1_700_000_000_000,
        );
        let model = ProcessModel {
            offer_id: trade.id,
            services,
            witness_service,
            key_ring: key(2),
            node_address: NodeAddress::new("taker.onion", 9999),
            ctx: NetworkContext::new(Network::Local),
            clock,
            price_feed: None,
            price_tolerance: Ppm(10_000),
            statistics: Arc::new(TradeStatisticsManager::new()),
            message: None,
            temp_peer_node_address: None,
            reserve_tx: None,
            deposit_tx: None,
            payout_tx: None,
            signed_witness: None,
            intercept: None,
        };
        (TradeContext::new(trade, model), gossip, memory)
    }

    #[test]
    fn payment_events_check_the_role() {
        // taker of a buy offer sells
        let (mut ctx, _, _) = context(TradeRole::Taker, OfferDirection::Buy);
        let protocol = protocol_for(ctx.trade.role);
        assert!(matches!(
            protocol.on_payment_sent(&mut ctx),
            Err(Error::RoleMismatch(_))
        ));
        assert!(ctx.trade.error_message.is_none());

        let (mut ctx, _, _) = context(TradeRole::Arbitrator, OfferDirection::Buy);
        assert!(matches!(
            protocol_for(TradeRole::Arbitrator).on_payment_received(&mut ctx),
            Err(Error::RoleMismatch(_))
        ));
    }

    #[test]
    fn failed_pipeline_restores_the_trade() {
        let (mut ctx, _, memory) = context(TradeRole::Taker, OfferDirection::Sell);
        ctx.trade.set_phase(TradePhase::DepositsPublished).unwrap();
        let before = ctx.trade.clone();
        // the buyer sends the payment before the deposits unlocked
        let res = protocol_for(TradeRole::Taker).on_payment_sent(&mut ctx);
        match res {
            Err(Error::Task { task, .. }) => assert_eq!(task, "BuyerSendPaymentSentMessage"),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(ctx.trade.phase, before.phase);
        assert!(ctx.trade.error_message.is_some());
        assert!(memory.records.lock().is_empty());

        protocol_for(TradeRole::Taker)
            .on_deposits_unlocked(&mut ctx)
            .unwrap();
        assert_eq!(ctx.trade.phase, TradePhase::DepositsUnlocked);
        assert_eq!(memory.records.lock().len(), 1);
    }

    #[test]
    fn unhandled_message_is_refused() {
        let (mut ctx, _, _) = context(TradeRole::Taker, OfferDirection::Sell);
        let message = NetworkMessage::DepositRequest(crate::protocol::message::DepositRequest {
            trade_id: ctx.trade.id,
            sender_node_address: NodeAddress::new("maker.onion", 9999),
            sender_pub_key_ring: *key(1).pub_key_ring(),
            contract_signature: vec![],
            deposit_tx_hash: None,
            deposit_tx_hex: None,
            current_date: 0,
        });
        assert!(matches!(
            protocol_for(TradeRole::Taker).handle_message(&mut ctx, message),
            Err(Error::IllegalState(_))
        ));
        assert!(ctx.model.message.is_none());
    }

    #[test]
    fn intercept_observes_the_pipeline() {
        let (mut ctx, _, _) = context(TradeRole::Maker, OfferDirection::Buy);
        ctx.trade.set_phase(TradePhase::PayoutPublished).unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let hook_seen = seen.clone();
        ctx.model.intercept = Some(Arc::new(move |name: &'static str| hook_seen.lock().push(name)));
        protocol_for(TradeRole::Maker)
            .on_trade_completed(&mut ctx)
            .unwrap();
        assert_eq!(*seen.lock(), vec!["CompleteTrade"]);
        assert!(ctx.trade.is_completed());
    }
}
