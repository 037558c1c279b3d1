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

//! Entry point of the node: owns the open offers and the trades, routes incoming messages and
//! local events to the protocol of each trade.
//!
//! Each trade sits behind its own mutex, a message for a trade waits for the pipeline running
//! on it while other trades proceed. The map of trades is only locked to look a trade up or to
//! create it, never while a pipeline runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use monero::Amount;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::crypto::KeyRing;
use crate::dispute::{Dispute, DisputeList, DisputeResult};
use crate::network::{NetworkContext, NodeAddress};
use crate::offer::availability::{
    evaluate_request, OfferAvailabilityRequest, OfferAvailabilityResponse,
    OfferAvailabilityService,
};
use crate::offer::{self, Offer, OfferId, OfferState};
use crate::payment::PaymentAccount;
use crate::price::PriceFeedService;
use crate::protocol::message::{InitTradeRequest, NetworkMessage};
use crate::protocol::{protocol_for, FundsNeeded, TakerProtocol, TradeProtocol};
use crate::restrictions::Ppm;
use crate::role::TradeRole;
use crate::services::{Services, TxHandle};
use crate::task::InterceptHook;
use crate::trade::statistics::TradeStatisticsManager;
use crate::trade::{ProcessModel, Trade, TradeContext, TradeDisputeState, TradeId};
use crate::witness::AccountAgeWitnessService;
use crate::{Error, Res};

/// Persistence key prefix of the trades in progress.
pub const OPEN_TRADE_KEY_PREFIX: &str = "trades/open/";
/// Persistence key prefix of the completed or abandoned trades.
pub const CLOSED_TRADE_KEY_PREFIX: &str = "trades/closed/";

pub fn open_trade_key(id: &TradeId) -> String {
    format!("{}{}", OPEN_TRADE_KEY_PREFIX, id)
}

pub fn closed_trade_key(id: &TradeId) -> String {
    format!("{}{}", CLOSED_TRADE_KEY_PREFIX, id)
}

/// One of our offers waiting for a taker, with the account and the reserve transaction backing
/// it.
#[derive(Debug, Clone)]
pub struct OpenOffer {
    pub offer: Offer,
    pub account: PaymentAccount,
    pub reserve_tx: Option<TxHandle>,
}

type TradeEntry = Arc<Mutex<TradeContext>>;

pub struct TradeManager {
    key_ring: Arc<KeyRing>,
    node_address: NodeAddress,
    services: Services,
    witness_service: Arc<AccountAgeWitnessService>,
    disputes: Arc<DisputeList>,
    ctx: NetworkContext,
    clock: Arc<dyn Clock>,
    price_feed: Option<Arc<PriceFeedService>>,
    price_tolerance: Ppm,
    statistics: Arc<TradeStatisticsManager>,
    availability: Option<Arc<OfferAvailabilityService>>,
    intercept: Option<InterceptHook>,
    open_offers: Mutex<HashMap<OfferId, OpenOffer>>,
    trades: Mutex<HashMap<TradeId, TradeEntry>>,
    closed: Mutex<HashMap<TradeId, Trade>>,
}

impl fmt::Debug for TradeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TradeManager")
            .field("node_address", &self.node_address)
            .field("open_offers", &self.open_offers.lock().len())
            .field("trades", &self.trades.lock().len())
            .field("closed", &self.closed.lock().len())
            .finish()
    }
}

impl TradeManager {
    pub fn new(
        config: &Config,
        key_ring: Arc<KeyRing>,
        node_address: NodeAddress,
        services: Services,
        witness_service: Arc<AccountAgeWitnessService>,
        disputes: Arc<DisputeList>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key_ring,
            node_address,
            services,
            witness_service,
            disputes,
            ctx: config.network_context(),
            clock,
            price_feed: None,
            price_tolerance: Ppm(config.price_tolerance_ppm),
            statistics: Arc::new(TradeStatisticsManager::new()),
            availability: None,
            intercept: None,
            open_offers: Mutex::new(HashMap::new()),
            trades: Mutex::new(HashMap::new()),
            closed: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_price_feed(mut self, price_feed: Arc<PriceFeedService>) -> Self {
        self.price_feed = Some(price_feed);
        self
    }

    /// Forward availability responses to `availability`.
    pub fn with_availability_service(
        mut self,
        availability: Arc<OfferAvailabilityService>,
    ) -> Self {
        self.availability = Some(availability);
        self
    }

    pub fn with_statistics(mut self, statistics: Arc<TradeStatisticsManager>) -> Self {
        self.statistics = statistics;
        self
    }

    /// Hook run before every task of every pipeline.
    pub fn with_intercept(mut self, intercept: InterceptHook) -> Self {
        self.intercept = Some(intercept);
        self
    }

    pub fn node_address(&self) -> &NodeAddress {
        &self.node_address
    }

    pub fn statistics(&self) -> &Arc<TradeStatisticsManager> {
        &self.statistics
    }

    fn model(&self, offer_id: OfferId) -> ProcessModel {
        ProcessModel {
            offer_id,
            services: self.services.clone(),
            witness_service: self.witness_service.clone(),
            key_ring: (*self.key_ring).clone(),
            node_address: self.node_address.clone(),
            ctx: self.ctx.clone(),
            clock: self.clock.clone(),
            price_feed: self.price_feed.clone(),
            price_tolerance: self.price_tolerance,
            statistics: self.statistics.clone(),
            message: None,
            temp_peer_node_address: None,
            reserve_tx: None,
            deposit_tx: None,
            payout_tx: None,
            signed_witness: None,
            intercept: self.intercept.clone(),
        }
    }

    fn now_sec(&self) -> i64 {
        self.clock.now_millis() / 1000
    }

    /// Register one of our offers so that a taker's init trade request finds it.
    pub fn place_offer(
        &self,
        offer: Offer,
        account: PaymentAccount,
        reserve_tx: Option<TxHandle>,
    ) -> Res<()> {
        if !offer.is_my_offer(&self.key_ring) {
            return Err(Error::IllegalState(format!("Offer {} is not ours", offer.short_id())));
        }
        if account.payload.payment_method_id != offer.payment_method_id {
            return Err(Error::UnknownAccount(account.id().to_string()));
        }
        let mut offer = offer;
        offer.state = OfferState::Available;
        info!(offer_id = %offer.short_id(), "Offer placed");
        self.open_offers.lock().insert(
            offer.id,
            OpenOffer {
                offer,
                account,
                reserve_tx,
            },
        );
        Ok(())
    }

    /// Withdraw one of our offers. Returns `false` if unknown.
    pub fn remove_offer(&self, offer_id: &OfferId) -> bool {
        self.open_offers.lock().remove(offer_id).is_some()
    }

    pub fn open_offer(&self, offer_id: &OfferId) -> Option<OpenOffer> {
        self.open_offers.lock().get(offer_id).cloned()
    }

    fn set_offer_state(&self, offer_id: &OfferId, state: OfferState) {
        if let Some(open) = self.open_offers.lock().get_mut(offer_id) {
            debug!(
                offer_id = %offer_id.short_id(),
                from = %open.offer.state,
                to = %state,
                "Offer state changed"
            );
            open.offer.state = state;
        }
    }

    /// Take `offer` for `amount` with one of our payment accounts. The trade amount must fit
    /// the offer range and our own trade limit for the account.
    pub fn on_take_offer(
        &self,
        offer: &Offer,
        amount: Amount,
        account: &PaymentAccount,
    ) -> Res<Trade> {
        let filter = &self.services.filter;
        if filter.is_node_address_banned(&offer.owner_node_address)
            || filter.is_currency_banned(&offer.counter_currency_code)
            || filter.is_payment_method_banned(&offer.payment_method_id)
        {
            return Err(Error::Verification(format!("Offer {} is filtered", offer.short_id())));
        }
        if offer.is_my_offer(&self.key_ring) {
            return Err(Error::IllegalState("Cannot take our own offer".into()));
        }
        if account.payload.payment_method_id != offer.payment_method_id
            || !account.supports_currency(&offer.counter_currency_code)
        {
            return Err(Error::UnknownAccount(account.id().to_string()));
        }
        offer.check_amount(amount)?;
        let limit = self.witness_service.get_my_trade_limit(
            account,
            &offer.counter_currency_code,
            offer.mirrored_direction(),
            offer.has_buyer_as_taker_without_deposit(),
        );
        if amount > limit {
            return Err(Error::Verification(format!(
                "Trade amount {} exceeds our trade limit {}",
                amount, limit
            )));
        }
        let market_price = self
            .price_feed
            .as_ref()
            .and_then(|feed| feed.get_market_price(&offer.counter_currency_code));
        let price = offer
            .current_price(market_price.as_ref(), self.now_sec())
            .ok_or(offer::Error::MarketPriceNotAvailable)?;
        let funds = FundsNeeded::new(offer, amount);
        info!(
            offer_id = %offer.short_id(),
            amount = %amount,
            price,
            funds = %funds.total(),
            "Taking offer"
        );

        let mut trade = Trade::new(
            TradeRole::Taker,
            offer.clone(),
            amount,
            price,
            funds.taker_fee,
            self.clock.now_millis(),
        );
        trade.taker.node_address = Some(self.node_address.clone());
        trade.taker.pub_key_ring = Some(*self.key_ring.pub_key_ring());
        trade.taker.payment_account_id = Some(account.id().to_string());
        trade.taker.payment_account_payload_hash = Some(account.payload.hash()?);
        trade.taker.payment_account_payload = Some(account.payload.clone());

        let entry = Arc::new(Mutex::new(TradeContext::new(trade, self.model(offer.id))));
        {
            let mut trades = self.trades.lock();
            if trades.contains_key(&offer.id) {
                return Err(Error::IllegalState(format!(
                    "Trade {} already exists",
                    offer.short_id()
                )));
            }
            trades.insert(offer.id, entry.clone());
        }
        let mut ctx = entry.lock();
        if let Err(e) = TakerProtocol.take_offer(&mut ctx) {
            self.trades.lock().remove(&offer.id);
            return Err(e);
        }
        Ok(ctx.trade.clone())
    }

    /// Route a message received from a peer.
    pub fn handle_message(&self, message: NetworkMessage) -> Res<()> {
        debug!(message = message.kind(), from = %message.sender_node_address(), "Received message");
        match message {
            NetworkMessage::OfferAvailabilityRequest(request) => {
                self.on_availability_request(request)
            }
            NetworkMessage::OfferAvailabilityResponse(response) => {
                match &self.availability {
                    Some(availability) => {
                        availability.on_response(response);
                    }
                    None => debug!("No availability check running, ignoring response"),
                }
                Ok(())
            }
            NetworkMessage::OpenNewDisputeMessage(message) => {
                let trade_id = message.dispute.trade_id;
                self.disputes.on_open_new_dispute_message(message)?;
                self.mark_dispute_opened(&trade_id)
            }
            NetworkMessage::ChatMessage(message) => {
                self.disputes.on_chat_message(message)?;
                Ok(())
            }
            NetworkMessage::DisputeClosedMessage(message) => {
                let trade_id = message.trade_id;
                self.disputes.on_dispute_closed_message(message)?;
                self.mark_dispute_closed(&trade_id)
            }
            message => self.on_trade_message(message),
        }
    }

    fn on_availability_request(&self, request: OfferAvailabilityRequest) -> Res<()> {
        let offer = self.open_offer(&request.offer_id).map(|open| open.offer);
        let market_price = match (&self.price_feed, &offer) {
            (Some(feed), Some(offer)) => feed.get_market_price(&offer.counter_currency_code),
            _ => None,
        };
        let result = evaluate_request(
            offer.as_ref(),
            &request,
            market_price.as_ref(),
            self.now_sec(),
            self.price_tolerance,
            self.services.filter.as_ref(),
        );
        info!(
            offer_id = %request.offer_id.short_id(),
            result = %result,
            "Answering availability request"
        );
        let response = OfferAvailabilityResponse {
            offer_id: request.offer_id,
            sender_node_address: self.node_address.clone(),
            result,
            arbitrator: offer.and_then(|offer| offer.arbitrator_signer),
            uid: request.uid,
        };
        self.services.p2p.send_message(
            &request.sender_node_address,
            NetworkMessage::OfferAvailabilityResponse(response),
        )?;
        Ok(())
    }

    fn on_trade_message(&self, message: NetworkMessage) -> Res<()> {
        let id = message.trade_id();
        if self.closed.lock().contains_key(&id) {
            return Err(Error::TradeAlreadyClosed(id.short_id()));
        }
        let (entry, created) = {
            let mut trades = self.trades.lock();
            match trades.get(&id).cloned() {
                Some(entry) => (entry, false),
                None => {
                    let request = match &message {
                        NetworkMessage::InitTradeRequest(request) => request,
                        _ => return Err(Error::UnknownTrade(id.short_id())),
                    };
                    let entry = Arc::new(Mutex::new(self.new_trade(request)?));
                    trades.insert(id, entry.clone());
                    (entry, true)
                }
            }
        };
        let mut ctx = entry.lock();
        let role = ctx.trade.role;
        let result = protocol_for(role).handle_message(&mut ctx, message);
        if result.is_err() && created {
            warn!(trade_id = %id.short_id(), "Dropping trade which failed its first message");
            self.trades.lock().remove(&id);
            if role == TradeRole::Maker {
                self.set_offer_state(&id, OfferState::Available);
            }
        }
        result
    }

    /// Trade created by the first init trade request: as maker of one of our offers, or as
    /// the arbitrator the offer names.
    fn new_trade(&self, request: &InitTradeRequest) -> Res<TradeContext> {
        let now = self.clock.now_millis();
        let mut open_offers = self.open_offers.lock();
        if let Some(open) = open_offers.get_mut(&request.trade_id) {
            if open.offer.state != OfferState::Available {
                return Err(Error::IllegalState(format!(
                    "Offer {} is {}",
                    open.offer.short_id(),
                    open.offer.state
                )));
            }
            open.offer.state = OfferState::NotAvailable;
            let mut trade = Trade::new(
                TradeRole::Maker,
                open.offer.clone(),
                request.trade_amount,
                request.trade_price,
                request.taker_fee,
                now,
            );
            let maker = &mut trade.maker;
            maker.payment_account_id = Some(open.account.id().to_string());
            maker.payment_account_payload_hash = Some(open.account.payload.hash()?);
            maker.payment_account_payload = Some(open.account.payload.clone());
            maker.payout_address = Some(self.services.wallet.payout_address(&request.trade_id)?);
            if let Some(tx) = &open.reserve_tx {
                maker.reserve_tx_hash = Some(tx.hash.clone());
                maker.reserve_tx_hex = Some(tx.hex.clone());
                maker.reserve_tx_key = Some(tx.key.clone());
                maker.reserve_tx_key_images = tx.key_images.clone();
            }
            let mut model = self.model(request.trade_id);
            model.reserve_tx = open.reserve_tx.clone();
            info!(
                trade_id = %trade.short_id(),
                taker = %request.sender_node_address,
                "New trade as maker"
            );
            return Ok(TradeContext::new(trade, model));
        }
        drop(open_offers);

        if request.offer.arbitrator_signer.as_ref() == Some(&self.node_address) {
            let mut trade = Trade::new(
                TradeRole::Arbitrator,
                request.offer.clone(),
                request.trade_amount,
                request.trade_price,
                request.taker_fee,
                now,
            );
            trade.arbitrator.node_address = Some(self.node_address.clone());
            trade.arbitrator.pub_key_ring = Some(*self.key_ring.pub_key_ring());
            info!(
                trade_id = %trade.short_id(),
                from = %request.sender_node_address,
                "New trade as arbitrator"
            );
            return Ok(TradeContext::new(trade, self.model(request.trade_id)));
        }
        Err(Error::UnknownTrade(request.trade_id.short_id()))
    }

    fn entry(&self, id: &TradeId) -> Res<TradeEntry> {
        if let Some(entry) = self.trades.lock().get(id) {
            return Ok(entry.clone());
        }
        if self.closed.lock().contains_key(id) {
            return Err(Error::TradeAlreadyClosed(id.short_id()));
        }
        Err(Error::UnknownTrade(id.short_id()))
    }

    fn with_trade<T>(
        &self,
        id: &TradeId,
        f: impl FnOnce(&dyn TradeProtocol, &mut TradeContext) -> Res<T>,
    ) -> Res<T> {
        let entry = self.entry(id)?;
        let mut ctx = entry.lock();
        let protocol = protocol_for(ctx.trade.role);
        f(protocol, &mut ctx)
    }

    pub fn on_deposits_confirmed(&self, id: &TradeId) -> Res<()> {
        self.with_trade(id, |protocol, ctx| protocol.on_deposits_confirmed(ctx))
    }

    pub fn on_deposits_unlocked(&self, id: &TradeId) -> Res<()> {
        self.with_trade(id, |protocol, ctx| protocol.on_deposits_unlocked(ctx))
    }

    pub fn on_payment_sent(&self, id: &TradeId) -> Res<()> {
        self.with_trade(id, |protocol, ctx| protocol.on_payment_sent(ctx))
    }

    pub fn on_payment_received(&self, id: &TradeId) -> Res<()> {
        self.with_trade(id, |protocol, ctx| protocol.on_payment_received(ctx))
    }

    /// Complete the trade and move it to the closed trades.
    pub fn on_trade_completed(&self, id: &TradeId) -> Res<()> {
        self.with_trade(id, |protocol, ctx| protocol.on_trade_completed(ctx))?;
        self.close_trade(id)
    }

    /// Move a trade to the closed trades. Refused while a dispute is open. Outputs frozen for
    /// a trade that never published its deposits are released.
    pub fn close_trade(&self, id: &TradeId) -> Res<()> {
        let entry = self.entry(id)?;
        let ctx = entry.lock();
        if ctx.trade.is_dispute_open() || self.disputes.has_open_dispute(id) {
            return Err(Error::IllegalState(format!(
                "Trade {} has an open dispute",
                ctx.trade.short_id()
            )));
        }
        let key_images = &ctx.trade.self_peer().reserve_tx_key_images;
        if !ctx.trade.is_deposits_published() && !key_images.is_empty() {
            if let Err(e) = self.services.wallet.thaw_outputs(key_images) {
                warn!(
                    trade_id = %ctx.trade.short_id(),
                    error = %e,
                    "Could not thaw reserved outputs"
                );
            }
        }
        let record = ctx.trade.seal(&self.ctx)?;
        let persistence = &self.services.persistence;
        persistence.persist_now(&closed_trade_key(id), record)?;
        persistence.remove(&open_trade_key(id))?;
        info!(trade_id = %ctx.trade.short_id(), phase = %ctx.trade.phase, "Trade closed");
        self.closed.lock().insert(*id, ctx.trade.clone());
        drop(ctx);
        self.trades.lock().remove(id);
        if self.open_offers.lock().remove(id).is_some() {
            debug!(offer_id = %id.short_id(), "Offer removed with its trade");
        }
        Ok(())
    }

    /// Open a dispute on one of our trades.
    pub fn open_dispute(&self, id: &TradeId, reason: &str) -> Res<Dispute> {
        let entry = self.entry(id)?;
        let mut ctx = entry.lock();
        let dispute = self.disputes.open_dispute(&ctx.trade, reason)?;
        Self::set_opened(&mut ctx)?;
        ctx.persist()?;
        Ok(dispute)
    }

    /// Arbitrator side: close a dispute with `result`.
    pub fn close_dispute(&self, dispute_id: &str, result: DisputeResult) -> Res<()> {
        let trade_id = result.trade_id;
        self.disputes.close_dispute(dispute_id, result)?;
        self.mark_dispute_closed(&trade_id)
    }

    fn set_opened(ctx: &mut TradeContext) -> Res<()> {
        let next = match ctx.trade.dispute_state {
            TradeDisputeState::NoDispute => TradeDisputeState::DisputeOpened,
            TradeDisputeState::DisputeClosed => TradeDisputeState::DisputeReopened,
            _ => return Ok(()),
        };
        ctx.trade.set_dispute_state(next)
    }

    fn mark_dispute_opened(&self, id: &TradeId) -> Res<()> {
        let entry = match self.trades.lock().get(id) {
            Some(entry) => entry.clone(),
            None => return Ok(()),
        };
        let mut ctx = entry.lock();
        Self::set_opened(&mut ctx)?;
        ctx.persist()
    }

    fn mark_dispute_closed(&self, id: &TradeId) -> Res<()> {
        let entry = match self.trades.lock().get(id) {
            Some(entry) => entry.clone(),
            None => return Ok(()),
        };
        let mut ctx = entry.lock();
        if !ctx.trade.is_dispute_open() || self.disputes.has_open_dispute(id) {
            return Ok(());
        }
        ctx.trade.set_dispute_state(TradeDisputeState::DisputeClosed)?;
        ctx.persist()
    }

    /// Load the persisted trades. Records of another database version are skipped. Returns
    /// the number of open and closed trades restored.
    pub fn restore(&self) -> Res<(usize, usize)> {
        let persistence = &self.services.persistence;
        let mut open = 0;
        for key in persistence.keys(OPEN_TRADE_KEY_PREFIX)? {
            if let Some(trade) = self.read_trade(&key)? {
                let id = trade.id;
                let ctx = TradeContext::new(trade, self.model(id));
                self.trades.lock().insert(id, Arc::new(Mutex::new(ctx)));
                open += 1;
            }
        }
        let mut closed = 0;
        for key in persistence.keys(CLOSED_TRADE_KEY_PREFIX)? {
            if let Some(trade) = self.read_trade(&key)? {
                self.closed.lock().insert(trade.id, trade);
                closed += 1;
            }
        }
        info!(open, closed, "Trades restored");
        Ok((open, closed))
    }

    fn read_trade(&self, key: &str) -> Res<Option<Trade>> {
        let bytes = match self.services.persistence.read_persisted(key)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        match Trade::open(&self.ctx, &bytes) {
            Ok(trade) => Ok(Some(trade)),
            Err(e) => {
                warn!(key, error = %e, "Skipping trade record");
                Ok(None)
            }
        }
    }

    /// An open or closed trade.
    pub fn get_trade(&self, id: &TradeId) -> Option<Trade> {
        if let Some(entry) = self.trades.lock().get(id).cloned() {
            return Some(entry.lock().trade.clone());
        }
        self.closed.lock().get(id).cloned()
    }

    pub fn get_open_trades(&self) -> Vec<Trade> {
        let entries: Vec<TradeEntry> = self.trades.lock().values().cloned().collect();
        entries.iter().map(|entry| entry.lock().trade.clone()).collect()
    }

    pub fn get_closed_trades(&self) -> Vec<Trade> {
        self.closed.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mock::{key, BanAll, Gossip, Memory, MockWallet};
    use crate::network::{Network, TRADE_PROTOCOL_VERSION};
    use crate::offer::OfferDirection;
    use crate::payment::PaymentAccountPayload;
    use crate::protocol::message::PaymentSentMessage;
    use crate::services::NoFilter;
    use crate::trade::tests::offer;
    use crate::trade::TradePhase;
    use crate::witness::signed::SignedWitnessService;

    fn manager(
        me: u8,
        filter: Arc<dyn crate::services::Filter>,
    ) -> (TradeManager, Arc<Gossip>, Arc<Memory>) {
        let gossip = Arc::new(Gossip::default());
        let memory = Arc::new(Memory::default());
        let key_ring = Arc::new(key(me));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_700_000_000_000));
        let services = Services {
            wallet: Arc::new(MockWallet::default()),
            p2p: gossip.clone(),
            persistence: memory.clone(),
            filter: filter.clone(),
        };
        let signed = Arc::new(SignedWitnessService::new(
            key_ring.clone(),
            gossip.clone(),
            filter.clone(),
            clock.clone(),
        ));
        let witness_service = Arc::new(AccountAgeWitnessService::new(
            key_ring.clone(),
            gossip.clone(),
            filter,
            clock.clone(),
            signed,
            16,
        ));
        let node_address = NodeAddress::new(format!("node{}.onion", me), 9999);
        let config = Config {
            network: Network::Local,
            ..Config::default()
        };
        let disputes = Arc::new(DisputeList::new(
            key_ring.clone(),
            node_address.clone(),
            gossip.clone(),
            memory.clone(),
            config.network_context(),
            clock.clone(),
        ));
        (
            TradeManager::new(
                &config,
                key_ring,
                node_address,
                services,
                witness_service,
                disputes,
                clock,
            ),
            gossip,
            memory,
        )
    }

    fn account(id: &str) -> PaymentAccount {
        PaymentAccount::new(
            id,
            vec!["EUR".into()],
            0,
            PaymentAccountPayload::with_salt(id, "SEPA", id.as_bytes().to_vec(), vec![1; 32], None),
        )
    }

    #[test]
    fn filtered_or_own_offers_cannot_be_taken() {
        let (banned, _, _) = manager(2, Arc::new(BanAll));
        let o = offer(OfferDirection::Sell);
        assert!(matches!(
            banned.on_take_offer(&o, o.min_amount, &account("taker")),
            Err(Error::Verification(_))
        ));

        // key 1 owns the offer
        let (own, _, _) = manager(1, Arc::new(NoFilter));
        assert!(matches!(
            own.on_take_offer(&o, o.min_amount, &account("maker")),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn take_offer_within_limits() {
        let (taker, gossip, _) = manager(2, Arc::new(NoFilter));
        let o = offer(OfferDirection::Sell);
        assert!(matches!(
            taker.on_take_offer(&o, Amount::from_pico(1), &account("taker")),
            Err(Error::Offer(_))
        ));
        let trade = taker
            .on_take_offer(&o, o.min_amount, &account("taker"))
            .unwrap();
        assert_eq!(trade.role, TradeRole::Taker);
        assert_eq!(trade.phase, TradePhase::FundsReserved);
        assert_eq!(trade.taker_fee, o.taker_fee(o.min_amount));
        assert_eq!(gossip.messages.lock().len(), 2);
        assert_eq!(taker.get_open_trades().len(), 1);
        assert!(matches!(
            taker.on_take_offer(&o, o.min_amount, &account("taker")),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn messages_for_unknown_trades_are_refused() {
        let (node, _, _) = manager(3, Arc::new(NoFilter));
        let o = offer(OfferDirection::Sell);
        let message = NetworkMessage::PaymentSentMessage(PaymentSentMessage {
            trade_id: o.id,
            sender_node_address: NodeAddress::new("x.onion", 1),
            sender_pub_key_ring: *key(4).pub_key_ring(),
            counter_currency_tx_id: None,
            uid: "1".into(),
        });
        assert!(matches!(node.handle_message(message), Err(Error::UnknownTrade(_))));
        assert!(matches!(node.on_payment_sent(&o.id), Err(Error::UnknownTrade(_))));
    }

    #[test]
    fn availability_request_is_answered() {
        let (maker, gossip, _) = manager(1, Arc::new(NoFilter));
        let o = offer(OfferDirection::Sell);
        maker.place_offer(o.clone(), account("maker"), None).unwrap();
        maker
            .handle_message(NetworkMessage::OfferAvailabilityRequest(OfferAvailabilityRequest {
                offer_id: o.id,
                sender_node_address: NodeAddress::new("taker.onion", 9999),
                takers_trade_price: 150_0000_0000,
                uid: "uid".into(),
            }))
            .unwrap();
        let sent = gossip.messages.lock();
        match &sent[0].1 {
            NetworkMessage::OfferAvailabilityResponse(response) => {
                assert!(response.result.is_available());
                assert_eq!(response.uid, "uid");
                assert_eq!(response.arbitrator, o.arbitrator_signer);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn restore_skips_other_db_versions() {
        let (taker, _, memory) = manager(2, Arc::new(NoFilter));
        let o = offer(OfferDirection::Sell);
        let trade = taker
            .on_take_offer(&o, o.min_amount, &account("taker"))
            .unwrap();
        let newer = NetworkContext::with_versions(Network::Local, "A", 99, TRADE_PROTOCOL_VERSION);
        let mut other = trade.clone();
        other.id = OfferId::random();
        memory
            .records
            .lock()
            .insert(open_trade_key(&other.id), other.seal(&newer).unwrap());

        let (restarted, _, _) = manager(2, Arc::new(NoFilter));
        let restarted = TradeManager {
            services: Services {
                persistence: memory.clone(),
                ..restarted.services.clone()
            },
            ..restarted
        };
        assert_eq!(restarted.restore().unwrap(), (1, 0));
        assert_eq!(restarted.get_trade(&trade.id).unwrap().phase, TradePhase::FundsReserved);
        assert!(restarted.get_trade(&other.id).is_none());
    }

    #[test]
    fn close_trade_is_guarded() {
        let (taker, _, memory) = manager(2, Arc::new(NoFilter));
        let o = offer(OfferDirection::Sell);
        let trade = taker
            .on_take_offer(&o, o.min_amount, &account("taker"))
            .unwrap();
        {
            let entry = taker.entry(&trade.id).unwrap();
            let mut ctx = entry.lock();
            ctx.trade.set_dispute_state(TradeDisputeState::DisputeOpened).unwrap();
        }
        assert!(matches!(taker.close_trade(&trade.id), Err(Error::IllegalState(_))));
        {
            let entry = taker.entry(&trade.id).unwrap();
            let mut ctx = entry.lock();
            ctx.trade.set_dispute_state(TradeDisputeState::DisputeClosed).unwrap();
        }
        taker.close_trade(&trade.id).unwrap();
        assert!(matches!(taker.close_trade(&trade.id), Err(Error::TradeAlreadyClosed(_))));
        assert_eq!(taker.get_closed_trades().len(), 1);
        let records = memory.records.lock();
        assert!(records.contains_key(&closed_trade_key(&trade.id)));
        assert!(!records.contains_key(&open_trade_key(&trade.id)));
    }
}
