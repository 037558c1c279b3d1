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

//! Steps of the trade pipelines. Every task either completes or fails exactly once; tasks that
//! may run again when a message is redelivered are guarded and skip work already done.

use monero::Amount;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::network::NodeAddress;
use crate::price::MarketPrice;
use crate::protocol::message::{
    DepositRequest, DepositResponse, InitTradeRequest, NetworkMessage, PaymentReceivedMessage,
    PaymentSentMessage, SignContractRequest, SignContractResponse,
};
use crate::restrictions::{lock_time, TEST_NETWORK_LOCK_TIME};
use crate::role::{PaymentRole, TradeRole};
use crate::services::{NetworkPayload, ReserveTxCheck, TxHandle, VerifiedTx};
use crate::trade::statistics::TradeStatistics;
use crate::trade::{Contract, TradeContext, TradePhase};
use crate::{trade_task, Error, Res};

/// Clone the message being processed out of the model, failing when it is of another kind.
macro_rules! expect_message {
    ($ctx:ident, $variant:ident) => {
        match $ctx.model.message.as_ref() {
            Some(NetworkMessage::$variant(m)) => m.clone(),
            other => {
                return Err(Error::IllegalState(format!(
                    "Expected {} but processing {:?}",
                    stringify!($variant),
                    other.map(NetworkMessage::kind)
                )))
            }
        }
    };
}

fn required<T: Clone>(value: &Option<T>, what: &str, ctx: &TradeContext) -> Res<T> {
    value.clone().ok_or_else(|| {
        Error::IllegalState(format!("Missing {} for trade {}", what, ctx.trade.short_id()))
    })
}

fn send(ctx: &TradeContext, to: Option<&NodeAddress>, message: NetworkMessage) -> Res<()> {
    let to = to.ok_or_else(|| {
        Error::IllegalState(format!(
            "No address to send {} to for trade {}",
            message.kind(),
            ctx.trade.short_id()
        ))
    })?;
    info!(
        trade_id = %ctx.trade.short_id(),
        to = %to,
        message = message.kind(),
        "Sending message"
    );
    ctx.model.services.p2p.send_message(to, message)?;
    Ok(())
}

fn now_sec(ctx: &TradeContext) -> i64 {
    ctx.model.now_millis() / 1000
}

fn market_price(ctx: &TradeContext) -> Option<MarketPrice> {
    ctx.model
        .price_feed
        .as_ref()
        .and_then(|feed| feed.get_market_price(&ctx.trade.offer.counter_currency_code))
}

/// Signature of the trade nonce, proves we own the key of our account age witness.
fn sign_nonce(ctx: &TradeContext) -> Res<Vec<u8>> {
    Ok(ctx.model.key_ring.sign(&ctx.trade.witness_nonce())?)
}

/// Move forward to `phase` unless the trade is already there or beyond.
fn advance(ctx: &mut TradeContext, phase: TradePhase) -> Res<()> {
    if ctx.trade.phase < phase {
        ctx.trade.set_phase(phase)?;
    }
    Ok(())
}

/// Our reserve transaction, rebuilt from the trade record after a restart.
fn own_reserve_tx(ctx: &TradeContext) -> Option<TxHandle> {
    if let Some(tx) = &ctx.model.reserve_tx {
        return Some(tx.clone());
    }
    let own = ctx.trade.self_peer();
    Some(TxHandle {
        hash: own.reserve_tx_hash.clone()?,
        hex: own.reserve_tx_hex.clone()?,
        key: own.reserve_tx_key.clone()?,
        key_images: own.reserve_tx_key_images.clone(),
        fee: Amount::from_pico(0),
    })
}

/// Role of the sender of the message being processed.
fn sender_role(ctx: &TradeContext) -> Res<TradeRole> {
    let pub_key_ring = ctx
        .model
        .message
        .as_ref()
        .and_then(NetworkMessage::sender_pub_key_ring)
        .ok_or_else(|| Error::IllegalState("Message carries no sender key".into()))?;
    ctx.trade
        .role_of(pub_key_ring)
        .ok_or_else(|| {
            Error::Verification(format!("Unknown sender for trade {}", ctx.trade.short_id()))
        })
}

fn verification(condition: bool, message: impl FnOnce() -> String) -> Res<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::Verification(message()))
    }
}

/// Our init trade request, sent by the taker to both parties and forwarded by the maker to the
/// arbitrator.
fn init_trade_request(ctx: &TradeContext) -> Res<InitTradeRequest> {
    let own = ctx.trade.self_peer();
    let taker = &ctx.trade.taker;
    Ok(InitTradeRequest {
        trade_id: ctx.trade.id,
        sender_node_address: ctx.model.node_address.clone(),
        sender_pub_key_ring: *ctx.model.key_ring.pub_key_ring(),
        sender_role: ctx.trade.role,
        offer: ctx.trade.offer.clone(),
        trade_amount: ctx.trade.amount,
        trade_price: ctx.trade.price,
        taker_fee: ctx.trade.taker_fee,
        taker_node_address: required(&taker.node_address, "taker node address", ctx)?,
        taker_pub_key_ring: required(&taker.pub_key_ring, "taker pub key ring", ctx)?,
        payment_account_id: required(&own.payment_account_id, "payment account id", ctx)?,
        payment_account_payload: required(&own.payment_account_payload, "payment account", ctx)?,
        payout_address: required(&own.payout_address, "payout address", ctx)?,
        reserve_tx_hash: own.reserve_tx_hash.clone(),
        reserve_tx_hex: own.reserve_tx_hex.clone(),
        reserve_tx_key: own.reserve_tx_key.clone(),
        reserve_tx_key_images: own.reserve_tx_key_images.clone(),
        account_age_witness_nonce: ctx.trade.witness_nonce(),
        account_age_witness_signature: sign_nonce(ctx)?,
        current_date: ctx.model.now_millis(),
        protocol_version: ctx.model.ctx.trade_protocol_version(),
        lock_time: ctx.trade.lock_time,
    })
}

trade_task!(
    /// Validate an init trade request and record its sender. The maker receives it from the
    /// taker, the arbitrator from both traders.
    ProcessInitTradeRequest,
    |ctx| {
        let request = expect_message!(ctx, InitTradeRequest);
        ctx.model
            .ctx
            .check_trade_protocol_version(request.protocol_version)?;
        verification(request.trade_id == ctx.trade.id, || {
            format!("Trade id mismatch, expected {} got {}", ctx.trade.id, request.trade_id)
        })?;
        verification(
            !ctx.model
                .services
                .filter
                .is_node_address_banned(&request.sender_node_address),
            || format!("Sender {} is banned", request.sender_node_address),
        )?;
        match (ctx.trade.role, request.sender_role) {
            (TradeRole::Maker, TradeRole::Taker)
            | (TradeRole::Arbitrator, TradeRole::Maker)
            | (TradeRole::Arbitrator, TradeRole::Taker) => {}
            (own, sender) => {
                return Err(Error::RoleMismatch(format!(
                    "{} cannot process an init trade request from the {}",
                    own, sender
                )))
            }
        }
        if ctx.trade.is_arbitrator() {
            verification(
                ctx.trade.offer.arbitrator_signer.as_ref() == Some(&ctx.model.node_address),
                || format!("Offer {} is not signed by this arbitrator", ctx.trade.short_id()),
            )?;
        }
        match request.sender_role {
            TradeRole::Maker => verification(
                request.sender_pub_key_ring == ctx.trade.offer.pub_key_ring,
                || "Maker's pub key ring does not match the offer".into(),
            )?,
            _ => verification(
                request.sender_node_address == request.taker_node_address
                    && request.sender_pub_key_ring == request.taker_pub_key_ring,
                || "Taker's identity does not match the request".into(),
            )?,
        }

        ctx.trade.offer.check_amount(request.trade_amount)?;
        verification(
            request.trade_amount == ctx.trade.amount && request.trade_price == ctx.trade.price,
            || {
                format!(
                    "Trade amount or price mismatch, got {} at {}",
                    request.trade_amount, request.trade_price
                )
            },
        )?;
        verification(
            request.taker_fee == ctx.trade.offer.taker_fee(request.trade_amount),
            || format!("Invalid taker fee {}", request.taker_fee),
        )?;
        verification(
            request.payment_account_payload.payment_method_id == ctx.trade.offer.payment_method_id,
            || {
                format!(
                    "Payment method {} does not match the offer",
                    request.payment_account_payload.payment_method_id
                )
            },
        )?;
        ctx.model
            .witness_service
            .verify_peers_current_date(request.current_date)?;
        if ctx.trade.role == TradeRole::Maker {
            let market = market_price(ctx);
            ctx.trade.offer.verify_trade_price(
                request.trade_price,
                market.as_ref(),
                now_sec(ctx),
                ctx.model.price_tolerance,
            )?;
        }
        if let (TradeRole::Maker, Some(lock_time)) = (request.sender_role, request.lock_time) {
            if !ctx.trade.set_lock_time(lock_time) && ctx.trade.lock_time != Some(lock_time) {
                return Err(Error::Verification(format!(
                    "Maker's lock time {} differs from {:?}",
                    lock_time, ctx.trade.lock_time
                )));
            }
        }

        let payload_hash = request.payment_account_payload.hash()?;
        let taker = &mut ctx.trade.taker;
        if taker.node_address.is_none() {
            taker.node_address = Some(request.taker_node_address.clone());
        }
        if taker.pub_key_ring.is_none() {
            taker.pub_key_ring = Some(request.taker_pub_key_ring);
        }
        let peer = ctx.trade.peer_mut(request.sender_role);
        peer.node_address = Some(request.sender_node_address.clone());
        peer.pub_key_ring = Some(request.sender_pub_key_ring);
        peer.payment_account_id = Some(request.payment_account_id);
        peer.payment_account_payload = Some(request.payment_account_payload);
        peer.payment_account_payload_hash = Some(payload_hash);
        peer.payout_address = Some(request.payout_address);
        peer.reserve_tx_hash = request.reserve_tx_hash;
        peer.reserve_tx_hex = request.reserve_tx_hex;
        peer.reserve_tx_key = request.reserve_tx_key;
        peer.reserve_tx_key_images = request.reserve_tx_key_images;
        peer.account_age_witness_nonce = Some(request.account_age_witness_nonce);
        peer.account_age_witness_signature = Some(request.account_age_witness_signature);
        peer.current_date = Some(request.current_date);
        ctx.model.temp_peer_node_address = Some(request.sender_node_address);
        Ok(())
    }
);

trade_task!(
    /// Verify the account age witness of the sender of the message being processed.
    VerifyPeersAccountAgeWitness,
    |ctx| {
        let role = sender_role(ctx)?;
        if !role.is_trader() {
            return Ok(());
        }
        let peer = ctx.trade.peer(role).clone();
        let payload = match peer.payment_account_payload {
            Some(payload) => payload,
            None => {
                debug!(trade_id = %ctx.trade.short_id(), "Peer's payment account not known yet");
                return Ok(());
            }
        };
        let pub_key_ring = required(&peer.pub_key_ring, "peer pub key ring", ctx)?;
        if ctx
            .model
            .services
            .filter
            .are_peers_payment_account_data_banned(&payload)
        {
            return Err(Error::Verification(
                "Peer's payment account data is banned".into(),
            ));
        }
        let nonce = peer.account_age_witness_nonce.unwrap_or_default();
        verification(nonce == ctx.trade.witness_nonce(), || {
            "Peer signed another nonce than the trade's".into()
        })?;
        let signature = peer.account_age_witness_signature.unwrap_or_default();
        let mut errors = Vec::new();
        if !ctx.model.witness_service.verify_account_age_witness(
            &ctx.trade,
            &payload,
            &pub_key_ring,
            &nonce,
            &signature,
            &mut |e| errors.push(e),
        ) {
            return Err(Error::Verification(format!(
                "Peer's account age witness is invalid: {}",
                errors.join("; ")
            )));
        }
        Ok(())
    }
);

trade_task!(
    /// Lock time of the payout, relative to the chain height when the maker accepts the taker.
    MakerSetLockTime,
    |ctx| {
        if ctx.trade.lock_time.is_some() {
            return Ok(());
        }
        let delay = if ctx.model.ctx.is_test_network() {
            TEST_NETWORK_LOCK_TIME
        } else {
            lock_time(
                ctx.trade
                    .offer
                    .payment_method()
                    .map_or(false, |method| method.is_blockchain()),
            )
        };
        let height = ctx.model.services.wallet.best_chain_height()?;
        ctx.trade.set_lock_time(height + delay);
        info!(trade_id = %ctx.trade.short_id(), height, delay, "Lock time set");
        Ok(())
    }
);

trade_task!(MakerSendInitTradeRequestToArbitrator, |ctx| {
    let request = init_trade_request(ctx)?;
    send(
        ctx,
        ctx.trade.arbitrator.node_address.as_ref(),
        NetworkMessage::InitTradeRequest(request),
    )?;
    advance(ctx, TradePhase::FundsReserved)
});

trade_task!(
    /// Reserve the taker's fee, deposit and, when selling, trade amount. A buyer taking an
    /// offer without deposit reserves nothing.
    TakerReserveTradeFunds,
    |ctx| {
        if ctx.trade.taker.reserve_tx_hash.is_some() {
            debug!(trade_id = %ctx.trade.short_id(), "Reserve tx already created");
            return Ok(());
        }
        let wallet = ctx.model.services.wallet.clone();
        let return_address = match ctx.trade.taker.payout_address.clone() {
            Some(address) => address,
            None => {
                let address = wallet.payout_address(&ctx.trade.id)?;
                ctx.trade.taker.payout_address = Some(address.clone());
                address
            }
        };
        if ctx.trade.has_buyer_as_taker_without_deposit() {
            info!(
                trade_id = %ctx.trade.short_id(),
                "Taking offer without deposit, nothing to reserve"
            );
            return advance(ctx, TradePhase::FundsReserved);
        }
        let (send_amount, deposit) = if ctx.trade.is_seller() {
            (ctx.trade.amount, ctx.trade.seller_security_deposit())
        } else {
            (Amount::from_pico(0), ctx.trade.buyer_security_deposit())
        };
        let tx =
            wallet.create_reserve_tx(ctx.trade.taker_fee, send_amount, deposit, &return_address)?;
        info!(trade_id = %ctx.trade.short_id(), tx = %tx.hash, "Trade funds reserved");
        let taker = &mut ctx.trade.taker;
        taker.reserve_tx_hash = Some(tx.hash.clone());
        taker.reserve_tx_hex = Some(tx.hex.clone());
        taker.reserve_tx_key = Some(tx.key.clone());
        taker.reserve_tx_key_images = tx.key_images.clone();
        ctx.model.reserve_tx = Some(tx);
        advance(ctx, TradePhase::FundsReserved)
    }
);

trade_task!(TakerSendInitTradeRequests, |ctx| {
    let request = init_trade_request(ctx)?;
    send(
        ctx,
        Some(&ctx.trade.offer.owner_node_address),
        NetworkMessage::InitTradeRequest(request.clone()),
    )?;
    send(
        ctx,
        ctx.trade.arbitrator.node_address.as_ref(),
        NetworkMessage::InitTradeRequest(request),
    )
});

fn verify_reserve_tx(
    ctx: &TradeContext,
    request: &InitTradeRequest,
    is_maker: bool,
    is_buyer: bool,
) -> Res<(VerifiedTx, Amount)> {
    let trade = &ctx.trade;
    let offer = &trade.offer;
    let security_deposit = match (is_maker, is_buyer) {
        (true, true) => offer.max_buyer_security_deposit(),
        (true, false) => offer.max_seller_security_deposit(),
        (false, true) => trade.buyer_security_deposit(),
        (false, false) => trade.seller_security_deposit(),
    };
    let trade_fee = if is_maker {
        offer.max_maker_fee()
    } else {
        trade.taker_fee
    };
    let send_amount = match (is_buyer, is_maker) {
        (true, _) => Amount::from_pico(0),
        (false, true) => offer.amount,
        (false, false) => trade.amount,
    };
    let missing = || Error::Verification("Missing reserve tx".into());
    let check = ReserveTxCheck {
        offer_id: trade.id,
        penalty_fee: offer.penalty_fee_pct.apply(security_deposit),
        trade_fee,
        send_amount,
        security_deposit,
        payout_address: request.payout_address.clone(),
        tx_hash: request.reserve_tx_hash.clone().ok_or_else(missing)?,
        tx_hex: request.reserve_tx_hex.clone().ok_or_else(missing)?,
        tx_key: request.reserve_tx_key.clone().ok_or_else(missing)?,
        key_images: request.reserve_tx_key_images.clone(),
    };
    let verified = ctx.model.services.wallet.verify_reserve_tx(&check)?;
    if verified.fee == Amount::from_pico(0) {
        return Err(Error::IllegalState(format!(
            "Reserve transaction from {} has 0 fee for trade {}. This should never happen.",
            if is_maker { "maker" } else { "taker" },
            trade.id
        )));
    }
    Ok((verified, security_deposit))
}

trade_task!(
    /// Verify the reserve transaction of the sender of an init trade request.
    ArbitratorProcessReserveTx,
    |ctx| {
        let request = expect_message!(ctx, InitTradeRequest);
        let role = request.sender_role;
        let is_maker = role == TradeRole::Maker;
        let is_buyer = role.payment_role(ctx.trade.offer.direction) == Some(PaymentRole::Buyer);
        if !is_maker && is_buyer && ctx.trade.has_buyer_as_taker_without_deposit() {
            info!(
                trade_id = %ctx.trade.short_id(),
                "Buyer takes without deposit, no reserve tx to verify"
            );
            ctx.trade.taker.security_deposit = Some(Amount::from_pico(0));
            return Ok(());
        }
        let (verified, security_deposit) = verify_reserve_tx(ctx, &request, is_maker, is_buyer)
            .map_err(|e| {
                Error::Verification(format!(
                    "Error processing reserve tx from {} {}, offerId={}: {}",
                    if is_maker { "maker" } else { "taker" },
                    request.sender_node_address,
                    ctx.trade.id,
                    e
                ))
            })?;
        info!(
            trade_id = %ctx.trade.short_id(),
            role = %role,
            tx = %verified.hash,
            fee = %verified.fee,
            "Reserve tx verified"
        );
        let peer = ctx.trade.peer_mut(role);
        peer.security_deposit = Some(Amount::from_pico(
            security_deposit
                .as_pico()
                .saturating_sub(verified.fee.as_pico()),
        ));
        peer.reserve_tx_hash = Some(verified.hash);
        peer.reserve_tx_key_images = verified.key_images;
        Ok(())
    }
);

trade_task!(
    /// Send the contract to both traders once both reserve transactions are verified.
    ArbitratorSendSignContractRequests,
    |ctx| {
        if ctx.trade.contract.is_some() {
            return Ok(());
        }
        if ctx.trade.maker.security_deposit.is_none()
            || ctx.trade.taker.security_deposit.is_none()
        {
            debug!(trade_id = %ctx.trade.short_id(), "Waiting for the other init trade request");
            return Ok(());
        }
        let contract = Contract::from_trade(&ctx.trade)?;
        ctx.trade.contract_hash = Some(contract.hash()?);
        ctx.trade.contract = Some(contract.clone());
        advance(ctx, TradePhase::FundsReserved)?;
        for role in [TradeRole::Maker, TradeRole::Taker] {
            let request = SignContractRequest {
                trade_id: ctx.trade.id,
                sender_node_address: ctx.model.node_address.clone(),
                sender_pub_key_ring: *ctx.model.key_ring.pub_key_ring(),
                contract: contract.clone(),
                current_date: ctx.model.now_millis(),
            };
            send(
                ctx,
                ctx.trade.peer(role).node_address.as_ref(),
                NetworkMessage::SignContractRequest(request),
            )?;
        }
        Ok(())
    }
);

trade_task!(
    /// Check the arbitrator's contract against our view of the trade and sign it.
    ProcessSignContractRequest,
    |ctx| {
        let request = expect_message!(ctx, SignContractRequest);
        verification(
            ctx.trade.arbitrator.node_address.as_ref() == Some(&request.sender_node_address),
            || {
                format!(
                    "Sign contract request from {} which is not the arbitrator",
                    request.sender_node_address
                )
            },
        )?;
        match ctx.trade.arbitrator.pub_key_ring {
            Some(known) => verification(known == request.sender_pub_key_ring, || {
                "Arbitrator's pub key ring changed".into()
            })?,
            None => ctx.trade.arbitrator.pub_key_ring = Some(request.sender_pub_key_ring),
        }

        let contract = request.contract;
        let trade = &ctx.trade;
        verification(
            contract.offer_id == trade.id
                && contract.trade_amount == trade.amount
                && contract.trade_price == trade.price
                && contract.payment_method_id == trade.offer.payment_method_id
                && contract.counter_currency_code == trade.offer.counter_currency_code
                && contract.is_buyer_maker_and_seller_taker == trade.is_buyer_maker()
                && contract.maker_pub_key_ring == trade.offer.pub_key_ring,
            || format!("Contract does not match trade {}", trade.short_id()),
        )?;
        let own = trade.self_peer();
        let own_hash = match own.payment_account_payload_hash {
            Some(hash) => hash,
            None => required(&own.payment_account_payload, "payment account", ctx)?.hash()?,
        };
        let is_maker = trade.role == TradeRole::Maker;
        let (own_pub_key_ring, own_account_id, own_payout_address, own_payload_hash) = if is_maker {
            (
                &contract.maker_pub_key_ring,
                &contract.maker_account_id,
                &contract.maker_payout_address,
                &contract.maker_payment_account_payload_hash,
            )
        } else {
            (
                &contract.taker_pub_key_ring,
                &contract.taker_account_id,
                &contract.taker_payout_address,
                &contract.taker_payment_account_payload_hash,
            )
        };
        verification(
            own_pub_key_ring == ctx.model.key_ring.pub_key_ring()
                && Some(own_account_id) == own.payment_account_id.as_ref()
                && Some(own_payout_address) == own.payout_address.as_ref()
                && own_payload_hash == &own_hash,
            || "Contract does not match our own account".into(),
        )?;
        match ctx.trade.lock_time {
            Some(lock_time) => verification(lock_time == contract.lock_time, || {
                format!("Contract lock time {} differs from {}", contract.lock_time, lock_time)
            })?,
            None => {
                ctx.trade.set_lock_time(contract.lock_time);
            }
        }
        ctx.model
            .witness_service
            .verify_peers_current_date(request.current_date)?;

        let (node_address, pub_key_ring, account_id, payload_hash, payout_address) = if is_maker {
            (
                contract.taker_node_address.clone(),
                contract.taker_pub_key_ring,
                contract.taker_account_id.clone(),
                contract.taker_payment_account_payload_hash,
                contract.taker_payout_address.clone(),
            )
        } else {
            (
                contract.maker_node_address.clone(),
                contract.maker_pub_key_ring,
                contract.maker_account_id.clone(),
                contract.maker_payment_account_payload_hash,
                contract.maker_payout_address.clone(),
            )
        };
        let peer_role = if is_maker { TradeRole::Taker } else { TradeRole::Maker };
        let peer = ctx.trade.peer_mut(peer_role);
        if let Some(known) = &peer.pub_key_ring {
            if known != &pub_key_ring {
                return Err(Error::Verification("Contract names another peer".into()));
            }
        }
        peer.node_address = Some(node_address);
        peer.pub_key_ring = Some(pub_key_ring);
        peer.payment_account_id = Some(account_id);
        peer.payment_account_payload_hash = Some(payload_hash);
        peer.payout_address = Some(payout_address);

        let hash = contract.hash()?;
        let signature = ctx.model.key_ring.sign(&hash)?;
        let own = ctx.trade.self_peer_mut();
        own.payment_account_payload_hash = Some(own_hash);
        own.contract_signature = Some(signature);
        ctx.trade.contract = Some(contract);
        ctx.trade.contract_hash = Some(hash);
        ctx.model.temp_peer_node_address = Some(request.sender_node_address);
        info!(trade_id = %ctx.trade.short_id(), "Contract signed");
        Ok(())
    }
);

trade_task!(TraderCreateDepositTx, |ctx| {
    if ctx.trade.self_peer().deposit_tx_hash.is_some() {
        return Ok(());
    }
    let reserve_tx = match own_reserve_tx(ctx) {
        Some(tx) => tx,
        None => {
            debug!(trade_id = %ctx.trade.short_id(), "No reserve tx, no deposit tx to create");
            return Ok(());
        }
    };
    let tx = ctx
        .model
        .services
        .wallet
        .create_deposit_tx(&ctx.trade.id, &reserve_tx)?;
    let own = ctx.trade.self_peer_mut();
    own.deposit_tx_hash = Some(tx.hash.clone());
    own.deposit_tx_hex = Some(tx.hex.clone());
    ctx.model.deposit_tx = Some(tx);
    Ok(())
});

trade_task!(
    /// Send our contract signature and reveal our payment account to the peer.
    TraderSendSignContractResponse,
    |ctx| {
        let own = ctx.trade.self_peer();
        let response = SignContractResponse {
            trade_id: ctx.trade.id,
            sender_node_address: ctx.model.node_address.clone(),
            sender_pub_key_ring: *ctx.model.key_ring.pub_key_ring(),
            contract_signature: required(&own.contract_signature, "contract signature", ctx)?,
            payment_account_payload: required(
                &own.payment_account_payload,
                "payment account",
                ctx,
            )?,
            account_age_witness_nonce: ctx.trade.witness_nonce(),
            account_age_witness_signature: sign_nonce(ctx)?,
            current_date: ctx.model.now_millis(),
        };
        send(
            ctx,
            ctx.trade.trade_peer().and_then(|p| p.node_address.as_ref()),
            NetworkMessage::SignContractResponse(response),
        )
    }
);

trade_task!(ProcessSignContractResponse, |ctx| {
    let response = expect_message!(ctx, SignContractResponse);
    let peer_role = ctx
        .trade
        .trade_peer_role()
        .ok_or_else(|| {
            Error::RoleMismatch("The arbitrator receives no sign contract response".into())
        })?;
    verification(
        ctx.trade.peer(peer_role).pub_key_ring == Some(response.sender_pub_key_ring),
        || "Sign contract response from an unexpected sender".into(),
    )?;
    ctx.model
        .witness_service
        .verify_peers_current_date(response.current_date)?;
    let peer = ctx.trade.peer_mut(peer_role);
    peer.contract_signature = Some(response.contract_signature);
    peer.payment_account_payload = Some(response.payment_account_payload);
    peer.account_age_witness_nonce = Some(response.account_age_witness_nonce);
    peer.account_age_witness_signature = Some(response.account_age_witness_signature);
    peer.current_date = Some(response.current_date);
    if peer.node_address.is_none() {
        peer.node_address = Some(response.sender_node_address.clone());
    }
    ctx.model.temp_peer_node_address = Some(response.sender_node_address);
    Ok(())
});

trade_task!(
    /// Check the peer's contract signature and payment account against the contract once both
    /// are known.
    VerifyPeersContract,
    |ctx| {
        let (contract, hash) = match (&ctx.trade.contract, ctx.trade.contract_hash) {
            (Some(contract), Some(hash)) => (contract, hash),
            _ => return Ok(()),
        };
        let peer_role = match ctx.trade.trade_peer_role() {
            Some(role) => role,
            None => return Ok(()),
        };
        let peer = ctx.trade.peer(peer_role);
        let signature = match &peer.contract_signature {
            Some(signature) => signature,
            None => return Ok(()),
        };
        let pub_key_ring = required(&peer.pub_key_ring, "peer pub key ring", ctx)?;
        pub_key_ring
            .verify(&hash, signature)
            .map_err(|e| {
                Error::Verification(format!("Peer's contract signature is invalid: {}", e))
            })?;
        if let Some(payload) = &peer.payment_account_payload {
            let expected = match peer_role {
                TradeRole::Maker => contract.maker_payment_account_payload_hash,
                _ => contract.taker_payment_account_payload_hash,
            };
            verification(payload.hash()? == expected, || {
                "Peer's payment account does not match the contract".into()
            })?;
        }
        Ok(())
    }
);

trade_task!(
    /// Hand our deposit to the arbitrator once both traders signed the contract.
    TraderSendDepositRequest,
    |ctx| {
        if ctx.trade.phase >= TradePhase::ContractSigned {
            return Ok(());
        }
        let own = ctx.trade.self_peer().clone();
        let signed = own.contract_signature.is_some()
            && ctx
                .trade
                .trade_peer()
                .map_or(false, |p| p.contract_signature.is_some());
        if !signed {
            debug!(trade_id = %ctx.trade.short_id(), "Waiting for both contract signatures");
            return Ok(());
        }
        ctx.trade.set_phase(TradePhase::ContractSigned)?;
        let request = DepositRequest {
            trade_id: ctx.trade.id,
            sender_node_address: ctx.model.node_address.clone(),
            sender_pub_key_ring: *ctx.model.key_ring.pub_key_ring(),
            contract_signature: required(&own.contract_signature, "contract signature", ctx)?,
            deposit_tx_hash: own.deposit_tx_hash,
            deposit_tx_hex: own.deposit_tx_hex,
            current_date: ctx.model.now_millis(),
        };
        send(
            ctx,
            ctx.trade.arbitrator.node_address.as_ref(),
            NetworkMessage::DepositRequest(request),
        )
    }
);

trade_task!(ArbitratorProcessDepositRequest, |ctx| {
    let request = expect_message!(ctx, DepositRequest);
    let role = ctx
        .trade
        .role_of(&request.sender_pub_key_ring)
        .filter(TradeRole::is_trader)
        .ok_or_else(|| Error::Verification("Deposit request from an unknown sender".into()))?;
    let hash = required(&ctx.trade.contract_hash, "contract", ctx)?;
    request
        .sender_pub_key_ring
        .verify(&hash, &request.contract_signature)
        .map_err(|e| {
            Error::Verification(format!(
                "Contract signature of the {} is invalid: {}",
                role, e
            ))
        })?;
    ctx.model
        .witness_service
        .verify_peers_current_date(request.current_date)?;
    let without_deposit =
        role == TradeRole::Taker && ctx.trade.has_buyer_as_taker_without_deposit();
    if request.deposit_tx_hex.is_none() && !without_deposit {
        return Err(Error::Verification(format!("Missing deposit tx from the {}", role)));
    }
    let peer = ctx.trade.peer_mut(role);
    peer.contract_signature = Some(request.contract_signature);
    peer.deposit_tx_hash = request.deposit_tx_hash;
    peer.deposit_tx_hex = request.deposit_tx_hex;
    ctx.model.temp_peer_node_address = Some(request.sender_node_address);
    Ok(())
});

trade_task!(
    /// Publish both deposits once both deposit requests arrived and tell the traders the
    /// outcome, failure included.
    ArbitratorPublishDepositTxs,
    |ctx| {
        if ctx.trade.is_deposits_published() {
            return Ok(());
        }
        if ctx.trade.maker.contract_signature.is_none()
            || ctx.trade.taker.contract_signature.is_none()
        {
            debug!(trade_id = %ctx.trade.short_id(), "Waiting for the other deposit request");
            return Ok(());
        }
        let hexes: Vec<String> = [&ctx.trade.maker.deposit_tx_hex, &ctx.trade.taker.deposit_tx_hex]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        let result = ctx.model.services.wallet.publish_deposit_txs(&hexes);
        let error_message = result.as_ref().err().map(|e| e.to_string());
        for role in [TradeRole::Maker, TradeRole::Taker] {
            let response = DepositResponse {
                trade_id: ctx.trade.id,
                sender_node_address: ctx.model.node_address.clone(),
                sender_pub_key_ring: *ctx.model.key_ring.pub_key_ring(),
                maker_deposit_tx_hash: ctx.trade.maker.deposit_tx_hash.clone(),
                taker_deposit_tx_hash: ctx.trade.taker.deposit_tx_hash.clone(),
                error_message: error_message.clone(),
            };
            send(
                ctx,
                ctx.trade.peer(role).node_address.as_ref(),
                NetworkMessage::DepositResponse(response),
            )?;
        }
        result?;
        info!(trade_id = %ctx.trade.short_id(), "Deposit txs published");
        advance(ctx, TradePhase::DepositsPublished)
    }
);

trade_task!(ProcessDepositResponse, |ctx| {
    let response = expect_message!(ctx, DepositResponse);
    verification(
        ctx.trade.arbitrator.pub_key_ring == Some(response.sender_pub_key_ring),
        || "Deposit response must come from the arbitrator".into(),
    )?;
    if let Some(error) = response.error_message {
        return Err(Error::Verification(format!(
            "Arbitrator could not publish the deposit txs: {}",
            error
        )));
    }
    if let Some(hash) = response.maker_deposit_tx_hash {
        ctx.trade.maker.deposit_tx_hash = Some(hash);
    }
    if let Some(hash) = response.taker_deposit_tx_hash {
        ctx.trade.taker.deposit_tx_hash = Some(hash);
    }
    advance(ctx, TradePhase::DepositsPublished)
});

trade_task!(
    /// The maker publishes the statistics of its trade once the deposits are published.
    MaybePublishTradeStatistics,
    |ctx| {
        if ctx.trade.role != TradeRole::Maker {
            return Ok(());
        }
        let statistics = match TradeStatistics::from_trade(&ctx.trade) {
            Some(statistics) => statistics,
            None => {
                debug!(
                    trade_id = %ctx.trade.short_id(),
                    "No statistics for trade without both deposits"
                );
                return Ok(());
            }
        };
        if ctx.model.statistics.add(statistics.clone())? {
            ctx.model
                .services
                .p2p
                .add_persistable_network_payload(
                    NetworkPayload::TradeStatistics(statistics),
                    false,
                )?;
            info!(trade_id = %ctx.trade.short_id(), "Trade statistics published");
        }
        Ok(())
    }
);

fn require_deposits_published(ctx: &TradeContext) -> Res<()> {
    if !ctx.trade.is_deposits_published() {
        return Err(Error::IllegalState(format!(
            "Deposits of trade {} are not published",
            ctx.trade.short_id()
        )));
    }
    Ok(())
}

trade_task!(SetDepositsConfirmed, |ctx| {
    require_deposits_published(ctx)?;
    advance(ctx, TradePhase::DepositsConfirmed)
});

trade_task!(SetDepositsUnlocked, |ctx| {
    require_deposits_published(ctx)?;
    advance(ctx, TradePhase::DepositsUnlocked)
});

trade_task!(BuyerSendPaymentSentMessage, |ctx| {
    if !ctx.trade.is_buyer() {
        return Err(Error::RoleMismatch("Only the buyer sends the payment".into()));
    }
    if ctx.trade.phase < TradePhase::DepositsUnlocked {
        return Err(Error::IllegalState(format!(
            "Deposits of trade {} are not unlocked",
            ctx.trade.short_id()
        )));
    }
    advance(ctx, TradePhase::PaymentSent)?;
    let message = PaymentSentMessage {
        trade_id: ctx.trade.id,
        sender_node_address: ctx.model.node_address.clone(),
        sender_pub_key_ring: *ctx.model.key_ring.pub_key_ring(),
        counter_currency_tx_id: None,
        uid: Uuid::new_v4().to_string(),
    };
    send(
        ctx,
        ctx.trade.seller().node_address.as_ref(),
        NetworkMessage::PaymentSentMessage(message.clone()),
    )?;
    send(
        ctx,
        ctx.trade.arbitrator.node_address.as_ref(),
        NetworkMessage::PaymentSentMessage(message),
    )
});

trade_task!(ProcessPaymentSentMessage, |ctx| {
    let message = expect_message!(ctx, PaymentSentMessage);
    verification(
        ctx.trade.buyer().pub_key_ring == Some(message.sender_pub_key_ring),
        || "Payment sent message must come from the buyer".into(),
    )?;
    require_deposits_published(ctx)?;
    ctx.model.temp_peer_node_address = Some(message.sender_node_address);
    advance(ctx, TradePhase::PaymentSent)
});

trade_task!(SellerPreparePaymentReceived, |ctx| {
    if !ctx.trade.is_seller() {
        return Err(Error::RoleMismatch("Only the seller confirms the payment".into()));
    }
    if ctx.trade.phase < TradePhase::DepositsUnlocked {
        return Err(Error::IllegalState(format!(
            "Deposits of trade {} are not unlocked",
            ctx.trade.short_id()
        )));
    }
    advance(ctx, TradePhase::PaymentReceived)
});

trade_task!(
    /// The buyer receives the trade amount and its deposit, the seller its deposit.
    SellerSignAndPublishPayoutTx,
    |ctx| {
        if ctx.trade.payout_tx_hash.is_some() {
            return Ok(());
        }
        let contract = required(&ctx.trade.contract, "contract", ctx)?;
        let buyer_payout = Amount::from_pico(
            ctx.trade.amount.as_pico() + ctx.trade.buyer_security_deposit().as_pico(),
        );
        let seller_payout = ctx.trade.seller_security_deposit();
        let wallet = ctx.model.services.wallet.clone();
        let payout_tx = wallet.create_payout_tx(
            &ctx.trade.id,
            contract.buyer_payout_address(),
            buyer_payout,
            contract.seller_payout_address(),
            seller_payout,
        )?;
        let hash = wallet.sign_and_publish_payout_tx(&payout_tx)?;
        info!(trade_id = %ctx.trade.short_id(), tx = %hash, "Payout tx published");
        ctx.model.payout_tx = Some(payout_tx);
        ctx.trade.payout_tx_hash = Some(hash);
        advance(ctx, TradePhase::PayoutPublished)
    }
);

trade_task!(
    /// Sign the buyer's account age witness when this trade qualifies. Failing to sign never
    /// fails the trade.
    SellerMaybeSignPeersWitness,
    |ctx| {
        if !ctx.model.witness_service.is_sign_witness_trade(&ctx.trade) {
            return Ok(());
        }
        match ctx
            .model
            .witness_service
            .trader_sign_and_publish_peers_account_age_witness(&ctx.trade)
        {
            Ok(signed_witness) => ctx.model.signed_witness = signed_witness,
            Err(e) => {
                warn!(trade_id = %ctx.trade.short_id(), error = %e, "Could not sign peer's witness")
            }
        }
        Ok(())
    }
);

trade_task!(SellerSendPaymentReceivedMessage, |ctx| {
    let message = PaymentReceivedMessage {
        trade_id: ctx.trade.id,
        sender_node_address: ctx.model.node_address.clone(),
        sender_pub_key_ring: *ctx.model.key_ring.pub_key_ring(),
        payout_tx_hash: required(&ctx.trade.payout_tx_hash, "payout tx", ctx)?,
        signed_witness: ctx.model.signed_witness.clone(),
        uid: Uuid::new_v4().to_string(),
    };
    send(
        ctx,
        ctx.trade.buyer().node_address.as_ref(),
        NetworkMessage::PaymentReceivedMessage(message.clone()),
    )?;
    send(
        ctx,
        ctx.trade.arbitrator.node_address.as_ref(),
        NetworkMessage::PaymentReceivedMessage(message),
    )
});

trade_task!(ProcessPaymentReceivedMessage, |ctx| {
    let message = expect_message!(ctx, PaymentReceivedMessage);
    verification(
        ctx.trade.seller().pub_key_ring == Some(message.sender_pub_key_ring),
        || "Payment received message must come from the seller".into(),
    )?;
    require_deposits_published(ctx)?;
    ctx.trade.payout_tx_hash = Some(message.payout_tx_hash);
    advance(ctx, TradePhase::PayoutPublished)?;
    if ctx.trade.is_buyer() {
        if let Some(signed_witness) = message.signed_witness {
            if let Err(e) = ctx
                .model
                .witness_service
                .publish_own_signed_witness(signed_witness)
            {
                warn!(
                    trade_id = %ctx.trade.short_id(),
                    error = %e,
                    "Could not publish own signed witness"
                );
            }
        }
    }
    ctx.model.temp_peer_node_address = Some(message.sender_node_address);
    Ok(())
});

trade_task!(CompleteTrade, |ctx| {
    if !ctx.trade.is_payout_published() {
        return Err(Error::IllegalState(format!(
            "Payout of trade {} is not published",
            ctx.trade.short_id()
        )));
    }
    advance(ctx, TradePhase::Completed)
});

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use crate::mock::{key, MockWallet};
    use crate::network::{Network, NetworkContext, TRADE_PROTOCOL_VERSION};
    use crate::offer::OfferDirection;
    use crate::payment::{PaymentAccountPayload, SEPA};
    use crate::protocol::tests::context;
    use crate::restrictions::Ppm;
    use crate::task::Task;

    fn with_wallet(ctx: &mut TradeContext) -> Arc<MockWallet> {
        let wallet = Arc::new(MockWallet::default());
        ctx.model.services.wallet = wallet.clone();
        wallet
    }

    fn init_request(ctx: &TradeContext, sender_role: TradeRole, funded: bool) -> InitTradeRequest {
        let reserve = |what: &str| funded.then(|| format!("reserve-{}", what));
        InitTradeRequest {
            trade_id: ctx.trade.id,
            sender_node_address: NodeAddress::new("sender.onion", 9999),
            sender_pub_key_ring: *key(1).pub_key_ring(),
            sender_role,
            offer: ctx.trade.offer.clone(),
            trade_amount: ctx.trade.amount,
            trade_price: ctx.trade.price,
            taker_fee: ctx.trade.taker_fee,
            taker_node_address: NodeAddress::new("taker.onion", 9999),
            taker_pub_key_ring: *key(3).pub_key_ring(),
            payment_account_id: "account".into(),
            payment_account_payload: PaymentAccountPayload::with_salt(
                "account",
                SEPA.id,
                b"IBAN".to_vec(),
                vec![7; 32],
                Some("Alice".into()),
            ),
            payout_address: "payout".into(),
            reserve_tx_hash: reserve("hash"),
            reserve_tx_hex: reserve("hex"),
            reserve_tx_key: reserve("key"),
            reserve_tx_key_images: if funded { vec!["image".into()] } else { vec![] },
            account_age_witness_nonce: ctx.trade.witness_nonce(),
            account_age_witness_signature: vec![],
            current_date: 1_700_000_000_000,
            protocol_version: TRADE_PROTOCOL_VERSION,
            lock_time: None,
        }
    }

    fn receive(ctx: &mut TradeContext, sender_role: TradeRole, funded: bool) {
        let request = init_request(ctx, sender_role, funded);
        ctx.model.message = Some(NetworkMessage::InitTradeRequest(request));
    }

    #[test]
    fn reserve_tx_deposit_excludes_mining_fee() {
        // the maker of a sell offer is the seller
        let (mut ctx, _, _) = context(TradeRole::Arbitrator, OfferDirection::Sell);
        let wallet = with_wallet(&mut ctx);
        wallet.reserve_fee.store(2_500, Ordering::SeqCst);
        receive(&mut ctx, TradeRole::Maker, true);

        ArbitratorProcessReserveTx.run(&mut ctx).unwrap();
        let deposit = ctx.trade.offer.max_seller_security_deposit().as_pico();
        assert_eq!(
            ctx.trade.maker.security_deposit,
            Some(Amount::from_pico(deposit - 2_500))
        );
        assert_eq!(ctx.trade.maker.reserve_tx_hash.as_deref(), Some("reserve-hash"));
        assert_eq!(ctx.trade.maker.reserve_tx_key_images, vec!["image".to_string()]);
        assert!(ctx.trade.taker.security_deposit.is_none());
    }

    #[test]
    fn reserve_tx_without_fee_is_refused() {
        let (mut ctx, _, _) = context(TradeRole::Arbitrator, OfferDirection::Sell);
        let wallet = with_wallet(&mut ctx);
        wallet.reserve_fee.store(0, Ordering::SeqCst);
        receive(&mut ctx, TradeRole::Taker, true);

        match ArbitratorProcessReserveTx.run(&mut ctx) {
            Err(Error::Verification(message)) => {
                assert!(message.starts_with("Error processing reserve tx from taker sender.onion"));
                assert!(message.contains(&format!("offerId={}", ctx.trade.id)));
                assert!(message.contains("has 0 fee"));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(ctx.trade.taker.security_deposit.is_none());
        assert!(ctx.trade.taker.reserve_tx_hash.is_none());
    }

    #[test]
    fn buyer_taking_without_deposit_has_no_reserve_tx() {
        let (mut ctx, _, _) = context(TradeRole::Arbitrator, OfferDirection::Sell);
        ctx.trade.offer.buyer_security_deposit_pct = Ppm(0);
        let wallet = with_wallet(&mut ctx);
        // verifying would fail, the task must not get there
        wallet.reserve_fee.store(0, Ordering::SeqCst);
        receive(&mut ctx, TradeRole::Taker, false);

        ArbitratorProcessReserveTx.run(&mut ctx).unwrap();
        assert_eq!(ctx.trade.taker.security_deposit, Some(Amount::from_pico(0)));
        assert!(ctx.trade.taker.reserve_tx_hash.is_none());

        // the seller still needs a reserve tx
        receive(&mut ctx, TradeRole::Maker, false);
        match ArbitratorProcessReserveTx.run(&mut ctx) {
            Err(Error::Verification(message)) => {
                assert!(message.starts_with("Error processing reserve tx from maker"));
                assert!(message.ends_with("Missing reserve tx"));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn taker_with_deposit_must_send_reserve_tx() {
        let (mut ctx, _, _) = context(TradeRole::Arbitrator, OfferDirection::Sell);
        with_wallet(&mut ctx);
        receive(&mut ctx, TradeRole::Taker, false);
        assert!(matches!(
            ArbitratorProcessReserveTx.run(&mut ctx),
            Err(Error::Verification(_))
        ));
        assert!(ctx.trade.taker.security_deposit.is_none());
    }

    #[test]
    fn lock_time_is_set_once() {
        let (mut ctx, _, _) = context(TradeRole::Maker, OfferDirection::Sell);
        let wallet = with_wallet(&mut ctx);
        MakerSetLockTime.run(&mut ctx).unwrap();
        assert_eq!(ctx.trade.lock_time, Some(1_000 + TEST_NETWORK_LOCK_TIME));

        // a redelivered request must not move the lock time
        wallet.height.store(2_000, Ordering::SeqCst);
        MakerSetLockTime.run(&mut ctx).unwrap();
        assert_eq!(ctx.trade.lock_time, Some(1_000 + TEST_NETWORK_LOCK_TIME));
    }

    #[test]
    fn mainnet_lock_time_follows_payment_method() {
        let (mut ctx, _, _) = context(TradeRole::Maker, OfferDirection::Buy);
        ctx.model.ctx = NetworkContext::new(Network::Mainnet);
        with_wallet(&mut ctx);
        MakerSetLockTime.run(&mut ctx).unwrap();
        assert_eq!(ctx.trade.lock_time, Some(1_000 + lock_time(false)));
    }
}
