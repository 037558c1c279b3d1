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

//! Account age witness service: witness lookup and publication, account and signing ages, trade
//! limits derived from them, verification of a peer's witness during the trade protocol and the
//! signing entry points.
//!
//! ## Trade limits
//!
//! Cryptocurrency trades, payment methods without chargeback risk and sellers always get the
//! payment method's maximum limit. Buyers paying with a reversible method are limited by the age
//! of their first verified signature:
//!
//! | signing age      | limit                          |
//! |------------------|--------------------------------|
//! | unsigned, < 30d  | tolerated small trade amount   |
//! | 30d to 60d       | half of the maximum            |
//! | 60d or more      | maximum                        |
//!
//! Witnesses dated before [`SAFE_ACCOUNT_AGE_DATE`] and witnesses signed by an arbitrator are
//! exempt.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use monero::Amount;
use tracing::{debug, info, warn};

use super::signed::{SignedWitness, SignedWitnessService, SIGNER_AGE_DAYS};
use super::{AccountAgeWitness, WitnessHash, WitnessStore, RELEASE, SAFE_ACCOUNT_AGE_DATE};
use crate::clock::{days, Clock, DAY_MILLIS};
use crate::crypto::{KeyRing, PubKeyRing};
use crate::dispute::{Dispute, Winner};
use crate::offer::{Offer, OfferDirection};
use crate::payment::{is_crypto_currency, PaymentAccount, PaymentAccountPayload, PaymentMethod};
use crate::restrictions::{
    max_trade_limit_buyer_as_taker_without_deposit, tolerated_small_trade_amount,
};
use crate::role::TradeRole;
use crate::services::{Filter, NetworkPayload, P2pNetwork};
use crate::trade::Trade;
use crate::{Error, Res};

/// Age category of a witness signing age.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[display(Debug)]
pub enum AccountAge {
    Unverified,
    LessOneMonth,
    OneToTwoMonths,
    TwoMonthsOrMore,
}

impl AccountAge {
    /// Category of an age in milliseconds, negative ages are unverified.
    pub fn from_age(age: i64) -> Self {
        if age < 0 {
            AccountAge::Unverified
        } else if age < days(30) {
            AccountAge::LessOneMonth
        } else if age < days(60) {
            AccountAge::OneToTwoMonths
        } else {
            AccountAge::TwoMonthsOrMore
        }
    }
}

/// Signing state of a witness as shown to users.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[display(Debug)]
pub enum SignState {
    Unsigned,
    Arbitrator,
    PeerInitial { days_until_limit_lifted: i64 },
    PeerLimitLifted,
    PeerSigner,
    Banned,
}

impl SignState {
    pub fn is_limit_lifted(&self) -> bool {
        matches!(
            self,
            SignState::PeerLimitLifted | SignState::PeerSigner | SignState::Arbitrator
        )
    }
}

/// A trader of a resolved dispute the arbitrator may sign.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraderDataItem {
    pub payment_account_payload: PaymentAccountPayload,
    pub account_age_witness: AccountAgeWitness,
    pub trade_amount: Amount,
    pub peers_pub_key: Vec<u8>,
}

pub struct AccountAgeWitnessService {
    key_ring: Arc<KeyRing>,
    p2p: Arc<dyn P2pNetwork>,
    filter: Arc<dyn Filter>,
    clock: Arc<dyn Clock>,
    signed: Arc<SignedWitnessService>,
    store: WitnessStore,
}

impl fmt::Debug for AccountAgeWitnessService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountAgeWitnessService")
            .field("witnesses", &self.store.len())
            .field("signed", &self.signed)
            .finish()
    }
}

impl AccountAgeWitnessService {
    pub fn new(
        key_ring: Arc<KeyRing>,
        p2p: Arc<dyn P2pNetwork>,
        filter: Arc<dyn Filter>,
        clock: Arc<dyn Clock>,
        signed: Arc<SignedWitnessService>,
        cache_capacity: usize,
    ) -> Self {
        Self {
            key_ring,
            p2p,
            filter,
            clock,
            signed,
            store: WitnessStore::new(cache_capacity),
        }
    }

    pub fn signed_witness_service(&self) -> &Arc<SignedWitnessService> {
        &self.signed
    }

    fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Store a witness received from the network, the first witness of a hash wins.
    pub fn add_to_map(&self, witness: AccountAgeWitness) -> bool {
        self.store.put_if_absent(witness)
    }

    /// Route an append-only payload received from the network to its store.
    pub fn on_payload_received(&self, payload: NetworkPayload) -> bool {
        match payload {
            NetworkPayload::AccountAgeWitness(witness) => self.add_to_map(witness),
            NetworkPayload::SignedWitness(signed_witness) => {
                self.signed.on_data_received(signed_witness)
            }
            NetworkPayload::TradeStatistics(_) => false,
        }
    }

    /// Republish the witnesses of our traditional accounts still within date tolerance, then
    /// lend signer status to unsigned accounts of the same owner.
    pub fn on_bootstrapped(&self, accounts: &[PaymentAccount]) -> Res<()> {
        let now = self.now();
        for account in accounts
            .iter()
            .filter(|a| a.payment_method().map_or(false, |m| !m.is_blockchain()))
        {
            let witness = self.get_my_witness(&account.payload);
            if witness.is_date_in_tolerance(now) {
                self.p2p.add_persistable_network_payload(
                    NetworkPayload::AccountAgeWitness(witness),
                    true,
                )?;
                debug!(witness = %witness.hash.to_hex(), "Republished account age witness");
            }
        }
        self.sign_and_publish_same_name_accounts(accounts)?;
        Ok(())
    }

    /// Publish the witness of one of our accounts unless the network already has it. Returns
    /// whether it was published.
    pub fn publish_my_account_age_witness(&self, payload: &PaymentAccountPayload) -> Res<bool> {
        let hash = WitnessHash::compute(payload, self.key_ring.pub_key_ring());
        let witness = AccountAgeWitness::new(hash, self.now());
        {
            let mut witnesses = self.store.lock();
            if witnesses.is_cached(&hash) || witnesses.contains(&hash) {
                return Ok(false);
            }
            witnesses.insert(witness);
        }
        // the network may hand the payload straight back to `on_payload_received`, so the store
        // must not be locked while publishing
        if let Err(err) = self
            .p2p
            .add_persistable_network_payload(NetworkPayload::AccountAgeWitness(witness), false)
        {
            self.store.lock().remove(&hash);
            return Err(err.into());
        }
        info!(witness = %hash.to_hex(), account = %payload.id, "Published account age witness");
        Ok(true)
    }

    /// A witness for `payload` dated now, not stored nor published.
    pub fn new_witness(
        &self,
        payload: &PaymentAccountPayload,
        pub_key_ring: &PubKeyRing,
    ) -> AccountAgeWitness {
        AccountAgeWitness::new(WitnessHash::compute(payload, pub_key_ring), self.now())
    }

    pub fn find_witness(
        &self,
        payload: &PaymentAccountPayload,
        pub_key_ring: &PubKeyRing,
    ) -> Option<AccountAgeWitness> {
        self.store.get(&WitnessHash::compute(payload, pub_key_ring))
    }

    pub fn find_witness_by_hash(&self, hash: &WitnessHash) -> Option<AccountAgeWitness> {
        self.store.get(hash)
    }

    /// Witness of the maker of `offer`, from the hash announced in the offer.
    pub fn find_witness_for_offer(&self, offer: &Offer) -> Option<AccountAgeWitness> {
        let hash = WitnessHash::from_hex(offer.account_age_witness_hash_hex()?)?;
        self.store.get(&hash)
    }

    /// Witness of the counterparty of a trader, `None` for the arbitrator.
    pub fn find_trade_peer_witness(&self, trade: &Trade) -> Option<AccountAgeWitness> {
        let peer = trade.trade_peer()?;
        self.find_witness(peer.payment_account_payload.as_ref()?, peer.pub_key_ring.as_ref()?)
    }

    pub fn get_peer_account_age_witness_hash(&self, trade: &Trade) -> Option<WitnessHash> {
        self.find_trade_peer_witness(trade).map(|w| w.hash)
    }

    /// Our witness for `payload`, or a new unpublished one dated now.
    pub fn get_my_witness(&self, payload: &PaymentAccountPayload) -> AccountAgeWitness {
        self.find_witness(payload, self.key_ring.pub_key_ring())
            .unwrap_or_else(|| self.new_witness(payload, self.key_ring.pub_key_ring()))
    }

    pub fn get_my_witness_hash_hex(&self, payload: &PaymentAccountPayload) -> String {
        self.get_my_witness(payload).hash.to_hex()
    }

    pub fn get_my_account_age(&self, payload: &PaymentAccountPayload) -> i64 {
        self.now() - self.get_my_witness(payload).date
    }

    /// Age of an account in milliseconds, `-1` without witness.
    pub fn get_account_age(
        &self,
        payload: &PaymentAccountPayload,
        pub_key_ring: &PubKeyRing,
    ) -> i64 {
        self.find_witness(payload, pub_key_ring)
            .map_or(-1, |w| self.now() - w.date)
    }

    pub fn get_account_age_for_offer(&self, offer: &Offer) -> i64 {
        self.find_witness_for_offer(offer)
            .map_or(-1, |w| self.now() - w.date)
    }

    pub fn get_account_age_for_trade(&self, trade: &Trade) -> i64 {
        self.find_trade_peer_witness(trade)
            .map_or(-1, |w| self.now() - w.date)
    }

    /// Time elapsed since the first verified signature of `witness`, `-1` if unsigned.
    pub fn get_witness_sign_age(&self, witness: &AccountAgeWitness, now: i64) -> i64 {
        self.signed
            .verified_witness_date_list(witness)
            .first()
            .map_or(-1, |first| now - first)
    }

    pub fn get_witness_sign_age_for_offer(&self, offer: &Offer, now: i64) -> i64 {
        self.find_witness_for_offer(offer)
            .map_or(-1, |w| self.get_witness_sign_age(&w, now))
    }

    pub fn get_witness_sign_age_for_trade(&self, trade: &Trade, now: i64) -> i64 {
        self.find_trade_peer_witness(trade)
            .map_or(-1, |w| self.get_witness_sign_age(&w, now))
    }

    fn trade_limit(
        &self,
        max_trade_limit: Amount,
        currency_code: &str,
        witness: Option<&AccountAgeWitness>,
        category: AccountAge,
        direction: OfferDirection,
        payment_method: &PaymentMethod,
    ) -> Amount {
        if is_crypto_currency(currency_code)
            || !payment_method.has_chargeback_risk_for(currency_code)
            || direction == OfferDirection::Sell
        {
            return max_trade_limit;
        }
        let limit = match category {
            AccountAge::TwoMonthsOrMore => max_trade_limit,
            AccountAge::OneToTwoMonths => {
                Amount::from_pico((max_trade_limit.as_pico() + 1) / 2)
            }
            AccountAge::LessOneMonth | AccountAge::Unverified => tolerated_small_trade_amount(),
        };
        let limit = std::cmp::max(limit, tolerated_small_trade_amount());
        if let Some(witness) = witness {
            debug!(%limit, %category, witness = %witness.hash.to_hex(), "Trade limit");
        }
        limit
    }

    fn is_immature(witness: &AccountAgeWitness) -> bool {
        witness.date > SAFE_ACCOUNT_AGE_DATE
    }

    /// Mature accounts and accounts signed by an arbitrator have no trade limit.
    pub fn has_trade_limit_exception(&self, witness: &AccountAgeWitness) -> bool {
        !Self::is_immature(witness) || self.signed.is_signed_by_arbitrator(witness)
    }

    pub fn my_has_trade_limit_exception(&self, account: &PaymentAccount) -> bool {
        self.has_trade_limit_exception(&self.get_my_witness(&account.payload))
    }

    /// Trade limit of one of our accounts. A buyer taking an offer without deposit is capped at
    /// a fixed amount regardless of its account.
    pub fn get_my_trade_limit(
        &self,
        account: &PaymentAccount,
        currency_code: &str,
        direction: OfferDirection,
        buyer_as_taker_without_deposit: bool,
    ) -> Amount {
        let payment_method = match account.payment_method() {
            Some(method) => method,
            None => return Amount::from_pico(0),
        };
        if buyer_as_taker_without_deposit {
            return max_trade_limit_buyer_as_taker_without_deposit();
        }
        let witness = self.get_my_witness(&account.payload);
        let max_trade_limit = payment_method.max_trade_limit();
        if self.has_trade_limit_exception(&witness) {
            return max_trade_limit;
        }
        let category = AccountAge::from_age(self.get_witness_sign_age(&witness, self.now()));
        self.trade_limit(
            max_trade_limit,
            currency_code,
            Some(&witness),
            category,
            direction,
            payment_method,
        )
    }

    pub fn get_unsigned_trade_limit(
        &self,
        payment_method: &PaymentMethod,
        currency_code: &str,
        direction: OfferDirection,
    ) -> Amount {
        self.trade_limit(
            payment_method.max_trade_limit(),
            currency_code,
            None,
            AccountAge::Unverified,
            direction,
            payment_method,
        )
    }

    /// Verify the account age witness of a trade peer: witness date after the feature release,
    /// hash matching the payload, peer's trade limit covering the trade amount and nonce
    /// signature. Stops at the first failed check and reports it through `on_error`.
    pub fn verify_account_age_witness(
        &self,
        trade: &Trade,
        peers_payload: &PaymentAccountPayload,
        peers_pub_key_ring: &PubKeyRing,
        nonce: &[u8],
        signature: &[u8],
        on_error: &mut dyn FnMut(String),
    ) -> bool {
        info!(
            trade_id = %trade.short_id(),
            role = %trade.role,
            nonce = %hex::encode(nonce),
            "Verifying account age witness"
        );
        let peers_witness = match self.find_witness(peers_payload, peers_pub_key_ring) {
            Some(witness) => witness,
            None => {
                warn!(
                    trade_id = %trade.short_id(),
                    "Peer's witness not found, verifying a new one"
                );
                self.new_witness(peers_payload, peers_pub_key_ring)
            }
        };

        if !Self::is_date_after_release_date(peers_witness.date, RELEASE, on_error) {
            return false;
        }

        let hash = WitnessHash::compute(peers_payload, peers_pub_key_ring);
        if !Self::verify_witness_hash(&peers_witness.hash, &hash, on_error) {
            return false;
        }

        let direction = match trade.role_of(peers_pub_key_ring) {
            Some(TradeRole::Taker) => trade.offer.mirrored_direction(),
            Some(TradeRole::Maker) => trade.offer.direction,
            _ if trade.offer.is_my_offer(&self.key_ring) => trade.offer.mirrored_direction(),
            _ => trade.offer.direction,
        };
        if !self.verify_peers_trade_limit(
            &trade.offer,
            trade.amount,
            &peers_witness,
            direction,
            self.now(),
            on_error,
        ) {
            warn!(
                trade_id = %trade.short_id(),
                payload = ?peers_payload,
                "Peer's trade limit check failed"
            );
            return false;
        }

        Self::verify_signature(peers_pub_key_ring, nonce, signature, on_error)
    }

    /// Trade amount against the limit of the maker of `offer`. Without a known witness only the
    /// tolerated small amount passes.
    pub fn verify_peers_trade_amount(
        &self,
        offer: &Offer,
        trade_amount: Amount,
        on_error: &mut dyn FnMut(String),
    ) -> bool {
        match self.find_witness_for_offer(offer) {
            Some(witness) => self.verify_peers_trade_limit(
                offer,
                trade_amount,
                &witness,
                offer.direction,
                self.now(),
                on_error,
            ),
            None => trade_amount <= tolerated_small_trade_amount(),
        }
    }

    /// The peer's clock must be within one day of ours.
    pub fn verify_peers_current_date(&self, peers_current_date: i64) -> Res<()> {
        let now = self.now();
        if (peers_current_date - now).abs() > DAY_MILLIS {
            return Err(Error::Verification(format!(
                "Peers current date is further than 1 day off to our current date. \
                 PeersCurrentDate={}; myCurrentDate={}",
                peers_current_date, now
            )));
        }
        Ok(())
    }

    fn is_date_after_release_date(
        witness_date: i64,
        release_date: i64,
        on_error: &mut dyn FnMut(String),
    ) -> bool {
        // one day tolerance for unsynced clocks
        let result = witness_date > release_date - DAY_MILLIS;
        if !result {
            let msg = format!(
                "Witness date is set earlier than release date of ageWitness feature. \
                 ageWitnessReleaseDate={}, witnessDate={}",
                release_date, witness_date
            );
            warn!("{}", msg);
            on_error(msg);
        }
        result
    }

    fn verify_witness_hash(
        witness_hash: &WitnessHash,
        hash: &WitnessHash,
        on_error: &mut dyn FnMut(String),
    ) -> bool {
        let result = witness_hash == hash;
        if !result {
            let msg = format!(
                "witnessHash is not matching peers hash. witnessHash={}, hash={}",
                witness_hash.to_hex(),
                hash.to_hex()
            );
            warn!("{}", msg);
            on_error(msg);
        }
        result
    }

    fn verify_peers_trade_limit(
        &self,
        offer: &Offer,
        trade_amount: Amount,
        peers_witness: &AccountAgeWitness,
        direction: OfferDirection,
        peers_current_date: i64,
        on_error: &mut dyn FnMut(String),
    ) -> bool {
        let currency_code = &offer.counter_currency_code;
        let payment_method = match offer.payment_method() {
            Some(method) => method,
            None => {
                on_error(format!("Unknown payment method {}", offer.payment_method_id));
                return false;
            }
        };
        let default_max_trade_limit = payment_method.max_trade_limit();
        let mut peers_current_trade_limit = default_max_trade_limit;
        if !self.has_trade_limit_exception(peers_witness) {
            let category =
                AccountAge::from_age(self.get_witness_sign_age(peers_witness, peers_current_date));
            peers_current_trade_limit = self.trade_limit(
                default_max_trade_limit,
                currency_code,
                Some(peers_witness),
                category,
                direction,
                payment_method,
            );
        }
        let result = trade_amount <= peers_current_trade_limit;
        if !result {
            let msg = format!(
                "The peers trade limit is less than the traded amount.\ntradeAmount={}\n\
                 Peers trade limit={}\nOffer ID={}\nPaymentMethod={}\nCurrencyCode={}",
                trade_amount.as_pico(),
                peers_current_trade_limit.as_pico(),
                offer.short_id(),
                offer.payment_method_id,
                currency_code
            );
            warn!("{}", msg);
            on_error(msg);
        }
        result
    }

    fn verify_signature(
        peers_pub_key_ring: &PubKeyRing,
        nonce: &[u8],
        signature: &[u8],
        on_error: &mut dyn FnMut(String),
    ) -> bool {
        match peers_pub_key_ring.verify(nonce, signature) {
            Ok(()) => true,
            Err(e) => {
                let msg = format!(
                    "Signature of nonce is not correct. \
                     peersPublicKey={}, nonce(hex)={}, signature={}",
                    peers_pub_key_ring,
                    hex::encode(nonce),
                    hex::encode(signature)
                );
                warn!(error = %e, "{}", msg);
                on_error(msg);
                false
            }
        }
    }

    pub fn arbitrator_sign_account_age_witness(
        &self,
        witness: &AccountAgeWitness,
        arbitrator_key: &KeyRing,
        traders_pub_key: Vec<u8>,
        time: i64,
    ) -> Res<Option<SignedWitness>> {
        self.signed
            .sign_and_publish_by_arbitrator(witness, arbitrator_key, traders_pub_key, time)
    }

    /// Sign an orphan witness for the owner recorded in one of its existing signatures.
    pub fn arbitrator_sign_orphan_witness(
        &self,
        witness: &AccountAgeWitness,
        arbitrator_key: &KeyRing,
        time: i64,
    ) -> Res<Option<SignedWitness>> {
        let owner = self
            .signed
            .signed_witness_set(witness)
            .into_iter()
            .next()
            .map(|sw| sw.witness_owner_pub_key)
            .ok_or_else(|| Error::IllegalState("No signedWitness found".into()))?;
        self.signed
            .sign_and_publish_by_arbitrator(witness, arbitrator_key, owner, time)
    }

    /// Sign a signer whose own witness is unknown, by its public key.
    pub fn arbitrator_sign_orphan_pub_key(
        &self,
        arbitrator_key: &KeyRing,
        peers_pub_key: Vec<u8>,
        child_sign_time: i64,
    ) -> Res<Option<SignedWitness>> {
        self.signed
            .sign_trader_pub_key(arbitrator_key, peers_pub_key, child_sign_time)
    }

    /// Sign the witness of our trade peer. Returns `None` when the peer is already signed or the
    /// trade is too small.
    pub fn trader_sign_and_publish_peers_account_age_witness(
        &self,
        trade: &Trade,
    ) -> Res<Option<SignedWitness>> {
        let peers_pub_key = trade
            .trade_peer()
            .and_then(|peer| peer.pub_key_ring.as_ref())
            .ok_or_else(|| Error::IllegalState("Peer must have a keyring".into()))?
            .signature_pub_key_bytes();
        let peers_witness = self.find_trade_peer_witness(trade).ok_or_else(|| {
            Error::IllegalState(format!(
                "Not able to find peers witness, unable to sign for trade {}",
                trade
            ))
        })?;
        self.signed
            .sign_and_publish_by_trader(&peers_witness, trade.amount, peers_pub_key)
    }

    pub fn publish_own_signed_witness(&self, signed_witness: SignedWitness) -> Res<bool> {
        self.signed.publish_own_signed_witness(signed_witness)
    }

    /// Self-sign our unsigned accounts that share an owner id with one of our signer accounts.
    /// Returns the number of accounts signed.
    pub fn sign_and_publish_same_name_accounts(&self, accounts: &[PaymentAccount]) -> Res<usize> {
        let now = self.now();
        let signers: Vec<&PaymentAccount> = accounts
            .iter()
            .filter(|a| {
                a.owner_id.is_some()
                    && self
                        .signed
                        .is_signer_account_age_witness(&self.get_my_witness(&a.payload), now)
            })
            .collect();
        let unsigned: Vec<&PaymentAccount> = accounts
            .iter()
            .filter(|a| {
                a.owner_id.is_some()
                    && !self
                        .signed
                        .is_signed_account_age_witness(&self.get_my_witness(&a.payload))
            })
            .collect();

        let mut signed = HashSet::new();
        for signer in &signers {
            for account in &unsigned {
                if signer.owner_id == account.owner_id && signed.insert(account.id().to_string()) {
                    let witness = self.get_my_witness(&account.payload);
                    self.signed.self_sign_and_publish(&witness)?;
                    info!(account = %account.id(), "Self signed account of the same owner");
                }
            }
        }
        Ok(signed.len())
    }

    /// Witnesses signed by a peer whose own witness has no signature.
    pub fn get_orphan_signed_witnesses(&self) -> Vec<AccountAgeWitness> {
        let mut orphans: Vec<AccountAgeWitness> = Vec::new();
        for sw in self.signed.root_signed_witness_set(false) {
            if let Some(witness) = self.store.get(&sw.account_age_witness_hash) {
                if !orphans.contains(&witness) {
                    orphans.push(witness);
                }
            }
        }
        orphans
    }

    pub fn get_unsigned_signer_pub_keys(&self) -> Vec<SignedWitness> {
        self.signed.unsigned_signer_pub_keys()
    }

    fn is_not_filtered(&self, dispute: &Dispute) -> bool {
        let contract = &dispute.contract;
        let filtered = self.filter.is_node_address_banned(contract.buyer_node_address())
            || self.filter.is_node_address_banned(contract.seller_node_address())
            || self.filter.is_currency_banned(&contract.counter_currency_code)
            || self.filter.is_payment_method_banned(&contract.payment_method_id)
            || dispute
                .buyer_payment_account_payload()
                .map_or(false, |p| self.filter.are_peers_payment_account_data_banned(p))
            || dispute
                .seller_payment_account_payload()
                .map_or(false, |p| self.filter.are_peers_payment_account_data_banned(p))
            || self.filter.is_witness_signer_pub_key_banned(&hex::encode(
                contract.buyer_pub_key_ring().signature_pub_key_bytes(),
            ))
            || self.filter.is_witness_signer_pub_key_banned(&hex::encode(
                contract.seller_pub_key_ring().signature_pub_key_bytes(),
            ));
        !filtered
    }

    pub fn has_chargeback_risk(dispute: &Dispute) -> bool {
        PaymentMethod::by_id(&dispute.contract.payment_method_id).map_or(false, |m| {
            m.has_chargeback_risk_for(&dispute.contract.counter_currency_code)
        })
    }

    fn is_buyer_winner(dispute: &Dispute) -> bool {
        dispute.is_closed()
            && dispute
                .result
                .as_ref()
                .map_or(false, |r| r.winner == Winner::Buyer)
    }

    fn trader_data(&self, dispute: &Dispute) -> Vec<TraderDataItem> {
        let contract = &dispute.contract;
        let sides = [
            (dispute.buyer_payment_account_payload(), contract.buyer_pub_key_ring()),
            (dispute.seller_payment_account_payload(), contract.seller_pub_key_ring()),
        ];
        sides
            .into_iter()
            .filter_map(|(payload, pub_key_ring)| {
                let payload = payload?;
                let witness = self.find_witness(payload, pub_key_ring)?;
                Some(TraderDataItem {
                    payment_account_payload: payload.clone(),
                    account_age_witness: witness,
                    trade_amount: contract.trade_amount,
                    peers_pub_key: pub_key_ring.signature_pub_key_bytes(),
                })
            })
            .collect()
    }

    /// Traders of disputes won by the buyer on a chargeback risk method whose witness is
    /// unsigned and older than `safe_date`. Arbitrators sign them manually.
    pub fn get_trader_payment_accounts(
        &self,
        safe_date: i64,
        payment_method: &PaymentMethod,
        disputes: &[Dispute],
    ) -> Vec<TraderDataItem> {
        let mut items: Vec<TraderDataItem> = Vec::new();
        for item in disputes
            .iter()
            .filter(|d| d.contract.payment_method_id == payment_method.id)
            .filter(|d| self.is_not_filtered(d))
            .filter(|d| Self::has_chargeback_risk(d))
            .filter(|d| Self::is_buyer_winner(d))
            .flat_map(|d| self.trader_data(d))
            .filter(|i| !self.signed.is_signed_account_age_witness(&i.account_age_witness))
            .filter(|i| i.account_age_witness.date < safe_date)
        {
            if !items.contains(&item) {
                items.push(item);
            }
        }
        items
    }

    pub fn has_signed_witness(&self, offer: &Offer) -> bool {
        self.find_witness_for_offer(offer)
            .map_or(false, |w| self.signed.is_signed_account_age_witness(&w))
    }

    pub fn peer_has_signed_witness(&self, trade: &Trade) -> bool {
        self.find_trade_peer_witness(trade)
            .map_or(false, |w| self.signed.is_signed_account_age_witness(&w))
    }

    pub fn account_is_signer(&self, witness: &AccountAgeWitness) -> bool {
        self.signed.is_signer_account_age_witness(witness, self.now())
    }

    pub fn trade_amount_is_sufficient(&self, trade_amount: Amount) -> bool {
        self.signed.is_sufficient_trade_amount_for_signing(trade_amount)
    }

    pub fn get_sign_state(&self, witness: &AccountAgeWitness) -> SignState {
        if self.signed.is_filtered_witness(witness) {
            return SignState::Banned;
        }
        if self.signed.is_signed_by_arbitrator(witness) {
            return SignState::Arbitrator;
        }
        let sign_age = self.get_witness_sign_age(witness, self.now());
        match AccountAge::from_age(sign_age) {
            AccountAge::TwoMonthsOrMore | AccountAge::OneToTwoMonths => SignState::PeerSigner,
            AccountAge::LessOneMonth => SignState::PeerInitial {
                days_until_limit_lifted: SIGNER_AGE_DAYS - sign_age / DAY_MILLIS,
            },
            AccountAge::Unverified => SignState::Unsigned,
        }
    }

    pub fn get_sign_state_for_offer(&self, offer: &Offer) -> SignState {
        self.find_witness_for_offer(offer)
            .map_or(SignState::Unsigned, |w| self.get_sign_state(&w))
    }

    pub fn get_sign_state_for_trade(&self, trade: &Trade) -> SignState {
        self.find_trade_peer_witness(trade)
            .map_or(SignState::Unsigned, |w| self.get_sign_state(&w))
    }

    /// The seller of `trade` is us, may sign and the buyer is not yet signed.
    pub fn is_sign_witness_trade(&self, trade: &Trade) -> bool {
        let payload = match trade.seller().payment_account_payload.as_ref() {
            Some(payload) => payload,
            None => return false,
        };
        let my_witness = self.get_my_witness(payload);
        debug!(
            trade_id = %trade.short_id(),
            witness = %my_witness.hash.to_hex(),
            "Checking whether the trade signs the peer's witness"
        );
        self.account_is_signer(&my_witness)
            && !self.peer_has_signed_witness(trade)
            && self.trade_amount_is_sufficient(trade.amount)
    }

    /// `hex(witness_hash),hex(signature_pub_key)` of one of our accounts, handed to an
    /// arbitrator out of band.
    pub fn sign_info_from_account(&self, account: &PaymentAccount) -> String {
        let witness = self.get_my_witness(&account.payload);
        format!(
            "{},{}",
            witness.hash.to_hex(),
            hex::encode(self.key_ring.pub_key_ring().signature_pub_key_bytes())
        )
    }

    /// Parse a sign info string. `None` when malformed or when the witness is unknown.
    pub fn parse_sign_info(&self, sign_info: &str) -> Option<(AccountAgeWitness, Vec<u8>)> {
        let mut parts = sign_info.split(',');
        let (hash, pub_key) = match (parts.next(), parts.next(), parts.next()) {
            (Some(hash), Some(pub_key), None) => (hash, pub_key),
            _ => return None,
        };
        let hash = WitnessHash::from_hex(hash)?;
        let pub_key = hex::decode(pub_key).ok()?;
        Some((self.store.get(&hash)?, pub_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mock::{key, Gossip};
    use crate::offer::ACCOUNT_AGE_WITNESS_HASH;
    use crate::payment::{BLOCK_CHAINS, SEPA};
    use crate::restrictions::PICO_PER_XMR;
    use crate::services::NoFilter;
    use crate::trade::tests::offer;

    const NOW: i64 = 1_700_000_000_000;

    struct Fixture {
        me: KeyRing,
        arbitrator: KeyRing,
        gossip: Arc<Gossip>,
        clock: Arc<ManualClock>,
        service: AccountAgeWitnessService,
    }

    fn fixture() -> Fixture {
        let me = key(2);
        let arbitrator = key(9);
        let gossip = Arc::new(Gossip::default());
        let clock = Arc::new(ManualClock::new(NOW));
        let signed = Arc::new(SignedWitnessService::new(
            Arc::new(me.clone()),
            gossip.clone(),
            Arc::new(NoFilter),
            clock.clone(),
        ));
        signed.register_arbitrator_key(arbitrator.pub_key_ring().signature_pub_key_bytes());
        let service = AccountAgeWitnessService::new(
            Arc::new(me.clone()),
            gossip.clone(),
            Arc::new(NoFilter),
            clock.clone(),
            signed,
            16,
        );
        Fixture {
            me,
            arbitrator,
            gossip,
            clock,
            service,
        }
    }

    fn sepa_account(id: &str) -> PaymentAccount {
        let payload = PaymentAccountPayload::with_salt(
            id,
            SEPA.id,
            format!("IBAN-{}", id).into_bytes(),
            vec![7; 32],
            Some("Alice".into()),
        );
        PaymentAccount::new(id, vec!["EUR".into()], NOW, payload)
    }

    #[test]
    fn my_witness_is_published_once() {
        let f = fixture();
        let account = sepa_account("a");
        let witness = f.service.get_my_witness(&account.payload);
        assert_eq!(witness.date, NOW);
        assert!(f.service.find_witness(&account.payload, f.me.pub_key_ring()).is_none());

        assert!(f.service.publish_my_account_age_witness(&account.payload).unwrap());
        assert!(!f.service.publish_my_account_age_witness(&account.payload).unwrap());
        assert_eq!(f.gossip.published(), 1);

        f.clock.advance(days(3));
        assert_eq!(f.service.get_my_account_age(&account.payload), days(3));
        assert_eq!(
            f.service.get_account_age(&account.payload, f.me.pub_key_ring()),
            days(3)
        );
        assert_eq!(f.service.get_account_age(&account.payload, key(5).pub_key_ring()), -1);
    }

    #[test]
    fn first_witness_of_a_hash_wins() {
        let f = fixture();
        let hash = WitnessHash::from([3; 20]);
        assert!(f.service.add_to_map(AccountAgeWitness::new(hash, NOW - days(10))));
        assert!(!f.service.add_to_map(AccountAgeWitness::new(hash, NOW)));
        assert_eq!(f.service.find_witness_by_hash(&hash).unwrap().date, NOW - days(10));
    }

    #[test]
    fn unsigned_buyer_limits() {
        let f = fixture();
        assert_eq!(
            f.service.get_unsigned_trade_limit(&SEPA, "EUR", OfferDirection::Buy),
            tolerated_small_trade_amount()
        );
        assert_eq!(
            f.service.get_unsigned_trade_limit(&SEPA, "EUR", OfferDirection::Sell),
            SEPA.max_trade_limit()
        );
        assert_eq!(
            f.service.get_unsigned_trade_limit(&BLOCK_CHAINS, "BTC", OfferDirection::Buy),
            BLOCK_CHAINS.max_trade_limit()
        );
        let account = sepa_account("a");
        assert_eq!(
            f.service.get_my_trade_limit(&account, "EUR", OfferDirection::Buy, true),
            Amount::from_pico(PICO_PER_XMR)
        );
    }

    #[test]
    fn limit_follows_signing_age() {
        let f = fixture();
        let account = sepa_account("a");
        f.service.publish_my_account_age_witness(&account.payload).unwrap();
        let witness = f.service.get_my_witness(&account.payload);
        let signer = key(4);
        // signer key signed by the arbitrator long ago, then signs us as a peer
        f.service
            .signed_witness_service()
            .sign_and_publish_by_arbitrator(
                &AccountAgeWitness::new(WitnessHash::from([4; 20]), NOW - days(200)),
                &f.arbitrator,
                signer.pub_key_ring().signature_pub_key_bytes(),
                NOW - days(200),
            )
            .unwrap();
        let peer_signed = SignedWitness {
            verification_method: crate::witness::signed::VerificationMethod::Trade,
            account_age_witness_hash: witness.hash,
            signature: signer.sign(witness.hash.as_bytes()).unwrap(),
            signer_pub_key: signer.pub_key_ring().signature_pub_key_bytes(),
            witness_owner_pub_key: f.me.pub_key_ring().signature_pub_key_bytes(),
            date: NOW,
            trade_amount: Amount::from_pico(PICO_PER_XMR),
        };
        assert!(f.service.signed_witness_service().on_data_received(peer_signed));

        let limit = |f: &Fixture| {
            f.service
                .get_my_trade_limit(&account, "EUR", OfferDirection::Buy, false)
        };
        assert_eq!(limit(&f), tolerated_small_trade_amount());
        assert_eq!(
            f.service.get_sign_state(&witness),
            SignState::PeerInitial {
                days_until_limit_lifted: 30
            }
        );
        f.clock.advance(days(45));
        assert_eq!(limit(&f), Amount::from_pico(6 * PICO_PER_XMR));
        assert_eq!(f.service.get_sign_state(&witness), SignState::PeerSigner);
        f.clock.advance(days(30));
        assert_eq!(limit(&f), SEPA.max_trade_limit());
    }

    #[test]
    fn arbitrator_signature_lifts_limit() {
        let f = fixture();
        let account = sepa_account("a");
        f.service.publish_my_account_age_witness(&account.payload).unwrap();
        let witness = f.service.get_my_witness(&account.payload);
        assert!(!f.service.has_trade_limit_exception(&witness));
        f.service
            .arbitrator_sign_account_age_witness(
                &witness,
                &f.arbitrator,
                f.me.pub_key_ring().signature_pub_key_bytes(),
                NOW,
            )
            .unwrap();
        assert!(f.service.has_trade_limit_exception(&witness));
        assert_eq!(f.service.get_sign_state(&witness), SignState::Arbitrator);
        assert!(f.service.get_sign_state(&witness).is_limit_lifted());
        // old witnesses are exempt anyway
        let safe = AccountAgeWitness::new(witness.hash, SAFE_ACCOUNT_AGE_DATE);
        assert!(f.service.has_trade_limit_exception(&safe));
    }

    #[test]
    fn verification_reports_first_failure() {
        let f = fixture();
        let peer = key(6);
        let peer_account = sepa_account("peer");
        let mut sell = offer(OfferDirection::Sell);
        sell.pub_key_ring = *f.me.pub_key_ring();
        let mut trade = Trade::new(
            TradeRole::Maker,
            sell,
            tolerated_small_trade_amount(),
            1,
            Amount::from_pico(0),
            NOW,
        );
        trade.taker.pub_key_ring = Some(*peer.pub_key_ring());
        let nonce = trade.witness_nonce();
        let signature = peer.sign(&nonce).unwrap();

        let mut errors = Vec::new();
        assert!(f.service.verify_account_age_witness(
            &trade,
            &peer_account.payload,
            peer.pub_key_ring(),
            &nonce,
            &signature,
            &mut |e| errors.push(e),
        ));
        assert!(errors.is_empty());

        // a witness dated before the release is refused
        f.service.add_to_map(AccountAgeWitness::new(
            WitnessHash::compute(&peer_account.payload, peer.pub_key_ring()),
            RELEASE - days(2),
        ));
        assert!(!f.service.verify_account_age_witness(
            &trade,
            &peer_account.payload,
            peer.pub_key_ring(),
            &nonce,
            &signature,
            &mut |e| errors.push(e),
        ));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Witness date is set earlier than release date"));

        // bad nonce signature on a fresh account
        let other = sepa_account("other");
        errors.clear();
        assert!(!f.service.verify_account_age_witness(
            &trade,
            &other.payload,
            peer.pub_key_ring(),
            b"another nonce",
            &signature,
            &mut |e| errors.push(e),
        ));
        assert!(errors[0].starts_with("Signature of nonce is not correct"));

        // unsigned buyer above the tolerated amount
        trade.amount = Amount::from_pico(PICO_PER_XMR);
        errors.clear();
        assert!(!f.service.verify_account_age_witness(
            &trade,
            &other.payload,
            peer.pub_key_ring(),
            &nonce,
            &signature,
            &mut |e| errors.push(e),
        ));
        assert!(errors[0].starts_with("The peers trade limit is less than the traded amount"));
    }

    #[test]
    fn peers_amount_without_witness_is_tolerated_only_when_small() {
        let f = fixture();
        let mut o = offer(OfferDirection::Buy);
        let mut errors = Vec::new();
        assert!(f.service.verify_peers_trade_amount(
            &o,
            tolerated_small_trade_amount(),
            &mut |e| errors.push(e)
        ));
        assert!(!f.service.verify_peers_trade_amount(
            &o,
            Amount::from_pico(PICO_PER_XMR),
            &mut |e| errors.push(e)
        ));

        let hash = WitnessHash::from([8; 20]);
        f.service.add_to_map(AccountAgeWitness::new(hash, SAFE_ACCOUNT_AGE_DATE - days(1)));
        o.extra_data = vec![(ACCOUNT_AGE_WITNESS_HASH.into(), hash.to_hex())];
        assert!(f.service.verify_peers_trade_amount(
            &o,
            Amount::from_pico(PICO_PER_XMR),
            &mut |e| errors.push(e)
        ));
        assert!(errors.is_empty());
        assert!(f.service.get_account_age_for_offer(&o) > 0);
    }

    #[test]
    fn peers_clock_tolerance() {
        let f = fixture();
        assert!(f.service.verify_peers_current_date(NOW + DAY_MILLIS).is_ok());
        assert!(matches!(
            f.service.verify_peers_current_date(NOW - DAY_MILLIS - 1),
            Err(Error::Verification(_))
        ));
    }

    #[test]
    fn same_owner_accounts_are_self_signed() {
        let f = fixture();
        let signer = sepa_account("signer").with_owner_id("bob");
        let fresh = sepa_account("fresh").with_owner_id("bob");
        let stranger = sepa_account("stranger").with_owner_id("carol");
        for account in [&signer, &fresh, &stranger] {
            f.service.publish_my_account_age_witness(&account.payload).unwrap();
        }
        f.service
            .arbitrator_sign_account_age_witness(
                &f.service.get_my_witness(&signer.payload),
                &f.arbitrator,
                f.me.pub_key_ring().signature_pub_key_bytes(),
                NOW,
            )
            .unwrap();
        let accounts = vec![signer, fresh.clone(), stranger.clone()];
        assert_eq!(f.service.sign_and_publish_same_name_accounts(&accounts).unwrap(), 1);
        let signed = f.service.signed_witness_service();
        assert!(!signed
            .signed_witness_set(&f.service.get_my_witness(&fresh.payload))
            .is_empty());
        assert!(signed
            .signed_witness_set(&f.service.get_my_witness(&stranger.payload))
            .is_empty());
        // nothing left to sign
        assert_eq!(f.service.sign_and_publish_same_name_accounts(&accounts).unwrap(), 0);
    }

    #[test]
    fn sign_info() {
        let f = fixture();
        let account = sepa_account("a");
        let info = f.service.sign_info_from_account(&account);
        assert!(f.service.parse_sign_info(&info).is_none());
        f.service.publish_my_account_age_witness(&account.payload).unwrap();
        let (witness, pub_key) = f.service.parse_sign_info(&info).unwrap();
        assert_eq!(witness, f.service.get_my_witness(&account.payload));
        assert_eq!(pub_key, f.me.pub_key_ring().signature_pub_key_bytes());
        assert!(f.service.parse_sign_info("abc").is_none());
        assert!(f.service.parse_sign_info("00,11,22").is_none());
    }

    #[test]
    fn orphan_witness_without_signature_is_an_error() {
        let f = fixture();
        let w = AccountAgeWitness::new(WitnessHash::from([1; 20]), NOW);
        assert!(matches!(
            f.service.arbitrator_sign_orphan_witness(&w, &f.arbitrator, NOW),
            Err(Error::IllegalState(_))
        ));
    }

    /// Hands published payloads back to the service, like a network notifying its local
    /// listeners on add.
    #[derive(Default)]
    struct Loopback {
        service: parking_lot::Mutex<std::sync::Weak<AccountAgeWitnessService>>,
        offline: bool,
    }

    impl P2pNetwork for Loopback {
        fn add_persistable_network_payload(
            &self,
            payload: NetworkPayload,
            _: bool,
        ) -> Result<bool, crate::services::Error> {
            if self.offline {
                return Err(crate::services::Error::Network("offline".into()));
            }
            let service = self.service.lock().upgrade();
            Ok(service.map_or(false, |s| s.on_payload_received(payload)))
        }

        fn send_message(
            &self,
            _: &crate::network::NodeAddress,
            _: crate::protocol::message::NetworkMessage,
        ) -> Result<(), crate::services::Error> {
            Ok(())
        }

        fn is_bootstrapped(&self) -> bool {
            true
        }
    }

    fn looped_service(offline: bool) -> Arc<AccountAgeWitnessService> {
        let me = Arc::new(key(2));
        let clock = Arc::new(ManualClock::new(NOW));
        let loopback = Arc::new(Loopback {
            offline,
            ..Default::default()
        });
        let signed = Arc::new(SignedWitnessService::new(
            me.clone(),
            Arc::new(Gossip::default()),
            Arc::new(NoFilter),
            clock.clone(),
        ));
        let service = Arc::new(AccountAgeWitnessService::new(
            me,
            loopback.clone(),
            Arc::new(NoFilter),
            clock,
            signed,
            16,
        ));
        *loopback.service.lock() = Arc::downgrade(&service);
        service
    }

    #[test]
    fn publish_tolerates_synchronous_delivery() {
        let service = looped_service(false);
        let account = sepa_account("a");
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let service = service.clone();
            let payload = account.payload.clone();
            std::thread::spawn(move || {
                let _ = tx.send(service.publish_my_account_age_witness(&payload).is_ok());
            })
        };
        let published = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("publishing must not block on the witness store");
        worker.join().unwrap();
        assert!(published);
        let witness = service.get_my_witness(&account.payload);
        assert_eq!(service.find_witness_by_hash(&witness.hash), Some(witness));
        assert!(!service.publish_my_account_age_witness(&account.payload).unwrap());
    }

    #[test]
    fn failed_publish_leaves_no_witness() {
        let service = looped_service(true);
        let account = sepa_account("a");
        assert!(matches!(
            service.publish_my_account_age_witness(&account.payload),
            Err(Error::Services(_))
        ));
        let witness = service.get_my_witness(&account.payload);
        assert_eq!(service.find_witness_by_hash(&witness.hash), None);
    }
}
