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

//! Signed witnesses and the chain of trust they form.
//!
//! An arbitrator signs the witness of a trader who won a dispute about a payment with
//! chargeback risk, that trader's account becomes a signer 30 days later and signs in turn the
//! witnesses of the peers it trades with. Every signed witness therefore chains back to an
//! arbitrator signature through signers that were at least 30 days old when they signed.
//!
//! A peer signed witness whose signer owns no signed witness is an orphan: the root of its
//! chain is missing locally. Arbitrators can re-sign orphans to re-attach them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::Arc;

use monero::Amount;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{AccountAgeWitness, WitnessHash};
use crate::clock::{days, Clock, DAY_MILLIS};
use crate::consensus::{self, Decodable, Encodable};
use crate::crypto::{self, hash160, KeyRing};
use crate::restrictions::minimum_trade_amount_for_signing;
use crate::services::{Filter, NetworkPayload, P2pNetwork};
use crate::Res;

/// Age a signed witness must reach before its owner can sign other accounts.
pub const SIGNER_AGE_DAYS: i64 = 30;
/// [`SIGNER_AGE_DAYS`] in milliseconds.
pub const SIGNER_AGE: i64 = days(SIGNER_AGE_DAYS);

/// Maximum number of signers walked while validating a chain.
const MAX_CHAIN_DEPTH: usize = 2000;

/// Who signed a witness.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[display(Debug)]
pub enum VerificationMethod {
    Arbitrator,
    Trade,
}

impl Encodable for VerificationMethod {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            VerificationMethod::Arbitrator => 0x01u8.consensus_encode(writer),
            VerificationMethod::Trade => 0x02u8.consensus_encode(writer),
        }
    }
}

impl Decodable for VerificationMethod {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(VerificationMethod::Arbitrator),
            0x02u8 => Ok(VerificationMethod::Trade),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

fixed_hash::construct_fixed_hash!(
    /// Content address of a signed witness.
    pub struct SignedWitnessHash(20);
);

/// A signature over an account age witness hash.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SignedWitness {
    pub verification_method: VerificationMethod,
    pub account_age_witness_hash: WitnessHash,
    /// DER encoded signature of the witness hash.
    pub signature: Vec<u8>,
    pub signer_pub_key: Vec<u8>,
    pub witness_owner_pub_key: Vec<u8>,
    /// Signing date in unix milliseconds.
    pub date: i64,
    /// Amount of the trade that led to the signature, zero for arbitrator signatures.
    pub trade_amount: Amount,
}

impl SignedWitness {
    /// `hash160(witness_hash | signature | signer_pub_key)`.
    pub fn hash(&self) -> SignedWitnessHash {
        let mut data = self.account_age_witness_hash.as_bytes().to_vec();
        data.extend_from_slice(&self.signature);
        data.extend_from_slice(&self.signer_pub_key);
        SignedWitnessHash::from(hash160(&data))
    }

    pub fn is_signed_by_arbitrator(&self) -> bool {
        self.verification_method == VerificationMethod::Arbitrator
    }

    pub fn is_date_in_tolerance(&self, now: i64) -> bool {
        (now - self.date).abs() <= DAY_MILLIS
    }
}

impl fmt::Debug for SignedWitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedWitness")
            .field("verification_method", &self.verification_method)
            .field("witness", &self.account_age_witness_hash.to_hex())
            .field("signer", &hex::encode(&self.signer_pub_key))
            .field("owner", &hex::encode(&self.witness_owner_pub_key))
            .field("date", &self.date)
            .field("trade_amount", &self.trade_amount)
            .finish()
    }
}

impl Encodable for SignedWitness {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.verification_method.consensus_encode(s)?;
        len += self.account_age_witness_hash.consensus_encode(s)?;
        len += self.signature.consensus_encode(s)?;
        len += self.signer_pub_key.consensus_encode(s)?;
        len += self.witness_owner_pub_key.consensus_encode(s)?;
        len += self.date.consensus_encode(s)?;
        Ok(len + self.trade_amount.consensus_encode(s)?)
    }
}

impl Decodable for SignedWitness {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self {
            verification_method: Decodable::consensus_decode(d)?,
            account_age_witness_hash: Decodable::consensus_decode(d)?,
            signature: Decodable::consensus_decode(d)?,
            signer_pub_key: Decodable::consensus_decode(d)?,
            witness_owner_pub_key: Decodable::consensus_decode(d)?,
            date: Decodable::consensus_decode(d)?,
            trade_amount: Decodable::consensus_decode(d)?,
        })
    }
}

impl_strict_encoding!(SignedWitness);

#[derive(Debug, Default)]
struct SignedWitnesses {
    map: HashMap<SignedWitnessHash, SignedWitness>,
    by_witness: HashMap<WitnessHash, Vec<SignedWitnessHash>>,
    by_owner: HashMap<Vec<u8>, Vec<SignedWitnessHash>>,
}

impl SignedWitnesses {
    fn insert(&mut self, signed_witness: SignedWitness) -> bool {
        let hash = signed_witness.hash();
        if self.map.contains_key(&hash) {
            return false;
        }
        self.by_witness
            .entry(signed_witness.account_age_witness_hash)
            .or_default()
            .push(hash);
        self.by_owner
            .entry(signed_witness.witness_owner_pub_key.clone())
            .or_default()
            .push(hash);
        self.map.insert(hash, signed_witness);
        true
    }

    fn for_witness(&self, hash: &WitnessHash) -> Vec<&SignedWitness> {
        self.lookup(self.by_witness.get(hash))
    }

    /// Signed witnesses owned by `owner` and not signed by an excluded key.
    fn for_owner(&self, owner: &[u8], excluded: &[Vec<u8>]) -> Vec<&SignedWitness> {
        self.lookup(self.by_owner.get(owner))
            .into_iter()
            .filter(|sw| !excluded.contains(&sw.signer_pub_key))
            .collect()
    }

    fn lookup(&self, hashes: Option<&Vec<SignedWitnessHash>>) -> Vec<&SignedWitness> {
        hashes
            .map(|hashes| hashes.iter().filter_map(|h| self.map.get(h)).collect())
            .unwrap_or_default()
    }
}

/// Stores signed witnesses, validates their chains and signs witnesses.
pub struct SignedWitnessService {
    key_ring: Arc<KeyRing>,
    p2p: Arc<dyn P2pNetwork>,
    filter: Arc<dyn Filter>,
    clock: Arc<dyn Clock>,
    arbitrator_keys: RwLock<HashSet<Vec<u8>>>,
    witnesses: Mutex<SignedWitnesses>,
}

impl fmt::Debug for SignedWitnessService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedWitnessService")
            .field("signed_witnesses", &self.witnesses.lock().map.len())
            .finish()
    }
}

impl SignedWitnessService {
    pub fn new(
        key_ring: Arc<KeyRing>,
        p2p: Arc<dyn P2pNetwork>,
        filter: Arc<dyn Filter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key_ring,
            p2p,
            filter,
            clock,
            arbitrator_keys: RwLock::new(HashSet::new()),
            witnesses: Mutex::new(SignedWitnesses::default()),
        }
    }

    /// Accept signatures made with `pub_key` as arbitrator signatures.
    pub fn register_arbitrator_key(&self, pub_key: Vec<u8>) {
        self.arbitrator_keys.write().insert(pub_key);
    }

    pub fn is_registered_arbitrator(&self, pub_key: &[u8]) -> bool {
        self.arbitrator_keys.read().contains(pub_key)
    }

    /// Store a signed witness, returns `false` if already known.
    pub fn add_to_map(&self, signed_witness: SignedWitness) -> bool {
        self.witnesses.lock().insert(signed_witness)
    }

    /// Store a signed witness received from the network if its signature is valid.
    pub fn on_data_received(&self, signed_witness: SignedWitness) -> bool {
        if !self.verify_signature(&signed_witness) {
            warn!(
                signed_witness = ?signed_witness,
                "Dropping signed witness with invalid signature"
            );
            return false;
        }
        self.add_to_map(signed_witness)
    }

    pub fn len(&self) -> usize {
        self.witnesses.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn signed_witness_set(&self, witness: &AccountAgeWitness) -> Vec<SignedWitness> {
        self.witnesses
            .lock()
            .for_witness(&witness.hash)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Arbitrator signatures must come from a registered arbitrator key, peer signatures only
    /// need to be valid.
    pub fn verify_signature(&self, signed_witness: &SignedWitness) -> bool {
        if signed_witness.is_signed_by_arbitrator()
            && !self.is_registered_arbitrator(&signed_witness.signer_pub_key)
        {
            warn!(
                signer = %hex::encode(&signed_witness.signer_pub_key),
                "Arbitrator signature from an unknown arbitrator key"
            );
            return false;
        }
        match crypto::verify(
            &signed_witness.signer_pub_key,
            signed_witness.account_age_witness_hash.as_bytes(),
            &signed_witness.signature,
        ) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    witness = %signed_witness.account_age_witness_hash.to_hex(),
                    error = %e,
                    "Signed witness signature verification failed"
                );
                false
            }
        }
    }

    fn is_owner_banned(&self, signed_witness: &SignedWitness) -> bool {
        self.filter
            .is_witness_signer_pub_key_banned(&hex::encode(&signed_witness.witness_owner_pub_key))
    }

    /// One of the signed witnesses of the owner of `witness` is banned.
    pub fn is_filtered_witness(&self, witness: &AccountAgeWitness) -> bool {
        self.witnesses
            .lock()
            .for_witness(&witness.hash)
            .into_iter()
            .any(|sw| self.is_owner_banned(sw))
    }

    fn has_valid_signer(
        &self,
        witnesses: &SignedWitnesses,
        signed_witness: &SignedWitness,
        excluded: &mut Vec<Vec<u8>>,
    ) -> bool {
        if excluded.len() >= MAX_CHAIN_DEPTH {
            return false;
        }
        excluded.push(signed_witness.signer_pub_key.clone());
        let signer_witnesses = witnesses.for_owner(&signed_witness.signer_pub_key, excluded);
        for signer_witness in signer_witnesses {
            if self.is_valid_signed_witness(
                witnesses,
                signer_witness,
                signed_witness.date,
                excluded,
            ) {
                excluded.pop();
                return true;
            }
        }
        excluded.pop();
        false
    }

    /// A signed witness is a valid signer witness for a child signed at `child_date` if it is
    /// signed by an arbitrator, or if it is at least [`SIGNER_AGE`] older than the child and its
    /// own signer is valid in turn.
    fn is_valid_signed_witness(
        &self,
        witnesses: &SignedWitnesses,
        signed_witness: &SignedWitness,
        child_date: i64,
        excluded: &mut Vec<Vec<u8>>,
    ) -> bool {
        if self.is_owner_banned(signed_witness) || !self.verify_signature(signed_witness) {
            return false;
        }
        if signed_witness.is_signed_by_arbitrator() {
            return true;
        }
        if signed_witness.date > child_date - SIGNER_AGE {
            return false;
        }
        self.has_valid_signer(witnesses, signed_witness, excluded)
    }

    /// Signature valid, owner not banned and signer chain rooted at an arbitrator.
    fn is_verified(&self, witnesses: &SignedWitnesses, signed_witness: &SignedWitness) -> bool {
        if self.is_owner_banned(signed_witness) || !self.verify_signature(signed_witness) {
            return false;
        }
        signed_witness.is_signed_by_arbitrator()
            || self.has_valid_signer(witnesses, signed_witness, &mut Vec::new())
    }

    /// Dates of the verified signatures of `witness`, oldest first.
    pub fn verified_witness_date_list(&self, witness: &AccountAgeWitness) -> Vec<i64> {
        let witnesses = self.witnesses.lock();
        let mut dates: Vec<i64> = witnesses
            .for_witness(&witness.hash)
            .into_iter()
            .filter(|sw| self.is_verified(&witnesses, sw))
            .map(|sw| sw.date)
            .collect();
        dates.sort_unstable();
        dates
    }

    pub fn is_signed_account_age_witness(&self, witness: &AccountAgeWitness) -> bool {
        !self.verified_witness_date_list(witness).is_empty()
    }

    pub fn is_signed_by_arbitrator(&self, witness: &AccountAgeWitness) -> bool {
        self.witnesses
            .lock()
            .for_witness(&witness.hash)
            .into_iter()
            .any(|sw| {
                sw.is_signed_by_arbitrator()
                    && !self.is_owner_banned(sw)
                    && self.verify_signature(sw)
            })
    }

    /// The owner of `witness` may sign other accounts at `now`.
    pub fn is_signer_account_age_witness(&self, witness: &AccountAgeWitness, now: i64) -> bool {
        let witnesses = self.witnesses.lock();
        let signed = witnesses.for_witness(&witness.hash);
        signed
            .into_iter()
            .any(|sw| self.is_valid_signed_witness(&witnesses, sw, now, &mut Vec::new()))
    }

    pub fn is_sufficient_trade_amount_for_signing(&self, trade_amount: Amount) -> bool {
        trade_amount >= minimum_trade_amount_for_signing()
    }

    fn publish(&self, signed_witness: SignedWitness, is_rebroadcast: bool) -> Res<SignedWitness> {
        self.p2p.add_persistable_network_payload(
            NetworkPayload::SignedWitness(signed_witness.clone()),
            is_rebroadcast,
        )?;
        self.add_to_map(signed_witness.clone());
        info!(
            method = %signed_witness.verification_method,
            witness = %signed_witness.account_age_witness_hash.to_hex(),
            "Published signed witness"
        );
        Ok(signed_witness)
    }

    /// Arbitrator signature of `witness` on behalf of `owner_pub_key`. Returns `None` when the
    /// witness is already signed by an arbitrator.
    pub fn sign_and_publish_by_arbitrator(
        &self,
        witness: &AccountAgeWitness,
        arbitrator_key: &KeyRing,
        owner_pub_key: Vec<u8>,
        time: i64,
    ) -> Res<Option<SignedWitness>> {
        if self.is_signed_by_arbitrator(witness) {
            warn!(
                witness = %witness.hash.to_hex(),
                "Arbitrator trying to sign already signed account age witness"
            );
            return Ok(None);
        }
        let signed_witness = SignedWitness {
            verification_method: VerificationMethod::Arbitrator,
            account_age_witness_hash: witness.hash,
            signature: arbitrator_key.sign(witness.hash.as_bytes())?,
            signer_pub_key: arbitrator_key.pub_key_ring().signature_pub_key_bytes(),
            witness_owner_pub_key: owner_pub_key,
            date: time,
            trade_amount: Amount::from_pico(0),
        };
        self.publish(signed_witness, false).map(Some)
    }

    /// Arbitrator signature of a trader's public key when the witness of the trader is unknown.
    /// The placeholder witness is dated so the trader is a signer for children signed at
    /// `child_sign_time`.
    pub fn sign_trader_pub_key(
        &self,
        arbitrator_key: &KeyRing,
        peers_pub_key: Vec<u8>,
        child_sign_time: i64,
    ) -> Res<Option<SignedWitness>> {
        let time = child_sign_time - SIGNER_AGE - DAY_MILLIS;
        let witness = AccountAgeWitness::new(WitnessHash::from(hash160(&peers_pub_key)), time);
        self.sign_and_publish_by_arbitrator(&witness, arbitrator_key, peers_pub_key, time)
    }

    /// Trader signature of a peer's witness after a trade. Returns `None` when the witness is
    /// already signed or the trade amount is too small.
    pub fn sign_and_publish_by_trader(
        &self,
        witness: &AccountAgeWitness,
        trade_amount: Amount,
        peers_pub_key: Vec<u8>,
    ) -> Res<Option<SignedWitness>> {
        if self.is_signed_account_age_witness(witness) {
            debug!(witness = %witness.hash.to_hex(), "Peer's witness is already signed");
            return Ok(None);
        }
        if !self.is_sufficient_trade_amount_for_signing(trade_amount) {
            info!(
                witness = %witness.hash.to_hex(),
                %trade_amount,
                "Trade amount too small to sign the peer's witness"
            );
            return Ok(None);
        }
        self.sign_as_trader(witness, trade_amount, peers_pub_key).map(Some)
    }

    /// Sign one of our own witnesses with our key, used for accounts held by the same owner.
    pub fn self_sign_and_publish(&self, witness: &AccountAgeWitness) -> Res<SignedWitness> {
        let own_pub_key = self.key_ring.pub_key_ring().signature_pub_key_bytes();
        self.sign_as_trader(witness, minimum_trade_amount_for_signing(), own_pub_key)
    }

    fn sign_as_trader(
        &self,
        witness: &AccountAgeWitness,
        trade_amount: Amount,
        owner_pub_key: Vec<u8>,
    ) -> Res<SignedWitness> {
        let signed_witness = SignedWitness {
            verification_method: VerificationMethod::Trade,
            account_age_witness_hash: witness.hash,
            signature: self.key_ring.sign(witness.hash.as_bytes())?,
            signer_pub_key: self.key_ring.pub_key_ring().signature_pub_key_bytes(),
            witness_owner_pub_key: owner_pub_key,
            date: self.clock.now_millis(),
            trade_amount,
        };
        self.publish(signed_witness, false)
    }

    /// Republish a signed witness we own. Returns `false` if it is not ours or not valid.
    pub fn publish_own_signed_witness(&self, signed_witness: SignedWitness) -> Res<bool> {
        let own_pub_key = self.key_ring.pub_key_ring().signature_pub_key_bytes();
        if signed_witness.witness_owner_pub_key != own_pub_key
            || !self.verify_signature(&signed_witness)
        {
            return Ok(false);
        }
        self.publish(signed_witness, true)?;
        Ok(true)
    }

    /// Signed witnesses whose signer owns no signed witness. Arbitrator signed witnesses are
    /// roots by construction and only included with `include_signed_for_orphans`, the others
    /// are orphans.
    pub fn root_signed_witness_set(&self, include_signed_for_orphans: bool) -> Vec<SignedWitness> {
        let witnesses = self.witnesses.lock();
        witnesses
            .map
            .values()
            .filter(|sw| witnesses.for_owner(&sw.signer_pub_key, &[]).is_empty())
            .filter(|sw| {
                include_signed_for_orphans || sw.verification_method == VerificationMethod::Trade
            })
            .cloned()
            .collect()
    }

    /// Oldest root signed witness per signer without a signed witness of its own.
    pub fn unsigned_signer_pub_keys(&self) -> Vec<SignedWitness> {
        let mut oldest: HashMap<Vec<u8>, SignedWitness> = HashMap::new();
        for sw in self.root_signed_witness_set(true) {
            match oldest.get(&sw.signer_pub_key) {
                Some(current) if current.date <= sw.date => {}
                _ => {
                    oldest.insert(sw.signer_pub_key.clone(), sw);
                }
            }
        }
        oldest.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mock::{key, BanAll, Gossip};
    use crate::services::NoFilter;

    const NOW: i64 = 1_700_000_000_000;

    fn service(owner: &KeyRing, filter: Arc<dyn Filter>) -> SignedWitnessService {
        SignedWitnessService::new(
            Arc::new(owner.clone()),
            Arc::new(Gossip::default()),
            filter,
            Arc::new(ManualClock::new(NOW)),
        )
    }

    fn witness(byte: u8) -> AccountAgeWitness {
        AccountAgeWitness::new(WitnessHash::from([byte; 20]), NOW - days(400))
    }

    #[test]
    fn arbitrator_signature_requires_registered_key() {
        let arbitrator = key(1);
        let trader = key(2);
        let svc = service(&trader, Arc::new(NoFilter));
        let w = witness(7);
        let sw = svc
            .sign_and_publish_by_arbitrator(
                &w,
                &arbitrator,
                trader.pub_key_ring().signature_pub_key_bytes(),
                NOW,
            )
            .unwrap()
            .unwrap();
        assert!(!svc.verify_signature(&sw));
        assert!(!svc.is_signed_by_arbitrator(&w));

        svc.register_arbitrator_key(arbitrator.pub_key_ring().signature_pub_key_bytes());
        assert!(svc.verify_signature(&sw));
        assert!(svc.is_signed_by_arbitrator(&w));
        assert!(svc.is_signer_account_age_witness(&w, NOW));
        assert_eq!(svc.verified_witness_date_list(&w), vec![NOW]);
        // second arbitrator signature is refused
        assert!(svc
            .sign_and_publish_by_arbitrator(&w, &arbitrator, vec![], NOW)
            .unwrap()
            .is_none());
    }

    #[test]
    fn peer_signer_needs_thirty_days() {
        let arbitrator = key(1);
        let signer = key(2);
        let svc = service(&signer, Arc::new(NoFilter));
        svc.register_arbitrator_key(arbitrator.pub_key_ring().signature_pub_key_bytes());
        let signer_pub = signer.pub_key_ring().signature_pub_key_bytes();

        let signer_witness = witness(1);
        svc.sign_and_publish_by_arbitrator(&signer_witness, &arbitrator, signer_pub, NOW - days(45))
            .unwrap();

        // signed now by the signer, its own signature is 45 days old
        let peer_witness = witness(2);
        let sw = svc
            .sign_and_publish_by_trader(
                &peer_witness,
                minimum_trade_amount_for_signing(),
                vec![3; 33],
            )
            .unwrap()
            .unwrap();
        assert_eq!(sw.date, NOW);
        assert!(svc.is_signed_account_age_witness(&peer_witness));
        // the peer is signed but not a signer yet
        assert!(!svc.is_signer_account_age_witness(&peer_witness, NOW));
        assert!(svc.is_signer_account_age_witness(&peer_witness, NOW + SIGNER_AGE));
    }

    fn trade_sign(
        signer: &KeyRing,
        w: &AccountAgeWitness,
        owner: Vec<u8>,
        date: i64,
    ) -> SignedWitness {
        SignedWitness {
            verification_method: VerificationMethod::Trade,
            account_age_witness_hash: w.hash,
            signature: signer.sign(w.hash.as_bytes()).unwrap(),
            signer_pub_key: signer.pub_key_ring().signature_pub_key_bytes(),
            witness_owner_pub_key: owner,
            date,
            trade_amount: minimum_trade_amount_for_signing(),
        }
    }

    #[test]
    fn young_peer_signer_does_not_verify() {
        let arbitrator = key(1);
        let a = key(2);
        let b = key(3);
        let svc = service(&a, Arc::new(NoFilter));
        svc.register_arbitrator_key(arbitrator.pub_key_ring().signature_pub_key_bytes());
        let a_pub = a.pub_key_ring().signature_pub_key_bytes();
        let b_pub = b.pub_key_ring().signature_pub_key_bytes();
        svc.sign_and_publish_by_arbitrator(&witness(1), &arbitrator, a_pub, NOW - days(100))
            .unwrap();
        assert!(svc.add_to_map(trade_sign(&a, &witness(2), b_pub, NOW - days(10))));
        assert!(svc.add_to_map(trade_sign(&b, &witness(3), vec![9; 33], NOW)));
        assert!(svc.is_signed_account_age_witness(&witness(2)));
        // b signed only 10 days after being signed itself
        assert!(svc.verified_witness_date_list(&witness(3)).is_empty());
    }

    #[test]
    fn small_trades_do_not_sign() {
        let svc = service(&key(2), Arc::new(NoFilter));
        let small = Amount::from_pico(minimum_trade_amount_for_signing().as_pico() - 1);
        assert!(svc
            .sign_and_publish_by_trader(&witness(2), small, vec![3; 33])
            .unwrap()
            .is_none());
        assert!(svc.is_empty());
    }

    #[test]
    fn banned_owner_is_never_valid() {
        let arbitrator = key(1);
        let svc = service(&key(2), Arc::new(BanAll));
        svc.register_arbitrator_key(arbitrator.pub_key_ring().signature_pub_key_bytes());
        let w = witness(1);
        svc.sign_and_publish_by_arbitrator(&w, &arbitrator, vec![5; 33], NOW).unwrap();
        assert!(svc.is_filtered_witness(&w));
        assert!(!svc.is_signed_by_arbitrator(&w));
        assert!(!svc.is_signer_account_age_witness(&w, NOW));
    }

    #[test]
    fn orphans_and_unsigned_signers() {
        let arbitrator = key(1);
        let signer = key(2);
        let svc = service(&signer, Arc::new(NoFilter));
        svc.register_arbitrator_key(arbitrator.pub_key_ring().signature_pub_key_bytes());
        svc.sign_and_publish_by_trader(&witness(4), minimum_trade_amount_for_signing(), vec![3; 33])
            .unwrap();
        let orphans = svc.root_signed_witness_set(false);
        assert_eq!(orphans.len(), 1);
        assert_eq!(svc.unsigned_signer_pub_keys().len(), 1);

        // the arbitrator signs the signer, the chain gets its root back
        svc.sign_trader_pub_key(
            &arbitrator,
            signer.pub_key_ring().signature_pub_key_bytes(),
            NOW,
        )
        .unwrap();
        assert!(svc.root_signed_witness_set(false).is_empty());
        assert_eq!(svc.root_signed_witness_set(true).len(), 1);
        assert!(svc.is_signed_account_age_witness(&witness(4)));
    }

    #[test]
    fn self_signature_alone_does_not_verify() {
        let signer = key(2);
        let svc = service(&signer, Arc::new(NoFilter));
        let w = witness(9);
        svc.self_sign_and_publish(&w).unwrap();
        // owner and signer are the same key, the walk stops on the excluded signer
        assert!(!svc.is_signed_account_age_witness(&w));
    }
}
