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

//! Account age witnesses. A witness proves a payment account with a given fingerprint existed
//! at a given date without revealing the account details.
//!
//! ## Witness hash
//!
//! ```text
//! hash = RIPEMD160(SHA256(age_witness_input_data | salt | signature_pub_key))
//! ```
//!
//! The concatenation is order sensitive, the salt hides the account fingerprint from peers
//! that do not receive the payload and the public key binds the witness to its owner.
//!
//! Witnesses are content addressed and append only: the first witness stored for a hash wins,
//! a witness is never modified nor deleted.

use std::fmt;
use std::io;

use crate::clock::DAY_MILLIS;
use crate::consensus::{self, Decodable, Encodable};
use crate::crypto::{hash160, PubKeyRing};
use crate::payment::PaymentAccountPayload;

pub mod service;
pub mod signed;
pub mod store;

pub use service::{AccountAgeWitnessService, SignState};
pub use store::WitnessStore;

/// Release of the account age witness feature, 2017-11-11 00:00 UTC. Witnesses dated before
/// this date (minus one day of clock skew) are forged.
pub const RELEASE: i64 = 1_510_358_400_000;

/// Witnesses created before 2019-03-01 00:00 UTC predate the trade limit schedule and are
/// considered mature.
pub const SAFE_ACCOUNT_AGE_DATE: i64 = 1_551_398_400_000;

fixed_hash::construct_fixed_hash!(
    /// Hash identifying an account age witness, see the module documentation.
    pub struct WitnessHash(20);
);

impl WitnessHash {
    /// Hash of the witness of `payload` owned by `pub_key_ring`.
    pub fn compute(payload: &PaymentAccountPayload, pub_key_ring: &PubKeyRing) -> Self {
        witness_hash(
            &payload.age_witness_input_data,
            &payload.salt,
            &pub_key_ring.signature_pub_key_bytes(),
        )
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Parse a hex encoded hash, `None` if the input is not exactly 20 hex encoded bytes.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; 20] = bytes.as_slice().try_into().ok()?;
        Some(Self::from(array))
    }
}

/// `hash160(input_data | salt | pub_key)`.
pub fn witness_hash(input_data: &[u8], salt: &[u8], pub_key: &[u8]) -> WitnessHash {
    let mut data = Vec::with_capacity(input_data.len() + salt.len() + pub_key.len());
    data.extend_from_slice(input_data);
    data.extend_from_slice(salt);
    data.extend_from_slice(pub_key);
    WitnessHash::from(hash160(&data))
}

impl Encodable for WitnessHash {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.to_fixed_bytes().consensus_encode(writer)
    }
}

impl Decodable for WitnessHash {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        let bytes: [u8; 20] = Decodable::consensus_decode(d)?;
        Ok(Self::from(bytes))
    }
}

impl_strict_encoding!(WitnessHash);

/// Proof that an account existed at `date`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountAgeWitness {
    pub hash: WitnessHash,
    /// Creation date in unix milliseconds.
    pub date: i64,
}

impl AccountAgeWitness {
    pub fn new(hash: WitnessHash, date: i64) -> Self {
        Self { hash, date }
    }

    /// A witness dated more than one day away from `now` is not republished.
    pub fn is_date_in_tolerance(&self, now: i64) -> bool {
        (now - self.date).abs() <= DAY_MILLIS
    }
}

impl fmt::Display for AccountAgeWitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountAgeWitness({}, {})", self.hash.to_hex(), self.date)
    }
}

impl Encodable for AccountAgeWitness {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        Ok(self.hash.consensus_encode(writer)? + self.date.consensus_encode(writer)?)
    }
}

impl Decodable for AccountAgeWitness {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self {
            hash: Decodable::consensus_decode(d)?,
            date: Decodable::consensus_decode(d)?,
        })
    }
}

impl_strict_encoding!(AccountAgeWitness);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyRing;

    #[test]
    fn hash_is_order_sensitive_concatenation() {
        let key_ring = KeyRing::from_secret_bytes(&[0x11; 32]).unwrap();
        let payload = PaymentAccountPayload::with_salt(
            "acc",
            "SEPA",
            b"DE89370400440532013000".to_vec(),
            vec![0xaa; 32],
            None,
        );
        let mut data = payload.age_witness_input_data.clone();
        data.extend_from_slice(&payload.salt);
        data.extend_from_slice(&key_ring.pub_key_ring().signature_pub_key_bytes());
        let expected = WitnessHash::from(hash160(&data));
        assert_eq!(WitnessHash::compute(&payload, key_ring.pub_key_ring()), expected);

        let swapped = witness_hash(
            &payload.salt,
            &payload.age_witness_input_data,
            &key_ring.pub_key_ring().signature_pub_key_bytes(),
        );
        assert_ne!(swapped, expected);
    }

    #[test]
    fn hex_parsing() {
        let hash = WitnessHash::from([0x42; 20]);
        assert_eq!(WitnessHash::from_hex(&hash.to_hex()), Some(hash));
        assert_eq!(WitnessHash::from_hex("4242"), None);
        assert_eq!(WitnessHash::from_hex("zz"), None);
    }

    #[test]
    fn date_tolerance() {
        let witness = AccountAgeWitness::new(WitnessHash::zero(), 10 * DAY_MILLIS);
        assert!(witness.is_date_in_tolerance(11 * DAY_MILLIS));
        assert!(witness.is_date_in_tolerance(9 * DAY_MILLIS));
        assert!(!witness.is_date_in_tolerance(11 * DAY_MILLIS + 1));
    }
}
