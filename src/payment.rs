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

//! Payment methods, payment accounts and the account payload exchanged with peers.
//!
//! A payment method carries the two properties the trust engine cares about: whether payments
//! can be reversed by the payer (chargeback risk) and whether settlement happens on a
//! blockchain. The account payload carries the account age witness input data, the fields
//! identifying the account, and a random salt so the witness hash does not leak them.

use std::io;

use monero::Amount;
use rand::RngCore;

use crate::clock::days;
use crate::consensus::{self, Decodable, Encodable};
use crate::crypto::sha256;
use crate::restrictions::PICO_PER_XMR;

/// Payment rail with its trade limit and risk properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaymentMethod {
    pub id: &'static str,
    /// Time allowed to complete the payment, in milliseconds.
    pub max_trade_period: i64,
    max_trade_limit_pico: u64,
    chargeback_risk: bool,
    blockchain: bool,
}

const LIMIT_VERY_LOW_RISK: u64 = 100 * PICO_PER_XMR;
const LIMIT_LOW_RISK: u64 = 50 * PICO_PER_XMR;
const LIMIT_MID_RISK: u64 = 25 * PICO_PER_XMR;
const LIMIT_HIGH_RISK: u64 = 12 * PICO_PER_XMR;

macro_rules! payment_method {
    ($name: ident, $id: expr, $days: expr, $limit: expr, $chargeback: expr, $blockchain: expr) => {
        pub const $name: PaymentMethod = PaymentMethod {
            id: $id,
            max_trade_period: days($days),
            max_trade_limit_pico: $limit,
            chargeback_risk: $chargeback,
            blockchain: $blockchain,
        };
    };
}

payment_method!(SEPA, "SEPA", 6, LIMIT_HIGH_RISK, true, false);
payment_method!(SEPA_INSTANT, "SEPA_INSTANT", 1, LIMIT_HIGH_RISK, true, false);
payment_method!(ZELLE, "ZELLE", 4, LIMIT_HIGH_RISK, true, false);
payment_method!(REVOLUT, "REVOLUT", 1, LIMIT_HIGH_RISK, true, false);
payment_method!(CASH_APP, "CASH_APP", 1, LIMIT_HIGH_RISK, true, false);
payment_method!(PAYPAL, "PAYPAL", 1, LIMIT_HIGH_RISK, true, false);
payment_method!(SWISH, "SWISH", 1, LIMIT_LOW_RISK, false, false);
payment_method!(F2F, "F2F", 4, LIMIT_LOW_RISK, false, false);
payment_method!(CASH_DEPOSIT, "CASH_DEPOSIT", 4, LIMIT_MID_RISK, false, false);
payment_method!(BLOCK_CHAINS, "BLOCK_CHAINS", 1, LIMIT_VERY_LOW_RISK, false, true);

/// Every payment method known by this node.
pub const PAYMENT_METHODS: &[PaymentMethod] = &[
    SEPA,
    SEPA_INSTANT,
    ZELLE,
    REVOLUT,
    CASH_APP,
    PAYPAL,
    SWISH,
    F2F,
    CASH_DEPOSIT,
    BLOCK_CHAINS,
];

impl PaymentMethod {
    pub fn by_id(id: &str) -> Option<&'static PaymentMethod> {
        PAYMENT_METHODS.iter().find(|method| method.id == id)
    }

    pub fn max_trade_limit(&self) -> Amount {
        Amount::from_pico(self.max_trade_limit_pico)
    }

    /// The payer can reverse the payment after the monero has been released.
    pub fn has_chargeback_risk(&self) -> bool {
        self.chargeback_risk
    }

    /// Settled on a blockchain, the payment is final once confirmed.
    pub fn is_blockchain(&self) -> bool {
        self.blockchain
    }

    /// Chargeback risk for a given currency: cryptocurrencies never carry it.
    pub fn has_chargeback_risk_for(&self, currency_code: &str) -> bool {
        self.chargeback_risk && is_traditional_currency(currency_code)
    }
}

const CRYPTO_CURRENCIES: &[&str] = &[
    "XMR", "BTC", "BCH", "ETH", "LTC", "DAI-ERC20", "USDT-ERC20", "USDC-ERC20", "USDT-TRC20",
];

pub fn is_crypto_currency(currency_code: &str) -> bool {
    CRYPTO_CURRENCIES.contains(&currency_code)
}

/// Fiat and precious metals, three letter ISO-like codes that are not cryptocurrencies.
pub fn is_traditional_currency(currency_code: &str) -> bool {
    !is_crypto_currency(currency_code)
        && currency_code.len() == 3
        && currency_code.chars().all(|c| c.is_ascii_uppercase())
}

/// Account data sent to the counterparty, committed in the account age witness.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PaymentAccountPayload {
    pub id: String,
    pub payment_method_id: String,
    /// Fields identifying the account at the payment rail (IBAN, phone number, ...).
    pub age_witness_input_data: Vec<u8>,
    pub salt: Vec<u8>,
    pub holder_name: Option<String>,
}

impl PaymentAccountPayload {
    /// New payload with a random 32 bytes salt.
    pub fn new(
        id: impl Into<String>,
        payment_method_id: impl Into<String>,
        age_witness_input_data: Vec<u8>,
        holder_name: Option<String>,
    ) -> Self {
        let mut salt = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::with_salt(id, payment_method_id, age_witness_input_data, salt, holder_name)
    }

    pub fn with_salt(
        id: impl Into<String>,
        payment_method_id: impl Into<String>,
        age_witness_input_data: Vec<u8>,
        salt: Vec<u8>,
        holder_name: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            payment_method_id: payment_method_id.into(),
            age_witness_input_data,
            salt,
            holder_name,
        }
    }

    pub fn payment_method(&self) -> Option<&'static PaymentMethod> {
        PaymentMethod::by_id(&self.payment_method_id)
    }

    /// Hash committed in the contract, the payload itself is only revealed to the peer and
    /// the arbitrator.
    pub fn hash(&self) -> Result<[u8; 32], consensus::Error> {
        Ok(sha256(&consensus::serialize(self)?))
    }
}

impl std::fmt::Debug for PaymentAccountPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // account details stay out of logs
        f.debug_struct("PaymentAccountPayload")
            .field("id", &self.id)
            .field("payment_method_id", &self.payment_method_id)
            .finish()
    }
}

impl Encodable for PaymentAccountPayload {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.id.consensus_encode(s)?;
        len += self.payment_method_id.consensus_encode(s)?;
        len += self.age_witness_input_data.consensus_encode(s)?;
        len += self.salt.consensus_encode(s)?;
        Ok(len + self.holder_name.consensus_encode(s)?)
    }
}

impl Decodable for PaymentAccountPayload {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self {
            id: Decodable::consensus_decode(d)?,
            payment_method_id: Decodable::consensus_decode(d)?,
            age_witness_input_data: Decodable::consensus_decode(d)?,
            salt: Decodable::consensus_decode(d)?,
            holder_name: Decodable::consensus_decode(d)?,
        })
    }
}

/// Local payment account, wraps the payload shared with peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentAccount {
    pub account_name: String,
    pub trade_currencies: Vec<String>,
    pub creation_date: i64,
    /// Identifies accounts held by the same person at different payment rails, a signed
    /// account lends its signer status to unsigned accounts of the same owner.
    pub owner_id: Option<String>,
    pub payload: PaymentAccountPayload,
}

impl PaymentAccount {
    pub fn new(
        account_name: impl Into<String>,
        trade_currencies: Vec<String>,
        creation_date: i64,
        payload: PaymentAccountPayload,
    ) -> Self {
        Self {
            account_name: account_name.into(),
            trade_currencies,
            creation_date,
            owner_id: None,
            payload,
        }
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.payload.id
    }

    pub fn payment_method(&self) -> Option<&'static PaymentMethod> {
        self.payload.payment_method()
    }

    pub fn holder_name(&self) -> Option<&str> {
        self.payload.holder_name.as_deref()
    }

    pub fn supports_currency(&self, currency_code: &str) -> bool {
        self.trade_currencies.iter().any(|c| c == currency_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        assert_eq!(PaymentMethod::by_id("SEPA"), Some(&SEPA));
        assert!(PaymentMethod::by_id("CARRIER_PIGEON").is_none());
        assert!(SEPA.has_chargeback_risk());
        assert!(!F2F.has_chargeback_risk());
        assert!(BLOCK_CHAINS.is_blockchain());
    }

    #[test]
    fn chargeback_risk_depends_on_currency() {
        assert!(ZELLE.has_chargeback_risk_for("USD"));
        assert!(!ZELLE.has_chargeback_risk_for("BTC"));
        assert!(!SWISH.has_chargeback_risk_for("SEK"));
    }

    #[test]
    fn currency_kinds() {
        assert!(is_crypto_currency("BTC"));
        assert!(is_traditional_currency("EUR"));
        assert!(!is_traditional_currency("BTC"));
        assert!(!is_traditional_currency("eur"));
    }

    #[test]
    fn fresh_payloads_get_distinct_salts() {
        let a = PaymentAccountPayload::new("a", "SEPA", b"DE89".to_vec(), None);
        let b = PaymentAccountPayload::new("a", "SEPA", b"DE89".to_vec(), None);
        assert_eq!(a.salt.len(), 32);
        assert_ne!(a.salt, b.salt);
        let bytes = consensus::serialize(&a).unwrap();
        assert_eq!(consensus::deserialize::<PaymentAccountPayload>(&bytes).unwrap(), a);
    }
}
