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

//! In-memory collaborators shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use monero::Amount;
use parking_lot::Mutex;

use crate::crypto::KeyRing;
use crate::network::NodeAddress;
use crate::offer::OfferId;
use crate::payment::PaymentAccountPayload;
use crate::protocol::message::NetworkMessage;
use crate::services::{
    self, Filter, NetworkPayload, P2pNetwork, PayoutTx, Persistence, ReserveTxCheck, TxHandle,
    VerifiedTx, Wallet,
};

/// Records everything published and sent.
#[derive(Default)]
pub(crate) struct Gossip {
    pub payloads: Mutex<Vec<NetworkPayload>>,
    pub messages: Mutex<Vec<(NodeAddress, NetworkMessage)>>,
}

impl Gossip {
    pub fn published(&self) -> usize {
        self.payloads.lock().len()
    }
}

impl P2pNetwork for Gossip {
    fn add_persistable_network_payload(
        &self,
        payload: NetworkPayload,
        _: bool,
    ) -> Result<bool, services::Error> {
        self.payloads.lock().push(payload);
        Ok(true)
    }

    fn send_message(
        &self,
        peer: &NodeAddress,
        message: NetworkMessage,
    ) -> Result<(), services::Error> {
        self.messages.lock().push((peer.clone(), message));
        Ok(())
    }

    fn is_bootstrapped(&self) -> bool {
        true
    }
}

/// Bans everything.
pub(crate) struct BanAll;

impl Filter for BanAll {
    fn is_node_address_banned(&self, _: &NodeAddress) -> bool {
        true
    }
    fn is_witness_signer_pub_key_banned(&self, _: &str) -> bool {
        true
    }
    fn is_currency_banned(&self, _: &str) -> bool {
        true
    }
    fn is_payment_method_banned(&self, _: &str) -> bool {
        true
    }
    fn are_peers_payment_account_data_banned(&self, _: &PaymentAccountPayload) -> bool {
        true
    }
}

/// Deterministic key ring.
pub(crate) fn key(byte: u8) -> KeyRing {
    KeyRing::from_secret_bytes(&[byte; 32]).unwrap()
}

/// Persistence in a map, scheduled writes land immediately.
#[derive(Default)]
pub(crate) struct Memory {
    pub records: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl Persistence for Memory {
    fn request_persistence(&self, key: &str, record: Vec<u8>) {
        self.records.lock().insert(key.to_string(), record);
    }

    fn persist_now(&self, key: &str, record: Vec<u8>) -> Result<(), services::Error> {
        self.request_persistence(key, record);
        Ok(())
    }

    fn read_persisted(&self, key: &str) -> Result<Option<Vec<u8>>, services::Error> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<(), services::Error> {
        self.records.lock().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, services::Error> {
        Ok(self
            .records
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Wallet accepting every transaction, relayed hexes are recorded.
pub(crate) struct MockWallet {
    counter: AtomicU64,
    pub height: AtomicU64,
    /// Mining fee reported for verified reserve transactions, in piconero.
    pub reserve_fee: AtomicU64,
    pub relayed: Mutex<Vec<String>>,
}

impl Default for MockWallet {
    fn default() -> Self {
        Self {
            counter: AtomicU64::new(0),
            height: AtomicU64::new(1_000),
            reserve_fee: AtomicU64::new(1_000),
            relayed: Mutex::new(vec![]),
        }
    }
}

impl MockWallet {
    fn tx(&self, kind: &str) -> TxHandle {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        TxHandle {
            hash: format!("{}-hash-{}", kind, n),
            hex: format!("{}-hex-{}", kind, n),
            key: format!("{}-key-{}", kind, n),
            key_images: vec![format!("{}-image-{}", kind, n)],
            fee: Amount::from_pico(1_000),
        }
    }
}

impl Wallet for MockWallet {
    fn best_chain_height(&self) -> Result<u64, services::Error> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    fn payout_address(&self, offer_id: &OfferId) -> Result<String, services::Error> {
        Ok(format!("payout-{}", offer_id.short_id()))
    }

    fn create_reserve_tx(
        &self,
        _: Amount,
        _: Amount,
        _: Amount,
        _: &str,
    ) -> Result<TxHandle, services::Error> {
        Ok(self.tx("reserve"))
    }

    fn verify_reserve_tx(&self, check: &ReserveTxCheck) -> Result<VerifiedTx, services::Error> {
        Ok(VerifiedTx {
            hash: check.tx_hash.clone(),
            fee: Amount::from_pico(self.reserve_fee.load(Ordering::SeqCst)),
            key_images: check.key_images.clone(),
        })
    }

    fn create_deposit_tx(&self, _: &OfferId, _: &TxHandle) -> Result<TxHandle, services::Error> {
        Ok(self.tx("deposit"))
    }

    fn publish_deposit_txs(&self, deposit_tx_hexes: &[String]) -> Result<(), services::Error> {
        self.relayed.lock().extend_from_slice(deposit_tx_hexes);
        Ok(())
    }

    fn create_payout_tx(
        &self,
        _: &OfferId,
        _: &str,
        buyer_payout: Amount,
        _: &str,
        seller_payout: Amount,
    ) -> Result<PayoutTx, services::Error> {
        Ok(PayoutTx {
            hex: self.tx("payout").hex,
            buyer_payout,
            seller_payout,
        })
    }

    fn sign_and_publish_payout_tx(&self, payout_tx: &PayoutTx) -> Result<String, services::Error> {
        self.relayed.lock().push(payout_tx.hex.clone());
        Ok(format!("{}-hash", payout_tx.hex))
    }

    fn thaw_outputs(&self, _: &[String]) -> Result<(), services::Error> {
        Ok(())
    }
}
