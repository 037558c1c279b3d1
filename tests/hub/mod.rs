use dex_core::clock::{days, Clock, ManualClock};
use dex_core::config::Config;
use dex_core::crypto::KeyRing;
use dex_core::dispute::DisputeList;
use dex_core::manager::TradeManager;
use dex_core::network::{Network, NodeAddress, TRADE_PROTOCOL_VERSION};
use dex_core::offer::{
    Offer, OfferDirection, OfferId, OfferPrice, OfferState, ACCOUNT_AGE_WITNESS_HASH,
};
use dex_core::payment::{PaymentAccount, PaymentAccountPayload, SEPA};
use dex_core::protocol::message::NetworkMessage;
use dex_core::restrictions::{Ppm, PICO_PER_XMR};
use dex_core::services::{
    self, NetworkPayload, NoFilter, P2pNetwork, PayoutTx, Persistence, ReserveTxCheck, Services,
    TxHandle, VerifiedTx, Wallet,
};
use dex_core::witness::signed::SignedWitnessService;
use dex_core::witness::AccountAgeWitnessService;

use monero::Amount;
use parking_lot::Mutex;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub const START: i64 = 1_700_000_000_000;

lazy_static::lazy_static! {
    pub static ref ARBITRATOR_KEY: Arc<KeyRing> =
        Arc::new(KeyRing::from_secret_bytes(&[0x09; 32]).unwrap());
    pub static ref ARBITRATOR: NodeAddress = NodeAddress::new("arbitrator.onion", 9999);
}

pub fn xmr(pico: u64) -> Amount {
    Amount::from_pico(pico)
}

/// Messages and payloads in flight, delivered by [`Net::flush`].
#[derive(Default)]
pub struct Hub {
    messages: Mutex<VecDeque<(NodeAddress, NetworkMessage)>>,
    payloads: Mutex<VecDeque<NetworkPayload>>,
}

impl P2pNetwork for Hub {
    fn add_persistable_network_payload(
        &self,
        payload: NetworkPayload,
        _is_rebroadcast: bool,
    ) -> Result<bool, services::Error> {
        self.payloads.lock().push_back(payload);
        Ok(true)
    }

    fn send_message(
        &self,
        peer: &NodeAddress,
        message: NetworkMessage,
    ) -> Result<(), services::Error> {
        self.messages.lock().push_back((peer.clone(), message));
        Ok(())
    }

    fn is_bootstrapped(&self) -> bool {
        true
    }
}

#[derive(Default)]
pub struct Store {
    pub records: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl Persistence for Store {
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

/// Wallet of one node, transactions are named after the node.
pub struct TestWallet {
    name: &'static str,
    counter: AtomicU64,
    pub relayed: Mutex<Vec<String>>,
    pub thawed: Mutex<Vec<String>>,
    pub refuse_deposits: AtomicBool,
}

impl TestWallet {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            counter: AtomicU64::new(0),
            relayed: Mutex::new(vec![]),
            thawed: Mutex::new(vec![]),
            refuse_deposits: AtomicBool::new(false),
        }
    }

    pub fn tx(&self, kind: &str) -> TxHandle {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        TxHandle {
            hash: format!("{}-{}-hash-{}", self.name, kind, n),
            hex: format!("{}-{}-hex-{}", self.name, kind, n),
            key: format!("{}-{}-key-{}", self.name, kind, n),
            key_images: vec![format!("{}-{}-image-{}", self.name, kind, n)],
            fee: xmr(1_000_000),
        }
    }
}

impl Wallet for TestWallet {
    fn best_chain_height(&self) -> Result<u64, services::Error> {
        Ok(3_000_000)
    }

    fn payout_address(&self, offer_id: &OfferId) -> Result<String, services::Error> {
        Ok(format!("{}-payout-{}", self.name, offer_id.short_id()))
    }

    fn create_reserve_tx(
        &self,
        _trade_fee: Amount,
        _send_amount: Amount,
        _security_deposit: Amount,
        _return_address: &str,
    ) -> Result<TxHandle, services::Error> {
        Ok(self.tx("reserve"))
    }

    fn verify_reserve_tx(&self, check: &ReserveTxCheck) -> Result<VerifiedTx, services::Error> {
        if check.tx_hex.is_empty() {
            return Err(services::Error::Wallet("empty reserve tx".into()));
        }
        Ok(VerifiedTx {
            hash: check.tx_hash.clone(),
            fee: xmr(1_000_000),
            key_images: check.key_images.clone(),
        })
    }

    fn create_deposit_tx(
        &self,
        _offer_id: &OfferId,
        _reserve_tx: &TxHandle,
    ) -> Result<TxHandle, services::Error> {
        Ok(self.tx("deposit"))
    }

    fn publish_deposit_txs(&self, deposit_tx_hexes: &[String]) -> Result<(), services::Error> {
        if self.refuse_deposits.load(Ordering::SeqCst) {
            return Err(services::Error::Wallet("double spend".into()));
        }
        self.relayed.lock().extend_from_slice(deposit_tx_hexes);
        Ok(())
    }

    fn create_payout_tx(
        &self,
        _offer_id: &OfferId,
        _buyer_payout_address: &str,
        buyer_payout: Amount,
        _seller_payout_address: &str,
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

    fn thaw_outputs(&self, key_images: &[String]) -> Result<(), services::Error> {
        self.thawed.lock().extend_from_slice(key_images);
        Ok(())
    }
}

pub struct Node {
    pub address: NodeAddress,
    pub key_ring: Arc<KeyRing>,
    pub wallet: Arc<TestWallet>,
    pub store: Arc<Store>,
    pub witness: Arc<AccountAgeWitnessService>,
    pub disputes: Arc<DisputeList>,
    pub manager: TradeManager,
}

impl Node {
    fn new(
        name: &'static str,
        address: NodeAddress,
        key_ring: Arc<KeyRing>,
        hub: &Arc<Hub>,
        clock: &Arc<ManualClock>,
    ) -> Self {
        let config = Config {
            network: Network::Local,
            ..Config::default()
        };
        let clock: Arc<dyn Clock> = clock.clone();
        let p2p: Arc<dyn P2pNetwork> = hub.clone();
        let wallet = Arc::new(TestWallet::new(name));
        let store = Arc::new(Store::default());
        let services = Services {
            wallet: wallet.clone(),
            p2p: p2p.clone(),
            persistence: store.clone(),
            filter: Arc::new(NoFilter),
        };
        let signed = Arc::new(SignedWitnessService::new(
            key_ring.clone(),
            p2p.clone(),
            Arc::new(NoFilter),
            clock.clone(),
        ));
        signed.register_arbitrator_key(ARBITRATOR_KEY.pub_key_ring().signature_pub_key_bytes());
        let witness = Arc::new(AccountAgeWitnessService::new(
            key_ring.clone(),
            p2p.clone(),
            Arc::new(NoFilter),
            clock.clone(),
            signed,
            config.witness_cache_capacity,
        ));
        let disputes = Arc::new(DisputeList::new(
            key_ring.clone(),
            address.clone(),
            p2p,
            store.clone(),
            config.network_context(),
            clock.clone(),
        ));
        let manager = TradeManager::new(
            &config,
            key_ring.clone(),
            address.clone(),
            services,
            witness.clone(),
            disputes.clone(),
            clock,
        );
        Self {
            address,
            key_ring,
            wallet,
            store,
            witness,
            disputes,
            manager,
        }
    }

    pub fn sepa_account(&self, id: &str) -> PaymentAccount {
        PaymentAccount::new(
            id,
            vec!["EUR".into()],
            START - days(400),
            PaymentAccountPayload::with_salt(
                id,
                SEPA.id,
                format!("DE89 3704 0044 0532 0130 00 {}", id).into_bytes(),
                vec![0x2a; 32],
                Some("Account Holder".into()),
            ),
        )
    }
}

/// A maker, a taker and the arbitrator sharing one clock and one hub.
pub struct Net {
    pub hub: Arc<Hub>,
    pub clock: Arc<ManualClock>,
    pub maker: Node,
    pub taker: Node,
    pub arbitrator: Node,
}

impl Net {
    pub fn new() -> Self {
        let hub = Arc::new(Hub::default());
        let clock = Arc::new(ManualClock::new(START));
        let maker = Node::new(
            "maker",
            NodeAddress::new("maker.onion", 9999),
            Arc::new(KeyRing::from_secret_bytes(&[0x01; 32]).unwrap()),
            &hub,
            &clock,
        );
        let taker = Node::new(
            "taker",
            NodeAddress::new("taker.onion", 9999),
            Arc::new(KeyRing::from_secret_bytes(&[0x02; 32]).unwrap()),
            &hub,
            &clock,
        );
        let arbitrator = Node::new(
            "arbitrator",
            ARBITRATOR.clone(),
            ARBITRATOR_KEY.clone(),
            &hub,
            &clock,
        );
        Self {
            hub,
            clock,
            maker,
            taker,
            arbitrator,
        }
    }

    fn nodes(&self) -> [&Node; 3] {
        [&self.maker, &self.taker, &self.arbitrator]
    }

    /// Deliver everything in flight, payloads first, until the hub is idle. Returns the errors
    /// of the receiving nodes.
    pub fn flush(&self) -> Vec<dex_core::Error> {
        let mut errors = vec![];
        loop {
            let payload = self.hub.payloads.lock().pop_front();
            if let Some(payload) = payload {
                for node in self.nodes() {
                    match &payload {
                        NetworkPayload::TradeStatistics(statistics) => {
                            node.manager.statistics().add(statistics.clone()).unwrap();
                        }
                        other => {
                            node.witness.on_payload_received(other.clone());
                        }
                    }
                }
                continue;
            }
            let message = self.hub.messages.lock().pop_front();
            match message {
                Some((to, message)) => {
                    let node = self
                        .nodes()
                        .into_iter()
                        .find(|node| node.address == to)
                        .expect("known node");
                    if let Err(e) = node.manager.handle_message(message) {
                        errors.push(e);
                    }
                }
                None => break,
            }
        }
        errors
    }

    /// A SEPA offer of 1 XMR at 150 EUR, placed by the maker with its reserve transaction.
    pub fn place_offer(&self, direction: OfferDirection) -> (Offer, PaymentAccount) {
        let account = self.maker.sepa_account("maker-sepa");
        self.maker
            .witness
            .publish_my_account_age_witness(&account.payload)
            .unwrap();
        let reserve_tx = self.maker.wallet.tx("reserve");
        let offer = Offer {
            id: OfferId::random(),
            date: START,
            owner_node_address: self.maker.address.clone(),
            pub_key_ring: *self.maker.key_ring.pub_key_ring(),
            direction,
            price: OfferPrice::Fixed(150_0000_0000),
            amount: xmr(PICO_PER_XMR),
            min_amount: xmr(PICO_PER_XMR / 10),
            counter_currency_code: "EUR".into(),
            payment_method_id: SEPA.id.into(),
            maker_payment_account_id: account.id().to_string(),
            maker_fee_pct: Ppm(1_500),
            taker_fee_pct: Ppm(7_500),
            penalty_fee_pct: Ppm(250_000),
            buyer_security_deposit_pct: Ppm(150_000),
            seller_security_deposit_pct: Ppm(150_000),
            max_trade_limit: SEPA.max_trade_limit(),
            max_trade_period: SEPA.max_trade_period,
            protocol_version: TRADE_PROTOCOL_VERSION,
            challenge_hash: None,
            reserve_tx_key_images: reserve_tx.key_images.clone(),
            arbitrator_signer: Some(ARBITRATOR.clone()),
            extra_data: vec![(
                ACCOUNT_AGE_WITNESS_HASH.into(),
                self.maker.witness.get_my_witness_hash_hex(&account.payload),
            )],
            state: OfferState::Available,
            error_message: None,
        };
        self.maker
            .manager
            .place_offer(offer.clone(), account.clone(), Some(reserve_tx))
            .unwrap();
        (offer, account)
    }

    /// The taker's account with its witness published.
    pub fn taker_account(&self) -> PaymentAccount {
        let account = self.taker.sepa_account("taker-sepa");
        self.taker
            .witness
            .publish_my_account_age_witness(&account.payload)
            .unwrap();
        account
    }

    /// Move every open trade of every node to unlocked deposits.
    pub fn unlock_deposits(&self, id: &OfferId) {
        for node in self.nodes() {
            node.manager.on_deposits_confirmed(id).unwrap();
            node.manager.on_deposits_unlocked(id).unwrap();
        }
    }
}
