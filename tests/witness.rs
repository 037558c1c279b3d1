use dex_core::clock::{days, Clock};
use dex_core::crypto::KeyRing;
use dex_core::offer::OfferDirection;
use dex_core::restrictions::PICO_PER_XMR;
use dex_core::services::{NetworkPayload, P2pNetwork};
use dex_core::trade::TradePhase;
use dex_core::witness::signed::{SignedWitness, VerificationMethod};
use dex_core::witness::{AccountAgeWitness, WitnessHash};
use dex_core::Error;

mod hub;

use hub::{xmr, Net, ARBITRATOR_KEY, START};

/// Sign the taker's witness through a signer whose own witness the arbitrator signed, then
/// let `sign_age` elapse.
fn signed_taker(net: &Net, sign_age: i64) -> dex_core::payment::PaymentAccount {
    let account = net.taker_account();
    let taker_witness = net.taker.witness.get_my_witness(&account.payload);

    let signer = KeyRing::from_secret_bytes(&[0x07; 32]).unwrap();
    let signer_pub_key = signer.pub_key_ring().signature_pub_key_bytes();
    let signer_witness = AccountAgeWitness::new(WitnessHash::from([7; 20]), START - days(200));
    net.arbitrator
        .witness
        .arbitrator_sign_account_age_witness(
            &signer_witness,
            &ARBITRATOR_KEY,
            signer_pub_key.clone(),
            START,
        )
        .unwrap();

    let sign_date = START + days(1);
    let signed = SignedWitness {
        verification_method: VerificationMethod::Trade,
        account_age_witness_hash: taker_witness.hash,
        signature: signer.sign(taker_witness.hash.as_bytes()).unwrap(),
        signer_pub_key,
        witness_owner_pub_key: net.taker.key_ring.pub_key_ring().signature_pub_key_bytes(),
        date: sign_date,
        trade_amount: xmr(PICO_PER_XMR / 10),
    };
    net.hub
        .add_persistable_network_payload(NetworkPayload::SignedWitness(signed), false)
        .unwrap();
    net.clock.set(sign_date + sign_age);
    assert!(net.flush().is_empty());
    account
}

#[test]
fn young_signature_limits_buyer() {
    let net = Net::new();
    let (offer, _) = net.place_offer(OfferDirection::Sell);
    let account = signed_taker(&net, days(10));
    let taker_witness = net.taker.witness.get_my_witness(&account.payload);
    assert!(net
        .taker
        .witness
        .signed_witness_service()
        .is_signed_account_age_witness(&taker_witness));
    assert_eq!(
        net.taker
            .witness
            .get_my_trade_limit(&account, "EUR", OfferDirection::Buy, false),
        xmr(PICO_PER_XMR / 10)
    );

    let result = net
        .taker
        .manager
        .on_take_offer(&offer, xmr(9 * PICO_PER_XMR / 10), &account);
    assert!(matches!(result, Err(Error::Verification(_))));
    assert!(net.taker.manager.get_open_trades().is_empty());
    assert!(net.flush().is_empty());
    assert!(net.maker.manager.get_open_trades().is_empty());
}

#[test]
fn mature_signature_lifts_buyer_limit() {
    let net = Net::new();
    let (offer, _) = net.place_offer(OfferDirection::Sell);
    let account = signed_taker(&net, days(70));
    assert_eq!(
        net.taker
            .witness
            .get_my_trade_limit(&account, "EUR", OfferDirection::Buy, false),
        xmr(12 * PICO_PER_XMR)
    );

    net.taker
        .manager
        .on_take_offer(&offer, xmr(9 * PICO_PER_XMR / 10), &account)
        .unwrap();
    assert!(net.flush().is_empty());
    for node in [&net.maker, &net.taker, &net.arbitrator] {
        let trade = node.manager.get_trade(&offer.id).unwrap();
        assert_eq!(trade.phase, TradePhase::DepositsPublished);
        assert_eq!(trade.amount, xmr(9 * PICO_PER_XMR / 10));
    }
}

#[test]
fn half_limit_between_one_and_two_months() {
    let net = Net::new();
    let account = signed_taker(&net, days(45));
    assert_eq!(
        net.taker
            .witness
            .get_my_trade_limit(&account, "EUR", OfferDirection::Buy, false),
        xmr(6 * PICO_PER_XMR)
    );
    assert_eq!(
        net.taker
            .witness
            .get_my_trade_limit(&account, "EUR", OfferDirection::Sell, false),
        xmr(12 * PICO_PER_XMR)
    );
    assert!(net.clock.now_millis() > START);
}
