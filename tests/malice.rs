use bitcoin::Amount;
use coinswap_taker::{
    protocol::Offer,
    taker::{HopStatus, MakerHealth, SwapParams, SwapStatus, TakerError},
};

mod test_framework;
use test_framework::*;

use log::{info, warn};

/// A maker funds its outgoing hop with less than agreed. The taker notices before anything else
/// is funded, marks the maker malicious for good, and recovers its own hop.
#[test]
fn test_maker_underfunds_its_hop() {
    // The cheating maker takes position 0 and funds hop 1.
    let framework = TestFramework::init_with_offers(vec![
        (
            6102,
            Offer {
                base_fee: 100,
                ..default_offer()
            },
            MakerBehavior::BadFunding,
        ),
        (16102, default_offer(), MakerBehavior::Normal),
    ]);
    warn!("🧪 Running Test: Maker underfunds its outgoing hop");

    let taker = framework.init_taker(test_config());
    let org_balance = fund_and_verify_taker(&framework, &taker, 2, Amount::from_sat(1_000_000));
    taker.sync_offerbook();

    let err = taker
        .do_coinswap(SwapParams::new(Amount::from_sat(500_000), 2))
        .unwrap_err();
    match err.cause() {
        Some(TakerError::MakerProtocol { maker, hop, .. }) => {
            assert_eq!(maker, &framework.makers[0]);
            assert_eq!(*hop, 1);
        }
        other => panic!("expected MakerProtocol, got {other:?}"),
    }

    let report = err.report().unwrap();
    assert_eq!(report.status, SwapStatus::Recovering);
    assert!(report.failure_reason.is_some());

    // The next maker was never asked to fund.
    assert_eq!(framework.transport.calls_to(&framework.makers[1], "funding"), 0);

    info!("📊 Verifying maker health");
    let book = taker.fetch_offers();
    let cheater = book.find(&framework.makers[0]).unwrap();
    assert_eq!(cheater.health, MakerHealth::Malicious);
    assert!(book
        .good_makers()
        .iter()
        .all(|m| m.address != framework.makers[0]));

    info!("⛏️ Recovering the taker's hop");
    let record = taker.swap_record(&report.swap_id).unwrap().unwrap();
    let locktime = record.attempt.hops[0].terms.locktime;
    let funding_fee = record.attempt.taker_funding.as_ref().unwrap().fee;
    framework.chain.mine_to(locktime);
    assert!(taker.recover_incomplete_swaps().unwrap()[0].complete);

    let record = taker.swap_record(&report.swap_id).unwrap().unwrap();
    assert_eq!(record.attempt.hops[0].status, HopStatus::Refunded);
    let balances = assert_no_coins_in_flight(&taker);
    assert_eq!(
        balances.spendable,
        org_balance - funding_fee - record.attempt.contract_spend_fees
    );

    info!("🔁 Restarting the taker");
    drop(taker);
    let taker = framework.init_taker(test_config());
    let book = taker.sync_offerbook();
    assert_eq!(
        book.find(&framework.makers[0]).unwrap().health,
        MakerHealth::Malicious,
        "the mark survives restarts and offer refreshes"
    );
    assert_eq!(book.good_makers().len(), 1);
}
