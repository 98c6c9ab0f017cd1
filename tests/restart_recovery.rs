use std::fs;

use bitcoin::Amount;
use coinswap_taker::taker::{HopStatus, SwapParams, SwapStatus};

mod test_framework;
use test_framework::*;

use log::{info, warn};

/// The taker stops while its funded hop is locked. After a restart the swap is picked up from
/// the swap log. Running the recovery again from the same persisted state, as after a crash
/// right before the result was saved, finds the refund already on chain and changes nothing.
#[test]
fn test_recovery_after_restart_is_idempotent() {
    let framework = TestFramework::init(vec![
        (6102, MakerBehavior::Normal),
        (16102, MakerBehavior::VanishBeforeFunding),
    ]);
    warn!("🧪 Running Test: Recovery across restarts");

    let taker = framework.init_taker(test_config());
    fund_and_verify_taker(&framework, &taker, 2, Amount::from_sat(1_000_000));
    taker.sync_offerbook();

    let send_amount = Amount::from_sat(400_000);
    let err = taker
        .do_coinswap(SwapParams::new(send_amount, 2))
        .unwrap_err();
    let swap_id = err.report().unwrap().swap_id.clone();
    let locktime = taker.swap_record(&swap_id).unwrap().unwrap().attempt.hops[0]
        .terms
        .locktime;

    info!("🔁 Restarting the taker");
    drop(taker);
    let tracker_path = framework.taker_data_dir().join("swap_tracker.cbor");
    let crashed_state = fs::read(&tracker_path).unwrap();

    let taker = framework.init_taker(test_config());
    let record = taker.swap_record(&swap_id).unwrap().unwrap();
    assert_eq!(record.attempt.status, SwapStatus::Recovering);
    assert!(record.needs_recovery());
    assert_eq!(
        taker.get_balances().unwrap().swap,
        send_amount,
        "the funded hop is tracked again after restart"
    );

    framework.chain.mine_to(locktime);
    let outcomes = taker.recover_incomplete_swaps().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].complete);
    assert_eq!(outcomes[0].broadcast_txids.len(), 1);
    let first_pass = assert_no_coins_in_flight(&taker);
    let broadcasts = framework.chain.broadcasts().len();

    info!("💥 Replaying recovery from the pre-recovery swap log");
    drop(taker);
    fs::write(&tracker_path, crashed_state).unwrap();

    let taker = framework.init_taker(test_config());
    let outcomes = taker.recover_incomplete_swaps().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].complete);
    assert!(
        outcomes[0].broadcast_txids.is_empty(),
        "the refund is already on chain"
    );
    assert_eq!(framework.chain.broadcasts().len(), broadcasts);

    let record = taker.swap_record(&swap_id).unwrap().unwrap();
    assert_eq!(record.attempt.hops[0].status, HopStatus::Refunded);
    assert!(record.recovered);

    let second_pass = assert_no_coins_in_flight(&taker);
    assert_eq!(second_pass.spendable, first_pass.spendable);
    assert_eq!(second_pass.total, first_pass.total);
}

/// With the recovery loop running, the locked hop comes back by itself once its locktime is
/// mined.
#[test]
fn test_background_recovery_loop_refunds() {
    let framework = TestFramework::init(vec![
        (6102, MakerBehavior::Normal),
        (16102, MakerBehavior::VanishBeforeFunding),
    ]);
    warn!("🧪 Running Test: Background recovery loop");

    let taker = framework.init_taker(test_config());
    fund_and_verify_taker(&framework, &taker, 2, Amount::from_sat(1_000_000));
    taker.sync_offerbook();

    let err = taker
        .do_coinswap(SwapParams::new(Amount::from_sat(400_000), 2))
        .unwrap_err();
    let swap_id = err.report().unwrap().swap_id.clone();
    let locktime = taker.swap_record(&swap_id).unwrap().unwrap().attempt.hops[0]
        .terms
        .locktime;

    taker.start_recovery_loop().unwrap();
    framework.chain.mine_to(locktime);

    info!("⏳ Waiting for the recovery loop");
    assert!(wait_until(std::time::Duration::from_secs(10), || {
        taker
            .swap_record(&swap_id)
            .unwrap()
            .is_some_and(|record| record.recovered)
    }));
    assert_no_coins_in_flight(&taker);
}
