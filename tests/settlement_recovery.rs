use bitcoin::Amount;
use coinswap_taker::{
    protocol::Offer,
    taker::{HopStatus, SwapParams, SwapStatus, TakerError},
};

mod test_framework;
use test_framework::*;

use log::{info, warn};

/// The maker takes the preimage and claims its incoming hop, but its acknowledgement never
/// arrives. The taker claims the hop paying it with the pre-signed claim and ends up exactly
/// where a completed swap would have left it.
#[test]
fn test_settlement_ack_lost() {
    let framework = TestFramework::init(vec![(6102, MakerBehavior::ClaimWithoutAck)]);
    warn!("🧪 Running Test: Settlement acknowledgement lost");

    let taker = framework.init_taker(test_config());
    let org_balance = fund_and_verify_taker(&framework, &taker, 2, Amount::from_sat(1_000_000));
    taker.sync_offerbook();

    let err = taker
        .do_coinswap(SwapParams::new(Amount::from_sat(500_000), 1))
        .unwrap_err();
    assert!(matches!(err.cause(), Some(TakerError::MakerTimeout { hop: 1, .. })));

    info!("📊 Verifying recovery through the claim path");
    let report = err.report().unwrap();
    assert_eq!(report.status, SwapStatus::Recovering);
    assert_eq!(report.hops_completed, 2);
    assert!(report.amount_received > 0);
    assert_eq!(
        report.amount_received + report.total_maker_fees + report.relay_mining_fee,
        report.target_amount
    );

    let record = taker.swap_record(&report.swap_id).unwrap().unwrap();
    assert!(record.recovered, "both taker hops are resolved right away");
    assert!(!record.needs_recovery());
    assert!(record
        .attempt
        .hops
        .iter()
        .all(|hop| hop.status == HopStatus::Settled));

    // The taker's claim is on chain.
    let incoming = record.attempt.hops[1].funding_outpoint.unwrap();
    let claim = record.attempt.hops[1].recovery_tx.as_ref().unwrap();
    assert_eq!(framework.chain.spender(&incoming), Some(claim.compute_txid()));

    let balances = assert_no_coins_in_flight(&taker);
    assert_eq!(
        balances.spendable,
        org_balance - Amount::from_sat(report.total_fee)
    );

    assert!(taker.recover_incomplete_swaps().unwrap().is_empty());
}

/// The last maker of a two maker route goes silent during settlement. The taker claims its
/// incoming hop and keeps settling with the first maker, who claims the taker's hop. The taker
/// ends up with the send amount minus fees, never with both hops.
#[test]
fn test_last_maker_silent_at_settlement() {
    // The cheaper maker takes position 0, the silent one is the last maker of the route.
    let framework = TestFramework::init_with_offers(vec![
        (
            6102,
            Offer {
                base_fee: 100,
                ..default_offer()
            },
            MakerBehavior::Normal,
        ),
        (16102, default_offer(), MakerBehavior::SilentAtSettlement),
    ]);
    warn!("🧪 Running Test: Last maker silent during settlement");

    let taker = framework.init_taker(test_config());
    let org_balance = fund_and_verify_taker(&framework, &taker, 2, Amount::from_sat(1_000_000));
    taker.sync_offerbook();

    let err = taker
        .do_coinswap(SwapParams::new(Amount::from_sat(500_000), 2))
        .unwrap_err();
    assert!(matches!(err.cause(), Some(TakerError::MakerTimeout { hop: 2, .. })));
    let report = err.report().unwrap();
    assert_eq!(report.status, SwapStatus::Recovering);

    info!("📊 Verifying the first maker got the secret");
    assert_eq!(framework.transport.calls_to(&framework.makers[0], "settlement"), 1);
    let record = taker.swap_record(&report.swap_id).unwrap().unwrap();
    let hops = &record.attempt.hops;
    assert!(record.attempt.preimage_revealed);
    assert_eq!(hops[2].status, HopStatus::Settled, "incoming hop claimed");
    assert_eq!(hops[0].status, HopStatus::Settled, "own hop claimed by the first maker");
    assert!(hops[1].preimage_delivered);
    assert!(!hops[2].preimage_delivered);
    assert!(record.recovered);

    let refund = hops[0].recovery_tx.as_ref().unwrap().compute_txid();
    let claimed_by = framework.chain.spender(&hops[0].funding_outpoint.unwrap());
    assert!(claimed_by.is_some_and(|txid| txid != refund));

    info!("⛏️ Mining past the refund locktime changes nothing");
    framework.chain.mine_to(hops[0].terms.locktime);
    assert!(taker.recover_incomplete_swaps().unwrap().is_empty());
    assert!(!framework.chain.broadcasts().contains(&refund));

    let balances = assert_no_coins_in_flight(&taker);
    assert_eq!(
        balances.spendable,
        org_balance - Amount::from_sat(report.total_fee)
    );
}

/// The only maker stays silent at settlement. The taker claims its incoming hop and keeps
/// offering the secret on every recovery pass instead of refunding its own hop. Once the maker
/// comes back it takes the secret and claims.
#[test]
fn test_secret_redelivered_until_maker_claims() {
    let framework = TestFramework::init(vec![(6102, MakerBehavior::SilentAtSettlement)]);
    warn!("🧪 Running Test: Secret re-delivered during recovery");

    let taker = framework.init_taker(test_config());
    let org_balance = fund_and_verify_taker(&framework, &taker, 2, Amount::from_sat(1_000_000));
    taker.sync_offerbook();

    let err = taker
        .do_coinswap(SwapParams::new(Amount::from_sat(500_000), 1))
        .unwrap_err();
    assert!(matches!(err.cause(), Some(TakerError::MakerTimeout { hop: 1, .. })));
    let report = err.report().unwrap().clone();
    let maker = &framework.makers[0];

    // Once during settlement, once more in the inline recovery pass.
    assert_eq!(framework.transport.calls_to(maker, "settlement"), 2);
    let record = taker.swap_record(&report.swap_id).unwrap().unwrap();
    assert_eq!(record.attempt.hops[1].status, HopStatus::Settled);
    assert_eq!(record.attempt.hops[0].status, HopStatus::Verified);
    assert!(!record.recovered);
    let own_hop = record.attempt.hops[0].funding_outpoint.unwrap();

    let outcomes = taker.recover_incomplete_swaps().unwrap();
    assert!(!outcomes[0].complete);
    assert!(outcomes[0].broadcast_txids.is_empty());
    assert_eq!(outcomes[0].pending[0].hop, 0);
    assert_eq!(framework.transport.calls_to(maker, "settlement"), 3);
    assert_eq!(framework.chain.spender(&own_hop), None);

    info!("🔄 The maker comes back online");
    framework.transport.set_behavior(maker, MakerBehavior::Normal);
    let outcomes = taker.recover_incomplete_swaps().unwrap();
    assert!(outcomes[0].complete);
    assert_eq!(framework.transport.calls_to(maker, "settlement"), 4);
    assert!(framework.chain.spender(&own_hop).is_some());

    let record = taker.swap_record(&report.swap_id).unwrap().unwrap();
    assert_eq!(record.attempt.hops[0].status, HopStatus::Settled);
    assert!(record.attempt.hops[1].preimage_delivered);
    assert!(record.recovered);

    let balances = assert_no_coins_in_flight(&taker);
    assert_eq!(
        balances.spendable,
        org_balance - Amount::from_sat(report.total_fee)
    );
}

/// A maker that never acknowledges the secret does not get its hop back: once the refund
/// locktime passes the taker lets go of hop 0 without broadcasting the refund.
#[test]
fn test_public_secret_blocks_refund() {
    let framework = TestFramework::init(vec![(6102, MakerBehavior::SilentAtSettlement)]);
    warn!("🧪 Running Test: No refund once the secret is public");

    let taker = framework.init_taker(test_config());
    let org_balance = fund_and_verify_taker(&framework, &taker, 2, Amount::from_sat(1_000_000));
    taker.sync_offerbook();

    let err = taker
        .do_coinswap(SwapParams::new(Amount::from_sat(500_000), 1))
        .unwrap_err();
    let report = err.report().unwrap().clone();
    let record = taker.swap_record(&report.swap_id).unwrap().unwrap();
    let hop = &record.attempt.hops[0];
    let refund = hop.recovery_tx.as_ref().unwrap().compute_txid();

    info!("⛏️ Mining up to the refund locktime");
    framework.chain.mine_to(hop.terms.locktime);
    let outcomes = taker.recover_incomplete_swaps().unwrap();
    assert!(outcomes[0].complete);
    assert!(outcomes[0].broadcast_txids.is_empty());
    assert!(!framework.chain.broadcasts().contains(&refund));
    assert_eq!(framework.chain.spender(&hop.funding_outpoint.unwrap()), None);

    let record = taker.swap_record(&report.swap_id).unwrap().unwrap();
    assert_eq!(record.attempt.hops[0].status, HopStatus::Settled);
    assert!(record.recovered);

    let balances = assert_no_coins_in_flight(&taker);
    assert_eq!(
        balances.spendable,
        org_balance - Amount::from_sat(report.total_fee)
    );
}
