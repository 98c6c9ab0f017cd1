//! Route selection over an offerbook snapshot.
//!
//! Makers qualify when they are Reachable with an offer, accept the swap amount, do not ask for
//! more confirmations than the taker tolerates and accept the shortest locktime a route can give
//! them. Qualifying makers are ranked by the fee they would charge, makers with equal fees are
//! shuffled with the caller's seed, and the cheapest ones form the route.

use std::collections::HashSet;

use bitcoin::secp256k1::rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{
    api::SwapParams,
    error::NoRouteError,
    offers::{MakerAddress, MakerEntry, OfferBook},
    swap::{Route, RouteHop},
};

/// Constraints of a route selection besides the swap parameters.
#[derive(Debug, Clone, Default)]
pub struct RoutePolicy {
    /// Makers that must not be picked.
    pub excluded: HashSet<MakerAddress>,
    /// Locktime, in blocks, the ranking fee is computed with.
    pub fee_locktime: u16,
    /// Makers requiring more confirmations are skipped.
    pub max_required_confirms: u32,
    /// Shortest refund locktime a maker of the route can be assigned.
    pub min_assigned_locktime: u16,
}

fn qualifies(entry: &MakerEntry, amount: u64, policy: &RoutePolicy) -> bool {
    let Some(offer) = entry.offer.as_ref() else {
        return false;
    };
    entry.is_usable()
        && !policy.excluded.contains(&entry.address)
        && offer.accepts_amount(amount)
        && offer.required_confirms <= policy.max_required_confirms
        && offer.minimum_locktime <= policy.min_assigned_locktime
}

/// Picks `params.maker_count` makers from `book`.
///
/// The result only depends on the snapshot, the policy and `seed`.
pub fn select_route(
    params: &SwapParams,
    book: &OfferBook,
    policy: &RoutePolicy,
    seed: u64,
) -> Result<Route, NoRouteError> {
    let amount = params.send_amount.to_sat();

    let mut candidates: Vec<(u64, &MakerEntry)> = book
        .all_makers()
        .iter()
        .filter(|entry| qualifies(entry, amount, policy))
        .filter_map(|entry| {
            let offer = entry.offer.as_ref()?;
            Some((offer.fee_for(amount, policy.fee_locktime), entry))
        })
        .collect();

    if candidates.len() < params.maker_count {
        log::warn!(
            "Only {} qualifying makers for {} sats, {} required",
            candidates.len(),
            amount,
            params.maker_count
        );
        return Err(NoRouteError {
            required: params.maker_count,
            available: candidates.len(),
        });
    }

    candidates.sort_by_key(|(fee, entry)| (*fee, entry.id));

    let mut rng = StdRng::seed_from_u64(seed);
    let mut start = 0;
    while start < candidates.len() {
        let fee = candidates[start].0;
        let end = candidates[start..]
            .iter()
            .position(|(f, _)| *f != fee)
            .map_or(candidates.len(), |offset| start + offset);
        candidates[start..end].shuffle(&mut rng);
        start = end;
    }

    let makers: Vec<RouteHop> = candidates
        .into_iter()
        .take(params.maker_count)
        .filter_map(|(fee, entry)| {
            log::debug!("Selected maker {} (fee {} sats)", entry.address, fee);
            Some(RouteHop {
                maker_id: entry.id,
                address: entry.address.clone(),
                offer: entry.offer.clone()?,
            })
        })
        .collect();

    Ok(Route { makers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::Offer,
        taker::offers::{MakerHealth, MakerId},
    };
    use bitcoin::Amount;

    fn entry(port: u16, base_fee: u64, min_size: u64, max_size: u64) -> MakerEntry {
        MakerEntry {
            id: MakerId(0),
            address: MakerAddress::try_from(format!("maker.onion:{port}")).unwrap(),
            offer: Some(Offer {
                base_fee,
                amount_relative_fee_pct: 0.025,
                time_relative_fee_pct: 0.001,
                required_confirms: 1,
                minimum_locktime: 20,
                max_size,
                min_size,
            }),
            health: MakerHealth::Reachable,
            last_seen: Some(1),
            next_check_ts: None,
        }
    }

    fn policy() -> RoutePolicy {
        RoutePolicy {
            excluded: HashSet::new(),
            fee_locktime: 40,
            max_required_confirms: 6,
            min_assigned_locktime: 20,
        }
    }

    #[test]
    fn excludes_makers_below_requested_size() {
        let book = OfferBook::from_entries(vec![
            entry(1, 1_000, 10_000, 1_000_000),
            entry(2, 1_000, 50_000, 2_000_000),
            entry(3, 1_000, 5_000, 8_000),
        ]);
        let params = SwapParams::new(Amount::from_sat(500_000), 2);

        let route = select_route(&params, &book, &policy(), 7).unwrap();
        let ports: HashSet<String> = route.addresses().iter().map(|a| a.to_string()).collect();
        assert_eq!(route.len(), 2);
        assert!(ports.contains("maker.onion:1"));
        assert!(ports.contains("maker.onion:2"));
    }

    #[test]
    fn ranks_by_fee_and_is_deterministic_per_seed() {
        let book = OfferBook::from_entries(vec![
            entry(1, 5_000, 0, 10_000_000),
            entry(2, 100, 0, 10_000_000),
            entry(3, 100, 0, 10_000_000),
            entry(4, 100, 0, 10_000_000),
        ]);
        let params = SwapParams::new(Amount::from_sat(100_000), 3);

        let first = select_route(&params, &book, &policy(), 42).unwrap();
        assert_eq!(first, select_route(&params, &book, &policy(), 42).unwrap());
        assert!(!first
            .addresses()
            .iter()
            .any(|a| a.to_string() == "maker.onion:1"));

        // Every tie order shows up across seeds.
        let firsts: HashSet<MakerId> = (0..64)
            .map(|seed| select_route(&params, &book, &policy(), seed).unwrap().makers[0].maker_id)
            .collect();
        assert!(firsts.len() > 1);
    }

    #[test]
    fn filters_health_confirms_locktime_and_exclusions() {
        let mut unreachable = entry(1, 0, 0, 10_000_000);
        unreachable.health = MakerHealth::Unreachable { retries: 1 };
        let mut malicious = entry(2, 0, 0, 10_000_000);
        malicious.health = MakerHealth::Malicious;
        let mut slow = entry(3, 0, 0, 10_000_000);
        if let Some(offer) = slow.offer.as_mut() {
            offer.required_confirms = 100;
        }
        let mut long_lock = entry(4, 0, 0, 10_000_000);
        if let Some(offer) = long_lock.offer.as_mut() {
            offer.minimum_locktime = 500;
        }
        let excluded = entry(5, 0, 0, 10_000_000);
        let good = entry(6, 0, 0, 10_000_000);

        let mut policy = policy();
        policy.excluded.insert(excluded.address.clone());
        let book = OfferBook::from_entries(vec![
            unreachable,
            malicious,
            slow,
            long_lock,
            excluded,
            good,
        ]);

        let err = select_route(&SwapParams::new(Amount::from_sat(100_000), 2), &book, &policy, 0)
            .unwrap_err();
        assert_eq!(
            err,
            NoRouteError {
                required: 2,
                available: 1
            }
        );
        let params = SwapParams::new(Amount::from_sat(100_000), 1);
        let route = select_route(&params, &book, &policy, 0).unwrap();
        assert_eq!(route.makers[0].address.to_string(), "maker.onion:6");
    }
}
