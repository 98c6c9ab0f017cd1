//! Data model of one swap attempt.
//!
//! A [`SwapAttempt`] owns its [`Route`] and one [`HopContract`] per hop. Every status change of
//! the attempt is appended to its transition log, so the current status can always be re-derived
//! from the persisted record with [`SwapAttempt::replay_status`].

use std::fmt;

use bitcoin::{Amount, OutPoint, PublicKey, ScriptBuf, Transaction, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{
    contract::{fee_breakdown, locktime_offsets, FeeBreakdown, DUST_LIMIT},
    error::ContractError,
    ContractTerms, Hash160, Offer, Preimage,
};

use super::{
    api::SwapParams,
    error::TakerError,
    offers::{MakerAddress, MakerId},
};

/// Overall status of a swap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapStatus {
    /// Picking makers from the offerbook.
    Selecting,
    /// Proposing hop terms to the route.
    Negotiating,
    /// Hop contracts are being funded.
    Funding,
    /// Releasing the hops, last hop first.
    Settling,
    /// Every hop settled.
    Completed,
    /// Ended before any funds left the wallet.
    Aborted,
    /// Funds are committed and handed to the recovery manager.
    Recovering,
}

impl SwapStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SwapStatus::Completed | SwapStatus::Aborted)
    }

    /// Whether the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: SwapStatus) -> bool {
        use SwapStatus::*;
        matches!(
            (self, next),
            (Selecting, Negotiating)
                | (Selecting, Aborted)
                | (Negotiating, Selecting)
                | (Negotiating, Funding)
                | (Negotiating, Aborted)
                | (Negotiating, Recovering)
                | (Funding, Settling)
                | (Funding, Aborted)
                | (Funding, Recovering)
                | (Settling, Completed)
                | (Settling, Recovering)
        )
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Status of a single hop contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopStatus {
    /// Terms agreed, nothing on chain.
    Proposed,
    /// Funding transaction broadcast.
    Funded,
    /// Funding confirmed and checked against the agreed terms.
    Verified,
    /// Released to its receiver.
    Settled,
    /// Sender took the funds back through the timelock branch.
    Refunded,
    /// Will never settle nor be refunded by the taker.
    Failed,
}

impl HopStatus {
    /// Whether the state machine allows moving to `next`. Staying in place is always allowed.
    pub fn can_transition_to(&self, next: HopStatus) -> bool {
        use HopStatus::*;
        *self == next
            || matches!(
                (self, next),
                (Proposed, Funded)
                    | (Proposed, Failed)
                    | (Funded, Verified)
                    | (Funded, Refunded)
                    | (Funded, Failed)
                    | (Verified, Settled)
                    | (Verified, Refunded)
                    | (Verified, Failed)
            )
    }

    /// Whether the hop reached an end state.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            HopStatus::Settled | HopStatus::Refunded | HopStatus::Failed
        )
    }
}

impl fmt::Display for HopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One side of a hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopParty {
    /// This taker.
    Taker,
    /// A maker of the route.
    Maker(MakerAddress),
}

impl fmt::Display for HopParty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopParty::Taker => f.write_str("taker"),
            HopParty::Maker(address) => write!(f, "{address}"),
        }
    }
}

/// A maker picked for a route, with the offer it was picked on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteHop {
    /// Id in the offerbook the route was selected from.
    pub maker_id: MakerId,
    /// Maker address.
    pub address: MakerAddress,
    /// Offer at selection time.
    pub offer: Offer,
}

/// Ordered makers of a swap, first maker receives from the taker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Route {
    /// Makers in hop order.
    pub makers: Vec<RouteHop>,
}

impl Route {
    /// Number of makers.
    pub fn len(&self) -> usize {
        self.makers.len()
    }

    /// Whether the route has no maker.
    pub fn is_empty(&self) -> bool {
        self.makers.is_empty()
    }

    /// Maker addresses in hop order.
    pub fn addresses(&self) -> Vec<MakerAddress> {
        self.makers.iter().map(|m| m.address.clone()).collect()
    }
}

/// Fee charged by one maker of the route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakerFee {
    /// Position in the route.
    pub position: usize,
    /// The maker.
    pub address: MakerAddress,
    /// Amount the maker receives.
    pub incoming_amount: Amount,
    /// Refund locktime (blocks) of the maker's outgoing hop.
    pub refund_locktime: u16,
    /// Fee categories.
    pub breakdown: FeeBreakdown,
}

/// Per-hop state of a swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopContract {
    /// Hop index, 0 is funded by the taker.
    pub index: usize,
    /// Funding party.
    pub sender: HopParty,
    /// Party able to claim with the preimage.
    pub receiver: HopParty,
    /// Amount, hashlock and absolute locktime.
    pub terms: ContractTerms,
    /// Sender key on the timelock branch, known once the sender committed to it.
    pub sender_pubkey: Option<PublicKey>,
    /// Receiver key on the hashlock branch.
    pub receiver_pubkey: Option<PublicKey>,
    /// Contract redeemscript.
    pub redeemscript: Option<ScriptBuf>,
    /// Funding transaction id.
    pub funding_txid: Option<Txid>,
    /// Contract output.
    pub funding_outpoint: Option<OutPoint>,
    /// Confirmations awaited before the hop is verified.
    pub required_confirms: u32,
    /// Pre-signed exit of the taker: refund of hop 0, or hashlock claim of the last hop.
    pub recovery_tx: Option<Transaction>,
    /// The maker funding this hop acknowledged the preimage.
    #[serde(default)]
    pub preimage_delivered: bool,
    /// Hop status.
    pub status: HopStatus,
}

impl HopContract {
    /// Moves the hop to `next` if allowed.
    pub fn set_status(&mut self, next: HopStatus) -> Result<(), ContractError> {
        if !self.status.can_transition_to(next) {
            return Err(ContractError::IllegalTransition {
                hop: self.index,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if self.status != next {
            log::debug!("Hop {}: {} -> {}", self.index, self.status, next);
        }
        self.status = next;
        Ok(())
    }

    /// Whether the taker funds this hop.
    pub fn is_taker_funded(&self) -> bool {
        self.sender == HopParty::Taker
    }

    /// Whether the taker is paid by this hop.
    pub fn is_taker_received(&self) -> bool {
        self.receiver == HopParty::Taker
    }
}

/// One entry of the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Status left.
    pub from: SwapStatus,
    /// Status entered.
    pub to: SwapStatus,
    /// When.
    pub at: DateTime<Utc>,
    /// Why, for failures and re-selections.
    pub reason: Option<String>,
}

/// The taker's own funding of hop 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakerFunding {
    /// Spent wallet coins.
    pub inputs: Vec<OutPoint>,
    /// Their total value.
    pub input_value: Amount,
    /// Change output and its value.
    pub change: Option<(OutPoint, Amount)>,
    /// Mining fee of the funding transaction.
    pub fee: Amount,
    /// The signed funding transaction.
    pub tx: Transaction,
    /// Whether the broadcast was accepted.
    pub broadcast: bool,
}

/// Everything known about one swap attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapAttempt {
    /// Swap identifier.
    pub id: String,
    /// Caller parameters.
    pub params: SwapParams,
    /// Current route, replaced on re-selection.
    pub route: Option<Route>,
    /// Hop contracts of the current route.
    pub hops: Vec<HopContract>,
    /// Current status.
    pub status: SwapStatus,
    /// Transition log.
    pub transitions: Vec<StateTransition>,
    /// Fees of the current route.
    pub maker_fees: Vec<MakerFee>,
    /// Swap secret. Never leaves the taker before settlement.
    pub preimage: Option<Preimage>,
    /// The preimage was sent to a maker or published on chain. From then on hop 0 belongs to the
    /// first maker and is never refunded.
    #[serde(default)]
    pub preimage_revealed: bool,
    /// Funding of hop 0.
    pub taker_funding: Option<TakerFunding>,
    /// Mining fees paid by the taker on contract spends (claims and refunds).
    pub contract_spend_fees: Amount,
    /// Makers excluded during this attempt.
    pub failed_makers: Vec<MakerAddress>,
    /// Failure description.
    pub failure: Option<String>,
    /// Addresses the taker derived for this attempt.
    pub taker_addresses: Vec<String>,
    /// Route selections performed beyond the first.
    pub reselection_rounds: u32,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// When the attempt stopped driving itself forward.
    pub finished_at: Option<DateTime<Utc>>,
}

impl SwapAttempt {
    /// A new attempt in `Selecting`.
    pub fn new(id: String, params: SwapParams) -> Self {
        Self {
            id,
            params,
            route: None,
            hops: Vec::new(),
            status: SwapStatus::Selecting,
            transitions: Vec::new(),
            maker_fees: Vec::new(),
            preimage: None,
            preimage_revealed: false,
            taker_funding: None,
            contract_spend_fees: Amount::ZERO,
            failed_makers: Vec::new(),
            failure: None,
            taker_addresses: Vec::new(),
            reselection_rounds: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Moves the attempt to `next` and logs the transition.
    pub fn transition(
        &mut self,
        next: SwapStatus,
        reason: Option<String>,
    ) -> Result<(), TakerError> {
        if !self.status.can_transition_to(next) {
            return Err(TakerError::IllegalStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        log::info!(
            "Swap {}: {} -> {}{}",
            self.id,
            self.status,
            next,
            reason
                .as_deref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default()
        );
        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.status,
            to: next,
            at: now,
            reason,
        });
        self.status = next;
        if next.is_terminal() || next == SwapStatus::Recovering {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Re-derives the status from the transition log, rejecting logs with illegal steps.
    pub fn replay_status(&self) -> Result<SwapStatus, TakerError> {
        let mut status = SwapStatus::Selecting;
        for t in &self.transitions {
            if t.from != status || !status.can_transition_to(t.to) {
                return Err(TakerError::IllegalStateTransition {
                    from: t.from.to_string(),
                    to: t.to.to_string(),
                });
            }
            status = t.to;
        }
        Ok(status)
    }

    /// Value locked in taker-funded hops that are not resolved yet.
    pub fn committed_amount(&self) -> Amount {
        self.hops
            .iter()
            .filter(|h| h.is_taker_funded())
            .filter(|h| matches!(h.status, HopStatus::Funded | HopStatus::Verified))
            .map(|h| h.terms.amount)
            .sum()
    }

    /// Number of settled hops.
    pub fn hops_settled(&self) -> usize {
        self.hops
            .iter()
            .filter(|h| h.status == HopStatus::Settled)
            .count()
    }

    /// Whether every hop reached an end state.
    pub fn is_resolved(&self) -> bool {
        self.hops.iter().all(|h| h.status.is_resolved())
    }

    /// Total fee of the makers in the current route.
    pub fn total_maker_fees(&self) -> Amount {
        self.maker_fees
            .iter()
            .map(|f| Amount::from_sat(f.breakdown.total()))
            .sum()
    }
}

/// Amounts and locktimes of every hop of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopPlan {
    /// Relative refund locktime of each hop, strictly decreasing.
    pub locktime_offsets: Vec<u16>,
    /// Amount locked in each hop.
    pub amounts: Vec<Amount>,
    /// Fee of each maker.
    pub fees: Vec<MakerFee>,
}

impl HopPlan {
    /// Hop contracts for this plan, every hop `Proposed` with locktimes anchored at `height`.
    pub fn contracts(&self, route: &Route, hashlock: Hash160, height: u32) -> Vec<HopContract> {
        let n = route.len();
        (0..=n)
            .map(|k| HopContract {
                index: k,
                sender: if k == 0 {
                    HopParty::Taker
                } else {
                    HopParty::Maker(route.makers[k - 1].address.clone())
                },
                receiver: if k == n {
                    HopParty::Taker
                } else {
                    HopParty::Maker(route.makers[k].address.clone())
                },
                terms: ContractTerms {
                    amount: self.amounts[k],
                    hashlock,
                    locktime: height + self.locktime_offsets[k] as u32,
                },
                sender_pubkey: None,
                receiver_pubkey: None,
                redeemscript: None,
                funding_txid: None,
                funding_outpoint: None,
                required_confirms: 0,
                recovery_tx: None,
                preimage_delivered: false,
                status: HopStatus::Proposed,
            })
            .collect()
    }
}

/// Computes hop amounts and maker fees.
///
/// Hop 0 carries `send_amount`. Every maker keeps its fee, computed on its incoming amount and its
/// outgoing hop's locktime, plus `miner_fee_per_hop` to fund its outgoing hop.
pub fn plan_hops(
    send_amount: Amount,
    route: &Route,
    locktime_base: u16,
    locktime_step: u16,
    miner_fee_per_hop: Amount,
) -> Result<HopPlan, TakerError> {
    let offsets = locktime_offsets(route.len(), locktime_base, locktime_step);
    let mut amounts = vec![send_amount];
    let mut fees = Vec::with_capacity(route.len());

    for (i, maker) in route.makers.iter().enumerate() {
        let incoming = amounts[i];
        let breakdown = fee_breakdown(
            incoming.to_sat(),
            offsets[i + 1],
            maker.offer.base_fee,
            maker.offer.amount_relative_fee_pct,
            maker.offer.time_relative_fee_pct,
        );
        let outgoing = incoming
            .checked_sub(Amount::from_sat(breakdown.total()))
            .and_then(|a| a.checked_sub(miner_fee_per_hop))
            .filter(|a| *a >= DUST_LIMIT)
            .ok_or_else(|| {
                TakerError::General(format!(
                    "send amount {} sats does not cover the fees of maker {}",
                    send_amount.to_sat(),
                    maker.address
                ))
            })?;
        fees.push(MakerFee {
            position: i,
            address: maker.address.clone(),
            incoming_amount: incoming,
            refund_locktime: offsets[i + 1],
            breakdown,
        });
        amounts.push(outgoing);
    }

    Ok(HopPlan {
        locktime_offsets: offsets,
        amounts,
        fees,
    })
}
