//! Recovery of failed and interrupted swaps.
//!
//! The [`RecoveryManager`] brings the taker's own hops of an attempt to a resolved state from the
//! persisted record alone:
//!
//! - the incoming hop (last hop) is swept through its hashlock branch once it was verified;
//! - the outgoing hop (hop 0) is refunded through its timelock branch once the locktime is
//!   reached, unless the preimage is already out. Then hop 0 belongs to the first maker: the
//!   preimage is re-sent to every maker that did not acknowledge it and hop 0 is never refunded.
//!
//! Every step first looks at the chain, so a second pass over the same record does nothing. Only
//! the taker's own timelocks are waited on, never a maker.

use bitcoin::{Amount, OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::{
    protocol::{contract::build_contract_spend, Settlement},
    wallet::{ScriptType, SpendInfo, Utxo, UtxoCategory},
    watch_tower::{BroadcastError, ChainError},
};

use super::{
    api::TakerContext,
    coordinator::broadcast_error,
    error::TakerError,
    routines::send_settlement_once,
    swap::{HopStatus, SwapAttempt, SwapStatus},
};

/// A taker hop still waiting on its locktime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRefund {
    /// Hop index.
    pub hop: usize,
    /// Height from which the refund can be mined.
    pub unlock_height: u32,
}

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    /// The recovered swap.
    pub swap_id: String,
    /// Refunds and claims broadcast during this pass.
    pub broadcast_txids: Vec<Txid>,
    /// Hops still locked.
    pub pending: Vec<PendingRefund>,
    /// Reserved inputs returned to Regular because the funding never reached the chain.
    pub released_inputs: Vec<OutPoint>,
    /// Both taker hops are resolved, nothing left to do.
    pub complete: bool,
}

impl RecoveryOutcome {
    fn new(swap_id: &str) -> Self {
        Self {
            swap_id: swap_id.to_string(),
            ..Default::default()
        }
    }
}

enum SpendState {
    Unspent,
    Ours,
    Other(Txid),
}

pub(crate) struct RecoveryManager<'a> {
    ctx: &'a TakerContext,
}

impl<'a> RecoveryManager<'a> {
    pub(crate) fn new(ctx: &'a TakerContext) -> Self {
        Self { ctx }
    }

    /// Runs one recovery pass over `attempt` and persists the result.
    pub(crate) fn recover(&self, attempt: &mut SwapAttempt) -> Result<RecoveryOutcome, TakerError> {
        let mut outcome = RecoveryOutcome::new(&attempt.id);

        match attempt.status {
            SwapStatus::Completed | SwapStatus::Aborted => {
                outcome.complete = true;
                return Ok(outcome);
            }
            SwapStatus::Selecting | SwapStatus::Negotiating => {
                outcome.released_inputs = self.ctx.ledger_mut()?.release_swap(&attempt.id);
                fail_proposed_hops(attempt);
                attempt.transition(
                    SwapStatus::Aborted,
                    Some("interrupted before funding".to_string()),
                )?;
                self.ctx.persist(attempt)?;
                outcome.complete = true;
                return Ok(outcome);
            }
            SwapStatus::Funding | SwapStatus::Settling => {
                attempt.transition(
                    SwapStatus::Recovering,
                    Some("resumed after restart".to_string()),
                )?;
                self.ctx.persist(attempt)?;
            }
            SwapStatus::Recovering => {}
        }
        log::info!("Recovering swap {}", attempt.id);

        if attempt.hops.is_empty() {
            outcome.released_inputs = self.ctx.ledger_mut()?.release_swap(&attempt.id);
        } else {
            self.reconcile_funding(attempt, &mut outcome)?;
            self.recover_incoming(attempt, &mut outcome)?;
            self.recover_outgoing(attempt, &mut outcome)?;
        }

        outcome.complete = match (attempt.hops.first(), attempt.hops.last()) {
            (Some(first), Some(last)) => first.status.is_resolved() && last.status.is_resolved(),
            _ => true,
        };
        self.ctx.persist(attempt)?;
        if outcome.complete {
            self.ctx.mark_recovered(&attempt.id)?;
        }
        Ok(outcome)
    }

    fn spend_state(&self, outpoint: &OutPoint, ours: Txid) -> Result<SpendState, ChainError> {
        Ok(match self.ctx.chain.spending_txid(outpoint)? {
            None => SpendState::Unspent,
            Some(txid) if txid == ours => SpendState::Ours,
            Some(txid) => SpendState::Other(txid),
        })
    }

    /// Settles whether the taker's funding transaction ever reached the chain.
    fn reconcile_funding(
        &self,
        attempt: &mut SwapAttempt,
        outcome: &mut RecoveryOutcome,
    ) -> Result<(), TakerError> {
        if attempt.hops[0].status != HopStatus::Proposed {
            return Ok(());
        }
        let Some(funding) = attempt.taker_funding.clone() else {
            outcome.released_inputs = self.ctx.ledger_mut()?.release_swap(&attempt.id);
            fail_proposed_hops(attempt);
            return Ok(());
        };

        let funding_txid = funding.tx.compute_txid();
        let contract = OutPoint {
            txid: funding_txid,
            vout: 0,
        };
        let mut seen = self.ctx.chain.get_confirmations(&contract)?.is_some();
        for input in &funding.inputs {
            if seen {
                break;
            }
            seen = self.ctx.chain.spending_txid(input)? == Some(funding_txid);
        }

        if !seen {
            log::info!(
                "Swap {}: funding {funding_txid} never reached the chain, releasing inputs",
                attempt.id
            );
            let wallet_utxos = self.ctx.wallet.list_utxos()?;
            let mut ledger = self.ctx.ledger_mut()?;
            outcome.released_inputs = ledger.release_swap(&attempt.id);
            ledger.sync(wallet_utxos);
            drop(ledger);
            fail_proposed_hops(attempt);
            return Ok(());
        }

        log::info!("Swap {}: funding {funding_txid} found on chain", attempt.id);
        let amount = attempt.hops[0].terms.amount;
        let contract_utxo = Utxo {
            outpoint: contract,
            value: amount,
            script_type: ScriptType::P2WSH,
            confirmations: 0,
            category: UtxoCategory::Regular,
        };
        let change = funding
            .change
            .map(|(outpoint, value)| Utxo::regular(outpoint, value, 0));
        let committed = self.ctx.ledger_mut()?.commit_funding(
            &attempt.id,
            &funding.inputs,
            contract_utxo.clone(),
            change.clone(),
        );
        if let Err(e) = committed {
            log::warn!("Funding inputs no longer tracked ({e:?}), tracking contract only");
            let wallet_utxos = self.ctx.wallet.list_utxos()?;
            let mut ledger = self.ctx.ledger_mut()?;
            ledger.release_swap(&attempt.id);
            ledger.sync(wallet_utxos);
            ledger.track_contract(&attempt.id, contract_utxo);
            if let Some(change) = change {
                ledger.insert_regular(change);
            }
        }
        if let Some(funding) = attempt.taker_funding.as_mut() {
            funding.broadcast = true;
        }
        let first = &mut attempt.hops[0];
        first.funding_txid = Some(funding_txid);
        first.funding_outpoint = Some(contract);
        first.set_status(HopStatus::Funded)?;
        self.ctx.persist(attempt)
    }

    fn recover_incoming(
        &self,
        attempt: &mut SwapAttempt,
        outcome: &mut RecoveryOutcome,
    ) -> Result<(), TakerError> {
        let last = attempt.hops.len() - 1;
        match attempt.hops[last].status {
            HopStatus::Verified => {}
            HopStatus::Proposed | HopStatus::Funded => {
                // The secret never left the taker, the maker refunds this hop itself.
                attempt.hops[last].set_status(HopStatus::Failed)?;
                return self.ctx.persist(attempt);
            }
            _ => return Ok(()),
        }

        let hop = &attempt.hops[last];
        let (Some(outpoint), Some(claim)) = (hop.funding_outpoint, hop.recovery_tx.clone()) else {
            log::warn!("Swap {}: incoming hop has no claim to broadcast", attempt.id);
            attempt.hops[last].set_status(HopStatus::Failed)?;
            return Ok(());
        };

        // The claim publishes the preimage.
        if !attempt.preimage_revealed {
            attempt.preimage_revealed = true;
            self.ctx.persist(attempt)?;
        }

        match self.spend_state(&outpoint, claim.compute_txid())? {
            SpendState::Ours => self.apply_own_spend(attempt, last, &claim),
            SpendState::Other(txid) => self.apply_foreign_spend(attempt, last, txid),
            SpendState::Unspent => self.broadcast_spend(attempt, last, outcome),
        }
    }

    fn recover_outgoing(
        &self,
        attempt: &mut SwapAttempt,
        outcome: &mut RecoveryOutcome,
    ) -> Result<(), TakerError> {
        let hop = &attempt.hops[0];
        if !matches!(hop.status, HopStatus::Funded | HopStatus::Verified) {
            return Ok(());
        }
        let (Some(outpoint), Some(refund)) = (hop.funding_outpoint, hop.recovery_tx.clone()) else {
            return Err(TakerError::General(format!(
                "swap {}: funded hop 0 has no refund transaction",
                attempt.id
            )));
        };
        if attempt.preimage_revealed {
            return self.hand_over_outgoing(attempt, outpoint, &refund, outcome);
        }

        match self.spend_state(&outpoint, refund.compute_txid())? {
            SpendState::Ours => self.apply_own_spend(attempt, 0, &refund),
            SpendState::Other(txid) => self.apply_foreign_spend(attempt, 0, txid),
            SpendState::Unspent => {
                let locktime = hop.terms.locktime;
                let height = self.ctx.chain.current_height()?;
                if height >= locktime {
                    self.broadcast_spend(attempt, 0, outcome)
                } else {
                    log::info!(
                        "Swap {}: hop 0 refund unlocks at height {locktime}, tip is {height}",
                        attempt.id
                    );
                    outcome.pending.push(PendingRefund {
                        hop: 0,
                        unlock_height: locktime,
                    });
                    Ok(())
                }
            }
        }
    }

    /// Hop 0 once the preimage is out. The first maker claims it, the taker only makes sure the
    /// makers know the secret. The hop is released when the maker claimed it, acknowledged the
    /// secret, or when its locktime passed with the secret public on chain.
    fn hand_over_outgoing(
        &self,
        attempt: &mut SwapAttempt,
        outpoint: OutPoint,
        refund: &Transaction,
        outcome: &mut RecoveryOutcome,
    ) -> Result<(), TakerError> {
        match self.spend_state(&outpoint, refund.compute_txid())? {
            SpendState::Ours => return self.apply_own_spend(attempt, 0, refund),
            SpendState::Other(txid) => return self.apply_foreign_spend(attempt, 0, txid),
            SpendState::Unspent => {}
        }

        self.deliver_preimage(attempt)?;
        if let Some(txid) = self.ctx.chain.spending_txid(&outpoint)? {
            return self.apply_foreign_spend(attempt, 0, txid);
        }

        let locktime = attempt.hops[0].terms.locktime;
        let height = self.ctx.chain.current_height()?;
        let acknowledged = attempt.hops.get(1).is_some_and(|hop| hop.preimage_delivered);
        if !acknowledged && height < locktime {
            log::info!(
                "Swap {}: hop 0 left to the first maker, claim expected before {locktime}",
                attempt.id
            );
            outcome.pending.push(PendingRefund {
                hop: 0,
                unlock_height: locktime,
            });
            return Ok(());
        }

        let hop = &mut attempt.hops[0];
        let next = if hop.status == HopStatus::Verified {
            HopStatus::Settled
        } else {
            HopStatus::Failed
        };
        log::info!("Swap {}: hop 0 handed over to the first maker, marking {next}", attempt.id);
        hop.set_status(next)?;
        self.ctx.ledger_mut()?.resolve_contract(&outpoint, None);
        self.ctx.persist(attempt)
    }

    /// Sends the preimage to every maker that has not acknowledged it yet, last hop first.
    fn deliver_preimage(&self, attempt: &mut SwapAttempt) -> Result<(), TakerError> {
        let (Some(preimage), Some(route)) = (attempt.preimage, attempt.route.clone()) else {
            return Ok(());
        };
        let n = route.len();
        for j in (1..=n).rev() {
            if attempt.hops.get(j).map_or(true, |hop| hop.preimage_delivered) {
                continue;
            }
            let maker = &route.makers[j - 1].address;
            let settlement = Settlement {
                swap_id: attempt.id.clone(),
                hop_index: j,
                preimage,
            };
            match send_settlement_once(
                &self.ctx.transport,
                self.ctx.config.maker_timeout(),
                maker,
                settlement,
            ) {
                Ok(()) => {
                    log::info!("Swap {}: {maker} acknowledged the preimage of hop {j}", attempt.id);
                    let hop = &mut attempt.hops[j];
                    hop.preimage_delivered = true;
                    if j < n && hop.status == HopStatus::Verified {
                        hop.set_status(HopStatus::Settled)?;
                    }
                }
                Err(e) => log::warn!(
                    "Swap {}: {maker} still not acknowledging hop {j}: {e}",
                    attempt.id
                ),
            }
        }
        self.ctx.persist(attempt)
    }

    /// Broadcasts the hop's recovery transaction, bumping its fee when the node asks for it.
    fn broadcast_spend(
        &self,
        attempt: &mut SwapAttempt,
        k: usize,
        outcome: &mut RecoveryOutcome,
    ) -> Result<(), TakerError> {
        let mut bumps = 0;
        loop {
            let tx = attempt.hops[k]
                .recovery_tx
                .clone()
                .ok_or_else(|| {
                    TakerError::General(format!("hop {k} has no recovery transaction"))
                })?;

            match self.ctx.chain.broadcast(&tx) {
                Ok(txid) => {
                    log::info!("Swap {}: broadcast recovery {txid} of hop {k}", attempt.id);
                    outcome.broadcast_txids.push(txid);
                    return self.apply_own_spend(attempt, k, &tx);
                }
                Err(BroadcastError::InsufficientFee) if bumps < self.ctx.config.max_fee_bumps => {
                    bumps += 1;
                    let bumped = self.bump_fee(attempt, k, &tx)?;
                    attempt.hops[k].recovery_tx = Some(bumped);
                    self.ctx.persist(attempt)?;
                }
                Err(BroadcastError::InsufficientFee) => {
                    log::warn!(
                        "Swap {}: hop {k} recovery still underpaying after {bumps} bumps",
                        attempt.id
                    );
                    outcome.pending.push(PendingRefund {
                        hop: k,
                        unlock_height: attempt.hops[k].terms.locktime,
                    });
                    return Ok(());
                }
                Err(BroadcastError::AlreadySpent) => {
                    let outpoint = attempt.hops[k]
                        .funding_outpoint
                        .ok_or_else(|| TakerError::General(format!("hop {k} has no outpoint")))?;
                    return match self.spend_state(&outpoint, tx.compute_txid())? {
                        SpendState::Ours => self.apply_own_spend(attempt, k, &tx),
                        SpendState::Other(txid) => self.apply_foreign_spend(attempt, k, txid),
                        SpendState::Unspent => {
                            log::warn!(
                                "Swap {}: hop {k} reported spent by an unseen transaction",
                                attempt.id
                            );
                            self.apply_foreign_spend(attempt, k, tx.compute_txid())
                        }
                    };
                }
                Err(BroadcastError::NonFinal) => {
                    outcome.pending.push(PendingRefund {
                        hop: k,
                        unlock_height: attempt.hops[k].terms.locktime,
                    });
                    return Ok(());
                }
                Err(e) => return Err(broadcast_error("recovery transaction", e)),
            }
        }
    }

    fn bump_fee(
        &self,
        attempt: &SwapAttempt,
        k: usize,
        previous: &Transaction,
    ) -> Result<Transaction, TakerError> {
        let hop = &attempt.hops[k];
        let input_value = hop.terms.amount;
        let output = previous
            .output
            .first()
            .ok_or_else(|| TakerError::General(format!("hop {k} recovery has no output")))?;
        let fee = input_value
            .checked_sub(output.value)
            .and_then(|fee| fee.checked_mul(2))
            .ok_or_else(|| TakerError::General(format!("hop {k} fee cannot be bumped")))?;
        let outpoint = hop
            .funding_outpoint
            .ok_or_else(|| TakerError::General(format!("hop {k} has no outpoint")))?;
        let redeemscript = hop
            .redeemscript
            .clone()
            .ok_or_else(|| TakerError::General(format!("hop {k} has no redeemscript")))?;
        log::info!(
            "Swap {}: bumping hop {k} recovery fee to {} sats",
            attempt.id,
            fee.to_sat()
        );

        let (refund_height, spend) = if k == 0 {
            (
                Some(hop.terms.locktime),
                SpendInfo::TimelockContract {
                    redeemscript,
                    input_value,
                },
            )
        } else {
            let preimage = attempt
                .preimage
                .ok_or_else(|| TakerError::General("swap has no preimage".to_string()))?;
            (
                None,
                SpendInfo::HashlockContract {
                    redeemscript,
                    input_value,
                    preimage,
                },
            )
        };
        let tx = build_contract_spend(
            outpoint,
            input_value,
            fee,
            output.script_pubkey.clone(),
            refund_height,
        )?;
        Ok(self.ctx.wallet.sign(tx, &spend)?)
    }

    /// The hop was spent by the taker's own recovery transaction.
    fn apply_own_spend(
        &self,
        attempt: &mut SwapAttempt,
        k: usize,
        tx: &Transaction,
    ) -> Result<(), TakerError> {
        let txid = tx.compute_txid();
        let value = tx.output.first().map_or(Amount::ZERO, |out| out.value);
        let received = Utxo::regular(OutPoint { txid, vout: 0 }, value, 0);
        let hop = &mut attempt.hops[k];
        let next = if k == 0 {
            HopStatus::Refunded
        } else {
            HopStatus::Settled
        };
        if hop.status != next {
            hop.set_status(next)?;
            let fee = hop.terms.amount.checked_sub(value).unwrap_or(Amount::ZERO);
            attempt.contract_spend_fees += fee;
        }

        let mut ledger = self.ctx.ledger_mut()?;
        match hop.funding_outpoint {
            Some(outpoint) if k == 0 => {
                ledger.resolve_contract(&outpoint, Some(received));
            }
            _ => {
                ledger.insert_regular(received);
            }
        }
        drop(ledger);
        log::info!("Swap {}: hop {k} {}", attempt.id, next);
        self.ctx.persist(attempt)
    }

    /// The hop was spent by a transaction the taker did not build.
    fn apply_foreign_spend(
        &self,
        attempt: &mut SwapAttempt,
        k: usize,
        spender: Txid,
    ) -> Result<(), TakerError> {
        let hop = &mut attempt.hops[k];
        let next = if k == 0 && hop.status == HopStatus::Verified {
            // The maker claimed it with the secret.
            HopStatus::Settled
        } else {
            HopStatus::Failed
        };
        log::warn!("Swap {}: hop {k} spent by {spender}, marking {next}", attempt.id);
        hop.set_status(next)?;
        if k == 0 {
            if let Some(outpoint) = hop.funding_outpoint {
                self.ctx.ledger_mut()?.resolve_contract(&outpoint, None);
            }
        }
        self.ctx.persist(attempt)
    }
}

fn fail_proposed_hops(attempt: &mut SwapAttempt) {
    for hop in attempt.hops.iter_mut() {
        if hop.status == HopStatus::Proposed {
            if let Err(e) = hop.set_status(HopStatus::Failed) {
                log::error!("{e:?}");
            }
        }
    }
}

/// Runs one recovery pass over every unfinished swap except the one being driven.
pub(crate) fn recover_all(ctx: &TakerContext) -> Result<Vec<RecoveryOutcome>, TakerError> {
    let _pass = ctx
        .recovery_lock
        .lock()
        .map_err(|_| TakerError::General("recovery lock poisoned".to_string()))?;
    let active = ctx.active_swap()?.clone();
    let records: Vec<SwapAttempt> = ctx
        .tracker()?
        .incomplete_swaps()
        .into_iter()
        .filter(|record| Some(record.swap_id()) != active.as_deref())
        .map(|record| record.attempt.clone())
        .collect();

    let manager = RecoveryManager::new(ctx);
    let mut outcomes = Vec::with_capacity(records.len());
    for mut attempt in records {
        match manager.recover(&mut attempt) {
            Ok(outcome) => outcomes.push(outcome),
            Err(TakerError::ChainUnavailable(e)) => {
                log::warn!("Chain unavailable, stopping recovery pass: {e}");
                return Err(TakerError::ChainUnavailable(e));
            }
            Err(e) => log::error!("Recovery of swap {} failed: {e:?}", attempt.id),
        }
    }
    Ok(outcomes)
}
