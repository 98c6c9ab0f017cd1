//! The swap coordinator.
//!
//! Drives one [`SwapAttempt`] through the state machine:
//!
//! ```text
//! Selecting -> Negotiating -> Funding -> Settling -> Completed
//!     ^            |              |          |
//!     +--reselect--+              +----------+--> Recovering
//!                  |              |
//!                  +--------------+-----------------> Aborted
//! ```
//!
//! Maker faults before funding trigger a re-selection that excludes the faulty maker. Once the
//! taker's funding transaction may have reached the network, every fault hands the attempt to the
//! [`RecoveryManager`]. The attempt is written to the swap log at every transition and before the
//! funding broadcast.

use std::sync::atomic::{AtomicBool, Ordering};

use bitcoin::{Amount, OutPoint, Transaction};

use crate::{
    protocol::{
        contract::{
            build_contract_spend, build_funding_tx, contract_script_pubkey, contract_spend_fee,
            create_contract_redeemscript, funding_fee, generate_preimage, hashlock_of,
            validate_locktime_schedule, verify_funding_notice, DUST_LIMIT,
        },
        FundingRequest, HopTerms, Settlement,
    },
    wallet::{AddressType, ScriptType, SpendInfo, Utxo, UtxoCategory, WalletError},
    watch_tower::{BroadcastError, ChainError, WatcherError},
};

use super::{
    api::TakerContext,
    error::TakerError,
    recovery::RecoveryManager,
    routes::{select_route, RoutePolicy},
    routines::{propose_hop_once, request_funding_once, send_settlement_once},
    swap::{plan_hops, HopStatus, Route, SwapAttempt, SwapStatus, TakerFunding},
};

/// Rounds of coin selection before giving up on covering the funding fee.
const MAX_SELECTION_ROUNDS: usize = 3;

fn is_reselectable(e: &TakerError) -> bool {
    matches!(
        e,
        TakerError::MakerTimeout { .. }
            | TakerError::MakerRejected { .. }
            | TakerError::MakerProtocol { .. }
    )
}

fn missing(what: &str) -> TakerError {
    TakerError::General(format!("swap state is missing the {what}"))
}

pub(crate) fn broadcast_error(context: &str, e: BroadcastError) -> TakerError {
    match e {
        BroadcastError::Unavailable(msg) => {
            TakerError::ChainUnavailable(ChainError::Unavailable(msg))
        }
        other => TakerError::General(format!("{context} rejected: {other}")),
    }
}

pub(crate) struct SwapCoordinator<'a> {
    ctx: &'a TakerContext,
    cancel: &'a AtomicBool,
    seed: u64,
}

impl<'a> SwapCoordinator<'a> {
    pub(crate) fn new(ctx: &'a TakerContext, cancel: &'a AtomicBool, seed: u64) -> Self {
        Self { ctx, cancel, seed }
    }

    /// Runs the attempt to a terminal or Recovering status.
    pub(crate) fn drive(&self, attempt: &mut SwapAttempt) -> Result<(), TakerError> {
        self.ctx.persist(attempt)?;
        match self.run(attempt) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("Swap {} failed in {}: {e}", attempt.id, attempt.status);
                self.handle_failure(attempt, &e);
                Err(e)
            }
        }
    }

    fn run(&self, attempt: &mut SwapAttempt) -> Result<(), TakerError> {
        loop {
            self.check_cancel()?;
            let route = self.select(attempt)?;
            attempt.transition(
                SwapStatus::Negotiating,
                Some(format!("route of {} makers", route.len())),
            )?;
            attempt.route = Some(route);
            self.ctx.persist(attempt)?;

            match self.negotiate(attempt) {
                Ok(()) => break,
                Err(e)
                    if is_reselectable(&e)
                        && attempt.reselection_rounds < self.ctx.config.max_reselection_rounds =>
                {
                    if let Some(maker) = e.faulty_maker() {
                        if matches!(e, TakerError::MakerProtocol { .. }) {
                            self.ctx.offerbook.mark_malicious(maker);
                        }
                        attempt.failed_makers.push(maker.clone());
                    }
                    attempt.reselection_rounds += 1;
                    attempt.hops.clear();
                    attempt.maker_fees.clear();
                    attempt.preimage = None;
                    attempt.transition(SwapStatus::Selecting, Some(e.to_string()))?;
                    self.ctx.persist(attempt)?;
                    log::info!(
                        "Re-selecting route, round {} of {}",
                        attempt.reselection_rounds,
                        self.ctx.config.max_reselection_rounds
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.fund(attempt)?;
        self.settle(attempt)?;
        attempt.transition(SwapStatus::Completed, None)?;
        self.ctx.persist(attempt)?;
        log::info!("Swap {} completed", attempt.id);
        Ok(())
    }

    fn check_cancel(&self) -> Result<(), TakerError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(TakerError::Cancelled);
        }
        Ok(())
    }

    fn select(&self, attempt: &SwapAttempt) -> Result<Route, TakerError> {
        let config = &self.ctx.config;
        let book = self.ctx.offerbook.snapshot();
        let policy = RoutePolicy {
            excluded: attempt.failed_makers.iter().cloned().collect(),
            fee_locktime: config.ranking_locktime(attempt.params.maker_count),
            max_required_confirms: config.max_required_confirms,
            min_assigned_locktime: config.refund_locktime_base,
        };
        let seed = self.seed.wrapping_add(u64::from(attempt.reselection_rounds));
        let route = select_route(&attempt.params, &book, &policy, seed)?;
        log::info!(
            "Selected route from offerbook v{}: {}",
            book.version(),
            route
                .addresses()
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(route)
    }

    fn negotiate(&self, attempt: &mut SwapAttempt) -> Result<(), TakerError> {
        let config = &self.ctx.config;
        let route = attempt.route.clone().ok_or_else(|| missing("route"))?;
        let n = route.len();

        let plan = plan_hops(
            attempt.params.send_amount,
            &route,
            config.refund_locktime_base,
            config.refund_locktime_step,
            config.miner_fee_per_hop(),
        )?;
        let preimage = generate_preimage();
        let height = self.ctx.chain.current_height()?;
        let mut hops = plan.contracts(&route, hashlock_of(&preimage), height);

        let locktimes: Vec<u32> = hops.iter().map(|h| h.terms.locktime).collect();
        if let Err(e) = validate_locktime_schedule(&locktimes) {
            log::error!("Refusing locktime schedule {locktimes:?}: {e}");
            return Err(e.into());
        }

        let funding_key = self.ctx.wallet.derive_contract_pubkey()?;
        let receiving_key = self.ctx.wallet.derive_contract_pubkey()?;
        let own_confirms = attempt
            .params
            .required_confirms
            .unwrap_or(config.required_confirms);
        for (k, hop) in hops.iter_mut().enumerate() {
            hop.required_confirms = match route.makers.get(k) {
                Some(maker) => maker.offer.required_confirms,
                None => own_confirms,
            };
        }
        hops[0].sender_pubkey = Some(funding_key);
        hops[n].receiver_pubkey = Some(receiving_key);

        attempt.hops = hops;
        attempt.maker_fees = plan.fees;
        attempt.preimage = Some(preimage);
        self.ctx.persist(attempt)?;

        for (i, maker) in route.makers.iter().enumerate() {
            self.check_cancel()?;
            let terms = HopTerms {
                swap_id: attempt.id.clone(),
                position: i,
                incoming: attempt.hops[i].terms.clone(),
                outgoing: attempt.hops[i + 1].terms.clone(),
                tx_count: attempt.params.tx_count,
            };
            let accept = propose_hop_once(
                &self.ctx.transport,
                config.maker_timeout(),
                &maker.address,
                terms,
            )?;
            attempt.hops[i].receiver_pubkey = Some(accept.hashlock_pubkey);
        }

        let first = &mut attempt.hops[0];
        let receiver = first
            .receiver_pubkey
            .ok_or_else(|| missing("first maker's key"))?;
        first.redeemscript = Some(create_contract_redeemscript(
            &first.terms.hashlock,
            &receiver,
            &funding_key,
            first.terms.locktime,
        )?);
        self.ctx.persist(attempt)
    }

    /// Reserves regular coins covering `amount` plus the funding fee.
    fn reserve_inputs(
        &self,
        attempt: &SwapAttempt,
        amount: Amount,
    ) -> Result<(Vec<OutPoint>, Amount), TakerError> {
        let rate = self.ctx.config.fee_rate;
        let mut ledger = self.ctx.ledger_mut()?;

        let utxos: Vec<Utxo> = match &attempt.params.manually_selected_outpoints {
            Some(outpoints) => outpoints
                .iter()
                .map(|op| ledger.get(op).cloned().ok_or(WalletError::UtxoNotFound(*op)))
                .collect::<Result<_, _>>()?,
            None => {
                let excluded = ledger.locked_outpoints();
                let mut input_count = 1;
                let mut selected = Vec::new();
                for _ in 0..MAX_SELECTION_ROUNDS {
                    let target = amount + funding_fee(input_count, true, rate);
                    selected = self.ctx.wallet.select_inputs(target, &excluded)?;
                    let value: Amount = selected.iter().map(|u| u.value).sum();
                    if value >= amount + funding_fee(selected.len(), false, rate) {
                        break;
                    }
                    input_count = selected.len() + 1;
                }
                for utxo in &selected {
                    ledger.insert_regular(utxo.clone());
                }
                selected
            }
        };

        let outpoints: Vec<OutPoint> = utxos.iter().map(|u| u.outpoint).collect();
        let reserved = ledger.reserve_for_swap(&outpoints, &attempt.id)?;
        let required = amount + funding_fee(outpoints.len(), false, rate);
        if reserved < required {
            ledger.release_swap(&attempt.id);
            return Err(WalletError::InsufficientFund {
                available: reserved.to_sat(),
                required: required.to_sat(),
            }
            .into());
        }
        log::info!(
            "Reserved {} inputs worth {} sats for swap {}",
            outpoints.len(),
            reserved.to_sat(),
            attempt.id
        );
        Ok((outpoints, reserved))
    }

    fn fund(&self, attempt: &mut SwapAttempt) -> Result<(), TakerError> {
        attempt.transition(SwapStatus::Funding, None)?;
        self.ctx.persist(attempt)?;

        let rate = self.ctx.config.fee_rate;
        let amount = attempt.hops[0].terms.amount;
        let redeemscript = attempt.hops[0]
            .redeemscript
            .clone()
            .ok_or_else(|| missing("first hop redeemscript"))?;

        let (inputs, input_value) = self.reserve_inputs(attempt, amount)?;

        self.ctx.check_commitments(attempt, amount)?;

        let fee_with_change = funding_fee(inputs.len(), true, rate);
        let change_value = input_value
            .checked_sub(amount)
            .and_then(|rest| rest.checked_sub(fee_with_change))
            .filter(|change| *change >= DUST_LIMIT);
        let change = match change_value {
            Some(value) => {
                let address = self.ctx.wallet.derive_address(AddressType::P2WPKH)?;
                attempt.taker_addresses.push(address.to_string());
                Some((address.script_pubkey(), value))
            }
            None => None,
        };
        let fee = input_value - amount - change.as_ref().map_or(Amount::ZERO, |(_, v)| *v);

        let unsigned = build_funding_tx(
            &inputs,
            contract_script_pubkey(&redeemscript),
            amount,
            change.clone(),
        );
        let funding_tx = self.ctx.wallet.sign(unsigned, &SpendInfo::SeedCoins)?;
        let txid = funding_tx.compute_txid();
        let contract_outpoint = OutPoint { txid, vout: 0 };

        let refund_address = self.ctx.wallet.derive_address(AddressType::P2WPKH)?;
        attempt.taker_addresses.push(refund_address.to_string());
        let refund = build_contract_spend(
            contract_outpoint,
            amount,
            contract_spend_fee(rate),
            refund_address.script_pubkey(),
            Some(attempt.hops[0].terms.locktime),
        )?;
        let refund = self.ctx.wallet.sign(
            refund,
            &SpendInfo::TimelockContract {
                redeemscript,
                input_value: amount,
            },
        )?;

        let first = &mut attempt.hops[0];
        first.funding_txid = Some(txid);
        first.funding_outpoint = Some(contract_outpoint);
        first.recovery_tx = Some(refund);
        attempt.taker_funding = Some(TakerFunding {
            inputs: inputs.clone(),
            input_value,
            change: change
                .as_ref()
                .map(|(_, value)| (OutPoint { txid, vout: 1 }, *value)),
            fee,
            tx: funding_tx.clone(),
            broadcast: false,
        });
        // The refund must be on disk before the funding can reach the network.
        self.ctx.persist(attempt)?;

        self.check_cancel()?;
        self.ctx
            .chain
            .broadcast(&funding_tx)
            .map_err(|e| broadcast_error("funding transaction", e))?;
        log::info!("Broadcast funding transaction {txid} for hop 0");

        if let Some(funding) = attempt.taker_funding.as_mut() {
            funding.broadcast = true;
        }
        self.ctx.ledger_mut()?.commit_funding(
            &attempt.id,
            &inputs,
            Utxo {
                outpoint: contract_outpoint,
                value: amount,
                script_type: ScriptType::P2WSH,
                confirmations: 0,
                category: UtxoCategory::Regular,
            },
            change.map(|(_, value)| Utxo::regular(OutPoint { txid, vout: 1 }, value, 0)),
        )?;
        attempt.hops[0].set_status(HopStatus::Funded)?;
        self.ctx.persist(attempt)?;

        let route = attempt.route.clone().ok_or_else(|| missing("route"))?;
        let n = route.len();
        for i in 1..=n {
            self.wait_for_hop(attempt, i - 1)?;

            let maker = &route.makers[i - 1].address;
            let receiver_pubkey = attempt.hops[i]
                .receiver_pubkey
                .ok_or_else(|| missing("receiver key"))?;
            let upstream = &attempt.hops[i - 1];
            let request = FundingRequest {
                swap_id: attempt.id.clone(),
                hop_index: i,
                terms: attempt.hops[i].terms.clone(),
                receiver_pubkey,
                upstream_outpoint: upstream
                    .funding_outpoint
                    .ok_or_else(|| missing("upstream outpoint"))?,
                upstream_redeemscript: upstream
                    .redeemscript
                    .clone()
                    .ok_or_else(|| missing("upstream redeemscript"))?,
            };
            let notice = request_funding_once(
                &self.ctx.transport,
                self.ctx.config.maker_timeout(),
                maker,
                request,
            )?;
            let outpoint =
                verify_funding_notice(i, &notice, &attempt.hops[i].terms, &receiver_pubkey)
                    .map_err(|e| TakerError::MakerProtocol {
                        maker: maker.clone(),
                        hop: i,
                        reason: e.to_string(),
                    })?;

            let hop = &mut attempt.hops[i];
            hop.sender_pubkey = Some(notice.timelock_pubkey);
            hop.redeemscript = Some(notice.contract_redeemscript);
            hop.funding_txid = Some(outpoint.txid);
            hop.funding_outpoint = Some(outpoint);
            hop.set_status(HopStatus::Funded)?;
            log::info!("Maker {maker} funded hop {i} at {outpoint}");
            self.ctx.persist(attempt)?;
        }

        self.wait_for_hop(attempt, n)?;
        self.presign_claim(attempt)
    }

    /// Waits for the hop's funding to reach its required confirmations, then marks it Verified.
    fn wait_for_hop(&self, attempt: &mut SwapAttempt, k: usize) -> Result<(), TakerError> {
        let config = &self.ctx.config;
        let hop = &attempt.hops[k];
        let outpoint = hop
            .funding_outpoint
            .ok_or_else(|| missing("funding outpoint"))?;
        log::info!(
            "Waiting for {} confirmations of hop {k} ({outpoint})",
            hop.required_confirms
        );

        match self.ctx.watcher.wait_for_confirmations(
            &outpoint,
            hop.required_confirms,
            config.zero_conf_window(),
            config.funding_timeout(),
            Some(self.cancel),
        ) {
            Ok(confirmations) => {
                log::info!("Hop {k} funding has {confirmations} confirmations")
            }
            Err(WatcherError::Timeout) => return Err(TakerError::FundingTxWaitTimeOut { hop: k }),
            Err(WatcherError::Interrupted) => return Err(TakerError::Cancelled),
            Err(WatcherError::Chain(e)) => return Err(TakerError::ChainUnavailable(e)),
        }

        attempt.hops[k].set_status(HopStatus::Verified)?;
        self.ctx.persist(attempt)
    }

    /// Signs the hashlock sweep of the taker's incoming hop.
    fn presign_claim(&self, attempt: &mut SwapAttempt) -> Result<(), TakerError> {
        let preimage = attempt.preimage.ok_or_else(|| missing("preimage"))?;
        let destination = self.ctx.wallet.derive_address(AddressType::P2WPKH)?;
        attempt.taker_addresses.push(destination.to_string());

        let last = attempt.hops.len() - 1;
        let hop = &attempt.hops[last];
        let redeemscript = hop
            .redeemscript
            .clone()
            .ok_or_else(|| missing("incoming redeemscript"))?;
        let outpoint = hop
            .funding_outpoint
            .ok_or_else(|| missing("incoming outpoint"))?;
        let claim = build_contract_spend(
            outpoint,
            hop.terms.amount,
            contract_spend_fee(self.ctx.config.fee_rate),
            destination.script_pubkey(),
            None,
        )?;
        let claim = self.ctx.wallet.sign(
            claim,
            &SpendInfo::HashlockContract {
                redeemscript,
                input_value: hop.terms.amount,
                preimage,
            },
        )?;
        attempt.hops[last].recovery_tx = Some(claim);
        self.ctx.persist(attempt)
    }

    fn settle(&self, attempt: &mut SwapAttempt) -> Result<(), TakerError> {
        self.check_cancel()?;
        attempt.transition(SwapStatus::Settling, None)?;

        let preimage = attempt.preimage.ok_or_else(|| missing("preimage"))?;
        let route = attempt.route.clone().ok_or_else(|| missing("route"))?;
        let n = route.len();

        // Hop 0 stops being refundable before the secret leaves the taker.
        attempt.preimage_revealed = true;
        self.ctx.persist(attempt)?;

        // Last hop first: every maker learns the secret only after its outgoing hop is safe.
        // A silent maker does not stop the others from learning the secret.
        let mut failure = None;
        for j in (1..=n).rev() {
            let maker = &route.makers[j - 1].address;
            match send_settlement_once(
                &self.ctx.transport,
                self.ctx.config.maker_timeout(),
                maker,
                Settlement {
                    swap_id: attempt.id.clone(),
                    hop_index: j,
                    preimage,
                },
            ) {
                Ok(()) => {
                    attempt.hops[j].preimage_delivered = true;
                    if j < n {
                        attempt.hops[j].set_status(HopStatus::Settled)?;
                    }
                }
                Err(e) => {
                    log::warn!("Settlement of hop {j} with {maker} failed: {e}");
                    failure.get_or_insert(e);
                }
            }
            if j == n {
                self.claim_incoming(attempt)?;
            }
            self.ctx.persist(attempt)?;
        }
        if let Some(e) = failure {
            return Err(e);
        }

        attempt.hops[0].set_status(HopStatus::Settled)?;
        if let Some(outpoint) = attempt.hops[0].funding_outpoint {
            self.ctx.ledger_mut()?.resolve_contract(&outpoint, None);
        }
        self.ctx.persist(attempt)
    }

    fn claim_incoming(&self, attempt: &mut SwapAttempt) -> Result<(), TakerError> {
        let last = attempt.hops.len() - 1;
        let claim: Transaction = attempt.hops[last]
            .recovery_tx
            .clone()
            .ok_or_else(|| missing("incoming claim"))?;
        let txid = self
            .ctx
            .chain
            .broadcast(&claim)
            .map_err(|e| broadcast_error("incoming hop claim", e))?;
        log::info!("Broadcast claim {txid} of incoming hop {last}");

        let value = claim
            .output
            .first()
            .map(|out| out.value)
            .ok_or_else(|| missing("claim output"))?;
        let hop = &mut attempt.hops[last];
        hop.set_status(HopStatus::Settled)?;
        attempt.contract_spend_fees += hop.terms.amount.checked_sub(value).unwrap_or(Amount::ZERO);
        self.ctx
            .ledger_mut()?
            .insert_regular(Utxo::regular(OutPoint { txid, vout: 0 }, value, 0));
        Ok(())
    }

    /// Moves a failed attempt to Aborted, or to Recovering when funds may be on chain.
    fn handle_failure(&self, attempt: &mut SwapAttempt, error: &TakerError) {
        attempt.failure = Some(error.to_string());
        if let TakerError::MakerProtocol { maker, .. } = error {
            self.ctx.offerbook.mark_malicious(maker);
        }

        let funding_built = attempt.taker_funding.is_some();
        let funds_at_risk = match attempt.status {
            SwapStatus::Selecting | SwapStatus::Negotiating => false,
            SwapStatus::Funding => {
                attempt
                    .taker_funding
                    .as_ref()
                    .is_some_and(|funding| funding.broadcast)
                    || (funding_built
                        && matches!(
                            error,
                            TakerError::Cancelled | TakerError::ChainUnavailable(_)
                        ))
            }
            SwapStatus::Settling => true,
            SwapStatus::Completed | SwapStatus::Aborted | SwapStatus::Recovering => {
                if let Err(e) = self.ctx.persist(attempt) {
                    log::error!("Failed to persist swap {}: {e:?}", attempt.id);
                }
                return;
            }
        };

        if !funds_at_risk {
            match self.ctx.ledger_mut() {
                Ok(mut ledger) => {
                    let released = ledger.release_swap(&attempt.id);
                    if !released.is_empty() {
                        log::info!("Released {} reserved inputs", released.len());
                    }
                }
                Err(e) => log::error!("{e:?}"),
            }
            for hop in attempt.hops.iter_mut() {
                if hop.status == HopStatus::Proposed {
                    if let Err(e) = hop.set_status(HopStatus::Failed) {
                        log::error!("{e:?}");
                    }
                }
            }
            if let Err(e) = attempt.transition(SwapStatus::Aborted, Some(error.to_string())) {
                log::error!("{e:?}");
            }
            if let Err(e) = self.ctx.persist(attempt) {
                log::error!("Failed to persist swap {}: {e:?}", attempt.id);
            }
            return;
        }

        if let Err(e) = attempt.transition(SwapStatus::Recovering, Some(error.to_string())) {
            log::error!("{e:?}");
            return;
        }
        if let Err(e) = self.ctx.persist(attempt) {
            log::error!("Failed to persist swap {}: {e:?}", attempt.id);
        }
        match RecoveryManager::new(self.ctx).recover(attempt) {
            Ok(outcome) if outcome.complete => {
                log::info!("Swap {} recovered immediately", attempt.id)
            }
            Ok(outcome) => log::info!(
                "Swap {} waiting on {} timelocked refunds",
                attempt.id,
                outcome.pending.len()
            ),
            Err(e) => log::warn!("Recovery of swap {} will be retried: {e:?}", attempt.id),
        }
    }
}
