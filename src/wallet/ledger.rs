//! The taker's UTXO ledger.
//!
//! Tracks every output the taker owns together with its category. Categories only change through
//! the transitions below, which are driven by the swap coordinator and the recovery manager:
//!
//! ```text
//! Regular --reserve--> SwapInFlight(inputs) --funding broadcast--> SwapInFlight(contract)
//!    ^                        |                                          |
//!    +-------release----------+           settled: removed / refunded: Regular output
//! ```

use std::collections::{BTreeMap, HashSet};

use bitcoin::{Amount, OutPoint};
use serde::{Deserialize, Serialize};

use super::{api::Balances, WalletError};

/// Category of a UTXO.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UtxoCategory {
    /// Spendable wallet coin.
    Regular,
    /// Committed to the swap attempt with this id.
    SwapInFlight {
        /// Owning swap attempt.
        swap_id: String,
    },
    /// Locked in a fidelity bond.
    FidelityBond,
    /// Watched but not owned.
    External,
}

/// Script type of a UTXO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptType {
    /// Segwit v0 single key.
    P2WPKH,
    /// Segwit v0 script, hop contracts.
    P2WSH,
    /// Taproot.
    P2TR,
    /// Anything else.
    Other,
}

/// A single output tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// The outpoint.
    pub outpoint: OutPoint,
    /// Its value.
    pub value: Amount,
    /// Script type.
    pub script_type: ScriptType,
    /// Confirmations, 0 while in the mempool.
    pub confirmations: u32,
    /// Category tag.
    pub category: UtxoCategory,
}

impl Utxo {
    /// A regular P2WPKH wallet coin.
    pub fn regular(outpoint: OutPoint, value: Amount, confirmations: u32) -> Self {
        Self {
            outpoint,
            value,
            script_type: ScriptType::P2WPKH,
            confirmations,
            category: UtxoCategory::Regular,
        }
    }

    fn in_flight(&self) -> Option<&str> {
        match &self.category {
            UtxoCategory::SwapInFlight { swap_id } => Some(swap_id),
            _ => None,
        }
    }
}

/// The UTXO ledger.
#[derive(Debug, Default, Clone)]
pub struct UtxoLedger {
    utxos: BTreeMap<OutPoint, Utxo>,
}

impl UtxoLedger {
    /// Builds a ledger from the wallet's current UTXOs.
    pub fn new(utxos: Vec<Utxo>) -> Self {
        let mut ledger = Self::default();
        ledger.sync(utxos);
        ledger
    }

    /// Reconciles the ledger with a fresh wallet listing.
    ///
    /// Confirmation counts are refreshed, new coins are added and coins the wallet no longer
    /// reports are dropped. Swap-tagged entries are kept as they are, their fate is decided by
    /// the coordinator and the recovery manager only.
    pub fn sync(&mut self, wallet_utxos: Vec<Utxo>) {
        let listed: HashSet<OutPoint> = wallet_utxos.iter().map(|u| u.outpoint).collect();
        self.utxos
            .retain(|outpoint, utxo| listed.contains(outpoint) || utxo.in_flight().is_some());

        for mut utxo in wallet_utxos {
            match self.utxos.get_mut(&utxo.outpoint) {
                Some(existing) => existing.confirmations = utxo.confirmations,
                None => {
                    if utxo.in_flight().is_some() {
                        utxo.category = UtxoCategory::Regular;
                    }
                    self.utxos.insert(utxo.outpoint, utxo);
                }
            }
        }
    }

    /// Looks up a UTXO.
    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.get(outpoint)
    }

    /// All tracked UTXOs ordered by outpoint.
    pub fn utxos(&self) -> Vec<Utxo> {
        self.utxos.values().cloned().collect()
    }

    /// Outpoints that must not be picked as swap inputs.
    pub fn locked_outpoints(&self) -> HashSet<OutPoint> {
        self.utxos
            .values()
            .filter(|u| u.category != UtxoCategory::Regular)
            .map(|u| u.outpoint)
            .collect()
    }

    /// Total value tagged for a swap.
    pub fn swap_value(&self, swap_id: &str) -> Amount {
        self.utxos
            .values()
            .filter(|u| u.in_flight() == Some(swap_id))
            .map(|u| u.value)
            .sum()
    }

    /// Moves Regular coins to SwapInFlight for `swap_id`.
    ///
    /// Either all outpoints move or none does. Returns their total value.
    pub fn reserve_for_swap(
        &mut self,
        outpoints: &[OutPoint],
        swap_id: &str,
    ) -> Result<Amount, WalletError> {
        let target = UtxoCategory::SwapInFlight {
            swap_id: swap_id.to_string(),
        };
        for outpoint in outpoints {
            let utxo = self
                .utxos
                .get(outpoint)
                .ok_or(WalletError::UtxoNotFound(*outpoint))?;
            if utxo.category != UtxoCategory::Regular {
                return Err(WalletError::IllegalCategoryTransition {
                    outpoint: *outpoint,
                    from: utxo.category.clone(),
                    to: target,
                });
            }
        }

        let mut total = Amount::ZERO;
        for outpoint in outpoints {
            if let Some(utxo) = self.utxos.get_mut(outpoint) {
                utxo.category = target.clone();
                total += utxo.value;
            }
        }
        Ok(total)
    }

    /// Returns every coin of `swap_id` to Regular. Used when an attempt aborts before funding.
    pub fn release_swap(&mut self, swap_id: &str) -> Vec<OutPoint> {
        let mut released = Vec::new();
        for utxo in self.utxos.values_mut() {
            if utxo.in_flight() == Some(swap_id) {
                utxo.category = UtxoCategory::Regular;
                released.push(utxo.outpoint);
            }
        }
        released
    }

    /// Applies a broadcast funding transaction.
    ///
    /// The reserved inputs are spent, the contract output takes their place in the swap and the
    /// change comes back as a Regular coin. Re-applying the same funding is a no-op.
    pub fn commit_funding(
        &mut self,
        swap_id: &str,
        spent: &[OutPoint],
        contract: Utxo,
        change: Option<Utxo>,
    ) -> Result<(), WalletError> {
        if self.utxos.contains_key(&contract.outpoint) {
            return Ok(());
        }
        for outpoint in spent {
            match self.utxos.get(outpoint) {
                Some(utxo) if utxo.in_flight() == Some(swap_id) => {}
                Some(utxo) => {
                    return Err(WalletError::IllegalCategoryTransition {
                        outpoint: *outpoint,
                        from: utxo.category.clone(),
                        to: UtxoCategory::SwapInFlight {
                            swap_id: swap_id.to_string(),
                        },
                    })
                }
                None => return Err(WalletError::UtxoNotFound(*outpoint)),
            }
        }

        for outpoint in spent {
            self.utxos.remove(outpoint);
        }
        let mut contract = contract;
        contract.category = UtxoCategory::SwapInFlight {
            swap_id: swap_id.to_string(),
        };
        contract.script_type = ScriptType::P2WSH;
        self.utxos.insert(contract.outpoint, contract);
        if let Some(change) = change {
            self.insert_regular(change);
        }
        Ok(())
    }

    /// Re-tags a contract output of an unfinished swap, used when reloading state at startup.
    pub fn track_contract(&mut self, swap_id: &str, mut contract: Utxo) {
        contract.category = UtxoCategory::SwapInFlight {
            swap_id: swap_id.to_string(),
        };
        contract.script_type = ScriptType::P2WSH;
        self.utxos.insert(contract.outpoint, contract);
    }

    /// Settles a swap contract output.
    ///
    /// The contract leaves the ledger and `received`, the output the taker got back from it if
    /// any, enters as Regular. Idempotent. Returns whether anything changed.
    pub fn resolve_contract(&mut self, contract: &OutPoint, received: Option<Utxo>) -> bool {
        let mut changed = false;
        if self
            .utxos
            .get(contract)
            .is_some_and(|u| u.in_flight().is_some())
        {
            self.utxos.remove(contract);
            changed = true;
        }
        if let Some(received) = received {
            changed |= self.insert_regular(received);
        }
        changed
    }

    /// Adds a coin as Regular unless already tracked. Returns whether it was added.
    pub fn insert_regular(&mut self, mut utxo: Utxo) -> bool {
        if self.utxos.contains_key(&utxo.outpoint) {
            return false;
        }
        utxo.category = UtxoCategory::Regular;
        self.utxos.insert(utxo.outpoint, utxo);
        true
    }

    /// Balances by category.
    pub fn balances(&self) -> Balances {
        let mut balances = Balances::default();
        for utxo in self.utxos.values() {
            match utxo.category {
                UtxoCategory::Regular => {
                    if utxo.confirmations > 0 {
                        balances.confirmed += utxo.value;
                    } else {
                        balances.unconfirmed += utxo.value;
                    }
                    balances.spendable += utxo.value;
                }
                UtxoCategory::SwapInFlight { .. } => balances.swap += utxo.value,
                UtxoCategory::FidelityBond => balances.fidelity += utxo.value,
                UtxoCategory::External => continue,
            }
            balances.total += utxo.value;
        }
        balances
    }
}
