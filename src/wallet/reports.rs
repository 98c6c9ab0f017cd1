//! Swap report generation and persistence for the taker.
//!
//! [`build_swap_report`] turns a finished [`SwapAttempt`] into a [`SwapReport`]. It never fails:
//! whatever the attempt does not know yet is reported as zero or empty.
//!
//! Reports are persisted as a JSON array in `{data_dir}/swap_reports.json`, allowing historical
//! tracking.

use std::{io::BufWriter, path::Path};

use bitcoin::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    taker::swap::{HopStatus, SwapAttempt, SwapStatus},
    wallet::WalletError,
};

/// Information about individual maker fees in a swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakerFeeInfo {
    /// Index of maker in the swap route
    pub maker_index: usize,
    /// Maker Addresses (Onion:Port)
    pub maker_address: String,
    /// The fixed Base Fee for each maker
    pub base_fee: u64,
    /// Dynamic Amount Fee for each maker
    pub amount_relative_fee: u64,
    /// Dynamic Time Fee (decreases for subsequent makers) for each maker
    pub time_relative_fee: u64,
    /// All inclusive fee for each maker
    pub total_fee: u64,
}

/// Complete report of a taker swap attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapReport {
    /// Unique swap ID
    pub swap_id: String,
    /// Final status of the attempt
    pub status: SwapStatus,
    /// Why the attempt did not complete
    pub failure_reason: Option<String>,
    /// Target amount for the swap
    pub target_amount: u64,
    /// Amount locked in the hop paying the taker, once settled
    pub amount_received: u64,
    /// Total maker fees
    pub total_maker_fees: u64,
    /// Mining fees the makers deducted to fund their outgoing hops
    pub relay_mining_fee: u64,
    /// Mining fees paid by the taker itself: funding, claims and refunds
    pub taker_mining_fee: u64,
    /// All mining fees
    pub mining_fee: u64,
    /// Total fees paid
    pub total_fee: u64,
    /// Fee percentage relative to target amount
    pub fee_percentage: f64,
    /// Number of makers involved
    pub makers_count: usize,
    /// Hops that reached Settled
    pub hops_completed: usize,
    /// Hops of the route
    pub total_hops: usize,
    /// List of maker addresses used
    pub maker_addresses: Vec<String>,
    /// Individual maker fee information
    pub maker_fee_info: Vec<MakerFeeInfo>,
    /// Funding transaction IDs organized by hops
    pub funding_txids_by_hop: Vec<Option<String>>,
    /// Addresses derived by the taker for this swap
    pub taker_addresses: Vec<String>,
    /// Start of the attempt
    pub started_at: DateTime<Utc>,
    /// End of the attempt
    pub finished_at: DateTime<Utc>,
    /// Duration of the swap in seconds
    pub swap_duration_seconds: f64,
}

/// Summarizes an attempt.
pub fn build_swap_report(attempt: &SwapAttempt) -> SwapReport {
    let target_amount = attempt.params.send_amount.to_sat();
    let funding_broadcast = attempt
        .taker_funding
        .as_ref()
        .is_some_and(|funding| funding.broadcast);

    // Makers only earn once the taker's coins left the wallet.
    let (total_maker_fees, relay_mining_fee) = match (funding_broadcast, attempt.hops.last()) {
        (true, Some(last)) => {
            let maker_fees = attempt.total_maker_fees();
            let relay = attempt
                .params
                .send_amount
                .checked_sub(last.terms.amount)
                .and_then(|a| a.checked_sub(maker_fees))
                .unwrap_or(Amount::ZERO);
            (maker_fees.to_sat(), relay.to_sat())
        }
        _ => (0, 0),
    };

    let amount_received = attempt
        .hops
        .last()
        .filter(|hop| hop.is_taker_received() && hop.status == HopStatus::Settled)
        .map(|hop| hop.terms.amount.to_sat())
        .unwrap_or(0);

    let funding_fee = attempt
        .taker_funding
        .as_ref()
        .filter(|funding| funding.broadcast)
        .map(|funding| funding.fee.to_sat())
        .unwrap_or(0);
    let taker_mining_fee = funding_fee + attempt.contract_spend_fees.to_sat();
    let mining_fee = taker_mining_fee + relay_mining_fee;
    let total_fee = total_maker_fees + mining_fee;
    let fee_percentage = if target_amount > 0 {
        total_fee as f64 / target_amount as f64 * 100.0
    } else {
        0.0
    };

    let maker_fee_info = attempt
        .maker_fees
        .iter()
        .map(|fee| MakerFeeInfo {
            maker_index: fee.position,
            maker_address: fee.address.to_string(),
            base_fee: fee.breakdown.base,
            amount_relative_fee: fee.breakdown.amount_relative,
            time_relative_fee: fee.breakdown.time_relative,
            total_fee: fee.breakdown.total(),
        })
        .collect();

    let finished_at = attempt
        .finished_at
        .or_else(|| attempt.transitions.last().map(|t| t.at))
        .unwrap_or(attempt.started_at);
    let swap_duration_seconds =
        (finished_at - attempt.started_at).num_milliseconds().max(0) as f64 / 1000.0;

    SwapReport {
        swap_id: attempt.id.clone(),
        status: attempt.status,
        failure_reason: attempt.failure.clone(),
        target_amount,
        amount_received,
        total_maker_fees,
        relay_mining_fee,
        taker_mining_fee,
        mining_fee,
        total_fee,
        fee_percentage,
        makers_count: attempt.route.as_ref().map_or(0, |r| r.len()),
        hops_completed: attempt.hops_settled(),
        total_hops: attempt.hops.len(),
        maker_addresses: attempt
            .route
            .as_ref()
            .map(|r| r.addresses().iter().map(|a| a.to_string()).collect())
            .unwrap_or_default(),
        maker_fee_info,
        funding_txids_by_hop: attempt
            .hops
            .iter()
            .map(|hop| hop.funding_txid.map(|txid| txid.to_string()))
            .collect(),
        taker_addresses: attempt.taker_addresses.clone(),
        started_at: attempt.started_at,
        finished_at,
        swap_duration_seconds,
    }
}

impl SwapReport {
    /// Logs the report.
    pub fn print(&self) {
        log::info!("================ SWAP REPORT ================");
        log::info!("Swap ID           : {}", self.swap_id);
        log::info!("Status            : {}", self.status);
        log::info!("Duration          : {:.2} seconds", self.swap_duration_seconds);
        log::info!("Target Amount     : {} sats", self.target_amount);
        log::info!("Amount Received   : {} sats", self.amount_received);
        log::info!(
            "Hops Completed    : {}/{}",
            self.hops_completed,
            self.total_hops
        );
        for info in &self.maker_fee_info {
            log::info!(
                "Maker {} ({}) fee : {} sats (base {}, amount {}, time {})",
                info.maker_index,
                info.maker_address,
                info.total_fee,
                info.base_fee,
                info.amount_relative_fee,
                info.time_relative_fee
            );
        }
        log::info!(
            "Fees              : {} sats ({:.4}%), mining {} sats",
            self.total_fee,
            self.fee_percentage,
            self.mining_fee
        );
        if let Some(reason) = &self.failure_reason {
            log::info!("Failure           : {reason}");
        }
    }
}

/// Persists a taker swap report to the data directory.
///
/// Reports are stored as a JSON array in `{data_dir}/swap_reports.json`,
/// appending to existing reports to maintain history.
pub fn persist_taker_report(data_dir: &Path, report: &SwapReport) -> Result<(), WalletError> {
    let reports_path = data_dir.join("swap_reports.json");
    std::fs::create_dir_all(data_dir)?;

    // Load existing reports or create empty vec
    let mut reports: Vec<SwapReport> = if reports_path.exists() {
        let file = std::fs::File::open(&reports_path)?;
        match serde_json::from_reader(&file) {
            Ok(existing) => existing,
            Err(e) => {
                log::error!(
                    "Swap reports corrupted at {:?}. Starting fresh. Error: {:?}",
                    reports_path,
                    e
                );
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    reports.push(report.clone());

    let file = std::fs::File::create(&reports_path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, &reports)?;

    Ok(())
}
