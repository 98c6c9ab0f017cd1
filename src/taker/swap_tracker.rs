//! Persistent swap tracker for crash-resilient recovery.
//!
//! Stores one [`SwapRecord`] per swap to `{data_dir}/swap_tracker.cbor` using atomic writes
//! (write-to-tmp then rename). The coordinator saves the record before any funding broadcast and
//! at every transition, so the taker can resume recovery after a crash at any point during a swap.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::utill::{now_secs, write_atomically};

use super::{
    error::TakerError,
    swap::{SwapAttempt, SwapStatus},
};

/// A persistent record of a single swap's state and progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRecord {
    /// The attempt, its route, hop contracts and transition log.
    pub attempt: SwapAttempt,
    /// Set once every hop of a Recovering attempt is resolved.
    pub recovered: bool,
    /// Creation time, secs since epoch.
    pub created_at: u64,
    /// Last update, secs since epoch.
    pub updated_at: u64,
}

impl SwapRecord {
    /// A fresh record for `attempt`.
    pub fn new(attempt: SwapAttempt) -> Self {
        let now = now_secs();
        Self {
            attempt,
            recovered: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Swap identifier.
    pub fn swap_id(&self) -> &str {
        &self.attempt.id
    }

    /// Whether the recovery manager still has work on this swap.
    pub fn needs_recovery(&self) -> bool {
        !self.attempt.status.is_terminal() && !self.recovered
    }
}

impl fmt::Display for SwapRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] status={} amt={} makers={}",
            self.attempt.id,
            self.attempt.status,
            self.attempt.params.send_amount.to_sat(),
            self.attempt.params.maker_count,
        )?;
        if self.attempt.status == SwapStatus::Recovering {
            write!(f, " recovered={}", self.recovered)?;
        }
        for hop in &self.attempt.hops {
            write!(
                f,
                "\n  hop {} {} -> {} : {} sats, locktime {}, {}",
                hop.index,
                hop.sender,
                hop.receiver,
                hop.terms.amount.to_sat(),
                hop.terms.locktime,
                hop.status
            )?;
        }
        Ok(())
    }
}

/// Internal storage format for the tracker.
#[derive(Serialize, Deserialize, Default)]
struct SwapTrackerData {
    swaps: HashMap<String, SwapRecord>,
}

/// Persistent swap tracker backed by a CBOR file with atomic writes.
pub struct SwapTracker {
    path: PathBuf,
    data: SwapTrackerData,
}

impl SwapTracker {
    /// Load tracker from disk or create a new empty one.
    pub fn load_or_create(data_dir: &Path) -> Result<Self, TakerError> {
        let path = data_dir.join("swap_tracker.cbor");
        let data = if path.exists() {
            let bytes = std::fs::read(&path)?;
            match serde_cbor::from_slice(&bytes) {
                Ok(data) => data,
                Err(e) => {
                    // Dropping records of unfinished swaps could lose funds, refuse to start.
                    log::error!("Swap tracker corrupted at {path:?}: {e}");
                    return Err(e.into());
                }
            }
        } else {
            SwapTrackerData::default()
        };

        Ok(Self { path, data })
    }

    fn flush(&self) -> Result<(), TakerError> {
        let bytes = serde_cbor::to_vec(&self.data)?;
        write_atomically(&self.path, &bytes)?;
        Ok(())
    }

    /// Upsert a swap record and flush to disk.
    pub fn save_record(&mut self, record: &SwapRecord) -> Result<(), TakerError> {
        let mut record = record.clone();
        record.updated_at = now_secs();
        self.data
            .swaps
            .insert(record.swap_id().to_string(), record);
        self.flush()
    }

    /// Saves `attempt`, keeping the creation time and recovered flag of an existing record.
    pub fn save_attempt(&mut self, attempt: &SwapAttempt) -> Result<(), TakerError> {
        let record = match self.data.swaps.get(&attempt.id) {
            Some(existing) => SwapRecord {
                attempt: attempt.clone(),
                ..existing.clone()
            },
            None => SwapRecord::new(attempt.clone()),
        };
        self.save_record(&record)
    }

    /// Remove a swap record and flush to disk.
    pub fn remove_record(&mut self, swap_id: &str) -> Result<(), TakerError> {
        self.data.swaps.remove(swap_id);
        self.flush()
    }

    /// Records the recovery manager still has to look at.
    pub fn incomplete_swaps(&self) -> Vec<&SwapRecord> {
        let mut records: Vec<&SwapRecord> = self
            .data
            .swaps
            .values()
            .filter(|r| r.needs_recovery())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Get a reference to a swap record by ID.
    pub fn get_record(&self, swap_id: &str) -> Option<&SwapRecord> {
        self.data.swaps.get(swap_id)
    }

    /// Log all swap records at INFO level.
    pub fn log_state(&self) {
        if self.data.swaps.is_empty() {
            log::info!("[SwapTracker] (empty, no records)");
            return;
        }
        for record in self.data.swaps.values() {
            for line in format!("{record}").lines() {
                log::info!("[SwapTracker] {line}");
            }
        }
    }
}
