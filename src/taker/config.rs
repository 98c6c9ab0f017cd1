//! Taker configuration. Controlling various behaviors.
//!
//! This module defines the configuration options for the Taker module: offerbook syncing and maker
//! backoff, maker timeouts, the refund locktime schedule, fee settings and recovery.

use std::{io, io::Write, path::Path, time::Duration};

use bitcoin::Amount;

use crate::utill::{get_taker_dir, parse_field, parse_toml};

use super::offers::{BackoffPolicy, OfferSyncConfig};

/// Taker configuration
///
/// This struct defines all configurable parameters for the Taker app.
#[derive(Debug, Clone, PartialEq)]
pub struct TakerConfig {
    /// Pause between two offerbook sync passes (default: 600)
    pub offer_sync_interval_secs: u64,
    /// Pause between two full maker directory refreshes (default: 1800)
    pub directory_refresh_interval_secs: u64,
    /// Consecutive failures after which a maker is skipped until the next refresh (default: 10)
    pub max_maker_retries: u32,
    /// Backoff after the first failed offer request (default: 30)
    pub backoff_base_secs: u64,
    /// Upper bound of the backoff (default: 3600)
    pub backoff_max_secs: u64,
    /// Bound on every request to a maker (default: 30000)
    pub maker_timeout_ms: u64,
    /// Bound on the wait for each funding confirmation (default: 3600)
    pub funding_timeout_secs: u64,
    /// How long a 0-conf funding must stay visible before it is accepted (default: 0)
    pub zero_conf_window_secs: u64,
    /// Makers asking for more confirmations are not selected (default: 6)
    pub max_required_confirms: u32,
    /// Confirmations awaited on the hop paying the taker (default: 1)
    pub required_confirms: u32,
    /// Refund locktime of the last hop, in blocks (default: 20)
    pub refund_locktime_base: u16,
    /// Locktime added per upstream hop, in blocks (default: 20)
    pub refund_locktime_step: u16,
    /// Route re-selections allowed per swap (default: 3)
    pub max_reselection_rounds: u32,
    /// Fee rate of the taker's transactions, sat/vB (default: 2.0)
    pub fee_rate: f64,
    /// Mining fee each maker deducts to fund its outgoing hop, in sats (default: 1000)
    pub miner_fee_per_hop: u64,
    /// Fee bumps tried on a refund or claim rejected for low fee (default: 3)
    pub max_fee_bumps: u32,
    /// Pause between two background recovery passes (default: 60)
    pub recovery_interval_secs: u64,
    /// Chain polling interval while waiting for confirmations (default: 1000)
    pub chain_poll_ms: u64,
    /// Start the offerbook sync service at init (default: true)
    pub background_sync: bool,
    /// Start the recovery loop at init (default: true)
    pub background_recovery: bool,
    /// Maker addresses known without any directory, comma separated in the file
    pub maker_addresses: Vec<String>,
}

impl Default for TakerConfig {
    fn default() -> Self {
        Self {
            offer_sync_interval_secs: 600,
            directory_refresh_interval_secs: 1800,
            max_maker_retries: 10,
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
            maker_timeout_ms: 30_000,
            funding_timeout_secs: 3600,
            zero_conf_window_secs: 0,
            max_required_confirms: 6,
            required_confirms: 1,
            refund_locktime_base: 20,
            refund_locktime_step: 20,
            max_reselection_rounds: 3,
            fee_rate: 2.0,
            miner_fee_per_hop: 1000,
            max_fee_bumps: 3,
            recovery_interval_secs: 60,
            chain_poll_ms: 1000,
            background_sync: true,
            background_recovery: true,
            maker_addresses: Vec::new(),
        }
    }
}

impl TakerConfig {
    /// Constructs a [`TakerConfig`] from a config file. Or create default configs and load them.
    ///
    /// If the file does not exist, a new default-config is written at that location and loaded.
    /// If no path is provided, the default location is used.
    /// Unknown keys are ignored and malformed values fall back to their defaults.
    ///
    /// Default data-dir for linux: `~/.coinswap/taker`
    /// Default config locations: `~/.coinswap/taker/config.toml`.
    pub fn new(config_path: Option<&Path>) -> io::Result<Self> {
        let default_config_path = get_taker_dir().join("config.toml");

        let config_path = config_path.unwrap_or(&default_config_path);

        let default_config = Self::default();

        if !config_path.exists() || std::fs::metadata(config_path)?.len() == 0 {
            log::warn!(
                "Taker config file not found, creating default config file at path: {}",
                config_path.display()
            );
            default_config.write_to_file(config_path)?;
        }

        let config_map = parse_toml(config_path)?;

        log::info!(
            "Successfully loaded config file from : {}",
            config_path.display()
        );

        let maker_addresses = config_map
            .get("maker_addresses")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(default_config.maker_addresses);

        Ok(TakerConfig {
            offer_sync_interval_secs: parse_field(
                config_map.get("offer_sync_interval_secs"),
                default_config.offer_sync_interval_secs,
            ),
            directory_refresh_interval_secs: parse_field(
                config_map.get("directory_refresh_interval_secs"),
                default_config.directory_refresh_interval_secs,
            ),
            max_maker_retries: parse_field(
                config_map.get("max_maker_retries"),
                default_config.max_maker_retries,
            ),
            backoff_base_secs: parse_field(
                config_map.get("backoff_base_secs"),
                default_config.backoff_base_secs,
            ),
            backoff_max_secs: parse_field(
                config_map.get("backoff_max_secs"),
                default_config.backoff_max_secs,
            ),
            maker_timeout_ms: parse_field(
                config_map.get("maker_timeout_ms"),
                default_config.maker_timeout_ms,
            ),
            funding_timeout_secs: parse_field(
                config_map.get("funding_timeout_secs"),
                default_config.funding_timeout_secs,
            ),
            zero_conf_window_secs: parse_field(
                config_map.get("zero_conf_window_secs"),
                default_config.zero_conf_window_secs,
            ),
            max_required_confirms: parse_field(
                config_map.get("max_required_confirms"),
                default_config.max_required_confirms,
            ),
            required_confirms: parse_field(
                config_map.get("required_confirms"),
                default_config.required_confirms,
            ),
            refund_locktime_base: parse_field(
                config_map.get("refund_locktime_base"),
                default_config.refund_locktime_base,
            ),
            refund_locktime_step: parse_field(
                config_map.get("refund_locktime_step"),
                default_config.refund_locktime_step,
            ),
            max_reselection_rounds: parse_field(
                config_map.get("max_reselection_rounds"),
                default_config.max_reselection_rounds,
            ),
            fee_rate: parse_field(config_map.get("fee_rate"), default_config.fee_rate),
            miner_fee_per_hop: parse_field(
                config_map.get("miner_fee_per_hop"),
                default_config.miner_fee_per_hop,
            ),
            max_fee_bumps: parse_field(
                config_map.get("max_fee_bumps"),
                default_config.max_fee_bumps,
            ),
            recovery_interval_secs: parse_field(
                config_map.get("recovery_interval_secs"),
                default_config.recovery_interval_secs,
            ),
            chain_poll_ms: parse_field(
                config_map.get("chain_poll_ms"),
                default_config.chain_poll_ms,
            ),
            background_sync: parse_field(
                config_map.get("background_sync"),
                default_config.background_sync,
            ),
            background_recovery: parse_field(
                config_map.get("background_recovery"),
                default_config.background_recovery,
            ),
            maker_addresses,
        })
    }

    /// This method serializes the TakerConfig into a TOML format and writes it to disk.
    /// It creates the parent directory if it doesn't exist.
    pub fn write_to_file(&self, path: &Path) -> std::io::Result<()> {
        let toml_data = format!(
            "# Taker Configuration File
# Seconds between offerbook sync passes
offer_sync_interval_secs = {}
# Seconds between full maker directory refreshes
directory_refresh_interval_secs = {}
# Failed offer requests before a maker is skipped until the next refresh
max_maker_retries = {}
# Backoff after the first failed offer request, doubled on every failure
backoff_base_secs = {}
# Maximum backoff
backoff_max_secs = {}
# Timeout of every maker request, in milliseconds
maker_timeout_ms = {}
# Timeout of each funding confirmation wait
funding_timeout_secs = {}
# Seconds a 0-conf funding must stay visible before it is accepted
zero_conf_window_secs = {}
# Makers requiring more confirmations are never selected
max_required_confirms = {}
# Confirmations awaited on the hop paying the taker
required_confirms = {}
# Refund locktime of the last hop, in blocks
refund_locktime_base = {}
# Locktime added per upstream hop, in blocks
refund_locktime_step = {}
# Route re-selections allowed per swap
max_reselection_rounds = {}
# Fee rate of taker transactions, sat/vB
fee_rate = {}
# Mining fee each maker deducts to fund its outgoing hop, in sats
miner_fee_per_hop = {}
# Fee bumps tried on refunds and claims rejected for low fee
max_fee_bumps = {}
# Seconds between background recovery passes
recovery_interval_secs = {}
# Chain polling interval, in milliseconds
chain_poll_ms = {}
# Start the offerbook sync service at init
background_sync = {}
# Start the recovery loop at init
background_recovery = {}
# Static maker addresses, comma separated host:port
maker_addresses = {}",
            self.offer_sync_interval_secs,
            self.directory_refresh_interval_secs,
            self.max_maker_retries,
            self.backoff_base_secs,
            self.backoff_max_secs,
            self.maker_timeout_ms,
            self.funding_timeout_secs,
            self.zero_conf_window_secs,
            self.max_required_confirms,
            self.required_confirms,
            self.refund_locktime_base,
            self.refund_locktime_step,
            self.max_reselection_rounds,
            self.fee_rate,
            self.miner_fee_per_hop,
            self.max_fee_bumps,
            self.recovery_interval_secs,
            self.chain_poll_ms,
            self.background_sync,
            self.background_recovery,
            self.maker_addresses.join(","),
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(path)?;
        file.write_all(toml_data.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Bound on every maker request.
    pub fn maker_timeout(&self) -> Duration {
        Duration::from_millis(self.maker_timeout_ms)
    }

    /// Bound on each funding confirmation wait.
    pub fn funding_timeout(&self) -> Duration {
        Duration::from_secs(self.funding_timeout_secs)
    }

    /// Acceptance window of 0-conf fundings.
    pub fn zero_conf_window(&self) -> Duration {
        Duration::from_secs(self.zero_conf_window_secs)
    }

    /// Period of the background recovery loop.
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    /// Chain polling interval.
    pub fn chain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.chain_poll_ms)
    }

    /// Per-hop mining fee deducted by makers.
    pub fn miner_fee_per_hop(&self) -> Amount {
        Amount::from_sat(self.miner_fee_per_hop)
    }

    /// Retry schedule of unresponsive makers.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(self.backoff_base_secs),
            max: Duration::from_secs(self.backoff_max_secs),
            retry_ceiling: self.max_maker_retries,
        }
    }

    /// Timing of the offer sync service.
    pub fn offer_sync_config(&self) -> OfferSyncConfig {
        OfferSyncConfig {
            interval: Duration::from_secs(self.offer_sync_interval_secs),
            directory_refresh: Duration::from_secs(self.directory_refresh_interval_secs),
            request_timeout: self.maker_timeout(),
            backoff: self.backoff_policy(),
        }
    }

    /// Locktime, in blocks, used to rank makers by fee for a route of `maker_count` makers.
    pub fn ranking_locktime(&self, maker_count: usize) -> u16 {
        let upstream = maker_count.saturating_sub(1) as u16;
        self.refund_locktime_base
            .saturating_add(self.refund_locktime_step.saturating_mul(upstream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, path::PathBuf};
    use tempfile::TempDir;

    fn create_temp_config(dir: &TempDir, contents: &str) -> PathBuf {
        let file_path = dir.path().join("config.toml");
        fs::write(&file_path, contents).unwrap();
        file_path
    }

    #[test]
    fn test_valid_config() {
        let dir = TempDir::new().unwrap();
        let contents = r#"
        offer_sync_interval_secs = 600
        maker_timeout_ms = 30000
        connection_type = "TOR"
        "#;
        let config_path = create_temp_config(&dir, contents);
        let config = TakerConfig::new(Some(&config_path)).unwrap();

        assert_eq!(config, TakerConfig::default());
    }

    #[test]
    fn test_incorrect_data_type() {
        let dir = TempDir::new().unwrap();
        let contents = r#"
            [taker_config]
            refund_locktime_base = "not_a_number"
            fee_rate = fast
        "#;
        let config_path = create_temp_config(&dir, contents);
        let config = TakerConfig::new(Some(&config_path)).unwrap();

        assert_eq!(config, TakerConfig::default());
    }

    #[test]
    fn test_different_data() {
        let dir = TempDir::new().unwrap();
        let contents = r#"
            [taker_config]
            refund_locktime_step = 30
            background_sync = false
            maker_addresses = "a.onion:6102, b.onion:6102"
        "#;
        let config_path = create_temp_config(&dir, contents);
        let config = TakerConfig::new(Some(&config_path)).unwrap();
        assert_eq!(
            TakerConfig {
                refund_locktime_step: 30,
                background_sync: false,
                maker_addresses: vec!["a.onion:6102".to_string(), "b.onion:6102".to_string()],
                ..TakerConfig::default()
            },
            config
        );
        assert_eq!(config.ranking_locktime(3), 20 + 30 * 2);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("nested").join("taker.toml");
        let config = TakerConfig::new(Some(&config_path)).unwrap();
        assert!(config_path.exists());
        assert_eq!(config, TakerConfig::default());
    }
}
