//! Typed, validated configuration.
//!
//! Loaded from a JSON config file with a handful of CLI-flag overrides (RPC url,
//! poll intervals, dry-run) and a `.env`-aware private key lookup. Validation
//! happens once, here, and produces `CoreError::ConfigInvalid` with a human
//! readable reason; it never panics.

use crate::error::CoreError;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GpuEntry {
    #[serde(default)]
    pub group_size: u32,
    #[serde(default)]
    pub groups: u32,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub disabled: bool,
}

fn default_true() -> bool {
    true
}

/// Enabled/disabled per-tracker flags. Defaults mirror the historical
/// implementation: everything but `disputeChecker` is on out of the box.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackerToggles {
    #[serde(default = "default_true")]
    pub new_current_variables: bool,
    #[serde(default = "default_true")]
    pub time_out: bool,
    #[serde(default = "default_true")]
    pub balance: bool,
    #[serde(default = "default_true")]
    pub current_variables: bool,
    #[serde(default = "default_true")]
    pub dispute_status: bool,
    #[serde(default = "default_true")]
    pub gas: bool,
    #[serde(default = "default_true")]
    pub tribute_balance: bool,
    #[serde(default = "default_true")]
    pub indexers: bool,
    #[serde(default)]
    pub dispute_checker: bool,
}

impl Default for TrackerToggles {
    fn default() -> Self {
        Self {
            new_current_variables: true,
            time_out: true,
            balance: true,
            current_variables: true,
            dispute_status: true,
            gas: true,
            tribute_balance: true,
            indexers: true,
            dispute_checker: false,
        }
    }
}

/// Raw, on-disk configuration shape. Durations are plain seconds (or milliseconds
/// for `eth_client_timeout`, matching the historical JSON/float duration quirk)
/// to keep the file human-editable; `Config::load` converts to `std::time::Duration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    pub contract_address: String,
    pub node_url: String,
    #[serde(default)]
    pub database_url: Option<String>,
    pub public_address: String,

    #[serde(default = "default_eth_client_timeout_ms")]
    pub eth_client_timeout_ms: u64,
    #[serde(default = "default_tracker_sleep_cycle_secs")]
    pub tracker_sleep_cycle_secs: u64,

    #[serde(default)]
    pub enabled_trackers: TrackerToggles,

    #[serde(default = "default_dispute_time_delta_secs")]
    pub dispute_time_delta_secs: u64,
    #[serde(default = "default_dispute_threshold")]
    pub dispute_threshold: f64,

    #[serde(default)]
    pub gpu_config: BTreeMap<String, GpuEntry>,
    #[serde(default = "default_num_processors")]
    pub num_processors: usize,

    #[serde(default = "default_gas_multiplier")]
    pub gas_multiplier: f64,
    #[serde(default)]
    pub gas_max_gwei: u64,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_mining_interrupt_check_secs")]
    pub mining_interrupt_check_interval_secs: u64,
    #[serde(default = "default_request_data_interval_secs")]
    pub request_data_interval_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub server_whitelist: Vec<String>,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default)]
    pub enable_pool_worker: bool,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub pool_url: Option<String>,

    #[serde(default = "default_index_folder")]
    pub index_folder: String,

    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

fn default_eth_client_timeout_ms() -> u64 {
    3000
}
fn default_tracker_sleep_cycle_secs() -> u64 {
    30
}
fn default_dispute_time_delta_secs() -> u64 {
    5 * 60
}
fn default_dispute_threshold() -> f64 {
    0.01
}
fn default_num_processors() -> usize {
    2
}
fn default_gas_multiplier() -> f64 {
    1.0
}
fn default_heartbeat_secs() -> u64 {
    15
}
fn default_mining_interrupt_check_secs() -> u64 {
    15
}
fn default_request_data_interval_secs() -> u64 {
    30
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_server_host() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    9090
}
fn default_min_confidence() -> f64 {
    0.2
}
fn default_index_folder() -> String {
    "index-store".to_string()
}
fn default_private_key_env() -> String {
    "ETH_PRIVATE_KEY".to_string()
}

/// Validated, process-lifetime configuration. Threaded into each component at
/// construction rather than read from a process-wide singleton.
#[derive(Debug, Clone)]
pub struct Config {
    pub contract_address: Address,
    pub node_url: String,
    pub database_url: Option<String>,
    pub public_address: Address,

    pub eth_client_timeout: Duration,
    pub tracker_sleep_cycle: Duration,
    pub enabled_trackers: TrackerToggles,

    pub dispute_time_delta: Duration,
    pub dispute_threshold: f64,

    pub gpu_config: BTreeMap<String, GpuEntry>,
    pub num_processors: usize,

    pub gas_multiplier: f64,
    pub gas_max_gwei: u64,

    pub heartbeat: Duration,
    pub mining_interrupt_check_interval: Duration,
    pub request_data_interval: Duration,
    pub fetch_timeout: Duration,

    pub server_host: String,
    pub server_port: u16,
    pub server_whitelist: BTreeSet<Address>,

    pub min_confidence: f64,

    pub enable_pool_worker: bool,
    pub worker: Option<String>,
    pub password: Option<String>,
    pub pool_url: Option<String>,

    pub index_folder: String,
    pub private_key_env: String,
}

impl Config {
    pub fn from_raw(raw: RawConfig) -> Result<Self, CoreError> {
        validate_hex_address(&raw.contract_address, "contractAddress")?;
        validate_hex_address(&raw.public_address, "publicAddress")?;

        let contract_address = Address::from_str(&raw.contract_address)
            .map_err(|e| CoreError::ConfigInvalid(format!("contractAddress: {e}")))?;
        let public_address = Address::from_str(&raw.public_address)
            .map_err(|e| CoreError::ConfigInvalid(format!("publicAddress: {e}")))?;

        if !(0.0..=20.0).contains(&raw.gas_multiplier) {
            return Err(CoreError::ConfigInvalid(format!(
                "gasMultiplier must be in [0,20], got {}",
                raw.gas_multiplier
            )));
        }

        if !(0.0..=1.0).contains(&raw.dispute_threshold) {
            return Err(CoreError::ConfigInvalid(format!(
                "disputeThreshold must be in [0,1], got {}",
                raw.dispute_threshold
            )));
        }

        for (name, gpu) in &raw.gpu_config {
            if gpu.disabled {
                continue;
            }
            if gpu.count == 0 || gpu.group_size == 0 || gpu.groups == 0 {
                return Err(CoreError::ConfigInvalid(format!(
                    "gpuConfig[{name}] must have count>0, groupSize>0, groups>0 unless disabled"
                )));
            }
        }

        let mut server_whitelist = BTreeSet::new();
        for raw_addr in &raw.server_whitelist {
            validate_hex_address(raw_addr, "serverWhitelist entry")?;
            server_whitelist.insert(
                Address::from_str(raw_addr)
                    .map_err(|e| CoreError::ConfigInvalid(format!("serverWhitelist entry: {e}")))?,
            );
        }

        if raw.node_url.trim().is_empty() {
            return Err(CoreError::ConfigInvalid("nodeUrl must not be empty".to_string()));
        }

        Ok(Self {
            contract_address,
            node_url: raw.node_url,
            database_url: raw.database_url,
            public_address,
            eth_client_timeout: Duration::from_millis(raw.eth_client_timeout_ms.max(1)),
            tracker_sleep_cycle: Duration::from_secs(raw.tracker_sleep_cycle_secs.max(1)),
            enabled_trackers: raw.enabled_trackers,
            dispute_time_delta: Duration::from_secs(raw.dispute_time_delta_secs.max(1)),
            dispute_threshold: raw.dispute_threshold,
            gpu_config: raw.gpu_config,
            num_processors: raw.num_processors,
            gas_multiplier: raw.gas_multiplier,
            gas_max_gwei: raw.gas_max_gwei,
            heartbeat: Duration::from_secs(raw.heartbeat_secs.max(1)),
            mining_interrupt_check_interval: Duration::from_secs(
                raw.mining_interrupt_check_interval_secs.max(1),
            ),
            request_data_interval: Duration::from_secs(raw.request_data_interval_secs.max(1)),
            fetch_timeout: Duration::from_secs(raw.fetch_timeout_secs.max(1)),
            server_host: raw.server_host,
            server_port: raw.server_port,
            server_whitelist,
            min_confidence: raw.min_confidence,
            enable_pool_worker: raw.enable_pool_worker,
            worker: raw.worker,
            password: raw.password,
            pool_url: raw.pool_url,
            index_folder: raw.index_folder,
            private_key_env: raw.private_key_env,
        })
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, CoreError> {
        let raw_text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CoreError::ConfigInvalid(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let raw: RawConfig = serde_json::from_str(&raw_text)
            .map_err(|e| CoreError::ConfigInvalid(format!("failed to parse config json: {e}")))?;
        Self::from_raw(raw)
    }

    /// Effective gas price cap in wei: `gas_max_gwei`, or 100 gwei if unset.
    pub fn gas_max_wei(&self) -> ethers::types::U256 {
        let gwei = if self.gas_max_gwei == 0 { 100 } else { self.gas_max_gwei };
        ethers::types::U256::from(gwei) * ethers::types::U256::from(1_000_000_000u64)
    }
}

fn validate_hex_address(raw: &str, field: &str) -> Result<(), CoreError> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    if stripped.len() != 40 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CoreError::ConfigInvalid(format!(
            "{field} must be 40 hex characters, got '{raw}'"
        )));
    }
    Ok(())
}

/// Reads and validates the signing key from the environment variable named by
/// `private_key_env`, expecting 64 hex characters (with or without a `0x` prefix).
pub fn load_private_key(private_key_env: &str) -> Result<String, CoreError> {
    let raw = std::env::var(private_key_env).map_err(|_| {
        CoreError::ConfigInvalid(format!(
            "missing private key env var '{private_key_env}'; set it in your shell or .env file"
        ))
    })?;
    let stripped = raw.strip_prefix("0x").unwrap_or(&raw);
    if stripped.len() != 64 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CoreError::ConfigInvalid(format!(
            "{private_key_env} must be 64 hex characters"
        )));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_raw() -> RawConfig {
        RawConfig {
            contract_address: "0x".to_string() + &"ab".repeat(20),
            node_url: "http://localhost:8545".to_string(),
            database_url: None,
            public_address: "0x".to_string() + &"cd".repeat(20),
            eth_client_timeout_ms: default_eth_client_timeout_ms(),
            tracker_sleep_cycle_secs: default_tracker_sleep_cycle_secs(),
            enabled_trackers: TrackerToggles::default(),
            dispute_time_delta_secs: default_dispute_time_delta_secs(),
            dispute_threshold: default_dispute_threshold(),
            gpu_config: BTreeMap::new(),
            num_processors: default_num_processors(),
            gas_multiplier: default_gas_multiplier(),
            gas_max_gwei: 0,
            heartbeat_secs: default_heartbeat_secs(),
            mining_interrupt_check_interval_secs: default_mining_interrupt_check_secs(),
            request_data_interval_secs: default_request_data_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            server_host: default_server_host(),
            server_port: default_server_port(),
            server_whitelist: Vec::new(),
            min_confidence: default_min_confidence(),
            enable_pool_worker: false,
            worker: None,
            password: None,
            pool_url: None,
            index_folder: default_index_folder(),
            private_key_env: default_private_key_env(),
        }
    }

    #[test]
    fn rejects_short_contract_address() {
        let mut raw = minimal_raw();
        raw.contract_address = "0xabc".to_string();
        assert!(Config::from_raw(raw).is_err());
    }

    #[test]
    fn rejects_out_of_range_gas_multiplier() {
        let mut raw = minimal_raw();
        raw.gas_multiplier = 25.0;
        assert!(Config::from_raw(raw).is_err());
    }

    #[test]
    fn rejects_enabled_gpu_with_zero_count() {
        let mut raw = minimal_raw();
        raw.gpu_config.insert(
            "gpu0".to_string(),
            GpuEntry { group_size: 8, groups: 4, count: 0, disabled: false },
        );
        assert!(Config::from_raw(raw).is_err());
    }

    #[test]
    fn allows_disabled_gpu_with_zero_fields() {
        let mut raw = minimal_raw();
        raw.gpu_config.insert(
            "gpu0".to_string(),
            GpuEntry { group_size: 0, groups: 0, count: 0, disabled: true },
        );
        assert!(Config::from_raw(raw).is_ok());
    }

    #[test]
    fn gas_max_defaults_to_100_gwei() {
        let cfg = Config::from_raw(minimal_raw()).unwrap();
        assert_eq!(cfg.gas_max_wei(), ethers::types::U256::from(100_000_000_000u64));
    }

    #[test]
    fn valid_config_round_trips_through_json() {
        let raw = minimal_raw();
        let json = serde_json::to_string(&raw).unwrap();
        let parsed: RawConfig = serde_json::from_str(&json).unwrap();
        let cfg_a = Config::from_raw(raw).unwrap();
        let cfg_b = Config::from_raw(parsed).unwrap();
        assert_eq!(cfg_a.contract_address, cfg_b.contract_address);
        assert_eq!(cfg_a.public_address, cfg_b.public_address);
        assert_eq!(cfg_a.gas_multiplier, cfg_b.gas_multiplier);
    }
}
