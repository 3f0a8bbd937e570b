use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, time::Duration};
use thiserror::Error;
use tracing::warn;

use crate::{
    instrument::{PairRegistry, PairSpec},
    orderbook::SelfTradePolicy,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value `{value}` for {key}")]
    Env { key: &'static str, value: String },
}

/// Process configuration. Every field has a default, so `{}` is a valid file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Journal events between book snapshots.
    pub snapshot_every: u64,
    pub self_trade: SelfTradePolicy,
    pub pairs: Vec<PairSpec>,
    pub settlement: SettlementConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub enabled: bool,
    /// Address that submits fills. Without one, the taker's signing address is used.
    pub submitter: Option<String>,
    /// Ledger relayer; the in-process ledger is used when unset.
    pub ledger_url: Option<String>,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub call_timeout_ms: u64,
    pub workers: usize,
    pub sweep_interval_ms: u64,
    pub sweep_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snapshot_every: 100,
            self_trade: SelfTradePolicy::default(),
            pairs: vec![PairSpec::new("MBTC", "MUSDT", 8, 6)],
            settlement: SettlementConfig::default(),
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            submitter: None,
            ledger_url: None,
            max_retries: 3,
            retry_base_ms: 5_000,
            retry_max_ms: 300_000,
            call_timeout_ms: 30_000,
            workers: 4,
            sweep_interval_ms: 30_000,
            sweep_batch: 10,
        }
    }
}

impl SettlementConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Config {
    /// Reads `path` (or defaults when `None`), then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => serde_json::from_str(&fs::read_to_string(p)?)?,
            None => Config::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Applies overrides from `lookup` (the process environment in [`Config::load`]).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let s = &mut self.settlement;
        if let Some(v) = lookup("SETTLEMENT_ENABLED") {
            s.enabled = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Some(v) = lookup("SETTLEMENT_RETRY_ATTEMPTS") {
            s.max_retries = parse("SETTLEMENT_RETRY_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("SETTLEMENT_RETRY_DELAY_MS") {
            s.retry_base_ms = parse("SETTLEMENT_RETRY_DELAY_MS", v)?;
        }
        if let Some(v) = lookup("SETTLEMENT_SUBMITTER") {
            s.submitter = Some(v).filter(|v| !v.is_empty());
        }
        if let Some(v) = lookup("LEDGER_URL") {
            s.ledger_url = Some(v).filter(|v| !v.is_empty());
        }
        if s.retry_max_ms < s.retry_base_ms {
            warn!(
                retry_base_ms = s.retry_base_ms,
                retry_max_ms = s.retry_max_ms,
                "retry cap below base delay, raising it"
            );
            s.retry_max_ms = s.retry_base_ms;
        }
        Ok(())
    }

    pub fn registry(&self) -> PairRegistry {
        PairRegistry::new(self.pairs.iter().cloned())
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { key, value })
}
