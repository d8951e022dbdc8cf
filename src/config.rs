use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::settlement::{RetryPolicy, SupervisorConfig};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "darkmatch.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            matching: MatchingConfig::default(),
            settlement: SettlementConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatchingConfig {
    /// Bound of the match stream between matcher and settlement workers
    pub stream_capacity: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            stream_capacity: 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SettlementConfig {
    pub workers: usize,
    pub proof_attempts: u32,
    pub channel_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub call_timeout_ms: u64,
    pub staleness_window_ms: u64,
    pub redispatch_window_ms: u64,
    pub scan_interval_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            proof_attempts: 3,
            channel_attempts: 3,
            backoff_base_ms: 100,
            backoff_cap_ms: 5_000,
            call_timeout_ms: 10_000,
            staleness_window_ms: 30_000,
            redispatch_window_ms: 10_000,
            scan_interval_ms: 5_000,
        }
    }
}

impl SettlementConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            proof_attempts: self.proof_attempts,
            channel_attempts: self.channel_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            workers: self.workers,
            staleness_window: Duration::from_millis(self.staleness_window_ms),
            redispatch_window: Duration::from_millis(self.redispatch_window_ms),
            scan_interval: Duration::from_millis(self.scan_interval_ms),
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config yaml: {}", path.display()))
    }
}
