//! Configuration for the failover master

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix, e.g. `FAILOVER__MASTER__WORKER_THREADS=8`.
pub const ENV_PREFIX: &str = "FAILOVER";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Master-specific config
    #[serde(default)]
    pub master: MasterConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "master-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            master: MasterConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the optional TOML file, then
    /// `FAILOVER__*` environment overrides.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.master.validate()?;
        Ok(config)
    }
}

/// How far an append is pushed before it returns. Both policies hand the
/// record to the OS, so an acknowledged append survives process death.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSyncPolicy {
    /// fsync after every append; also survives machine failure
    Always,
    /// Flush to the OS after every append, no fsync
    Flush,
}

impl Default for LogSyncPolicy {
    fn default() -> Self {
        LogSyncPolicy::Always
    }
}

/// Master configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Bind address for the admin HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Procedure log file
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    #[serde(default)]
    pub log_sync: LogSyncPolicy,

    /// Consecutive transient failures tolerated per step (0 = unlimited)
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,

    #[serde(default = "default_retry_initial_backoff")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff")]
    pub retry_max_backoff_ms: u64,

    /// Liveness poll period (0 disables liveness detection)
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_ms: u64,

    /// Records appended since the last compaction before the log is rewritten
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: usize,

    /// Split write-ahead logs with one child procedure per segment
    #[serde(default = "default_split_log_per_segment")]
    pub split_log_per_segment: bool,

    /// Finished procedures kept in memory for queries
    #[serde(default = "default_completed_retention")]
    pub completed_retention: usize,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7000))
}
fn default_log_path() -> PathBuf {
    PathBuf::from("./master-data/procedures.log")
}
fn default_max_step_retries() -> u32 {
    10
}
fn default_retry_initial_backoff() -> u64 {
    100
}
fn default_retry_max_backoff() -> u64 {
    10_000
}
fn default_liveness_interval() -> u64 {
    1_000
}
fn default_compaction_threshold() -> usize {
    1024
}
fn default_split_log_per_segment() -> bool {
    true
}
fn default_completed_retention() -> usize {
    1024
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            log_path: default_log_path(),
            log_sync: LogSyncPolicy::default(),
            max_step_retries: default_max_step_retries(),
            retry_initial_backoff_ms: default_retry_initial_backoff(),
            retry_max_backoff_ms: default_retry_max_backoff(),
            liveness_interval_ms: default_liveness_interval(),
            compaction_threshold: default_compaction_threshold(),
            split_log_per_segment: default_split_log_per_segment(),
            completed_retention: default_completed_retention(),
        }
    }
}

impl MasterConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "retry_initial_backoff_ms ({}) exceeds retry_max_backoff_ms ({})",
                self.retry_initial_backoff_ms, self.retry_max_backoff_ms
            )));
        }
        if self.compaction_threshold == 0 {
            return Err(crate::Error::InvalidConfig(
                "compaction_threshold must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }

    pub fn liveness_interval(&self) -> Option<Duration> {
        match self.liveness_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = MasterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.log_sync, LogSyncPolicy::Always);
        assert!(config.split_log_per_segment);
        assert_eq!(config.liveness_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "node_id = \"m-7\"\n\n[master]\nmax_step_retries = 2\nliveness_interval_ms = 0\nlog_sync = \"flush\""
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.node_id, "m-7");
        assert_eq!(config.master.liveness_interval(), None);
        assert_eq!(config.master.log_sync, LogSyncPolicy::Flush);
        assert_eq!(config.master.max_step_retries, 2);
    }

    #[test]
    fn test_unbuffered_sync_policy_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        std::fs::write(&path, "[master]\nlog_sync = \"never\"\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MasterConfig {
            compaction_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MasterConfig {
            retry_initial_backoff_ms: 5_000,
            retry_max_backoff_ms: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
