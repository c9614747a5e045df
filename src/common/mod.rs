//! Common utilities and types shared across failover

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, LogSyncPolicy, MasterConfig};
pub use error::{Error, Result};
pub use utils::{backoff_delay, crc32, parse_duration, retry_with_backoff, TaskHandle};
