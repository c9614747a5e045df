//! # failover
//!
//! Crash-safe server failover for a region-partitioned storage master:
//! - Durable, replayable procedure log (CRC-framed batches)
//! - Procedure executor with per-resource locking and restart resumption
//! - Server state tracker with an at-most-one recovery per server generation
//! - Server crash recovery: log splitting, partition reassignment, cleanup
//! - Restart reconciliation and liveness detection
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                     Master                       │
//! │  liveness / reconcile / admin API ──▶ submit     │
//! │        │                                         │
//! │  ┌─────▼─────────┐   ┌────────────────────────┐  │
//! │  │ Scheduler     │◀──│ Procedure executor     │  │
//! │  │ (locks,ready) │   │ step → append → effect │  │
//! │  └───────────────┘   └──────┬──────────┬──────┘  │
//! │                             │          │         │
//! │                  ┌──────────▼──┐  ┌────▼───────┐ │
//! │                  │ Procedure   │  │ Server     │ │
//! │                  │ log (file)  │  │ tracker    │ │
//! │                  └─────────────┘  └────────────┘ │
//! └─────────────────────────┬────────────────────────┘
//!                           │ collaborators
//!      partitions · log recovery · membership · terminate
//! ```
//!
//! ## Usage
//!
//! ### Start a master
//! ```bash
//! failover-master serve \
//!   --bind 0.0.0.0:7000 \
//!   --log ./master-data/procedures.log \
//!   --cluster ./cluster.json
//! ```
//!
//! ### Use the CLI
//! ```bash
//! failover servers
//! failover expire rs1.example,16020,1700000000123
//! failover procedure 4 --wait 30s
//! ```

pub mod client;
pub mod common;
pub mod master;
pub mod procedure;

// Re-export commonly used types
pub use common::{Config, Error, MasterConfig, Result};
pub use master::{Master, ServerName, ServerState};
pub use procedure::{ProcId, Submission, NO_PROC_ID};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
