//! Restart reconciliation and liveness detection
//!
//! After the procedure log is replayed, the tracker holds a node for every
//! server with an in-flight recovery. [`rebuild`] adds the servers the
//! cluster still knows about (partition owners and live members), then
//! [`expire_dead_servers`] submits recovery for every `Online` node whose
//! server is no longer live. Servers with a resumed recovery are skipped:
//! their node is already in the crashed family and claimed.
//!
//! Both passes are idempotent. The liveness task reruns the second one on an
//! interval.

use super::server::Master;
use super::MasterEnv;
use crate::common::{retry_with_backoff, Result};
use crate::master::server_state::ServerState;
use crate::procedure::{ProcId, Submission};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

const COLLABORATOR_RETRIES: usize = 5;
const COLLABORATOR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebuildSummary {
    pub owners: usize,
    pub live: usize,
    pub tracked: usize,
}

/// Populate the tracker from partition ownership and membership.
pub async fn rebuild(env: &MasterEnv) -> Result<RebuildSummary> {
    let assignments = retry_with_backoff(
        || env.cluster.partitions.assignments(),
        COLLABORATOR_RETRIES,
        COLLABORATOR_BACKOFF,
    )
    .await?;
    let live = retry_with_backoff(
        || env.cluster.membership.live_servers(),
        COLLABORATOR_RETRIES,
        COLLABORATOR_BACKOFF,
    )
    .await?;

    let summary = RebuildSummary {
        owners: assignments.len(),
        live: live.len(),
        ..Default::default()
    };
    for (server, partitions) in assignments {
        env.tracker.observe(&server, partitions);
    }
    for server in &live {
        env.tracker.observe(server, BTreeSet::new());
    }

    let summary = RebuildSummary {
        tracked: env.tracker.len(),
        ..summary
    };
    info!(
        owners = summary.owners,
        live = summary.live,
        tracked = summary.tracked,
        "Rebuilt server tracker"
    );
    Ok(summary)
}

/// Submit crash recovery for tracked servers that are not live.
///
/// `Online` nodes always qualify. With `include_orphans`, so do
/// crashed-family nodes left unclaimed by a failed recovery.
pub async fn expire_dead_servers(master: &Master, include_orphans: bool) -> Result<Vec<ProcId>> {
    let env = master.env();
    let live = retry_with_backoff(
        || env.cluster.membership.live_servers(),
        COLLABORATOR_RETRIES,
        COLLABORATOR_BACKOFF,
    )
    .await?;

    let mut submitted = Vec::new();
    for node in env.tracker.nodes() {
        if live.contains(&node.name) {
            continue;
        }
        let eligible = match node.state {
            ServerState::Online => true,
            _ => include_orphans && node.recovery.is_none(),
        };
        if !eligible {
            continue;
        }
        match master.submit_crash_recovery(&node.name)? {
            Submission::Submitted(id) => {
                info!(proc_id = id, server = %node.name, state = %node.state, "Expired dead server");
                submitted.push(id);
            }
            Submission::Rejected(reason) => {
                debug!(server = %node.name, %reason, "Expiry not submitted");
            }
        }
    }
    Ok(submitted)
}
