//! Server crash recovery procedure
//!
//! ```text
//! Start ─▶ RecoverLogs ─▶ FinishLogRecovery ─▶ QueryPartitions ─▶ Reassign ─▶ Finish
//!  │          │ spawns SplitLog × segments                          │ spawns ReassignPartition × partitions
//!  ▼          ▼                                  ▼                                       ▼
//! Splitting                                   Offline                               node deleted
//! ```
//!
//! Every step advances `step` before returning, so the persisted record
//! always names the next step to run. Steps that spawn children persist the
//! child set together with the suspended parent; after a restart the parent
//! waits on exactly those children.

use super::server_state::{PartitionRef, ServerName, ServerState, ServerTracker};
use super::subprocedure::{ReassignData, SplitLogData};
use crate::common::{Error, Result};
use crate::procedure::{Effect, Flow, ProcId, ProcedureKind, StepContext};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrashStep {
    Start,
    RecoverLogs,
    FinishLogRecovery,
    QueryPartitions,
    Reassign,
    Finish,
}

impl CrashStep {
    pub fn name(&self) -> &'static str {
        match self {
            CrashStep::Start => "Start",
            CrashStep::RecoverLogs => "RecoverLogs",
            CrashStep::FinishLogRecovery => "FinishLogRecovery",
            CrashStep::QueryPartitions => "QueryPartitions",
            CrashStep::Reassign => "Reassign",
            CrashStep::Finish => "Finish",
        }
    }

    /// Tracker state implied by having persisted this as the next step.
    fn server_state(&self) -> ServerState {
        match self {
            CrashStep::Start => ServerState::Crashed,
            CrashStep::RecoverLogs | CrashStep::FinishLogRecovery => ServerState::Splitting,
            CrashStep::QueryPartitions | CrashStep::Reassign | CrashStep::Finish => {
                ServerState::Offline
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCrashData {
    pub server: ServerName,
    pub step: CrashStep,
    /// Partitions owned at the time of the crash, filled by `QueryPartitions`
    #[serde(default)]
    pub partitions: Vec<PartitionRef>,
}

impl ServerCrashData {
    pub fn new(server: ServerName) -> Self {
        Self {
            server,
            step: CrashStep::Start,
            partitions: Vec::new(),
        }
    }
}

pub(crate) async fn execute(d: &mut ServerCrashData, ctx: &mut StepContext<'_>) -> Result<Flow> {
    let env = ctx.env();
    match d.step {
        CrashStep::Start => {
            let node = env
                .tracker
                .get(&d.server)
                .ok_or_else(|| Error::ServerNotFound(d.server.to_string()))?;
            if node.state != ServerState::Crashed || node.recovery != Some(ctx.proc_id()) {
                return Err(Error::IllegalTransition {
                    server: d.server.to_string(),
                    reason: format!(
                        "recovery cannot start from {} (claimed by {:?})",
                        node.state, node.recovery
                    ),
                });
            }
            info!(proc_id = ctx.proc_id(), server = %d.server, "Starting crash recovery");
            ctx.defer(Effect::AdvanceServer {
                server: d.server.clone(),
                state: ServerState::Splitting,
            });
            ctx.defer(Effect::TerminateServer {
                server: d.server.clone(),
            });
            d.step = CrashStep::RecoverLogs;
            Ok(Flow::Continue)
        }

        CrashStep::RecoverLogs => {
            d.step = CrashStep::FinishLogRecovery;
            if !env.split_log_per_segment {
                return Ok(Flow::Continue);
            }
            let segments = env.cluster.logs.list_segments(&d.server).await?;
            debug!(server = %d.server, segments = segments.len(), "Splitting write-ahead logs");
            Ok(Flow::Spawn(
                segments
                    .into_iter()
                    .map(|segment| {
                        ProcedureKind::SplitLog(SplitLogData {
                            server: d.server.clone(),
                            segment,
                        })
                    })
                    .collect(),
            ))
        }

        CrashStep::FinishLogRecovery => {
            let token = env.cluster.logs.recover_logs(&d.server).await?;
            debug!(server = %d.server, segments = token.segments, "Write-ahead logs recovered");
            ctx.defer(Effect::AdvanceServer {
                server: d.server.clone(),
                state: ServerState::Offline,
            });
            d.step = CrashStep::QueryPartitions;
            Ok(Flow::Continue)
        }

        CrashStep::QueryPartitions => {
            let owned = env.cluster.partitions.owned_partitions(&d.server).await?;
            d.partitions = owned.into_iter().collect();
            d.step = CrashStep::Reassign;
            Ok(Flow::Continue)
        }

        CrashStep::Reassign => {
            d.step = CrashStep::Finish;
            debug!(server = %d.server, partitions = d.partitions.len(), "Reassigning partitions");
            Ok(Flow::Spawn(
                d.partitions
                    .iter()
                    .map(|partition| {
                        ProcedureKind::ReassignPartition(ReassignData {
                            partition: partition.clone(),
                            from: d.server.clone(),
                        })
                    })
                    .collect(),
            ))
        }

        CrashStep::Finish => {
            ctx.defer(Effect::DeleteServer {
                server: d.server.clone(),
            });
            info!(
                proc_id = ctx.proc_id(),
                server = %d.server,
                partitions = d.partitions.len(),
                "Crash recovery finished"
            );
            Ok(Flow::Done)
        }
    }
}

/// Reinstall the tracker node of a recovery rebuilt from the log.
pub(crate) fn restore(d: &ServerCrashData, proc_id: ProcId, tracker: &ServerTracker) {
    let state = d.step.server_state();
    tracker.restore(&d.server, state, proc_id);
    debug!(proc_id, server = %d.server, step = d.step.name(), %state, "Restored crash recovery");
}
