//! Child procedures spawned by crash recovery. Each is a single step.

use super::server_state::{PartitionRef, ServerName};
use crate::common::Result;
use crate::procedure::{Flow, StepContext};
use serde::{Deserialize, Serialize};

/// Split one write-ahead-log segment of a dead server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitLogData {
    pub server: ServerName,
    pub segment: String,
}

/// Move one partition off a dead server. Holds `partition:<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassignData {
    pub partition: PartitionRef,
    pub from: ServerName,
}

pub(crate) async fn split_log(d: &mut SplitLogData, ctx: &mut StepContext<'_>) -> Result<Flow> {
    ctx.env()
        .cluster
        .logs
        .split_segment(&d.server, &d.segment)
        .await?;
    tracing::debug!(proc_id = ctx.proc_id(), server = %d.server, segment = %d.segment, "Segment split");
    Ok(Flow::Done)
}

pub(crate) async fn reassign(d: &mut ReassignData, ctx: &mut StepContext<'_>) -> Result<Flow> {
    ctx.env()
        .cluster
        .partitions
        .reassign(&d.partition, &d.from)
        .await?;
    Ok(Flow::Done)
}
