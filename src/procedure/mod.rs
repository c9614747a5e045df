//! Persistent procedure framework
//!
//! A procedure is a resumable unit of orchestration work. Its whole state
//! (kind, current step and step-local data) lives in a [`ProcedureRecord`]
//! that is appended to the [`store::ProcedureLog`] after every step and
//! before any effect of that step becomes visible. On startup the executor
//! replays the log and resumes every unfinished procedure from its last
//! persisted step.
//!
//! Procedure types form a closed set ([`ProcedureKind`]); each variant has
//! one step function that the executor dispatches to.

pub mod executor;
pub mod interceptor;
pub mod scheduler;
pub mod store;

use crate::common::Result;
use crate::master::crash::{self, ServerCrashData};
use crate::master::server_state::{ServerName, ServerState, ServerTracker};
use crate::master::subprocedure::{self, ReassignData, SplitLogData};
use crate::master::MasterEnv;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use executor::{ExecutorConfig, ProcedureExecutor, ReplaySummary};
pub use interceptor::{NoopInterceptor, StepGate, StepInterceptor, StepView};
pub use scheduler::Scheduler;
pub use store::{FileProcedureLog, LogRecord, MemoryProcedureLog, ProcedureLog};

pub type ProcId = u64;

/// Returned in place of an id when a submission creates no procedure.
/// Real ids start at 1.
pub const NO_PROC_ID: ProcId = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcState {
    /// Ready to run its next step
    Runnable,
    /// Suspended until every child in `children` is terminal
    Waiting,
    Succeeded,
    Failed(String),
}

impl ProcState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcState::Succeeded | ProcState::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcStatus {
    Running,
    Succeeded,
    Failed,
}

/// The closed set of procedure types with their step-local data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProcedureKind {
    ServerCrash(ServerCrashData),
    SplitLog(SplitLogData),
    ReassignPartition(ReassignData),
}

impl ProcedureKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProcedureKind::ServerCrash(_) => "ServerCrash",
            ProcedureKind::SplitLog(_) => "SplitLog",
            ProcedureKind::ReassignPartition(_) => "ReassignPartition",
        }
    }

    pub fn step_name(&self) -> &'static str {
        match self {
            ProcedureKind::ServerCrash(d) => d.step.name(),
            ProcedureKind::SplitLog(_) => "Split",
            ProcedureKind::ReassignPartition(_) => "Reassign",
        }
    }

    /// The server this procedure acts on behalf of.
    pub fn server(&self) -> Option<&ServerName> {
        match self {
            ProcedureKind::ServerCrash(d) => Some(&d.server),
            ProcedureKind::SplitLog(d) => Some(&d.server),
            ProcedureKind::ReassignPartition(d) => Some(&d.from),
        }
    }

    /// Exclusive resource key taken by the scheduler before the first step.
    pub fn lock_key(&self) -> Option<String> {
        match self {
            ProcedureKind::ServerCrash(d) => Some(format!("server:{}", d.server)),
            ProcedureKind::SplitLog(_) => None,
            ProcedureKind::ReassignPartition(d) => Some(format!("partition:{}", d.partition)),
        }
    }

    /// Whether the lock stays held while suspended on children. Crash
    /// recovery keeps it so that no second recovery can start for the server
    /// while its first one waits on log splitting or reassignment.
    pub fn holds_lock_while_waiting(&self) -> bool {
        matches!(self, ProcedureKind::ServerCrash(_))
    }

    /// Run the current step. Mutates step data in place; the executor
    /// persists the result before applying `ctx`'s deferred effects.
    pub async fn execute(&mut self, ctx: &mut StepContext<'_>) -> Result<Flow> {
        match self {
            ProcedureKind::ServerCrash(d) => crash::execute(d, ctx).await,
            ProcedureKind::SplitLog(d) => subprocedure::split_log(d, ctx).await,
            ProcedureKind::ReassignPartition(d) => subprocedure::reassign(d, ctx).await,
        }
    }

    /// Reinstall in-memory state owned by a procedure rebuilt from the log.
    pub fn on_restored(&self, proc_id: ProcId, tracker: &ServerTracker) {
        if let ProcedureKind::ServerCrash(d) = self {
            crash::restore(d, proc_id, tracker);
        }
    }

    /// Called once a terminal failure is durable.
    pub fn on_failed(&self, proc_id: ProcId, tracker: &ServerTracker) {
        if let ProcedureKind::ServerCrash(d) = self {
            if tracker.release_claim(&d.server, proc_id) {
                tracing::warn!(
                    proc_id,
                    server = %d.server,
                    "Crash recovery failed; node left for operator retry"
                );
            }
        }
    }
}

/// Full persisted state of one procedure after a transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureRecord {
    pub id: ProcId,
    pub parent: Option<ProcId>,
    pub kind: ProcedureKind,
    pub state: ProcState,
    /// Children spawned by the most recent suspending step
    pub children: Vec<ProcId>,
    /// Consecutive transient failures of the current step
    #[serde(default)]
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcedureRecord {
    pub fn new(id: ProcId, parent: Option<ProcId>, kind: ProcedureKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            parent,
            kind,
            state: ProcState::Runnable,
            children: Vec::new(),
            attempts: 0,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn info(&self) -> ProcedureInfo {
        let (status, error) = match &self.state {
            ProcState::Runnable | ProcState::Waiting => (ProcStatus::Running, None),
            ProcState::Succeeded => (ProcStatus::Succeeded, None),
            ProcState::Failed(reason) => (ProcStatus::Failed, Some(reason.clone())),
        };
        ProcedureInfo {
            id: self.id,
            parent: self.parent,
            procedure: self.kind.name().to_string(),
            step: self.kind.step_name().to_string(),
            server: self.kind.server().map(|s| s.to_string()),
            status,
            error,
            children: self.children.clone(),
            submitted_at: self.submitted_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view of a procedure for operators and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureInfo {
    pub id: ProcId,
    pub parent: Option<ProcId>,
    pub procedure: String,
    pub step: String,
    pub server: Option<String>,
    pub status: ProcStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub children: Vec<ProcId>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcedureInfo {
    pub fn is_finished(&self) -> bool {
        self.status != ProcStatus::Running
    }

    pub fn is_success(&self) -> bool {
        self.status == ProcStatus::Succeeded
    }
}

/// What a step asks the executor to do next.
#[derive(Debug)]
pub enum Flow {
    /// Persist and run the next step
    Continue,
    /// Persist, start these children and suspend until all are terminal
    Spawn(Vec<ProcedureKind>),
    /// Persist as succeeded
    Done,
}

/// Externally visible consequences of a step, applied only after the step's
/// resulting state is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    AdvanceServer {
        server: ServerName,
        state: ServerState,
    },
    DeleteServer {
        server: ServerName,
    },
    /// Best-effort; failures are logged and ignored
    TerminateServer {
        server: ServerName,
    },
}

pub struct StepContext<'a> {
    proc_id: ProcId,
    env: &'a MasterEnv,
    effects: Vec<Effect>,
}

impl<'a> StepContext<'a> {
    pub fn new(proc_id: ProcId, env: &'a MasterEnv) -> Self {
        Self {
            proc_id,
            env,
            effects: Vec::new(),
        }
    }

    pub fn proc_id(&self) -> ProcId {
        self.proc_id
    }

    pub fn env(&self) -> &'a MasterEnv {
        self.env
    }

    pub fn defer(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn into_effects(self) -> Vec<Effect> {
        self.effects
    }
}

/// Why a submission created no procedure. Not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "proc_id")]
pub enum RejectReason {
    /// A non-terminal procedure already holds the resource
    AlreadyRecovering(ProcId),
    /// The executor is shutting down
    Stopping,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::AlreadyRecovering(id) => write!(f, "already recovering (pid={})", id),
            RejectReason::Stopping => write!(f, "stopping"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Submitted(ProcId),
    Rejected(RejectReason),
}

impl Submission {
    /// The new procedure id, or [`NO_PROC_ID`] if none was created.
    pub fn proc_id(&self) -> ProcId {
        match self {
            Submission::Submitted(id) => *id,
            Submission::Rejected(_) => NO_PROC_ID,
        }
    }

    pub fn is_submitted(&self) -> bool {
        matches!(self, Submission::Submitted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::server_state::PartitionRef;

    fn crash_kind(port: u16) -> ProcedureKind {
        ProcedureKind::ServerCrash(ServerCrashData::new(ServerName::new("h", port, 1)))
    }

    #[test]
    fn test_lock_keys() {
        assert_eq!(crash_kind(1).lock_key().as_deref(), Some("server:h,1,1"));
        let reassign = ProcedureKind::ReassignPartition(ReassignData {
            partition: PartitionRef::from("t1,a"),
            from: ServerName::new("h", 1, 1),
        });
        assert_eq!(reassign.lock_key().as_deref(), Some("partition:t1,a"));
        let split = ProcedureKind::SplitLog(SplitLogData {
            server: ServerName::new("h", 1, 1),
            segment: "wal.1".into(),
        });
        assert_eq!(split.lock_key(), None);
        assert!(crash_kind(1).holds_lock_while_waiting());
        assert!(!reassign.holds_lock_while_waiting());
    }

    #[test]
    fn test_submission_sentinel() {
        assert_eq!(Submission::Submitted(4).proc_id(), 4);
        assert_eq!(
            Submission::Rejected(RejectReason::AlreadyRecovering(4)).proc_id(),
            NO_PROC_ID
        );
        assert_eq!(Submission::Rejected(RejectReason::Stopping).proc_id(), NO_PROC_ID);
    }

    #[test]
    fn test_record_info() {
        let mut record = ProcedureRecord::new(3, None, crash_kind(1));
        let info = record.info();
        assert_eq!(info.procedure, "ServerCrash");
        assert_eq!(info.step, "Start");
        assert_eq!(info.server.as_deref(), Some("h,1,1"));
        assert!(!info.is_finished());

        record.state = ProcState::Failed("boom".into());
        let info = record.info();
        assert!(info.is_finished());
        assert!(!info.is_success());
        assert_eq!(info.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_record_survives_bincode() {
        let mut record = ProcedureRecord::new(3, Some(1), crash_kind(7));
        record.state = ProcState::Waiting;
        record.children = vec![4, 5];
        let bytes = bincode::serialize(&record).unwrap();
        let back: ProcedureRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.id, 3);
        assert_eq!(back.parent, Some(1));
        assert_eq!(back.state, ProcState::Waiting);
        assert_eq!(back.children, vec![4, 5]);
        assert_eq!(back.kind.server(), Some(&ServerName::new("h", 7, 1)));
    }
}
