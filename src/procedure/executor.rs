//! Procedure executor
//!
//! Drives procedures through their steps. A dispatcher task pops ready
//! procedures off the scheduler and runs each on its own task, so a step
//! stuck in a collaborator call holds nothing but its resource key. For every
//! step the executor:
//!
//! 1. runs the step body against a copy of the procedure's state, with no
//!    executor-wide lock held (only the procedure's resource lock),
//! 2. appends the resulting record to the procedure log,
//! 3. applies the step's deferred effects and re-enqueues the procedure.
//!
//! Steps 2 and 3 happen under the executor state lock, so submissions and
//! queries never observe an effect whose record is not durable. If an append
//! fails the executor halts: no procedure advances past unpersisted state.

use super::interceptor::{StepInterceptor, StepView};
use super::scheduler::Scheduler;
use super::store::{LogRecord, ProcedureLog};
use super::{
    Effect, Flow, ProcId, ProcState, ProcedureInfo, ProcedureKind, ProcedureRecord, RejectReason,
    StepContext, Submission,
};
use crate::common::{backoff_delay, Error, MasterConfig, Result, TaskHandle};
use crate::master::MasterEnv;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 0 retries transient failures forever
    pub max_step_retries: u32,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub compaction_threshold: usize,
    pub completed_retention: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig::from(&MasterConfig::default())
    }
}

impl From<&MasterConfig> for ExecutorConfig {
    fn from(config: &MasterConfig) -> Self {
        Self {
            max_step_retries: config.max_step_retries,
            retry_initial_backoff: config.retry_initial_backoff(),
            retry_max_backoff: config.retry_max_backoff(),
            compaction_threshold: config.compaction_threshold,
            completed_retention: config.completed_retention,
        }
    }
}

/// Outcome of [`ProcedureExecutor::replay`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub records: usize,
    /// Non-terminal procedures rebuilt and re-enqueued or left waiting
    pub resumed: usize,
    /// Finished procedure trees found in the log and tombstoned
    pub finished: usize,
    pub next_id: ProcId,
}

struct ExecState {
    log: Box<dyn ProcedureLog>,
    /// Every procedure not yet tombstoned, including terminal children of
    /// running parents
    procs: HashMap<ProcId, ProcedureRecord>,
    scheduler: Scheduler,
    completed: BTreeMap<ProcId, ProcedureInfo>,
    next_id: ProcId,
}

impl ExecState {
    fn allocate_id(&mut self) -> ProcId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// `root` and every procedure descending from it.
    fn tree(&self, root: ProcId) -> Vec<ProcId> {
        let mut by_parent: HashMap<ProcId, Vec<ProcId>> = HashMap::new();
        for record in self.procs.values() {
            if let Some(parent) = record.parent {
                by_parent.entry(parent).or_default().push(record.id);
            }
        }
        let mut out = vec![root];
        let mut i = 0;
        while i < out.len() {
            if let Some(children) = by_parent.get(&out[i]) {
                out.extend(children.iter().copied());
            }
            i += 1;
        }
        out
    }

    fn retire(&mut self, info: ProcedureInfo, retention: usize) {
        self.completed.insert(info.id, info);
        while self.completed.len() > retention {
            self.completed.pop_first();
        }
    }

    /// First failed child of the last spawn, if any.
    fn failed_child(&self, record: &ProcedureRecord) -> Option<(ProcId, String)> {
        record.children.iter().find_map(|child| match self.procs.get(child) {
            Some(ProcedureRecord {
                state: ProcState::Failed(reason),
                ..
            }) => Some((*child, reason.clone())),
            _ => None,
        })
    }

    fn children_done(&self, record: &ProcedureRecord) -> bool {
        record
            .children
            .iter()
            .all(|child| self.procs.get(child).map_or(true, |c| c.is_finished()))
    }
}

struct Inner {
    env: Arc<MasterEnv>,
    interceptor: Arc<dyn StepInterceptor>,
    config: ExecutorConfig,
    state: Mutex<ExecState>,
    wake: Notify,
    halted: AtomicBool,
    stopping: AtomicBool,
}

pub struct ProcedureExecutor {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<TaskHandle>>,
}

impl ProcedureExecutor {
    pub fn new(
        env: Arc<MasterEnv>,
        log: Box<dyn ProcedureLog>,
        interceptor: Arc<dyn StepInterceptor>,
        config: ExecutorConfig,
    ) -> Self {
        let inner = Inner {
            env,
            interceptor,
            config,
            state: Mutex::new(ExecState {
                log,
                procs: HashMap::new(),
                scheduler: Scheduler::new(),
                completed: BTreeMap::new(),
                next_id: 1,
            }),
            wake: Notify::new(),
            halted: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(inner),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn env(&self) -> &Arc<MasterEnv> {
        &self.inner.env
    }

    /// Rebuild every non-terminal procedure from the log. Call once, before
    /// [`start`](Self::start) and before any submission.
    pub fn replay(&self) -> Result<ReplaySummary> {
        let inner = &self.inner;
        let mut guard = inner.lock();
        let state: &mut ExecState = &mut guard;

        let records = state.log.read_all()?;
        let mut summary = ReplaySummary {
            records: records.len(),
            ..Default::default()
        };

        let mut max_id = 0;
        let mut latest: BTreeMap<ProcId, ProcedureRecord> = BTreeMap::new();
        for record in records {
            max_id = max_id.max(record.proc_id());
            match record {
                LogRecord::Update(r) => {
                    latest.insert(r.id, r);
                }
                LogRecord::Delete(id) => {
                    latest.remove(&id);
                }
            }
        }
        state.next_id = state.next_id.max(max_id + 1);
        state.procs = latest.into_iter().collect();

        // Finished trees whose tombstones never made it to the log.
        let finished_roots: Vec<ProcId> = state
            .procs
            .values()
            .filter(|r| r.parent.is_none() && r.is_finished())
            .map(|r| r.id)
            .collect();
        let mut tombstones = Vec::new();
        for root in finished_roots {
            for id in state.tree(root) {
                if let Some(record) = state.procs.remove(&id) {
                    tombstones.push(LogRecord::Delete(id));
                    let retention = inner.config.completed_retention;
                    state.retire(record.info(), retention);
                }
            }
            summary.finished += 1;
        }

        let orphans: Vec<ProcId> = state
            .procs
            .values()
            .filter(|r| r.parent.is_some_and(|p| !state.procs.contains_key(&p)))
            .map(|r| r.id)
            .collect();
        for id in orphans {
            warn!(proc_id = id, "Dropping procedure whose parent is gone");
            state.procs.remove(&id);
            tombstones.push(LogRecord::Delete(id));
        }

        if !tombstones.is_empty() {
            inner.append(state, &tombstones)?;
        }

        let mut ids: Vec<ProcId> = state.procs.keys().copied().collect();
        ids.sort_unstable();

        for id in &ids {
            let record = &state.procs[id];
            if !record.is_finished() {
                record.kind.on_restored(*id, &inner.env.tracker);
                summary.resumed += 1;
            }
        }

        // Suspended lock holders first, so nothing runnable can steal their key.
        for id in &ids {
            let record = &state.procs[id];
            if record.state == ProcState::Waiting && record.kind.holds_lock_while_waiting() {
                if let Some(key) = record.kind.lock_key() {
                    if let Err(holder) = state.scheduler.try_acquire(&key, *id) {
                        warn!(proc_id = id, holder, key = %key, "Replayed lock already held");
                    }
                }
            }
        }

        for id in &ids {
            let record = &state.procs[id];
            if record.state == ProcState::Waiting && state.children_done(record) {
                if let Some(r) = state.procs.get_mut(id) {
                    r.state = ProcState::Runnable;
                }
            }
        }

        for id in &ids {
            let record = &state.procs[id];
            if record.state == ProcState::Runnable {
                let key = record.kind.lock_key();
                state.scheduler.enqueue(*id, key.as_deref());
            }
        }

        summary.next_id = state.next_id;
        drop(guard);

        info!(
            records = summary.records,
            resumed = summary.resumed,
            finished = summary.finished,
            "Replayed procedure log"
        );
        Ok(summary)
    }

    /// Spawn the dispatcher.
    pub fn start(&self) {
        let mut dispatcher = self.dispatcher.lock().unwrap_or_else(|e| e.into_inner());
        if dispatcher.is_some() {
            return;
        }
        *dispatcher = Some(TaskHandle::spawn(dispatch_loop(self.inner.clone())));
        debug!("Procedure executor started");
    }

    pub fn submit(&self, kind: ProcedureKind) -> Result<Submission> {
        self.submit_with(kind, |_| {})
    }

    /// Submit a root procedure. The scheduler lock for its resource key is
    /// taken first; a held key rejects the submission without creating
    /// anything. `on_accepted` runs after the new record is durable and
    /// before the dispatcher can see it.
    pub fn submit_with<F>(&self, kind: ProcedureKind, on_accepted: F) -> Result<Submission>
    where
        F: FnOnce(ProcId),
    {
        let inner = &self.inner;
        if inner.halted.load(Ordering::SeqCst) {
            return Err(Error::Halted);
        }
        if inner.stopping.load(Ordering::SeqCst) {
            return Ok(Submission::Rejected(RejectReason::Stopping));
        }

        let mut state = inner.lock();
        if inner.stopping.load(Ordering::SeqCst) {
            return Ok(Submission::Rejected(RejectReason::Stopping));
        }
        let id = state.next_id;
        let key = kind.lock_key();
        if let Some(key) = &key {
            if let Err(holder) = state.scheduler.try_acquire(key, id) {
                return Ok(Submission::Rejected(RejectReason::AlreadyRecovering(holder)));
            }
        }
        state.allocate_id();

        let record = ProcedureRecord::new(id, None, kind);
        if let Err(e) = inner.append(&mut state, &[LogRecord::Update(record.clone())]) {
            if let Some(key) = &key {
                state.scheduler.release(key, id);
            }
            return Err(e);
        }
        on_accepted(id);

        info!(
            proc_id = id,
            procedure = record.kind.name(),
            server = ?record.kind.server().map(|s| s.to_string()),
            "Submitted procedure"
        );
        state.procs.insert(id, record);
        state.scheduler.enqueue(id, key.as_deref());
        drop(state);

        inner.wake.notify_one();
        Ok(Submission::Submitted(id))
    }

    pub fn query(&self, id: ProcId) -> Option<ProcedureInfo> {
        let state = self.inner.lock();
        state
            .procs
            .get(&id)
            .map(ProcedureRecord::info)
            .or_else(|| state.completed.get(&id).cloned())
    }

    /// Live and retained finished procedures, by id.
    pub fn procedures(&self) -> Vec<ProcedureInfo> {
        let state = self.inner.lock();
        let mut out: Vec<ProcedureInfo> = state
            .procs
            .values()
            .map(ProcedureRecord::info)
            .chain(state.completed.values().cloned())
            .collect();
        out.sort_by_key(|p| p.id);
        out
    }

    /// The procedure currently holding `key`.
    pub fn lock_holder(&self, key: &str) -> Option<ProcId> {
        self.inner.lock().scheduler.holder(key)
    }

    /// Number of procedures not yet finished.
    pub fn active(&self) -> usize {
        self.inner
            .lock()
            .procs
            .values()
            .filter(|r| !r.is_finished())
            .count()
    }

    /// Poll until `id` is finished or `timeout` passes.
    pub async fn wait_for(&self, id: ProcId, timeout: Duration) -> Option<ProcedureInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let info = self.query(id);
            if info.as_ref().map_or(true, ProcedureInfo::is_finished) {
                return info;
            }
            if tokio::time::Instant::now() >= deadline {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    /// Refuse new submissions and log appends, then abort the dispatcher
    /// and every running step. A step in flight is abandoned; its record was
    /// not advanced, so a later replay runs it again. Once this returns the
    /// log is never written by this executor again.
    pub fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        // Wait out an append already under the state lock.
        drop(self.inner.lock());
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if dispatcher.is_some() {
            info!("Procedure executor stopped");
        }
    }
}

impl Drop for ProcedureExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns the running steps: aborting the dispatcher drops the set, which
/// aborts them too.
async fn dispatch_loop(inner: Arc<Inner>) {
    let mut running: JoinSet<()> = JoinSet::new();
    loop {
        if inner.halted.load(Ordering::SeqCst) {
            warn!(running = running.len(), "Executor halted, dispatcher exiting");
            running.abort_all();
            return;
        }
        let next = inner.lock().scheduler.poll();
        if let Some(id) = next {
            let inner = inner.clone();
            running.spawn(async move { inner.run_one(id).await });
            continue;
        }
        tokio::select! {
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = %e, "Procedure step panicked");
                    }
                }
            }
            _ = tokio::time::timeout(IDLE_POLL, inner.wake.notified()) => {}
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ExecState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append(&self, state: &mut ExecState, records: &[LogRecord]) -> Result<()> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(Error::Halted);
        }
        if self.stopping.load(Ordering::SeqCst) {
            debug!(records = records.len(), "Executor stopping, append refused");
            return Err(Error::Stopping);
        }
        if let Err(e) = state.log.append(records) {
            self.halted.store(true, Ordering::SeqCst);
            error!(error = %e, "Procedure log append failed; halting executor");
            return Err(Error::Durability(e.to_string()));
        }
        Ok(())
    }

    async fn run_one(self: &Arc<Self>, id: ProcId) {
        let (record, failed_child) = {
            let state = self.lock();
            let Some(record) = state.procs.get(&id) else {
                return;
            };
            if record.state != ProcState::Runnable {
                return;
            }
            (record.clone(), state.failed_child(record))
        };

        if let Some((child, reason)) = failed_child {
            let err = Error::ChildFailed { child, reason };
            self.finish(record, ProcState::Failed(err.to_string()), Vec::new());
            return;
        }

        let view = StepView {
            proc_id: id,
            procedure: record.kind.name(),
            step: record.kind.step_name(),
            server: record.kind.server().cloned(),
        };
        self.interceptor.before_step(&view).await;

        let mut kind = record.kind.clone();
        let mut ctx = StepContext::new(id, &self.env);
        let result = kind.execute(&mut ctx).await;
        let effects = ctx.into_effects();

        let mut record = record;
        match result {
            Ok(flow) => {
                record.kind = kind;
                record.attempts = 0;
                debug!(proc_id = id, step = view.step, ?flow, "Step complete");
                match flow {
                    Flow::Continue => self.advance(record, effects),
                    Flow::Spawn(children) if children.is_empty() => self.advance(record, effects),
                    Flow::Spawn(children) => self.suspend(record, children, effects),
                    Flow::Done => self.finish(record, ProcState::Succeeded, effects),
                }
            }
            Err(e) if e.is_retryable() && self.may_retry(record.attempts) => {
                self.retry_later(record, e);
            }
            Err(e) => {
                warn!(proc_id = id, step = view.step, error = %e, "Step failed");
                self.finish(record, ProcState::Failed(e.to_string()), Vec::new());
            }
        }

        self.interceptor.after_step(&view).await;
    }

    fn may_retry(&self, attempts: u32) -> bool {
        self.config.max_step_retries == 0 || attempts < self.config.max_step_retries
    }

    fn advance(&self, mut record: ProcedureRecord, effects: Vec<Effect>) {
        record.updated_at = Utc::now();
        let id = record.id;
        let mut state = self.lock();
        if self
            .append(&mut state, &[LogRecord::Update(record.clone())])
            .is_err()
        {
            return;
        }
        for effect in effects {
            self.env.apply(id, effect);
        }
        let key = record.kind.lock_key();
        state.procs.insert(id, record);
        state.scheduler.enqueue(id, key.as_deref());
        drop(state);
        self.wake.notify_one();
    }

    /// Persist the children and the suspended parent as one batch, then
    /// start the children.
    fn suspend(
        &self,
        mut record: ProcedureRecord,
        kinds: Vec<ProcedureKind>,
        effects: Vec<Effect>,
    ) {
        let id = record.id;
        let mut state = self.lock();

        let children: Vec<ProcedureRecord> = kinds
            .into_iter()
            .map(|kind| ProcedureRecord::new(state.allocate_id(), Some(id), kind))
            .collect();
        record.children = children.iter().map(|c| c.id).collect();
        record.state = ProcState::Waiting;
        record.updated_at = Utc::now();

        let mut batch: Vec<LogRecord> = children.iter().cloned().map(LogRecord::Update).collect();
        batch.push(LogRecord::Update(record.clone()));
        if self.append(&mut state, &batch).is_err() {
            return;
        }
        for effect in effects {
            self.env.apply(id, effect);
        }

        if !record.kind.holds_lock_while_waiting() {
            if let Some(key) = record.kind.lock_key() {
                state.scheduler.release(&key, id);
            }
        }
        debug!(proc_id = id, children = ?record.children, "Suspended on children");
        state.procs.insert(id, record);

        for child in children {
            let key = child.kind.lock_key();
            let child_id = child.id;
            state.procs.insert(child_id, child);
            state.scheduler.enqueue(child_id, key.as_deref());
        }
        drop(state);
        self.wake.notify_waiters();
        self.wake.notify_one();
    }

    fn finish(&self, mut record: ProcedureRecord, outcome: ProcState, effects: Vec<Effect>) {
        let id = record.id;
        record.state = outcome;
        record.updated_at = Utc::now();

        let mut state = self.lock();
        let tree = match record.parent {
            None => state.tree(id),
            Some(_) => Vec::new(),
        };

        let mut batch = vec![LogRecord::Update(record.clone())];
        batch.extend(tree.iter().rev().map(|p| LogRecord::Delete(*p)));
        if self.append(&mut state, &batch).is_err() {
            return;
        }

        for effect in effects {
            self.env.apply(id, effect);
        }
        match &record.state {
            ProcState::Failed(reason) => {
                warn!(proc_id = id, procedure = record.kind.name(), reason = %reason, "Procedure failed");
                record.kind.on_failed(id, &self.env.tracker);
            }
            _ => info!(proc_id = id, procedure = record.kind.name(), "Procedure succeeded"),
        }

        if let Some(key) = record.kind.lock_key() {
            state.scheduler.release(&key, id);
        }

        match record.parent {
            None => {
                let retention = self.config.completed_retention;
                state.procs.insert(id, record);
                for p in tree {
                    if let Some(done) = state.procs.remove(&p) {
                        state.retire(done.info(), retention);
                    }
                }
                self.maybe_compact(&mut state);
            }
            Some(parent) => {
                state.procs.insert(id, record);
                let resume = state
                    .procs
                    .get(&parent)
                    .filter(|p| p.state == ProcState::Waiting)
                    .map(|p| state.children_done(p))
                    .unwrap_or(false);
                if resume {
                    let key = state.procs.get_mut(&parent).map(|p| {
                        p.state = ProcState::Runnable;
                        p.kind.lock_key()
                    });
                    if let Some(key) = key {
                        debug!(proc_id = parent, "Children finished, resuming");
                        state.scheduler.enqueue(parent, key.as_deref());
                    }
                }
            }
        }
        drop(state);
        self.wake.notify_one();
    }

    fn retry_later(self: &Arc<Self>, mut record: ProcedureRecord, err: Error) {
        let id = record.id;
        let delay = backoff_delay(
            record.attempts,
            self.config.retry_initial_backoff,
            self.config.retry_max_backoff,
        );
        record.attempts += 1;
        warn!(
            proc_id = id,
            step = record.kind.step_name(),
            attempt = record.attempts,
            error = %err,
            "Transient step failure, retrying in {:?}",
            delay
        );
        self.lock().procs.insert(id, record);

        let weak: Weak<Inner> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.requeue(id);
            }
        });
    }

    fn requeue(&self, id: ProcId) {
        let mut state = self.lock();
        let key = match state.procs.get(&id) {
            Some(r) if r.state == ProcState::Runnable => r.kind.lock_key(),
            _ => return,
        };
        state.scheduler.enqueue(id, key.as_deref());
        drop(state);
        self.wake.notify_one();
    }

    fn maybe_compact(&self, state: &mut ExecState) {
        if state.log.appended_since_compaction() <= self.config.compaction_threshold {
            return;
        }
        let mut live: Vec<ProcedureRecord> = state.procs.values().cloned().collect();
        live.sort_by_key(|r| r.id);
        // A failed compaction leaves the old log in place; appends continue.
        match state.log.compact(&live) {
            Ok(()) => info!(live = live.len(), "Compacted procedure log"),
            Err(e) => warn!(error = %e, "Procedure log compaction failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::cluster::{Collaborators, InMemoryCluster};
    use crate::master::crash::ServerCrashData;
    use crate::master::server_state::{ServerName, ServerState};
    use crate::procedure::interceptor::NoopInterceptor;
    use crate::procedure::store::MemoryProcedureLog;

    fn rs(port: u16) -> ServerName {
        ServerName::new("rs", port, 1)
    }

    fn executor(cluster: Arc<InMemoryCluster>, log: MemoryProcedureLog) -> ProcedureExecutor {
        let env = Arc::new(MasterEnv::new(Collaborators::from_cluster(cluster), true));
        let config = ExecutorConfig {
            retry_initial_backoff: Duration::from_millis(1),
            retry_max_backoff: Duration::from_millis(5),
            ..Default::default()
        };
        ProcedureExecutor::new(env, Box::new(log), Arc::new(NoopInterceptor), config)
    }

    fn crash(port: u16) -> ProcedureKind {
        ProcedureKind::ServerCrash(ServerCrashData::new(rs(port)))
    }

    fn claim<'a>(exec: &'a ProcedureExecutor, server: &ServerName) -> impl FnOnce(ProcId) + 'a {
        let tracker = &exec.env().tracker;
        let server = server.clone();
        move |id| {
            tracker.register_online(&server, Default::default());
            tracker.mark_crash(&server, id).unwrap();
        }
    }

    #[tokio::test]
    async fn test_duplicate_submission_rejected() {
        let cluster = Arc::new(InMemoryCluster::new());
        let exec = executor(cluster, MemoryProcedureLog::new());
        exec.replay().unwrap();

        let first = exec.submit_with(crash(1), claim(&exec, &rs(1))).unwrap();
        assert_eq!(first, Submission::Submitted(1));

        let second = exec.submit(crash(1)).unwrap();
        assert_eq!(second, Submission::Rejected(RejectReason::AlreadyRecovering(1)));

        // Rejection burns no id.
        let other = exec.submit_with(crash(2), claim(&exec, &rs(2))).unwrap();
        assert_eq!(other, Submission::Submitted(2));
    }

    #[tokio::test]
    async fn test_crash_procedure_runs_to_completion() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.assign(&rs(1), ["t1,a", "t1,b"]);
        cluster.start_server(&rs(2));
        cluster.add_segments(&rs(1), ["wal.1", "wal.2"]);

        let log = MemoryProcedureLog::new();
        let exec = executor(cluster.clone(), log.clone());
        exec.replay().unwrap();
        exec.start();

        let id = exec
            .submit_with(crash(1), claim(&exec, &rs(1)))
            .unwrap()
            .proc_id();
        let info = exec.wait_for(id, Duration::from_secs(5)).await.unwrap();
        assert!(info.is_success(), "{:?}", info);

        assert_eq!(exec.env().tracker.state(&rs(1)), None);
        assert!(cluster.owned_by(&rs(1)).is_empty());
        assert_eq!(cluster.owned_by(&rs(2)).len(), 2);
        assert_eq!(exec.lock_holder("server:rs,1,1"), None);
        assert_eq!(exec.active(), 0);

        // Root and both kinds of children are queryable after tombstoning.
        let kinds: Vec<String> = exec.procedures().into_iter().map(|p| p.procedure).collect();
        assert_eq!(kinds.iter().filter(|k| *k == "SplitLog").count(), 2);
        assert_eq!(kinds.iter().filter(|k| *k == "ReassignPartition").count(), 2);

        // Replaying the log afterwards finds nothing to resume.
        let again = executor(cluster, log);
        let summary = again.replay().unwrap();
        assert_eq!(summary.resumed, 0);
        assert!(summary.next_id > id);
    }

    #[tokio::test]
    async fn test_missing_node_fails_terminally() {
        let cluster = Arc::new(InMemoryCluster::new());
        let exec = executor(cluster, MemoryProcedureLog::new());
        exec.replay().unwrap();
        exec.start();

        // Submitted without claiming a tracker node.
        let id = exec.submit(crash(9)).unwrap().proc_id();
        let info = exec.wait_for(id, Duration::from_secs(5)).await.unwrap();
        assert!(info.is_finished());
        assert!(!info.is_success());
        assert!(info.error.unwrap().contains("rs,9,1"));

        // The lock is free again.
        assert!(exec.submit(crash(9)).unwrap().is_submitted());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.assign(&rs(1), ["t1,a"]);
        cluster.start_server(&rs(2));
        cluster.fail_next(3);

        let exec = executor(cluster.clone(), MemoryProcedureLog::new());
        exec.replay().unwrap();
        exec.start();

        let id = exec
            .submit_with(crash(1), claim(&exec, &rs(1)))
            .unwrap()
            .proc_id();
        let info = exec.wait_for(id, Duration::from_secs(5)).await.unwrap();
        assert!(info.is_success(), "{:?}", info);
        assert_eq!(exec.env().tracker.state(&rs(1)), None);
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_node_crashed() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.assign(&rs(1), ["t1,a"]);
        // No live server to take the partition.

        let env = Arc::new(MasterEnv::new(Collaborators::from_cluster(cluster), false));
        let config = ExecutorConfig {
            max_step_retries: 2,
            retry_initial_backoff: Duration::from_millis(1),
            retry_max_backoff: Duration::from_millis(2),
            ..Default::default()
        };
        let exec = ProcedureExecutor::new(
            env,
            Box::new(MemoryProcedureLog::new()),
            Arc::new(NoopInterceptor),
            config,
        );
        exec.replay().unwrap();
        exec.start();

        let id = exec
            .submit_with(crash(1), claim(&exec, &rs(1)))
            .unwrap()
            .proc_id();
        let info = exec.wait_for(id, Duration::from_secs(5)).await.unwrap();
        assert!(info.is_finished());
        assert!(!info.is_success());
        assert!(info.error.unwrap().contains("failed"));

        let node = exec.env().tracker.get(&rs(1)).unwrap();
        assert_eq!(node.state, ServerState::Offline);
        assert_eq!(node.recovery, None);
    }

    #[tokio::test]
    async fn test_stopped_executor_never_appends() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.assign(&rs(1), ["t1,a"]);
        cluster.start_server(&rs(2));

        let log = MemoryProcedureLog::new();
        let exec = executor(cluster, log.clone());
        exec.replay().unwrap();
        let id = exec
            .submit_with(crash(1), claim(&exec, &rs(1)))
            .unwrap()
            .proc_id();
        let logged = log.len();
        let record = exec.inner.lock().procs[&id].clone();

        // A step that was mid-flight when stop() ran completes afterwards.
        exec.stop();
        exec.inner.advance(record.clone(), Vec::new());
        exec.inner.finish(record, ProcState::Succeeded, Vec::new());

        assert_eq!(log.len(), logged);
        assert!(!exec.is_halted());
        assert_eq!(exec.query(id).unwrap().step, "Start");
        assert!(!exec.query(id).unwrap().is_finished());
        assert_eq!(
            exec.submit(crash(2)).unwrap(),
            Submission::Rejected(RejectReason::Stopping)
        );
    }

    #[tokio::test]
    async fn test_finished_tree_is_compacted_away() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.assign(&rs(1), ["t1,a"]);
        cluster.start_server(&rs(2));

        let log = MemoryProcedureLog::new();
        let env = Arc::new(MasterEnv::new(Collaborators::from_cluster(cluster), true));
        let config = ExecutorConfig {
            compaction_threshold: 1,
            ..Default::default()
        };
        let exec = ProcedureExecutor::new(env, Box::new(log.clone()), Arc::new(NoopInterceptor), config);
        exec.replay().unwrap();
        exec.start();

        let id = exec
            .submit_with(crash(1), claim(&exec, &rs(1)))
            .unwrap()
            .proc_id();
        assert!(exec.wait_for(id, Duration::from_secs(5)).await.unwrap().is_success());
        assert!(log.is_empty());
        assert!(exec.query(id).is_some());
    }
}
