//! Master server

use super::cluster::Collaborators;
use super::crash::ServerCrashData;
use super::http::create_router;
use super::reconcile;
use super::server_state::{MarkCrashRejection, PartitionRef, ServerName, ServerState, ServerStateNode};
use super::MasterEnv;
use crate::common::{MasterConfig, Result, TaskHandle};
use crate::procedure::{
    ExecutorConfig, FileProcedureLog, NoopInterceptor, ProcId, ProcedureExecutor, ProcedureInfo,
    ProcedureKind, ProcedureLog, StepInterceptor, Submission,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Result of a server join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// False when the node is already being recovered
    pub registered: bool,
    /// Recoveries submitted for older generations on the same address
    pub expired: Vec<ProcId>,
}

pub struct Master {
    config: MasterConfig,
    env: Arc<MasterEnv>,
    executor: ProcedureExecutor,
    liveness: Mutex<Option<TaskHandle>>,
}

impl Master {
    /// Start with the file-backed procedure log from `config`.
    pub async fn start(config: MasterConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        let log = FileProcedureLog::open(&config.log_path, config.log_sync)?;
        Self::start_with(config, collaborators, Box::new(log), Arc::new(NoopInterceptor)).await
    }

    /// Replay the log, rebuild the tracker, start the executor and expire
    /// servers that died while no master was watching.
    pub async fn start_with(
        config: MasterConfig,
        collaborators: Collaborators,
        log: Box<dyn ProcedureLog>,
        interceptor: Arc<dyn StepInterceptor>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let env = Arc::new(MasterEnv::new(collaborators, config.split_log_per_segment));
        let executor =
            ProcedureExecutor::new(env.clone(), log, interceptor, ExecutorConfig::from(&config));

        let replayed = executor.replay()?;
        reconcile::rebuild(&env).await?;

        let master = Arc::new(Master {
            config,
            env,
            executor,
            liveness: Mutex::new(None),
        });
        master.executor.start();

        let expired = reconcile::expire_dead_servers(&master, true).await?;
        tracing::info!(
            resumed = replayed.resumed,
            expired = expired.len(),
            servers = master.env.tracker.len(),
            "Master ready"
        );

        if let Some(interval) = master.config.liveness_interval() {
            let handle = TaskHandle::spawn(liveness_loop(Arc::downgrade(&master), interval));
            *master.liveness.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }

        Ok(master)
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub(crate) fn env(&self) -> &MasterEnv {
        &self.env
    }

    /// Declare `name` dead and submit its recovery.
    ///
    /// Rejected (not an error) while another recovery holds the server. A
    /// server with no node is accepted: the node is created and claimed in
    /// one go. A node left crashed by a failed recovery is re-claimed.
    pub fn submit_crash_recovery(&self, name: &ServerName) -> Result<Submission> {
        let tracker = &self.env.tracker;
        let kind = ProcedureKind::ServerCrash(ServerCrashData::new(name.clone()));
        self.executor.submit_with(kind, |id| {
            tracker.observe(name, BTreeSet::new());
            match tracker.mark_crash(name, id) {
                Ok(()) => {}
                Err(MarkCrashRejection::AlreadyCrashed { by: None }) => {
                    tracker.claim_orphan(name, id);
                }
                Err(rejection) => {
                    tracing::warn!(
                        proc_id = id,
                        server = %name,
                        ?rejection,
                        "Recovery submitted for a node it cannot claim"
                    );
                }
            }
        })
    }

    pub fn query_server_state(&self, name: &ServerName) -> Option<ServerState> {
        self.env.tracker.state(name)
    }

    pub fn server_node(&self, name: &ServerName) -> Option<ServerStateNode> {
        self.env.tracker.get(name)
    }

    pub fn servers(&self) -> Vec<ServerStateNode> {
        self.env.tracker.nodes()
    }

    pub fn query_procedure(&self, id: ProcId) -> Option<ProcedureInfo> {
        self.executor.query(id)
    }

    pub fn procedures(&self) -> Vec<ProcedureInfo> {
        self.executor.procedures()
    }

    /// The in-flight recovery for `name`, if any.
    pub fn crash_procedure_for(&self, name: &ServerName) -> Option<ProcId> {
        self.executor.lock_holder(&format!("server:{}", name))
    }

    pub async fn wait_procedure(&self, id: ProcId, timeout: Duration) -> Option<ProcedureInfo> {
        self.executor.wait_for(id, timeout).await
    }

    /// A server joined. Older generations on the same address that are
    /// still online are expired first.
    pub async fn register_server(
        &self,
        name: &ServerName,
        partitions: BTreeSet<PartitionRef>,
    ) -> Result<Registration> {
        let mut registration = Registration::default();
        for old in self.env.tracker.older_generations(name) {
            if self.env.tracker.state(&old) != Some(ServerState::Online) {
                continue;
            }
            if let Submission::Submitted(id) = self.submit_crash_recovery(&old)? {
                tracing::info!(proc_id = id, old = %old, new = %name, "Replaced server generation");
                registration.expired.push(id);
            }
        }

        let crashed = self
            .env
            .tracker
            .state(name)
            .is_some_and(|state| state.is_crashed_family());
        if crashed {
            tracing::warn!(server = %name, "Join refused, server is being recovered");
            return Ok(registration);
        }

        self.env
            .cluster
            .membership
            .record_join(name, &partitions)
            .await?;
        registration.registered = self.env.tracker.register_online(name, partitions);
        if registration.registered {
            tracing::info!(server = %name, "Server registered");
        }
        Ok(registration)
    }

    /// Rerun restart reconciliation, including unclaimed crashed nodes.
    pub async fn reconcile(&self) -> Result<Vec<ProcId>> {
        reconcile::expire_dead_servers(self, true).await
    }

    pub fn is_halted(&self) -> bool {
        self.executor.is_halted()
    }

    /// Stop liveness detection and the executor. Procedures in flight stay
    /// in the log and resume on the next start.
    pub fn shutdown(&self) {
        self.liveness
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.executor.stop();
    }

    /// Serve the admin API until ctrl-c.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        tracing::info!("Starting failover master");
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Procedure log: {}", self.config.log_path.display());
        tracing::info!("  Log sync: {:?}", self.config.log_sync);

        let router = create_router(self.clone()).layer(TraceLayer::new_for_http());
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        tracing::info!("✓ Master ready");

        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;

        self.shutdown();
        Ok(())
    }
}

async fn liveness_loop(master: Weak<Master>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(master) = master.upgrade() else {
            return;
        };
        if master.is_halted() {
            return;
        }
        if let Err(e) = reconcile::expire_dead_servers(&master, false).await {
            if e.is_fatal() {
                tracing::error!(error = %e, "Liveness detection stopped");
                return;
            }
            tracing::warn!(error = %e, "Liveness check failed");
        }
    }
}
