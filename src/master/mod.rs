//! Failover master
//!
//! Owns the server state tracker, the collaborators and the procedure
//! executor, and exposes them to operators through [`Master`] and the admin
//! HTTP API.

pub mod cluster;
pub mod crash;
pub mod http;
pub mod reconcile;
pub mod server;
pub mod server_state;
pub mod subprocedure;

pub use cluster::{Collaborators, InMemoryCluster};
pub use server::{Master, Registration};
pub use server_state::{PartitionRef, ServerName, ServerState, ServerStateNode, ServerTracker};

use crate::procedure::{Effect, ProcId};
use tracing::{debug, error, info};

/// Everything a procedure step may touch.
pub struct MasterEnv {
    pub tracker: ServerTracker,
    pub cluster: Collaborators,
    pub split_log_per_segment: bool,
}

impl MasterEnv {
    pub fn new(cluster: Collaborators, split_log_per_segment: bool) -> Self {
        Self {
            tracker: ServerTracker::new(),
            cluster,
            split_log_per_segment,
        }
    }

    /// Apply a step effect whose record is already durable.
    pub(crate) fn apply(&self, proc_id: ProcId, effect: Effect) {
        match effect {
            Effect::AdvanceServer { server, state } => {
                match self.tracker.advance(&server, proc_id, state) {
                    Ok(()) => info!(proc_id, server = %server, %state, "Server state advanced"),
                    Err(e) => error!(proc_id, server = %server, error = %e, "Server state not advanced"),
                }
            }
            Effect::DeleteServer { server } => match self.tracker.delete(&server, proc_id) {
                Ok(_) => info!(proc_id, server = %server, "Server removed"),
                Err(e) => error!(proc_id, server = %server, error = %e, "Server not removed"),
            },
            Effect::TerminateServer { server } => {
                let channel = self.cluster.channel.clone();
                tokio::spawn(async move {
                    if let Err(e) = channel.send_terminate(&server).await {
                        debug!(server = %server, error = %e, "Terminate not delivered");
                    }
                });
            }
        }
    }
}
