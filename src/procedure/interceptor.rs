//! Step interception
//!
//! The executor calls a [`StepInterceptor`] around every step it runs. The
//! default does nothing; [`StepGate`] parks one designated step until it is
//! released, which lets tests hold a procedure at a known point and race
//! other operations against it.

use super::ProcId;
use crate::master::server_state::ServerName;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;

/// What the executor is about to run (or has just run).
#[derive(Debug, Clone)]
pub struct StepView {
    pub proc_id: ProcId,
    pub procedure: &'static str,
    pub step: &'static str,
    pub server: Option<ServerName>,
}

#[async_trait]
pub trait StepInterceptor: Send + Sync + 'static {
    /// Awaited before the step body. May block for as long as it likes; only
    /// the procedure's own resource lock is held meanwhile.
    async fn before_step(&self, _view: &StepView) {}

    /// Called after the step's outcome is durable.
    async fn after_step(&self, _view: &StepView) {}
}

pub struct NoopInterceptor;

impl StepInterceptor for NoopInterceptor {}

/// Blocks the first and every later execution of one step until
/// [`StepGate::release`] is called. Once released the gate stays open.
pub struct StepGate {
    procedure: String,
    step: String,
    server: Option<ServerName>,
    reached: watch::Sender<bool>,
    released: watch::Sender<bool>,
}

impl StepGate {
    /// Gate `procedure`'s `step`, optionally only for one server.
    pub fn new(
        procedure: impl Into<String>,
        step: impl Into<String>,
        server: Option<ServerName>,
    ) -> Self {
        Self {
            procedure: procedure.into(),
            step: step.into(),
            server,
            reached: watch::Sender::new(false),
            released: watch::Sender::new(false),
        }
    }

    pub fn release(&self) {
        self.released.send_replace(true);
    }

    /// Whether a matching step has arrived at the gate.
    pub fn reached(&self) -> bool {
        *self.reached.borrow()
    }

    /// Wait until a matching step arrives at the gate.
    pub async fn wait_reached(&self, timeout: Duration) -> bool {
        let mut rx = self.reached.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|r| *r))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    fn matches(&self, view: &StepView) -> bool {
        view.procedure == self.procedure
            && view.step == self.step
            && match &self.server {
                Some(server) => view.server.as_ref() == Some(server),
                None => true,
            }
    }
}

#[async_trait]
impl StepInterceptor for StepGate {
    async fn before_step(&self, view: &StepView) {
        if !self.matches(view) {
            return;
        }
        self.reached.send_replace(true);

        let mut released = self.released.subscribe();
        if !*released.borrow() {
            tracing::info!(
                proc_id = view.proc_id,
                step = view.step,
                "Step held at gate"
            );
        }
        let _ = released.wait_for(|r| *r).await;
    }
}
