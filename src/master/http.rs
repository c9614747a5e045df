//! Admin HTTP API for the master
//!
//! - `GET  /health`
//! - `GET  /admin/servers`, `GET /admin/servers/:name`
//! - `POST /admin/servers/:name/expire`
//! - `POST /admin/servers/register`
//! - `POST /admin/reconcile`
//! - `GET  /admin/procedures`, `GET /admin/procedures/:id`

use super::server::Master;
use super::server_state::{PartitionRef, ServerName};
use crate::common::Error;
use crate::procedure::{ProcId, Submission, NO_PROC_ID};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

pub type MasterState = Arc<Master>;

/// Body of `POST /admin/servers/:name/expire`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpireResponse {
    pub proc_id: ProcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

impl From<Submission> for ExpireResponse {
    fn from(submission: Submission) -> Self {
        match submission {
            Submission::Submitted(id) => ExpireResponse {
                proc_id: id,
                rejected: None,
            },
            Submission::Rejected(reason) => ExpireResponse {
                proc_id: NO_PROC_ID,
                rejected: Some(reason.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    #[serde(default)]
    pub partitions: Vec<String>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn create_router(state: MasterState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admin/servers", get(list_servers))
        .route("/admin/servers/register", post(register_server))
        .route("/admin/servers/:name", get(get_server))
        .route("/admin/servers/:name/expire", post(expire_server))
        .route("/admin/reconcile", post(reconcile))
        .route("/admin/procedures", get(list_procedures))
        .route("/admin/procedures/:id", get(get_procedure))
        .with_state(state)
}

async fn health(State(master): State<MasterState>) -> impl IntoResponse {
    let halted = master.is_halted();
    let status = if halted {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(json!({
            "status": if halted { "halted" } else { "healthy" },
            "servers": master.servers().len(),
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

async fn list_servers(State(master): State<MasterState>) -> impl IntoResponse {
    Json(master.servers())
}

async fn get_server(
    State(master): State<MasterState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let name: ServerName = name.parse()?;
    let node = master
        .server_node(&name)
        .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
    Ok(Json(node))
}

async fn expire_server(
    State(master): State<MasterState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let name: ServerName = name.parse()?;
    let submission = master.submit_crash_recovery(&name)?;
    Ok(Json(ExpireResponse::from(submission)))
}

async fn register_server(
    State(master): State<MasterState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, Error> {
    let name: ServerName = req.name.parse()?;
    let partitions: BTreeSet<PartitionRef> = req
        .partitions
        .iter()
        .map(|p| PartitionRef::from(p.as_str()))
        .collect();
    let registration = master.register_server(&name, partitions).await?;
    Ok(Json(registration))
}

async fn reconcile(State(master): State<MasterState>) -> Result<impl IntoResponse, Error> {
    let submitted = master.reconcile().await?;
    Ok(Json(json!({ "submitted": submitted })))
}

async fn list_procedures(State(master): State<MasterState>) -> impl IntoResponse {
    Json(master.procedures())
}

async fn get_procedure(
    State(master): State<MasterState>,
    Path(id): Path<ProcId>,
) -> Result<impl IntoResponse, Error> {
    let info = master
        .query_procedure(id)
        .ok_or(Error::ProcedureNotFound(id))?;
    Ok(Json(info))
}
