//! HTTP client for the master admin API

use crate::common::{Error, Result};
use crate::master::http::{ExpireResponse, RegisterRequest};
use crate::master::{Registration, ServerName, ServerStateNode};
use crate::procedure::{ProcId, ProcedureInfo};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub struct AdminClient {
    base: String,
    http: reqwest::Client,
}

impl AdminClient {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        self.get("/health").await
    }

    pub async fn expire(&self, server: &ServerName) -> Result<ExpireResponse> {
        self.post(&format!("/admin/servers/{}/expire", server), &()).await
    }

    pub async fn server(&self, server: &ServerName) -> Result<ServerStateNode> {
        self.get(&format!("/admin/servers/{}", server)).await
    }

    pub async fn servers(&self) -> Result<Vec<ServerStateNode>> {
        self.get("/admin/servers").await
    }

    pub async fn register(&self, server: &ServerName, partitions: Vec<String>) -> Result<Registration> {
        let req = RegisterRequest {
            name: server.to_string(),
            partitions,
        };
        self.post("/admin/servers/register", &req).await
    }

    pub async fn reconcile(&self) -> Result<Vec<ProcId>> {
        #[derive(serde::Deserialize)]
        struct Reconciled {
            submitted: Vec<ProcId>,
        }
        let r: Reconciled = self.post("/admin/reconcile", &()).await?;
        Ok(r.submitted)
    }

    pub async fn procedures(&self) -> Result<Vec<ProcedureInfo>> {
        self.get("/admin/procedures").await
    }

    pub async fn procedure(&self, id: ProcId) -> Result<ProcedureInfo> {
        self.get(&format!("/admin/procedures/{}", id)).await
    }

    /// Poll until `id` finishes.
    pub async fn wait(&self, id: ProcId, timeout: Duration) -> Result<ProcedureInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let info = self.procedure(id).await?;
            if info.is_finished() {
                return Ok(info);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "procedure {} still at step {}",
                    id, info.step
                )));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.http.get(format!("{}{}", self.base, path)).send().await?;
        decode(resp).await
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await?;
        decode(resp).await
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    let message = body
        .get("error")
        .and_then(|e| e.as_str())
        .unwrap_or("no detail")
        .to_string();
    Err(match status.as_u16() {
        503 => Error::Unavailable(message),
        _ => Error::Http(format!("{}: {}", status, message)),
    })
}
