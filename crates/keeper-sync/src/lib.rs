//! Offline-first delivery of local mutations: a durable FIFO queue with bounded
//! retries, a connectivity signal, and the transports that push operations upstream.

pub mod connectivity;
pub mod operation;
pub mod queue;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::instrument;

pub use connectivity::ConnectivityMonitor;
pub use operation::{OperationStatus, OperationType, SyncOperation};
pub use queue::{SyncConfig, SyncError, SyncQueue, SyncReport, SyncStatus, SyncWorker};

/// Delivers a single queued operation to the remote side.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Human-readable transport name.
    fn name(&self) -> &'static str;

    /// Any error counts as a failed attempt and is retried by the queue.
    async fn send(&self, op: &SyncOperation) -> Result<()>;
}

/// Accepts everything. Used when no endpoint is configured.
pub struct NoopTransport;

#[async_trait]
impl SyncTransport for NoopTransport {
    fn name(&self) -> &'static str {
        "noop"
    }

    #[instrument(skip_all)]
    async fn send(&self, _op: &SyncOperation) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HttpTransportConfig {
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// REST transport: `POST`/`PUT`/`DELETE` on `{endpoint}/{entity}s/{entityId}`.
pub struct HttpTransport {
    cfg: HttpTransportConfig,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(cfg: HttpTransportConfig) -> Self {
        Self {
            cfg,
            client: reqwest::Client::new(),
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("health-keeper"));
        if let Some(token) = &self.cfg.token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .context("sync token is not a valid header value")?,
            );
        }
        Ok(headers)
    }

    fn url_for(&self, op: &SyncOperation) -> String {
        format!(
            "{}/{}s/{}",
            self.cfg.endpoint.trim_end_matches('/'),
            op.entity,
            op.entity_id
        )
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    #[instrument(skip_all, fields(op_id = %op.id, entity = %op.entity, op_type = ?op.op_type))]
    async fn send(&self, op: &SyncOperation) -> Result<()> {
        let url = self.url_for(op);
        let request = match op.op_type {
            OperationType::Create => self.client.post(&url).json(&op.payload),
            OperationType::Update => self.client.put(&url).json(&op.payload),
            OperationType::Delete => self.client.delete(&url),
        };
        request
            .headers(self.headers()?)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
