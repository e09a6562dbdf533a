use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use crate::{metrics::GatewayMetrics, ratelimit::Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RateLimited,
    InvalidCaller,
    LimiterUnavailable,
    BreakerOpen,
    NoHealthyBackend,
    BackendFailure,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub key: Option<String>,
    pub tier: Option<Tier>,
    pub method: String,
    pub path: String,
    pub service: String,
    pub backend: Option<String>,
    pub outcome: Outcome,
    pub latency_ms: u64,
}

/// Write-only destination for per-request records. Must not block the caller.
pub trait AnalyticsSink: Send + Sync {
    fn record(&self, record: AnalyticsRecord);
}

/// Emits each record as a structured log line.
pub struct LogSink;

impl AnalyticsSink for LogSink {
    fn record(&self, record: AnalyticsRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => tracing::info!(target: "analytics", record = %line),
            Err(err) => tracing::warn!(error = %err, "failed to encode analytics record"),
        }
    }
}

/// Buffers records on a bounded queue drained by a background task. Full queue drops.
pub struct QueuedSink {
    sender: mpsc::Sender<AnalyticsRecord>,
    metrics: Arc<GatewayMetrics>,
}

impl QueuedSink {
    pub fn spawn(
        capacity: usize,
        inner: Arc<dyn AnalyticsSink>,
        metrics: Arc<GatewayMetrics>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<AnalyticsRecord>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                inner.record(record);
            }
            tracing::info!("analytics queue closed, drain task exiting");
        });
        (Self { sender, metrics }, handle)
    }
}

impl AnalyticsSink for QueuedSink {
    fn record(&self, record: AnalyticsRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.metrics.analytics_dropped();
                tracing::debug!(request_id = %record.request_id, "analytics queue full; record dropped");
            }
            Err(TrySendError::Closed(_)) => self.metrics.analytics_dropped(),
        }
    }
}
