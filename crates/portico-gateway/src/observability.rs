//! Structured request logging and per-route metrics.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::info;

use portico_metrics::MetricsRegistry;

use crate::context::RequestContext;
use crate::pipeline::{Decision, Outcome, Stage};

/// One log record per finished request.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub method: String,
    pub path: String,
    pub remote: String,
    pub request_id: Option<String>,
    pub status: u16,
    pub success: bool,
    pub latency_us: u64,
}

/// Where finished-request entries go. The production sink writes to
/// `tracing`; tests use [`MemorySink`] to assert on emitted entries.
pub trait LogSink: Send + Sync {
    fn emit(&self, entry: &LogEntry);
}

#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, entry: &LogEntry) {
        info!(
            method = %entry.method,
            path = %entry.path,
            remote = %entry.remote,
            request_id = entry.request_id.as_deref().unwrap_or("-"),
            status = entry.status,
            success = entry.success,
            latency_us = entry.latency_us,
            "request completed"
        );
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, entry: &LogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
    }
}

/// Outermost middleware stage: emits exactly one log entry per request and
/// records route counters and latency. Runs for rejected requests too, so
/// every request that enters the pipeline is accounted for.
pub struct ObservabilityStage {
    sink: Arc<dyn LogSink>,
    metrics: Arc<MetricsRegistry>,
    excluded_paths: Vec<String>,
}

impl ObservabilityStage {
    pub fn new(sink: Arc<dyn LogSink>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            sink,
            metrics,
            excluded_paths: Vec::new(),
        }
    }

    pub fn with_excluded_paths(mut self, paths: Vec<String>) -> Self {
        self.excluded_paths = paths;
        self
    }
}

#[async_trait]
impl Stage for ObservabilityStage {
    fn name(&self) -> &str {
        "observability"
    }

    fn excluded_paths(&self) -> &[String] {
        &self.excluded_paths
    }

    async fn before(&self, _ctx: &mut RequestContext) -> Decision {
        // Start time and identity are captured when the context is built;
        // nothing to do until the outcome is known.
        Decision::Proceed
    }

    async fn after(&self, ctx: &RequestContext, outcome: &Outcome) {
        let latency_us = ctx.started.elapsed().as_micros() as u64;
        let entry = LogEntry {
            method: ctx.method.clone(),
            path: ctx.path.clone(),
            remote: ctx.remote.clone(),
            request_id: ctx.request_id.clone(),
            status: outcome.status,
            success: outcome.success,
            latency_us,
        };
        self.sink.emit(&entry);

        if outcome.status == 409 {
            self.metrics.record_duplicate();
        } else {
            self.metrics
                .record_call(&ctx.path, latency_us, outcome.success);
        }
    }
}
