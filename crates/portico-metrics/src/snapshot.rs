use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which kind of server is reporting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Gateway,
    Backend,
}

/// Identity payload served on `__info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub role: ServerRole,
    pub version: String,
    pub uptime_ms: u64,
}

impl ServerInfo {
    pub fn new(role: ServerRole, uptime_ms: u64) -> Self {
        Self {
            role,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms,
        }
    }
}

/// Aggregated metrics for one route.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteMetrics {
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Point-in-time view of all metrics, served on `__metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_duplicates: u64,
    pub uptime_ms: u64,
    pub routes: HashMap<String, RouteMetrics>,
}
