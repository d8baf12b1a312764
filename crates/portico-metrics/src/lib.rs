//! Request metrics for gateway and backend servers.
//!
//! The [`MetricsRegistry`] is the shared recording surface: the hot path
//! increments lock-free atomic counters and a logarithmic latency histogram,
//! while the route table itself sits behind an `RwLock` that is only write-
//! locked the first time a route is seen. [`MetricsSnapshot`] is the
//! serializable view served on the `__metrics` endpoint; [`ServerInfo`] backs
//! `__info`.
//!
//! Route cardinality is bounded by the gateway's static routing table, so no
//! eviction is needed.

mod registry;
mod snapshot;

pub use registry::MetricsRegistry;
pub use snapshot::{MetricsSnapshot, RouteMetrics, ServerInfo, ServerRole};
