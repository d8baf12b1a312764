//! The Portico gateway.
//!
//! Inbound HTTP requests flow through a [`Pipeline`] of middleware stages
//! (idempotency, observability) into the [`GatewayRouter`] terminal, which
//! maps the request path to an RPC method, borrows a connection from the
//! [`ConnectionPool`], and forwards the call to a live backend discovered
//! through the endpoint registry.
//!
//! Stage order matters: observability is registered first so that it is
//! outermost and its `after` hook sees the final outcome of every request,
//! including requests the idempotency stage rejects.

pub mod clock;
pub mod context;
pub mod dedup;
pub mod http_server;
pub mod idempotency;
pub mod observability;
pub mod pipeline;
pub mod pool;
pub mod router;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::RequestContext;
pub use dedup::{CheckResult, DedupStore, MemoryDedupStore};
pub use http_server::{GatewayConfig, GatewayServer};
pub use idempotency::IdempotencyStage;
pub use observability::{LogEntry, LogSink, MemorySink, ObservabilityStage, TracingSink};
pub use pipeline::{Decision, Outcome, Pipeline, PipelineBuilder, Rejection, Stage, Terminal};
pub use pool::{Connection, ConnectionPool, PoolConfig};
pub use router::{GatewayRouter, RoutingTable};
