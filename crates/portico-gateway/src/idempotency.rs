//! At-most-once request processing.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::dedup::{CheckResult, DedupStore};
use crate::pipeline::{Decision, Outcome, Rejection, Stage};

/// Annotation set when this request's check-and-insert claimed the ID.
/// Without it, `after` must not touch the record: a rejected duplicate
/// releasing the winner's claim would defeat the whole stage.
const OWNER_ANNOTATION: &str = "idempotency.owner";

/// Middleware stage enforcing at-most-once processing per client request ID.
///
/// Requests without the ID header pass through undeduplicated. Dedup store
/// errors fail closed: the request is rejected rather than forwarded with
/// deduplication silently skipped.
pub struct IdempotencyStage {
    store: Arc<dyn DedupStore>,
    excluded_paths: Vec<String>,
}

impl IdempotencyStage {
    pub fn new(store: Arc<dyn DedupStore>) -> Self {
        Self {
            store,
            excluded_paths: Vec::new(),
        }
    }

    pub fn with_excluded_paths(mut self, paths: Vec<String>) -> Self {
        self.excluded_paths = paths;
        self
    }
}

#[async_trait]
impl Stage for IdempotencyStage {
    fn name(&self) -> &str {
        "idempotency"
    }

    fn excluded_paths(&self) -> &[String] {
        &self.excluded_paths
    }

    async fn before(&self, ctx: &mut RequestContext) -> Decision {
        let Some(id) = ctx.request_id.clone() else {
            return Decision::Proceed;
        };

        match self.store.check_and_insert(&id).await {
            Ok(CheckResult::Inserted) => {
                ctx.annotate(OWNER_ANNOTATION, "1");
                Decision::Proceed
            }
            Ok(CheckResult::Pending) | Ok(CheckResult::Completed) => {
                debug!(request_id = %id, path = %ctx.path, "duplicate request rejected");
                Decision::Reject(Rejection::new(
                    409,
                    format!("duplicate request: {}", id),
                ))
            }
            Err(e) => {
                warn!(request_id = %id, error = %e, "dedup store unavailable, failing closed");
                Decision::Reject(Rejection::new(500, "request deduplication unavailable"))
            }
        }
    }

    async fn after(&self, ctx: &RequestContext, outcome: &Outcome) {
        let Some(id) = ctx.request_id.as_deref() else {
            return;
        };
        if ctx.annotation(OWNER_ANNOTATION).is_none() {
            return;
        }

        let result = if outcome.success {
            self.store.complete(id).await
        } else {
            // Failed or cancelled first attempt: release the claim so a
            // genuine retry can go through.
            self.store.remove(id).await
        };
        if let Err(e) = result {
            warn!(request_id = %id, error = %e, "failed to finalize dedup record");
        }
    }
}
