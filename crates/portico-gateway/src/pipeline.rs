//! Middleware pipeline.
//!
//! A [`Pipeline`] is an ordered, immutable list of [`Stage`]s wrapped around
//! a [`Terminal`]. `before` hooks run front to back; the first rejection
//! short-circuits the remaining `before`s and the terminal; `after` hooks run
//! back to front over every stage whose `before` ran, rejecting stage
//! included, and always see the final outcome.
//!
//! A stage may exclude paths: an excluded request skips that one stage's
//! hooks entirely but still flows through every other stage.
//!
//! Cancellation: [`Pipeline::run`] is driven by the HTTP handler future, so a
//! client disconnect drops it mid-flight and aborts the in-flight backend
//! call with it. The remaining `after` hooks then run in a detached task with
//! a [`Outcome::cancelled`] outcome, so the request is still logged and any
//! idempotency claim is released for a genuine retry.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use portico_common::protocol::PorticoError;

use crate::context::RequestContext;

/// Result of a stage's `before` hook.
#[derive(Debug)]
pub enum Decision {
    Proceed,
    Reject(Rejection),
}

/// A stage's reason for refusing a request.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub status: u16,
    pub reason: String,
}

impl Rejection {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

/// Final result of a request, as seen by `after` hooks and the HTTP layer.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: u16,
    pub success: bool,
    pub body: Value,
}

impl Outcome {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            success: true,
            body,
        }
    }

    pub fn rejected(rejection: Rejection) -> Self {
        Self {
            status: rejection.status,
            success: false,
            body: json!({ "error": { "status": rejection.status, "message": rejection.reason } }),
        }
    }

    /// Outcome seen by `after` hooks when the client went away before the
    /// request finished. 499 is the nginx convention for a closed request.
    pub fn cancelled() -> Self {
        Self {
            status: 499,
            success: false,
            body: json!({ "error": { "status": 499, "message": "client closed request" } }),
        }
    }

    /// Maps a gateway error to its HTTP status and error body.
    pub fn from_error(err: &PorticoError) -> Self {
        let status = match err {
            PorticoError::NoBackendsAvailable(_) | PorticoError::RegistryUnavailable(_) => 503,
            PorticoError::DuplicateRequest(_) => 409,
            PorticoError::DedupStoreUnavailable(_) => 500,
            PorticoError::InvalidRequest(_) => 400,
            PorticoError::MethodNotFound(_) => 404,
            PorticoError::Timeout(_) => 504,
            PorticoError::Backend { .. }
            | PorticoError::Transport(_)
            | PorticoError::Json(_) => 502,
            PorticoError::Io(_) => 500,
        };
        Self {
            status,
            success: false,
            body: json!({ "error": { "status": status, "message": err.to_string() } }),
        }
    }
}

/// One middleware stage.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Paths this stage does not apply to.
    fn excluded_paths(&self) -> &[String] {
        &[]
    }

    /// Runs before the terminal. Rejecting stops the request here.
    async fn before(&self, ctx: &mut RequestContext) -> Decision;

    /// Runs after the outcome is known, in reverse registration order.
    async fn after(&self, ctx: &RequestContext, outcome: &Outcome);
}

/// The innermost handler a pipeline wraps.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn handle(&self, ctx: &RequestContext) -> Outcome;
}

pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Appends a stage. Earlier stages are outermost.
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
        }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

/// Tracks a request in flight. If the run future is dropped before the
/// outcome is settled, the `after` hooks that have not run yet fire from a
/// detached task with a cancelled outcome; stages whose `after` already
/// completed are not run twice.
struct FlightGuard {
    ctx: RequestContext,
    entered: Vec<Arc<dyn Stage>>,
    finished: bool,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.finished || self.entered.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let ctx = std::mem::replace(&mut self.ctx, RequestContext::new("", ""));
        let entered = std::mem::take(&mut self.entered);
        let outcome = Outcome::cancelled();
        handle.spawn(async move {
            for stage in entered.iter().rev() {
                stage.after(&ctx, &outcome).await;
            }
        });
    }
}

impl Pipeline {
    /// Runs the request through every applicable stage and the terminal.
    ///
    /// Not detached from the caller: dropping the returned future aborts
    /// whatever is in flight (the backend call included) and hands
    /// finalization to the guard described above.
    pub async fn run(&self, ctx: RequestContext, terminal: &dyn Terminal) -> Outcome {
        let mut flight = FlightGuard {
            ctx,
            entered: Vec::with_capacity(self.stages.len()),
            finished: false,
        };
        let mut rejection: Option<Outcome> = None;

        for stage in &self.stages {
            if stage.excluded_paths().iter().any(|p| p == &flight.ctx.path) {
                continue;
            }
            flight.entered.push(Arc::clone(stage));
            match stage.before(&mut flight.ctx).await {
                Decision::Proceed => {}
                Decision::Reject(r) => {
                    rejection = Some(Outcome::rejected(r));
                    break;
                }
            }
        }

        let outcome = match rejection {
            Some(outcome) => outcome,
            None => terminal.handle(&flight.ctx).await,
        };

        while let Some(stage) = flight.entered.pop() {
            stage.after(&flight.ctx, &outcome).await;
        }
        flight.finished = true;

        outcome
    }
}
