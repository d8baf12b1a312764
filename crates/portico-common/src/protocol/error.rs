use thiserror::Error;

/// Workspace-wide error type.
///
/// The variants mirror the gateway's error categories: registry and backend
/// availability, idempotency conflicts, and the usual transport/serialization
/// plumbing. Pipeline-level errors (`DuplicateRequest`,
/// `DedupStoreUnavailable`) are resolved inside their pipeline stage and
/// never reach the router; router-level errors are mapped to HTTP status
/// codes by the gateway server.
#[derive(Error, Debug)]
pub enum PorticoError {
    /// Coordination store unreachable. Degrades the registry to STALE,
    /// never fatal.
    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// The endpoint set for a service was empty at acquire time.
    #[error("No backends available for service '{0}'")]
    NoBackendsAvailable(String),

    /// A request with the same idempotency key was already accepted.
    #[error("Duplicate request: {0}")]
    DuplicateRequest(String),

    /// The dedup store could not complete a check-and-insert. Fails closed.
    #[error("Dedup store unavailable: {0}")]
    DedupStoreUnavailable(String),

    /// Error propagated from a backend node, wrapped with method context.
    #[error("Backend error calling '{method}': {message}")]
    Backend { method: String, message: String },

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PorticoError {
    /// Wraps a backend-reported error with the method that was invoked.
    pub fn backend(method: impl Into<String>, message: impl Into<String>) -> Self {
        PorticoError::Backend {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Whether the failure happened on the wire rather than inside the
    /// backend. Transport failures count against an endpoint's health;
    /// application-level errors do not.
    pub fn is_transport(&self) -> bool {
        matches!(self, PorticoError::Transport(_) | PorticoError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, PorticoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_carries_method_context() {
        let err = PorticoError::backend("learn", "model not loaded");
        assert_eq!(
            err.to_string(),
            "Backend error calling 'learn': model not loaded"
        );
    }

    #[test]
    fn test_transport_classification() {
        assert!(PorticoError::Transport("refused".into()).is_transport());
        assert!(PorticoError::Timeout(30000).is_transport());
        assert!(!PorticoError::backend("m", "boom").is_transport());
        assert!(!PorticoError::NoBackendsAvailable("svc".into()).is_transport());
    }

    #[test]
    fn test_from_serde_json() {
        let err: PorticoError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, PorticoError::Json(_)));
    }
}
