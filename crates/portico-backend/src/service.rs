//! RPC method implementations.

use async_trait::async_trait;
use serde_json::Value;

use portico_common::protocol::{PorticoError, Result};

/// The application side of a backend node: one trait method dispatching all
/// RPC methods the node serves. Unknown methods must return
/// [`PorticoError::MethodNotFound`] so the server can answer with the
/// proper JSON-RPC error code.
#[async_trait]
pub trait BackendService: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value>;
}

/// Trivial service used by the demo binary and the integration tests:
/// `echo` returns its params, `fail` always errors.
#[derive(Debug, Default)]
pub struct EchoService;

#[async_trait]
impl BackendService for EchoService {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "echo" => Ok(params),
            "fail" => Err(PorticoError::backend("fail", "requested failure")),
            _ => Err(PorticoError::MethodNotFound(method.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_returns_params() {
        let service = EchoService;
        let result = service.call("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let service = EchoService;
        let err = service.call("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, PorticoError::MethodNotFound(_)));
    }
}
