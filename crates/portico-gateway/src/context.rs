use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

/// Per-request state threaded through the middleware pipeline.
///
/// Built once by the HTTP layer before the pipeline runs. Stages may attach
/// string annotations to communicate between their `before` and `after`
/// hooks; annotations are namespaced by convention (`stage.key`).
#[derive(Debug)]
pub struct RequestContext {
    /// RPC method the request maps to.
    pub method: String,
    /// Inbound HTTP path.
    pub path: String,
    /// Client address, with the real-IP override header already applied.
    pub remote: String,
    /// Client-supplied request ID, if the header was present.
    pub request_id: Option<String>,
    /// Parsed request body, passed through to the backend as RPC params.
    pub params: Value,
    /// When the gateway started handling this request.
    pub started: Instant,
    annotations: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            remote: String::new(),
            request_id: None,
            params: Value::Null,
            started: Instant::now(),
            annotations: HashMap::new(),
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}
