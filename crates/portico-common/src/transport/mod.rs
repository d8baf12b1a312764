pub mod http;

pub use http::{build_client, call_backend, HttpClient};
