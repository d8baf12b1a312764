pub mod error;
pub mod jsonrpc;

pub use error::{PorticoError, Result};
pub use jsonrpc::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR, SERVER_ERROR,
};
