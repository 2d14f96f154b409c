//! JSON-RPC 2.0 framing for sandpit-host.
//!
//! One JSON object per line on stdin (requests) and stdout (responses and
//! notifications).

use sandpit_core::ModuleHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only protocol version the host speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes carried in [`RpcError::code`].
///
/// The negative range below -32000 is reserved by JSON-RPC; sandpit adds one
/// code of its own for operations the session refused.
pub mod error_codes {
    /// The line was not a JSON request object.
    pub const PARSE_ERROR: i32 = -32700;
    /// The request named a protocol version other than 2.0.
    pub const INVALID_REQUEST: i32 = -32600;
    /// No such session method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// `params` did not fit the method.
    pub const INVALID_PARAMS: i32 = -32602;
    /// A result could not be encoded.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The session rejected the operation (wrong state, no module, stale module).
    pub const SESSION_ERROR: i32 = -32000;
}

/// One line read from stdin.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    /// Echoed back on the response so the client can pair them up;
    /// responses may arrive out of order.
    pub id: u64,
    pub method: String,
    /// Null when the client sent none.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn has_supported_version(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION
    }
}

/// Reply to exactly one [`Request`]; carries either `result` or `error`.
#[derive(Debug, Serialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self::reply(id, Some(result), None)
    }

    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        let error = RpcError {
            code,
            message: message.into(),
        };
        Self::reply(id, None, Some(error))
    }

    fn reply(id: u64, result: Option<Value>, error: Option<RpcError>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
            error,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// Session or debugger event pushed to the client unprompted.
#[derive(Debug, Serialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

// Parameter types for the session methods

/// Parameters for the `build` method.
#[derive(Debug, Deserialize)]
pub struct BuildParams {
    /// Program source text.
    pub source: String,
    /// File name; the configured default when absent.
    #[serde(default)]
    pub file: Option<String>,
}

/// Parameters for the `execute` method.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteParams {
    /// Overrides the configured execution budget.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Run only if this is still the active module.
    #[serde(default)]
    pub module_handle: Option<ModuleHandle>,
}

/// Parameters for the `request` method.
#[derive(Debug, Deserialize)]
pub struct RouteParams {
    /// HTTP-like verb, case-insensitive.
    pub verb: String,
    pub path: String,
    #[serde(default)]
    pub body: Option<String>,
}

/// Parameters for `set_breakpoint` and `remove_breakpoint`.
#[derive(Debug, Deserialize)]
pub struct BreakpointParams {
    #[serde(default)]
    pub file: Option<String>,
    pub line: u32,
}
