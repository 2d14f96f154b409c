//! Messages exchanged across the sandbox boundary.
//!
//! Public types are the serialisable request/response pairs. The
//! `Worker*` envelopes are what actually travels on the control-plane ↔
//! worker channels; each carries the correlation id the session uses to
//! match a completion to the operation that caused it.

use crate::debugger::Breakpoint;
use crate::routes::{RouteInfo, Verb};
use crate::toolchain::{CompiledModule, ModuleHandle};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP-like status codes used by synthetic responses.
pub mod status {
    pub const OK: u16 = 200;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// Compile request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub file: String,
    pub source: String,
    #[serde(default)]
    pub references: Vec<String>,
    /// Breakpoint snapshot to instrument against.
    #[serde(default)]
    pub breakpoints: Vec<Breakpoint>,
}

/// Compile outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_handle: Option<ModuleHandle>,
    /// Rendered diagnostics, in compiler order.
    pub diagnostics: Vec<String>,
    /// Checkpoints instrumented into the module.
    #[serde(default)]
    pub checkpoints: usize,
}

impl BuildResult {
    pub fn failed(diagnostics: Vec<String>) -> Self {
        Self {
            success: false,
            module_handle: None,
            diagnostics,
            checkpoints: 0,
        }
    }
}

/// Execute request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub module_handle: ModuleHandle,
}

/// Why an execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The entry point raised or panicked.
    RuntimeFault,
    /// The watchdog fired.
    TimeoutExceeded,
    /// Stop was requested.
    Stopped,
    /// The worker went away before reporting.
    SandboxLost,
}

/// Execute outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub elapsed_ms: u64,
}

impl ExecuteResult {
    pub fn succeeded(elapsed: Duration) -> Self {
        Self {
            success: true,
            error_message: None,
            error_kind: None,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            error_kind: Some(kind),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error_kind == Some(ErrorKind::TimeoutExceeded)
    }
}

/// A synthetic request routed to the running program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub request_id: u64,
    pub verb: Verb,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Response to a [`RouteRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    pub request_id: u64,
    pub status: u16,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl RouteResponse {
    pub fn ok(request_id: u64, body: String, content_type: &str) -> Self {
        Self {
            request_id,
            status: status::OK,
            body,
            content_type: Some(content_type.to_string()),
        }
    }

    pub fn not_found(request_id: u64, verb: Verb, path: &str) -> Self {
        Self {
            request_id,
            status: status::NOT_FOUND,
            body: format!("no route for {} {}", verb, path),
            content_type: None,
        }
    }

    pub fn internal_error(request_id: u64, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: status::INTERNAL_ERROR,
            body: message.into(),
            content_type: None,
        }
    }

    pub fn unavailable(request_id: u64, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: status::SERVICE_UNAVAILABLE,
            body: message.into(),
            content_type: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == status::OK
    }
}

/// Routes published by a running program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutesDiscovered {
    pub routes: Vec<RouteInfo>,
}

/// Control plane → worker.
#[derive(Debug)]
pub(crate) enum WorkerRequest {
    Build {
        request_id: u64,
        request: BuildRequest,
    },
    Execute {
        execution_id: u64,
        module: CompiledModule,
    },
    Route(RouteRequest),
    Shutdown,
}

/// What a build produced on the worker side.
#[derive(Debug)]
pub(crate) struct BuildOutcome {
    pub result: BuildResult,
    pub module: Option<CompiledModule>,
}

/// Worker → control plane.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    BuildCompleted {
        request_id: u64,
        outcome: BuildOutcome,
    },
    ExecutionCompleted {
        execution_id: u64,
        result: ExecuteResult,
    },
    RoutesDiscovered {
        execution_id: u64,
        discovered: RoutesDiscovered,
    },
    RouteResponse(RouteResponse),
    Log {
        execution_id: u64,
        line: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_result_wire_names() {
        let result = ExecuteResult::failed(
            ErrorKind::TimeoutExceeded,
            "timed out",
            Duration::from_millis(1500),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["errorMessage"], "timed out");
        assert_eq!(json["errorKind"], "timeout_exceeded");
        assert_eq!(json["elapsedMs"], 1500);
        assert!(result.is_timeout());

        let ok = serde_json::to_value(ExecuteResult::succeeded(Duration::from_millis(3))).unwrap();
        assert!(ok.get("errorMessage").is_none());
    }

    #[test]
    fn test_route_request_parse() {
        let req: RouteRequest =
            serde_json::from_str(r#"{"requestId":7,"verb":"POST","path":"/echo","body":"hi"}"#)
                .unwrap();
        assert_eq!(req.request_id, 7);
        assert_eq!(req.verb, Verb::Post);
        assert_eq!(req.body.as_deref(), Some("hi"));
    }

    #[test]
    fn test_route_response_constructors() {
        let resp = RouteResponse::not_found(3, Verb::Delete, "/");
        assert_eq!(resp.status, status::NOT_FOUND);
        assert_eq!(resp.body, "no route for DELETE /");
        assert!(!resp.is_success());
        assert!(RouteResponse::ok(3, "x".into(), "text/plain").is_success());
    }
}
