//! Request handler for sandpit-host.
//!
//! Routes JSON-RPC requests to the session.

use crate::protocol::{
    error_codes, BreakpointParams, BuildParams, ExecuteParams, Request, Response, RouteParams,
};
use sandpit_core::{CoreError, ExecuteRequest, SessionManager, Verb};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Handle a JSON-RPC request and return a response.
///
/// Supported methods:
/// - `ping` - Health check, returns `{pong: true}`.
/// - `build` - Compile a program; returns the build result.
/// - `execute` - Run the active module (only if it matches `moduleHandle`, when given); returns the execution result.
/// - `request` - Send a synthetic request to the running program.
/// - `set_breakpoint` / `remove_breakpoint` - Edit breakpoints.
/// - `continue` / `pause` - Resume or break the program.
/// - `stop` - Cancel everything and recreate the sandbox.
/// - `state` - Session and debugger state.
/// - `routes` - Routes published by the current program.
///
/// Each request runs on its own task, so `continue` and `request` can be
/// answered while an `execute` is still in flight.
pub async fn handle_request(session: &SessionManager, req: Request) -> Response {
    debug!(method = %req.method, id = req.id, "handling request");
    trace!(params = ?req.params, "request params");

    let id = req.id;
    if !req.has_supported_version() {
        warn!(id, version = %req.jsonrpc, "unsupported protocol version");
        return Response::error(
            id,
            error_codes::INVALID_REQUEST,
            format!("unsupported jsonrpc version: {}", req.jsonrpc),
        );
    }
    let response = match req.method.as_str() {
        "ping" => Response::success(id, json!({"pong": true, "sessionId": session.id()})),

        "build" => match parse_params::<BuildParams>(id, &req.method, req.params) {
            Ok(p) => handle_build(session, id, p).await,
            Err(resp) => resp,
        },

        "execute" => match parse_params::<ExecuteParams>(id, &req.method, req.params) {
            Ok(p) => handle_execute(session, id, p).await,
            Err(resp) => resp,
        },

        "request" => match parse_params::<RouteParams>(id, &req.method, req.params) {
            Ok(p) => handle_route(session, id, p).await,
            Err(resp) => resp,
        },

        "set_breakpoint" => match parse_params::<BreakpointParams>(id, &req.method, req.params) {
            Ok(p) => {
                let file = breakpoint_file(session, p.file);
                match session.set_breakpoint(&file, p.line) {
                    Ok(added) => Response::success(id, json!({"added": added})),
                    Err(e) => session_error(id, e),
                }
            }
            Err(resp) => resp,
        },

        "remove_breakpoint" => match parse_params::<BreakpointParams>(id, &req.method, req.params) {
            Ok(p) => {
                let file = breakpoint_file(session, p.file);
                let removed = session.remove_breakpoint(&file, p.line);
                Response::success(id, json!({"removed": removed}))
            }
            Err(resp) => resp,
        },

        "continue" => {
            let resumed = session.continue_execution();
            if !resumed {
                debug!(id, "continue while not paused");
            }
            Response::success(id, json!({"resumed": resumed}))
        }

        "pause" => Response::success(id, json!({"paused": session.pause()})),

        "stop" => match session.stop().await {
            Ok(()) => Response::success(id, json!({"stopped": true})),
            Err(e) => session_error(id, e),
        },

        "state" => handle_state(session, id).await,

        "routes" => Response::success(id, json!({"routes": session.routes().await})),

        _ => {
            warn!(method = %req.method, "unknown method");
            Response::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {}", req.method),
            )
        }
    };

    if response.error.is_some() {
        debug!(id, error = ?response.error, "request failed");
    } else {
        debug!(id, "request succeeded");
        trace!(result = ?response.result, "response result");
    }

    response
}

/// Handle the `build` method.
async fn handle_build(session: &SessionManager, id: u64, p: BuildParams) -> Response {
    let file = p
        .file
        .unwrap_or_else(|| session.config().file_name.clone());
    debug!(id, file = %file, source_len = p.source.len(), "handling build");
    match session.build_file(&file, &p.source).await {
        Ok(result) => to_response(id, &result),
        Err(e) => session_error(id, e),
    }
}

/// Handle the `execute` method.
async fn handle_execute(session: &SessionManager, id: u64, p: ExecuteParams) -> Response {
    if p.timeout_ms == Some(0) {
        return Response::error(
            id,
            error_codes::INVALID_PARAMS,
            "invalid params: timeoutMs must be greater than zero",
        );
    }
    let result = match (p.module_handle, p.timeout_ms) {
        (Some(module_handle), timeout_ms) => {
            debug!(id, %module_handle, ?timeout_ms, "handling execute");
            let budget = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(session.config().execution_timeout);
            session
                .execute_request(&ExecuteRequest { module_handle }, budget)
                .await
        }
        (None, Some(ms)) => {
            debug!(id, timeout_ms = ms, "handling execute");
            session
                .execute_with_timeout(Duration::from_millis(ms))
                .await
        }
        (None, None) => {
            debug!(id, "handling execute");
            session.execute().await
        }
    };
    match result {
        Ok(result) => to_response(id, &result),
        Err(e) => session_error(id, e),
    }
}

/// Handle the `request` method.
async fn handle_route(session: &SessionManager, id: u64, p: RouteParams) -> Response {
    let verb = match Verb::parse(&p.verb) {
        Ok(verb) => verb,
        Err(e) => {
            warn!(id, verb = %p.verb, "invalid verb");
            return Response::error(id, error_codes::INVALID_PARAMS, format!("invalid params: {}", e));
        }
    };
    debug!(id, verb = %verb, path = %p.path, "handling request");
    match session.request(verb, &p.path, p.body).await {
        Ok(response) => to_response(id, &response),
        Err(e) => session_error(id, e),
    }
}

/// Handle the `state` method.
async fn handle_state(session: &SessionManager, id: u64) -> Response {
    let breakpoints: Vec<_> = session.breakpoints().iter().cloned().collect();
    let module = session
        .active_module()
        .await
        .map(|m| m.handle().to_string());
    let sandbox = session.sandbox_id().await.map(|s| s.to_string());
    Response::success(
        id,
        json!({
            "state": session.state().await,
            "debugState": session.debug_state(),
            "breakpoints": breakpoints,
            "moduleHandle": module,
            "sandboxId": sandbox,
        }),
    )
}

fn breakpoint_file(session: &SessionManager, file: Option<String>) -> String {
    file.unwrap_or_else(|| session.config().file_name.clone())
}

/// Deserialize params, treating a missing params member as `{}`.
fn parse_params<T: DeserializeOwned>(id: u64, method: &str, params: Value) -> Result<T, Response> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| {
        warn!(id, method, error = %e, "invalid params");
        Response::error(
            id,
            error_codes::INVALID_PARAMS,
            format!("invalid params: {}", e),
        )
    })
}

fn to_response<T: Serialize>(id: u64, value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(v) => Response::success(id, v),
        Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
    }
}

fn session_error(id: u64, error: CoreError) -> Response {
    let code = match error {
        CoreError::InvalidBreakpoint(_) => error_codes::INVALID_PARAMS,
        _ => error_codes::SESSION_ERROR,
    };
    Response::error(id, code, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandpit_core::{ScriptToolchain, SessionConfig};
    use std::sync::Arc;

    fn make_request(method: &str, params: Value) -> Request {
        Request {
            jsonrpc: "2.0".to_string(),
            id: 1,
            method: method.to_string(),
            params,
        }
    }

    fn session() -> SessionManager {
        let config = SessionConfig::builder()
            .poll_interval(Duration::from_millis(5))
            .build()
            .unwrap();
        SessionManager::new(config, Arc::new(ScriptToolchain::new()))
    }

    #[tokio::test]
    async fn test_ping() {
        let session = session();
        let resp = handle_request(&session, make_request("ping", Value::Null)).await;
        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap()["pong"], true);
    }

    #[tokio::test]
    async fn test_build_execute_request() {
        let session = session();
        let resp = handle_request(
            &session,
            make_request("build", json!({"source": "route GET /hi/{name} => \"hi {name}\""})),
        )
        .await;
        let result = resp.result.unwrap();
        assert_eq!(result["success"], true);
        assert!(result["moduleHandle"].is_string());

        let resp = handle_request(&session, make_request("execute", Value::Null)).await;
        assert_eq!(resp.result.unwrap()["success"], true);

        let resp = handle_request(
            &session,
            make_request("request", json!({"verb": "get", "path": "/hi/ana"})),
        )
        .await;
        let result = resp.result.unwrap();
        assert_eq!(result["status"], 200);
        assert_eq!(result["body"], "hi ana");

        let resp = handle_request(&session, make_request("routes", Value::Null)).await;
        let routes = resp.result.unwrap()["routes"].clone();
        assert_eq!(routes[0]["pattern"], "/hi/{name}");
        assert_eq!(routes[0]["verb"], "GET");
    }

    #[tokio::test]
    async fn test_build_failure_is_a_result() {
        let session = session();
        let resp = handle_request(&session, make_request("build", json!({"source": "bogus"}))).await;
        let result = resp.result.unwrap();
        assert_eq!(result["success"], false);
        assert!(result["diagnostics"][0]
            .as_str()
            .unwrap()
            .contains("unknown statement 'bogus'"));
    }

    #[tokio::test]
    async fn test_execute_without_module() {
        let session = session();
        let resp = handle_request(&session, make_request("execute", json!({}))).await;
        assert_eq!(resp.error.unwrap().code, error_codes::SESSION_ERROR);
    }

    #[tokio::test]
    async fn test_execute_timeout_override() {
        let session = session();
        handle_request(&session, make_request("build", json!({"source": "loop {\n sleep 5\n}"}))).await;
        let resp = handle_request(&session, make_request("execute", json!({"timeoutMs": 100}))).await;
        let result = resp.result.unwrap();
        assert_eq!(result["success"], false);
        assert_eq!(result["errorKind"], "timeout_exceeded");

        let resp = handle_request(&session, make_request("execute", json!({"timeoutMs": 0}))).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_execute_named_module() {
        let session = session();
        let resp = handle_request(&session, make_request("build", json!({"source": "print \"one\""}))).await;
        let first = resp.result.unwrap()["moduleHandle"].clone();

        let resp = handle_request(&session, make_request("execute", json!({"moduleHandle": first}))).await;
        assert_eq!(resp.result.unwrap()["success"], true);

        handle_request(&session, make_request("build", json!({"source": "print \"two\""}))).await;
        let resp = handle_request(
            &session,
            make_request("execute", json!({"moduleHandle": first, "timeoutMs": 500})),
        )
        .await;
        let error = resp.error.unwrap();
        assert_eq!(error.code, error_codes::SESSION_ERROR);
        assert!(error.message.contains("not the active module"));
    }

    #[tokio::test]
    async fn test_breakpoints_and_state() {
        let session = session();
        let resp = handle_request(&session, make_request("set_breakpoint", json!({"line": 3}))).await;
        assert_eq!(resp.result.unwrap()["added"], true);

        let resp = handle_request(&session, make_request("set_breakpoint", json!({"line": 0}))).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);

        let resp = handle_request(&session, make_request("state", Value::Null)).await;
        let state = resp.result.unwrap();
        assert_eq!(state["state"], "Uninitialized");
        assert_eq!(state["breakpoints"][0]["file"], "Program.sp");
        assert_eq!(state["breakpoints"][0]["line"], 3);
        assert!(state["sandboxId"].is_null());

        let resp = handle_request(
            &session,
            make_request("remove_breakpoint", json!({"file": "Program.sp", "line": 3})),
        )
        .await;
        assert_eq!(resp.result.unwrap()["removed"], true);
    }

    #[tokio::test]
    async fn test_continue_when_not_paused() {
        let session = session();
        let resp = handle_request(&session, make_request("continue", Value::Null)).await;
        assert_eq!(resp.result.unwrap()["resumed"], false);
    }

    #[tokio::test]
    async fn test_request_before_execute() {
        let session = session();
        let resp = handle_request(
            &session,
            make_request("request", json!({"verb": "GET", "path": "/"})),
        )
        .await;
        assert_eq!(resp.result.unwrap()["status"], 503);
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let session = session();
        let mut req = make_request("ping", Value::Null);
        req.jsonrpc = "1.0".to_string();
        let resp = handle_request(&session, req).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let session = session();
        let resp = handle_request(&session, make_request("unknown_method", json!({}))).await;
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let session = session();
        let resp = handle_request(&session, make_request("build", json!({"wrong_param": 1}))).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);

        let resp = handle_request(
            &session,
            make_request("request", json!({"verb": "BREW", "path": "/"})),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);
    }
}
