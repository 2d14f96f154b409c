//! End-to-end tests driving a `SessionManager` through the script toolchain
//! and hand-written entry points.

use sandpit_core::{
    status, CompileOutput, CompiledModule, CoreError, DebugEvent, DebugState, Diagnostic,
    ErrorKind, Handler, PauseReason, ScriptToolchain, SessionConfig, SessionEvent,
    SessionManager, SessionState, SyntaxTree, Toolchain, Verb,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn config() -> SessionConfig {
    SessionConfig::builder()
        .execution_timeout(Duration::from_secs(5))
        .poll_interval(Duration::from_millis(5))
        .teardown_grace(Duration::from_millis(500))
        .build()
        .expect("valid config")
}

fn session() -> SessionManager {
    SessionManager::new(config(), Arc::new(ScriptToolchain::new()))
}

async fn next_debug_event(events: &mut broadcast::Receiver<DebugEvent>) -> DebugEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("debug event should arrive")
        .expect("channel open")
}

async fn wait_for_pause(events: &mut broadcast::Receiver<DebugEvent>) -> (String, u32, PauseReason) {
    loop {
        if let DebugEvent::Paused { file, line, reason } = next_debug_event(events).await {
            return (file, line, reason);
        }
    }
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

#[tokio::test]
async fn test_hello_world_service() {
    let session = session();
    let build = session
        .build(r#"route GET / => "Hello World!""#)
        .await
        .unwrap();
    assert!(build.success, "diagnostics: {:?}", build.diagnostics);
    assert!(build.module_handle.is_some());

    let result = session.execute().await.unwrap();
    assert!(result.success);
    assert_eq!(session.state().await, SessionState::Idle);

    let routes = session.routes().await;
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].pattern, "/");
    assert_eq!(routes[0].verb, Verb::Get);
    assert_eq!(routes[0].response_type, "text/plain");

    let resp = session.request(Verb::Get, "/", None).await.unwrap();
    assert_eq!(resp.status, status::OK);
    assert_eq!(resp.body, "Hello World!");

    // Unmatched verb is a 404, not a fault
    let resp = session.request(Verb::Delete, "/", None).await.unwrap();
    assert_eq!(resp.status, status::NOT_FOUND);
}

#[tokio::test]
async fn test_path_parameters_and_body() {
    let session = session();
    let source = r#"
route GET /users/{id} => json {"id": "{id}"}
route POST /echo => "echo: {body}"
route GET /last => "{body}"
route GET /boom => fail "handler exploded"
"#;
    assert!(session.build(source).await.unwrap().success);
    assert!(session.execute().await.unwrap().success);

    let resp = session.request(Verb::Get, "/users/42", None).await.unwrap();
    assert_eq!(resp.status, status::OK);
    assert_eq!(resp.body, r#"{"id": "42"}"#);
    assert_eq!(resp.content_type.as_deref(), Some("application/json"));

    assert_eq!(
        session.request(Verb::Post, "/users/42", None).await.unwrap().status,
        status::NOT_FOUND
    );
    assert_eq!(
        session.request(Verb::Get, "/users/42/extra", None).await.unwrap().status,
        status::NOT_FOUND
    );

    let resp = session
        .request(Verb::Post, "/echo", Some("ping".into()))
        .await
        .unwrap();
    assert_eq!(resp.body, "echo: ping");

    // A GET handler that wants a body sees the latest POST body
    let resp = session.request(Verb::Get, "/last", None).await.unwrap();
    assert_eq!(resp.body, "ping");

    // Handler faults are contained
    let resp = session.request(Verb::Get, "/boom", None).await.unwrap();
    assert_eq!(resp.status, status::INTERNAL_ERROR);
    assert_eq!(resp.body, "handler exploded");
    let resp = session.request(Verb::Get, "/users/7", None).await.unwrap();
    assert_eq!(resp.status, status::OK);
}

#[tokio::test]
async fn test_failed_rebuild_keeps_module() {
    let session = session();
    assert!(session.build("print \"v1\"").await.unwrap().success);
    let first = session.active_module().await.unwrap().handle();

    let failed = session.build("repeat {\nprint \"x\"").await.unwrap();
    assert!(!failed.success);
    assert!(failed.module_handle.is_none());
    assert!(failed.diagnostics[0].starts_with("Program.sp(1): error:"));
    assert_eq!(session.active_module().await.unwrap().handle(), first);

    assert!(session.build("print \"v2\"").await.unwrap().success);
    assert_ne!(session.active_module().await.unwrap().handle(), first);
}

/// Parses instantly, compiles slowly.
struct SlowToolchain;

impl Toolchain for SlowToolchain {
    fn parse(&self, file: &str, source: &str) -> Result<SyntaxTree, Vec<Diagnostic>> {
        ScriptToolchain::new().parse(file, source)
    }

    fn compile(&self, tree: &SyntaxTree, references: &[String]) -> CompileOutput {
        std::thread::sleep(Duration::from_millis(300));
        ScriptToolchain::new().compile(tree, references)
    }
}

#[tokio::test]
async fn test_reentrant_build_rejected() {
    let session = SessionManager::new(config(), Arc::new(SlowToolchain));

    let background = session.clone();
    let first = tokio::spawn(async move { background.build("print \"a\"").await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while session.state().await != SessionState::Building {
        assert!(tokio::time::Instant::now() < deadline, "build never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = session.build("print \"b\"").await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
    let err = session.execute().await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));

    assert!(first.await.unwrap().unwrap().success);
    assert_eq!(session.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_timeout_reported_once() {
    let session = session();
    let mut events = session.subscribe();

    // Ignores cancellation entirely
    let module = CompiledModule::from_fn(|_| {
        std::thread::sleep(Duration::from_millis(600));
        Ok(())
    });
    let result = session
        .execute_module(module, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::TimeoutExceeded));
    assert_eq!(session.state().await, SessionState::Idle);

    // Let the abandoned thread finish and report late
    tokio::time::sleep(Duration::from_millis(800)).await;

    let finished: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::ExecutionFinished { .. }))
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(session.state().await, SessionState::Idle);

    // The recreated sandbox is usable
    assert!(session.build("print \"after\"").await.unwrap().success);
    assert!(session.execute().await.unwrap().success);
}

#[tokio::test]
async fn test_cooperative_program_times_out() {
    let session = session();
    assert!(session.build("loop {\n  sleep 10\n}").await.unwrap().success);
    let result = session
        .execute_with_timeout(Duration::from_millis(150))
        .await
        .unwrap();
    assert!(result.is_timeout());
    assert!(result.elapsed_ms >= 150);
}

#[tokio::test]
async fn test_breakpoint_pause_and_continue() {
    let session = session();
    let mut debug = session.debug_events();
    let mut events = session.subscribe();

    session.set_breakpoint("Program.sp", 2).unwrap();
    let build = session
        .build("print \"before\"\nprint \"at breakpoint\"\nprint \"after\"")
        .await
        .unwrap();
    assert_eq!(build.checkpoints, 1);

    let background = session.clone();
    let run = tokio::spawn(async move { background.execute().await });

    let (file, line, reason) = wait_for_pause(&mut debug).await;
    assert_eq!(file, "Program.sp");
    assert_eq!(line, 2);
    assert_eq!(reason, PauseReason::Breakpoint);
    assert_eq!(session.debug_state(), DebugState::Paused);
    assert_eq!(session.state().await, SessionState::Executing);

    // Still paused after several poll intervals
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!run.is_finished());

    assert!(session.continue_execution());
    let result = run.await.unwrap().unwrap();
    assert!(result.success);

    // Continue while running is a no-op
    assert!(!session.continue_execution());

    let lines: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Log { line } => Some(line),
            _ => None,
        })
        .collect();
    assert_eq!(lines, vec!["before", "at breakpoint", "after"]);
}

#[tokio::test]
async fn test_breakpoints_survive_rebuild() {
    let session = session();
    session.set_breakpoint("Program.sp", 1).unwrap();
    assert_eq!(session.build("print \"a\"").await.unwrap().checkpoints, 1);
    assert_eq!(session.build("print \"b\"").await.unwrap().checkpoints, 1);
    session.remove_breakpoint("Program.sp", 1);
    assert_eq!(session.build("print \"c\"").await.unwrap().checkpoints, 0);
}

#[tokio::test]
async fn test_stop_releases_paused_program() {
    let session = session();
    let mut debug = session.debug_events();

    session.set_breakpoint("Program.sp", 2).unwrap();
    assert!(session
        .build("route GET / => \"up\"\npublish\nloop {\n  sleep 10\n}")
        .await
        .unwrap()
        .success);

    let background = session.clone();
    let run = tokio::spawn(async move { background.execute().await });
    wait_for_pause(&mut debug).await;

    session.stop().await.unwrap();
    let result = run.await.unwrap().unwrap();
    assert_eq!(result.error_kind, Some(ErrorKind::Stopped));

    assert_eq!(session.state().await, SessionState::Idle);
    assert_eq!(session.debug_state(), DebugState::Running);
    assert!(session.breakpoints().is_empty());

    // The old program's routes went with its sandbox
    let resp = session.request(Verb::Get, "/", None).await.unwrap();
    assert_eq!(resp.status, status::SERVICE_UNAVAILABLE);

    // The module is still there and runs without pausing now
    assert!(session.active_module().await.is_some());
}

#[tokio::test]
async fn test_long_running_service_answers_while_executing() {
    let session = session();
    assert!(session
        .build("route GET /health => \"ok\"\npublish\nloop {\n  sleep 10\n}")
        .await
        .unwrap()
        .success);

    let background = session.clone();
    let run = tokio::spawn(async move { background.execute().await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while session.routes().await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "routes never published");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let resp = session.request(Verb::Get, "/health", None).await.unwrap();
    assert_eq!(resp.status, status::OK);
    assert_eq!(resp.body, "ok");

    session.stop().await.unwrap();
    assert_eq!(
        run.await.unwrap().unwrap().error_kind,
        Some(ErrorKind::Stopped)
    );
}

#[tokio::test]
async fn test_entry_fault_clears_routes() {
    let session = session();
    assert!(session
        .build("route GET / => \"hi\"\nfail \"startup failed\"")
        .await
        .unwrap()
        .success);

    let result = session.execute().await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::RuntimeFault));
    assert_eq!(result.error_message.as_deref(), Some("startup failed"));
    assert_eq!(session.state().await, SessionState::Idle);

    let resp = session.request(Verb::Get, "/", None).await.unwrap();
    assert_eq!(resp.status, status::SERVICE_UNAVAILABLE);

    // A fault after publishing also withdraws the published table
    assert!(session
        .build("route GET / => \"hi\"\npublish\nsleep 50\nfail \"boom\"")
        .await
        .unwrap()
        .success);
    let result = session.execute().await.unwrap();
    assert_eq!(result.error_kind, Some(ErrorKind::RuntimeFault));
    assert!(session.routes().await.is_empty());
    let resp = session.request(Verb::Get, "/", None).await.unwrap();
    assert_eq!(resp.status, status::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_timeout_while_paused_releases_debugger() {
    let session = session();
    let mut debug = session.debug_events();

    session.set_breakpoint("Program.sp", 2).unwrap();
    assert!(session
        .build("print \"a\"\nprint \"b\"\nprint \"c\"")
        .await
        .unwrap()
        .success);

    let background = session.clone();
    let run = tokio::spawn(async move {
        background
            .execute_with_timeout(Duration::from_millis(200))
            .await
    });
    let (_, line, _) = wait_for_pause(&mut debug).await;
    assert_eq!(line, 2);

    let result = run.await.unwrap().unwrap();
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::TimeoutExceeded));
    assert_eq!(session.debug_state(), DebugState::Running);
    assert_eq!(session.debugger().waiting(), 0);
    assert_eq!(session.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_handwritten_entry_point() {
    let session = session();
    let module = CompiledModule::from_fn(|host| {
        host.map(
            Verb::Get,
            "/sum/{a}/{b}",
            Handler::with_params(|params| {
                let a: i64 = params.get("a").unwrap_or("0").parse().unwrap_or(0);
                let b: i64 = params.get("b").unwrap_or("0").parse().unwrap_or(0);
                Ok((a + b).to_string())
            }),
        )?;
        host.log("mapped");
        Ok(())
    });
    let result = session
        .execute_module(module, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(result.success);

    let resp = session.request(Verb::Get, "/sum/2/40", None).await.unwrap();
    assert_eq!(resp.body, "42");
}

#[tokio::test]
async fn test_lifecycle_events() {
    let session = session();
    let mut events = session.subscribe();

    session.build("route GET / => \"x\"").await.unwrap();
    session.execute().await.unwrap();

    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::BuildFinished { result } if result.success)));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::RoutesDiscovered { routes } if routes.len() == 1)));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::StateChanged {
            from: SessionState::Executing,
            to: SessionState::Idle
        }
    )));
}
