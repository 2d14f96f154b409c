//! # sandpit-core
//!
//! Execution sandbox control plane.
//!
//! This crate takes a compiled user program, runs it inside an isolated
//! worker, enforces a wall-clock budget with forced termination, optionally
//! instruments it for cooperative breakpoint debugging, and dispatches
//! synthetic HTTP-like requests to route handlers the program registered.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  sandpit-core (control plane)            │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ SessionManager  │────▶│  DebugController         │   │
//! │  │  - build()      │     │  (breakpoints, pause)    │   │
//! │  │  - execute()    │     └──────────────────────────┘   │
//! │  │  - request()    │                 ▲                  │
//! │  │  - stop()       │                 │ checkpoint_hit   │
//! │  └─────────────────┘                 │                  │
//! │     │ WorkerRequest   ▲ WorkerEvent  │                  │
//! │     ▼                 │              │                  │
//! │  ┌─────────────────┐  │  ┌──────────────────────────┐   │
//! │  │ SandboxRunner   │──┘  │  execution thread        │   │
//! │  │  (worker task)  │────▶│  EntryPoint + ProgramHost│   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │     │ parse / instrument / compile   │ map routes       │
//! │     ▼                                ▼                  │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │   Toolchain     │     │  RouteTable              │   │
//! │  │ (ScriptToolchain│     │  (pattern → handler)     │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use sandpit_core::{ScriptToolchain, SessionConfig, SessionManager, Verb};
//! use std::sync::Arc;
//!
//! # async fn example() -> sandpit_core::Result<()> {
//! let session = SessionManager::new(SessionConfig::default(), Arc::new(ScriptToolchain::new()));
//!
//! let build = session.build(r#"route GET / => "Hello World!""#).await?;
//! assert!(build.success);
//!
//! let result = session.execute().await?;
//! assert!(result.success);
//!
//! let response = session.request(Verb::Get, "/", None).await?;
//! assert_eq!(response.status, 200);
//! assert_eq!(response.body, "Hello World!");
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Lazy sandbox**: created on first build or execute, recreated on stop
//!   or timeout
//! - **Watchdog**: executions exceeding their budget are torn down and
//!   reported as `TimeoutExceeded`, exactly once
//! - **Cooperative debugger**: checkpoints inserted at breakpoint lines block
//!   the execution thread until continue or stop
//! - **Route dispatch**: path templates with `{name}` placeholders, verb
//!   matching, handler faults contained as 500 responses

mod config;
mod debugger;
mod error;
mod instrument;
mod program;
mod protocol;
mod routes;
mod sandbox;
pub mod script;
mod session;
mod syntax;
mod toolchain;

pub use config::{SessionConfig, SessionConfigBuilder, DEFAULT_FILE_NAME};
pub use debugger::{
    files_match, Breakpoint, BreakpointSet, CheckpointOutcome, DebugController, DebugEvent,
    DebugState, PauseReason,
};
pub use error::{CoreError, Fault, Result, RouteError};
pub use instrument::{instrument, Instrumenter};
pub use program::{CancelToken, EntryPoint, ProgramHost};
pub use protocol::{
    status, BuildRequest, BuildResult, ErrorKind, ExecuteRequest, ExecuteResult, RouteRequest,
    RouteResponse, RoutesDiscovered,
};
pub use routes::{
    DispatchOutcome, Handler, HandlerResult, Route, RouteInfo, RouteMatch, RouteParams,
    RoutePattern, RouteTable, Verb, DEFAULT_RESPONSE_TYPE,
};
pub use sandbox::{SandboxId, SandboxState};
pub use script::ScriptToolchain;
pub use session::{SessionEvent, SessionId, SessionManager, SessionState};
pub use syntax::{
    Instruction, ResponseDecl, RouteDecl, Span, Statement, StatementKind, SwitchCase, SyntaxTree,
};
pub use toolchain::{CompileOutput, CompiledModule, Diagnostic, ModuleHandle, Severity, Toolchain};
