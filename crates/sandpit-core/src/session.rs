//! Session manager - orchestrates build, execute, debug and teardown.
//!
//! ```text
//!   Uninitialized ──▶ Initializing ──▶ Idle ◀──────────────┐
//!                                      │  ▲                 │
//!                              build   │  │ completed       │ completed /
//!                                      ▼  │                 │ timeout / stop
//!                                    Building        Executing
//!                                                       ▲
//!                                      Idle ── execute ─┘
//! ```
//!
//! All mutable session state sits behind one async mutex. Completions from
//! the sandbox arrive on a per-sandbox event pump and are matched to their
//! operation by correlation id. An execution is settled exactly once: by its
//! completion message, by the watchdog, or by [`SessionManager::stop`],
//! whichever claims its ticket first.

use crate::config::SessionConfig;
use crate::debugger::{Breakpoint, BreakpointSet, DebugController, DebugEvent, DebugState};
use crate::error::{CoreError, Result};
use crate::protocol::{
    BuildOutcome, BuildRequest, BuildResult, ErrorKind, ExecuteRequest, ExecuteResult, RouteRequest,
    RouteResponse, WorkerEvent, WorkerRequest,
};
use crate::routes::{RouteInfo, Verb};
use crate::sandbox::{SandboxHandle, SandboxId};
use crate::toolchain::{CompiledModule, ModuleHandle, Toolchain};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Capacity of the session event channel.
const EVENT_CAPACITY: usize = 256;

/// Body of responses to requests caught in a sandbox restart.
const RESTART_DROPPED: &str = "sandbox restarted; request dropped";

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No sandbox exists yet (or the last one was unrecoverable).
    Uninitialized,
    /// A sandbox is being created.
    Initializing,
    /// Ready for build or execute.
    Idle,
    /// A build is in flight.
    Building,
    /// A program is running.
    Executing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Idle => write!(f, "Idle"),
            Self::Building => write!(f, "Building"),
            Self::Executing => write!(f, "Executing"),
        }
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    BuildFinished {
        result: BuildResult,
    },
    ExecutionFinished {
        execution_id: u64,
        result: ExecuteResult,
    },
    RoutesDiscovered {
        routes: Vec<RouteInfo>,
    },
    Log {
        line: String,
    },
    SandboxRestarted {
        reason: String,
    },
}

/// Settles one execution exactly once.
struct ExecutionTicket {
    id: u64,
    claimed: AtomicBool,
    reply: std::sync::Mutex<Option<oneshot::Sender<ExecuteResult>>>,
    watchdog: std::sync::Mutex<Option<JoinHandle<()>>>,
    started: Instant,
}

impl ExecutionTicket {
    fn new(id: u64, reply: oneshot::Sender<ExecuteResult>) -> Self {
        Self {
            id,
            claimed: AtomicBool::new(false),
            reply: std::sync::Mutex::new(Some(reply)),
            watchdog: std::sync::Mutex::new(None),
            started: Instant::now(),
        }
    }

    /// True for exactly one caller.
    fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::SeqCst)
    }

    fn reply(&self, result: ExecuteResult) {
        let sender = self
            .reply
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }

    fn set_watchdog(&self, handle: JoinHandle<()>) {
        *self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    fn disarm(&self) {
        let handle = self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

struct Inner {
    state: SessionState,
    sandbox: Option<SandboxHandle>,
    /// Bumped whenever the sandbox is replaced; events tagged with an older
    /// generation are dropped.
    generation: u64,
    pump: Option<JoinHandle<()>>,
    module: Option<CompiledModule>,
    pending_builds: HashMap<u64, oneshot::Sender<BuildOutcome>>,
    execution: Option<Arc<ExecutionTicket>>,
    last_execution_id: Option<u64>,
    pending_requests: HashMap<u64, oneshot::Sender<RouteResponse>>,
    routes: Vec<RouteInfo>,
}

struct Shared {
    id: SessionId,
    config: SessionConfig,
    toolchain: Arc<dyn Toolchain>,
    debugger: Arc<DebugController>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<SessionEvent>,
    next_id: AtomicU64,
    created_at: DateTime<Utc>,
}

/// Owns one sandbox, one debugger and the lifecycle around them.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Create a session. The sandbox is created lazily on first use.
    pub fn new(config: SessionConfig, toolchain: Arc<dyn Toolchain>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let debugger = Arc::new(DebugController::new(config.poll_interval));
        let id = SessionId::new();
        tracing::info!(
            session_id = %id,
            execution_timeout_ms = config.execution_timeout.as_millis() as u64,
            "Session created"
        );
        Self {
            shared: Arc::new(Shared {
                id,
                config,
                toolchain,
                debugger,
                inner: Mutex::new(Inner {
                    state: SessionState::Uninitialized,
                    sandbox: None,
                    generation: 0,
                    pump: None,
                    module: None,
                    pending_builds: HashMap::new(),
                    execution: None,
                    last_execution_id: None,
                    pending_requests: HashMap::new(),
                    routes: Vec::new(),
                }),
                events,
                next_id: AtomicU64::new(1),
                created_at: Utc::now(),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Subscribe to debugger notifications.
    pub fn debug_events(&self) -> broadcast::Receiver<DebugEvent> {
        self.shared.debugger.subscribe()
    }

    /// The session's debugger.
    pub fn debugger(&self) -> &Arc<DebugController> {
        &self.shared.debugger
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    /// The module the next [`execute`](Self::execute) will run.
    pub async fn active_module(&self) -> Option<CompiledModule> {
        self.shared.inner.lock().await.module.clone()
    }

    /// Routes published by the current program.
    pub async fn routes(&self) -> Vec<RouteInfo> {
        self.shared.inner.lock().await.routes.clone()
    }

    /// Identifier of the live sandbox, if any.
    pub async fn sandbox_id(&self) -> Option<SandboxId> {
        self.shared
            .inner
            .lock()
            .await
            .sandbox
            .as_ref()
            .map(SandboxHandle::id)
    }

    pub fn debug_state(&self) -> DebugState {
        self.shared.debugger.state()
    }

    pub fn breakpoints(&self) -> BreakpointSet {
        self.shared.debugger.breakpoints()
    }

    // ========================================================================
    // Build
    // ========================================================================

    /// Compile `source` under the configured default file name.
    pub async fn build(&self, source: &str) -> Result<BuildResult> {
        let file = self.shared.config.file_name.clone();
        self.build_file(&file, source).await
    }

    /// Compile `source` as `file`, instrumenting it for the current breakpoints.
    ///
    /// Rejected while a build or an execution is in flight. A failed build
    /// leaves the previously built module active.
    pub async fn build_file(&self, file: &str, source: &str) -> Result<BuildResult> {
        let request_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock().await;
            self.ensure_initialized(&mut inner);
            ensure_idle(&inner)?;
            self.transition(&mut inner, SessionState::Building);

            let request = BuildRequest {
                file: file.to_string(),
                source: source.to_string(),
                references: self.shared.config.references.clone(),
                breakpoints: self.shared.debugger.breakpoints().iter().cloned().collect(),
            };
            tracing::info!(
                session_id = %self.shared.id,
                request_id,
                file = %file,
                breakpoints = request.breakpoints.len(),
                "Build requested"
            );
            inner.pending_builds.insert(request_id, tx);
            if let Err(e) = self
                .send(&inner, WorkerRequest::Build { request_id, request })
                .await
            {
                inner.pending_builds.remove(&request_id);
                self.transition(&mut inner, SessionState::Idle);
                return Err(e);
            }
        }

        let waited = tokio::time::timeout(self.shared.config.build_timeout, rx).await;

        let mut inner = self.shared.inner.lock().await;
        inner.pending_builds.remove(&request_id);
        let outcome = match waited {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.leave(&mut inner, SessionState::Building);
                return Err(CoreError::SandboxUnavailable(
                    "sandbox restarted during build".into(),
                ));
            }
            Err(_) => {
                tracing::warn!(session_id = %self.shared.id, request_id, "Build timed out");
                self.leave(&mut inner, SessionState::Building);
                return Err(CoreError::BuildTimeout(self.shared.config.build_timeout));
            }
        };

        let BuildOutcome { result, module } = outcome;
        match module {
            Some(module) => {
                tracing::info!(
                    session_id = %self.shared.id,
                    module = %module.handle(),
                    checkpoints = module.checkpoints(),
                    "Build succeeded"
                );
                inner.module = Some(module);
            }
            None => {
                tracing::info!(
                    session_id = %self.shared.id,
                    diagnostics = result.diagnostics.len(),
                    "Build failed; keeping previous module"
                );
            }
        }
        self.leave(&mut inner, SessionState::Building);
        self.emit(SessionEvent::BuildFinished {
            result: result.clone(),
        });
        Ok(result)
    }

    // ========================================================================
    // Execute
    // ========================================================================

    /// Run the active module under the configured execution budget.
    pub async fn execute(&self) -> Result<ExecuteResult> {
        self.execute_with_timeout(self.shared.config.execution_timeout)
            .await
    }

    /// Run the active module under `budget`.
    pub async fn execute_with_timeout(&self, budget: Duration) -> Result<ExecuteResult> {
        self.execute_active(None, budget).await
    }

    /// Run the module named by `request` under `budget`.
    ///
    /// Fails with [`CoreError::UnknownModule`] unless it is the active module,
    /// so a caller holding a handle from an older build cannot run stale code.
    pub async fn execute_request(&self, request: &ExecuteRequest, budget: Duration) -> Result<ExecuteResult> {
        self.execute_active(Some(request.module_handle), budget).await
    }

    async fn execute_active(&self, expected: Option<ModuleHandle>, budget: Duration) -> Result<ExecuteResult> {
        let rx = {
            let mut inner = self.shared.inner.lock().await;
            self.ensure_initialized(&mut inner);
            ensure_idle(&inner)?;
            let module = inner.module.clone().ok_or(CoreError::NoModule)?;
            if let Some(expected) = expected {
                if module.handle() != expected {
                    return Err(CoreError::UnknownModule(expected.to_string()));
                }
            }
            self.start_execution(&mut inner, module, budget).await?
        };
        Ok(Self::await_execution(rx).await)
    }

    /// Run an explicitly supplied module under `budget`.
    ///
    /// The active module is left untouched.
    pub async fn execute_module(&self, module: CompiledModule, budget: Duration) -> Result<ExecuteResult> {
        let rx = {
            let mut inner = self.shared.inner.lock().await;
            self.ensure_initialized(&mut inner);
            ensure_idle(&inner)?;
            self.start_execution(&mut inner, module, budget).await?
        };
        Ok(Self::await_execution(rx).await)
    }

    async fn await_execution(rx: oneshot::Receiver<ExecuteResult>) -> ExecuteResult {
        rx.await.unwrap_or_else(|_| {
            ExecuteResult::failed(ErrorKind::SandboxLost, "execution was abandoned", Duration::ZERO)
        })
    }

    async fn start_execution(
        &self,
        inner: &mut Inner,
        module: CompiledModule,
        budget: Duration,
    ) -> Result<oneshot::Receiver<ExecuteResult>> {
        let execution_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        let ticket = Arc::new(ExecutionTicket::new(execution_id, tx));

        tracing::info!(
            session_id = %self.shared.id,
            execution_id,
            module = %module.handle(),
            budget_ms = budget.as_millis() as u64,
            "Execution requested"
        );
        inner.routes.clear();
        self.send(inner, WorkerRequest::Execute { execution_id, module })
            .await?;

        inner.execution = Some(Arc::clone(&ticket));
        inner.last_execution_id = Some(execution_id);
        self.transition(inner, SessionState::Executing);
        self.arm_watchdog(ticket, budget);
        Ok(rx)
    }

    fn arm_watchdog(&self, ticket: Arc<ExecutionTicket>, budget: Duration) {
        let shared = Arc::downgrade(&self.shared);
        let watched = Arc::clone(&ticket);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            if let Some(shared) = shared.upgrade() {
                SessionManager { shared }.on_watchdog(watched, budget).await;
            }
        });
        ticket.set_watchdog(handle);
    }

    async fn on_watchdog(&self, ticket: Arc<ExecutionTicket>, budget: Duration) {
        let mut inner = self.shared.inner.lock().await;
        if !ticket.claim() {
            return;
        }
        tracing::warn!(
            session_id = %self.shared.id,
            execution_id = ticket.id,
            budget_ms = budget.as_millis() as u64,
            "Execution timed out; restarting sandbox"
        );
        let recovered = self.restart_sandbox(&mut inner, "execution timed out").await;
        let result = ExecuteResult::failed(
            ErrorKind::TimeoutExceeded,
            format!("execution exceeded its {} ms budget", budget.as_millis()),
            ticket.started.elapsed(),
        );
        self.settle(&mut inner, &ticket, result, next_state(recovered));
    }

    /// Act on an execution completion. Only the first completion of an
    /// execution counts; later or unknown ones return false.
    pub async fn handle_execution_completed(&self, execution_id: u64, result: ExecuteResult) -> bool {
        let mut inner = self.shared.inner.lock().await;
        self.complete_execution(&mut inner, execution_id, result)
    }

    fn complete_execution(&self, inner: &mut Inner, execution_id: u64, result: ExecuteResult) -> bool {
        let ticket = match &inner.execution {
            Some(ticket) if ticket.id == execution_id => Arc::clone(ticket),
            _ => {
                tracing::debug!(session_id = %self.shared.id, execution_id, "Discarding late completion");
                return false;
            }
        };
        if !ticket.claim() {
            return false;
        }
        if !result.success {
            // The worker already dropped the table of a failed program
            inner.routes.clear();
        }
        self.settle(inner, &ticket, result, SessionState::Idle);
        true
    }

    /// Finish a claimed execution: update state, notify, wake the caller.
    fn settle(&self, inner: &mut Inner, ticket: &ExecutionTicket, result: ExecuteResult, next: SessionState) {
        ticket.disarm();
        if inner.execution.as_ref().map(|t| t.id) == Some(ticket.id) {
            inner.execution = None;
        }
        if inner.state == SessionState::Executing {
            self.transition(inner, next);
        }
        tracing::info!(
            session_id = %self.shared.id,
            execution_id = ticket.id,
            success = result.success,
            kind = ?result.error_kind,
            elapsed_ms = result.elapsed_ms,
            "Execution settled"
        );
        self.emit(SessionEvent::ExecutionFinished {
            execution_id: ticket.id,
            result: result.clone(),
        });
        ticket.reply(result);
    }

    // ========================================================================
    // Stop
    // ========================================================================

    /// Cancel any execution, release blocked checkpoints, clear breakpoints
    /// and replace the sandbox.
    ///
    /// Ends in `Idle`, or in `Uninitialized` when the old sandbox had died.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        tracing::info!(session_id = %self.shared.id, state = %inner.state, "Stop requested");
        self.shared.debugger.clear_breakpoints();
        let ticket = inner.execution.take();

        if inner.state == SessionState::Uninitialized {
            self.shared.debugger.stop();
            return Ok(());
        }

        let recovered = self.restart_sandbox(&mut inner, "stop requested").await;
        let next = next_state(recovered);
        if let Some(ticket) = ticket {
            if ticket.claim() {
                let result = ExecuteResult::failed(
                    ErrorKind::Stopped,
                    "execution stopped",
                    ticket.started.elapsed(),
                );
                self.settle(&mut inner, &ticket, result, next);
            }
        }
        self.transition(&mut inner, next);
        Ok(())
    }

    /// Tear the sandbox down for good. The session re-initializes on next use.
    pub async fn shutdown(&self) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(ticket) = inner.execution.take() {
            if ticket.claim() {
                let result = ExecuteResult::failed(
                    ErrorKind::Stopped,
                    "session shut down",
                    ticket.started.elapsed(),
                );
                self.settle(&mut inner, &ticket, result, SessionState::Uninitialized);
            }
        }
        self.retire_sandbox(&mut inner).await;
        self.transition(&mut inner, SessionState::Uninitialized);
        tracing::info!(session_id = %self.shared.id, "Session shut down");
    }

    // ========================================================================
    // Debugger
    // ========================================================================

    /// Add a breakpoint. Returns false when it was already set.
    pub fn set_breakpoint(&self, file: &str, line: u32) -> Result<bool> {
        if file.trim().is_empty() {
            return Err(CoreError::InvalidBreakpoint("file is required".into()));
        }
        if line == 0 {
            return Err(CoreError::InvalidBreakpoint("lines are 1-based".into()));
        }
        Ok(self.shared.debugger.set_breakpoint(Breakpoint::new(file, line)))
    }

    /// Remove a breakpoint. Returns false when it was not set.
    pub fn remove_breakpoint(&self, file: &str, line: u32) -> bool {
        self.shared.debugger.remove_breakpoint(file, line)
    }

    /// Resume a paused program. Returns false ("not paused") when running.
    pub fn continue_execution(&self) -> bool {
        self.shared.debugger.resume()
    }

    /// Break at the next checkpoint.
    pub fn pause(&self) -> bool {
        self.shared.debugger.pause()
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Send a synthetic request to the running program.
    ///
    /// Answers 503 when no sandbox is up or no routes are published, 404 when
    /// nothing matches, and 500 when the handler faults.
    pub async fn request(&self, verb: Verb, path: &str, body: Option<String>) -> Result<RouteResponse> {
        let request_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.sandbox.is_none() {
                return Ok(RouteResponse::unavailable(request_id, "sandbox is not running"));
            }
            tracing::debug!(session_id = %self.shared.id, request_id, verb = %verb, path = %path, "Routing request");
            inner.pending_requests.insert(request_id, tx);
            let request = RouteRequest {
                request_id,
                verb,
                path: path.to_string(),
                body,
            };
            if let Err(e) = self.send(&inner, WorkerRequest::Route(request)).await {
                inner.pending_requests.remove(&request_id);
                return Err(e);
            }
        }

        match tokio::time::timeout(self.shared.config.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Ok(RouteResponse::unavailable(request_id, RESTART_DROPPED)),
            Err(_) => {
                self.shared
                    .inner
                    .lock()
                    .await
                    .pending_requests
                    .remove(&request_id);
                Err(CoreError::RequestTimeout(self.shared.config.request_timeout))
            }
        }
    }

    // ========================================================================
    // Sandbox lifecycle
    // ========================================================================

    fn ensure_initialized(&self, inner: &mut Inner) {
        if inner.state != SessionState::Uninitialized {
            return;
        }
        self.transition(inner, SessionState::Initializing);
        self.spawn_sandbox(inner);
        self.transition(inner, SessionState::Idle);
    }

    fn spawn_sandbox(&self, inner: &mut Inner) {
        let (sandbox, events) = SandboxHandle::spawn(
            Arc::clone(&self.shared.toolchain),
            Arc::clone(&self.shared.debugger),
            self.shared.config.channel_capacity,
        );
        inner.generation += 1;
        tracing::debug!(
            session_id = %self.shared.id,
            sandbox_id = %sandbox.id(),
            created_at = %sandbox.created_at(),
            generation = inner.generation,
            "Sandbox attached"
        );
        inner.pump = Some(tokio::spawn(pump_events(
            Arc::downgrade(&self.shared),
            inner.generation,
            events,
        )));
        inner.sandbox = Some(sandbox);
    }

    /// Tear down the current sandbox and drop everything correlated with it.
    /// Returns false when the old worker had died.
    async fn retire_sandbox(&self, inner: &mut Inner) -> bool {
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        inner.generation += 1;
        inner.routes.clear();
        // Dropping the senders fails any build still waiting
        inner.pending_builds.clear();
        for (request_id, reply) in inner.pending_requests.drain() {
            let _ = reply.send(RouteResponse::unavailable(request_id, RESTART_DROPPED));
        }

        let recovered = match inner.sandbox.take() {
            Some(sandbox) => {
                let was_alive = sandbox.is_alive();
                let exited = sandbox.teardown(self.shared.config.teardown_grace).await;
                was_alive && exited
            }
            None => true,
        };
        // After teardown, so the program is already cancelled when released
        self.shared.debugger.stop();
        recovered
    }

    async fn restart_sandbox(&self, inner: &mut Inner, reason: &str) -> bool {
        let recovered = self.retire_sandbox(inner).await;
        if !recovered {
            tracing::error!(session_id = %self.shared.id, reason, "Sandbox unrecoverable");
            return false;
        }
        self.spawn_sandbox(inner);
        tracing::info!(session_id = %self.shared.id, reason, "Sandbox restarted");
        self.emit(SessionEvent::SandboxRestarted {
            reason: reason.to_string(),
        });
        true
    }

    async fn on_worker_event(&self, generation: u64, event: WorkerEvent) {
        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation {
            tracing::debug!(session_id = %self.shared.id, generation, "Dropping event from retired sandbox");
            return;
        }

        match event {
            WorkerEvent::BuildCompleted { request_id, outcome } => {
                match inner.pending_builds.remove(&request_id) {
                    Some(reply) => {
                        let _ = reply.send(outcome);
                    }
                    None => tracing::warn!(
                        session_id = %self.shared.id,
                        request_id,
                        "Protocol error: uncorrelated build completion"
                    ),
                }
            }
            WorkerEvent::ExecutionCompleted { execution_id, result } => {
                self.complete_execution(&mut inner, execution_id, result);
            }
            WorkerEvent::RoutesDiscovered {
                execution_id,
                discovered,
            } => {
                if inner.last_execution_id != Some(execution_id) {
                    tracing::warn!(
                        session_id = %self.shared.id,
                        execution_id,
                        "Protocol error: routes from unknown execution"
                    );
                    return;
                }
                inner.routes = discovered.routes.clone();
                self.emit(SessionEvent::RoutesDiscovered {
                    routes: discovered.routes,
                });
            }
            WorkerEvent::RouteResponse(response) => {
                match inner.pending_requests.remove(&response.request_id) {
                    Some(reply) => {
                        let _ = reply.send(response);
                    }
                    None => tracing::warn!(
                        session_id = %self.shared.id,
                        request_id = response.request_id,
                        "Protocol error: uncorrelated route response"
                    ),
                }
            }
            WorkerEvent::Log { execution_id, line } => {
                if inner.last_execution_id == Some(execution_id) {
                    self.emit(SessionEvent::Log { line });
                }
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, inner: &Inner, request: WorkerRequest) -> Result<()> {
        match &inner.sandbox {
            Some(sandbox) => sandbox.send(request).await,
            None => Err(CoreError::SandboxUnavailable("no sandbox".into())),
        }
    }

    fn transition(&self, inner: &mut Inner, to: SessionState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::debug!(session_id = %self.shared.id, from = %from, to = %to, "Session state changed");
        self.emit(SessionEvent::StateChanged { from, to });
    }

    /// Return to `Idle` if still in `from`; stop or a restart may have moved on.
    fn leave(&self, inner: &mut Inner, from: SessionState) {
        if inner.state == from {
            self.transition(inner, SessionState::Idle);
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("id", &self.shared.id)
            .finish()
    }
}

fn ensure_idle(inner: &Inner) -> Result<()> {
    if inner.state != SessionState::Idle {
        return Err(CoreError::InvalidState {
            expected: SessionState::Idle.to_string(),
            actual: inner.state.to_string(),
        });
    }
    Ok(())
}

fn next_state(recovered: bool) -> SessionState {
    if recovered {
        SessionState::Idle
    } else {
        SessionState::Uninitialized
    }
}

/// Forward one sandbox generation's events into the session.
async fn pump_events(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        SessionManager { shared }.on_worker_event(generation, event).await;
    }
}
