//! Sandbox worker - an isolated execution context behind a message channel.
//!
//! The control plane never touches a running program directly. It owns a
//! [`SandboxHandle`] whose worker task owns a [`SandboxRunner`]; the two sides
//! talk only through [`WorkerRequest`] and [`WorkerEvent`] messages. The user
//! program runs on its own OS thread so a program that ignores cancellation
//! can be abandoned without blocking the runtime.

use crate::debugger::{BreakpointSet, DebugController};
use crate::error::{CoreError, Fault};
use crate::instrument::instrument;
use crate::program::{CancelToken, ProgramHost, PublishedRoutes};
use crate::protocol::{
    BuildOutcome, BuildRequest, BuildResult, ErrorKind, ExecuteResult, RouteRequest,
    RouteResponse, WorkerEvent, WorkerRequest,
};
use crate::routes::DispatchOutcome;
use crate::toolchain::{CompiledModule, Diagnostic, Toolchain};
use chrono::{DateTime, Utc};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Unique identifier for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SandboxId(Uuid);

impl SandboxId {
    /// Create a new random sandbox ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SandboxId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Current state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Waiting for work; may still be serving routes of a finished program.
    Ready,
    /// A program is running on the execution thread.
    Executing,
    /// Released; the worker no longer accepts requests.
    TornDown,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::Executing => write!(f, "Executing"),
            Self::TornDown => write!(f, "TornDown"),
        }
    }
}

/// The program most recently started in this sandbox.
struct ActiveExecution {
    id: u64,
    cancel: CancelToken,
    routes: PublishedRoutes,
}

/// Worker-side state of one sandbox.
pub(crate) struct SandboxRunner {
    id: SandboxId,
    toolchain: Arc<dyn Toolchain>,
    debugger: Arc<DebugController>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    active: Option<ActiveExecution>,
    state: SandboxState,
}

impl SandboxRunner {
    pub fn new(
        id: SandboxId,
        toolchain: Arc<dyn Toolchain>,
        debugger: Arc<DebugController>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            id,
            toolchain,
            debugger,
            events,
            active: None,
            state: SandboxState::Ready,
        }
    }

    /// Compile on a blocking thread and report `BuildCompleted`.
    fn build(&self, request_id: u64, request: BuildRequest) {
        let toolchain = Arc::clone(&self.toolchain);
        let events = self.events.clone();
        let sandbox_id = self.id;
        tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| build_module(toolchain.as_ref(), request)))
                .unwrap_or_else(|payload| {
                    let fault = Fault::from_panic(payload);
                    BuildOutcome {
                        result: BuildResult::failed(vec![format!("internal compiler error: {}", fault)]),
                        module: None,
                    }
                });
            tracing::debug!(
                sandbox_id = %sandbox_id,
                request_id,
                success = outcome.result.success,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Build finished"
            );
            let _ = events.send(WorkerEvent::BuildCompleted { request_id, outcome });
        });
    }

    /// Start `module` on a fresh execution thread.
    ///
    /// Any previous program is cancelled and its routes dropped first.
    fn start(&mut self, execution_id: u64, module: CompiledModule) {
        self.retire_active();

        let cancel = CancelToken::new();
        let routes = PublishedRoutes::default();
        let mut host = ProgramHost::new(
            execution_id,
            routes.clone(),
            Arc::clone(&self.debugger),
            cancel.clone(),
            self.events.clone(),
        );
        let events = self.events.clone();
        let sandbox_id = self.id;

        tracing::info!(sandbox_id = %sandbox_id, execution_id, module = %module.handle(), "Starting execution");
        let spawned = std::thread::Builder::new()
            .name(format!("sandpit-exec-{}", execution_id))
            .spawn(move || {
                let result = run_entry(&module, &mut host);
                tracing::info!(
                    sandbox_id = %sandbox_id,
                    execution_id,
                    success = result.success,
                    elapsed_ms = result.elapsed_ms,
                    "Execution finished"
                );
                let _ = events.send(WorkerEvent::ExecutionCompleted { execution_id, result });
            });

        match spawned {
            Ok(_) => {
                self.state = SandboxState::Executing;
                self.active = Some(ActiveExecution {
                    id: execution_id,
                    cancel,
                    routes,
                });
            }
            Err(e) => {
                tracing::error!(sandbox_id = %sandbox_id, execution_id, error = %e, "Failed to spawn execution thread");
                let _ = self.events.send(WorkerEvent::ExecutionCompleted {
                    execution_id,
                    result: ExecuteResult::failed(
                        ErrorKind::RuntimeFault,
                        format!("failed to start execution thread: {}", e),
                        Duration::ZERO,
                    ),
                });
            }
        }
    }

    /// Route a synthetic request to the published table on a blocking thread.
    fn dispatch(&self, request: RouteRequest) {
        let table = self.active.as_ref().and_then(|active| active.routes.get());
        let Some(table) = table else {
            tracing::debug!(sandbox_id = %self.id, request_id = request.request_id, "No routes published");
            let _ = self.events.send(WorkerEvent::RouteResponse(RouteResponse::unavailable(
                request.request_id,
                "no program is serving requests",
            )));
            return;
        };

        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let RouteRequest {
                request_id,
                verb,
                path,
                body,
            } = request;
            let response = match table.dispatch(verb, &path, body.as_deref()) {
                DispatchOutcome::Handled {
                    body,
                    response_type,
                } => RouteResponse::ok(request_id, body, &response_type),
                DispatchOutcome::NotFound => RouteResponse::not_found(request_id, verb, &path),
                DispatchOutcome::Faulted(fault) => {
                    tracing::warn!(request_id, verb = %verb, path = %path, error = %fault, "Route handler faulted");
                    RouteResponse::internal_error(request_id, fault.to_string())
                }
            };
            let _ = events.send(WorkerEvent::RouteResponse(response));
        });
    }

    fn retire_active(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::debug!(sandbox_id = %self.id, execution_id = active.id, "Retiring execution");
            active.cancel.cancel();
            active.routes.clear();
        }
    }

    /// Release the context. Safe to call more than once, and safe when no
    /// program ever ran.
    pub fn teardown(&mut self) {
        if self.state == SandboxState::TornDown {
            return;
        }
        // Cancel before releasing checkpoints so a released thread sees it.
        self.retire_active();
        self.debugger.stop();
        self.state = SandboxState::TornDown;
        tracing::info!(sandbox_id = %self.id, "Sandbox torn down");
    }

    fn handle(&mut self, request: WorkerRequest) -> bool {
        match request {
            WorkerRequest::Build {
                request_id,
                request,
            } => self.build(request_id, request),
            WorkerRequest::Execute {
                execution_id,
                module,
            } => self.start(execution_id, module),
            WorkerRequest::Route(request) => self.dispatch(request),
            WorkerRequest::Shutdown => return false,
        }
        true
    }
}

/// Parse, instrument and compile one source file.
pub(crate) fn build_module(toolchain: &dyn Toolchain, request: BuildRequest) -> BuildOutcome {
    let BuildRequest {
        file,
        source,
        references,
        breakpoints,
    } = request;

    let mut tree = match toolchain.parse(&file, &source) {
        Ok(tree) => tree,
        Err(diagnostics) => {
            return BuildOutcome {
                result: BuildResult::failed(render(&diagnostics)),
                module: None,
            }
        }
    };

    let breakpoints: BreakpointSet = breakpoints.into_iter().collect();
    let checkpoints = instrument(&mut tree, &breakpoints);

    let output = toolchain.compile(&tree, &references);
    let diagnostics = render(&output.diagnostics);
    match output.entry {
        Some(entry) => {
            let module = CompiledModule::new(entry, output.diagnostics, checkpoints);
            BuildOutcome {
                result: BuildResult {
                    success: true,
                    module_handle: Some(module.handle()),
                    diagnostics,
                    checkpoints,
                },
                module: Some(module),
            }
        }
        None => BuildOutcome {
            result: BuildResult::failed(diagnostics),
            module: None,
        },
    }
}

fn render(diagnostics: &[Diagnostic]) -> Vec<String> {
    diagnostics.iter().map(ToString::to_string).collect()
}

/// Invoke the entry point, converting every way it can end into a result.
pub(crate) fn run_entry(module: &CompiledModule, host: &mut ProgramHost) -> ExecuteResult {
    let start = Instant::now();
    let entry = module.entry();
    let outcome = catch_unwind(AssertUnwindSafe(|| entry.main(host)))
        .unwrap_or_else(|payload| Err(Fault::from_panic(payload)));
    let elapsed = start.elapsed();

    match outcome {
        Ok(()) => {
            host.finish();
            ExecuteResult::succeeded(elapsed)
        }
        Err(Fault::Cancelled) => {
            host.discard_routes();
            ExecuteResult::failed(ErrorKind::Stopped, Fault::Cancelled.to_string(), elapsed)
        }
        Err(fault) => {
            // A faulted program leaves no active routes
            host.discard_routes();
            ExecuteResult::failed(ErrorKind::RuntimeFault, fault.to_string(), elapsed)
        }
    }
}

async fn run_worker(mut runner: SandboxRunner, mut requests: mpsc::Receiver<WorkerRequest>) {
    while let Some(request) = requests.recv().await {
        if !runner.handle(request) {
            break;
        }
    }
    runner.teardown();
}

/// Control-plane side of a sandbox.
pub(crate) struct SandboxHandle {
    id: SandboxId,
    requests: mpsc::Sender<WorkerRequest>,
    task: JoinHandle<()>,
    created_at: DateTime<Utc>,
}

impl SandboxHandle {
    /// Spawn a worker task. Returns the handle and the worker's event stream.
    pub fn spawn(
        toolchain: Arc<dyn Toolchain>,
        debugger: Arc<DebugController>,
        capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let id = SandboxId::new();
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let runner = SandboxRunner::new(id, toolchain, debugger, event_tx);
        let task = tokio::spawn(run_worker(runner, request_rx));
        tracing::info!(sandbox_id = %id, "Sandbox ready");
        (
            Self {
                id,
                requests: request_tx,
                task,
                created_at: Utc::now(),
            },
            event_rx,
        )
    }

    pub fn id(&self) -> SandboxId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Queue a request for the worker.
    pub async fn send(&self, request: WorkerRequest) -> Result<(), CoreError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| CoreError::SandboxUnavailable(format!("sandbox {} is gone", self.id)))
    }

    /// Shut the worker down and wait up to `grace` for it to exit.
    ///
    /// Returns false when the worker had died (panicked), meaning the
    /// failure is not a plain timeout and the sandbox should not be
    /// recreated blindly.
    pub async fn teardown(mut self, grace: Duration) -> bool {
        let id = self.id;
        if tokio::time::timeout(grace, self.requests.send(WorkerRequest::Shutdown))
            .await
            .is_err()
        {
            tracing::warn!(sandbox_id = %id, "Worker queue full during teardown");
        }

        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) if e.is_panic() => {
                tracing::error!(sandbox_id = %id, error = %e, "Sandbox worker panicked");
                false
            }
            Ok(Err(_)) => true,
            Err(_) => {
                tracing::warn!(sandbox_id = %id, grace_ms = grace.as_millis() as u64, "Worker did not exit in time; aborting");
                self.task.abort();
                true
            }
        }
    }
}
