//! The API a running program sees.
//!
//! An [`EntryPoint`] receives a [`ProgramHost`] on the sandbox execution
//! thread. Through it the program registers routes, hits checkpoints,
//! sleeps, logs, and observes cancellation. Everything here is synchronous;
//! blocking is confined to the execution thread.

use crate::debugger::DebugController;
use crate::error::{Fault, RouteError};
use crate::protocol::{RoutesDiscovered, WorkerEvent};
use crate::routes::{Handler, RouteInfo, RouteTable, Verb, DEFAULT_RESPONSE_TYPE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Longest uninterrupted nap inside [`ProgramHost::sleep`].
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// A program's `main`.
pub trait EntryPoint: Send + Sync {
    fn main(&self, host: &mut ProgramHost) -> Result<(), Fault>;
}

impl<F> EntryPoint for F
where
    F: Fn(&mut ProgramHost) -> Result<(), Fault> + Send + Sync,
{
    fn main(&self, host: &mut ProgramHost) -> Result<(), Fault> {
        self(host)
    }
}

/// Cooperative cancellation flag shared with the execution thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Slot holding the route table of the current execution once published.
///
/// The worker reads it to dispatch requests; the execution thread fills it.
#[derive(Debug, Clone, Default)]
pub(crate) struct PublishedRoutes(Arc<Mutex<Option<Arc<RouteTable>>>>);

impl PublishedRoutes {
    pub fn publish(&self, table: Arc<RouteTable>) {
        *self.lock() = Some(table);
    }

    pub fn get(&self) -> Option<Arc<RouteTable>> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().take();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<RouteTable>>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Host services for one program execution.
pub struct ProgramHost {
    execution_id: u64,
    routes: RouteTable,
    published: PublishedRoutes,
    published_info: Option<Vec<RouteInfo>>,
    debugger: Arc<DebugController>,
    cancel: CancelToken,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl ProgramHost {
    pub(crate) fn new(
        execution_id: u64,
        published: PublishedRoutes,
        debugger: Arc<DebugController>,
        cancel: CancelToken,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            execution_id,
            routes: RouteTable::new(),
            published,
            published_info: None,
            debugger,
            cancel,
            events,
        }
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    /// Register a route answering with `text/plain`.
    pub fn map(&mut self, verb: Verb, template: &str, handler: Handler) -> Result<(), Fault> {
        self.map_typed(verb, template, DEFAULT_RESPONSE_TYPE, handler)
    }

    /// Register a route with an explicit response type.
    ///
    /// Fails once routes have been published.
    pub fn map_typed(
        &mut self,
        verb: Verb,
        template: &str,
        response_type: &str,
        handler: Handler,
    ) -> Result<(), Fault> {
        if self.published_info.is_some() {
            return Err(RouteError::AlreadyPublished.into());
        }
        self.routes
            .register_typed(verb, template, response_type, handler)?;
        Ok(())
    }

    /// Routes registered so far and not yet published.
    pub fn pending_routes(&self) -> Vec<RouteInfo> {
        self.routes.describe()
    }

    /// End the registration phase: make the routes dispatchable and report them.
    ///
    /// Long-running programs call this before entering their serve loop.
    /// Calling it again returns the already-published set.
    pub fn publish_routes(&mut self) -> Vec<RouteInfo> {
        if let Some(info) = &self.published_info {
            return info.clone();
        }
        let table = Arc::new(std::mem::take(&mut self.routes));
        let info = table.describe();
        self.published_info = Some(info.clone());
        if info.is_empty() {
            return info;
        }

        tracing::info!(execution_id = self.execution_id, routes = info.len(), "Routes published");
        self.published.publish(table);
        let _ = self.events.send(WorkerEvent::RoutesDiscovered {
            execution_id: self.execution_id,
            discovered: RoutesDiscovered {
                routes: info.clone(),
            },
        });
        info
    }

    /// Instrumented code calls this before a statement at `file:line`.
    pub fn checkpoint(&self, file: &str, line: u32) -> Result<(), Fault> {
        let cancel = &self.cancel;
        self.debugger
            .checkpoint_hit_until(file, line, || cancel.is_cancelled());
        self.check_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Fault::Cancelled)` once stop or the watchdog has fired.
    pub fn check_cancelled(&self) -> Result<(), Fault> {
        if self.cancel.is_cancelled() {
            Err(Fault::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep, waking early with `Fault::Cancelled` on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<(), Fault> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_cancelled()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    /// Emit a line of program output.
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(target: "sandpit::program", execution_id = self.execution_id, "{}", line);
        let _ = self.events.send(WorkerEvent::Log {
            execution_id: self.execution_id,
            line,
        });
    }

    /// Publish whatever the program registered if it never did so itself.
    pub(crate) fn finish(&mut self) {
        if self.published_info.is_none() && !self.routes.is_empty() {
            self.publish_routes();
        }
    }

    /// Forget every route of this execution.
    pub(crate) fn discard_routes(&mut self) {
        self.routes = RouteTable::new();
        self.published.clear();
    }
}

#[cfg(test)]
pub(crate) fn test_host() -> (ProgramHost, PublishedRoutes, mpsc::UnboundedReceiver<WorkerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let published = PublishedRoutes::default();
    let host = ProgramHost::new(
        1,
        published.clone(),
        Arc::new(DebugController::new(Duration::from_millis(5))),
        CancelToken::new(),
        tx,
    );
    (host, published, rx)
}
