//! Cooperative breakpoint debugger.
//!
//! The controller does not attach to the program. Instead the instrumenter
//! inserts checkpoint calls into the program, and each call lands in
//! [`DebugController::checkpoint_hit`] on the sandbox execution thread. When
//! a breakpoint matches, that thread parks on a condition variable until the
//! control plane calls [`resume`](DebugController::resume) or
//! [`stop`](DebugController::stop).
//!
//! ```text
//!            checkpoint_hit (bp match)          resume / stop
//!  Running ───────────────────────────▶ Paused ─────────────────▶ Running
//!     │                                   ▲
//!     └──────────── pause ────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the debugger event channel.
const EVENT_CAPACITY: usize = 64;

/// A source location at which execution should pause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Breakpoint {
    /// Source file, compared with [`files_match`].
    pub file: String,
    /// 1-based line number.
    pub line: u32,
}

impl Breakpoint {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: normalize_path(&file.into()),
            line,
        }
    }

    /// Whether this breakpoint sits at `file:line`.
    pub fn matches(&self, file: &str, line: u32) -> bool {
        self.line == line && files_match(&self.file, file)
    }
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    path.strip_prefix("./").unwrap_or(&path).to_string()
}

/// Compare two file names, tolerating separator style and partial paths.
///
/// `src/Program.sp` matches `/home/me/src/Program.sp` and `src\Program.sp`,
/// but `gram.sp` does not match `Program.sp`: a suffix only counts when it
/// starts at a path component boundary.
pub fn files_match(a: &str, b: &str) -> bool {
    let a = normalize_path(a);
    let b = normalize_path(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    let (long, short) = if a.len() > b.len() { (&a, &b) } else { (&b, &a) };
    long.ends_with(short.as_str()) && long[..long.len() - short.len()].ends_with('/')
}

/// Ordered set of breakpoints, unique by `(file, line)`.
#[derive(Debug, Clone, Default)]
pub struct BreakpointSet {
    points: BTreeSet<Breakpoint>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a breakpoint. Returns false when it was already present.
    pub fn insert(&mut self, breakpoint: Breakpoint) -> bool {
        self.points.insert(breakpoint)
    }

    /// Remove the breakpoint at exactly `file:line`.
    pub fn remove(&mut self, file: &str, line: u32) -> bool {
        self.points.remove(&Breakpoint::new(file, line))
    }

    /// Whether any breakpoint sits at `file:line`.
    pub fn contains(&self, file: &str, line: u32) -> bool {
        self.points.iter().any(|bp| bp.matches(file, line))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

impl FromIterator<Breakpoint> for BreakpointSet {
    fn from_iter<I: IntoIterator<Item = Breakpoint>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

/// Debugger run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugState {
    Running,
    Paused,
}

impl fmt::Display for DebugState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
        }
    }
}

/// Why a checkpoint paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// A breakpoint matched the checkpoint location.
    Breakpoint,
    /// [`DebugController::pause`] was called before the checkpoint.
    Manual,
}

/// Notifications emitted by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DebugEvent {
    Paused {
        file: String,
        line: u32,
        reason: PauseReason,
    },
    Resumed,
    Stopped,
    BreakpointsChanged {
        breakpoints: Vec<Breakpoint>,
    },
}

/// How a checkpoint call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Nothing matched; the checkpoint was transparent.
    Passed,
    /// The checkpoint blocked and was resumed.
    Resumed,
    /// The checkpoint blocked and was released by a stop.
    Released,
}

#[derive(Debug)]
struct ControlState {
    state: DebugState,
    /// Bumped on every stop so waits started before it are released.
    stop_epoch: u64,
    waiting: usize,
}

/// Per-session debugger state machine.
///
/// Shared between the control plane and the sandbox execution thread via
/// `Arc<DebugController>`.
#[derive(Debug)]
pub struct DebugController {
    control: Mutex<ControlState>,
    wake: Condvar,
    breakpoints: RwLock<BreakpointSet>,
    events: broadcast::Sender<DebugEvent>,
    poll_interval: Duration,
}

impl DebugController {
    /// Create a controller whose blocked checkpoints wake at least every `poll_interval`.
    pub fn new(poll_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            control: Mutex::new(ControlState {
                state: DebugState::Running,
                stop_epoch: 0,
                waiting: 0,
            }),
            wake: Condvar::new(),
            breakpoints: RwLock::new(BreakpointSet::new()),
            events,
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: DebugEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Subscribe to debugger notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DebugEvent> {
        self.events.subscribe()
    }

    /// Current run state.
    pub fn state(&self) -> DebugState {
        self.lock().state
    }

    /// Number of checkpoints currently blocked.
    pub fn waiting(&self) -> usize {
        self.lock().waiting
    }

    /// Called by instrumented code before a statement at `file:line`.
    ///
    /// Blocks the calling thread while the controller is paused. Must not be
    /// called from an async task.
    pub fn checkpoint_hit(&self, file: &str, line: u32) -> CheckpointOutcome {
        self.checkpoint_hit_until(file, line, || false)
    }

    /// Like [`checkpoint_hit`](Self::checkpoint_hit), but gives up as soon as
    /// `abort` returns true. `abort` is evaluated under the control lock, so a
    /// caller that sets its abort flag before calling [`stop`](Self::stop)
    /// cannot leave a stale pause behind.
    pub fn checkpoint_hit_until(
        &self,
        file: &str,
        line: u32,
        abort: impl Fn() -> bool,
    ) -> CheckpointOutcome {
        let mut control = self.lock();
        if abort() {
            return CheckpointOutcome::Released;
        }
        let reason = if control.state == DebugState::Paused {
            PauseReason::Manual
        } else if self.breakpoint_at(file, line) {
            PauseReason::Breakpoint
        } else {
            return CheckpointOutcome::Passed;
        };

        control.state = DebugState::Paused;
        control.waiting += 1;
        let epoch = control.stop_epoch;
        tracing::info!(file = %file, line, reason = ?reason, "Execution paused");
        self.emit(DebugEvent::Paused {
            file: file.to_string(),
            line,
            reason,
        });

        let outcome = loop {
            if control.stop_epoch != epoch {
                break CheckpointOutcome::Released;
            }
            if abort() {
                control.state = DebugState::Running;
                break CheckpointOutcome::Released;
            }
            if control.state == DebugState::Running {
                break CheckpointOutcome::Resumed;
            }
            control = match self.wake.wait_timeout(control, self.poll_interval) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        };
        control.waiting -= 1;
        tracing::debug!(file = %file, line, outcome = ?outcome, "Checkpoint released");
        outcome
    }

    fn breakpoint_at(&self, file: &str, line: u32) -> bool {
        self.breakpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(file, line)
    }

    /// Continue a paused program. Returns false (a no-op) when not paused.
    pub fn resume(&self) -> bool {
        let mut control = self.lock();
        if control.state != DebugState::Paused {
            tracing::debug!("Continue ignored: not paused");
            return false;
        }
        control.state = DebugState::Running;
        drop(control);
        self.wake.notify_all();
        tracing::info!("Execution resumed");
        self.emit(DebugEvent::Resumed);
        true
    }

    /// Request a manual break at the next checkpoint.
    pub fn pause(&self) -> bool {
        let mut control = self.lock();
        if control.state == DebugState::Paused {
            return false;
        }
        control.state = DebugState::Paused;
        tracing::info!("Manual pause requested");
        true
    }

    /// Release every blocked checkpoint and reset to `Running`.
    pub fn stop(&self) {
        let mut control = self.lock();
        control.stop_epoch += 1;
        control.state = DebugState::Running;
        let released = control.waiting;
        drop(control);
        self.wake.notify_all();
        tracing::debug!(released, "Debugger stopped");
        self.emit(DebugEvent::Stopped);
    }

    /// Add a breakpoint; effective from the next checkpoint evaluation.
    pub fn set_breakpoint(&self, breakpoint: Breakpoint) -> bool {
        let added = self.with_breakpoints(|set| set.insert(breakpoint));
        if added {
            self.breakpoints_changed();
        }
        added
    }

    /// Remove a breakpoint; effective from the next checkpoint evaluation.
    pub fn remove_breakpoint(&self, file: &str, line: u32) -> bool {
        let removed = self.with_breakpoints(|set| set.remove(file, line));
        if removed {
            self.breakpoints_changed();
        }
        removed
    }

    /// Drop all breakpoints.
    pub fn clear_breakpoints(&self) {
        let had_any = self.with_breakpoints(|set| {
            let had_any = !set.is_empty();
            set.clear();
            had_any
        });
        if had_any {
            self.breakpoints_changed();
        }
    }

    /// Snapshot of the current breakpoint set.
    pub fn breakpoints(&self) -> BreakpointSet {
        self.breakpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn with_breakpoints<R>(&self, f: impl FnOnce(&mut BreakpointSet) -> R) -> R {
        let mut set = self
            .breakpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut set)
    }

    fn breakpoints_changed(&self) {
        let breakpoints: Vec<Breakpoint> = self.breakpoints().iter().cloned().collect();
        tracing::debug!(count = breakpoints.len(), "Breakpoints changed");
        self.emit(DebugEvent::BreakpointsChanged { breakpoints });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(10);

    fn wait_for_waiters(controller: &DebugController, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while controller.waiting() != n {
            assert!(Instant::now() < deadline, "checkpoint never blocked");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn spawn_checkpoint(
        controller: &Arc<DebugController>,
        file: &'static str,
        line: u32,
    ) -> mpsc::Receiver<CheckpointOutcome> {
        let (tx, rx) = mpsc::channel();
        let controller = Arc::clone(controller);
        thread::spawn(move || {
            let _ = tx.send(controller.checkpoint_hit(file, line));
        });
        rx
    }

    #[test]
    fn test_files_match() {
        assert!(files_match("Program.sp", "Program.sp"));
        assert!(files_match("src/Program.sp", "/home/me/src/Program.sp"));
        assert!(files_match("src\\Program.sp", "src/Program.sp"));
        assert!(files_match("./Program.sp", "Program.sp"));
        assert!(!files_match("gram.sp", "Program.sp"));
        assert!(!files_match("", "Program.sp"));
    }

    #[test]
    fn test_breakpoint_set_unique() {
        let mut set = BreakpointSet::new();
        assert!(set.insert(Breakpoint::new("a.sp", 3)));
        assert!(!set.insert(Breakpoint::new("./a.sp", 3)));
        assert!(set.insert(Breakpoint::new("a.sp", 4)));
        assert_eq!(set.len(), 2);
        assert!(set.contains("/work/a.sp", 3));
        assert!(set.remove("a.sp", 3));
        assert!(!set.contains("a.sp", 3));
    }

    #[test]
    fn test_checkpoint_transparent_without_breakpoint() {
        let controller = DebugController::new(POLL);
        assert_eq!(controller.checkpoint_hit("a.sp", 1), CheckpointOutcome::Passed);
        assert_eq!(controller.state(), DebugState::Running);
    }

    #[test]
    fn test_pause_resume_liveness() {
        let controller = Arc::new(DebugController::new(POLL));
        let mut events = controller.subscribe();
        controller.set_breakpoint(Breakpoint::new("a.sp", 2));

        let rx = spawn_checkpoint(&controller, "a.sp", 2);
        wait_for_waiters(&controller, 1);
        assert_eq!(controller.state(), DebugState::Paused);

        // Several poll intervals pass without a Continue
        assert!(rx.recv_timeout(POLL * 5).is_err());

        assert!(controller.resume());
        let outcome = rx.recv_timeout(POLL * 20).expect("checkpoint should unblock");
        assert_eq!(outcome, CheckpointOutcome::Resumed);
        assert_eq!(controller.state(), DebugState::Running);

        assert!(matches!(events.try_recv(), Ok(DebugEvent::BreakpointsChanged { .. })));
        assert_eq!(
            events.try_recv().unwrap(),
            DebugEvent::Paused {
                file: "a.sp".into(),
                line: 2,
                reason: PauseReason::Breakpoint
            }
        );
        assert_eq!(events.try_recv().unwrap(), DebugEvent::Resumed);
    }

    #[test]
    fn test_stop_releases_blocked_checkpoint() {
        let controller = Arc::new(DebugController::new(POLL));
        controller.set_breakpoint(Breakpoint::new("a.sp", 7));

        let rx = spawn_checkpoint(&controller, "a.sp", 7);
        wait_for_waiters(&controller, 1);

        controller.stop();
        let outcome = rx.recv_timeout(POLL * 20).expect("stop should release");
        assert_eq!(outcome, CheckpointOutcome::Released);
        assert_eq!(controller.state(), DebugState::Running);

        // Continue after stop is a no-op
        assert!(!controller.resume());
    }

    #[test]
    fn test_manual_pause_blocks_next_checkpoint() {
        let controller = Arc::new(DebugController::new(POLL));
        assert!(controller.pause());
        assert!(!controller.pause());

        let rx = spawn_checkpoint(&controller, "b.sp", 1);
        wait_for_waiters(&controller, 1);
        assert!(controller.resume());
        assert_eq!(rx.recv_timeout(POLL * 20).unwrap(), CheckpointOutcome::Resumed);
    }

    #[test]
    fn test_removed_breakpoint_not_retroactive() {
        let controller = Arc::new(DebugController::new(POLL));
        controller.set_breakpoint(Breakpoint::new("a.sp", 5));

        let rx = spawn_checkpoint(&controller, "a.sp", 5);
        wait_for_waiters(&controller, 1);

        // Removing the breakpoint does not release the already-blocked checkpoint
        assert!(controller.remove_breakpoint("a.sp", 5));
        assert!(rx.recv_timeout(POLL * 5).is_err());
        controller.resume();
        assert_eq!(rx.recv_timeout(POLL * 20).unwrap(), CheckpointOutcome::Resumed);

        // ...but the next evaluation no longer stops
        assert_eq!(controller.checkpoint_hit("a.sp", 5), CheckpointOutcome::Passed);
    }

    #[test]
    fn test_abort_releases_and_clears_pause() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let controller = Arc::new(DebugController::new(POLL));
        controller.set_breakpoint(Breakpoint::new("a.sp", 3));
        let abort = Arc::new(AtomicBool::new(false));

        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(&controller);
        let flag = Arc::clone(&abort);
        thread::spawn(move || {
            let _ = tx.send(worker.checkpoint_hit_until("a.sp", 3, || flag.load(Ordering::SeqCst)));
        });
        wait_for_waiters(&controller, 1);

        abort.store(true, Ordering::SeqCst);
        assert_eq!(rx.recv_timeout(POLL * 20).unwrap(), CheckpointOutcome::Released);
        assert_eq!(controller.state(), DebugState::Running);

        // Already aborted: never pauses
        assert_eq!(
            controller.checkpoint_hit_until("a.sp", 3, || true),
            CheckpointOutcome::Released
        );
        assert_eq!(controller.state(), DebugState::Running);
    }

    #[test]
    fn test_clear_breakpoints() {
        let controller = DebugController::new(POLL);
        controller.set_breakpoint(Breakpoint::new("a.sp", 1));
        controller.set_breakpoint(Breakpoint::new("a.sp", 2));
        assert_eq!(controller.breakpoints().len(), 2);
        controller.clear_breakpoints();
        assert!(controller.breakpoints().is_empty());
    }
}
