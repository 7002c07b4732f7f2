//! IDE-facing engine.
//!
//! `Engine` wires one session's components together, runs the GDB event pump
//! on a background thread and is the boundary where panics are caught and
//! reported as `EngineError::Unexpected`.

use crate::breakpoint::{BoundBreakpoint, BreakpointRegistry, BreakpointRequest, Condition, PassCount, PendingBreakpoint, PendingStatus};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::execution::{ExecutionCoordinator, ExecutionState, StepKind};
use crate::expression::{self, CancelToken, EvalTask, GdbExpression};
use crate::gdb::{GdbEvent, GdbLauncher, LaunchParams};
use crate::session::{Lifecycle, Session};
use crate::sync::lock;
use crate::thread::{FrameInfo, FrameInfoFlags, ThreadAndFrameCache, ThreadProperties, ThreadSnapshot};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::broadcast;

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run an interface operation, converting a panic into `Unexpected`.
fn boundary<T>(operation: &str, f: impl FnOnce() -> EngineResult<T>) -> EngineResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => {
            if let Err(e) = &result {
                log::debug!("{operation}: {e}");
            }
            result
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!("{operation} panicked: {message}");
            Err(EngineError::Unexpected(message))
        }
    }
}

/// Public facade over one debugging session.
///
/// Every operation runs inside a panic boundary and reports failures as
/// [`EngineError`]. Dropping the engine tears the session down and joins the
/// event pump.
pub struct Engine {
    session: Arc<Session>,
    coordinator: Arc<ExecutionCoordinator>,
    registry: Arc<BreakpointRegistry>,
    threads: ThreadAndFrameCache,
    launcher: Arc<dyn GdbLauncher>,
    pending: Mutex<Vec<Arc<PendingBreakpoint>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build an idle engine. Nothing is launched until `launch_suspended` or `attach`.
    pub fn new(config: EngineConfig, launcher: Arc<dyn GdbLauncher>) -> Self {
        let session = Session::new(config);
        let coordinator = ExecutionCoordinator::new(Arc::clone(&session));
        let registry = BreakpointRegistry::new(Arc::clone(&coordinator));
        Self {
            threads: ThreadAndFrameCache::new(Arc::clone(&session)),
            session,
            coordinator,
            registry,
            launcher,
            pending: Mutex::new(Vec::new()),
            pump: Mutex::new(None),
        }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.session.subscribe()
    }

    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub const fn registry(&self) -> &Arc<BreakpointRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ExecutionState {
        self.session.state()
    }

    fn spawn_pump(&self, events: Receiver<GdbEvent>) -> EngineResult<()> {
        let coordinator = Arc::clone(&self.coordinator);
        let registry = Arc::clone(&self.registry);
        let session = Arc::clone(&self.session);
        let handle = thread::Builder::new()
            .name("gdb-events".to_string())
            .spawn(move || {
                let poll = session.config().lock_poll();
                loop {
                    match events.recv_timeout(poll) {
                        Ok(event) => {
                            log::debug!("GDB event: {event:?}");
                            let handled = panic::catch_unwind(AssertUnwindSafe(|| {
                                coordinator.handle_event(event, &registry);
                            }));
                            if let Err(payload) = handled {
                                log::error!("GDB event handler panicked: {}", panic_message(payload.as_ref()));
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            coordinator.handle_event(GdbEvent::Exited { code: None }, &registry);
                            break;
                        }
                    }
                    if session.lifecycle() == Lifecycle::TornDown {
                        break;
                    }
                }
                log::debug!("GDB event pump stopped");
            })
            .map_err(|e| EngineError::Unexpected(format!("failed to spawn event pump: {e}")))?;
        *lock(&self.pump) = Some(handle);
        Ok(())
    }

    fn parse_options(options: &str) -> EngineResult<LaunchParams> {
        LaunchParams::from_options(options).map_err(|e| EngineError::InvalidArgument(format!("{e:#}")))
    }

    /// Start GDB with the target suspended. `options` is `exe=...;pid=...;device=...`.
    pub fn launch_suspended(&self, options: &str) -> EngineResult<()> {
        boundary("launch_suspended", || {
            let params = Self::parse_options(options)?;
            let events = self.coordinator.launch_suspended(self.launcher.as_ref(), &params)?;
            self.spawn_pump(events)
        })
    }

    /// Attach to a running process and bind any breakpoints created so far.
    pub fn attach(&self, options: &str) -> EngineResult<()> {
        boundary("attach", || {
            let params = Self::parse_options(options)?;
            let events = self.coordinator.attach(self.launcher.as_ref(), &params)?;
            self.spawn_pump(events)?;
            self.bind_pending();
            Ok(())
        })
    }

    /// Bind every pending breakpoint created before the session started, then run.
    pub fn resume_process(&self) -> EngineResult<()> {
        boundary("resume_process", || {
            self.bind_pending();
            self.coordinator.resume_process()
        })
    }

    fn bind_pending(&self) {
        let pending = lock(&self.pending).clone();
        for bp in pending.iter().filter(|bp| bp.can_bind() && !bp.get_state().bound) {
            if let Err(e) = bp.bind() {
                log::warn!("Breakpoint {:?} not bound: {e}", bp.request().location);
            }
        }
    }

    /// Resume from a break state.
    pub fn continue_execution(&self) -> EngineResult<()> {
        boundary("continue", || self.coordinator.continue_execution())
    }

    /// Interrupt the running target. Completion arrives as `BreakComplete`.
    pub fn cause_break(&self) -> EngineResult<()> {
        boundary("cause_break", || self.coordinator.cause_break())
    }

    /// Step one thread. Completion arrives as `StepComplete`.
    pub fn step(&self, thread_id: u32, kind: StepKind) -> EngineResult<()> {
        boundary("step", || self.coordinator.step(thread_id, kind))
    }

    pub fn terminate(&self) -> EngineResult<()> {
        boundary("terminate", || self.coordinator.terminate())
    }

    /// Delete every bound breakpoint, then detach from the target.
    pub fn detach(&self) -> EngineResult<()> {
        boundary("detach", || self.coordinator.detach(&self.registry))
    }

    /// Record a breakpoint request. It is bound later, explicitly or on resume.
    pub fn create_pending_breakpoint(&self, request: BreakpointRequest) -> EngineResult<Arc<PendingBreakpoint>> {
        boundary("create_pending_breakpoint", || {
            let pending = PendingBreakpoint::new(request, Arc::clone(&self.registry));
            lock(&self.pending).push(Arc::clone(&pending));
            Ok(pending)
        })
    }

    /// Insert the breakpoint into GDB with its condition, pass count and enablement applied.
    pub fn bind_breakpoint(&self, pending: &PendingBreakpoint) -> EngineResult<Arc<BoundBreakpoint>> {
        boundary("bind", || pending.bind())
    }

    pub fn enable_breakpoint(&self, pending: &PendingBreakpoint, enable: bool) -> EngineResult<()> {
        boundary("enable", || pending.enable(enable))
    }

    /// Delete the request and every breakpoint bound from it.
    pub fn delete_breakpoint(&self, pending: &PendingBreakpoint) -> EngineResult<()> {
        boundary("delete", || {
            lock(&self.pending).retain(|p| !std::ptr::eq(Arc::as_ptr(p), pending));
            pending.delete()
        })
    }

    pub fn breakpoint_state(&self, pending: &PendingBreakpoint) -> PendingStatus {
        pending.get_state()
    }

    /// Current hit count. Fails with `Deleted` once the breakpoint is gone.
    pub fn hit_count(&self, bound: &BoundBreakpoint) -> EngineResult<u32> {
        boundary("get_hit_count", || {
            if bound.is_deleted() {
                return Err(EngineError::Deleted);
            }
            Ok(bound.hit_count())
        })
    }

    pub fn set_hit_count(&self, bound: &BoundBreakpoint, hit_count: u32) -> EngineResult<()> {
        boundary("set_hit_count", || bound.set_hit_count(hit_count))
    }

    pub fn set_pass_count(&self, bound: &BoundBreakpoint, pass_count: PassCount) -> EngineResult<()> {
        boundary("set_pass_count", || bound.set_pass_count(pass_count))
    }

    pub fn set_condition(&self, bound: &BoundBreakpoint, condition: Condition) -> EngineResult<()> {
        boundary("set_condition", || bound.set_condition(condition))
    }

    pub fn enum_threads(&self) -> EngineResult<Vec<Arc<ThreadSnapshot>>> {
        boundary("enum_threads", || self.threads.enum_threads())
    }

    /// Frames of `thread_id` for the current stop, memoized until the next one.
    pub fn enum_frame_info(&self, thread_id: u32, flags: FrameInfoFlags) -> EngineResult<Arc<[FrameInfo]>> {
        boundary("enum_frame_info", || {
            let thread = match self.threads.thread(thread_id) {
                Some(thread) => thread,
                None => self
                    .threads
                    .enum_threads()?
                    .into_iter()
                    .find(|t| t.id() == thread_id)
                    .ok_or_else(|| EngineError::InvalidArgument(format!("unknown thread {thread_id}")))?,
            };
            self.threads.enum_frame_info(&thread, flags)
        })
    }

    pub fn thread_properties(&self, thread_id: u32) -> EngineResult<ThreadProperties> {
        boundary("thread_properties", || self.threads.thread_properties(thread_id))
    }

    pub fn set_thread_name(&self, _thread_id: u32, _name: &str) -> EngineResult<()> {
        Err(EngineError::NotImplemented("renaming threads"))
    }

    pub fn evaluate(&self, expression: &str) -> EngineResult<String> {
        boundary("evaluate", || expression::evaluate(&self.session, &GdbExpression::new(expression)))
    }

    /// Evaluate on a worker thread. Cancelling `token` abandons the result.
    pub fn evaluate_async(&self, expression: &str, token: CancelToken) -> EngineResult<EvalTask> {
        boundary("evaluate_async", || {
            EvalTask::spawn(Arc::clone(&self.session), Arc::new(GdbExpression::new(expression)), token)
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.session.tear_down();
        if let Some(handle) = lock(&self.pump).take() {
            if handle.join().is_err() {
                log::error!("GDB event pump panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_converts_panic() {
        let result: EngineResult<()> = boundary("test", || panic!("boom"));
        match result {
            Err(EngineError::Unexpected(message)) => assert_eq!(message, "boom"),
            other => panic!("expected Unexpected, got {other:?}"),
        }
    }

    #[test]
    fn test_boundary_passes_errors_through() {
        let result: EngineResult<()> = boundary("test", || Err(EngineError::NotBound));
        assert!(matches!(result, Err(EngineError::NotBound)));
    }
}
