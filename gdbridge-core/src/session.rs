//! Session context.
//!
//! One `Session` exists per debug session and is shared by handle between the
//! breakpoint registry, the execution coordinator, the thread cache and the
//! event pump. It owns the GDB client reference, the execution state and the
//! session-wide gates. Lifecycle: `Created -> Running -> TornDown`.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventSink};
use crate::execution::ExecutionState;
use crate::gdb::GdbClient;
use crate::sync::{lock, Gate, GateGuard, Signal};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterruptKind {
    /// User break-all: the stop is presented to the IDE.
    BreakAll,
    /// Breakpoint mutation: the target is resumed once the edit is done.
    Internal,
    /// Breakpoint mutation during a step that has not finished: the step
    /// ends where the target stopped and is reported complete.
    Step,
}

/// State read and written by both the IDE threads and the event pump.
/// Kept under one mutex so "is it running" and "an interrupt is pending"
/// change together.
#[derive(Debug)]
pub(crate) struct RunControl {
    pub state: ExecutionState,
    pub pending_interrupt: Option<InterruptKind>,
    /// GDB's selected thread, as last reported.
    pub selected_thread: Option<u32>,
    /// An internal interrupt was acknowledged by a breakpoint hit; the event
    /// pump decides whether to resume instead of the interrupting caller.
    pub deferred_hit: bool,
}

/// Shared state of one debug session.
///
/// Gates are taken in the order critical region, condition gate, running
/// gate, always after any per-breakpoint edit gate.
pub struct Session {
    config: EngineConfig,
    lifecycle: Mutex<Lifecycle>,
    gdb: RwLock<Option<Arc<dyn GdbClient>>>,
    module: Mutex<Option<String>>,
    run: Mutex<RunControl>,
    critical: Gate,
    running: Gate,
    condition: Gate,
    interrupt_ack: Signal,
    /// Held across a `-thread-select`, query, restore sequence.
    selection: Mutex<()>,
    stop_generation: AtomicU64,
    events: EventSink,
}

impl Session {
    /// A session in `Created`, with no GDB attached yet.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let events = EventSink::new(config.event_capacity);
        Arc::new(Self {
            config,
            lifecycle: Mutex::new(Lifecycle::Created),
            gdb: RwLock::new(None),
            module: Mutex::new(None),
            run: Mutex::new(RunControl {
                state: ExecutionState::Design,
                pending_interrupt: None,
                selected_thread: None,
                deferred_hit: false,
            }),
            critical: Gate::new("critical region"),
            running: Gate::new("running"),
            condition: Gate::new("condition update"),
            interrupt_ack: Signal::new(),
            selection: Mutex::new(()),
            stop_generation: AtomicU64::new(0),
            events,
        })
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.lifecycle)
    }

    /// True while GDB is attached and the session has not been torn down.
    pub fn is_alive(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    /// Attach a started GDB. Only valid from `Created`.
    pub fn start(&self, gdb: Arc<dyn GdbClient>, module: Option<String>) -> EngineResult<()> {
        let mut lifecycle = lock(&self.lifecycle);
        if *lifecycle != Lifecycle::Created {
            return Err(EngineError::InvalidArgument("session already started".to_string()));
        }
        *self.gdb.write().unwrap_or_else(PoisonError::into_inner) = Some(gdb);
        *lock(&self.module) = module;
        *lifecycle = Lifecycle::Running;
        log::info!("debug session started");
        Ok(())
    }

    /// Drop the GDB reference and release every blocked waiter.
    ///
    /// Safe to call repeatedly and while a break or mutation is mid-flight.
    /// Returns whether this call did the teardown.
    pub fn tear_down(&self) -> bool {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle == Lifecycle::TornDown {
                return false;
            }
            *lifecycle = Lifecycle::TornDown;
        }
        self.gdb.write().unwrap_or_else(PoisonError::into_inner).take();
        {
            let mut run = self.run_control();
            run.state = ExecutionState::Done;
            run.pending_interrupt = None;
            run.deferred_hit = false;
        }
        self.critical.wake_all();
        self.running.wake_all();
        self.condition.wake_all();
        self.interrupt_ack.set();
        self.bump_stop_generation();
        log::info!("debug session torn down");
        true
    }

    /// The attached GDB client, or `NoSession` once torn down.
    pub fn gdb(&self) -> EngineResult<Arc<dyn GdbClient>> {
        self.gdb
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(EngineError::NoSession)
    }

    /// File name of the loaded executable, used as the frame module name.
    pub fn module_name(&self) -> Option<String> {
        lock(&self.module).clone()
    }

    /// Current execution state.
    pub fn state(&self) -> ExecutionState {
        self.run_control().state
    }

    pub(crate) fn run_control(&self) -> MutexGuard<'_, RunControl> {
        lock(&self.run)
    }

    pub(crate) fn set_state(&self, state: ExecutionState) {
        let mut run = self.run_control();
        if run.state != ExecutionState::Done {
            log::debug!("execution state {:?} -> {:?}", run.state, state);
            run.state = state;
        }
    }

    /// GDB's selected thread, as last reported by a stop or thread query.
    pub fn selected_thread(&self) -> Option<u32> {
        self.run_control().selected_thread
    }

    pub(crate) fn set_selected_thread(&self, thread_id: Option<u32>) {
        if thread_id.is_some() {
            self.run_control().selected_thread = thread_id;
        }
    }

    fn acquire<'a>(&'a self, gate: &'a Gate) -> EngineResult<GateGuard<'a>> {
        gate.acquire(self.config.lock_poll(), || self.is_alive()).ok_or(EngineError::NoSession)
    }

    /// Serializes breakpoint mutation against break/resume sequences.
    pub fn enter_critical_region(&self) -> EngineResult<GateGuard<'_>> {
        self.acquire(&self.critical)
    }

    /// Gate acquisition for the event pump. Gives up with `Ok(None)` when an
    /// interrupt is pending, since only the pump can acknowledge it.
    pub(crate) fn acquire_from_pump<'a>(&self, gate: &'a Gate) -> EngineResult<Option<GateGuard<'a>>> {
        let guard = gate.acquire(self.config.lock_poll(), || {
            self.is_alive() && self.run_control().pending_interrupt.is_none()
        });
        match guard {
            Some(guard) => Ok(Some(guard)),
            None if self.is_alive() => {
                log::debug!("event pump yielded gate '{}' to a pending interrupt", gate.name());
                Ok(None)
            }
            None => Err(EngineError::NoSession),
        }
    }

    pub(crate) fn enter_critical_region_from_pump(&self) -> EngineResult<Option<GateGuard<'_>>> {
        self.acquire_from_pump(&self.critical)
    }

    pub(crate) fn enter_condition_gate_from_pump(&self) -> EngineResult<Option<GateGuard<'_>>> {
        self.acquire_from_pump(&self.condition)
    }

    pub(crate) fn enter_running_gate(&self) -> EngineResult<GateGuard<'_>> {
        self.acquire(&self.running)
    }

    pub(crate) fn enter_condition_gate(&self) -> EngineResult<GateGuard<'_>> {
        self.acquire(&self.condition)
    }

    /// Serializes everything that temporarily changes GDB's selected thread.
    pub(crate) fn lock_thread_selection(&self) -> MutexGuard<'_, ()> {
        lock(&self.selection)
    }

    pub(crate) const fn interrupt_ack(&self) -> &Signal {
        &self.interrupt_ack
    }

    /// Incremented on every stop; cached frame info from an older generation is stale.
    pub fn stop_generation(&self) -> u64 {
        self.stop_generation.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_stop_generation(&self) {
        self.stop_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// A receiver for every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.events.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::mock::MockGdb;

    #[test]
    fn test_lifecycle() {
        let session = Session::new(EngineConfig::default());
        assert_eq!(session.lifecycle(), Lifecycle::Created);
        assert!(matches!(session.gdb(), Err(EngineError::NoSession)));

        let (gdb, _events) = MockGdb::new();
        session.start(gdb.clone(), None).unwrap();
        assert!(session.is_alive());
        assert!(session.start(gdb, None).is_err());

        session.tear_down();
        session.tear_down();
        assert_eq!(session.lifecycle(), Lifecycle::TornDown);
        assert_eq!(session.state(), ExecutionState::Done);
        assert!(session.gdb().is_err());
    }

    #[test]
    fn test_critical_region_refused_after_teardown() {
        let session = Session::new(EngineConfig::default());
        let (gdb, _events) = MockGdb::new();
        session.start(gdb, None).unwrap();
        {
            let _region = session.enter_critical_region().unwrap();
        }
        let held = session.enter_critical_region().unwrap();
        let waiter = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || session.enter_critical_region().is_err())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        session.tear_down();
        assert!(waiter.join().unwrap());
        drop(held);
    }

    #[test]
    fn test_done_state_is_terminal() {
        let session = Session::new(EngineConfig::default());
        session.tear_down();
        session.set_state(ExecutionState::Run);
        assert_eq!(session.state(), ExecutionState::Done);
    }
}
