//! Execution control.
//!
//! `ExecutionCoordinator` owns the run state machine
//! (`Design -> Run <-> Break <-> Step -> Done`), issues interrupt and resume
//! commands, and classifies the stop notifications delivered by GDB.
//!
//! A stop that arrives while an interrupt is pending is the acknowledgement
//! of that interrupt, whatever its reported reason. A breakpoint hit that
//! acknowledges an interrupt is still counted and judged by its policy.

use crate::breakpoint::bound::HitVerdict;
use crate::breakpoint::BreakpointRegistry;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::gdb::{commands, response, GdbClient, GdbConnection, GdbEvent, GdbLauncher, LaunchParams, StopEvent, StopReason};
use crate::session::{InterruptKind, Lifecycle, Session};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionState {
    #[default]
    Design,
    Run,
    Break,
    Step,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Into,
    Over,
    Out,
    Backwards,
}

pub struct ExecutionCoordinator {
    session: Arc<Session>,
}

impl ExecutionCoordinator {
    pub fn new(session: Arc<Session>) -> Arc<Self> {
        Arc::new(Self { session })
    }

    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> ExecutionState {
        self.session.state()
    }

    fn start_gdb(&self, launcher: &dyn GdbLauncher, params: &LaunchParams) -> EngineResult<GdbConnection> {
        if self.session.lifecycle() != Lifecycle::Created {
            return Err(EngineError::InvalidArgument("a debug session was already started".to_string()));
        }
        let connection = launcher.launch(params).map_err(|e| {
            log::error!("GDB launch failed: {e:#}");
            self.session.tear_down();
            EngineError::Launch(e)
        })?;
        let module = params.executable.file_name().map(|n| n.to_string_lossy().into_owned());
        self.session.start(Arc::clone(&connection.client), module)?;
        Ok(connection)
    }

    /// Run a setup command, ending the session if it fails.
    fn setup_command(&self, gdb: &dyn GdbClient, command: &str) -> EngineResult<()> {
        gdb.send_command(command).map(|_| ()).map_err(|e| {
            log::error!("Session setup failed on '{command}': {e:#}");
            if let Err(exit) = gdb.send_command(commands::GDB_EXIT) {
                log::warn!("GDB did not exit cleanly: {exit:#}");
            }
            self.session.tear_down();
            EngineError::Launch(e.context(format!("'{command}' failed")))
        })
    }

    fn load_executable(&self, gdb: &dyn GdbClient, params: &LaunchParams) -> EngineResult<()> {
        let path = params.executable.to_string_lossy();
        if path.is_empty() {
            return Ok(());
        }
        self.setup_command(gdb, &commands::file_exec_and_symbols(&path))
    }

    /// Start GDB for the target and leave it suspended until `resume_process`.
    pub fn launch_suspended(
        &self,
        launcher: &dyn GdbLauncher,
        params: &LaunchParams,
    ) -> EngineResult<Receiver<GdbEvent>> {
        let connection = self.start_gdb(launcher, params)?;
        let gdb = connection.client.as_ref();
        self.load_executable(gdb, params)?;
        if let Some(pid) = params.pid {
            self.setup_command(gdb, &commands::target_attach(pid))?;
        }
        log::info!("Launched {} suspended", params.executable.display());
        self.session.emit(EngineEvent::ProgramCreated);
        Ok(connection.events)
    }

    /// Attach to a running process; the target is stopped afterwards.
    pub fn attach(&self, launcher: &dyn GdbLauncher, params: &LaunchParams) -> EngineResult<Receiver<GdbEvent>> {
        let pid = params
            .pid
            .ok_or_else(|| EngineError::InvalidArgument("attach requires a process id".to_string()))?;
        let connection = self.start_gdb(launcher, params)?;
        let gdb = connection.client.as_ref();
        self.load_executable(gdb, params)?;
        self.setup_command(gdb, &commands::target_attach(pid))?;
        self.session.set_state(ExecutionState::Break);
        log::info!("Attached to process {pid}");
        self.session.emit(EngineEvent::ProgramCreated);
        Ok(connection.events)
    }

    /// First resume after launch; same as continue.
    pub fn resume_process(&self) -> EngineResult<()> {
        self.continue_execution()
    }

    pub fn continue_execution(&self) -> EngineResult<()> {
        let _critical = self.session.enter_critical_region()?;
        match self.state() {
            ExecutionState::Run => Ok(()),
            ExecutionState::Done => Err(EngineError::NoSession),
            ExecutionState::Design | ExecutionState::Break | ExecutionState::Step => {
                self.resume(self.session.gdb()?.as_ref())
            }
        }
    }

    /// Must be called inside the critical region.
    fn resume(&self, gdb: &dyn GdbClient) -> EngineResult<()> {
        let previous = self.state();
        self.session.set_state(ExecutionState::Run);
        if let Err(e) = gdb.add_async_command(commands::EXEC_CONTINUE) {
            self.session.set_state(previous);
            return Err(e.into());
        }
        Ok(())
    }

    /// Resume past a stop the IDE never sees. Runs on the event pump; a
    /// pending interrupt means its owner resumes the target instead.
    fn resume_silently(&self) -> EngineResult<()> {
        let Some(_critical) = self.session.enter_critical_region_from_pump()? else {
            return Ok(());
        };
        if self.state() != ExecutionState::Break {
            return Ok(());
        }
        self.resume(self.session.gdb()?.as_ref())
    }

    /// Run `mutate` only if the target is already stopped. Never interrupts,
    /// so the event pump can use it. `None` when nothing ran.
    pub(crate) fn if_stopped<T>(
        &self,
        mutate: impl FnOnce(&dyn GdbClient) -> anyhow::Result<T>,
    ) -> EngineResult<Option<T>> {
        let Some(_critical) = self.session.enter_critical_region_from_pump()? else {
            return Ok(None);
        };
        if self.state() != ExecutionState::Break {
            return Ok(None);
        }
        let gdb = self.session.gdb()?;
        mutate(gdb.as_ref()).map(Some).map_err(EngineError::Gdb)
    }

    /// Break all: stop a running target and present the stop to the IDE.
    pub fn cause_break(&self) -> EngineResult<()> {
        let _critical = self.session.enter_critical_region()?;
        match self.state() {
            ExecutionState::Run => {
                let _running = self.session.enter_running_gate()?;
                self.interrupt(InterruptKind::BreakAll).map(|_| ())
            }
            ExecutionState::Done => Err(EngineError::NoSession),
            ExecutionState::Design | ExecutionState::Break | ExecutionState::Step => Ok(()),
        }
    }

    /// Interrupt a running target and wait for the acknowledgement.
    ///
    /// `InterruptKind::Step` interrupts an outstanding step, the other kinds
    /// a free run. Caller holds the critical region and the running gate.
    /// Returns whether the target was interrupted.
    fn interrupt(&self, kind: InterruptKind) -> EngineResult<bool> {
        let gdb = self.session.gdb()?;
        {
            let mut run = self.session.run_control();
            let wanted = if kind == InterruptKind::Step { ExecutionState::Step } else { ExecutionState::Run };
            if run.state != wanted {
                return Ok(false);
            }
            run.pending_interrupt = Some(kind);
            self.session.interrupt_ack().reset();
        }
        let config = self.session.config();
        let mut attempts = 0_u32;
        loop {
            if let Err(e) = gdb.add_async_command(commands::EXEC_INTERRUPT) {
                self.session.run_control().pending_interrupt = None;
                return Err(e.into());
            }
            if self.session.interrupt_ack().wait_timeout(config.interrupt_timeout()) {
                return if self.session.is_alive() { Ok(true) } else { Err(EngineError::NoSession) };
            }
            attempts += 1;
            if !self.session.is_alive() {
                return Err(EngineError::NoSession);
            }
            if config.max_interrupt_attempts != 0 && attempts >= config.max_interrupt_attempts {
                self.session.run_control().pending_interrupt = None;
                return Err(EngineError::Timeout("interrupt acknowledgement"));
            }
            log::warn!("Interrupt not acknowledged after {attempts} attempt(s), retrying");
        }
    }

    /// Wait for an outstanding step to stop by itself. False if it is still
    /// running after one interrupt timeout.
    fn settle_step(&self) -> bool {
        let deadline = Instant::now() + self.session.config().interrupt_timeout();
        while self.state() == ExecutionState::Step {
            if Instant::now() >= deadline || !self.session.is_alive() {
                return false;
            }
            thread::sleep(self.session.config().lock_poll());
        }
        true
    }

    /// Run `mutate` with the target verifiably stopped: interrupt if running,
    /// mutate, then resume if it was running.
    ///
    /// A step in flight is given time to finish; one that does not is
    /// interrupted and reported complete, and never resumed here. Neither is
    /// a run interrupted at a breakpoint: the event pump resumes it if the
    /// breakpoint's policy does not present the stop.
    pub fn with_target_stopped<T>(
        &self,
        mutate: impl FnOnce(&dyn GdbClient) -> anyhow::Result<T>,
    ) -> EngineResult<T> {
        let _critical = self.session.enter_critical_region()?;
        let gdb = self.session.gdb()?;
        let _running = self.session.enter_running_gate()?;
        let interrupted = if self.settle_step() {
            self.interrupt(InterruptKind::Internal)?
        } else {
            log::debug!("Step still running, interrupting it for a breakpoint update");
            self.interrupt(InterruptKind::Step)?;
            false
        };
        let result = mutate(gdb.as_ref());
        if interrupted {
            let deferred = std::mem::take(&mut self.session.run_control().deferred_hit);
            if deferred {
                log::debug!("Interrupted at a breakpoint; its policy decides whether to resume");
            } else if let Err(e) = self.resume(gdb.as_ref()) {
                log::warn!("Failed to resume after breakpoint update: {e}");
            }
        }
        result.map_err(EngineError::Gdb)
    }

    pub fn step(&self, thread_id: u32, kind: StepKind) -> EngineResult<()> {
        if kind == StepKind::Backwards {
            return Err(EngineError::NotImplemented("reverse stepping"));
        }
        let _critical = self.session.enter_critical_region()?;
        match self.state() {
            ExecutionState::Break => {}
            ExecutionState::Done => return Err(EngineError::NoSession),
            _ => return Err(EngineError::NotStopped),
        }
        let gdb = self.session.gdb()?;
        let command = match kind {
            StepKind::Into => commands::exec_step(thread_id),
            StepKind::Over => commands::exec_next(thread_id),
            StepKind::Out => {
                let depth = response::parse_depth(&gdb.send_command(&commands::stack_info_depth(thread_id))?)?;
                if depth <= 1 {
                    log::debug!("Outermost frame on thread {thread_id}, stepping over instead of out");
                    commands::exec_next(thread_id)
                } else {
                    commands::exec_finish(thread_id)
                }
            }
            StepKind::Backwards => return Err(EngineError::NotImplemented("reverse stepping")),
        };
        self.session.set_state(ExecutionState::Step);
        if let Err(e) = gdb.add_async_command(&command) {
            self.session.set_state(ExecutionState::Break);
            return Err(e.into());
        }
        Ok(())
    }

    /// Force a break, then end the GDB process.
    pub fn terminate(&self) -> EngineResult<()> {
        if !self.session.is_alive() {
            return Ok(());
        }
        if let Err(e) = self.cause_break() {
            log::warn!("Break before terminate failed: {e}");
        }
        if let Ok(gdb) = self.session.gdb() {
            if let Err(e) = gdb.send_command(commands::GDB_EXIT) {
                log::warn!("GDB did not exit cleanly: {e:#}");
            }
        }
        self.end_session(None);
        Ok(())
    }

    /// Force a break, clear every bound breakpoint and leave the target running.
    pub fn detach(&self, registry: &BreakpointRegistry) -> EngineResult<()> {
        if !self.session.is_alive() {
            return Err(EngineError::NoSession);
        }
        if let Err(e) = self.cause_break() {
            log::warn!("Break before detach failed: {e}");
        }
        registry.clear_all();
        if let Ok(gdb) = self.session.gdb() {
            for command in [commands::TARGET_DETACH, commands::GDB_EXIT] {
                if let Err(e) = gdb.send_command(command) {
                    log::warn!("'{command}' failed during detach: {e:#}");
                }
            }
        }
        self.end_session(None);
        Ok(())
    }

    fn end_session(&self, exit_code: Option<i32>) {
        if self.session.tear_down() {
            self.session.emit(EngineEvent::ProgramDestroyed { exit_code });
        }
    }

    /// Apply one GDB notification. Called from the event pump.
    pub fn handle_event(&self, event: GdbEvent, registry: &BreakpointRegistry) {
        match event {
            GdbEvent::Running { thread_id } => {
                log::debug!("Target running (thread {thread_id:?})");
                let mut run = self.session.run_control();
                if run.state == ExecutionState::Break && run.pending_interrupt.is_none() {
                    run.state = ExecutionState::Run;
                }
            }
            GdbEvent::Stopped(stop) => self.handle_stop(stop, registry),
            GdbEvent::Exited { code } => {
                log::info!("Target exited with code {code:?}");
                self.end_session(code);
            }
        }
    }

    fn handle_stop(&self, stop: StopEvent, registry: &BreakpointRegistry) {
        self.session.bump_stop_generation();
        let (previous, pending) = {
            let mut run = self.session.run_control();
            if run.state == ExecutionState::Done {
                return;
            }
            let previous = run.state;
            run.state = ExecutionState::Break;
            if stop.thread_id.is_some() {
                run.selected_thread = stop.thread_id;
            }
            let pending = run.pending_interrupt.take();
            run.deferred_hit = pending == Some(InterruptKind::Internal)
                && matches!(stop.reason, StopReason::BreakpointHit { .. });
            (previous, pending)
        };
        let thread_id = stop.thread_id;

        if let Some(kind) = pending {
            log::debug!("Interrupt acknowledged by {:?}", stop.reason);
            self.session.interrupt_ack().set();
            if let StopReason::BreakpointHit { gdb_id, times } = stop.reason {
                self.handle_breakpoint_hit(registry, gdb_id, times, thread_id, Some(kind));
            } else {
                self.pass_stop(Some(kind), thread_id);
            }
            return;
        }

        match stop.reason {
            StopReason::BreakpointHit { gdb_id, times } => {
                self.handle_breakpoint_hit(registry, gdb_id, times, thread_id, None);
            }
            StopReason::EndSteppingRange | StopReason::FunctionFinished => {
                self.session.emit(EngineEvent::StepComplete { thread_id });
            }
            StopReason::SignalReceived(signal) if signal == "SIGINT" => {
                self.session.emit(EngineEvent::BreakComplete { thread_id });
            }
            StopReason::SignalReceived(signal) => {
                let description = format!("Signal {signal} received");
                self.session.emit(EngineEvent::Exception { thread_id, description });
            }
            StopReason::Exception(description) => {
                self.session.emit(EngineEvent::Exception { thread_id, description });
            }
            StopReason::Other(reason) => {
                log::debug!("Stopped: {reason}");
                if previous == ExecutionState::Step {
                    self.session.emit(EngineEvent::StepComplete { thread_id });
                } else {
                    self.session.emit(EngineEvent::BreakComplete { thread_id });
                }
            }
        }
    }

    /// Finish a stop nobody asked to see: report what the interrupting caller
    /// was waiting for, or resume past it.
    fn pass_stop(&self, interrupt: Option<InterruptKind>, thread_id: Option<u32>) {
        match interrupt {
            Some(InterruptKind::BreakAll) => self.session.emit(EngineEvent::BreakComplete { thread_id }),
            Some(InterruptKind::Step) => self.session.emit(EngineEvent::StepComplete { thread_id }),
            Some(InterruptKind::Internal) => {}
            None => {
                if let Err(e) = self.resume_silently() {
                    log::warn!("Failed to resume past stop on thread {thread_id:?}: {e}");
                }
            }
        }
    }

    /// `interrupt` is the interrupt this hit acknowledged, if any.
    fn handle_breakpoint_hit(
        &self,
        registry: &BreakpointRegistry,
        gdb_id: u32,
        times: Option<u32>,
        thread_id: Option<u32>,
        interrupt: Option<InterruptKind>,
    ) {
        // An internal interrupt's owner skips its resume, so an unpresented hit resumes here.
        let owner = interrupt.filter(|kind| *kind != InterruptKind::Internal);
        let Some(bp) = registry.find_by_gdb_id(gdb_id) else {
            log::warn!("Stop at unknown breakpoint {gdb_id}");
            if interrupt.is_none() {
                self.session.emit(EngineEvent::BreakComplete { thread_id });
            } else {
                self.pass_stop(owner, thread_id);
            }
            return;
        };
        match bp.process_hit(times) {
            Ok(HitVerdict::Present { hit_count }) => {
                self.session.emit(EngineEvent::BreakpointHit { gdb_id, thread_id, hit_count });
            }
            Ok(HitVerdict::Resume) => self.pass_stop(owner, thread_id),
            Err(EngineError::NoSession) => {}
            Err(e) => {
                log::warn!("Breakpoint {gdb_id} hit handling failed: {e}");
                self.session.emit(EngineEvent::BreakpointHit { gdb_id, thread_id, hit_count: bp.hit_count() });
            }
        }
    }
}
