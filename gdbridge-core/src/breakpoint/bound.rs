//! A breakpoint resolved to a live GDB breakpoint.

use super::{gdb_ignore_count, BreakpointLocation, BreakpointRegistry, BreakpointRequest, Condition, PassCount, PendingBreakpoint};
use crate::error::{EngineError, EngineResult};
use crate::expression::{Evaluatable, GdbExpression};
use crate::gdb::commands;
use crate::session::Session;
use crate::sync::{lock, Gate, GateGuard};
use std::sync::{Arc, Mutex, Weak};

/// Where GDB actually placed the breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub file: String,
    pub line: u32,
    pub address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundState {
    Active,
    Disabled,
    Deleted,
}

/// What the coordinator does with a reported crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HitVerdict {
    Present { hit_count: u32 },
    Resume,
}

#[derive(Debug)]
struct BoundInner {
    gdb_id: Option<u32>,
    remote_id: i32,
    resolution: Option<Resolution>,
    enabled: bool,
    deleted: bool,
    hit_count: u32,
    /// GDB's crossing count at the last reported stop.
    last_times: u32,
    pass_count: PassCount,
    condition: Condition,
    /// Last value of a `WhenChanged` expression; `None` until the first hit.
    previous_value: Option<String>,
    blocked_pass_count: bool,
    blocked_conditional: bool,
    ignore_count: i64,
    /// The `-break-after` count GDB still holds; it runs down to zero by the next reported stop.
    armed_skip: u32,
}

impl BoundInner {
    fn arm(&mut self, ignore: i64) {
        self.ignore_count = ignore;
        self.armed_skip = gdb_ignore_count(ignore);
    }
}

pub struct BoundBreakpoint {
    session: Arc<Session>,
    registry: Weak<BreakpointRegistry>,
    parent: Weak<PendingBreakpoint>,
    location: BreakpointLocation,
    edit: Gate,
    inner: Mutex<BoundInner>,
}

/// Exclusive edit access to one breakpoint.
struct EditGuard<'a> {
    bp: &'a BoundBreakpoint,
    _gate: GateGuard<'a>,
}

impl Drop for EditGuard<'_> {
    fn drop(&mut self) {
        let mut inner = lock(&self.bp.inner);
        inner.blocked_pass_count = false;
        inner.blocked_conditional = false;
    }
}

impl BoundBreakpoint {
    /// An unregistered breakpoint carrying the request's pass count,
    /// condition and enabled state. `BreakpointRegistry::remote_add` gives it
    /// a GDB id and applies that configuration in the same stopped window.
    pub(crate) fn new(
        registry: &Arc<BreakpointRegistry>,
        parent: Weak<PendingBreakpoint>,
        request: &BreakpointRequest,
        enabled: bool,
    ) -> Arc<Self> {
        let mut inner = BoundInner {
            gdb_id: None,
            remote_id: -1,
            resolution: None,
            enabled,
            deleted: false,
            hit_count: 0,
            last_times: 0,
            pass_count: request.pass_count,
            condition: request.condition.clone(),
            previous_value: None,
            blocked_pass_count: false,
            blocked_conditional: false,
            ignore_count: 1,
            armed_skip: 0,
        };
        if !inner.condition.is_when_changed() {
            inner.arm(request.pass_count.ignore_count(0));
        }
        Arc::new(Self {
            session: Arc::clone(registry.session()),
            registry: Arc::downgrade(registry),
            parent,
            location: request.location.clone(),
            edit: Gate::new("breakpoint edit"),
            inner: Mutex::new(inner),
        })
    }

    /// Commands that bring a freshly inserted GDB breakpoint in line with
    /// the configured condition, ignore count and enabled state.
    pub(crate) fn setup_commands(&self, gdb_id: u32) -> Vec<String> {
        let inner = lock(&self.inner);
        let mut batch = Vec::new();
        if let Condition::WhenTrue(expression) = &inner.condition {
            batch.push(commands::break_condition(gdb_id, expression));
        }
        if inner.armed_skip > 0 {
            batch.push(commands::break_after(gdb_id, inner.armed_skip));
        }
        if !inner.enabled {
            batch.push(commands::break_disable(gdb_id));
        }
        batch
    }

    fn registry(&self) -> EngineResult<Arc<BreakpointRegistry>> {
        self.registry.upgrade().ok_or(EngineError::NoSession)
    }

    /// Take the per-breakpoint lock, marking which kind of edit holds it.
    fn lock_for(&self, pass_count: bool, condition: bool) -> EngineResult<EditGuard<'_>> {
        let gate = self
            .edit
            .acquire(self.session.config().lock_poll(), || self.session.is_alive())
            .ok_or(EngineError::NoSession)?;
        let mut inner = lock(&self.inner);
        inner.blocked_pass_count = pass_count;
        inner.blocked_conditional = condition;
        drop(inner);
        Ok(EditGuard { bp: self, _gate: gate })
    }

    /// The bound GDB id, failing for deleted or never-registered breakpoints.
    fn live_gdb_id(inner: &BoundInner) -> EngineResult<u32> {
        if inner.deleted {
            return Err(EngineError::Deleted);
        }
        inner.gdb_id.ok_or(EngineError::NotBound)
    }

    pub(crate) fn set_registered(&self, gdb_id: u32, remote_id: i32, resolution: Resolution) {
        let mut inner = lock(&self.inner);
        inner.gdb_id = Some(gdb_id);
        inner.remote_id = remote_id;
        inner.resolution = Some(resolution);
    }

    pub const fn location(&self) -> &BreakpointLocation {
        &self.location
    }

    #[cfg(test)]
    pub(crate) const fn edit_gate(&self) -> &Gate {
        &self.edit
    }

    pub fn gdb_id(&self) -> Option<u32> {
        lock(&self.inner).gdb_id
    }

    /// Registry index, or -1 when not registered.
    pub fn remote_id(&self) -> i32 {
        lock(&self.inner).remote_id
    }

    pub fn resolution(&self) -> Option<Resolution> {
        lock(&self.inner).resolution.clone()
    }

    pub fn pending_breakpoint(&self) -> Option<Arc<PendingBreakpoint>> {
        self.parent.upgrade()
    }

    pub fn state(&self) -> BoundState {
        let inner = lock(&self.inner);
        if inner.deleted {
            BoundState::Deleted
        } else if inner.enabled {
            BoundState::Active
        } else {
            BoundState::Disabled
        }
    }

    pub fn is_deleted(&self) -> bool {
        lock(&self.inner).deleted
    }

    pub fn hit_count(&self) -> u32 {
        lock(&self.inner).hit_count
    }

    pub fn pass_count(&self) -> PassCount {
        lock(&self.inner).pass_count
    }

    pub fn condition(&self) -> Condition {
        lock(&self.inner).condition.clone()
    }

    /// The ignore value last applied to GDB.
    pub fn ignore_count(&self) -> i64 {
        lock(&self.inner).ignore_count
    }

    /// `(blocked_pass_count, blocked_conditional)` for an edit in progress.
    pub fn edit_in_progress(&self) -> (bool, bool) {
        let inner = lock(&self.inner);
        (inner.blocked_pass_count, inner.blocked_conditional)
    }

    pub fn set_pass_count(&self, pass_count: PassCount) -> EngineResult<()> {
        let _edit = self.lock_for(true, false)?;
        let (gdb_id, ignore) = {
            let mut inner = lock(&self.inner);
            let gdb_id = Self::live_gdb_id(&inner)?;
            inner.pass_count = pass_count;
            if inner.condition.is_when_changed() {
                log::debug!("breakpoint {gdb_id}: pass count {pass_count:?} deferred while watching for changes");
                return Ok(());
            }
            (gdb_id, pass_count.ignore_count(inner.hit_count))
        };
        self.registry()?.remote_ignore(gdb_id, ignore)?;
        lock(&self.inner).arm(ignore);
        Ok(())
    }

    pub fn set_hit_count(&self, hit_count: u32) -> EngineResult<()> {
        let _edit = self.lock_for(true, false)?;
        let (gdb_id, ignore) = {
            let mut inner = lock(&self.inner);
            let gdb_id = Self::live_gdb_id(&inner)?;
            inner.hit_count = hit_count;
            if inner.condition.is_when_changed() {
                return Ok(());
            }
            (gdb_id, inner.pass_count.ignore_count(hit_count))
        };
        self.registry()?.remote_ignore(gdb_id, ignore)?;
        lock(&self.inner).arm(ignore);
        Ok(())
    }

    pub fn set_condition(&self, condition: Condition) -> EngineResult<()> {
        let _edit = self.lock_for(false, true)?;
        let _condition_gate = self.session.enter_condition_gate()?;
        let (gdb_id, leaving_change_mode, restored_ignore) = {
            let inner = lock(&self.inner);
            let gdb_id = Self::live_gdb_id(&inner)?;
            (
                gdb_id,
                inner.condition.is_when_changed() && !condition.is_when_changed(),
                inner.pass_count.ignore_count(inner.hit_count),
            )
        };

        let mut batch = vec![commands::break_condition(gdb_id, "")];
        let mut ignore = None;
        match &condition {
            // Stop on every crossing; the engine compares values itself.
            Condition::WhenChanged(_) => {
                batch.push(commands::break_after(gdb_id, gdb_ignore_count(1)));
                ignore = Some(1);
            }
            Condition::WhenTrue(expr) => batch[0] = commands::break_condition(gdb_id, expr),
            Condition::None => {}
        }
        if leaving_change_mode {
            batch.push(commands::break_after(gdb_id, gdb_ignore_count(restored_ignore)));
            ignore = Some(restored_ignore);
        }
        self.registry()?.mutate(&batch)?;

        let mut inner = lock(&self.inner);
        inner.condition = condition;
        inner.previous_value = None;
        if let Some(ignore) = ignore {
            inner.arm(ignore);
        }
        Ok(())
    }

    pub fn enable(&self, enable: bool) -> EngineResult<()> {
        let _edit = self.lock_for(false, false)?;
        {
            let inner = lock(&self.inner);
            Self::live_gdb_id(&inner)?;
            if inner.enabled == enable {
                return Ok(());
            }
        }
        let registry = self.registry()?;
        if enable {
            registry.remote_enable(self)?;
        } else {
            registry.remote_disable(self)?;
        }
        lock(&self.inner).enabled = enable;
        Ok(())
    }

    /// Remove from GDB, the registry and the parent. Local deletion always
    /// happens, even when GDB is already gone.
    pub fn delete(&self) -> EngineResult<()> {
        let _edit = self.lock_for(false, false)?;
        if self.is_deleted() {
            return Ok(());
        }
        if let Ok(registry) = self.registry() {
            if let Err(e) = registry.remote_delete(self) {
                log::warn!("Breakpoint {:?} removed locally, GDB delete failed: {e}", self.gdb_id());
            }
        }
        {
            let mut inner = lock(&self.inner);
            inner.deleted = true;
            inner.gdb_id = None;
            inner.remote_id = -1;
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.remove_bound(self);
        }
        Ok(())
    }

    /// Without GDB's `times`, a reported stop stands for the crossings GDB
    /// skipped under `-break-after` plus the stop itself.
    fn advance_hit_count(inner: &mut BoundInner, times: Option<u32>) -> u32 {
        let delta = match times {
            Some(times) if times > inner.last_times => times - inner.last_times,
            Some(_) => 1,
            None => inner.armed_skip.saturating_add(1),
        };
        if let Some(times) = times {
            inner.last_times = times;
        }
        inner.armed_skip = 0;
        inner.hit_count = inner.hit_count.saturating_add(delta);
        inner.hit_count
    }

    /// Count a crossing reported by GDB. `times` is GDB's own crossing count.
    pub fn record_hit(&self, times: Option<u32>) -> EngineResult<u32> {
        let _edit = self.lock_for(false, false)?;
        Ok(Self::advance_hit_count(&mut lock(&self.inner), times))
    }

    /// Count a crossing and decide whether the IDE sees it, re-arming the
    /// ignore count for the next stop. Called from the event pump.
    ///
    /// If an interrupt becomes pending while waiting for the breakpoint the
    /// crossing is resumed uncounted; GDB's `times` makes it up at the next stop.
    pub(crate) fn process_hit(&self, times: Option<u32>) -> EngineResult<HitVerdict> {
        let Some(_edit) = self.session.acquire_from_pump(&self.edit)? else {
            return Ok(HitVerdict::Resume);
        };
        let (hit_count, gdb_id, pass_count, condition) = {
            let mut inner = lock(&self.inner);
            let hit_count = Self::advance_hit_count(&mut inner, times);
            if inner.deleted || !inner.enabled {
                return Ok(HitVerdict::Resume);
            }
            (hit_count, Self::live_gdb_id(&inner)?, inner.pass_count, inner.condition.clone())
        };

        if let Condition::WhenChanged(expression) = condition {
            let Some(_condition_gate) = self.session.enter_condition_gate_from_pump()? else {
                return Ok(HitVerdict::Resume);
            };
            let gdb = self.session.gdb()?;
            let value = match GdbExpression::new(expression).evaluate(gdb.as_ref()) {
                Ok(value) => value,
                Err(e) => {
                    log::warn!("Breakpoint {gdb_id}: watched expression failed, stopping: {e:#}");
                    return Ok(HitVerdict::Present { hit_count });
                }
            };
            let previous = lock(&self.inner).previous_value.replace(value.clone());
            return Ok(match previous {
                Some(previous) if previous != value => {
                    log::debug!("Breakpoint {gdb_id}: watched value {previous} -> {value}");
                    HitVerdict::Present { hit_count }
                }
                _ => HitVerdict::Resume,
            });
        }

        let ignore = pass_count.ignore_count(hit_count);
        if gdb_ignore_count(ignore) > 0 {
            match self.registry()?.rearm_ignore(gdb_id, ignore) {
                Ok(true) => lock(&self.inner).arm(ignore),
                Ok(false) => log::debug!("Breakpoint {gdb_id}: target already resumed, ignore count not re-armed"),
                Err(e) => log::warn!("Breakpoint {gdb_id}: failed to re-arm ignore count: {e}"),
            }
        } else {
            lock(&self.inner).ignore_count = ignore;
        }

        if pass_count.is_satisfied(hit_count) {
            Ok(HitVerdict::Present { hit_count })
        } else {
            log::debug!("Breakpoint {gdb_id}: hit {hit_count} does not satisfy {pass_count:?}");
            Ok(HitVerdict::Resume)
        }
    }
}

impl std::fmt::Debug for BoundBreakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundBreakpoint")
            .field("location", &self.location)
            .field("inner", &*lock(&self.inner))
            .finish_non_exhaustive()
    }
}
