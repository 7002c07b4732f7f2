//! Registry of bound breakpoints.
//!
//! Maps GDB breakpoint ids and registry indices to `BoundBreakpoint`s and
//! issues the GDB side of every breakpoint mutation, always with the target
//! stopped.

use super::{gdb_ignore_count, BoundBreakpoint, BreakpointLocation, Resolution};
use crate::error::{EngineError, EngineResult};
use crate::execution::ExecutionCoordinator;
use crate::gdb::{commands, response};
use crate::session::Session;
use crate::sync::lock;
use anyhow::Context as _;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Slots {
    /// Index is the remote id; `None` marks a free slot.
    slots: Vec<Option<Arc<BoundBreakpoint>>>,
    by_gdb_id: HashMap<u32, usize>,
}

impl Slots {
    fn allocate(&mut self, bp: &Arc<BoundBreakpoint>, gdb_id: u32) -> usize {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(Arc::clone(bp));
                free
            }
            None => {
                self.slots.push(Some(Arc::clone(bp)));
                self.slots.len() - 1
            }
        };
        self.by_gdb_id.insert(gdb_id, index);
        index
    }

    fn release(&mut self, bp: &BoundBreakpoint) {
        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), bp)))
        {
            self.slots[index] = None;
            self.by_gdb_id.retain(|_, i| *i != index);
        }
    }
}

/// Bound breakpoints of the session, indexed by remote id and by GDB number.
///
/// Remote ids are slot indices and are reused lowest-first after a delete.
pub struct BreakpointRegistry {
    session: Arc<Session>,
    coordinator: Arc<ExecutionCoordinator>,
    inner: Mutex<Slots>,
}

impl BreakpointRegistry {
    pub fn new(coordinator: Arc<ExecutionCoordinator>) -> Arc<Self> {
        Arc::new(Self {
            session: Arc::clone(coordinator.session()),
            coordinator,
            inner: Mutex::new(Slots::default()),
        })
    }

    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub const fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }

    /// Insert `bp` into GDB, apply its condition, ignore count and enabled
    /// state, and give it the lowest free index.
    ///
    /// All of it happens in one stopped-target window, so the first crossing
    /// after the resume already finds the breakpoint registered and armed.
    /// Returns -1 when the session is not running or GDB refuses the location.
    pub fn remote_add(&self, bp: &Arc<BoundBreakpoint>) -> i32 {
        if !self.session.is_alive() {
            log::debug!("Not setting breakpoint {:?}: no running session", bp.location());
            return -1;
        }
        let command = match bp.location() {
            BreakpointLocation::FileLine { file, line } => commands::break_insert_line(file, *line),
            BreakpointLocation::FunctionOffset { function, offset } => {
                commands::break_insert_function(function, *offset)
            }
            other => {
                log::warn!("Unsupported breakpoint location {other:?}");
                return -1;
            }
        };
        let added = self.coordinator.with_target_stopped(|gdb| {
            let text = gdb.send_command(&command)?;
            let inserted = response::parse_break_insert(&text).context("Failed to parse breakpoint insertion")?;
            for setup in bp.setup_commands(inserted.gdb_id) {
                if let Err(e) = gdb.send_command(&setup) {
                    if let Err(cleanup) = gdb.send_command(&commands::break_delete(inserted.gdb_id)) {
                        log::warn!("Failed to remove half-configured breakpoint {}: {cleanup:#}", inserted.gdb_id);
                    }
                    return Err(e.context(format!("'{setup}' failed")));
                }
            }
            let index = lock(&self.inner).allocate(bp, inserted.gdb_id);
            let remote_id = i32::try_from(index).unwrap_or(i32::MAX);
            log::debug!(
                "Breakpoint {} bound at {}:{} (0x{:x}), index {remote_id}",
                inserted.gdb_id,
                inserted.file,
                inserted.line,
                inserted.address
            );
            bp.set_registered(
                inserted.gdb_id,
                remote_id,
                Resolution { file: inserted.file, line: inserted.line, address: inserted.address },
            );
            Ok(remote_id)
        });
        added.unwrap_or_else(|e| {
            log::warn!("Failed to set breakpoint at {:?}: {e}", bp.location());
            -1
        })
    }

    /// Delete `bp` from GDB and free its index. The slot is released even if
    /// GDB rejects the command.
    pub fn remote_delete(&self, bp: &BoundBreakpoint) -> EngineResult<()> {
        let result = match bp.gdb_id() {
            Some(gdb_id) => self.mutate(&[commands::break_delete(gdb_id)]),
            None => Ok(()),
        };
        lock(&self.inner).release(bp);
        result
    }

    /// Enable in GDB. Fails with `NotBound` before the breakpoint has a GDB number.
    pub fn remote_enable(&self, bp: &BoundBreakpoint) -> EngineResult<()> {
        let gdb_id = bp.gdb_id().ok_or(EngineError::NotBound)?;
        self.mutate(&[commands::break_enable(gdb_id)])
    }

    pub fn remote_disable(&self, bp: &BoundBreakpoint) -> EngineResult<()> {
        let gdb_id = bp.gdb_id().ok_or(EngineError::NotBound)?;
        self.mutate(&[commands::break_disable(gdb_id)])
    }

    pub(crate) fn remote_ignore(&self, gdb_id: u32, ignore: i64) -> EngineResult<()> {
        self.mutate(&[commands::break_after(gdb_id, gdb_ignore_count(ignore))])
    }

    /// Re-arm the ignore count after a stop, skipping it if the target has
    /// already been resumed.
    pub(crate) fn rearm_ignore(&self, gdb_id: u32, ignore: i64) -> EngineResult<bool> {
        let command = commands::break_after(gdb_id, gdb_ignore_count(ignore));
        let applied = self.coordinator.if_stopped(|gdb| {
            gdb.send_command(&command).with_context(|| format!("'{command}' failed"))
        })?;
        Ok(applied.is_some())
    }

    /// Run breakpoint commands in one stopped-target window.
    pub(crate) fn mutate(&self, batch: &[String]) -> EngineResult<()> {
        self.coordinator.with_target_stopped(|gdb| {
            for command in batch {
                gdb.send_command(command).with_context(|| format!("'{command}' failed"))?;
            }
            Ok(())
        })
    }

    /// Look up the breakpoint GDB reports as `bkptno`.
    pub fn find_by_gdb_id(&self, gdb_id: u32) -> Option<Arc<BoundBreakpoint>> {
        let slots = lock(&self.inner);
        slots.by_gdb_id.get(&gdb_id).and_then(|&i| slots.slots[i].clone())
    }

    pub fn find_by_remote_id(&self, remote_id: i32) -> Option<Arc<BoundBreakpoint>> {
        let index = usize::try_from(remote_id).ok()?;
        lock(&self.inner).slots.get(index).cloned().flatten()
    }

    /// List registered breakpoints in index order.
    pub fn list(&self) -> Vec<Arc<BoundBreakpoint>> {
        lock(&self.inner).slots.iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete every registered breakpoint.
    pub fn clear_all(&self) {
        for bp in self.list() {
            if let Err(e) = bp.delete() {
                log::warn!("Failed to clear breakpoint {:?}: {e}", bp.gdb_id());
            }
        }
    }
}
