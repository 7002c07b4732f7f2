//! A breakpoint as the IDE requested it.

use super::{BoundBreakpoint, BreakpointRegistry, BreakpointRequest};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::sync::lock;
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Enabled,
    Disabled,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingStatus {
    pub state: PendingState,
    pub bound: bool,
}

struct PendingInner {
    enabled: bool,
    deleted: bool,
    bound: Vec<Arc<BoundBreakpoint>>,
}

pub struct PendingBreakpoint {
    request: BreakpointRequest,
    registry: Arc<BreakpointRegistry>,
    this: Weak<PendingBreakpoint>,
    inner: Mutex<PendingInner>,
}

impl PendingBreakpoint {
    pub fn new(request: BreakpointRequest, registry: Arc<BreakpointRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner: Mutex::new(PendingInner { enabled: request.enabled, deleted: false, bound: Vec::new() }),
            request,
            registry,
            this: this.clone(),
        })
    }

    pub const fn request(&self) -> &BreakpointRequest {
        &self.request
    }

    pub fn is_deleted(&self) -> bool {
        lock(&self.inner).deleted
    }

    pub fn can_bind(&self) -> bool {
        !self.is_deleted() && self.registry.session().is_alive() && self.request.location.is_bindable()
    }

    /// Bind to a single location, applying the request's pass count,
    /// condition and enabled state before the target can cross it. Binding
    /// an already bound breakpoint returns the existing one.
    pub fn bind(&self) -> EngineResult<Arc<BoundBreakpoint>> {
        if !self.can_bind() {
            return Err(EngineError::NotBound);
        }
        let enabled = {
            let inner = lock(&self.inner);
            if let Some(existing) = inner.bound.first() {
                return Ok(Arc::clone(existing));
            }
            inner.enabled
        };

        let bound = BoundBreakpoint::new(&self.registry, self.this.clone(), &self.request, enabled);
        let remote_id = self.registry.remote_add(&bound);
        if remote_id < 0 {
            return Err(EngineError::NotBound);
        }
        {
            let mut inner = lock(&self.inner);
            if inner.deleted {
                drop(inner);
                bound.delete()?;
                return Err(EngineError::NotBound);
            }
            inner.bound.push(Arc::clone(&bound));
        }
        if let Some(gdb_id) = bound.gdb_id() {
            self.registry.session().emit(EngineEvent::BreakpointBound { remote_id, gdb_id });
        }
        Ok(bound)
    }

    pub fn enable(&self, enable: bool) -> EngineResult<()> {
        let bound = {
            let mut inner = lock(&self.inner);
            if inner.deleted {
                return Err(EngineError::Deleted);
            }
            inner.enabled = enable;
            inner.bound.clone()
        };
        bound.iter().try_for_each(|bp| bp.enable(enable))
    }

    /// Delete this breakpoint and every breakpoint bound from it.
    pub fn delete(&self) -> EngineResult<()> {
        let bound = {
            let mut inner = lock(&self.inner);
            inner.deleted = true;
            std::mem::take(&mut inner.bound)
        };
        let mut first_error = None;
        for bp in bound {
            if let Err(e) = bp.delete() {
                log::warn!("Failed to delete bound breakpoint {:?}: {e}", bp.gdb_id());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn get_state(&self) -> PendingStatus {
        let inner = lock(&self.inner);
        let state = if inner.deleted {
            PendingState::Deleted
        } else if inner.enabled {
            PendingState::Enabled
        } else {
            PendingState::Disabled
        };
        PendingStatus { state, bound: !inner.bound.is_empty() }
    }

    pub fn enum_bound_breakpoints(&self) -> Vec<Arc<BoundBreakpoint>> {
        lock(&self.inner).bound.clone()
    }

    pub(crate) fn remove_bound(&self, bp: &BoundBreakpoint) {
        lock(&self.inner).bound.retain(|b| !std::ptr::eq(Arc::as_ptr(b), bp));
    }
}
