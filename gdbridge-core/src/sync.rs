//! Blocking coordination primitives.
//!
//! `Gate` is a binary semaphore whose waiters wake periodically to re-check
//! whether the session is still alive, so tearing the session down releases
//! every blocked caller. `Signal` is a manual-reset event.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A named binary gate. At most one [`GateGuard`] exists per gate at a time.
pub struct Gate {
    name: &'static str,
    held: Mutex<bool>,
    released: Condvar,
}

/// Holding this keeps the gate closed; dropping it reopens the gate.
#[must_use = "the gate reopens as soon as the guard is dropped"]
pub struct GateGuard<'a> {
    gate: &'a Gate,
}

impl Gate {
    pub const fn new(name: &'static str) -> Self {
        Self { name, held: Mutex::new(false), released: Condvar::new() }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Block until the gate is free, waking every `poll` to consult `alive`.
    ///
    /// Returns `None` once `alive` reports false while the gate is still taken.
    pub fn acquire(&self, poll: Duration, alive: impl Fn() -> bool) -> Option<GateGuard<'_>> {
        let mut held = lock(&self.held);
        loop {
            if !*held {
                *held = true;
                return Some(GateGuard { gate: self });
            }
            if !alive() {
                log::debug!("gate '{}' abandoned: session gone", self.name);
                return None;
            }
            held = self
                .released
                .wait_timeout(held, poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Take the gate only if it is free right now.
    pub fn try_acquire(&self) -> Option<GateGuard<'_>> {
        let mut held = lock(&self.held);
        if *held {
            None
        } else {
            *held = true;
            Some(GateGuard { gate: self })
        }
    }

    pub fn is_held(&self) -> bool {
        *lock(&self.held)
    }

    /// Wake all waiters so they re-evaluate their liveness check.
    pub fn wake_all(&self) {
        self.released.notify_all();
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.gate.held) = false;
        self.gate.released.notify_one();
    }
}

/// Manual-reset event: stays set until [`Signal::reset`] is called.
#[derive(Default)]
pub struct Signal {
    set: Mutex<bool>,
    changed: Condvar,
}

impl Signal {
    pub const fn new() -> Self {
        Self { set: Mutex::new(false), changed: Condvar::new() }
    }

    pub fn set(&self) {
        *lock(&self.set) = true;
        self.changed.notify_all();
    }

    pub fn reset(&self) {
        *lock(&self.set) = false;
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.set)
    }

    /// Wait up to `timeout` for the signal. Returns whether it was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = lock(&self.set);
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            set = self
                .changed
                .wait_timeout(set, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Wake waiters without setting the signal.
    pub fn wake_all(&self) {
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_gate_is_exclusive() {
        let gate = Gate::new("test");
        let guard = gate.try_acquire();
        assert!(guard.is_some());
        assert!(gate.try_acquire().is_none());
        drop(guard);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn test_gate_waiter_gives_up_when_session_dies() {
        let gate = Arc::new(Gate::new("critical"));
        let alive = Arc::new(AtomicBool::new(true));
        let _held = gate.try_acquire().unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            let alive = Arc::clone(&alive);
            thread::spawn(move || {
                gate.acquire(Duration::from_millis(5), || alive.load(Ordering::SeqCst)).is_some()
            })
        };
        thread::sleep(Duration::from_millis(20));
        alive.store(false, Ordering::SeqCst);
        gate.wake_all();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_gate_handoff() {
        let gate = Arc::new(Gate::new("handoff"));
        let guard = gate.try_acquire().unwrap();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.acquire(Duration::from_millis(5), || true).is_some())
        };
        thread::sleep(Duration::from_millis(10));
        drop(guard);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_signal_wait() {
        let signal = Arc::new(Signal::new());
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        let setter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.set())
        };
        assert!(signal.wait_timeout(Duration::from_secs(2)));
        setter.join().unwrap();
        signal.reset();
        assert!(!signal.is_set());
    }
}
