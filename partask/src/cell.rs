//!
//! Synchronized Cell
//!
//! A mutex+condvar-backed mutable cell with a guarded, transactional update
//! contract: the read path (`value`) never blocks, the write path
//! (`guarded_access`/`change`) is serialized, and waiters wake only when the
//! condition they are waiting for might now hold.
//!

use std::cell::Cell;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::PartaskError;

thread_local! {
    /// Reentrant depth counter: >0 while this thread is inside a
    /// `guarded_access`/`change`/`timed_access` closure. `join` consults
    /// this to detect and reject the forbidden "join while holding a
    /// synchronized cell's critical section" pattern from §4.4.
    static CRITICAL_SECTION_DEPTH: Cell<u32> = const { Cell::new(0) };
}

pub(crate) fn in_critical_section() -> bool {
    CRITICAL_SECTION_DEPTH.with(|d| d.get() > 0)
}

struct CriticalSectionGuard;

impl CriticalSectionGuard {
    fn enter() -> Self {
        CRITICAL_SECTION_DEPTH.with(|d| d.set(d.get() + 1));
        CriticalSectionGuard
    }
}

impl Drop for CriticalSectionGuard {
    fn drop(&mut self) {
        CRITICAL_SECTION_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

pub struct SyncCell<T> {
    state: Mutex<T>,
    changed: Condvar,
}

impl<T: Clone> SyncCell<T> {
    pub fn new(initial: T) -> Self {
        SyncCell {
            state: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    /// Unsynchronized-feeling snapshot read: takes the lock only long enough
    /// to clone the current value, with no guarantee of freshness by the
    /// time the caller observes it.
    pub fn value(&self) -> T {
        self.state.lock().unwrap().clone()
    }

    /// Atomically evaluate `f(&current)`. `None` means "not yet" — release
    /// the lock, wait on the condition, and retry. `Some((result, new))`
    /// installs `new`, broadcasts, and returns `result`.
    pub fn guarded_access<R>(&self, mut f: impl FnMut(&T) -> Option<(R, T)>) -> R {
        let _critical = CriticalSectionGuard::enter();
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some((result, new)) = f(&guard) {
                *guard = new;
                self.changed.notify_all();
                return result;
            }
            guard = self.changed.wait(guard).unwrap();
        }
    }

    /// Unconditional update: shorthand for `guarded_access` with a function
    /// that always succeeds.
    pub fn change(&self, f: impl FnOnce(&T) -> T) {
        let _critical = CriticalSectionGuard::enter();
        let mut guard = self.state.lock().unwrap();
        *guard = f(&guard);
        self.changed.notify_all();
    }

    /// As `guarded_access`, but abandons after `deadline` with
    /// `PartaskError::Unavailable` rather than waiting forever.
    pub fn timed_access<R>(
        &self,
        deadline: Instant,
        mut f: impl FnMut(&T) -> Option<(R, T)>,
    ) -> Result<R, PartaskError> {
        let _critical = CriticalSectionGuard::enter();
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some((result, new)) = f(&guard) {
                *guard = new;
                self.changed.notify_all();
                return Ok(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PartaskError::Unavailable);
            }
            let (next_guard, timeout) = self
                .changed
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = next_guard;
            if timeout.timed_out() {
                // One last check: we may have been woken exactly as the
                // deadline passed.
                if let Some((result, new)) = f(&guard) {
                    *guard = new;
                    self.changed.notify_all();
                    return Ok(result);
                }
                return Err(PartaskError::Unavailable);
            }
        }
    }

    /// Convenience: `timed_access` with a relative timeout from now.
    pub fn timed_access_for<R>(
        &self,
        timeout: Duration,
        f: impl FnMut(&T) -> Option<(R, T)>,
    ) -> Result<R, PartaskError> {
        self.timed_access(Instant::now() + timeout, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn value_reads_latest_snapshot() {
        let cell = SyncCell::new(0i32);
        cell.change(|_| 5);
        assert_eq!(cell.value(), 5);
    }

    #[test]
    fn guarded_access_waits_for_condition() {
        let cell = Arc::new(SyncCell::new(0i32));
        let waiter = {
            let cell = cell.clone();
            thread::spawn(move || {
                cell.guarded_access(|v| if *v >= 10 { Some(((), *v)) } else { None })
            })
        };

        thread::sleep(Duration::from_millis(10));
        cell.change(|_| 10);
        waiter.join().unwrap();
        assert_eq!(cell.value(), 10);
    }

    #[test]
    fn timed_access_reports_unavailable_on_deadline() {
        let cell = SyncCell::new(0i32);
        let result = cell.timed_access_for(Duration::from_millis(20), |v| {
            if *v > 0 {
                Some(((), *v))
            } else {
                None
            }
        });
        assert!(matches!(result, Err(PartaskError::Unavailable)));
    }

    #[test]
    fn timed_access_succeeds_before_deadline() {
        let cell = Arc::new(SyncCell::new(0i32));
        {
            let cell = cell.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                cell.change(|_| 42);
            });
        }
        let result = cell.timed_access_for(Duration::from_millis(500), |v| {
            if *v == 42 {
                Some((*v, *v))
            } else {
                None
            }
        });
        assert_eq!(result.unwrap(), 42);
    }
}
