//! Wait channel
//!
//! A bare wait list used as a condition-variable surrogate: no predicate
//! is stored, the caller retests its condition after every wakeup. This is
//! the idiomatic way processes sleep on one another (a parent sleeps on
//! its own wait queue; the child wakes it on exit).

use crate::sched::{self, WaitListId};
use crate::sync::{Spinlock, SpinlockGuard};

/// A list of sleeping tasks.
pub struct WaitChannel {
    waiters: WaitListId,
}

impl WaitChannel {
    /// Register a new, empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiters: sched::wait_list_create(),
        }
    }

    /// Sleep until woken, atomically releasing `guard`.
    ///
    /// The caller's spinlock is re-acquired before returning; the caller
    /// must then retest its condition.
    pub fn sleep<'a, T>(
        &self,
        lock: &'a Spinlock<T>,
        guard: SpinlockGuard<'a, T>,
    ) -> SpinlockGuard<'a, T> {
        let (_, guard) = sched::sleep(self.waiters, 0, lock, guard);
        guard
    }

    /// Wake the highest-priority sleeper.
    pub fn wakeup_one(&self) {
        sched::lock();
        sched::wakeup_one_locked(self.waiters, 0);
        sched::unlock();
    }

    /// Wake every sleeper.
    pub fn wakeup_all(&self) {
        sched::lock();
        sched::wakeup_all_locked(self.waiters, 0);
        sched::unlock();
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitChannel {
    fn drop(&mut self) {
        sched::wait_list_destroy(self.waiters, osmium_abi::Errno::EINVAL.as_neg());
    }
}
