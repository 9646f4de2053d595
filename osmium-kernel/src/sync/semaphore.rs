//! Counting semaphore
//!
//! A non-negative counter plus a sleeper list. `put` increments and wakes
//! one sleeper when the counter was zero; `get` decrements or sleeps with
//! an optional timeout. The bottom-half interrupt threads park on one of
//! these between hard-IRQ notifications.

use osmium_abi::Errno;

use crate::sched::{self, WaitListId};
use crate::sync::Spinlock;

/// Wait for the semaphore indefinitely.
pub const NO_TIMEOUT: u64 = 0;

/// A counting semaphore.
pub struct Semaphore {
    count: Spinlock<u32>,
    waiters: WaitListId,
}

impl Semaphore {
    /// Create a semaphore with an initial token count.
    #[must_use]
    pub fn new(initial: u32) -> Self {
        Self {
            count: Spinlock::new("semaphore", initial),
            waiters: sched::wait_list_create(),
        }
    }

    /// Post one token, waking one sleeper if the counter was empty.
    ///
    /// Safe to call from hard-IRQ context: the wakeup defers any
    /// preemption while ISR-nested.
    pub fn put(&self) {
        let mut count = self.count.lock();
        *count += 1;

        if *count == 1 {
            sched::lock();
            sched::wakeup_one_locked(self.waiters, 0);
            sched::unlock();
        }
    }

    /// Take one token, sleeping while the counter is zero.
    ///
    /// `timeout_ticks` of zero waits forever. On timeout the counter is
    /// untouched and `-ETIMEDOUT` comes back as the error.
    pub fn get(&self, timeout_ticks: u64) -> Result<(), Errno> {
        let mut guard = self.count.lock();

        while *guard == 0 {
            let (result, reacquired) =
                sched::sleep(self.waiters, timeout_ticks, &self.count, guard);
            guard = reacquired;

            if result < 0 {
                return Err(Errno::from_neg(result).unwrap_or(Errno::EINVAL));
            }
        }

        *guard -= 1;
        Ok(())
    }

    /// Take one token without sleeping.
    pub fn try_get(&self) -> Result<(), Errno> {
        let mut guard = self.count.lock();
        if *guard == 0 {
            return Err(Errno::EAGAIN);
        }
        *guard -= 1;
        Ok(())
    }

    /// Current token count (racy; diagnostics only).
    #[must_use]
    pub fn value(&self) -> u32 {
        *self.count.lock()
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        sched::wait_list_destroy(self.waiters, Errno::EINVAL.as_neg());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_get_counts_tokens() {
        let _serial = crate::test_sync::guard();
        crate::sched::init();
        let sem = Semaphore::new(2);

        assert!(sem.try_get().is_ok());
        assert!(sem.try_get().is_ok());
        assert_eq!(sem.try_get(), Err(Errno::EAGAIN));
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn test_put_replenishes() {
        let _serial = crate::test_sync::guard();
        crate::sched::init();
        let sem = Semaphore::new(0);

        assert_eq!(sem.try_get(), Err(Errno::EAGAIN));
        sem.put();
        assert_eq!(sem.value(), 1);
        assert!(sem.try_get().is_ok());
        assert_eq!(sem.value(), 0);
    }
}
