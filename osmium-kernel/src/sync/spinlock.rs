//! Kernel spinlock
//!
//! Test-and-set mutual exclusion with mandatory interrupt disabling on the
//! acquiring CPU, routed through the per-CPU [`irq_save`] nesting so the
//! outermost release restores the prior interrupt state.
//!
//! Recursive acquisition by the same CPU is a kernel bug: the lock records
//! its owner and a ring of caller return addresses on acquire, and prints
//! them before panicking on a double acquire or a wrong-owner release.
//!
//! [`irq_save`]: crate::cpu::irq_save

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use osmium_arch::cpu::save_caller_pcs;

use crate::cpu;

/// Depth of the saved caller-PC ring.
pub const NCALLERPCS: usize = 10;

/// A named, owner-tracking spinlock guarding `T`.
pub struct Spinlock<T> {
    name: &'static str,
    locked: AtomicBool,
    /// Owning CPU id plus one; zero means unowned.
    owner: AtomicUsize,
    /// Return addresses recorded at the latest acquire.
    pcs: UnsafeCell<[usize; NCALLERPCS]>,
    data: UnsafeCell<T>,
}

// SAFETY: The lock serializes all access to `data` and `pcs`.
unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Create a new spinlock. The name shows up in lock diagnostics.
    #[must_use]
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(0),
            pcs: UnsafeCell::new([0; NCALLERPCS]),
            data: UnsafeCell::new(value),
        }
    }

    /// Lock name.
    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Is the executing CPU holding this lock?
    #[must_use]
    pub fn holding(&self) -> bool {
        cpu::irq_save();
        let r = self.locked.load(Ordering::Relaxed)
            && self.owner.load(Ordering::Relaxed) == cpu::id() + 1;
        cpu::irq_restore();
        r
    }

    /// Acquire the lock, disabling interrupts on this CPU.
    ///
    /// Panics if the executing CPU already holds the lock.
    #[must_use]
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        // Disable interrupts first so an ISR on this CPU cannot deadlock
        // against us while we spin.
        cpu::irq_save();

        if self.locked.load(Ordering::Relaxed)
            && self.owner.load(Ordering::Relaxed) == cpu::id() + 1
        {
            self.print_caller_pcs();
            panic!("cpu {} already holding {}", cpu::id(), self.name);
        }

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        self.owner.store(cpu::id() + 1, Ordering::Relaxed);
        // SAFETY: We hold the lock; the ring is ours until release.
        save_caller_pcs(unsafe { &mut *self.pcs.get() });

        SpinlockGuard { lock: self }
    }

    /// Dump the caller-PC ring recorded at the latest acquire.
    fn print_caller_pcs(&self) {
        // SAFETY: Diagnostic read on the panic path; racing with the owner
        // can at worst print a torn address.
        let pcs = unsafe { &*self.pcs.get() };
        for pc in pcs.iter().take_while(|pc| **pc != 0) {
            log::error!("{}: acquired from {:#010x}", self.name, pc);
        }
    }

    fn unlock(&self) {
        if !self.holding() {
            self.print_caller_pcs();
            panic!(
                "cpu {} cannot release {}: held by {}",
                cpu::id(),
                self.name,
                self.owner.load(Ordering::Relaxed).wrapping_sub(1)
            );
        }

        self.owner.store(0, Ordering::Relaxed);
        // SAFETY: Still the owner until the store below.
        unsafe { (*self.pcs.get())[0] = 0 };
        self.locked.store(false, Ordering::Release);

        cpu::irq_restore();
    }
}

/// Guard providing access to the protected data.
///
/// Dropping it releases the lock and undoes one level of interrupt
/// disabling. `!Send`: releasing on another CPU would corrupt both the
/// owner field and that CPU's interrupt nesting.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_guards_data() {
        let _serial = crate::test_sync::guard();
        let lock = Spinlock::new("t_data", 41);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn test_holding_tracks_owner() {
        let _serial = crate::test_sync::guard();
        let lock = Spinlock::new("t_holding", ());
        assert!(!lock.holding());
        let guard = lock.lock();
        assert!(lock.holding());
        drop(guard);
        assert!(!lock.holding());
    }

    #[test]
    #[should_panic(expected = "already holding")]
    fn test_recursive_acquire_panics() {
        let _serial = crate::test_sync::guard();
        let lock = Spinlock::new("t_recursive", ());
        let _guard = lock.lock();
        let _second = lock.lock();
    }
}
