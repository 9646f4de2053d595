//! # osmium-kernel
//!
//! A small preemptive SMP kernel for ARMv7-A. The core is the task and
//! process machinery: per-priority run queues with delayed preemption,
//! spinlocks with interrupt-disable nesting, wait channels, semaphores
//! and mailboxes over the scheduler's sleep/wakeup primitives, threaded
//! interrupt dispatch, a slab-backed object layer, and the Unix process
//! lifecycle (ELF load, fork with copy-on-write, wait, zombies,
//! reparenting to init).
//!
//! The crate builds for the host as well: architecture glue compiles to
//! inert fallbacks there, which is how the unit tests run.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod cpu;
pub mod elf;
pub mod interrupt;
pub mod logging;
pub mod mm;
pub mod process;
pub mod sched;
pub mod smp;
pub mod sync;
pub mod syscall;
pub mod trap;

#[cfg(test)]
extern crate std;

/// Host tests share the kernel's global state (per-CPU records, the
/// scheduler, the process forest); this serializes them.
#[cfg(test)]
pub(crate) mod test_sync {
    pub(crate) type TestGuard = spin::MutexGuard<'static, ()>;

    static LOCK: spin::Mutex<()> = spin::Mutex::new(());

    pub(crate) fn guard() -> TestGuard {
        LOCK.lock()
    }
}
