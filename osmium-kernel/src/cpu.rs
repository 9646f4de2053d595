//! Per-CPU state
//!
//! Each processor owns one [`Cpu`] record: the saved scheduler context,
//! the task it is currently running, and the nesting counters that make
//! interrupt disabling and the scheduler lock re-entrant.
//!
//! [`irq_save`]/[`irq_restore`] are the only way kernel code disables
//! interrupts: the first save records the prior CPSR, the matching last
//! restore reinstates it. The spinlock, the scheduler lock, and the
//! drivers all go through this pair.

use core::cell::UnsafeCell;

use osmium_arch::cpu as arch_cpu;
use osmium_arch::Context;

use crate::sched::TaskId;

/// Number of CPUs the kernel drives.
pub const NCPU: usize = 4;

/// Per-CPU bookkeeping.
pub struct Cpu {
    /// Scheduler-loop context; the switch target of every yield.
    pub sched_context: *mut Context,
    /// Task currently running on this CPU.
    pub task: Option<TaskId>,
    /// Scheduler lock re-entry depth.
    pub sched_lock_count: u32,
    /// Depth of `irq_save` nesting.
    pub irq_save_count: u32,
    /// CPSR before the outermost `irq_save`.
    pub irq_flags: u32,
    /// Depth of ISR nesting; nonzero forbids immediate preemption.
    pub isr_nesting: u32,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            sched_context: core::ptr::null_mut(),
            task: None,
            sched_lock_count: 0,
            irq_save_count: 0,
            irq_flags: 0,
            isr_nesting: 0,
        }
    }
}

struct CpuArray {
    cpus: [UnsafeCell<Cpu>; NCPU],
}

// SAFETY: Each slot is only ever accessed by its own CPU, with interrupts
// disabled, so no two flows of control touch a slot concurrently.
unsafe impl Sync for CpuArray {}

static CPUS: CpuArray = CpuArray {
    cpus: [
        UnsafeCell::new(Cpu::new()),
        UnsafeCell::new(Cpu::new()),
        UnsafeCell::new(Cpu::new()),
        UnsafeCell::new(Cpu::new()),
    ],
};

/// ID of the executing CPU.
#[inline]
#[must_use]
pub fn id() -> usize {
    arch_cpu::cpu_id()
}

/// The executing CPU's record.
///
/// # Safety
///
/// Interrupts must be disabled on this CPU for the lifetime of the
/// returned reference, and the caller must not create a second live
/// reference (call chains below `irq_save` keep this straight by
/// construction).
#[inline]
pub unsafe fn current() -> &'static mut Cpu {
    // SAFETY: id() < NCPU by construction; exclusivity is the caller's
    // obligation stated above.
    unsafe { &mut *CPUS.cpus[id()].get() }
}

/// Disable interrupts on this CPU, counting nesting.
///
/// Only the outermost call records the prior interrupt state.
pub fn irq_save() {
    let flags = arch_cpu::irq_disable_save();

    // SAFETY: Interrupts are now disabled, and this is the only live
    // reference taken on this call path.
    let cpu = unsafe { current() };
    if cpu.irq_save_count == 0 {
        cpu.irq_flags = flags;
    }
    cpu.irq_save_count += 1;
}

/// Undo one level of [`irq_save`]; the outermost call restores the
/// recorded interrupt state.
pub fn irq_restore() {
    // SAFETY: irq_save is still in effect (count > 0), so interrupts are
    // disabled and this reference is exclusive.
    let cpu = unsafe { current() };
    if cpu.irq_save_count == 0 {
        panic!("irq_restore without a matching irq_save");
    }

    cpu.irq_save_count -= 1;
    if cpu.irq_save_count == 0 {
        let flags = cpu.irq_flags;
        arch_cpu::irq_restore(flags);
    }
}
