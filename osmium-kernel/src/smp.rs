//! Secondary CPU bring-up
//!
//! The boot CPU finishes kernel initialisation, then releases the
//! secondaries: on this board they spin in the boot stub until the
//! SYS_FLAGS register carries a kernel entry address and an event is
//! signalled. Each secondary sets up its CPU-local interrupt interface
//! and enters the scheduler loop; the shared run queues do the rest.

use core::sync::atomic::{AtomicUsize, Ordering};

use osmium_arch::cpu as arch_cpu;
use osmium_pal::{gic, platform};

use crate::{cpu, sched};

/// RealView SYS_FLAGSSET: secondaries jump wherever this points.
#[cfg(target_arch = "arm")]
const SYS_FLAGSSET: usize = 0x1000_0030;

/// CPUs that have reached the scheduler.
static CPUS_ONLINE: AtomicUsize = AtomicUsize::new(1);

/// Number of CPUs running their scheduler loop.
#[must_use]
pub fn cpus_online() -> usize {
    CPUS_ONLINE.load(Ordering::Acquire)
}

/// Release the secondary CPUs. Boot CPU only, after kernel init.
pub fn start_secondary_cpus() {
    if platform::NCPU <= 1 {
        log::info!("single CPU configuration");
        return;
    }

    // SAFETY: SYS_FLAGSSET is the board's documented release mailbox; the
    // secondaries are parked on it by the boot stub.
    #[cfg(target_arch = "arm")]
    unsafe {
        extern "C" {
            fn osmium_secondary_entry();
        }
        core::ptr::write_volatile(
            SYS_FLAGSSET as *mut u32,
            osmium_secondary_entry as usize as u32,
        );
    }

    arch_cpu::dsb();
    arch_cpu::send_event();

    log::info!("released {} secondary CPUs", platform::NCPU - 1);
}

/// Per-CPU landing point for secondaries, called from the boot stub with
/// a valid stack. Never returns.
pub fn secondary_main() -> ! {
    gic::init_percpu();

    let id = cpu::id();
    CPUS_ONLINE.fetch_add(1, Ordering::AcqRel);
    log::info!("cpu {} entering scheduler", id);

    sched::start();
}
