//! SP804 system tick
//!
//! Timer 0 of the dual timer runs in periodic mode at [`TICK_HZ`] and
//! drives the scheduler tick. The tick counter lives here so sleep
//! timeouts and timestamps share one clock.

use core::sync::atomic::{AtomicU64, Ordering};

use tock_registers::interfaces::Writeable;
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};

use crate::platform::{TICK_HZ, TIMER01_BASE, TIMER_CLK_HZ};

register_structs! {
    Sp804Regs {
        /// Load value for the periodic countdown.
        (0x000 => load: ReadWrite<u32>),
        /// Current countdown value.
        (0x004 => value: ReadOnly<u32>),
        /// Control register.
        (0x008 => control: ReadWrite<u32>),
        /// Interrupt clear (any write).
        (0x00c => intclr: WriteOnly<u32>),
        (0x010 => @END),
    }
}

/// Control: timer enable.
const CTRL_EN: u32 = 1 << 7;
/// Control: periodic mode.
const CTRL_PERIODIC: u32 = 1 << 6;
/// Control: interrupt enable.
const CTRL_INTEN: u32 = 1 << 5;
/// Control: 32-bit counter.
const CTRL_32BIT: u32 = 1 << 1;

/// Ticks elapsed since boot.
static TICKS: AtomicU64 = AtomicU64::new(0);

fn regs() -> &'static Sp804Regs {
    // SAFETY: TIMER01_BASE is the board's SP804, mapped one-to-one for
    // the kernel's lifetime; the register map matches the hardware.
    unsafe { &*(TIMER01_BASE as *const Sp804Regs) }
}

/// Program timer 0 for a periodic [`TICK_HZ`] interrupt.
pub fn init() {
    let regs = regs();
    regs.control.set(0);
    regs.load.set((TIMER_CLK_HZ / TICK_HZ) as u32);
    regs.control.set(CTRL_EN | CTRL_PERIODIC | CTRL_INTEN | CTRL_32BIT);
}

/// Acknowledge the tick interrupt and advance the tick counter.
///
/// Called from the timer IRQ handler; returns the new tick count.
pub fn tick() -> u64 {
    regs().intclr.set(1);
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Ticks elapsed since boot.
#[must_use]
pub fn now_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds elapsed since boot, for log timestamps.
#[must_use]
pub fn now_ms() -> u64 {
    now_ticks() * 1000 / TICK_HZ
}

/// Convert milliseconds to ticks, rounding up, minimum one tick.
#[must_use]
pub fn ms_to_ticks(ms: u64) -> u64 {
    ((ms * TICK_HZ).div_ceil(1000)).max(1)
}
