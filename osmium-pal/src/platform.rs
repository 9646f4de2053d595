//! Board constants
//!
//! Device bases and interrupt lines for the RealView PB-A8 memory map.

/// PL011 UART0 base.
pub const UART0_BASE: usize = 0x1000_9000;

/// SP804 dual-timer 0/1 base.
pub const TIMER01_BASE: usize = 0x1001_1000;

/// GICv2 distributor base.
pub const GICD_BASE: usize = 0x1E00_1000;

/// GICv2 CPU interface base.
pub const GICC_BASE: usize = 0x1E00_0000;

/// Timer 0 interrupt line.
pub const IRQ_TIMER0: u32 = 36;

/// UART0 interrupt line.
pub const IRQ_UART0: u32 = 44;

/// Highest interrupt line the distributor routes.
pub const IRQ_MAX: u32 = 96;

/// Number of CPUs the board wires up.
pub const NCPU: usize = 4;

/// System tick rate.
pub const TICK_HZ: u64 = 100;

/// SP804 input clock (1 MHz reference).
pub const TIMER_CLK_HZ: u64 = 1_000_000;
