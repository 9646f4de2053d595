//! GICv2 interrupt controller
//!
//! Just enough of the distributor and CPU interface for the kernel's
//! dispatch path: global init, per-CPU init, per-line enable/mask, and
//! the acknowledge/EOI pair.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};

use crate::platform::{GICC_BASE, GICD_BASE, IRQ_MAX};

register_structs! {
    GicdRegs {
        /// Distributor control.
        (0x000 => ctlr: ReadWrite<u32>),
        /// Interrupt controller type.
        (0x004 => typer: ReadOnly<u32>),
        (0x008 => _reserved0),
        /// Set-enable, one bit per line.
        (0x100 => isenabler: [ReadWrite<u32>; 32]),
        /// Clear-enable, one bit per line.
        (0x180 => icenabler: [ReadWrite<u32>; 32]),
        (0x200 => _reserved1),
        /// Per-line priority, one byte per line.
        (0x400 => ipriorityr: [ReadWrite<u32>; 255]),
        (0x7fc => _reserved2),
        /// Per-line CPU targets, one byte per line.
        (0x800 => itargetsr: [ReadWrite<u32>; 255]),
        (0xbfc => @END),
    }
}

register_structs! {
    GiccRegs {
        /// CPU interface control.
        (0x000 => ctlr: ReadWrite<u32>),
        /// Priority mask.
        (0x004 => pmr: ReadWrite<u32>),
        (0x008 => _reserved0),
        /// Interrupt acknowledge.
        (0x00c => iar: ReadOnly<u32>),
        /// End of interrupt.
        (0x010 => eoir: WriteOnly<u32>),
        (0x014 => @END),
    }
}

/// IAR value meaning "no pending interrupt".
pub const SPURIOUS: u32 = 1023;

fn gicd() -> &'static GicdRegs {
    // SAFETY: GICD_BASE is the board's distributor, mapped one-to-one for
    // the kernel's lifetime; the register map matches the hardware.
    unsafe { &*(GICD_BASE as *const GicdRegs) }
}

fn gicc() -> &'static GiccRegs {
    // SAFETY: GICC_BASE is this CPU's interface, mapped one-to-one for
    // the kernel's lifetime; the register map matches the hardware.
    unsafe { &*(GICC_BASE as *const GiccRegs) }
}

/// Initialise the distributor. Boot CPU only, once.
pub fn init() {
    let d = gicd();
    d.ctlr.set(0);

    // Mask every line and route SPIs to CPU 0 at middling priority.
    for n in 1..(IRQ_MAX as usize / 32) + 1 {
        d.icenabler[n].set(!0);
    }
    for n in 8..(IRQ_MAX as usize) / 4 {
        d.ipriorityr[n].set(0xA0A0_A0A0);
        d.itargetsr[n].set(0x0101_0101);
    }

    d.ctlr.set(1);
    init_percpu();
}

/// Initialise this CPU's interface. Every CPU, during bring-up.
pub fn init_percpu() {
    let c = gicc();
    c.pmr.set(0xF0);
    c.ctlr.set(1);
}

/// Unmask an interrupt line.
pub fn unmask(irq: u32) {
    gicd().isenabler[(irq / 32) as usize].set(1 << (irq % 32));
}

/// Mask an interrupt line.
pub fn mask(irq: u32) {
    gicd().icenabler[(irq / 32) as usize].set(1 << (irq % 32));
}

/// Route `irq` to the given CPU.
pub fn set_target(irq: u32, cpu: usize) {
    let d = gicd();
    let reg = (irq / 4) as usize;
    let shift = (irq % 4) * 8;
    let mut val = d.itargetsr[reg].get();
    val &= !(0xFF << shift);
    val |= (1u32 << cpu) << shift;
    d.itargetsr[reg].set(val);
}

/// Acknowledge the highest-priority pending interrupt.
///
/// Returns the interrupt ID, or [`SPURIOUS`].
#[must_use]
pub fn ack() -> u32 {
    gicc().iar.get() & 0x3FF
}

/// Signal end-of-interrupt for a previously acknowledged ID.
pub fn eoi(irq: u32) {
    gicc().eoir.set(irq);
}
