//! PL011 UART console
//!
//! Polled transmit only; the kernel's logger and the panic path both write
//! here. Receive-side handling belongs to the TTY driver, which is outside
//! the kernel core.

use core::fmt;

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite};

use crate::platform::UART0_BASE;

register_structs! {
    Pl011Regs {
        /// Data register.
        (0x000 => dr: ReadWrite<u32>),
        (0x004 => _reserved0),
        /// Flag register.
        (0x018 => fr: ReadOnly<u32>),
        (0x01c => @END),
    }
}

/// Flag register: transmit FIFO full.
const FR_TXFF: u32 = 1 << 5;

fn regs() -> &'static Pl011Regs {
    // SAFETY: UART0_BASE is the board's PL011, mapped one-to-one for the
    // kernel's lifetime; the register map matches the hardware.
    unsafe { &*(UART0_BASE as *const Pl011Regs) }
}

/// Write one byte, spinning while the transmit FIFO is full.
pub fn putc(byte: u8) {
    let regs = regs();
    while regs.fr.get() & FR_TXFF != 0 {
        core::hint::spin_loop();
    }
    regs.dr.set(byte as u32);
}

/// Write a string, expanding `\n` to `\r\n`.
pub fn puts(s: &str) {
    for byte in s.bytes() {
        if byte == b'\n' {
            putc(b'\r');
        }
        putc(byte);
    }
}

/// `core::fmt::Write` adapter over the console.
pub struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        puts(s);
        Ok(())
    }
}
