//! # osmium-pal
//!
//! Platform abstraction for the RealView-flavored ARMv7 board the kernel
//! targets: PL011 UART console, SP804 dual timer (system tick), and the
//! GICv2 interrupt controller.
//!
//! Register access goes through `tock-registers` MMIO maps. Device base
//! addresses live in [`platform`]; the kernel maps devices one-to-one, so
//! the physical bases are usable directly.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod console;
pub mod gic;
pub mod platform;
pub mod timer;
