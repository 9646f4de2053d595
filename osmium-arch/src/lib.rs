//! # osmium-arch
//!
//! ARMv7-A architecture primitives for the osmium kernel: interrupt
//! masking, CPU identification, the kernel context switch, the user-mode
//! trap frame, and thin MMU glue.
//!
//! Everything that touches the instruction set is gated on
//! `target_arch = "arm"`; on other targets the same API compiles to inert
//! fallbacks so the kernel's logic can be unit-tested on the build host.
//! The fallbacks never pretend to switch contexts or enter user mode —
//! those panic if reached.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod context;
pub mod cpu;
pub mod mmu;
pub mod trap;

pub use context::{context_switch, Context};
pub use trap::TrapFrame;
