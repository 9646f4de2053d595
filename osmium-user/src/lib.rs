//! # osmium-user
//!
//! The thin user-space runtime for osmium programs: syscall stubs, the
//! program entry shim, console printing, and a bounds-checked path
//! builder for programs that assemble file names.

#![cfg_attr(target_arch = "arm", no_std)]

pub mod path;
pub mod rt;
pub mod sys;

pub use path::PathBuilder;
