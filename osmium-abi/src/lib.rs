//! # osmium-abi
//!
//! The stable contract between the osmium kernel and user programs:
//! error codes, syscall numbers, `wait` option flags, and the on-the-wire
//! directory entry layout returned by `getdents`.
//!
//! This crate is `no_std` and dependency-light so both the kernel and the
//! user runtime can link it.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod dirent;
pub mod error;
pub mod syscall;
pub mod wait;

pub use dirent::{DirentHeader, DirentIter, DIRENT_HEADER_SIZE};
pub use error::Errno;
pub use syscall::SyscallNo;
pub use wait::{WaitOptions, WaitTarget};

/// Width of the per-process open-file table.
pub const OPEN_MAX: usize = 32;

/// Smallest page the kernel hands out; all kernel stacks are one page.
pub const PAGE_SIZE: usize = 4096;

/// Top of the user stack in every process address space.
pub const USTACK_TOP: u32 = 0x8000_0000;

/// Size of the user stack region reserved below [`USTACK_TOP`].
pub const USTACK_SIZE: u32 = 8 * PAGE_SIZE as u32;
