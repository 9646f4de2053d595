//! Syscall numbers
//!
//! The number travels in `r7`, arguments in `r0`-`r2`, the result comes
//! back in `r0` (negative errno on failure).

/// System call numbers.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallNo {
    /// Terminate the calling process with a status code.
    Exit = 1,
    /// Duplicate the calling process; returns 0 in the child.
    Fork = 2,
    /// Reap a terminated child.
    Wait = 3,
    /// Replace the process image.
    Exec = 4,
    /// Write bytes to the console.
    CWrite = 5,
    /// Grow the process data segment.
    Sbrk = 6,
    /// Read directory entries from an open descriptor.
    GetDents = 7,
    /// Close an open descriptor.
    Close = 8,
}

impl SyscallNo {
    /// Decode a raw syscall number.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Exit),
            2 => Some(Self::Fork),
            3 => Some(Self::Wait),
            4 => Some(Self::Exec),
            5 => Some(Self::CWrite),
            6 => Some(Self::Sbrk),
            7 => Some(Self::GetDents),
            8 => Some(Self::Close),
            _ => None,
        }
    }
}
