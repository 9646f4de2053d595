//! Kernel error codes
//!
//! Failures cross the syscall boundary (and the scheduler's sleep-result
//! slot) as small negative integers following the POSIX taxonomy. Zero is
//! success; positive values carry syscall-specific payloads such as PIDs.

/// POSIX-style error numbers.
///
/// The discriminants are the *positive* errno values; use [`Errno::as_neg`]
/// for the negative form that travels in registers and sleep results.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Errno {
    /// Operation not permitted.
    EPERM = 1,
    /// No such file or directory.
    ENOENT = 2,
    /// No such process.
    ESRCH = 3,
    /// Bad file descriptor.
    EBADF = 9,
    /// No child processes.
    ECHILD = 10,
    /// Resource temporarily unavailable.
    EAGAIN = 11,
    /// Out of memory.
    ENOMEM = 12,
    /// Device or resource busy.
    EBUSY = 16,
    /// Invalid argument.
    EINVAL = 22,
    /// Too many open files.
    EMFILE = 24,
    /// Function not implemented.
    ENOSYS = 38,
    /// File name too long.
    ENAMETOOLONG = 36,
    /// Connection timed out.
    ETIMEDOUT = 110,
}

impl Errno {
    /// The negative integer form used in syscall returns and sleep results.
    #[inline]
    #[must_use]
    pub const fn as_neg(self) -> i32 {
        -(self as i32)
    }

    /// Decode a negative return value back into an `Errno`.
    ///
    /// Returns `None` for non-negative values and unknown codes.
    #[must_use]
    pub fn from_neg(value: i32) -> Option<Self> {
        match -value {
            1 => Some(Self::EPERM),
            2 => Some(Self::ENOENT),
            3 => Some(Self::ESRCH),
            9 => Some(Self::EBADF),
            10 => Some(Self::ECHILD),
            11 => Some(Self::EAGAIN),
            12 => Some(Self::ENOMEM),
            16 => Some(Self::EBUSY),
            22 => Some(Self::EINVAL),
            24 => Some(Self::EMFILE),
            36 => Some(Self::ENAMETOOLONG),
            38 => Some(Self::ENOSYS),
            110 => Some(Self::ETIMEDOUT),
            _ => None,
        }
    }

    /// Short name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::EPERM => "EPERM",
            Self::ENOENT => "ENOENT",
            Self::ESRCH => "ESRCH",
            Self::EBADF => "EBADF",
            Self::ECHILD => "ECHILD",
            Self::EAGAIN => "EAGAIN",
            Self::ENOMEM => "ENOMEM",
            Self::EBUSY => "EBUSY",
            Self::EINVAL => "EINVAL",
            Self::EMFILE => "EMFILE",
            Self::ENAMETOOLONG => "ENAMETOOLONG",
            Self::ENOSYS => "ENOSYS",
            Self::ETIMEDOUT => "ETIMEDOUT",
        }
    }
}

/// Collapse a `Result<T, Errno>` into the raw register form.
///
/// `Ok(v)` maps through `f`, `Err(e)` becomes the negative errno.
#[inline]
pub fn into_ret<T>(r: Result<T, Errno>, f: impl FnOnce(T) -> i32) -> i32 {
    match r {
        Ok(v) => f(v),
        Err(e) => e.as_neg(),
    }
}
