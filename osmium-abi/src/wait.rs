//! Options accepted by the `wait` syscall.

use bitflags::bitflags;

bitflags! {
    /// `wait(2)` option flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WaitOptions: u32 {
        /// Return immediately with 0 if no child has exited yet.
        const NOHANG = 1 << 0;
        /// Also report stopped children (accepted, not yet implemented).
        const UNTRACED = 1 << 1;
    }
}

/// Selector passed as the `pid` argument of `wait`.
///
/// Process groups are not modeled in this kernel: the two group selectors
/// are recognized but match any child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitTarget {
    /// Wait for the child with this exact PID (`pid > 0`).
    Pid(i32),
    /// Wait for any child (`pid == -1`, `pid == 0`, or `pid < -1`).
    Any,
}

impl WaitTarget {
    /// Decode the raw `pid` argument.
    #[must_use]
    pub fn from_raw(pid: i32) -> Self {
        if pid > 0 {
            Self::Pid(pid)
        } else {
            Self::Any
        }
    }

    /// Does a child with `pid` satisfy this selector?
    #[inline]
    #[must_use]
    pub fn matches(self, pid: i32) -> bool {
        match self {
            Self::Pid(want) => pid == want,
            Self::Any => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_decode() {
        assert_eq!(WaitTarget::from_raw(7), WaitTarget::Pid(7));
        assert_eq!(WaitTarget::from_raw(-1), WaitTarget::Any);
        assert_eq!(WaitTarget::from_raw(0), WaitTarget::Any);
        assert_eq!(WaitTarget::from_raw(-5), WaitTarget::Any);
    }

    #[test]
    fn test_exact_pid_matching() {
        let t = WaitTarget::from_raw(12);
        assert!(t.matches(12));
        assert!(!t.matches(13));
        assert!(WaitTarget::Any.matches(12));
    }
}
