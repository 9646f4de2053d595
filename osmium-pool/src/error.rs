//! Pool error codes

/// Errors reported by pool operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Object size or alignment is unusable (zero, or not a power of two).
    BadGeometry,
    /// `destroy` was called while blocks are still live.
    Busy,
}
