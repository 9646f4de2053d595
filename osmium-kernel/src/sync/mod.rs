//! Synchronization primitives
//!
//! The spinlock is the foundation; wait channels, counting semaphores and
//! bounded mailboxes are built over the scheduler's sleep/wakeup
//! primitives. Each sleeping primitive owns its own spinlock and acquires
//! it before (and releases it after) any call into the scheduler, which
//! takes its own lock second.

pub mod mailbox;
pub mod semaphore;
pub mod spinlock;
pub mod wchan;

pub use mailbox::Mailbox;
pub use semaphore::Semaphore;
pub use spinlock::{Spinlock, SpinlockGuard, NCALLERPCS};
pub use wchan::WaitChannel;
