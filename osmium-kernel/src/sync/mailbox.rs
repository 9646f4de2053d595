//! Bounded mailbox
//!
//! A FIFO of fixed-size messages in a pre-allocated ring. Senders sleep
//! while the ring is full, receivers while it is empty; a send into an
//! empty box wakes one receiver, a receive from a full box wakes one
//! sender. Destroying the mailbox wakes every waiter with `-EINVAL`.

use alloc::vec;
use alloc::vec::Vec;

use osmium_abi::Errno;

use crate::sched::{self, WaitListId};
use crate::sync::Spinlock;

/// Message storage: heap-allocated, or a caller-supplied static buffer
/// for mailboxes set up before the allocator is.
enum RingBuf {
    Owned(Vec<u8>),
    Static(&'static mut [u8]),
}

impl RingBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Owned(v) => v,
            Self::Static(s) => s,
        }
    }

    fn as_ref(&self) -> &[u8] {
        match self {
            Self::Owned(v) => v,
            Self::Static(s) => s,
        }
    }
}

/// Ring state, guarded by the mailbox spinlock.
struct Ring {
    buf: RingBuf,
    msg_size: usize,
    capacity: usize,
    size: usize,
    /// Byte offset of the next message to read.
    read_at: usize,
    /// Byte offset of the next free slot.
    write_at: usize,
}

impl Ring {
    /// End of the usable buffer: a whole number of messages.
    fn end(&self) -> usize {
        self.capacity * self.msg_size
    }

    fn pop_into(&mut self, message: &mut [u8]) {
        let at = self.read_at;
        message[..self.msg_size].copy_from_slice(&self.buf.as_ref()[at..at + self.msg_size]);
        self.read_at += self.msg_size;
        if self.read_at >= self.end() {
            self.read_at = 0;
        }
        self.size -= 1;
    }

    fn push_from(&mut self, message: &[u8]) {
        let at = self.write_at;
        let msg_size = self.msg_size;
        self.buf.as_mut()[at..at + msg_size].copy_from_slice(&message[..msg_size]);
        self.write_at += msg_size;
        if self.write_at >= self.end() {
            self.write_at = 0;
        }
        self.size += 1;
    }
}

/// A bounded FIFO of fixed-size messages.
pub struct Mailbox {
    ring: Spinlock<Ring>,
    senders: WaitListId,
    receivers: WaitListId,
}

impl core::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mailbox")
            .field("senders", &self.senders)
            .field("receivers", &self.receivers)
            .finish()
    }
}

impl Mailbox {
    /// Create a mailbox of `capacity` messages of `msg_size` bytes.
    pub fn create(msg_size: usize, capacity: usize) -> Result<Self, Errno> {
        if msg_size == 0 || capacity == 0 {
            return Err(Errno::EINVAL);
        }

        Ok(Self::from_buf(
            msg_size,
            capacity,
            RingBuf::Owned(vec![0; msg_size * capacity]),
        ))
    }

    /// Create a mailbox over a caller-supplied buffer.
    ///
    /// The capacity is however many whole messages fit; fails if not even
    /// one does.
    pub fn with_buffer(msg_size: usize, buf: &'static mut [u8]) -> Result<Self, Errno> {
        if msg_size == 0 || buf.len() < msg_size {
            return Err(Errno::EINVAL);
        }

        let capacity = buf.len() / msg_size;
        Ok(Self::from_buf(msg_size, capacity, RingBuf::Static(buf)))
    }

    fn from_buf(msg_size: usize, capacity: usize, buf: RingBuf) -> Self {
        Self {
            ring: Spinlock::new(
                "mailbox",
                Ring {
                    buf,
                    msg_size,
                    capacity,
                    size: 0,
                    read_at: 0,
                    write_at: 0,
                },
            ),
            senders: sched::wait_list_create(),
            receivers: sched::wait_list_create(),
        }
    }

    /// Message size in bytes.
    #[must_use]
    pub fn msg_size(&self) -> usize {
        self.ring.lock().msg_size
    }

    /// Capacity in messages.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity
    }

    /// Messages currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.lock().size
    }

    /// Is the mailbox empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send without sleeping; `-EAGAIN` when full.
    pub fn try_send(&self, message: &[u8]) -> Result<(), Errno> {
        let guard = self.ring.lock();
        self.send_locked(guard, message)
            .map(|_| ())
            .map_err(|(_, e)| e)
    }

    /// Send, sleeping while the ring is full.
    ///
    /// `timeout_ticks` of zero waits forever.
    pub fn timed_send(&self, message: &[u8], timeout_ticks: u64) -> Result<(), Errno> {
        let mut guard = self.ring.lock();

        loop {
            match self.send_locked(guard, message) {
                Ok(_) => return Ok(()),
                Err((g, Errno::EAGAIN)) => {
                    let (result, reacquired) =
                        sched::sleep(self.senders, timeout_ticks, &self.ring, g);
                    if result < 0 {
                        return Err(Errno::from_neg(result).unwrap_or(Errno::EINVAL));
                    }
                    guard = reacquired;
                }
                Err((_, e)) => return Err(e),
            }
        }
    }

    /// Receive without sleeping; `-EAGAIN` when empty.
    pub fn try_receive(&self, message: &mut [u8]) -> Result<(), Errno> {
        let guard = self.ring.lock();
        self.receive_locked(guard, message)
            .map(|_| ())
            .map_err(|(_, e)| e)
    }

    /// Receive, sleeping while the ring is empty.
    ///
    /// `timeout_ticks` of zero waits forever.
    pub fn timed_receive(&self, message: &mut [u8], timeout_ticks: u64) -> Result<(), Errno> {
        let mut guard = self.ring.lock();

        loop {
            match self.receive_locked(guard, message) {
                Ok(_) => return Ok(()),
                Err((g, Errno::EAGAIN)) => {
                    let (result, reacquired) =
                        sched::sleep(self.receivers, timeout_ticks, &self.ring, g);
                    if result < 0 {
                        return Err(Errno::from_neg(result).unwrap_or(Errno::EINVAL));
                    }
                    guard = reacquired;
                }
                Err((_, e)) => return Err(e),
            }
        }
    }

    /// One send attempt under the ring lock.
    ///
    /// Wakes one receiver on the empty-to-nonempty edge. Hands the guard
    /// back on `EAGAIN` so sleeping callers keep the atomic protocol.
    fn send_locked<'a>(
        &'a self,
        mut guard: crate::sync::SpinlockGuard<'a, Ring>,
        message: &[u8],
    ) -> Result<crate::sync::SpinlockGuard<'a, Ring>, (crate::sync::SpinlockGuard<'a, Ring>, Errno)>
    {
        if message.len() != guard.msg_size {
            return Err((guard, Errno::EINVAL));
        }
        if guard.size == guard.capacity {
            return Err((guard, Errno::EAGAIN));
        }

        guard.push_from(message);

        if guard.size == 1 {
            sched::lock();
            sched::wakeup_one_locked(self.receivers, 0);
            sched::unlock();
        }

        Ok(guard)
    }

    /// One receive attempt under the ring lock.
    ///
    /// Wakes one sender on the full-to-not-full edge.
    fn receive_locked<'a>(
        &'a self,
        mut guard: crate::sync::SpinlockGuard<'a, Ring>,
        message: &mut [u8],
    ) -> Result<crate::sync::SpinlockGuard<'a, Ring>, (crate::sync::SpinlockGuard<'a, Ring>, Errno)>
    {
        if message.len() < guard.msg_size {
            return Err((guard, Errno::EINVAL));
        }
        if guard.size == 0 {
            return Err((guard, Errno::EAGAIN));
        }

        let was_full = guard.size == guard.capacity;
        guard.pop_into(message);

        if was_full {
            sched::lock();
            sched::wakeup_one_locked(self.senders, 0);
            sched::unlock();
        }

        Ok(guard)
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        sched::wait_list_destroy(self.receivers, Errno::EINVAL.as_neg());
        sched::wait_list_destroy(self.senders, Errno::EINVAL.as_neg());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> crate::test_sync::TestGuard {
        let g = crate::test_sync::guard();
        crate::sched::init();
        g
    }

    #[test]
    fn test_send_receive_roundtrip() {
        let _g = setup();
        let mbox = Mailbox::create(4, 3).unwrap();

        mbox.try_send(b"abcd").unwrap();
        assert_eq!(mbox.len(), 1);

        let mut out = [0u8; 4];
        mbox.try_receive(&mut out).unwrap();
        assert_eq!(&out, b"abcd");
        assert!(mbox.is_empty());
    }

    #[test]
    fn test_empty_receive_and_full_send_report_eagain() {
        let _g = setup();
        let mbox = Mailbox::create(2, 2).unwrap();
        let mut out = [0u8; 2];

        assert_eq!(mbox.try_receive(&mut out), Err(Errno::EAGAIN));
        mbox.try_send(b"aa").unwrap();
        mbox.try_send(b"bb").unwrap();
        assert_eq!(mbox.try_send(b"cc"), Err(Errno::EAGAIN));
    }

    #[test]
    fn test_wrap_around_preserves_order() {
        let _g = setup();
        // Capacity 3: send A B C, receive A, send D, then drain B C D.
        let mbox = Mailbox::create(1, 3).unwrap();
        let mut out = [0u8; 1];

        mbox.try_send(b"A").unwrap();
        mbox.try_send(b"B").unwrap();
        mbox.try_send(b"C").unwrap();
        mbox.try_receive(&mut out).unwrap();
        assert_eq!(&out, b"A");
        mbox.try_send(b"D").unwrap();

        for expect in [b"B", b"C", b"D"] {
            mbox.try_receive(&mut out).unwrap();
            assert_eq!(&out, expect);
        }
        assert!(mbox.is_empty());

        // Both cursors wrapped exactly once and meet again.
        let ring = mbox.ring.lock();
        assert_eq!(ring.read_at, ring.write_at);
    }

    #[test]
    fn test_cursor_reset_after_full_cycle() {
        let _g = setup();
        let mbox = Mailbox::create(8, 4).unwrap();
        let mut out = [0u8; 8];

        for i in 0..4u8 {
            mbox.try_send(&[i; 8]).unwrap();
        }
        for i in 0..4u8 {
            mbox.try_receive(&mut out).unwrap();
            assert_eq!(out, [i; 8]);
        }

        let ring = mbox.ring.lock();
        assert_eq!(ring.size, 0);
        assert_eq!(ring.read_at, 0);
        assert_eq!(ring.write_at, 0);
    }

    #[test]
    fn test_message_size_is_checked() {
        let _g = setup();
        let mbox = Mailbox::create(4, 2).unwrap();
        assert_eq!(mbox.try_send(b"too long"), Err(Errno::EINVAL));
        assert_eq!(mbox.try_send(b"ab"), Err(Errno::EINVAL));

        let mut small = [0u8; 2];
        mbox.try_send(b"abcd").unwrap();
        assert_eq!(mbox.try_receive(&mut small), Err(Errno::EINVAL));
    }

    #[test]
    fn test_with_buffer_rounds_capacity_down() {
        let _g = setup();
        static BUF: spin::Mutex<[u8; 22]> = spin::Mutex::new([0; 22]);
        // Leak a static mut slice for the test mailbox.
        let buf: &'static mut [u8] = {
            let mut guard = BUF.lock();
            let ptr = guard.as_mut_ptr();
            core::mem::forget(guard);
            // SAFETY: The mutex guard is leaked, so the borrow is
            // exclusive for the program's remaining lifetime.
            unsafe { core::slice::from_raw_parts_mut(ptr, 22) }
        };

        let mbox = Mailbox::with_buffer(8, buf).unwrap();
        assert_eq!(mbox.capacity(), 2);
        assert_eq!(Mailbox::with_buffer(8, &mut []).unwrap_err(), Errno::EINVAL);
    }
}
