//! Sleep timers
//!
//! One-shot timers backing `sleep` timeouts, kept in a min-heap ordered by
//! deadline and driven by the system tick. A firing timer records
//! `-ETIMEDOUT` in the sleeper, unlinks it from its wait list, and
//! re-enqueues it; disarming is lazy, so stale heap entries are skipped
//! when popped.

use core::cmp::Ordering;

use osmium_abi::Errno;
use osmium_pal::timer as pal_timer;

use crate::sched::{self, SchedState, TaskId, TaskState};

/// Entry in the timer heap.
pub(crate) struct SleepTimer {
    /// Absolute tick at which to fire.
    pub(crate) deadline: u64,
    /// Sleeping task to wake.
    pub(crate) task: TaskId,
}

impl PartialEq for SleepTimer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.task == other.task
    }
}

impl Eq for SleepTimer {}

impl PartialOrd for SleepTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SleepTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest
        // deadline on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.task.cmp(&self.task))
    }
}

/// Arm a one-shot timer `ticks` from now for `tid`. Scheduler lock held.
pub(crate) fn arm(st: &mut SchedState, tid: TaskId, ticks: u64) {
    let deadline = pal_timer::now_ticks() + ticks;
    if let Some(task) = st.tasks.get_mut(&tid) {
        task.sleep_deadline = Some(deadline);
        st.timers.push(SleepTimer {
            deadline,
            task: tid,
        });
    }
}

/// Disarm `tid`'s timer, if armed. Scheduler lock held.
///
/// Only clears the task's deadline; the heap entry goes stale and is
/// dropped when it surfaces.
pub(crate) fn disarm(st: &mut SchedState, tid: TaskId) {
    if let Some(task) = st.tasks.get_mut(&tid) {
        task.sleep_deadline = None;
    }
}

/// Fire expired timers. Called from the tick interrupt handler.
///
/// A stale entry (task gone, no longer sleeping, or re-armed with a
/// different deadline) is discarded. Wakeups inside the tick ISR defer
/// preemption via the reschedule flag as usual.
pub fn tick(now: u64) {
    sched::lock();

    loop {
        let fired = {
            // SAFETY: Lock held; borrow ends before may_yield.
            let st = unsafe { sched::state() };

            let due = st.timers.peek().is_some_and(|e| e.deadline <= now);
            if !due {
                break;
            }

            let entry = st.timers.pop().expect("checked above");
            expire(st, &entry)
        };

        if let Some(tid) = fired {
            sched::may_yield(tid);
        }
    }

    sched::unlock();
}

/// Wake the sleeper behind one expired heap entry, if still current.
fn expire(st: &mut SchedState, entry: &SleepTimer) -> Option<TaskId> {
    let task = st.tasks.get_mut(&entry.task)?;

    if task.state != TaskState::Sleeping || task.sleep_deadline != Some(entry.deadline) {
        return None;
    }

    task.sleep_deadline = None;
    task.sleep_result = Errno::ETIMEDOUT.as_neg();

    if let Some(q) = task.wait_list.take() {
        if let Some(list) = st.wait_lists.get_mut(&q) {
            if let Some(pos) = list.iter().position(|t| *t == entry.task) {
                list.remove(pos);
            }
        }
    }

    sched::enqueue(st, entry.task);
    Some(entry.task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{lock, state, unlock, wait_list_create};

    fn noop(_arg: usize) {}

    #[test]
    fn test_expired_timer_wakes_with_etimedout() {
        let _g = crate::test_sync::guard();
        sched::init();
        let q = wait_list_create();
        let tid = sched::task::create(None, noop, 0, 10).unwrap();

        lock();
        {
            // SAFETY: Lock held.
            let st = unsafe { state() };
            let task = st.tasks.get_mut(&tid).unwrap();
            task.state = TaskState::Sleeping;
            task.wait_list = Some(q);
            st.wait_lists.get_mut(&q).unwrap().push_back(tid);
            arm(st, tid, 5);
        }
        unlock();

        tick(pal_timer::now_ticks() + 5);

        lock();
        {
            // SAFETY: Lock held.
            let st = unsafe { state() };
            let task = st.tasks.get(&tid).unwrap();
            assert_eq!(task.state, TaskState::Ready);
            assert_eq!(task.sleep_result, Errno::ETIMEDOUT.as_neg());
            assert!(st.wait_lists.get(&q).unwrap().is_empty());
        }
        unlock();
    }

    #[test]
    fn test_disarmed_timer_entry_is_stale() {
        let _g = crate::test_sync::guard();
        sched::init();
        let tid = sched::task::create(None, noop, 0, 10).unwrap();

        lock();
        {
            // SAFETY: Lock held.
            let st = unsafe { state() };
            let task = st.tasks.get_mut(&tid).unwrap();
            task.state = TaskState::Sleeping;
            arm(st, tid, 3);
            disarm(st, tid);
        }
        unlock();

        tick(pal_timer::now_ticks() + 10);

        lock();
        {
            // SAFETY: Lock held.
            let st = unsafe { state() };
            let task = st.tasks.get(&tid).unwrap();
            // The stale entry must not wake the sleeper.
            assert_eq!(task.state, TaskState::Sleeping);
            assert_eq!(task.sleep_result, 0);
        }
        unlock();
    }
}
