//! Scheduler core
//!
//! Per-priority FIFO run queues (smaller index = higher priority), one
//! global scheduler spinlock protecting every runqueue, wait list, and
//! task-state field, and a per-CPU scheduler context that is the switch
//! target of every yield.
//!
//! # Locking
//!
//! [`lock`]/[`unlock`] are re-entrant per CPU (`sched_lock_count`), built
//! on the per-CPU interrupt-save nesting. State access via [`state`] is
//! only legal with the lock held, and no state borrow may live across a
//! context switch: the switch suspends this flow while other CPUs and
//! tasks mutate the state under the same lock discipline.
//!
//! # Preemption
//!
//! Preemption is delayed, never immediate: when a higher-priority task
//! becomes ready while the CPU is nested in an ISR, the running task is
//! only flagged [`TaskFlags::RESCHEDULE`]; the flag is honored at the
//! outermost ISR exit and at the outermost scheduler-lock release.

pub mod task;
pub mod timer;

use alloc::collections::{BTreeMap, BinaryHeap, VecDeque};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use osmium_arch::context_switch;
use osmium_arch::cpu as arch_cpu;
use osmium_arch::mmu;

use crate::cpu;
use crate::sync::{Spinlock, SpinlockGuard};
pub use task::{Task, TaskFlags, TaskId, TaskState};
use timer::SleepTimer;

/// Number of distinct task priorities; priority 0 is the highest.
pub const TASK_MAX_PRIORITIES: usize = 40;

/// Default priority for user processes.
pub const NZERO: u8 = 20;

/// Handle to a registered wait list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WaitListId(u64);

/// Everything the scheduler lock guards.
pub(crate) struct SchedState {
    /// All live tasks, keyed by id. The box keeps task addresses stable
    /// while the map reshapes.
    pub(crate) tasks: BTreeMap<TaskId, crate::mm::KBox<Task>>,
    /// Ready tasks, one FIFO per priority.
    pub(crate) run_queues: [VecDeque<TaskId>; TASK_MAX_PRIORITIES],
    /// Registered wait lists (wait channels, semaphores, mailboxes).
    pub(crate) wait_lists: BTreeMap<WaitListId, VecDeque<TaskId>>,
    /// Armed sleep timers, earliest deadline first.
    pub(crate) timers: BinaryHeap<SleepTimer>,
    next_wait_list: u64,
    next_task: u32,
}

impl SchedState {
    fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            run_queues: core::array::from_fn(|_| VecDeque::new()),
            wait_lists: BTreeMap::new(),
            timers: BinaryHeap::new(),
            next_wait_list: 1,
            next_task: 1,
        }
    }
}

struct StateCell(UnsafeCell<Option<SchedState>>);

// SAFETY: Access is serialized by the scheduler spinlock.
unsafe impl Sync for StateCell {}

static STATE: StateCell = StateCell(UnsafeCell::new(None));
static SCHED_SPIN: AtomicBool = AtomicBool::new(false);
static SCHED_OWNER: AtomicUsize = AtomicUsize::new(0);
static INITIALISED: AtomicBool = AtomicBool::new(false);

/// Set up the scheduler structures. Must run before any task is created.
pub fn init() {
    if INITIALISED.swap(true, Ordering::SeqCst) {
        return;
    }

    lock();
    // SAFETY: lock held.
    unsafe { *STATE.0.get() = Some(SchedState::new()) };
    unlock();

    log::debug!("scheduler: {} priorities", TASK_MAX_PRIORITIES);
}

/// Is the executing CPU holding the scheduler lock?
pub(crate) fn holding() -> bool {
    SCHED_SPIN.load(Ordering::Relaxed) && SCHED_OWNER.load(Ordering::Relaxed) == cpu::id() + 1
}

/// Acquire the scheduler lock (re-entrant per CPU), disabling interrupts.
pub(crate) fn lock() {
    cpu::irq_save();

    // SAFETY: Interrupts are disabled; this is the CPU's own record.
    let my_cpu = unsafe { cpu::current() };
    if my_cpu.sched_lock_count == 0 {
        while SCHED_SPIN
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        SCHED_OWNER.store(cpu::id() + 1, Ordering::Relaxed);
    }
    my_cpu.sched_lock_count += 1;
}

/// Release one level of the scheduler lock.
///
/// The outermost release honors a pending delayed reschedule before the
/// lock drops, so a wakeup performed under nested locks still preempts at
/// the first safe point.
pub(crate) fn unlock() {
    debug_assert!(holding(), "scheduler not locked");

    // SAFETY: Lock held implies interrupts disabled on this CPU.
    let my_cpu = unsafe { cpu::current() };
    // Outermost release, not in an ISR, and no other spinlock held (each
    // held lock contributes one irq_save level beyond the scheduler
    // lock's own): the only state in which yielding here is safe.
    if my_cpu.sched_lock_count == 1 && my_cpu.isr_nesting == 0 && my_cpu.irq_save_count == 1 {
        if let Some(tid) = my_cpu.task {
            let resched = {
                // SAFETY: Lock held.
                let st = unsafe { state() };
                let task = st.tasks.get_mut(&tid).expect("current task in table");
                let pending = task.flags.contains(TaskFlags::RESCHEDULE);
                if pending {
                    task.flags.remove(TaskFlags::RESCHEDULE);
                    enqueue(st, tid);
                }
                pending
            };
            if resched {
                yield_to_scheduler();
            }
        }
    }

    // SAFETY: As above; re-read after a possible migration in the switch.
    let my_cpu = unsafe { cpu::current() };
    my_cpu.sched_lock_count -= 1;
    if my_cpu.sched_lock_count == 0 {
        SCHED_OWNER.store(0, Ordering::Relaxed);
        SCHED_SPIN.store(false, Ordering::Release);
    }

    cpu::irq_restore();
}

/// Access the scheduler state.
///
/// # Safety
///
/// The scheduler lock must be held, and the borrow must end before any
/// context switch or nested call that takes its own borrow.
pub(crate) unsafe fn state() -> &'static mut SchedState {
    debug_assert!(holding(), "scheduler state access without lock");
    // SAFETY: Caller holds the lock per the contract above.
    unsafe { (*STATE.0.get()).as_mut().expect("scheduler not initialised") }
}

// -- Run queues

/// Mark `tid` Ready and append it to its priority queue. Lock held.
pub(crate) fn enqueue(st: &mut SchedState, tid: TaskId) {
    let task = st.tasks.get_mut(&tid).expect("enqueue of unknown task");
    task.state = TaskState::Ready;
    task.wait_list = None;
    st.run_queues[task.priority as usize].push_back(tid);
}

/// Pop the highest-priority ready task. Lock held.
fn dequeue(st: &mut SchedState) -> Option<TaskId> {
    st.run_queues.iter_mut().find_map(VecDeque::pop_front)
}

/// Priority comparison: does `a` outrank `b`? Smaller value wins.
#[inline]
fn outranks(a: u8, b: u8) -> bool {
    a < b
}

// -- Context switching

/// Switch from the current task into the per-CPU scheduler context.
///
/// The scheduler lock stays held across the switch; the per-CPU interrupt
/// bookkeeping travels with the task, since it may resume on another CPU.
/// Yielding does not itself enqueue the caller.
pub(crate) fn yield_to_scheduler() {
    debug_assert!(holding(), "yield without scheduler lock");

    // SAFETY: Lock held implies interrupts disabled.
    let my_cpu = unsafe { cpu::current() };
    let tid = my_cpu.task.expect("yield without a current task");
    let sched_ctx = my_cpu.sched_context;
    let saved = (my_cpu.irq_save_count, my_cpu.irq_flags);

    let ctx_slot = {
        // SAFETY: Lock held; borrow ends before the switch below.
        let st = unsafe { state() };
        let task = st.tasks.get_mut(&tid).expect("current task in table");
        &mut task.context as *mut *mut osmium_arch::Context
    };

    // SAFETY: ctx_slot points into the task (stable address) and
    // sched_ctx was parked by this CPU's scheduler loop. No state borrow
    // is live.
    unsafe { context_switch(ctx_slot, sched_ctx) };

    // Possibly a different CPU now; restore the travelling IRQ nesting.
    // SAFETY: The resuming scheduler loop holds the lock, so interrupts
    // are disabled here.
    let my_cpu = unsafe { cpu::current() };
    my_cpu.irq_save_count = saved.0;
    my_cpu.irq_flags = saved.1;
}

/// Reschedule check after `candidate` became ready. Lock held.
///
/// If `candidate` outranks the running task, yield now, or record
/// [`TaskFlags::RESCHEDULE`] when nested in an ISR and let the outermost
/// exit honor it.
pub(crate) fn may_yield(candidate: TaskId) {
    debug_assert!(holding(), "may_yield without scheduler lock");

    // SAFETY: Lock held implies interrupts disabled.
    let my_cpu = unsafe { cpu::current() };
    let Some(cur) = my_cpu.task else {
        return;
    };
    // Switching is forbidden inside an ISR and while any spinlock beyond
    // the scheduler lock itself is held (wake paths run under the
    // primitive's own lock).
    let must_defer =
        my_cpu.isr_nesting > 0 || my_cpu.irq_save_count > my_cpu.sched_lock_count;

    let should_switch = {
        // SAFETY: Lock held; borrow ends before the switch.
        let st = unsafe { state() };
        let cand_prio = match st.tasks.get(&candidate) {
            Some(t) => t.priority,
            None => return,
        };
        let cur_task = st.tasks.get_mut(&cur).expect("current task in table");

        if !outranks(cand_prio, cur_task.priority) {
            false
        } else if must_defer {
            // Honored at the outermost isr_exit or the next
            // scheduler-lock release with no other lock held.
            cur_task.flags.insert(TaskFlags::RESCHEDULE);
            false
        } else {
            cur_task.state = TaskState::Ready;
            cur_task.wait_list = None;
            let prio = cur_task.priority as usize;
            st.run_queues[prio].push_back(cur);
            true
        }
    };

    if should_switch {
        yield_to_scheduler();
    }
}

// -- Sleep and wakeup

/// Put the current task to sleep. Scheduler lock held on entry and exit.
///
/// Links the task onto `queue` (if any), arms a one-shot timeout (if
/// nonzero ticks), yields, and returns the recorded sleep result:
/// 0 for a plain wakeup, `-ETIMEDOUT` if the timer fired first, or
/// whatever the waker stored.
pub(crate) fn sleep_locked(queue: Option<WaitListId>, timeout_ticks: u64) -> i32 {
    debug_assert!(holding(), "sleep without scheduler lock");

    // SAFETY: Lock held implies interrupts disabled.
    let my_cpu = unsafe { cpu::current() };
    let tid = my_cpu.task.expect("sleep without a current task");

    {
        // SAFETY: Lock held; borrow ends before the switch.
        let st = unsafe { state() };
        if timeout_ticks > 0 {
            timer::arm(st, tid, timeout_ticks);
        }

        let task = st.tasks.get_mut(&tid).expect("current task in table");
        task.state = TaskState::Sleeping;
        task.sleep_result = 0;
        task.wait_list = queue;
        if let Some(q) = queue {
            st.wait_lists
                .get_mut(&q)
                .expect("sleep on unregistered wait list")
                .push_back(tid);
        }
    }

    yield_to_scheduler();

    // SAFETY: Lock held again after the switch back.
    let st = unsafe { state() };
    timer::disarm(st, tid);
    st.tasks
        .get(&tid)
        .expect("current task in table")
        .sleep_result
}

/// Sleep on `queue`, atomically releasing a caller-held spinlock.
///
/// The scheduler lock is taken *before* the caller's lock is released, so
/// a waker that holds the caller's lock cannot slip its wakeup between
/// release and sleep. The caller's lock is re-acquired before returning.
pub fn sleep<'a, T>(
    queue: WaitListId,
    timeout_ticks: u64,
    lock_ref: &'a Spinlock<T>,
    guard: SpinlockGuard<'a, T>,
) -> (i32, SpinlockGuard<'a, T>) {
    lock();
    drop(guard);

    let result = sleep_locked(Some(queue), timeout_ticks);

    unlock();
    (result, lock_ref.lock())
}

/// Wake every task on `queue` with `result`. Lock held.
pub(crate) fn wakeup_all_locked(queue: WaitListId, result: i32) {
    debug_assert!(holding(), "wakeup without scheduler lock");

    loop {
        let woken = {
            // SAFETY: Lock held; borrow ends before may_yield.
            let st = unsafe { state() };
            let Some(list) = st.wait_lists.get_mut(&queue) else {
                return;
            };
            match list.pop_front() {
                Some(tid) => {
                    let task = st.tasks.get_mut(&tid).expect("sleeper in table");
                    task.sleep_result = result;
                    enqueue(st, tid);
                    Some(tid)
                }
                None => None,
            }
        };

        match woken {
            Some(tid) => may_yield(tid),
            None => break,
        }
    }
}

/// Wake the highest-priority sleeper on `queue` (FIFO on ties). Lock held.
pub(crate) fn wakeup_one_locked(queue: WaitListId, result: i32) {
    debug_assert!(holding(), "wakeup without scheduler lock");

    let woken = {
        // SAFETY: Lock held; borrow ends before may_yield.
        let st = unsafe { state() };
        let Some(list) = st.wait_lists.get(&queue) else {
            return;
        };

        let mut best: Option<(usize, TaskId, u8)> = None;
        for (pos, tid) in list.iter().enumerate() {
            let prio = st.tasks.get(tid).expect("sleeper in table").priority;
            // Strict inequality keeps the scan FIFO among equals.
            if best.is_none_or(|(_, _, best_prio)| outranks(prio, best_prio)) {
                best = Some((pos, *tid, prio));
            }
        }

        best.map(|(pos, tid, _)| {
            let list = st.wait_lists.get_mut(&queue).expect("checked above");
            list.remove(pos);
            let task = st.tasks.get_mut(&tid).expect("sleeper in table");
            task.sleep_result = result;
            enqueue(st, tid);
            tid
        })
    };

    if let Some(tid) = woken {
        may_yield(tid);
    }
}

// -- Wait list registry

/// Register a new wait list.
pub fn wait_list_create() -> WaitListId {
    lock();
    let id = {
        // SAFETY: Lock held.
        let st = unsafe { state() };
        let id = WaitListId(st.next_wait_list);
        st.next_wait_list += 1;
        st.wait_lists.insert(id, VecDeque::new());
        id
    };
    unlock();
    id
}

/// Wake all remaining sleepers with `result` and unregister the list.
pub fn wait_list_destroy(queue: WaitListId, result: i32) {
    lock();
    wakeup_all_locked(queue, result);
    // SAFETY: Lock held; wakeup_all drained the list.
    unsafe { state() }.wait_lists.remove(&queue);
    unlock();
}

// -- ISR nesting

/// Note that ISR processing started on this CPU.
pub fn isr_enter() {
    cpu::irq_save();
    // SAFETY: Interrupts disabled.
    unsafe { cpu::current() }.isr_nesting += 1;
    cpu::irq_restore();
}

/// Note that ISR processing finished.
///
/// At the outermost boundary, honor a delayed reschedule recorded by a
/// wakeup that ran inside the ISR.
pub fn isr_exit() {
    lock();

    // SAFETY: Lock held implies interrupts disabled.
    let my_cpu = unsafe { cpu::current() };
    if my_cpu.isr_nesting == 0 {
        panic!("isr_exit: nesting underflow");
    }
    my_cpu.isr_nesting -= 1;

    if my_cpu.isr_nesting == 0 {
        if let Some(tid) = my_cpu.task {
            let resched = {
                // SAFETY: Lock held.
                let st = unsafe { state() };
                let task = st.tasks.get_mut(&tid).expect("current task in table");
                let pending = task.flags.contains(TaskFlags::RESCHEDULE);
                if pending {
                    task.flags.remove(TaskFlags::RESCHEDULE);
                    enqueue(st, tid);
                }
                pending
            };
            if resched {
                yield_to_scheduler();
            }
        }
    }

    unlock();
}

// -- Main loop

/// The scheduler main loop, one per CPU. Never returns.
///
/// Dequeues the highest-priority ready task, loads its address space if it
/// belongs to a process, and switches to it. When the task yields back,
/// the kernel address space is restored and, if the task reached
/// `Destroyed`, its stack and descriptor are reclaimed outside the lock.
/// With nothing to run, the CPU idles in WFI with interrupts enabled.
pub fn start() -> ! {
    lock();

    loop {
        // SAFETY: Lock held; borrow ends before the switch.
        let next = { unsafe { state() }.pop_ready_for_run() };

        let Some((tid, ctx, vm_ttb)) = next else {
            unlock();
            arch_cpu::irq_enable();
            arch_cpu::wait_for_interrupt();
            lock();
            continue;
        };

        // SAFETY: Lock held implies interrupts disabled.
        let my_cpu = unsafe { cpu::current() };
        my_cpu.task = Some(tid);

        if let Some(ttb) = vm_ttb {
            mmu::load_user(ttb);
        }

        // SAFETY: The slot is this CPU's scheduler-context field and ctx
        // is the task's parked frame; no state borrow is live.
        unsafe {
            let my_cpu = cpu::current();
            context_switch(
                &mut my_cpu.sched_context as *mut *mut osmium_arch::Context,
                ctx,
            );
        }

        // The task yielded back to us.
        // SAFETY: Lock is held again (travelled with the switch).
        let my_cpu = unsafe { cpu::current() };
        my_cpu.task = None;

        if vm_ttb.is_some() {
            mmu::load_kernel();
        }

        let reap = {
            // SAFETY: Lock held.
            let st = unsafe { state() };
            let task = st.tasks.get_mut(&tid).expect("switched-from task in table");
            task.cpu = None;
            if task.state == TaskState::Destroyed {
                st.tasks.remove(&tid)
            } else {
                None
            }
        };

        if let Some(task) = reap {
            // Free the kernel stack and descriptor outside the lock.
            unlock();
            drop(task);
            lock();
        }
    }
}

impl SchedState {
    /// Dequeue the next task and mark it running on this CPU.
    ///
    /// Returns its id, parked context, and translation-table root.
    fn pop_ready_for_run(&mut self) -> Option<(TaskId, *mut osmium_arch::Context, Option<usize>)> {
        let tid = dequeue(self)?;
        let task = self.tasks.get_mut(&tid).expect("queued task in table");
        debug_assert_eq!(task.state, TaskState::Ready);

        task.state = TaskState::Running;
        task.cpu = Some(cpu::id());
        Some((tid, task.context, task.vm_ttb))
    }
}

/// The currently executing task, if any.
#[must_use]
pub fn current() -> Option<TaskId> {
    cpu::irq_save();
    // SAFETY: Interrupts disabled.
    let tid = unsafe { cpu::current() }.task;
    cpu::irq_restore();
    tid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task;

    fn noop_entry(_arg: usize) {}

    /// Serialize scheduler tests and start each from pristine state.
    fn setup() -> crate::test_sync::TestGuard {
        let guard = crate::test_sync::guard();
        init();
        lock();
        // SAFETY: Lock held.
        let st = unsafe { state() };
        st.tasks.clear();
        for q in &mut st.run_queues {
            q.clear();
        }
        st.wait_lists.clear();
        st.timers.clear();
        // SAFETY: Interrupts conceptually disabled on the host.
        unsafe { cpu::current() }.task = None;
        unlock();
        guard
    }

    fn spawn(priority: u8) -> TaskId {
        task::create(None, noop_entry, 0, priority).expect("create task")
    }

    #[test]
    fn test_resume_enqueues_by_priority() {
        let _g = setup();
        let low = spawn(30);
        let high = spawn(5);
        let mid = spawn(20);

        task::resume(low).unwrap();
        task::resume(high).unwrap();
        task::resume(mid).unwrap();

        lock();
        // SAFETY: Lock held.
        let st = unsafe { state() };
        assert_eq!(dequeue(st), Some(high));
        assert_eq!(dequeue(st), Some(mid));
        assert_eq!(dequeue(st), Some(low));
        assert_eq!(dequeue(st), None);
        unlock();
    }

    #[test]
    fn test_runqueue_is_fifo_within_priority() {
        let _g = setup();
        let a = spawn(10);
        let b = spawn(10);
        let c = spawn(10);
        for tid in [a, b, c] {
            task::resume(tid).unwrap();
        }

        lock();
        // SAFETY: Lock held.
        let st = unsafe { state() };
        assert_eq!(dequeue(st), Some(a));
        assert_eq!(dequeue(st), Some(b));
        assert_eq!(dequeue(st), Some(c));
        unlock();
    }

    #[test]
    fn test_resume_requires_suspended() {
        let _g = setup();
        let t = spawn(10);
        task::resume(t).unwrap();
        assert_eq!(task::resume(t), Err(osmium_abi::Errno::EINVAL));
    }

    #[test]
    fn test_wakeup_one_picks_highest_priority_fifo_on_ties() {
        let _g = setup();
        let q = wait_list_create();

        let sleepers = [spawn(20), spawn(5), spawn(5), spawn(30)];
        lock();
        {
            // SAFETY: Lock held.
            let st = unsafe { state() };
            for tid in sleepers {
                let task = st.tasks.get_mut(&tid).unwrap();
                task.state = TaskState::Sleeping;
                task.wait_list = Some(q);
                st.wait_lists.get_mut(&q).unwrap().push_back(tid);
            }
        }
        wakeup_one_locked(q, 0);
        {
            // SAFETY: Lock held.
            let st = unsafe { state() };
            // The first of the two priority-5 sleepers wins the tie.
            assert_eq!(st.run_queues[5].front(), Some(&sleepers[1]));
            assert_eq!(st.wait_lists[&q].len(), 3);
            assert_eq!(st.tasks[&sleepers[1]].state, TaskState::Ready);
        }
        unlock();
    }

    #[test]
    fn test_wakeup_all_records_result() {
        let _g = setup();
        let q = wait_list_create();
        let a = spawn(10);
        let b = spawn(12);

        lock();
        {
            // SAFETY: Lock held.
            let st = unsafe { state() };
            for tid in [a, b] {
                let task = st.tasks.get_mut(&tid).unwrap();
                task.state = TaskState::Sleeping;
                task.wait_list = Some(q);
                st.wait_lists.get_mut(&q).unwrap().push_back(tid);
            }
        }
        wakeup_all_locked(q, -42);
        {
            // SAFETY: Lock held.
            let st = unsafe { state() };
            assert!(st.wait_lists[&q].is_empty());
            for tid in [a, b] {
                assert_eq!(st.tasks[&tid].state, TaskState::Ready);
                assert_eq!(st.tasks[&tid].sleep_result, -42);
            }
        }
        unlock();
    }

    #[test]
    fn test_wait_list_destroy_wakes_with_result() {
        let _g = setup();
        let q = wait_list_create();
        let t = spawn(10);

        lock();
        {
            // SAFETY: Lock held.
            let st = unsafe { state() };
            let task = st.tasks.get_mut(&t).unwrap();
            task.state = TaskState::Sleeping;
            task.wait_list = Some(q);
            st.wait_lists.get_mut(&q).unwrap().push_back(t);
        }
        unlock();

        wait_list_destroy(q, osmium_abi::Errno::EINVAL.as_neg());

        lock();
        {
            // SAFETY: Lock held.
            let st = unsafe { state() };
            assert!(!st.wait_lists.contains_key(&q));
            assert_eq!(
                st.tasks[&t].sleep_result,
                osmium_abi::Errno::EINVAL.as_neg()
            );
            assert_eq!(st.tasks[&t].state, TaskState::Ready);
        }
        unlock();
    }

    #[test]
    fn test_may_yield_without_current_task_is_noop() {
        let _g = setup();
        let t = spawn(0);
        task::resume(t).unwrap();
        // No current task on the host: nothing to preempt, no panic.
        lock();
        may_yield(t);
        unlock();
    }
}
