//! Task lifecycle
//!
//! A task is the unit of CPU scheduling: an entry function, a one-page
//! kernel stack, and a saved callee-save context carved from the stack
//! top. Tasks backing a process additionally reserve a user trap frame
//! above the context.
//!
//! Lifecycle: `create` (Suspended) → `resume` (Ready) → scheduled
//! (Running) → `exit` (Destroyed) → reclaimed by whichever scheduler loop
//! observes the Destroyed state on return from the switch.

use bitflags::bitflags;
use spin::Once;

use osmium_abi::Errno;
use osmium_arch::cpu as arch_cpu;
use osmium_arch::{Context, TrapFrame};

use crate::mm::{KCache, PageBox};
use crate::process::Pid;
use crate::sched::{self, WaitListId, TASK_MAX_PRIORITIES};

/// Unique task identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u32);

/// Scheduling state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Created but not yet runnable.
    Suspended,
    /// Linked into its priority run queue.
    Ready,
    /// Executing on exactly one CPU.
    Running,
    /// Parked on a wait list (or timer only).
    Sleeping,
    /// Finished; awaiting reclamation by a scheduler loop.
    Destroyed,
}

bitflags! {
    /// Task condition flags, guarded by the scheduler lock.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// A higher-priority task became ready while preemption was
        /// forbidden; yield at the next safe point.
        const RESCHEDULE = 1 << 0;
    }
}

/// The unit of kernel scheduling.
pub struct Task {
    /// Entry function, called once from the first-resume trampoline.
    pub(crate) entry: fn(usize),
    /// Argument handed to `entry`.
    pub(crate) arg: usize,
    /// Owned kernel stack (one page).
    #[allow(dead_code)] // owned for Drop; accessed through raw pointers
    pub(crate) kstack: PageBox,
    /// Saved callee-save context; points into `kstack`.
    pub(crate) context: *mut Context,
    /// User trap frame at the stack top, present iff `process` is set.
    pub(crate) trap_frame: Option<*mut TrapFrame>,
    /// Scheduling priority; smaller is higher.
    pub(crate) priority: u8,
    pub(crate) state: TaskState,
    pub(crate) flags: TaskFlags,
    /// Value returned from the current sleep.
    pub(crate) sleep_result: i32,
    /// Deadline of the armed sleep timer, if any.
    pub(crate) sleep_deadline: Option<u64>,
    /// Wait list this task is parked on, if Sleeping.
    pub(crate) wait_list: Option<WaitListId>,
    /// CPU this task is running on, if Running.
    pub(crate) cpu: Option<usize>,
    /// Owning process, if this task backs one.
    pub(crate) process: Option<Pid>,
    /// Translation-table root to load while this task runs.
    pub(crate) vm_ttb: Option<usize>,
}

// SAFETY: The raw pointers all point into the task's own kstack; access
// is serialized by the scheduler lock.
unsafe impl Send for Task {}

fn task_cache() -> &'static KCache<Task> {
    static CACHE: Once<KCache<Task>> = Once::new();
    CACHE.call_once(|| KCache::create("task"))
}

/// Create a task in the Suspended state.
///
/// Allocates the descriptor from the task cache and a one-page kernel
/// stack, and fabricates an initial context so the first resume lands in
/// the trampoline. If `process` is given, a zeroed user trap frame is
/// reserved at the stack top.
pub fn create(
    process: Option<Pid>,
    entry: fn(usize),
    arg: usize,
    priority: u8,
) -> Result<TaskId, Errno> {
    if priority as usize >= TASK_MAX_PRIORITIES {
        return Err(Errno::EINVAL);
    }

    let kstack = PageBox::alloc_zeroed(0)?;
    let mut sp = kstack.top();

    let trap_frame = if process.is_some() {
        sp -= core::mem::size_of::<TrapFrame>();
        Some(sp as *mut TrapFrame)
    } else {
        None
    };

    sp -= core::mem::size_of::<Context>();
    let context = sp as *mut Context;
    // SAFETY: sp lies inside the freshly allocated stack with room for a
    // Context, and nothing else references the stack yet.
    unsafe { context.write(Context::with_entry(task_run as usize)) };

    let task = task_cache().alloc(Task {
        entry,
        arg,
        kstack,
        context,
        trap_frame,
        priority,
        state: TaskState::Suspended,
        flags: TaskFlags::empty(),
        sleep_result: 0,
        sleep_deadline: None,
        wait_list: None,
        cpu: None,
        process,
        vm_ttb: None,
    })?;

    sched::lock();
    let tid = {
        // SAFETY: Lock held.
        let st = unsafe { sched::state() };
        let tid = TaskId(st.next_task_id());
        st.tasks.insert(tid, task);
        tid
    };
    sched::unlock();

    Ok(tid)
}

impl super::SchedState {
    pub(crate) fn next_task_id(&mut self) -> u32 {
        let id = self.next_task;
        self.next_task += 1;
        id
    }
}

/// Resume a Suspended task, making it Ready.
///
/// Fails with `EINVAL` in any other state. May preempt the caller if the
/// resumed task outranks it.
pub fn resume(tid: TaskId) -> Result<(), Errno> {
    sched::lock();

    let ok = {
        // SAFETY: Lock held; borrow ends before may_yield.
        let st = unsafe { sched::state() };
        let suspended = st.tasks.get(&tid).map(|t| t.state) == Some(TaskState::Suspended);
        if suspended {
            sched::enqueue(st, tid);
        }
        suspended
    };

    if ok {
        sched::may_yield(tid);
    }

    sched::unlock();
    if ok { Ok(()) } else { Err(Errno::EINVAL) }
}

/// Give up the CPU, staying Ready.
pub fn yield_now() {
    sched::lock();

    // SAFETY: Lock held implies interrupts disabled.
    let tid = unsafe { crate::cpu::current() }
        .task
        .expect("yield without a current task");
    {
        // SAFETY: Lock held; borrow ends before the switch.
        let st = unsafe { sched::state() };
        sched::enqueue(st, tid);
    }
    sched::yield_to_scheduler();

    sched::unlock();
}

/// Terminate the current task. Never returns.
///
/// Marks the task Destroyed under the scheduler lock and yields; storage
/// is reclaimed by the scheduler loop that observes the state.
pub fn exit() -> ! {
    sched::lock();

    // SAFETY: Lock held implies interrupts disabled.
    let tid = unsafe { crate::cpu::current() }
        .task
        .expect("exit without a current task");
    {
        // SAFETY: Lock held; borrow ends before the switch.
        let st = unsafe { sched::state() };
        sched::timer::disarm(st, tid);
        let task = st.tasks.get_mut(&tid).expect("current task in table");
        task.state = TaskState::Destroyed;
    }
    sched::yield_to_scheduler();

    unreachable!("destroyed task was rescheduled");
}

/// Run `f` on the current task's trap frame.
///
/// Returns `None` for pure kernel tasks.
pub(crate) fn with_trap_frame<R>(tid: TaskId, f: impl FnOnce(&mut TrapFrame) -> R) -> Option<R> {
    sched::lock();
    let r = {
        // SAFETY: Lock held.
        let st = unsafe { sched::state() };
        st.tasks.get(&tid).and_then(|t| t.trap_frame).map(|tf| {
            // SAFETY: The frame lives at the top of the task's kstack for
            // the task's whole lifetime; the scheduler lock serializes us.
            f(unsafe { &mut *tf })
        })
    };
    sched::unlock();
    r
}

/// The process `tid` belongs to, if any.
pub(crate) fn process_of(tid: TaskId) -> Option<Pid> {
    sched::lock();
    let pid = {
        // SAFETY: Lock held.
        let st = unsafe { sched::state() };
        st.tasks.get(&tid).and_then(|t| t.process)
    };
    sched::unlock();
    pid
}

/// Tear down a task that was never resumed.
///
/// Used to unwind failed process construction; a task in any other state
/// is left alone.
pub(crate) fn destroy_suspended(tid: TaskId) {
    sched::lock();
    let task = {
        // SAFETY: Lock held.
        let st = unsafe { sched::state() };
        let suspended = st.tasks.get(&tid).map(|t| t.state) == Some(TaskState::Suspended);
        if suspended {
            st.tasks.remove(&tid)
        } else {
            None
        }
    };
    sched::unlock();

    // The descriptor and stack go back to their pools outside the lock.
    drop(task);
}

/// Record the translation-table root the scheduler should load for `tid`.
pub(crate) fn set_vm_ttb(tid: TaskId, ttb: Option<usize>) {
    sched::lock();
    {
        // SAFETY: Lock held.
        let st = unsafe { sched::state() };
        if let Some(task) = st.tasks.get_mut(&tid) {
            task.vm_ttb = ttb;
        }
    }
    sched::unlock();
}

/// First-entry trampoline: every task begins executing here.
///
/// The scheduler lock is still held from the loop that switched us in;
/// release it, enable interrupts, run the entry function, and destroy the
/// task when it returns.
extern "C" fn task_run() -> ! {
    let (entry, arg) = {
        // SAFETY: Lock held (inherited across the first switch).
        let st = unsafe { sched::state() };
        // SAFETY: We are the current task; interrupts are disabled.
        let tid = unsafe { crate::cpu::current() }
            .task
            .expect("trampoline without a current task");
        let task = st.tasks.get(&tid).expect("current task in table");
        (task.entry, task.arg)
    };

    sched::unlock();
    arch_cpu::irq_enable();

    entry(arg);

    exit();
}
