//! Process lifecycle
//!
//! A process is a user-visible job stacked on a single kernel task: an
//! address space, an open-file table, credentials, a PID, and a place in
//! the parent/child forest. The forest's child edges own the process
//! descriptors (`Arc`); the child-to-parent edge is a plain PID back
//! reference, rewritten to init on reparenting.
//!
//! Locking: the PID table has its own spinlock; the forest (parent/child
//! links, zombie flags, exit codes) is guarded by the single process
//! spinlock, distinct from the scheduler lock. Per-process resources
//! (address space, files, cwd, credentials) each sit behind their own
//! small lock and are only touched by the owning task, plus briefly by
//! the parent during fork.

pub mod file;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use osmium_abi::{Errno, WaitOptions, WaitTarget};
use osmium_arch::trap;

use crate::elf;
use crate::mm::VmSpace;
use crate::sched::{self, task, TaskId, NZERO};
use crate::sync::{Spinlock, WaitChannel};
use file::{FileTable, Inode};

/// Process identifier. Positive for live processes.
pub type Pid = i32;

/// User identity and file-creation mask.
#[derive(Clone, Copy, Debug)]
pub struct Credentials {
    pub ruid: u32,
    pub euid: u32,
    pub rgid: u32,
    pub egid: u32,
    pub umask: u32,
}

impl Credentials {
    /// Root with a wide-open umask: what PID 1 starts as.
    const fn root() -> Self {
        Self {
            ruid: 0,
            euid: 0,
            rgid: 0,
            egid: 0,
            umask: 0,
        }
    }
}

/// A user-visible job.
pub struct Process {
    pub pid: Pid,
    /// The kernel task carrying this process (1:1).
    pub task: TaskId,
    vm: Spinlock<Option<VmSpace>>,
    files: Spinlock<FileTable>,
    cwd: Spinlock<Option<Arc<Inode>>>,
    creds: Spinlock<Credentials>,
    /// The parent sleeps here in `wait`; children wake it on exit.
    wait_queue: WaitChannel,
}

/// One node of the process forest, guarded by the process lock.
struct Node {
    proc: Arc<Process>,
    parent: Option<Pid>,
    children: Vec<Pid>,
    zombie: bool,
    exit_code: i32,
}

/// Parent/child relationships, zombie flags, and exit codes.
struct Forest {
    nodes: BTreeMap<Pid, Node>,
    init: Option<Pid>,
}

static PROCESS_LOCK: Spinlock<Forest> = Spinlock::new(
    "process",
    Forest {
        nodes: BTreeMap::new(),
        init: None,
    },
);

/// PID allocation and lookup.
struct PidTable {
    map: BTreeMap<Pid, Arc<Process>>,
    next: Pid,
}

static PID_TABLE: Spinlock<PidTable> = Spinlock::new(
    "pid_table",
    PidTable {
        map: BTreeMap::new(),
        next: 0,
    },
);

/// Look up a live (not yet exited) process by PID.
#[must_use]
pub fn pid_lookup(pid: Pid) -> Option<Arc<Process>> {
    PID_TABLE.lock().map.get(&pid).cloned()
}

/// The process the current task belongs to.
#[must_use]
pub fn current() -> Option<Arc<Process>> {
    let tid = sched::current()?;
    let pid = task::process_of(tid)?;
    pid_lookup(pid)
}

impl Process {
    /// Run `f` on this process's credentials.
    pub fn with_creds<R>(&self, f: impl FnOnce(&mut Credentials) -> R) -> R {
        f(&mut self.creds.lock())
    }

    /// Run `f` on this process's open-file table.
    pub fn with_files<R>(&self, f: impl FnOnce(&mut FileTable) -> R) -> R {
        f(&mut self.files.lock())
    }

    /// Run `f` on this process's address space.
    ///
    /// Fails with `EINVAL` once the space has been torn down at exit.
    pub fn with_vm<R>(&self, f: impl FnOnce(&mut VmSpace) -> R) -> Result<R, Errno> {
        match self.vm.lock().as_mut() {
            Some(vm) => Ok(f(vm)),
            None => Err(Errno::EINVAL),
        }
    }
}

// -- Construction

/// Allocate a process shell: descriptor, kernel task, PID table entry,
/// forest node, empty file table, root credentials.
fn alloc() -> Result<Arc<Process>, Errno> {
    let pid = {
        let mut table = PID_TABLE.lock();
        table.next = table.next.checked_add(1).unwrap_or_else(|| {
            // Monotonic PIDs; wrapping into negatives would corrupt the
            // selector encoding in wait.
            panic!("pid overflow")
        });
        table.next
    };

    let tid = task::create(Some(pid), run, 0, NZERO)?;

    let proc = Arc::new(Process {
        pid,
        task: tid,
        vm: Spinlock::new("process_vm", None),
        files: Spinlock::new("process_files", FileTable::new()),
        cwd: Spinlock::new("process_cwd", None),
        creds: Spinlock::new("process_creds", Credentials::root()),
        wait_queue: WaitChannel::new(),
    });

    PID_TABLE.lock().map.insert(pid, Arc::clone(&proc));
    PROCESS_LOCK.lock().nodes.insert(
        pid,
        Node {
            proc: Arc::clone(&proc),
            parent: None,
            children: Vec::new(),
            zombie: false,
            exit_code: 0,
        },
    );

    Ok(proc)
}

/// Undo [`alloc`] for a process whose construction failed before resume.
fn free_embryo(proc: &Arc<Process>) {
    PID_TABLE.lock().map.remove(&proc.pid);
    PROCESS_LOCK.lock().nodes.remove(&proc.pid);
    task::destroy_suspended(proc.task);
}

/// Give the process a fresh, empty address space.
fn setup_vm(proc: &Arc<Process>) -> Result<(), Errno> {
    let vm = VmSpace::create()?;
    task::set_vm_ttb(proc.task, Some(vm.ttb_phys()));
    *proc.vm.lock() = Some(vm);
    Ok(())
}

/// Load `image` into the process and prime its user trap frame.
fn load_binary(proc: &Arc<Process>, image: &[u8]) -> Result<(), Errno> {
    let mut vm_slot = proc.vm.lock();
    let vm = vm_slot.as_mut().ok_or(Errno::EINVAL)?;

    task::with_trap_frame(proc.task, |tf| elf::load_binary(vm, tf, image))
        .ok_or(Errno::EINVAL)?
}

/// Create a process from an ELF image and set it running.
///
/// Each construction step's error propagates; partial construction is
/// unwound (address space destroyed, shell freed) on any failure. The
/// first process ever created becomes init, the reparent target for every
/// later orphan.
pub fn create(image: &[u8]) -> Result<Pid, Errno> {
    let proc = alloc()?;

    let built = setup_vm(&proc).and_then(|()| load_binary(&proc, image));
    if let Err(e) = built {
        *proc.vm.lock() = None;
        free_embryo(&proc);
        return Err(e);
    }

    {
        let mut forest = PROCESS_LOCK.lock();
        if forest.init.is_none() {
            forest.init = Some(proc.pid);
        }
    }

    task::resume(proc.task).expect("fresh process task is suspended");
    Ok(proc.pid)
}

// -- Fork

/// Duplicate the calling process.
///
/// The child gets a copy-on-write clone of the address space, duplicates
/// of every open descriptor (same file objects, shared offsets), the
/// parent's credentials, umask, and working directory, and a copy of the
/// parent's trap frame with the syscall return register forced to zero —
/// fork returns 0 in the child and the child's PID in the parent.
pub fn copy() -> Result<Pid, Errno> {
    let parent = current().ok_or(Errno::ESRCH)?;
    let child = alloc()?;

    let cloned = parent
        .with_vm(|vm| vm.try_clone())
        .unwrap_or(Err(Errno::EINVAL));
    let child_vm = match cloned {
        Ok(vm) => vm,
        Err(e) => {
            free_embryo(&child);
            return Err(e);
        }
    };
    task::set_vm_ttb(child.task, Some(child_vm.ttb_phys()));
    *child.vm.lock() = Some(child_vm);

    // Child resumes exactly where the parent trapped, but sees 0.
    let Some(frame) = task::with_trap_frame(parent.task, |tf| tf.clone()) else {
        free_embryo(&child);
        return Err(Errno::EINVAL);
    };
    task::with_trap_frame(child.task, |tf| {
        *tf = frame;
        tf.set_ret(0);
    })
    .expect("child task carries a trap frame");

    *child.files.lock() = parent.files.lock().duplicate();
    *child.creds.lock() = *parent.creds.lock();
    *child.cwd.lock() = parent.cwd.lock().clone();

    {
        let mut forest = PROCESS_LOCK.lock();
        let pid = child.pid;
        if let Some(node) = forest.nodes.get_mut(&pid) {
            node.parent = Some(parent.pid);
        }
        if let Some(node) = forest.nodes.get_mut(&parent.pid) {
            node.children.push(pid);
        }
    }

    task::resume(child.task).expect("fresh child task is suspended");
    Ok(child.pid)
}

// -- Exit

/// Release resources and move `pid` to the zombie state.
///
/// Everything `destroy` does short of terminating the task: unlink from
/// the PID table, tear down the address space, close every file, drop the
/// cwd, hand all children to init (waking init iff one of them is already
/// a zombie), record the exit code, and wake the parent's wait queue.
fn exit_bookkeeping(proc: &Arc<Process>, status: i32) {
    PID_TABLE.lock().map.remove(&proc.pid);

    *proc.vm.lock() = None;
    task::set_vm_ttb(proc.task, None);
    proc.files.lock().close_all();
    *proc.cwd.lock() = None;

    let mut forest = PROCESS_LOCK.lock();
    let init_pid = forest.init.expect("init process exists");

    let orphans = match forest.nodes.get_mut(&proc.pid) {
        Some(node) => core::mem::take(&mut node.children),
        None => Vec::new(),
    };

    let mut orphan_zombies = false;
    for orphan in orphans {
        if let Some(node) = forest.nodes.get_mut(&orphan) {
            node.parent = Some(init_pid);
            orphan_zombies |= node.zombie;
        }
        if let Some(init_node) = forest.nodes.get_mut(&init_pid) {
            init_node.children.push(orphan);
        }
    }

    if orphan_zombies {
        if let Some(init_node) = forest.nodes.get(&init_pid) {
            init_node.proc.wait_queue.wakeup_all();
        }
    }

    let parent = forest.nodes.get_mut(&proc.pid).and_then(|node| {
        node.zombie = true;
        node.exit_code = status;
        node.parent
    });

    if let Some(parent_pid) = parent {
        if let Some(parent_node) = forest.nodes.get(&parent_pid) {
            parent_node.proc.wait_queue.wakeup_all();
        }
    }
}

/// Terminate the calling process with `status`. Never returns.
pub fn destroy(status: i32) -> ! {
    let proc = current().expect("destroy outside a process");
    exit_bookkeeping(&proc, status);
    task::exit();
}

// -- Wait

/// Reap a child of `caller`, sleeping until one exits.
///
/// The selector follows `wait(2)`: a positive PID matches exactly; `-1`,
/// `0`, and anything below `-1` match any child (process groups are not
/// modeled in this kernel, so the two group selectors fall back to "any").
/// A reaped child's exit code lands in `status` and its PID is returned;
/// with no matching children the result is `-ECHILD`; with
/// [`WaitOptions::NOHANG`] and no zombie yet, 0.
fn wait_on(
    caller: &Arc<Process>,
    target: WaitTarget,
    status: &mut i32,
    options: WaitOptions,
) -> Result<Pid, Errno> {
    let mut forest = PROCESS_LOCK.lock();

    loop {
        let mut any_match = false;
        let mut zombie: Option<Pid> = None;

        if let Some(node) = forest.nodes.get(&caller.pid) {
            for child in &node.children {
                if !target.matches(*child) {
                    continue;
                }
                any_match = true;
                if forest.nodes.get(child).is_some_and(|c| c.zombie) {
                    zombie = Some(*child);
                    break;
                }
            }
        }

        if let Some(pid) = zombie {
            if let Some(node) = forest.nodes.get_mut(&caller.pid) {
                node.children.retain(|c| *c != pid);
            }
            let reaped = forest.nodes.remove(&pid).expect("zombie node exists");
            drop(forest);

            *status = reaped.exit_code;
            // The descriptor dies with the forest's edge.
            drop(reaped);
            return Ok(pid);
        }

        if !any_match {
            return Err(Errno::ECHILD);
        }
        if options.contains(WaitOptions::NOHANG) {
            return Ok(0);
        }

        forest = caller.wait_queue.sleep(&PROCESS_LOCK, forest);
    }
}

/// `wait` entry point for the calling process.
pub fn wait(pid: i32, status: &mut i32, options: WaitOptions) -> Result<Pid, Errno> {
    let caller = current().ok_or(Errno::ECHILD)?;
    wait_on(&caller, WaitTarget::from_raw(pid), status, options)
}

// -- Misc process services

/// Grow the calling process's data segment (`sbrk`).
pub fn grow(increment: usize) -> Result<usize, Errno> {
    let proc = current().ok_or(Errno::ESRCH)?;
    proc.with_vm(|vm| vm.grow(increment))?
}

/// Replace the calling process's image (`exec`).
///
/// The old address space is discarded and `image` is loaded into a fresh
/// one; descriptors, credentials, and cwd carry over. On a load failure
/// the old image is already gone, so the process is destroyed.
pub fn exec(image: &[u8]) -> Result<(), Errno> {
    let proc = current().ok_or(Errno::ESRCH)?;

    *proc.vm.lock() = None;
    if let Err(e) = setup_vm(&proc).and_then(|()| load_binary(&proc, image)) {
        log::warn!("exec failed for pid {}: {:?}", proc.pid, e);
        destroy(Errno::ENOENT.as_neg());
    }
    Ok(())
}

/// Task entry for every process: the first process mounts its working
/// directory at the root, then execution "returns" to user space through
/// the trap frame primed by the loader.
fn run(_arg: usize) {
    let proc = current().expect("process task without a process");

    if proc.cwd.lock().is_none() {
        *proc.cwd.lock() = Some(file::root_inode());
    }

    let tf = task::with_trap_frame(proc.task, |tf| tf as *const trap::TrapFrame)
        .expect("process task carries a trap frame");

    // SAFETY: The frame sits at the top of this task's kernel stack and
    // was primed by the binary loader; our address space is loaded.
    unsafe { trap::enter_user(tf) }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ELF32 image the loader accepts (one tiny segment).
    fn tiny_image() -> alloc::vec::Vec<u8> {
        crate::elf::tests::sample_elf(0x1_0000, 0x1_0000, b"\0\0\0\0", 4)
    }

    fn setup() -> crate::test_sync::TestGuard {
        let guard = crate::test_sync::guard();
        crate::sched::init();
        // Fresh forest and PID table for every test.
        {
            let mut forest = PROCESS_LOCK.lock();
            forest.nodes.clear();
            forest.init = None;
        }
        {
            let mut table = PID_TABLE.lock();
            table.map.clear();
        }
        guard
    }

    /// Build a child of `parent` the way fork's bookkeeping does.
    fn adopt(parent: &Arc<Process>, child: &Arc<Process>) {
        let mut forest = PROCESS_LOCK.lock();
        forest
            .nodes
            .get_mut(&child.pid)
            .expect("child node")
            .parent = Some(parent.pid);
        forest
            .nodes
            .get_mut(&parent.pid)
            .expect("parent node")
            .children
            .push(child.pid);
    }

    fn make_init() -> Arc<Process> {
        let proc = alloc().unwrap();
        PROCESS_LOCK.lock().init = Some(proc.pid);
        proc
    }

    #[test]
    fn test_create_assigns_monotonic_pids() {
        let _g = setup();
        let a = create(&tiny_image()).unwrap();
        let b = create(&tiny_image()).unwrap();
        assert!(b > a);
        assert!(pid_lookup(a).is_some());
        assert!(pid_lookup(b).is_some());
    }

    #[test]
    fn test_create_rejects_garbage_image() {
        let _g = setup();
        let before = PID_TABLE.lock().map.len();
        assert_eq!(create(b"not an elf"), Err(Errno::EINVAL));
        // The embryo was unwound.
        assert_eq!(PID_TABLE.lock().map.len(), before);
    }

    #[test]
    fn test_first_process_becomes_init() {
        let _g = setup();
        let pid = create(&tiny_image()).unwrap();
        assert_eq!(PROCESS_LOCK.lock().init, Some(pid));
    }

    #[test]
    fn test_exit_reparents_children_to_init() {
        let _g = setup();
        let init = make_init();
        let parent = alloc().unwrap();
        let c1 = alloc().unwrap();
        let c2 = alloc().unwrap();
        adopt(&init, &parent);
        adopt(&parent, &c1);
        adopt(&parent, &c2);

        // C2 is already a zombie when the parent dies.
        exit_bookkeeping(&c2, 3);
        exit_bookkeeping(&parent, 7);

        let forest = PROCESS_LOCK.lock();
        assert_eq!(forest.nodes[&c1.pid].parent, Some(init.pid));
        assert_eq!(forest.nodes[&c2.pid].parent, Some(init.pid));
        assert!(forest.nodes[&c2.pid].zombie);
        assert!(forest.nodes[&parent.pid].zombie);
        assert_eq!(forest.nodes[&parent.pid].exit_code, 7);
        let init_children = &forest.nodes[&init.pid].children;
        assert!(init_children.contains(&c1.pid));
        assert!(init_children.contains(&c2.pid));
    }

    #[test]
    fn test_exit_unlinks_pid_and_releases_resources() {
        let _g = setup();
        let _init = make_init();
        let proc = alloc().unwrap();
        setup_vm(&proc).unwrap();

        exit_bookkeeping(&proc, 0);

        assert!(pid_lookup(proc.pid).is_none());
        assert!(proc.vm.lock().is_none());
        assert_eq!(proc.files.lock().open_count(), 0);
        assert!(proc.cwd.lock().is_none());
    }

    #[test]
    fn test_wait_reaps_zombie_exactly_once() {
        let _g = setup();
        let init = make_init();
        let child = alloc().unwrap();
        let child_pid = child.pid;
        adopt(&init, &child);

        exit_bookkeeping(&child, 42);
        drop(child);

        let mut status = 0;
        let reaped = wait_on(
            &init,
            WaitTarget::from_raw(child_pid),
            &mut status,
            WaitOptions::empty(),
        )
        .unwrap();
        assert_eq!(reaped, child_pid);
        assert_eq!(status, 42);

        // A second wait on the same PID has no child to find.
        assert_eq!(
            wait_on(
                &init,
                WaitTarget::from_raw(child_pid),
                &mut status,
                WaitOptions::empty()
            ),
            Err(Errno::ECHILD)
        );
    }

    #[test]
    fn test_wait_nohang_on_live_child_returns_zero() {
        let _g = setup();
        let init = make_init();
        let child = alloc().unwrap();
        adopt(&init, &child);

        let mut status = -1;
        let r = wait_on(
            &init,
            WaitTarget::from_raw(child.pid),
            &mut status,
            WaitOptions::NOHANG,
        )
        .unwrap();
        assert_eq!(r, 0);
        // Status stays untouched.
        assert_eq!(status, -1);
    }

    #[test]
    fn test_wait_any_reaps_the_zombie_not_the_live_child() {
        let _g = setup();
        let init = make_init();
        let live = alloc().unwrap();
        let dead = alloc().unwrap();
        adopt(&init, &live);
        adopt(&init, &dead);

        exit_bookkeeping(&dead, 9);

        let mut status = 0;
        let reaped = wait_on(
            &init,
            WaitTarget::from_raw(-1),
            &mut status,
            WaitOptions::empty(),
        )
        .unwrap();
        assert_eq!(reaped, dead.pid);
        assert_eq!(status, 9);

        // The live child is still there.
        let forest = PROCESS_LOCK.lock();
        assert!(forest.nodes[&init.pid].children.contains(&live.pid));
        assert!(!forest.nodes.contains_key(&dead.pid));
    }

    #[test]
    fn test_wait_without_children_is_echild() {
        let _g = setup();
        let init = make_init();
        let mut status = 0;
        assert_eq!(
            wait_on(
                &init,
                WaitTarget::from_raw(-1),
                &mut status,
                WaitOptions::empty()
            ),
            Err(Errno::ECHILD)
        );
    }
}
