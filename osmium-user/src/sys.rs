//! System call stubs
//!
//! Numbers travel in r7, arguments in r0-r2, the result comes back in r0;
//! negative results are errnos. On non-ARM hosts (where the library's
//! logic is unit-tested) every call reports `ENOSYS`.

use osmium_abi::{Errno, SyscallNo, WaitOptions};

#[cfg(target_arch = "arm")]
fn syscall(num: SyscallNo, a0: usize, a1: usize, a2: usize) -> i32 {
    let ret: i32;
    // SAFETY: SVC with the kernel's documented register convention.
    unsafe {
        core::arch::asm!(
            "svc #0",
            in("r7") num as u32,
            inlateout("r0") a0 as u32 => ret,
            in("r1") a1 as u32,
            in("r2") a2 as u32,
            options(nostack)
        );
    }
    ret
}

#[cfg(not(target_arch = "arm"))]
fn syscall(_num: SyscallNo, _a0: usize, _a1: usize, _a2: usize) -> i32 {
    Errno::ENOSYS.as_neg()
}

/// Terminate the calling process.
pub fn exit(status: i32) -> ! {
    syscall(SyscallNo::Exit, status as usize, 0, 0);
    // The kernel does not return from exit; spin in case it ever did.
    loop {
        core::hint::spin_loop();
    }
}

/// Duplicate the calling process: child PID in the parent, 0 in the
/// child, negative errno on failure.
#[must_use]
pub fn fork() -> i32 {
    syscall(SyscallNo::Fork, 0, 0, 0)
}

/// Reap a child per the `wait(2)` selector rules.
pub fn wait(pid: i32, status: &mut i32, options: WaitOptions) -> i32 {
    syscall(
        SyscallNo::Wait,
        pid as usize,
        status as *mut i32 as usize,
        options.bits() as usize,
    )
}

/// Replace the process image with an ELF held in our own memory.
pub fn exec(image: &[u8]) -> i32 {
    syscall(SyscallNo::Exec, image.as_ptr() as usize, image.len(), 0)
}

/// Write bytes to the console.
pub fn cwrite(buf: &[u8]) -> i32 {
    syscall(SyscallNo::CWrite, buf.as_ptr() as usize, buf.len(), 0)
}

/// Grow the data segment, returning the base of the new span.
pub fn sbrk(increment: usize) -> i32 {
    syscall(SyscallNo::Sbrk, increment, 0, 0)
}

/// Read directory records from an open descriptor.
pub fn getdents(fd: usize, buf: &mut [u8]) -> i32 {
    syscall(
        SyscallNo::GetDents,
        fd,
        buf.as_mut_ptr() as usize,
        buf.len(),
    )
}

/// Close a descriptor.
pub fn close(fd: usize) -> i32 {
    syscall(SyscallNo::Close, fd, 0, 0)
}
