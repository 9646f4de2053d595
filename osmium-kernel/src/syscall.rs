//! System call surface
//!
//! The trap path lands here with the current task's trap frame: number in
//! r7, arguments in r0-r2, result back in r0 as a value or a negative
//! errno. `fork` returns the child PID to the parent; the child's frame
//! was primed with 0 before it first runs.

use alloc::vec;

use osmium_abi::{Errno, SyscallNo, WaitOptions};
use osmium_arch::TrapFrame;

use crate::process;

/// Cap on a single console write, matching the user library's buffering.
const CWRITE_MAX: usize = 1024;

/// Cap on a single `getdents` transfer.
const GETDENTS_MAX: usize = 4096;

/// Decode and execute the syscall recorded in `tf`.
///
/// `sys_exit` never returns; everything else stores its result into the
/// frame's return register.
pub fn dispatch(tf: &mut TrapFrame) {
    let (num, a0, a1, a2) = tf.syscall_args();

    let result = match SyscallNo::from_raw(num as u32) {
        Some(SyscallNo::Exit) => process::destroy(a0 as i32),
        Some(SyscallNo::Fork) => osmium_abi::error::into_ret(process::copy(), |pid| pid),
        Some(SyscallNo::Wait) => sys_wait(a0 as i32, a1, a2 as u32),
        Some(SyscallNo::Exec) => sys_exec(a0, a1),
        Some(SyscallNo::CWrite) => sys_cwrite(a0, a1),
        Some(SyscallNo::Sbrk) => {
            osmium_abi::error::into_ret(process::grow(a0), |base| base as i32)
        }
        Some(SyscallNo::GetDents) => sys_getdents(a0, a1, a2),
        Some(SyscallNo::Close) => sys_close(a0),
        None => {
            log::warn!("unknown syscall {num}");
            Errno::ENOSYS.as_neg()
        }
    };

    tf.set_ret(result);
}

/// `wait(pid, *status, options)`: reap a child, writing its exit code
/// through the user pointer (when non-null) only on an actual reap.
fn sys_wait(pid: i32, status_ptr: usize, options: u32) -> i32 {
    let Some(options) = WaitOptions::from_bits(options) else {
        return Errno::EINVAL.as_neg();
    };

    let mut status = 0;
    match process::wait(pid, &mut status, options) {
        Ok(reaped) => {
            if reaped > 0 && status_ptr != 0 {
                let Some(proc) = process::current() else {
                    return Errno::ECHILD.as_neg();
                };
                let wrote = proc.with_vm(|vm| vm.copy_out(status_ptr, &status.to_le_bytes()));
                match wrote {
                    Ok(Ok(())) => {}
                    _ => return Errno::EINVAL.as_neg(),
                }
            }
            reaped
        }
        Err(e) => e.as_neg(),
    }
}

/// `exec(image, len)`: replace the process image with an ELF read out of
/// the caller's own memory.
fn sys_exec(image_ptr: usize, len: usize) -> i32 {
    if len == 0 || len > 1 << 20 {
        return Errno::EINVAL.as_neg();
    }
    let Some(proc) = process::current() else {
        return Errno::ESRCH.as_neg();
    };

    let mut image = vec![0u8; len];
    let read = proc.with_vm(|vm| vm.copy_in(image_ptr, &mut image));
    match read {
        Ok(Ok(())) => {}
        _ => return Errno::EINVAL.as_neg(),
    }

    match process::exec(&image) {
        Ok(()) => 0,
        Err(e) => e.as_neg(),
    }
}

/// `cwrite(buf, n)`: copy bytes out of user memory and print them on the
/// console. Returns the byte count written.
fn sys_cwrite(buf_ptr: usize, len: usize) -> i32 {
    let len = len.min(CWRITE_MAX);
    if len == 0 {
        return 0;
    }
    let Some(proc) = process::current() else {
        return Errno::ESRCH.as_neg();
    };

    let mut bytes = vec![0u8; len];
    let read = proc.with_vm(|vm| vm.copy_in(buf_ptr, &mut bytes));
    match read {
        Ok(Ok(())) => {}
        _ => return Errno::EINVAL.as_neg(),
    }

    for chunk in bytes.utf8_chunks() {
        osmium_pal::console::puts(chunk.valid());
    }
    len as i32
}

/// `getdents(fd, buf, nbytes)`: fill user memory with directory records.
fn sys_getdents(fd: usize, buf_ptr: usize, nbytes: usize) -> i32 {
    let nbytes = nbytes.min(GETDENTS_MAX);
    let Some(proc) = process::current() else {
        return Errno::ESRCH.as_neg();
    };

    let file = match proc.with_files(|files| files.get(fd)) {
        Ok(f) => f,
        Err(e) => return e.as_neg(),
    };

    let mut records = vec![0u8; nbytes];
    let filled = match file.getdents(&mut records) {
        Ok(n) => n,
        Err(e) => return e.as_neg(),
    };

    if filled > 0 {
        let wrote = proc.with_vm(|vm| vm.copy_out(buf_ptr, &records[..filled]));
        match wrote {
            Ok(Ok(())) => {}
            _ => return Errno::EINVAL.as_neg(),
        }
    }
    filled as i32
}

/// `close(fd)`.
fn sys_close(fd: usize) -> i32 {
    let Some(proc) = process::current() else {
        return Errno::ESRCH.as_neg();
    };
    match proc.with_files(|files| files.close(fd)) {
        Ok(()) => 0,
        Err(e) => e.as_neg(),
    }
}
