//! Trap glue
//!
//! The exception vector stubs (context save, mode switching, the
//! user-resume sequence) are architecture plumbing; these are the kernel
//! handlers they call once a trap frame exists.

use osmium_arch::TrapFrame;

use crate::{interrupt, process, syscall};

/// Hardware interrupt, from the IRQ vector.
#[no_mangle]
pub extern "C" fn osmium_handle_irq() {
    interrupt::dispatch();
}

/// System call, from the SVC vector with the caller's trap frame.
///
/// # Safety
///
/// `tf` must point at the current task's trap frame.
#[no_mangle]
pub unsafe extern "C" fn osmium_handle_svc(tf: *mut TrapFrame) {
    // SAFETY: The vector stub passes the frame it just populated.
    syscall::dispatch(unsafe { &mut *tf });
}

/// Data abort from user mode.
///
/// A write fault inside a copy-on-write region materializes a private
/// frame and resumes; any other user fault destroys the offending
/// process with a fault status.
#[no_mangle]
pub extern "C" fn osmium_handle_user_fault(addr: usize) {
    let Some(proc) = process::current() else {
        panic!("user fault at {addr:#x} outside a process");
    };

    let fixed = proc
        .with_vm(|vm| vm.handle_fault(addr))
        .unwrap_or(Err(osmium_abi::Errno::EINVAL));

    if fixed.is_err() {
        log::warn!("pid {}: unhandled fault at {:#x}", proc.pid, addr);
        process::destroy(osmium_abi::Errno::EPERM.as_neg());
    }
}
