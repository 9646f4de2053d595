//! Kernel context switch
//!
//! A [`Context`] is the callee-saved register set of a suspended kernel
//! control flow, stored on that flow's own stack; the `*mut Context` saved
//! in the task (or per-CPU scheduler slot) is simply the stack pointer at
//! the moment of suspension.
//!
//! The contract for first entry into a task: the creator fabricates a
//! `Context` at the stack top whose `lr` is a trampoline; the first
//! `context_switch` into it "returns" there.

/// Callee-saved registers (r4-r11) plus the return address.
///
/// Field order must match the `push {{r4-r11, lr}}` layout in
/// `context_switch`: lowest-numbered register at the lowest address.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    pub r4: usize,
    pub r5: usize,
    pub r6: usize,
    pub r7: usize,
    pub r8: usize,
    pub r9: usize,
    pub r10: usize,
    pub r11: usize,
    pub lr: usize,
}

impl Context {
    /// A zeroed context that will "return" to `entry` when first resumed.
    #[must_use]
    pub const fn with_entry(entry: usize) -> Self {
        Self {
            r4: 0,
            r5: 0,
            r6: 0,
            r7: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            lr: entry,
        }
    }
}

#[cfg(target_arch = "arm")]
core::arch::global_asm!(
    r#"
    .global osmium_context_switch
    .type osmium_context_switch, %function
osmium_context_switch:
    @ r0 = *mut *mut Context (save slot), r1 = *mut Context (resume target)
    push    {r4-r11, lr}
    str     sp, [r0]
    mov     sp, r1
    pop     {r4-r11, lr}
    bx      lr
"#
);

#[cfg(target_arch = "arm")]
extern "C" {
    fn osmium_context_switch(old: *mut *mut Context, new: *mut Context);
}

/// Switch from the current control flow to `new`.
///
/// The current callee-saves are pushed onto the active stack and the
/// resulting stack pointer stored through `old`; execution resumes inside
/// `new`'s saved frame. Returns when something later switches back.
///
/// # Safety
///
/// `old` must be a valid save slot and `new` must point at a well-formed
/// [`Context`] on a live kernel stack that no CPU is currently running on.
#[cfg(target_arch = "arm")]
pub unsafe fn context_switch(old: *mut *mut Context, new: *mut Context) {
    // SAFETY: Caller upholds the stack validity requirements.
    unsafe { osmium_context_switch(old, new) }
}

/// Host fallback: context switching requires the real ISA.
///
/// # Safety
///
/// Never safe to reach on the host; present only so callers typecheck.
#[cfg(not(target_arch = "arm"))]
pub unsafe fn context_switch(_old: *mut *mut Context, _new: *mut Context) {
    unreachable!("context_switch is only available on the ARM target");
}
