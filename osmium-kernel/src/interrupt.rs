//! Interrupt dispatch
//!
//! Hard-IRQ entry masks the line, signals EOI, and runs the installed
//! handler in ISR context. A handler returns whether the line should be
//! unmasked immediately; returning `false` passes that responsibility to
//! whoever finishes the work — usually a bottom-half thread.
//!
//! Two attachment modes:
//! - [`attach`]: the handler runs entirely in hard-IRQ context.
//! - [`attach_thread`]: a dedicated bottom-half task is created, parked on
//!   a private semaphore; the hard-IRQ stub just posts the semaphore and
//!   leaves the line masked. The thread runs the real handler with normal
//!   locking available and unmasks afterwards.

use spin::Once;

use osmium_pal::gic;
use osmium_pal::platform::IRQ_MAX;

use crate::mm::{KBox, KCache};
use crate::sched::{self, task};
use crate::sync::{Semaphore, Spinlock};

/// Handler function: receives the line and the attachment argument,
/// returns whether to unmask the line right away.
pub type Handler = fn(irq: u32, arg: usize) -> bool;

/// Priority of bottom-half threads: above every user process.
const IRQ_THREAD_PRIORITY: u8 = 1;

#[derive(Clone, Copy)]
struct Action {
    handler: Handler,
    arg: usize,
}

static ACTIONS: Spinlock<[Option<Action>; IRQ_MAX as usize]> =
    Spinlock::new("interrupt_actions", [None; IRQ_MAX as usize]);

/// Bottom half state shared between the hard-IRQ stub and its thread.
struct InterruptThread {
    irq: u32,
    handler: Handler,
    arg: usize,
    semaphore: Semaphore,
}

fn thread_cache() -> &'static KCache<InterruptThread> {
    static CACHE: Once<KCache<InterruptThread>> = Once::new();
    CACHE.call_once(|| KCache::create("irq_thread"))
}

/// Record the handler for `irq` in the action table.
///
/// Panics on an out-of-range line or a double attach: both are kernel
/// configuration bugs.
fn register_action(irq: u32, handler: Handler, arg: usize) {
    if irq >= IRQ_MAX {
        panic!("invalid interrupt id {irq}");
    }

    let mut actions = ACTIONS.lock();
    if actions[irq as usize].is_some() {
        panic!("interrupt handler {irq} already attached");
    }
    actions[irq as usize] = Some(Action { handler, arg });
}

/// Install `handler` for `irq`, route the line here, and unmask it.
pub fn attach(irq: u32, handler: Handler, arg: usize) {
    register_action(irq, handler, arg);
    gic::set_target(irq, crate::cpu::id());
    gic::unmask(irq);
}

/// Install `handler` to run in a dedicated bottom-half thread.
///
/// The hard-IRQ stub posts the thread's semaphore and leaves the line
/// masked; the thread loops taking the semaphore, running the handler,
/// and unmasking when the handler asks for it.
pub fn attach_thread(irq: u32, handler: Handler, arg: usize) {
    let isr = thread_cache()
        .alloc(InterruptThread {
            irq,
            handler,
            arg,
            semaphore: Semaphore::new(0),
        })
        .unwrap_or_else(|_| panic!("cannot allocate bottom half for irq {irq}"));

    // The thread and the stub share the state for the kernel's lifetime.
    let isr: &'static InterruptThread = KBox::leak(isr);

    let tid = task::create(
        None,
        interrupt_thread_entry,
        isr as *const InterruptThread as usize,
        IRQ_THREAD_PRIORITY,
    )
    .unwrap_or_else(|_| panic!("cannot create bottom half for irq {irq}"));

    attach(irq, interrupt_thread_notify, isr as *const InterruptThread as usize);

    task::resume(tid).expect("fresh bottom half is suspended");
}

/// Hard-IRQ entry, called from the trap vector with interrupts disabled.
///
/// Acknowledges the GIC, masks the line, signals EOI, and runs the
/// handler inside an ISR-nesting window so wakeups defer preemption to
/// the outermost exit.
pub fn dispatch() {
    let irq = gic::ack();
    if irq == gic::SPURIOUS {
        return;
    }

    sched::isr_enter();

    gic::mask(irq);
    gic::eoi(irq);

    let action = ACTIONS.lock()[irq as usize];
    let unmask = match action {
        Some(action) => (action.handler)(irq, action.arg),
        None => {
            log::warn!("unexpected irq {} on cpu {}", irq, crate::cpu::id());
            true
        }
    };

    if unmask {
        gic::unmask(irq);
    }

    sched::isr_exit();
}

/// Bottom-half thread body: wait for the stub's token, run the handler,
/// unmask if asked.
fn interrupt_thread_entry(arg: usize) {
    // SAFETY: arg is the leaked InterruptThread installed by
    // attach_thread; it lives for the kernel's lifetime.
    let isr = unsafe { &*(arg as *const InterruptThread) };

    loop {
        if isr.semaphore.get(0).is_err() {
            panic!("bottom half for irq {}: semaphore gone", isr.irq);
        }

        if (isr.handler)(isr.irq, isr.arg) {
            gic::unmask(isr.irq);
        }
    }
}

/// Hard-IRQ stub for threaded handlers: post the token, keep the line
/// masked until the thread is done with it.
fn interrupt_thread_notify(_irq: u32, arg: usize) -> bool {
    // SAFETY: arg is the leaked InterruptThread installed by
    // attach_thread; it lives for the kernel's lifetime.
    let isr = unsafe { &*(arg as *const InterruptThread) };
    isr.semaphore.put();
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_handler(_irq: u32, _arg: usize) -> bool {
        true
    }

    #[test]
    fn test_register_action_stores_handler() {
        let _serial = crate::test_sync::guard();
        ACTIONS.lock()[7] = None;

        register_action(7, nop_handler, 99);

        let action = ACTIONS.lock()[7].expect("action installed");
        assert_eq!(action.arg, 99);
        assert!((action.handler)(7, 99));
    }

    #[test]
    #[should_panic(expected = "already attached")]
    fn test_double_attach_panics() {
        let _serial = crate::test_sync::guard();
        ACTIONS.lock()[8] = None;

        register_action(8, nop_handler, 0);
        register_action(8, nop_handler, 0);
    }

    #[test]
    #[should_panic(expected = "invalid interrupt id")]
    fn test_out_of_range_line_panics() {
        let _serial = crate::test_sync::guard();
        register_action(IRQ_MAX, nop_handler, 0);
    }
}
