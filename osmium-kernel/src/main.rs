//! Kernel boot binary
//!
//! CPU 0 lands in [`kmain`] from the boot stub with the MMU on and a
//! kernel stack; secondaries park until [`osmium_kernel::smp`] releases
//! them. The init user program is linked into the image as a binary blob
//! between `__init_elf_start`/`__init_elf_end`; PID 1 is created from it
//! before the scheduler starts.

#![cfg_attr(target_arch = "arm", no_std)]
#![cfg_attr(target_arch = "arm", no_main)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(target_arch = "arm")]
mod boot {
    use buddy_system_allocator::LockedHeap;
    use core::panic::PanicInfo;

    use osmium_kernel::{interrupt, logging, process, sched, smp};
    use osmium_pal::{console, gic, platform, timer};

    /// Kernel heap backing store.
    const HEAP_SIZE: usize = 4 * 1024 * 1024;

    #[global_allocator]
    static ALLOCATOR: LockedHeap<32> = LockedHeap::empty();

    static mut HEAP: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

    core::arch::global_asm!(
        r#"
        .section .text.boot
        .global _start
    _start:
        mrc     p15, 0, r0, c0, c0, 5
        ands    r0, r0, #3
        bne     2f

        ldr     sp, =__boot_stack_top
        bl      kmain

        @ Secondaries park here until the release mailbox is written.
    2:  ldr     r1, =0x10000030
    3:  wfe
        ldr     r2, [r1]
        cmp     r2, #0
        beq     3b
        bx      r2

        .global osmium_secondary_entry
    osmium_secondary_entry:
        mrc     p15, 0, r0, c0, c0, 5
        and     r0, r0, #3
        ldr     sp, =__boot_stack_top
        lsl     r1, r0, #14
        sub     sp, sp, r1
        bl      secondary_kmain
    4:  b       4b
"#
    );

    /// The init program, embedded by the image assembler.
    extern "C" {
        static __init_elf_start: u8;
        static __init_elf_end: u8;
    }

    fn init_image() -> &'static [u8] {
        // SAFETY: The linker places the init ELF blob between these two
        // symbols; the bytes are immutable for the kernel's lifetime.
        unsafe {
            let start = &__init_elf_start as *const u8;
            let end = &__init_elf_end as *const u8;
            core::slice::from_raw_parts(start, end as usize - start as usize)
        }
    }

    /// Boot CPU entry.
    #[no_mangle]
    extern "C" fn kmain() -> ! {
        console::puts("\nosmium starting\n");

        // SAFETY: HEAP is a dedicated static, initialised exactly once
        // before any allocation.
        unsafe {
            ALLOCATOR
                .lock()
                .init(core::ptr::addr_of_mut!(HEAP) as usize, HEAP_SIZE);
        }

        logging::init();
        log::info!("heap: {} KiB", HEAP_SIZE / 1024);

        gic::init();
        timer::init();
        sched::init();

        interrupt::attach(platform::IRQ_TIMER0, timer_tick, 0);

        process::create(init_image()).expect("cannot create the init process");

        smp::start_secondary_cpus();

        log::info!("cpu 0 entering scheduler");
        sched::start();
    }

    /// Secondary CPU entry, from the boot stub.
    #[no_mangle]
    extern "C" fn secondary_kmain() -> ! {
        smp::secondary_main();
    }

    /// Tick handler: advance the clock, fire sleep timers.
    fn timer_tick(_irq: u32, _arg: usize) -> bool {
        let now = timer::tick();
        sched::timer::tick(now);
        true
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        use core::fmt::Write;
        let _ = writeln!(console::ConsoleWriter, "\nkernel panic: {info}");
        osmium_arch::cpu::halt();
    }
}

#[cfg(not(target_arch = "arm"))]
fn main() {
    // The kernel binary only exists for the ARM target; host builds get
    // the library and its tests.
}
