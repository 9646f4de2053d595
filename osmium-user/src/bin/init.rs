//! PID 1: exercise the process machinery, then reap orphans forever.
//!
//! Forks a child that exits with a known status, reaps it, reports both
//! PIDs on the console, and then settles into the init role: waiting for
//! whatever the kernel reparents onto us.

#![cfg_attr(target_arch = "arm", no_std)]
#![cfg_attr(target_arch = "arm", no_main)]

use osmium_abi::{Errno, WaitOptions};
use osmium_user::rt::{put_num, puts};
use osmium_user::sys;

#[no_mangle]
extern "C" fn umain() -> i32 {
    puts("init: running as pid 1\n");

    let pid = sys::fork();
    if pid < 0 {
        puts("init: fork failed\n");
        return 1;
    }

    if pid == 0 {
        puts("child: hello\n");
        sys::exit(7);
    }

    let mut status = 0;
    let reaped = sys::wait(pid, &mut status, WaitOptions::empty());
    puts("init: reaped pid ");
    put_num(reaped as u32);
    puts(" status ");
    put_num(status as u32);
    puts("\n");

    // The init role: collect every orphan the kernel hands us.
    loop {
        let mut status = 0;
        let r = sys::wait(-1, &mut status, WaitOptions::empty());
        if r == Errno::ECHILD.as_neg() {
            // Nothing to reap yet; yield our slice by polling politely.
            continue;
        }
        if r > 0 {
            puts("init: collected orphan ");
            put_num(r as u32);
            puts("\n");
        }
    }
}

#[cfg(not(target_arch = "arm"))]
fn main() {}
