//! Directory lister.
//!
//! Walks the directory stream open on descriptor 0 (handed to us by our
//! parent), printing each entry's inode and full path. Paths are built
//! with the bounds-checked [`PathBuilder`]; an entry that would overflow
//! the path buffer is reported, not mangled.

#![cfg_attr(target_arch = "arm", no_std)]
#![cfg_attr(target_arch = "arm", no_main)]

use osmium_abi::dirent::DirentIter;
use osmium_user::rt::{put_num, puts};
use osmium_user::{sys, PathBuilder};

const DIR_FD: usize = 0;

#[no_mangle]
extern "C" fn umain() -> i32 {
    let mut buf = [0u8; 512];
    let mut path = PathBuilder::new();
    if path.push_raw(b".").is_err() {
        return 1;
    }
    let mark = path.len();

    loop {
        let nread = sys::getdents(DIR_FD, &mut buf);
        if nread == 0 {
            break;
        }
        if nread < 0 {
            puts("ls: getdents failed\n");
            return 1;
        }

        for (header, name) in DirentIter::new(&buf[..nread as usize]) {
            path.truncate(mark);
            if path.push(name).is_err() {
                puts("ls: name too long, skipping\n");
                continue;
            }

            put_num(header.d_ino);
            puts(" ");
            sys::cwrite(path.as_bytes());
            puts("\n");
        }
    }

    sys::close(DIR_FD);
    0
}

#[cfg(not(target_arch = "arm"))]
fn main() {}
