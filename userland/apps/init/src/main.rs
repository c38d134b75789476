//! The first user program: opens the console, forks a child, and reports
//! both sides of the fork through the shared descriptor.

#![no_std]
#![no_main]

use runtime::io::{stdout, Fd};
use runtime::syscall;

#[no_mangle]
pub extern "C" fn main(_argc: usize, _argv: *const *const u8) -> isize {
    // Wire the console to fd 0 and mirror it onto fd 1.
    let fd = syscall::devopen(0, c"ser", 0);
    if fd < 0 {
        syscall::print(c"init: no console");
        return fd;
    }
    syscall::iodup(0, 1);

    let out = stdout();
    let _ = out.write_all(b"init: up\n");

    match syscall::fork() {
        0 => {
            let _ = out.write_all(b"child: hello via inherited fd\n");
            syscall::exit(0);
        }
        tid if tid > 0 => {
            syscall::wait(tid as usize);
            let _ = out.write_all(b"init: child reaped\n");
        }
        _ => {
            let _ = out.write_all(b"init: fork failed\n");
        }
    }

    let _ = Fd(1).write_all(b"init: done\n");
    0
}
