//! ktos is an educational, Unix-like kernel for a single-hart RISC-V
//! (Sv39) machine, built around a small set of tightly coupled subsystems:
//! a physical page pool and virtual-memory manager, a cooperative scheduler
//! with timer-driven preemption, a unified I/O object layer, an LRU block
//! cache, the KTFS filesystem, and a register-based system call interface.
//!
//! ktos is developed and tested using [QEMU](https://www.qemu.org/)'s
//! `virt` machine. Boot, context-switch and trap-entry shims live in the
//! assembly files next to `arch/riscv`; device drivers beyond the polled
//! console attach through the device registry.

#![no_std]
#![warn(missing_docs)]

extern crate alloc;

/// Utility macros.
#[macro_use]
pub mod macros;

/// Architecture-specific functions.
pub mod arch;

/// Compile-time configuration.
pub mod config;

/// Device drivers and the device registry.
pub mod drivers;

mod error;

/// Kernel-side filesystem glue.
pub mod fs;

/// The unified I/O object layer.
pub mod io;

/// Memory management.
pub mod mm;

mod panic;

/// User processes.
pub mod proc;

/// Threads, synchronization and timers.
pub mod sched;

/// System call dispatch.
pub mod syscall;

pub use error::{Error, Result};

use crate::config::INIT_NAME;
use crate::io::MemIo;

const KTOS_ASCII_LOGO: &str = r#"
  __    __
 |  | _|  |_  ____  ______
 |  |/ /|  _|/  _ \/  ___/
 |    < |  |_|  |_|\___ \
 |__|_\_\\___|\____/_____/
"#;

/// Kernel entry point, called from head.S with the MMU off.
#[no_mangle]
pub extern "C" fn kmain() -> ! {
    kprintln!("{}", KTOS_ASCII_LOGO);

    mm::memory_init();
    arch::riscv::trap::trap_init();
    sched::thrmgr_init();
    sched::timer::timer_init();
    proc::procmgr_init();
    sched::timer::start_interrupter();
    drivers::attach_console();
    riscv::registers::enable_interrupts();

    // External drivers (UART rings, RTC, VirtIO) have attached by now. Boot
    // from the block device when one is present; otherwise exercise the
    // filesystem stack on a RAM-backed volume and power off.
    match drivers::open_device("vioblk", 0) {
        Ok(blkio) => {
            fs::fs_mount(blkio).expect("cannot mount filesystem");
            let init = fs::fs_open(INIT_NAME).expect("cannot open init");
            kprintln!("booting {}", INIT_NAME);
            proc::process_exec(init, &[INIT_NAME]);
        }
        Err(_) => {
            kprintln!("no block device attached; running on a RAM volume");
            fs_selftest();
            drivers::syscon::poweroff();
        }
    }
}

/// Formats a RAM-backed volume and pushes a file through the whole stack:
/// create, grow, write, flush, re-open, read back.
fn fs_selftest() {
    const BLOCKS: u32 = 1024;
    let payload = b"All work and no play makes ktos a dull kernel.";

    let size = BLOCKS as usize * ktfs::BLOCK_SIZE;
    let disk = MemIo::new(size, size);
    fs::fs_format(disk, BLOCKS, 4).expect("format failed");

    fs::fs_create("motd").expect("create failed");
    {
        let file = fs::fs_open("motd").expect("open failed");
        file.set_end(payload.len() as u64).expect("set_end failed");
        assert!(file.write_at(0, payload) == Ok(payload.len()));
    }
    fs::fs_flush().expect("flush failed");

    let file = fs::fs_open("motd").expect("re-open failed");
    let mut back = [0u8; 64];
    let n = file.read_at(0, &mut back).expect("read failed");
    assert!(back[..n] == payload[..]);

    kprintln!("ktfs self-test passed");
}
