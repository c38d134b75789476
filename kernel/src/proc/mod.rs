//! User processes.
//!
//! A process is a thread with its own address space and file descriptor
//! table. Processes live in a bounded table indexed by slot; the running
//! thread carries its process slot, from which everything else derives.

pub mod elf;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use riscv::addr::{round_up, PAGE_SIZE};
use riscv::mmu::{EntryFlags, Mtag};
use riscv::registers::{disable_interrupts, restore_interrupts};
use spin::Mutex;

use crate::arch::riscv::trap::{trap_frame_jump, TrapFrame};
use crate::config::{NPROC, PROCESS_IOMAX, UMEM_END_VMA};
use crate::io::IoRef;
use crate::mm::{
    active_mspace, clone_active_mspace, discard_active_mspace, free_phys_page, map_page,
    reset_active_mspace, switch_mspace, Page,
};
use crate::sched::sync::Condition;
use crate::sched::{
    running_thread, running_thread_anchor, running_thread_process, thread_exit, thread_set_process,
    thread_spawn, Tid,
};
use crate::{Error, Result};

/// A user process.
pub struct Process {
    /// Slot in the process table.
    pub idx: usize,
    /// Thread executing this process.
    pub tid: Tid,
    /// Tag of the process's address space.
    pub mtag: Mtag,
    /// Open file descriptors; each slot owns one handle on its endpoint.
    pub iotab: [Option<IoRef>; PROCESS_IOMAX],
}

const NO_IO: Option<IoRef> = None;
const NO_PROC: Option<Box<Process>> = None;

static PROCTAB: Mutex<[Option<Box<Process>>; NPROC]> = Mutex::new([NO_PROC; NPROC]);

/// Turns the boot thread into process 0, running in the main space.
pub fn procmgr_init() {
    let main = Box::new(Process {
        idx: 0,
        tid: running_thread(),
        mtag: active_mspace(),
        iotab: [NO_IO; PROCESS_IOMAX],
    });
    thread_set_process(main.tid, 0);
    PROCTAB.lock()[0] = Some(main);
}

/// Returns the address-space tag of a process slot.
///
/// Called by the scheduler while switching to a user thread.
pub fn process_mtag(idx: usize) -> Mtag {
    PROCTAB.lock()[idx].as_ref().expect("null process slot").mtag
}

/// Runs `f` on the process of the running thread.
pub fn with_current<R>(f: impl FnOnce(&mut Process) -> R) -> R {
    let idx = running_thread_process().expect("thread has no process");
    let mut tab = PROCTAB.lock();
    f(tab[idx].as_mut().expect("null process slot"))
}

/// Replaces the current process image with the executable on `exeio`.
///
/// The argument page is staged before the old image is torn down; after the
/// `reset_active_mspace` point there is no image to return to, so any
/// failure exits the process.
pub fn process_exec(exeio: IoRef, argv: &[&str]) -> ! {
    let fail = |msg: &str| -> ! {
        kprintln!("exec: {}", msg);
        process_exit();
    };

    let mut arg_page = match Page::new() {
        Ok(p) => p,
        Err(_) => fail("no memory for argument page"),
    };
    let stksz = match build_stack(arg_page.as_mut_slice(), argv) {
        Ok(n) => n,
        Err(_) => fail("oversized argument list"),
    };

    // Point of no return: unmap the old user image.
    reset_active_mspace();

    let entry = match elf::elf_load(&*exeio) {
        Ok(e) => e,
        Err(_) => fail("bad executable"),
    };

    let stack_vma = UMEM_END_VMA - PAGE_SIZE;
    let stack_page = arg_page.into_raw();
    if map_page(stack_vma, stack_page, EntryFlags::RW | EntryFlags::USER).is_err() {
        free_phys_page(stack_page);
        fail("cannot map user stack");
    }

    let mut tfr = TrapFrame::zeroed();
    tfr.sepc = entry as u64;
    tfr.sp = (UMEM_END_VMA - stksz) as u64;
    tfr.a0 = argv.len() as u64;
    tfr.a1 = (UMEM_END_VMA - stksz) as u64;
    tfr.sstatus = TrapFrame::user_sstatus();

    // SAFETY: the frame targets a freshly loaded user image, and the anchor
    // belongs to the running thread's kernel stack.
    unsafe { trap_frame_jump(&tfr, running_thread_anchor()) }
}

struct ForkCtx {
    shared: Arc<ForkShared>,
    tfr: TrapFrame,
    mtag: Mtag,
}

struct ForkShared {
    installed: AtomicBool,
    done: Condition,
}

/// Forks the current process.
///
/// The child gets a copy of the address space, a duplicated descriptor
/// table, and a copy of the parent's trap frame with `a0 = 0`. Returns the
/// child's thread id in the parent once the child's space is installed.
pub fn process_fork(tfr: &TrapFrame) -> Result<Tid> {
    let mtag = clone_active_mspace();

    let shared = Arc::new(ForkShared {
        installed: AtomicBool::new(false),
        done: Condition::new("forked"),
    });

    let mut child_tfr = tfr.clone();
    child_tfr.a0 = 0;

    let ctx = Box::into_raw(Box::new(ForkCtx {
        shared: shared.clone(),
        tfr: child_tfr,
        mtag,
    }));

    // Slot reservation, thread creation and the process link must be atomic
    // with respect to preemption, or the child could run before its process
    // slot exists.
    let pie = disable_interrupts();
    let iotab = with_current(|p| p.iotab.clone());
    let reserved = {
        let mut tab = PROCTAB.lock();
        match tab.iter().position(Option::is_none) {
            Some(idx) => {
                tab[idx] = Some(Box::new(Process {
                    idx,
                    tid: 0,
                    mtag,
                    iotab,
                }));
                Ok(idx)
            }
            None => Err(Error::Busy),
        }
    };
    let spawned = reserved.and_then(
        |idx| match thread_spawn("child", fork_child, ctx as usize, 0) {
            Ok(tid) => {
                PROCTAB.lock()[idx].as_mut().expect("null process slot").tid = tid;
                thread_set_process(tid, idx);
                Ok(tid)
            }
            Err(e) => {
                PROCTAB.lock()[idx] = None;
                Err(e)
            }
        },
    );
    restore_interrupts(pie);

    let tid = match spawned {
        Ok(tid) => tid,
        Err(e) => {
            // SAFETY: on failure the context was never handed to a child.
            drop(unsafe { Box::from_raw(ctx) });
            destroy_mspace(mtag);
            return Err(e);
        }
    };

    // Wait until the child has installed its address space, so the clone is
    // live before fork returns. Interrupts stay off between the flag check
    // and the wait to close the missed-wakeup window.
    let pie = disable_interrupts();
    while !shared.installed.load(Ordering::Acquire) {
        shared.done.wait();
    }
    restore_interrupts(pie);

    Ok(tid)
}

/// Child half of fork: runs as the first code of the new thread.
extern "C" fn fork_child(ctx: usize, _: usize) {
    // SAFETY: the parent transferred ownership of the context box.
    let ctx = unsafe { Box::from_raw(ctx as *mut ForkCtx) };

    switch_mspace(ctx.mtag);

    let tfr = ctx.tfr.clone();
    let shared = ctx.shared.clone();
    drop(ctx);
    shared.installed.store(true, Ordering::Release);
    shared.done.broadcast();
    drop(shared);

    // SAFETY: the frame is the parent's user state with a0 rewritten.
    unsafe { trap_frame_jump(&tfr, running_thread_anchor()) }
}

/// Terminates the current process, releasing its address space and open
/// descriptors. Exiting the main process is fatal.
pub fn process_exit() -> ! {
    let idx = running_thread_process().expect("thread has no process");
    if idx == 0 {
        panic!("main process exited");
    }

    discard_active_mspace();

    // Dropping the process record closes every descriptor it still owns.
    let proc = PROCTAB.lock()[idx].take();
    drop(proc);

    thread_exit();
}

/// Frees a cloned address space that never became (or no longer is) active.
fn destroy_mspace(mtag: Mtag) {
    let prev = switch_mspace(mtag);
    discard_active_mspace();
    switch_mspace(prev);
}

/// Builds the initial user stack image in `page`.
///
/// Layout, at the top of the page: the argv pointer vector (with a NUL
/// terminator slot), followed by the string bytes, the whole frame rounded
/// up to 16 bytes per the RISC-V ABI. The embedded pointers refer to the
/// page's eventual user-space home at the top of user memory. Returns the
/// frame size.
fn build_stack(page: &mut [u8; PAGE_SIZE], argv: &[&str]) -> Result<usize> {
    let argc = argv.len();

    // argv[] itself must fit on the page.
    if PAGE_SIZE / core::mem::size_of::<u64>() - 1 < argc {
        return Err(Error::OutOfMemory);
    }

    let mut stksz = (argc + 1) * core::mem::size_of::<u64>();
    for arg in argv {
        let argsz = arg.len() + 1;
        if PAGE_SIZE - stksz < argsz {
            return Err(Error::OutOfMemory);
        }
        stksz += argsz;
    }
    stksz = round_up(stksz, 16);

    let user_page_base = UMEM_END_VMA - PAGE_SIZE;
    let vec_off = PAGE_SIZE - stksz;
    let mut str_off = vec_off + (argc + 1) * core::mem::size_of::<u64>();

    for (i, arg) in argv.iter().enumerate() {
        let user_ptr = (user_page_base + str_off) as u64;
        page[vec_off + i * 8..vec_off + i * 8 + 8].copy_from_slice(&user_ptr.to_le_bytes());
        page[str_off..str_off + arg.len()].copy_from_slice(arg.as_bytes());
        page[str_off + arg.len()] = 0;
        str_off += arg.len() + 1;
    }
    page[vec_off + argc * 8..vec_off + argc * 8 + 8].fill(0);

    Ok(stksz)
}
