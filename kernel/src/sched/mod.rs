//! Kernel threads and the scheduler.
//!
//! Single hart, cooperatively scheduled with preemption points injected by
//! the periodic interrupter thread. Exactly one thread runs at a time;
//! switches happen at explicit yields, exits, condition waits, lock
//! contention, and in the idle thread's WFI loop.
//!
//! Threads live in a flat table indexed by thread id; parent/child links are
//! ids, so reclaiming a thread re-parents its children with one table scan.
//! The ready list is strictly FIFO. Structures touched by interrupt handlers
//! (the ready list, wait lists, thread states) are only ever accessed with
//! interrupts disabled.

pub mod sync;
pub mod timer;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use riscv::addr::PAGE_SIZE;
use riscv::instructions::wfi;
use riscv::registers::{disable_interrupts, enable_interrupts, restore_interrupts};
use spin::Mutex;

use crate::config::NTHR;
use crate::drivers::syscon;
use crate::mm::{switch_mspace, Page};
use crate::sched::sync::Condition;
use crate::{Error, Result};

/// A thread id: the thread's index in the thread table.
pub type Tid = usize;

/// The boot thread.
pub const MAIN_TID: Tid = 0;

/// The idle thread, scheduled when nothing else is ready.
pub const IDLE_TID: Tid = NTHR - 1;

/// Entry point of a spawned thread. The two arguments are forwarded from
/// `thread_spawn` by the startup trampoline.
pub type ThreadEntry = extern "C" fn(usize, usize);

// Shims in swtch.S.
extern "C" {
    /// Saves the callee-saved context into `prev` and resumes `next`.
    fn _thread_swtch(prev: *mut Context, next: *const Context);

    /// First-switch landing pad: forwards `s0..s7` into `a0..a7` and tail
    /// calls the entry function held in `s8`.
    fn _thread_startup();
}

// Boot stack anchor, from head.S.
extern "C" {
    static _main_stack_anchor: u8;
}

/// Saved callee-saved register context of a suspended thread.
///
/// Must stay in sync with the store/load sequence in swtch.S.
#[repr(C)]
pub struct Context {
    s: [u64; 12],
    ra: usize,
    sp: usize,
}

impl Context {
    const fn zeroed() -> Self {
        Self {
            s: [0; 12],
            ra: 0,
            sp: 0,
        }
    }
}

/// Sentinel stored at the top of every kernel stack: a back-pointer to the
/// owning thread, and a slot for the global pointer of trap entry.
#[repr(C)]
struct StackAnchor {
    ktp: usize,
    kgp: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Waiting,
    Running,
    Ready,
    Exited,
}

struct Thread {
    // Must be the first member: swtch.S stores through the thread pointer.
    ctx: Context,
    id: Tid,
    name: &'static str,
    state: State,
    parent: Tid,
    anchor: usize,
    stack: Option<Page>,
    child_exit: Arc<Condition>,
    proc: Option<usize>,
}

struct ThreadTable {
    slots: [Option<Box<Thread>>; NTHR],
}

impl ThreadTable {
    fn get(&self, tid: Tid) -> Option<&Thread> {
        self.slots.get(tid)?.as_deref()
    }

    fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.slots.get_mut(tid)?.as_deref_mut()
    }

    /// Panics on an empty slot: the caller asserts the thread exists.
    fn must(&mut self, tid: Tid) -> &mut Thread {
        self.get_mut(tid).expect("null thread-table slot")
    }
}

const NO_THREAD: Option<Box<Thread>> = None;

static THREADS: Mutex<ThreadTable> = Mutex::new(ThreadTable {
    slots: [NO_THREAD; NTHR],
});

static READY: Mutex<VecDeque<Tid>> = Mutex::new(VecDeque::new());

static CURRENT: AtomicUsize = AtomicUsize::new(MAIN_TID);

/// Runs `f` with interrupts disabled.
pub(crate) fn critical<R>(f: impl FnOnce() -> R) -> R {
    let pie = disable_interrupts();
    let r = f();
    restore_interrupts(pie);
    r
}

/// Returns the id of the running thread.
pub fn running_thread() -> Tid {
    CURRENT.load(Ordering::Relaxed)
}

/// Returns the name of a live thread.
pub fn thread_name(tid: Tid) -> &'static str {
    critical(|| THREADS.lock().get(tid).map(|t| t.name).unwrap_or("?"))
}

/// Returns the stack anchor of the running thread, used to re-arm the trap
/// stack when entering user mode.
pub fn running_thread_anchor() -> usize {
    critical(|| {
        let cur = running_thread();
        THREADS.lock().must(cur).anchor
    })
}

/// Returns the process slot attached to the running thread, if any.
pub fn running_thread_process() -> Option<usize> {
    critical(|| {
        let cur = running_thread();
        THREADS.lock().must(cur).proc
    })
}

/// Attaches a thread to a process slot.
pub fn thread_set_process(tid: Tid, proc: usize) {
    critical(|| THREADS.lock().must(tid).proc = Some(proc));
}

/// Initializes the thread manager: the main thread inherits the boot stack,
/// and the idle thread is parked at the tail of the ready list.
pub fn thrmgr_init() {
    // SAFETY: the anchor symbol is placed by head.S at the top of the boot
    // stack.
    let main_anchor = unsafe { &_main_stack_anchor as *const u8 as usize };

    let main = Box::new(Thread {
        ctx: Context::zeroed(),
        id: MAIN_TID,
        name: "main",
        state: State::Running,
        parent: MAIN_TID,
        anchor: main_anchor,
        stack: None,
        child_exit: Arc::new(Condition::new("main.child_exit")),
        proc: None,
    });
    write_anchor(main_anchor, &*main as *const Thread as usize);

    critical(|| {
        // Reserve ready-list capacity up front so interrupt handlers moving
        // threads to it never allocate.
        READY.lock().reserve(NTHR + 1);
        THREADS.lock().slots[MAIN_TID] = Some(main);
    });

    let mut idle = new_thread("idle", idle_thread, 0, 0).expect("cannot create idle thread");
    idle.id = IDLE_TID;
    critical(|| {
        write_anchor(idle.anchor, &*idle as *const Thread as usize);
        THREADS.lock().slots[IDLE_TID] = Some(idle);
        READY.lock().push_back(IDLE_TID);
    });
}

/// Creates a thread and schedules it for execution.
///
/// The entry function receives `arg0` and `arg1` and must not return; a
/// thread that falls off its entry exits via the startup trampoline.
pub fn thread_spawn(
    name: &'static str,
    entry: ThreadEntry,
    arg0: usize,
    arg1: usize,
) -> Result<Tid> {
    let mut thread = new_thread(name, entry, arg0, arg1)?;

    // Slot selection and insertion are a single critical section so a
    // preempting spawn cannot race for the same id.
    critical(|| {
        let mut threads = THREADS.lock();
        let tid = (1..NTHR - 1)
            .find(|&i| threads.slots[i].is_none())
            .ok_or(Error::TooManyThreads)?;
        thread.id = tid;
        write_anchor(thread.anchor, &*thread as *const Thread as usize);
        threads.slots[tid] = Some(thread);
        READY.lock().push_back(tid);
        Ok(tid)
    })
}

/// Builds a ready-to-run thread record with a fresh kernel stack. The id is
/// assigned when the record is inserted into the table.
fn new_thread(
    name: &'static str,
    entry: ThreadEntry,
    arg0: usize,
    arg1: usize,
) -> Result<Box<Thread>> {
    let stack = Page::new()?;
    let anchor = stack.addr() + PAGE_SIZE - core::mem::size_of::<StackAnchor>();

    let mut ctx = Context::zeroed();
    ctx.sp = anchor;
    ctx.ra = _thread_startup as usize;
    ctx.s[0] = arg0 as u64;
    ctx.s[1] = arg1 as u64;
    ctx.s[8] = entry as usize as u64;

    Ok(Box::new(Thread {
        ctx,
        id: 0,
        name,
        state: State::Ready,
        parent: running_thread(),
        anchor,
        stack: Some(stack),
        child_exit: Arc::new(Condition::new("child_exit")),
        proc: None,
    }))
}

fn write_anchor(anchor: usize, ktp: usize) {
    // SAFETY: the anchor slot is inside a stack owned by the new thread.
    unsafe {
        *(anchor as *mut StackAnchor) = StackAnchor { ktp, kgp: 0 };
    }
}

/// Terminates the running thread.
///
/// The main thread exiting shuts the machine down. Any other thread is
/// marked exited, its parent is notified, and it never runs again; the
/// parent reclaims the thread record in `thread_join`.
#[no_mangle]
pub extern "C" fn thread_exit() -> ! {
    let cur = running_thread();
    if cur == MAIN_TID {
        kprintln!("main thread exited");
        syscon::poweroff();
    }

    let exit_cond = critical(|| {
        let mut threads = THREADS.lock();
        let thread = threads.must(cur);
        thread.state = State::Exited;
        thread.child_exit.clone()
    });
    exit_cond.broadcast();

    running_thread_suspend();
    unreachable!("exited thread rescheduled");
}

/// Yields the processor to the next ready thread.
pub fn thread_yield() {
    running_thread_suspend();
}

/// Waits for a child to exit and reclaims it, returning its id.
///
/// With `tid == 0`, waits for any child and fails with `Invalid` when the
/// caller has none. Otherwise `tid` must name a child of the caller.
pub fn thread_join(tid: Tid) -> Result<Tid> {
    if tid >= NTHR {
        return Err(Error::Invalid);
    }
    let cur = running_thread();

    if tid == 0 {
        loop {
            // The scan and the wait must happen without an intervening
            // child exit, so interrupts stay off until the caller is on the
            // wait list.
            let pie = disable_interrupts();
            let mut have_children = false;
            let mut exited = None;
            let mut wait_on = None;
            {
                let threads = THREADS.lock();
                for i in 1..NTHR {
                    if let Some(t) = threads.get(i) {
                        if t.parent != cur || i == cur {
                            continue;
                        }
                        have_children = true;
                        if t.state == State::Exited {
                            exited = Some(i);
                            break;
                        }
                        if wait_on.is_none() {
                            wait_on = Some(t.child_exit.clone());
                        }
                    }
                }
            }

            match (exited, have_children, wait_on) {
                (Some(i), _, _) => {
                    restore_interrupts(pie);
                    thread_reclaim(i);
                    return Ok(i);
                }
                (None, false, _) => {
                    restore_interrupts(pie);
                    return Err(Error::Invalid);
                }
                (None, true, Some(cond)) => {
                    cond.wait();
                    restore_interrupts(pie);
                }
                (None, true, None) => unreachable!(),
            }
        }
    } else {
        loop {
            let pie = disable_interrupts();
            let status = {
                let threads = THREADS.lock();
                match threads.get(tid) {
                    Some(t) if t.parent == cur => Ok((t.state, t.child_exit.clone())),
                    _ => Err(Error::Invalid),
                }
            };
            match status {
                Err(e) => {
                    restore_interrupts(pie);
                    return Err(e);
                }
                Ok((State::Exited, _)) => {
                    restore_interrupts(pie);
                    thread_reclaim(tid);
                    return Ok(tid);
                }
                Ok((_, cond)) => {
                    cond.wait();
                    restore_interrupts(pie);
                }
            }
        }
    }
}

/// Removes an exited thread from the table, re-parenting its children and
/// freeing its stack and record.
fn thread_reclaim(tid: Tid) {
    let thread = critical(|| {
        let mut threads = THREADS.lock();
        let thread = threads.slots[tid].take().expect("null thread-table slot");
        assert!(thread.id == tid && thread.state == State::Exited);

        // Make our parent the parent of our children. A table scan is fine
        // at this scale; a child list would make it O(1).
        for i in 1..NTHR {
            if let Some(t) = threads.get_mut(i) {
                if t.parent == tid {
                    t.parent = thread.parent;
                }
            }
        }
        thread
    });
    drop(thread);
}

/// Suspends the running thread and resumes the next ready one.
///
/// If the caller is still `Running` it is re-queued at the ready-list tail.
/// Returns when the caller is next scheduled.
pub(crate) fn running_thread_suspend() {
    disable_interrupts();

    let cur = running_thread();
    let mut switch = None;
    {
        let mut threads = THREADS.lock();
        let mut ready = READY.lock();

        if threads.must(cur).state == State::Running {
            threads.must(cur).state = State::Ready;
            ready.push_back(cur);
        }

        let next = ready.pop_front().unwrap_or(IDLE_TID);
        threads.must(next).state = State::Running;
        CURRENT.store(next, Ordering::Relaxed);

        if next != cur {
            let prev_ctx = &mut threads.must(cur).ctx as *mut Context;
            let next_ctx = &threads.must(next).ctx as *const Context;
            let mtag = threads.must(next).proc.map(crate::proc::process_mtag);
            switch = Some((prev_ctx, next_ctx, mtag));
        }
    }

    if let Some((prev_ctx, next_ctx, mtag)) = switch {
        // Entering a user thread installs its address space first.
        if let Some(mtag) = mtag {
            switch_mspace(mtag);
        }
        enable_interrupts();
        // SAFETY: both contexts live in boxed thread records that stay
        // allocated at least until their owner is reclaimed, which cannot
        // happen before the save into `prev_ctx` completes.
        unsafe { _thread_swtch(prev_ctx, next_ctx) };
    } else {
        enable_interrupts();
    }
}

/// The idle thread: sleeps with WFI while nothing is runnable.
extern "C" fn idle_thread(_: usize, _: usize) {
    loop {
        // If there are runnable threads, yield to them.
        while !critical(|| READY.lock().is_empty()) {
            thread_yield();
        }

        // No runnable threads. Interrupts must be off between the re-check
        // and the wfi, or an ISR could mark a thread ready in the gap and
        // the wakeup would be lost.
        disable_interrupts();
        if READY.lock().is_empty() {
            wfi();
        }
        enable_interrupts();
    }
}
