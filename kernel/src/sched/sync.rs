//! Condition variables and reentrant sleeping locks.

use alloc::collections::VecDeque;

use riscv::registers::{disable_interrupts, restore_interrupts};
use spin::Mutex;

use super::{critical, running_thread, running_thread_suspend, State, Tid, READY, THREADS};

/// A condition variable.
///
/// Waiters are queued in FIFO order; `broadcast` appends them to the ready
/// list in the order they started waiting.
pub struct Condition {
    name: &'static str,
    waiters: Mutex<VecDeque<Tid>>,
}

impl Condition {
    /// Creates a condition with a debug name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns the condition's debug name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Blocks the running thread until the next [`Condition::broadcast`].
    ///
    /// The caller must re-check its predicate on return: another woken
    /// thread may have consumed the event.
    pub fn wait(&self) {
        let cur = running_thread();

        let pie = disable_interrupts();
        {
            let mut waiters = self.waiters.lock();
            let mut threads = THREADS.lock();
            let thread = threads.must(cur);
            debug_assert!(thread.state == State::Running);
            thread.state = State::Waiting;
            waiters.push_back(cur);
        }
        restore_interrupts(pie);

        running_thread_suspend();
    }

    /// Wakes every thread currently waiting on this condition.
    ///
    /// Safe to call from interrupt handlers: moving waiters to the
    /// (pre-reserved) ready list never allocates.
    pub fn broadcast(&self) {
        critical(|| {
            let mut waiters = self.waiters.lock();
            let mut threads = THREADS.lock();
            let mut ready = READY.lock();
            for tid in waiters.drain(..) {
                threads.must(tid).state = State::Ready;
                ready.push_back(tid);
            }
        });
    }
}

struct LockState {
    holder: Option<Tid>,
    count: u32,
}

/// A reentrant sleeping lock.
///
/// Contended acquisition suspends the caller on the `released` condition
/// rather than spinning. The holder may re-acquire; each acquisition needs a
/// matching release, and a release by a non-holder is ignored.
pub struct Lock {
    state: Mutex<LockState>,
    released: Condition,
}

impl Lock {
    /// Creates an unheld lock.
    pub const fn new(name: &'static str) -> Self {
        Self {
            state: Mutex::new(LockState {
                holder: None,
                count: 0,
            }),
            released: Condition::new(name),
        }
    }

    /// Acquires the lock, suspending while another thread holds it.
    pub fn acquire(&self) {
        let me = running_thread();
        let pie = disable_interrupts();

        loop {
            {
                let mut state = self.state.lock();
                match state.holder {
                    Some(holder) if holder == me => {
                        state.count += 1;
                        break;
                    }
                    None => {
                        state.holder = Some(me);
                        state.count = 1;
                        break;
                    }
                    Some(_) => {}
                }
            }
            self.released.wait();
        }

        restore_interrupts(pie);
    }

    /// Releases one acquisition; the final release wakes all waiters.
    pub fn release(&self) {
        let me = running_thread();
        let pie = disable_interrupts();

        let freed = {
            let mut state = self.state.lock();
            if state.holder != Some(me) {
                false
            } else {
                state.count -= 1;
                if state.count == 0 {
                    state.holder = None;
                    true
                } else {
                    false
                }
            }
        };
        if freed {
            self.released.broadcast();
        }

        restore_interrupts(pie);
    }
}
