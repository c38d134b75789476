//! Timer alarms and the preemption interrupter.
//!
//! Sleeping threads park on per-alarm conditions kept in a wake-time-sorted
//! list; the timer compare register always tracks the earliest wake-up. The
//! timer interrupt promotes due sleepers to the ready list, and a dedicated
//! 10 ms interrupter thread turns that into periodic rescheduling for
//! everything else.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use riscv::registers::{disable_interrupts, restore_interrupts, Sie, SiFlags, Stimecmp, Time};
use spin::Mutex;

use crate::config::{QUANTUM_MS, TIMER_FREQ};
use crate::sched::sync::Condition;
use crate::sched::thread_spawn;

struct Sleeper {
    twake: u64,
    cond: Arc<Condition>,
}

// Sorted by twake ascending; ties keep insertion order.
static SLEEPERS: Mutex<VecDeque<Sleeper>> = Mutex::new(VecDeque::new());

/// Parks the timer hardware until the first alarm is set.
pub fn timer_init() {
    Stimecmp::write(u64::MAX);
}

/// A software alarm tracking an absolute wake-up time.
pub struct Alarm {
    twake: u64,
    cond: Arc<Condition>,
}

impl Alarm {
    /// Creates an alarm whose first sleep is relative to now.
    pub fn new(name: &'static str) -> Self {
        Self {
            twake: Time::read(),
            cond: Arc::new(Condition::new(name)),
        }
    }

    /// Makes the next sleep increment relative to the time of the call.
    pub fn reset(&mut self) {
        self.twake = Time::read();
    }

    /// Sleeps until `tcnt` timer ticks past the previous wake-up time.
    ///
    /// Advancing from the previous wake-up rather than from now gives a
    /// periodic caller a drift-free cadence.
    pub fn sleep(&mut self, tcnt: u64) {
        self.twake = self.twake.saturating_add(tcnt);
        if self.twake < Time::read() {
            return;
        }

        // Interrupts stay off from the list insert until the caller is on
        // the wait list, or the timer could fire and broadcast into an empty
        // condition before the wait begins.
        let pie = disable_interrupts();
        {
            let mut sleepers = SLEEPERS.lock();
            let at = sleepers
                .iter()
                .position(|s| s.twake > self.twake)
                .unwrap_or(sleepers.len());
            sleepers.insert(
                at,
                Sleeper {
                    twake: self.twake,
                    cond: self.cond.clone(),
                },
            );

            // The compare register always holds the earliest wake-up.
            if at == 0 {
                Stimecmp::write(self.twake);
            }
            Sie::set(SiFlags::STIE);
        }
        self.cond.wait();
        restore_interrupts(pie);
    }

    /// Sleeps for `sec` seconds.
    pub fn sleep_sec(&mut self, sec: u64) {
        self.sleep(sec * TIMER_FREQ);
    }

    /// Sleeps for `ms` milliseconds.
    pub fn sleep_ms(&mut self, ms: u64) {
        self.sleep(ms * (TIMER_FREQ / 1000));
    }

    /// Sleeps for `us` microseconds.
    pub fn sleep_us(&mut self, us: u64) {
        self.sleep(us * (TIMER_FREQ / 1_000_000));
    }
}

/// Sleeps the calling thread for `sec` seconds.
pub fn sleep_sec(sec: u64) {
    sleep_us(sec * 1_000_000);
}

/// Sleeps the calling thread for `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    sleep_us(ms * 1000);
}

/// Sleeps the calling thread for `us` microseconds.
pub fn sleep_us(us: u64) {
    let mut al = Alarm::new("sleep");
    al.sleep_us(us);
}

/// Wakes every due sleeper and re-arms or quiesces the timer.
///
/// Runs from the trap handler with interrupts disabled.
pub fn handle_timer_interrupt() {
    let now = Time::read();
    let mut sleepers = SLEEPERS.lock();

    while sleepers.front().is_some_and(|s| s.twake <= now) {
        let sleeper = sleepers.pop_front().unwrap();
        sleeper.cond.broadcast();
    }

    match sleepers.front() {
        Some(s) => Stimecmp::write(s.twake),
        None => Sie::clear(SiFlags::STIE),
    }
}

/// The interrupter: wakes up every scheduling quantum so that the running
/// thread is regularly forced through the ready list.
extern "C" fn interrupter(_: usize, _: usize) {
    let mut al = Alarm::new("interrupter");
    loop {
        al.sleep_ms(QUANTUM_MS);
    }
}

/// Spawns the interrupter thread.
pub fn start_interrupter() {
    thread_spawn("interrupter", interrupter, 0, 0).expect("cannot spawn interrupter");
}
