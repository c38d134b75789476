//! Polled driver for the NS8250 console UART.
//!
//! Only the polled paths used by the kernel console live here; the
//! interrupt-driven UART driver with its receive and transmit rings is an
//! external device driver that attaches through the device registry.

use core::fmt;

use lazy_static::lazy_static;
use spin::{Mutex, MutexGuard};

use crate::config::UART0_MMIO_BASE;

// Register offsets from the UART base.
const RBR_THR: usize = 0; // receive buffer (read) / transmit holding (write)
const LSR: usize = 5; // line status

const LSR_DATA_READY: u8 = 1 << 0;
const LSR_THR_EMPTY: u8 = 1 << 5;

lazy_static! {
    /// Instance of the UART0 serial port on this machine.
    static ref UART0: Mutex<Ns8250> = Mutex::new(Ns8250::new(UART0_MMIO_BASE));
}

/// Locks and returns the console UART.
pub fn console() -> MutexGuard<'static, Ns8250> {
    UART0.lock()
}

/// Device driver for the polled side of an NS8250 UART.
pub struct Ns8250 {
    base: *mut u8,
}

// SAFETY: MMIO accesses are volatile and serialized by the owning Mutex.
unsafe impl Send for Ns8250 {}

impl Ns8250 {
    /// Creates a driver for the UART mapped at `base`.
    pub const fn new(base: usize) -> Self {
        Self {
            base: base as *mut u8,
        }
    }

    fn reg_read(&self, off: usize) -> u8 {
        // SAFETY: `base` points at the UART register block.
        unsafe { self.base.add(off).read_volatile() }
    }

    fn reg_write(&mut self, off: usize, val: u8) {
        // SAFETY: `base` points at the UART register block.
        unsafe { self.base.add(off).write_volatile(val) }
    }

    /// Writes a single byte, spinning while the transmitter is busy.
    pub fn put(&mut self, val: u8) {
        while self.reg_read(LSR) & LSR_THR_EMPTY == 0 {}
        self.reg_write(RBR_THR, val);
    }

    /// Returns the next received byte, or `None` if the FIFO is empty.
    pub fn get(&mut self) -> Option<u8> {
        if self.reg_read(LSR) & LSR_DATA_READY != 0 {
            Some(self.reg_read(RBR_THR))
        } else {
            None
        }
    }
}

impl fmt::Write for Ns8250 {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            self.put(b);
        }
        Ok(())
    }
}
