//! Device drivers and the device registry.
//!
//! Drivers attach themselves by name through [`register_device`]; opening a
//! device resolves the name and instance number to the driver's open
//! function, which produces an I/O endpoint. The full UART, RTC and VirtIO
//! block drivers are external to this tree and attach through the same
//! registry; the polled console and the power-off finisher live here.

pub mod ns8250;
pub mod syscon;

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::io::{Io, IoRef};
use crate::{Error, Result};

/// A driver entry point: produces an endpoint for one device instance.
pub type DevOpen = fn(instno: usize) -> Result<IoRef>;

struct Device {
    name: &'static str,
    instno: usize,
    open: DevOpen,
}

static DEVTAB: Mutex<Vec<Device>> = Mutex::new(Vec::new());

/// Registers a device instance under `name`.
pub fn register_device(name: &'static str, instno: usize, open: DevOpen) {
    DEVTAB.lock().push(Device { name, instno, open });
}

/// Opens instance `instno` of the device registered as `name`.
pub fn open_device(name: &str, instno: usize) -> Result<IoRef> {
    let open = DEVTAB
        .lock()
        .iter()
        .find(|d| d.name == name && d.instno == instno)
        .map(|d| d.open)
        .ok_or(Error::NoDevice)?;
    open(instno)
}

/// Registers the built-in console as serial device 0.
pub fn attach_console() {
    register_device("ser", 0, open_console);
}

fn open_console(_instno: usize) -> Result<IoRef> {
    Ok(Arc::new(ConsoleIo))
}

/// Byte-stream endpoint over the polled console UART.
struct ConsoleIo;

impl Io for ConsoleIo {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // Block until at least one byte arrives, then drain what is there.
        let mut n = 0;
        loop {
            while n < buf.len() {
                match ns8250::console().get() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n > 0 {
                return Ok(n);
            }
            crate::sched::thread_yield();
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut uart = ns8250::console();
        for &b in buf {
            uart.put(b);
        }
        Ok(buf.len())
    }
}
