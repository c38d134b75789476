//! Anonymous pipes.
//!
//! A pipe is a single-page ring buffer with one counted set of writer
//! handles and one of reader handles. Transfers move a byte at a time with
//! a broadcast after each one; simple, and correct for the data rates these
//! pipes see.

use alloc::sync::Arc;

use riscv::addr::PAGE_SIZE;
use riscv::registers::{disable_interrupts, restore_interrupts};
use spin::Mutex;

use crate::io::{Io, IoRef};
use crate::mm::Page;
use crate::sched::sync::Condition;
use crate::{Error, Result};

const PIPE_BUFSZ: usize = PAGE_SIZE;

struct PipeState {
    buf: Page,
    head: usize,
    tail: usize,
    readers: usize,
    writers: usize,
}

struct Pipe {
    state: Mutex<PipeState>,
    can_read: Condition,
    can_write: Condition,
}

impl Pipe {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut nread = 0;

        while nread < buf.len() {
            // Interrupts stay off from the emptiness check until the caller
            // is on the wait list, so a writer cannot slip its broadcast
            // into the gap.
            let pie = disable_interrupts();
            let took = {
                let mut state = self.state.lock();
                if state.head != state.tail {
                    buf[nread] = state.buf.as_slice()[state.head];
                    state.head = (state.head + 1) % PIPE_BUFSZ;
                    Some(true)
                } else if state.writers == 0 {
                    // Empty with no writers left: short read now, 0 next
                    // time.
                    Some(false)
                } else {
                    None
                }
            };
            match took {
                Some(true) => {
                    restore_interrupts(pie);
                    nread += 1;
                    self.can_write.broadcast();
                }
                Some(false) => {
                    restore_interrupts(pie);
                    return Ok(nread);
                }
                None => {
                    self.can_read.wait();
                    restore_interrupts(pie);
                }
            }
        }

        Ok(nread)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut nwritten = 0;

        while nwritten < buf.len() {
            let pie = disable_interrupts();
            let put = {
                let mut state = self.state.lock();
                if (state.tail + 1) % PIPE_BUFSZ != state.head {
                    let tail = state.tail;
                    state.buf.as_mut_slice()[tail] = buf[nwritten];
                    state.tail = (tail + 1) % PIPE_BUFSZ;
                    Some(true)
                } else if state.readers == 0 {
                    // Full with no readers left to drain it.
                    Some(false)
                } else {
                    None
                }
            };
            match put {
                Some(true) => {
                    restore_interrupts(pie);
                    nwritten += 1;
                    self.can_read.broadcast();
                }
                Some(false) => {
                    restore_interrupts(pie);
                    return Err(Error::BrokenPipe);
                }
                None => {
                    self.can_write.wait();
                    restore_interrupts(pie);
                }
            }
        }

        Ok(nwritten)
    }
}

/// The write end of a pipe.
struct PipeWriter(Arc<Pipe>);

/// The read end of a pipe.
struct PipeReader(Arc<Pipe>);

impl Io for PipeWriter {
    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.0.write(buf)
    }
}

impl Io for PipeReader {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.0.read(buf)
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.0.state.lock().writers -= 1;
        // Readers blocked on an empty pipe must notice the hangup.
        self.0.can_read.broadcast();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.0.state.lock().readers -= 1;
        // Writers blocked on a full pipe must notice the hangup.
        self.0.can_write.broadcast();
    }
}

/// Creates a pipe, returning its write and read endpoints.
pub fn create_pipe() -> Result<(IoRef, IoRef)> {
    let pipe = Arc::new(Pipe {
        state: Mutex::new(PipeState {
            buf: Page::new()?,
            head: 0,
            tail: 0,
            readers: 1,
            writers: 1,
        }),
        can_read: Condition::new("can_read"),
        can_write: Condition::new("can_write"),
    });

    let wio: IoRef = Arc::new(PipeWriter(pipe.clone()));
    let rio: IoRef = Arc::new(PipeReader(pipe));
    Ok((wio, rio))
}
