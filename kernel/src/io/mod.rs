//! The unified I/O object layer.
//!
//! Every byte- or block-oriented endpoint in the kernel is an [`Io`] trait
//! object behind an [`Arc`]; duplication clones the handle and an endpoint
//! shuts down when its last handle is dropped. Operations an endpoint does
//! not support report [`Error::NotSupported`] through the trait's provided
//! defaults.

pub mod pipe;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::{Error, Result};

/// A polymorphic I/O endpoint.
///
/// `read`/`write` are sequential, `read_at`/`write_at` positioned. The
/// control surface (`block_size`, `end`, `set_end`, `pos`, `seek`) replaces
/// the ioctl word of a classic Unix driver; the syscall layer maps ioctl
/// commands onto it.
pub trait Io: Send + Sync {
    /// Reads into `buf`, returning the number of bytes transferred.
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    /// Writes `buf`, returning the number of bytes transferred.
    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    /// Reads into `buf` at byte position `pos`.
    fn read_at(&self, _pos: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    /// Writes `buf` at byte position `pos`.
    fn write_at(&self, _pos: u64, _buf: &[u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    /// Returns the transfer granularity in bytes (1 for byte streams).
    fn block_size(&self) -> u64 {
        1
    }

    /// Returns the end position (size) of the endpoint.
    fn end(&self) -> Result<u64> {
        Err(Error::NotSupported)
    }

    /// Grows or truncates the endpoint to `end` bytes.
    fn set_end(&self, _end: u64) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Returns the current position of a seekable endpoint.
    fn pos(&self) -> Result<u64> {
        Err(Error::NotSupported)
    }

    /// Moves the current position of a seekable endpoint.
    fn seek(&self, _pos: u64) -> Result<()> {
        Err(Error::NotSupported)
    }
}

/// A shared handle to an I/O endpoint.
pub type IoRef = Arc<dyn Io>;

/// Reads until `buf` is full or the endpoint reports end-of-stream.
pub fn io_fill(io: &dyn Io, buf: &mut [u8]) -> Result<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = io.read(&mut buf[pos..])?;
        if n == 0 {
            break;
        }
        pos += n;
    }
    Ok(pos)
}

/// Writes all of `buf`, retrying short writes.
pub fn io_write_all(io: &dyn Io, buf: &[u8]) -> Result<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = io.write(&buf[pos..])?;
        if n == 0 {
            break;
        }
        pos += n;
    }
    Ok(pos)
}

/// A growable memory-backed endpoint, used for RAM disks and staging
/// buffers.
pub struct MemIo {
    data: Mutex<Vec<u8>>,
    capacity: usize,
}

impl MemIo {
    /// Creates a zero-filled memory endpoint of `size` bytes that can grow
    /// up to `capacity`.
    pub fn new(size: usize, capacity: usize) -> Arc<MemIo> {
        Arc::new(MemIo {
            data: Mutex::new(vec![0; size]),
            capacity: capacity.max(size),
        })
    }

    /// Wraps an existing buffer; `set_end` may grow it up to `capacity`.
    pub fn from_vec(data: Vec<u8>, capacity: usize) -> Arc<MemIo> {
        let capacity = capacity.max(data.len());
        Arc::new(MemIo {
            data: Mutex::new(data),
            capacity,
        })
    }
}

impl Io for MemIo {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let pos = pos as usize;
        if pos >= data.len() {
            return Err(Error::Invalid);
        }
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        Ok(n)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        let mut data = self.data.lock();
        let pos = pos as usize;
        if pos >= data.len() {
            return Err(Error::Invalid);
        }
        let n = buf.len().min(data.len() - pos);
        data[pos..pos + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn end(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn set_end(&self, end: u64) -> Result<()> {
        if end as usize > self.capacity {
            return Err(Error::Invalid);
        }
        self.data.lock().resize(end as usize, 0);
        Ok(())
    }
}

struct SeekState {
    pos: u64,
    end: u64,
}

/// A seekable adapter over a positioned endpoint.
///
/// Maintains a cursor so that plain `read`/`write` work against a backing
/// endpoint that only implements `read_at`/`write_at`. Sequential transfers
/// are restricted to whole multiples of the backing block size.
pub struct SeekIo {
    bkg: IoRef,
    blksz: u64,
    state: Mutex<SeekState>,
}

impl SeekIo {
    /// Wraps `bkg`, whose block size must be a power of two.
    pub fn new(bkg: IoRef) -> Result<Arc<SeekIo>> {
        let blksz = bkg.block_size();
        if blksz == 0 || !blksz.is_power_of_two() {
            return Err(Error::Invalid);
        }
        let end = bkg.end()?;
        Ok(Arc::new(SeekIo {
            bkg,
            blksz,
            state: Mutex::new(SeekState { pos: 0, end }),
        }))
    }
}

impl Io for SeekIo {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();

        // Cannot read past end.
        let mut len = (buf.len() as u64).min(state.end - state.pos);
        if len == 0 {
            return Ok(0);
        }
        // Sequential requests must cover at least one block, and are
        // truncated to a block multiple.
        if len < self.blksz {
            return Err(Error::Invalid);
        }
        len &= !(self.blksz - 1);

        let n = self.bkg.read_at(state.pos, &mut buf[..len as usize])?;
        state.pos += n as u64;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();

        if buf.is_empty() {
            return Ok(0);
        }
        let mut len = buf.len() as u64;
        if len < self.blksz {
            return Err(Error::Invalid);
        }
        len &= !(self.blksz - 1);

        // Writing past the end grows the backing endpoint first.
        if state.end - state.pos < len {
            let end = state.pos.checked_add(len).ok_or(Error::Invalid)?;
            self.bkg.set_end(end)?;
            state.end = end;
        }

        let n = self.bkg.write_at(state.pos, &buf[..len as usize])?;
        state.pos += n as u64;
        Ok(n)
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.bkg.read_at(pos, buf)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        self.bkg.write_at(pos, buf)
    }

    fn block_size(&self) -> u64 {
        self.blksz
    }

    fn pos(&self) -> Result<u64> {
        Ok(self.state.lock().pos)
    }

    fn seek(&self, pos: u64) -> Result<()> {
        let mut state = self.state.lock();
        // The new position must be block-aligned and not past the end.
        if pos & (self.blksz - 1) != 0 || pos > state.end {
            return Err(Error::Invalid);
        }
        state.pos = pos;
        Ok(())
    }

    fn end(&self) -> Result<u64> {
        Ok(self.state.lock().end)
    }

    fn set_end(&self, end: u64) -> Result<()> {
        let mut state = self.state.lock();
        self.bkg.set_end(end)?;
        state.end = end;
        Ok(())
    }
}
