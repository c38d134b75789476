//! Kernel-side filesystem glue.
//!
//! Owns the mounted KTFS volume and serializes every operation behind a
//! single filesystem lock; the block cache below has no locking of its own
//! and relies on this. Open files surface as seekable [`Io`] endpoints.

use alloc::sync::Arc;
use core::cell::UnsafeCell;

use ktfs::{FileId, Ktfs};

use crate::io::{Io, IoRef, SeekIo};
use crate::sched::sync::Lock;
use crate::{Error, Result};

/// Adapts an [`IoRef`] block endpoint to the cache's backing interface.
///
/// The cache issues whole-block transfers only, so a short transfer is a
/// device failure.
struct DiskIo {
    io: IoRef,
}

impl ktfs::BlockIo for DiskIo {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> ktfs::Result<usize> {
        match self.io.read_at(pos, buf) {
            Ok(n) if n == buf.len() => Ok(n),
            _ => Err(ktfs::Error::Io),
        }
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> ktfs::Result<usize> {
        match self.io.write_at(pos, buf) {
            Ok(n) if n == buf.len() => Ok(n),
            _ => Err(ktfs::Error::Io),
        }
    }

    fn end(&mut self) -> ktfs::Result<u64> {
        self.io.end().map_err(|_| ktfs::Error::Io)
    }
}

struct Filesystem {
    lock: Lock,
    fs: UnsafeCell<Option<Ktfs<DiskIo>>>,
}

// SAFETY: `fs` is only touched while `lock` is held.
unsafe impl Sync for Filesystem {}

static FS: Filesystem = Filesystem {
    lock: Lock::new("ktfs"),
    fs: UnsafeCell::new(None),
};

/// Runs `f` on the mounted volume under the filesystem lock.
fn with<R>(f: impl FnOnce(&mut Ktfs<DiskIo>) -> Result<R>) -> Result<R> {
    FS.lock.acquire();
    // SAFETY: the filesystem lock is held.
    let r = match unsafe { &mut *FS.fs.get() } {
        Some(fs) => f(fs),
        None => Err(Error::NoDevice),
    };
    FS.lock.release();
    r
}

/// Mounts the volume found on `io` as the filesystem.
pub fn fs_mount(io: IoRef) -> Result<()> {
    let fs = Ktfs::mount(DiskIo { io })?;

    FS.lock.acquire();
    // SAFETY: the filesystem lock is held.
    let slot = unsafe { &mut *FS.fs.get() };
    let r = if slot.is_some() {
        Err(Error::Busy)
    } else {
        *slot = Some(fs);
        Ok(())
    };
    FS.lock.release();
    r
}

/// Formats `io` with an empty volume and mounts it.
pub fn fs_format(io: IoRef, total_blocks: u32, inode_blocks: u32) -> Result<()> {
    let fs = Ktfs::format(DiskIo { io }, total_blocks, inode_blocks)?;

    FS.lock.acquire();
    // SAFETY: the filesystem lock is held.
    let slot = unsafe { &mut *FS.fs.get() };
    let r = if slot.is_some() {
        Err(Error::Busy)
    } else {
        *slot = Some(fs);
        Ok(())
    };
    FS.lock.release();
    r
}

/// Opens `name` for exclusive use, as a seekable endpoint.
pub fn fs_open(name: &str) -> Result<IoRef> {
    let id = with(|fs| Ok(fs.open(name)?))?;
    let file: IoRef = Arc::new(KtfsFile { id });
    Ok(SeekIo::new(file)?)
}

/// Creates an empty file named `name`.
pub fn fs_create(name: &str) -> Result<()> {
    with(|fs| Ok(fs.create(name)?))
}

/// Deletes the file named `name`, revoking any open handle to it.
pub fn fs_delete(name: &str) -> Result<()> {
    with(|fs| Ok(fs.delete(name)?))
}

/// Writes all dirty cached blocks back to the device.
pub fn fs_flush() -> Result<()> {
    with(|fs| Ok(fs.flush()?))
}

/// An open KTFS file. Closed when the last handle drops.
struct KtfsFile {
    id: FileId,
}

impl Io for KtfsFile {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        with(|fs| Ok(fs.read_at(self.id, pos, buf)?))
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        with(|fs| Ok(fs.write_at(self.id, pos, buf)?))
    }

    fn end(&self) -> Result<u64> {
        with(|fs| Ok(fs.size(self.id)?))
    }

    fn set_end(&self, end: u64) -> Result<()> {
        with(|fs| Ok(fs.set_end(self.id, end)?))
    }
}

impl Drop for KtfsFile {
    fn drop(&mut self) {
        let _ = with(|fs| {
            fs.close(self.id);
            Ok(())
        });
    }
}
