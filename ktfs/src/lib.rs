//! KTFS: a single-level directory, inode-based filesystem over 512-byte
//! blocks, together with the LRU block cache it runs on.
//!
//! The crate is independent of the kernel: both the cache and the filesystem
//! are generic over a [`BlockIo`] backing device, so the whole stack can be
//! exercised on the host against an in-memory disk. Locking is the caller's
//! concern; the kernel serializes every filesystem operation behind a single
//! lock.
//!
//! On-disk layout, in block order:
//!
//! ```text
//! [superblock][bitmap x B blocks][inode x N blocks][data ...]
//! ```
//!
//! All on-disk integers are little-endian. Block numbers stored in inodes and
//! index blocks are relative to the data region, and 0 is the "unallocated"
//! sentinel (data block 0 is reserved at format time so it can never be a
//! real pointer).

#![no_std]

extern crate alloc;

mod cache;
mod dev;
mod error;
mod fs;
mod layout;

pub use cache::{BlockCache, CACHE_CAPACITY};
pub use dev::{BlockIo, MemDisk};
pub use error::Error;
pub use fs::{FileId, Ktfs, MAX_OPEN_FILES};
pub use layout::{
    BlockPath, DirEntry, Inode, Superblock, BLOCK_SIZE, DIR_ENTRY_SIZE, INODE_SIZE,
    MAX_FILENAME_LEN, MAX_FILE_SIZE, NUM_DIRECT, PTRS_PER_BLOCK,
};

/// Result type used by every fallible operation in this crate.
pub type Result<T> = core::result::Result<T, Error>;
