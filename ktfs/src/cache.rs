//! An LRU block cache over a [`BlockIo`] device.
//!
//! The cache holds a fixed number of 512-byte slots ordered from most to
//! least recently used. Callers pin a block for the duration of a closure;
//! the mutable borrow of the cache guarantees a pinned block cannot be
//! evicted underneath its user. Modified blocks are written through to the
//! backing device when released, so the cache never holds the only copy of
//! committed data for long; `flush` exists for the slots that were dirtied
//! without going through a release (eg. a failed write-through).

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::dev::BlockIo;
use crate::layout::BLOCK_SIZE;
use crate::Result;

/// Default number of blocks held in memory at once.
pub const CACHE_CAPACITY: usize = 16;

struct Slot {
    pos: u64,
    valid: bool,
    dirty: bool,
    buf: Box<[u8; BLOCK_SIZE]>,
}

/// A fixed-capacity write-through LRU cache of disk blocks.
pub struct BlockCache<D: BlockIo> {
    dev: D,
    slots: Vec<Slot>,
    // Slot indices in MRU-to-LRU order; always holds every slot exactly once.
    order: Vec<usize>,
}

impl<D: BlockIo> BlockCache<D> {
    /// Creates a cache of [`CACHE_CAPACITY`] slots over `dev`.
    pub fn new(dev: D) -> Self {
        Self::with_capacity(dev, CACHE_CAPACITY)
    }

    /// Creates a cache with an explicit slot count.
    pub fn with_capacity(dev: D, capacity: usize) -> Self {
        assert!(capacity > 0);
        let mut slots = Vec::with_capacity(capacity);
        let mut order = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                pos: 0,
                valid: false,
                dirty: false,
                buf: Box::new([0; BLOCK_SIZE]),
            });
            order.push(i);
        }
        Self { dev, slots, order }
    }

    /// Pins the block at byte offset `pos` and passes it to `f` read-only.
    pub fn read_block<R>(&mut self, pos: u64, f: impl FnOnce(&[u8; BLOCK_SIZE]) -> R) -> Result<R> {
        let idx = self.fetch(pos)?;
        Ok(f(&self.slots[idx].buf))
    }

    /// Pins the block at byte offset `pos`, passes it to `f` mutably, and
    /// writes the block through to the backing device on release.
    pub fn modify_block<R>(
        &mut self,
        pos: u64,
        f: impl FnOnce(&mut [u8; BLOCK_SIZE]) -> R,
    ) -> Result<R> {
        let idx = self.fetch(pos)?;
        let r = f(&mut self.slots[idx].buf);
        self.slots[idx].dirty = true;
        self.write_back(idx)?;
        Ok(r)
    }

    /// Writes every valid dirty slot back to the backing device.
    pub fn flush(&mut self) -> Result<()> {
        for idx in 0..self.slots.len() {
            if self.slots[idx].valid && self.slots[idx].dirty {
                self.write_back(idx)?;
            }
        }
        Ok(())
    }

    /// Flushes the cache and returns the backing device.
    pub fn into_dev(mut self) -> Result<D> {
        self.flush()?;
        Ok(self.dev)
    }

    /// Returns the backing device.
    pub fn dev_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    /// Returns the slot index holding `pos`, filling or evicting as needed.
    fn fetch(&mut self, pos: u64) -> Result<usize> {
        debug_assert!(pos % BLOCK_SIZE as u64 == 0);

        // Hit: re-thread the slot to the MRU position.
        if let Some(rank) = self
            .order
            .iter()
            .position(|&i| self.slots[i].valid && self.slots[i].pos == pos)
        {
            let idx = self.order.remove(rank);
            self.order.insert(0, idx);
            return Ok(idx);
        }

        // Miss with a free slot: fill it where it sits. It is promoted the
        // first time it is hit.
        if let Some(idx) = self.slots.iter().position(|s| !s.valid) {
            self.fill(idx, pos)?;
            return Ok(idx);
        }

        // Miss with a full cache: evict the LRU tail.
        let idx = *self.order.last().unwrap();
        if self.slots[idx].dirty {
            self.write_back(idx)?;
        }
        self.fill(idx, pos)?;
        self.order.pop();
        self.order.insert(0, idx);
        Ok(idx)
    }

    fn fill(&mut self, idx: usize, pos: u64) -> Result<()> {
        let slot = &mut self.slots[idx];
        slot.pos = pos;
        slot.valid = true;
        slot.dirty = false;
        if let Err(e) = self.dev.read_at(pos, &mut slot.buf[..]) {
            slot.valid = false;
            return Err(e);
        }
        Ok(())
    }

    fn write_back(&mut self, idx: usize) -> Result<()> {
        let slot = &mut self.slots[idx];
        self.dev.write_at(slot.pos, &slot.buf[..])?;
        slot.dirty = false;
        Ok(())
    }
}
