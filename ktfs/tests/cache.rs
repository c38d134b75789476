use ktfs::{BlockCache, BlockIo, Error, MemDisk, BLOCK_SIZE};

/// A disk that counts device-level accesses, so tests can observe which
/// requests were served from the cache.
struct CountingDisk {
    inner: MemDisk,
    reads: Vec<u64>,
    writes: Vec<u64>,
}

impl CountingDisk {
    fn new(blocks: usize) -> Self {
        Self {
            inner: MemDisk::new(blocks * BLOCK_SIZE),
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }
}

impl BlockIo for CountingDisk {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> ktfs::Result<usize> {
        self.reads.push(pos);
        self.inner.read_at(pos, buf)
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> ktfs::Result<usize> {
        self.writes.push(pos);
        self.inner.write_at(pos, buf)
    }

    fn end(&mut self) -> ktfs::Result<u64> {
        self.inner.end()
    }
}

/// A disk whose writes can be turned off to simulate a failing device.
struct FlakyDisk {
    inner: MemDisk,
    fail_writes: bool,
}

impl BlockIo for FlakyDisk {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> ktfs::Result<usize> {
        self.inner.read_at(pos, buf)
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> ktfs::Result<usize> {
        if self.fail_writes {
            return Err(Error::Io);
        }
        self.inner.write_at(pos, buf)
    }

    fn end(&mut self) -> ktfs::Result<u64> {
        self.inner.end()
    }
}

fn pos(block: usize) -> u64 {
    (block * BLOCK_SIZE) as u64
}

#[test]
fn modified_blocks_are_written_through_on_release() {
    let mut cache = BlockCache::new(MemDisk::new(8 * BLOCK_SIZE));

    cache.modify_block(pos(3), |b| b[7] = 0xab).unwrap();

    // The device already has the byte, before any flush or eviction.
    let disk = cache.into_dev().unwrap();
    assert_eq!(disk.image()[3 * BLOCK_SIZE + 7], 0xab);
}

#[test]
fn repeated_reads_hit_the_cache() {
    let mut cache = BlockCache::new(CountingDisk::new(8));

    for _ in 0..5 {
        cache.read_block(pos(2), |_| ()).unwrap();
    }

    assert_eq!(cache.dev_mut().reads, vec![pos(2)]);
}

#[test]
fn recently_used_block_survives_eviction() {
    let mut cache = BlockCache::with_capacity(CountingDisk::new(64), 4);

    // Fill the cache, then make block 0 the most recently used.
    for i in 0..4 {
        cache.read_block(pos(i), |_| ()).unwrap();
    }
    cache.read_block(pos(0), |_| ()).unwrap();

    // Three more distinct blocks evict everything except block 0.
    for i in 4..7 {
        cache.read_block(pos(i), |_| ()).unwrap();
    }

    cache.dev_mut().reads.clear();
    cache.read_block(pos(0), |_| ()).unwrap();
    assert!(cache.dev_mut().reads.is_empty(), "block 0 was evicted");

    // Block 1 was the LRU victim and must be re-read.
    cache.read_block(pos(1), |_| ()).unwrap();
    assert_eq!(cache.dev_mut().reads, vec![pos(1)]);
}

#[test]
fn least_recently_used_block_is_the_eviction_victim() {
    let mut cache = BlockCache::with_capacity(CountingDisk::new(64), 4);

    for i in 0..4 {
        cache.read_block(pos(i), |_| ()).unwrap();
    }
    // Touch everything except block 0, leaving it least recently used.
    for i in 1..4 {
        cache.read_block(pos(i), |_| ()).unwrap();
    }

    // The next miss evicts block 0, so re-reading it goes to the device.
    cache.read_block(pos(4), |_| ()).unwrap();
    cache.dev_mut().reads.clear();
    cache.read_block(pos(0), |_| ()).unwrap();
    assert_eq!(cache.dev_mut().reads, vec![pos(0)]);
}

#[test]
fn read_round_trips_through_eviction() {
    let mut cache = BlockCache::with_capacity(MemDisk::new(64 * BLOCK_SIZE), 2);

    for i in 0..8u8 {
        cache
            .modify_block(pos(i as usize), |b| b.fill(i ^ 0x5a))
            .unwrap();
    }
    for i in 0..8u8 {
        let byte = cache.read_block(pos(i as usize), |b| b[100]).unwrap();
        assert_eq!(byte, i ^ 0x5a);
    }
}

#[test]
fn device_errors_are_returned_verbatim() {
    let mut cache = BlockCache::new(MemDisk::new(2 * BLOCK_SIZE));

    // Out-of-range read fails with the device's own error.
    assert_eq!(cache.read_block(pos(100), |_| ()).unwrap_err(), Error::Invalid);

    // A failed fill must not leave a valid slot behind.
    cache.modify_block(pos(1), |b| b[0] = 9).unwrap();
    assert_eq!(cache.read_block(pos(1), |b| b[0]).unwrap(), 9);
}

#[test]
fn flush_retries_blocks_dirtied_by_a_failed_write_through() {
    let disk = FlakyDisk {
        inner: MemDisk::new(8 * BLOCK_SIZE),
        fail_writes: false,
    };
    let mut cache = BlockCache::new(disk);

    // Prime the slot, then fail the write-through.
    cache.modify_block(pos(1), |b| b[0] = 1).unwrap();
    cache.dev_mut().fail_writes = true;
    assert_eq!(
        cache.modify_block(pos(1), |b| b[0] = 2).unwrap_err(),
        Error::Io
    );

    // Once the device recovers, flush writes the pending block back.
    cache.dev_mut().fail_writes = false;
    cache.flush().unwrap();
    let disk = cache.into_dev().unwrap();
    assert_eq!(disk.inner.image()[BLOCK_SIZE], 2);
}
