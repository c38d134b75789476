//! The KTFS filesystem core: superblock and region bookkeeping, inode and
//! directory manipulation, the bounded open-file table, and file data paths.

use crate::cache::BlockCache;
use crate::dev::BlockIo;
use crate::layout::{
    block_path, BlockPath, DirEntry, Inode, Superblock, BLOCK_SIZE, DIR_ENTRY_SIZE, INODE_SIZE,
    MAX_FILENAME_LEN, MAX_FILE_SIZE, NUM_DIRECT, PTRS_PER_BLOCK,
};
use crate::{Error, Result};

/// Capacity of the open-file table.
pub const MAX_OPEN_FILES: usize = 96;

/// Inode flag marking an allocated inode, so that a freshly created empty
/// file is never mistaken for a free inode slot.
const INODE_IN_USE: u32 = 1;

const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;
const DENTRIES_PER_BLOCK: usize = BLOCK_SIZE / DIR_ENTRY_SIZE;
const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

/// Handle to an entry in the open-file table.
///
/// Carries a generation stamp so that a handle revoked by `delete` stays
/// dead even after its table slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId {
    slot: usize,
    gen: u64,
}

#[derive(Clone)]
struct OpenFile {
    entry: DirEntry,
    fsize: u64,
    gen: u64,
}

/// A mounted KTFS volume.
pub struct Ktfs<D: BlockIo> {
    cache: BlockCache<D>,
    superblock: Superblock,
    bitmap_start: u32,
    inode_start: u32,
    data_start: u32,
    open_files: [Option<OpenFile>; MAX_OPEN_FILES],
    open_gen: u64,
}

const NO_FILE: Option<OpenFile> = None;

impl<D: BlockIo> Ktfs<D> {
    /// Mounts the volume on `dev`, reading the superblock from block 0.
    pub fn mount(dev: D) -> Result<Self> {
        let mut cache = BlockCache::new(dev);
        let superblock = cache.read_block(0, |b| Superblock::read_from(b))?;

        let b = superblock.bitmap_block_count;
        let n = superblock.inode_block_count;
        if b == 0 || n == 0 || superblock.block_count <= 1 + b + n {
            return Err(Error::Invalid);
        }

        Ok(Self {
            cache,
            superblock,
            bitmap_start: 1,
            inode_start: 1 + b,
            data_start: 1 + b + n,
            open_files: [NO_FILE; MAX_OPEN_FILES],
            open_gen: 0,
        })
    }

    /// Writes a fresh, empty filesystem onto `dev` and mounts it.
    ///
    /// `total_blocks` is the size of the volume and `inode_blocks` the size
    /// of the inode region. Data block 0 is reserved as the hole sentinel and
    /// data block 1 becomes the root directory's first block.
    pub fn format(dev: D, total_blocks: u32, inode_blocks: u32) -> Result<Self> {
        if inode_blocks == 0 {
            return Err(Error::Invalid);
        }

        // B bitmap blocks track T - 1 - B - N data blocks.
        let rest = total_blocks
            .checked_sub(1 + inode_blocks)
            .ok_or(Error::Invalid)?;
        let bitmap_blocks = rest.div_ceil(BITS_PER_BLOCK + 1).max(1);
        let data_blocks = rest.checked_sub(bitmap_blocks).ok_or(Error::Invalid)?;
        if data_blocks < 2 {
            return Err(Error::Invalid);
        }

        let superblock = Superblock {
            block_count: total_blocks,
            bitmap_block_count: bitmap_blocks,
            inode_block_count: inode_blocks,
            root_directory_inode: 0,
        };

        let mut fs = Self {
            cache: BlockCache::new(dev),
            superblock,
            bitmap_start: 1,
            inode_start: 1 + bitmap_blocks,
            data_start: 1 + bitmap_blocks + inode_blocks,
            open_files: [NO_FILE; MAX_OPEN_FILES],
            open_gen: 0,
        };

        if fs.cache.dev_mut().end()? < total_blocks as u64 * BLOCK_SIZE as u64 {
            return Err(Error::Invalid);
        }

        fs.cache
            .modify_block(0, |b| superblock.write_to(&mut b[..]))?;

        // Bitmap: everything free, except the sentinel (bit 0), the root
        // directory block (bit 1), and the padding bits past the data region.
        for i in 0..bitmap_blocks {
            let first_bit = i * BITS_PER_BLOCK;
            fs.cache.modify_block(fs.abs_block(fs.bitmap_start + i), |b| {
                b.fill(0);
                for bit in 0..BITS_PER_BLOCK {
                    let n = first_bit + bit;
                    if n < 2 || n >= data_blocks {
                        b[(bit / 8) as usize] |= 1 << (bit % 8);
                    }
                }
            })?;
        }

        for i in 0..inode_blocks {
            fs.cache
                .modify_block(fs.abs_block(fs.inode_start + i), |b| b.fill(0))?;
        }

        let root = Inode {
            size: 0,
            flags: INODE_IN_USE,
            block: [1, 0, 0],
            indirect: 0,
            dindirect: [0, 0],
        };
        fs.put_inode(0, &root)?;
        fs.zero_data_block(1)?;

        Ok(fs)
    }

    /// Writes every dirty cache slot back to the device.
    pub fn flush(&mut self) -> Result<()> {
        self.cache.flush()
    }

    /// Flushes and returns the backing device.
    pub fn unmount(self) -> Result<D> {
        self.cache.into_dev()
    }

    /// Returns the backing device. Flush first when inspecting raw state.
    pub fn device_mut(&mut self) -> &mut D {
        self.cache.dev_mut()
    }

    /// Opens `name` for exclusive use.
    pub fn open(&mut self, name: &str) -> Result<FileId> {
        if self
            .open_files
            .iter()
            .flatten()
            .any(|f| f.entry.matches(name))
        {
            return Err(Error::Busy);
        }

        let slot = self
            .open_files
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooManyOpen)?;

        let (ino, _) = self.find_dentry(name)?;
        let inode = self.get_inode(ino)?;

        self.open_gen += 1;
        self.open_files[slot] = Some(OpenFile {
            entry: DirEntry::new(name, ino),
            fsize: inode.size as u64,
            gen: self.open_gen,
        });
        Ok(FileId {
            slot,
            gen: self.open_gen,
        })
    }

    /// Releases an open file. Stale handles are ignored.
    pub fn close(&mut self, fid: FileId) {
        if let Some(slot) = self.open_files.get_mut(fid.slot) {
            if slot.as_ref().is_some_and(|f| f.gen == fid.gen) {
                *slot = None;
            }
        }
    }

    /// Returns the size of an open file.
    pub fn size(&self, fid: FileId) -> Result<u64> {
        Ok(self.file(fid)?.fsize)
    }

    /// Reads up to `buf.len()` bytes at byte offset `pos`.
    ///
    /// Reads are clamped to the file size; unallocated blocks read as zeros.
    pub fn read_at(&mut self, fid: FileId, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let file = self.file(fid)?;
        let fsize = file.fsize;
        let ino = file.entry.inode;
        if pos >= fsize {
            return Ok(0);
        }

        let len = buf.len().min((fsize - pos) as usize);
        let inode = self.get_inode(ino)?;
        let mut done = 0;

        while done < len {
            let off = pos + done as u64;
            let index = off / BLOCK_SIZE as u64;
            let in_block = (off % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - in_block).min(len - done);
            let dst = &mut buf[done..done + chunk];

            match self.get_data_block(&inode, index) {
                Ok(Some(blk)) => {
                    let abs = self.abs_data(blk);
                    match self
                        .cache
                        .read_block(abs, |b| dst.copy_from_slice(&b[in_block..in_block + chunk]))
                    {
                        Ok(()) => {}
                        Err(e) => return if done > 0 { Ok(done) } else { Err(e) },
                    }
                }
                // Sparse block: reads as zeros.
                Ok(None) => dst.fill(0),
                Err(e) => return if done > 0 { Ok(done) } else { Err(e) },
            }

            done += chunk;
        }

        Ok(done)
    }

    /// Writes up to `buf.len()` bytes at byte offset `pos`.
    ///
    /// Writes never extend the file: they are clamped to the current size,
    /// and growing requires [`Ktfs::set_end`] first.
    pub fn write_at(&mut self, fid: FileId, pos: u64, buf: &[u8]) -> Result<usize> {
        let file = self.file(fid)?;
        let fsize = file.fsize;
        let ino = file.entry.inode;
        if pos >= fsize {
            return Ok(0);
        }

        let len = buf.len().min((fsize - pos) as usize);
        let inode = self.get_inode(ino)?;
        let mut done = 0;

        while done < len {
            let off = pos + done as u64;
            let index = off / BLOCK_SIZE as u64;
            let in_block = (off % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - in_block).min(len - done);
            let src = &buf[done..done + chunk];

            let result = match self.get_data_block(&inode, index) {
                Ok(Some(blk)) => {
                    let abs = self.abs_data(blk);
                    self.cache
                        .modify_block(abs, |b| b[in_block..in_block + chunk].copy_from_slice(src))
                }
                // A block inside the file size is always allocated by
                // set_end, so a hole here is a corrupt volume.
                Ok(None) => Err(Error::Io),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                return if done > 0 { Ok(done) } else { Err(e) };
            }

            done += chunk;
        }

        Ok(done)
    }

    /// Grows an open file to `new_size` bytes, allocating and zeroing every
    /// newly needed data block and index block.
    pub fn set_end(&mut self, fid: FileId, new_size: u64) -> Result<()> {
        let file = self.file(fid)?;
        let ino = file.entry.inode;
        let mut inode = self.get_inode(ino)?;

        if new_size < inode.size as u64 || new_size > MAX_FILE_SIZE {
            return Err(Error::Invalid);
        }

        let old_blocks = (inode.size as u64).div_ceil(BLOCK_SIZE as u64);
        let new_blocks = new_size.div_ceil(BLOCK_SIZE as u64);

        for index in old_blocks..new_blocks {
            let blk = self.find_free_data_block()?;
            self.zero_data_block(blk)?;
            self.install_data_block(&mut inode, index, blk)?;
        }

        inode.size = new_size as u32;
        self.put_inode(ino, &inode)?;
        self.file_mut(fid)?.fsize = new_size;
        Ok(())
    }

    /// Creates an empty file named `name` in the root directory.
    pub fn create(&mut self, name: &str) -> Result<()> {
        check_name(name)?;
        match self.find_dentry(name) {
            Ok(_) => return Err(Error::Busy),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        let root_ino = self.superblock.root_directory_inode;
        let mut root = self.get_inode(root_ino)?;

        // The root directory is bounded by its direct blocks.
        if root.size as usize >= NUM_DIRECT * BLOCK_SIZE {
            return Err(Error::NoSpace);
        }

        let dir_block = root.size as usize / BLOCK_SIZE;
        if root.block[dir_block] == 0 {
            let blk = self.find_free_data_block()?;
            self.zero_data_block(blk)?;
            root.block[dir_block] = blk;
        }

        let ino = self.find_free_inode()?;
        self.put_inode(
            ino,
            &Inode {
                flags: INODE_IN_USE,
                ..Inode::default()
            },
        )?;

        let entry = DirEntry::new(name, ino);
        let abs = self.abs_data(root.block[dir_block]);
        let in_block = root.size as usize % BLOCK_SIZE;
        self.cache.modify_block(abs, |b| {
            entry.write_to(&mut b[in_block..in_block + DIR_ENTRY_SIZE])
        })?;

        root.size += DIR_ENTRY_SIZE as u32;
        self.put_inode(root_ino, &root)
    }

    /// Deletes `name`: removes its directory entry, releases every data and
    /// index block it references, and clears its inode.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        check_name(name)?;

        // Deleting an open file revokes its handle.
        for slot in self.open_files.iter_mut() {
            if slot.as_ref().is_some_and(|f| f.entry.matches(name)) {
                *slot = None;
            }
        }

        let ino = self.remove_dentry(name)?;
        let inode = self.take_inode(ino)?;
        let num_blocks = (inode.size as u64).div_ceil(BLOCK_SIZE as u64);
        let mut cleared = 0u64;

        for i in 0..NUM_DIRECT {
            if cleared >= num_blocks {
                break;
            }
            if inode.block[i] != 0 {
                self.free_data_block(inode.block[i])?;
                cleared += 1;
            }
        }

        if inode.indirect != 0 {
            cleared += self.free_index_block(inode.indirect, num_blocks - cleared)?;
            self.free_data_block(inode.indirect)?;
        }

        for &dind in inode.dindirect.iter() {
            if dind == 0 {
                continue;
            }
            let tops = self.read_index_block(dind)?;
            for top in tops.into_iter().filter(|&b| b != 0) {
                cleared += self.free_index_block(top, num_blocks - cleared)?;
                self.free_data_block(top)?;
            }
            self.free_data_block(dind)?;
        }

        Ok(())
    }

    // Block address helpers. Stored block numbers are data-region-relative;
    // cache positions are absolute byte offsets.

    fn abs_block(&self, blk: u32) -> u64 {
        blk as u64 * BLOCK_SIZE as u64
    }

    fn abs_data(&self, data_blk: u32) -> u64 {
        self.abs_block(self.data_start + data_blk)
    }

    fn file(&self, fid: FileId) -> Result<&OpenFile> {
        self.open_files
            .get(fid.slot)
            .and_then(Option::as_ref)
            .filter(|f| f.gen == fid.gen)
            .ok_or(Error::Invalid)
    }

    fn file_mut(&mut self, fid: FileId) -> Result<&mut OpenFile> {
        self.open_files
            .get_mut(fid.slot)
            .and_then(Option::as_mut)
            .filter(|f| f.gen == fid.gen)
            .ok_or(Error::Invalid)
    }

    // Inode access: pin the containing inode block, copy in or out.

    fn get_inode(&mut self, ino: u16) -> Result<Inode> {
        let (abs, off) = self.inode_pos(ino)?;
        self.cache
            .read_block(abs, |b| Inode::read_from(&b[off..off + INODE_SIZE]))
    }

    fn put_inode(&mut self, ino: u16, inode: &Inode) -> Result<()> {
        let (abs, off) = self.inode_pos(ino)?;
        self.cache
            .modify_block(abs, |b| inode.write_to(&mut b[off..off + INODE_SIZE]))
    }

    /// Reads an inode and zeroes it on disk in one pinned access.
    fn take_inode(&mut self, ino: u16) -> Result<Inode> {
        let (abs, off) = self.inode_pos(ino)?;
        self.cache.modify_block(abs, |b| {
            let inode = Inode::read_from(&b[off..off + INODE_SIZE]);
            b[off..off + INODE_SIZE].fill(0);
            inode
        })
    }

    fn inode_pos(&self, ino: u16) -> Result<(u64, usize)> {
        let block = ino as u32 / INODES_PER_BLOCK as u32;
        if block >= self.superblock.inode_block_count {
            return Err(Error::Invalid);
        }
        Ok((
            self.abs_block(self.inode_start + block),
            ino as usize % INODES_PER_BLOCK * INODE_SIZE,
        ))
    }

    // Directory scan and removal. The root directory is a packed array of
    // entries across the root inode's direct blocks.

    fn find_dentry(&mut self, name: &str) -> Result<(u16, usize)> {
        let root = self.get_inode(self.superblock.root_directory_inode)?;
        let total = root.size as usize / DIR_ENTRY_SIZE;

        let mut index = 0;
        for bi in 0..NUM_DIRECT {
            if index >= total {
                break;
            }
            let abs = self.abs_data(root.block[bi]);
            let found = self.cache.read_block(abs, |b| {
                for ei in 0..DENTRIES_PER_BLOCK {
                    if index + ei >= total {
                        return None;
                    }
                    let entry = DirEntry::read_from(&b[ei * DIR_ENTRY_SIZE..]);
                    if entry.matches(name) {
                        return Some((entry.inode, index + ei));
                    }
                }
                None
            })?;
            if let Some(hit) = found {
                return Ok(hit);
            }
            index += DENTRIES_PER_BLOCK;
        }

        Err(Error::NotFound)
    }

    /// Unlinks `name` from the root directory by swapping the last entry
    /// into its slot, and returns the removed inode number.
    fn remove_dentry(&mut self, name: &str) -> Result<u16> {
        let root_ino = self.superblock.root_directory_inode;
        let mut root = self.get_inode(root_ino)?;
        let (ino, found_idx) = self.find_dentry(name)?;

        let last_idx = root.size as usize / DIR_ENTRY_SIZE - 1;
        let last_abs = self.abs_data(root.block[last_idx / DENTRIES_PER_BLOCK]);
        let last_off = last_idx % DENTRIES_PER_BLOCK * DIR_ENTRY_SIZE;

        // Pull the last entry out and clear its slot.
        let last = self.cache.modify_block(last_abs, |b| {
            let entry = DirEntry::read_from(&b[last_off..]);
            b[last_off..last_off + DIR_ENTRY_SIZE].fill(0);
            entry
        })?;

        if found_idx != last_idx {
            let found_abs = self.abs_data(root.block[found_idx / DENTRIES_PER_BLOCK]);
            let found_off = found_idx % DENTRIES_PER_BLOCK * DIR_ENTRY_SIZE;
            self.cache.modify_block(found_abs, |b| {
                last.write_to(&mut b[found_off..found_off + DIR_ENTRY_SIZE])
            })?;
        }

        root.size -= DIR_ENTRY_SIZE as u32;
        self.put_inode(root_ino, &root)?;
        Ok(ino)
    }

    // Free-space bitmap. One bit per data-region block, clear = free.

    fn bit_pos(&self, blk: u32) -> (u64, usize, u8) {
        let abs = self.abs_block(self.bitmap_start + blk / BITS_PER_BLOCK);
        let bit = blk % BITS_PER_BLOCK;
        (abs, bit as usize / 8, 1 << (bit % 8))
    }

    /// Finds the first clear bitmap bit, sets it, and returns the block.
    fn find_free_data_block(&mut self) -> Result<u32> {
        for bmp in 0..self.superblock.bitmap_block_count {
            let abs = self.abs_block(self.bitmap_start + bmp);
            let found = self.cache.modify_block(abs, |b| {
                for (i, byte) in b.iter_mut().enumerate() {
                    if *byte != 0xff {
                        let j = byte.trailing_ones();
                        *byte |= 1 << j;
                        return Some(bmp * BITS_PER_BLOCK + i as u32 * 8 + j);
                    }
                }
                None
            })?;
            if let Some(blk) = found {
                return Ok(blk);
            }
        }
        Err(Error::NoSpace)
    }

    fn free_data_block(&mut self, blk: u32) -> Result<()> {
        let (abs, byte, mask) = self.bit_pos(blk);
        self.cache.modify_block(abs, |b| b[byte] &= !mask)
    }

    fn zero_data_block(&mut self, blk: u32) -> Result<()> {
        let abs = self.abs_data(blk);
        self.cache.modify_block(abs, |b| b.fill(0))
    }

    fn read_index_block(&mut self, blk: u32) -> Result<[u32; PTRS_PER_BLOCK]> {
        let abs = self.abs_data(blk);
        self.cache.read_block(abs, |b| {
            let mut ptrs = [0u32; PTRS_PER_BLOCK];
            for (i, p) in ptrs.iter_mut().enumerate() {
                *p = u32::from_le_bytes([b[4 * i], b[4 * i + 1], b[4 * i + 2], b[4 * i + 3]]);
            }
            ptrs
        })
    }

    fn write_index_entry(&mut self, blk: u32, index: usize, value: u32) -> Result<()> {
        let abs = self.abs_data(blk);
        self.cache.modify_block(abs, |b| {
            b[4 * index..4 * index + 4].copy_from_slice(&value.to_le_bytes())
        })
    }

    /// Clears the bitmap bits of up to `limit` data blocks referenced by an
    /// index block, returning how many were cleared.
    fn free_index_block(&mut self, blk: u32, limit: u64) -> Result<u64> {
        let ptrs = self.read_index_block(blk)?;
        let mut cleared = 0;
        for ptr in ptrs.into_iter().filter(|&b| b != 0) {
            if cleared >= limit {
                break;
            }
            self.free_data_block(ptr)?;
            cleared += 1;
        }
        Ok(cleared)
    }

    /// Resolves file block `index` of `inode` to a data-region block number.
    /// Returns `None` for unallocated (sparse) blocks.
    fn get_data_block(&mut self, inode: &Inode, index: u64) -> Result<Option<u32>> {
        let blk = match block_path(index) {
            BlockPath::Direct(i) => inode.block[i],
            BlockPath::Indirect(i) => {
                if inode.indirect == 0 {
                    return Ok(None);
                }
                self.read_index_block(inode.indirect)?[i]
            }
            BlockPath::DoubleIndirect { slot, top, bottom } => {
                if inode.dindirect[slot] == 0 {
                    return Ok(None);
                }
                let second = self.read_index_block(inode.dindirect[slot])?[top];
                if second == 0 {
                    return Ok(None);
                }
                self.read_index_block(second)?[bottom]
            }
            BlockPath::OutOfRange => return Ok(None),
        };
        Ok((blk != 0).then_some(blk))
    }

    /// Installs freshly allocated data block `blk` as file block `index`,
    /// allocating and zero-filling intermediate index blocks on demand.
    fn install_data_block(&mut self, inode: &mut Inode, index: u64, blk: u32) -> Result<()> {
        match block_path(index) {
            BlockPath::Direct(i) => inode.block[i] = blk,
            BlockPath::Indirect(i) => {
                if inode.indirect == 0 {
                    inode.indirect = self.alloc_index_block()?;
                }
                self.write_index_entry(inode.indirect, i, blk)?;
            }
            BlockPath::DoubleIndirect { slot, top, bottom } => {
                if inode.dindirect[slot] == 0 {
                    inode.dindirect[slot] = self.alloc_index_block()?;
                }
                let mut second = self.read_index_block(inode.dindirect[slot])?[top];
                if second == 0 {
                    second = self.alloc_index_block()?;
                    self.write_index_entry(inode.dindirect[slot], top, second)?;
                }
                self.write_index_entry(second, bottom, blk)?;
            }
            BlockPath::OutOfRange => return Err(Error::Invalid),
        }
        Ok(())
    }

    fn alloc_index_block(&mut self) -> Result<u32> {
        let blk = self.find_free_data_block()?;
        self.zero_data_block(blk)?;
        Ok(blk)
    }

    fn find_free_inode(&mut self) -> Result<u16> {
        for block in 0..self.superblock.inode_block_count {
            let abs = self.abs_block(self.inode_start + block);
            let found = self.cache.read_block(abs, |b| {
                (0..INODES_PER_BLOCK)
                    .find(|i| Inode::read_from(&b[i * INODE_SIZE..]).is_free())
                    .map(|i| block as usize * INODES_PER_BLOCK + i)
            })?;
            if let Some(ino) = found {
                return Ok(ino as u16);
            }
        }
        Err(Error::NoSpace)
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_FILENAME_LEN || name.bytes().any(|b| b == 0) {
        return Err(Error::Invalid);
    }
    Ok(())
}
