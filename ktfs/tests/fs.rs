use ktfs::{Error, Ktfs, MemDisk, BLOCK_SIZE, MAX_FILE_SIZE, MAX_OPEN_FILES};

const TOTAL_BLOCKS: u32 = 4096;
const INODE_BLOCKS: u32 = 8;

fn fresh_fs() -> Ktfs<MemDisk> {
    let disk = MemDisk::new(TOTAL_BLOCKS as usize * BLOCK_SIZE);
    Ktfs::format(disk, TOTAL_BLOCKS, INODE_BLOCKS).unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

#[test]
fn create_write_read_round_trip() {
    let mut fs = fresh_fs();
    fs.create("a").unwrap();

    let fid = fs.open("a").unwrap();
    fs.set_end(fid, 1024).unwrap();

    let data = pattern(1024);
    assert_eq!(fs.write_at(fid, 0, &data).unwrap(), 1024);

    let mut back = vec![0u8; 1024];
    assert_eq!(fs.read_at(fid, 0, &mut back).unwrap(), 1024);
    assert_eq!(back, data);
}

#[test]
fn data_survives_remount() {
    let mut fs = fresh_fs();
    fs.create("boot").unwrap();
    let fid = fs.open("boot").unwrap();
    fs.set_end(fid, 3000).unwrap();
    let data = pattern(3000);
    fs.write_at(fid, 0, &data).unwrap();
    fs.flush().unwrap();

    // Rebuild the cache and filesystem from the raw image, as after a reboot.
    let image = fs.unmount().unwrap().into_image();
    let mut fs = Ktfs::mount(MemDisk::from_image(image)).unwrap();

    let fid = fs.open("boot").unwrap();
    assert_eq!(fs.size(fid).unwrap(), 3000);
    let mut back = vec![0u8; 3000];
    assert_eq!(fs.read_at(fid, 0, &mut back).unwrap(), 3000);
    assert_eq!(back, data);
}

#[test]
fn unaligned_reads_and_writes() {
    let mut fs = fresh_fs();
    fs.create("f").unwrap();
    let fid = fs.open("f").unwrap();
    fs.set_end(fid, 4 * BLOCK_SIZE as u64).unwrap();

    // Straddle block boundaries in both directions.
    let data = pattern(700);
    assert_eq!(fs.write_at(fid, 300, &data).unwrap(), 700);
    let mut back = vec![0u8; 700];
    assert_eq!(fs.read_at(fid, 300, &mut back).unwrap(), 700);
    assert_eq!(back, data);

    // Bytes around the write are untouched (still zero from set_end).
    let mut edge = [0xffu8; 4];
    assert_eq!(fs.read_at(fid, 296, &mut edge).unwrap(), 4);
    assert_eq!(edge, [0, 0, 0, 0]);
}

#[test]
fn reads_clamp_at_end_of_file() {
    let mut fs = fresh_fs();
    fs.create("f").unwrap();
    let fid = fs.open("f").unwrap();
    fs.set_end(fid, 100).unwrap();

    let mut buf = [0u8; 64];
    // Crossing the end clamps, past the end reads nothing.
    assert_eq!(fs.read_at(fid, 80, &mut buf).unwrap(), 20);
    assert_eq!(fs.read_at(fid, 100, &mut buf).unwrap(), 0);
    assert_eq!(fs.read_at(fid, 5000, &mut buf).unwrap(), 0);

    // Writes do not extend the file.
    assert_eq!(fs.write_at(fid, 100, &buf).unwrap(), 0);
    assert_eq!(fs.write_at(fid, 80, &buf).unwrap(), 20);

    // Zero-length transfers do nothing.
    assert_eq!(fs.read_at(fid, 0, &mut []).unwrap(), 0);
    assert_eq!(fs.write_at(fid, 0, &[]).unwrap(), 0);
}

#[test]
fn set_end_rejects_shrink_and_too_large() {
    let mut fs = fresh_fs();
    fs.create("f").unwrap();
    let fid = fs.open("f").unwrap();

    fs.set_end(fid, 2048).unwrap();
    assert_eq!(fs.set_end(fid, 1024).unwrap_err(), Error::Invalid);
    assert_eq!(fs.set_end(fid, MAX_FILE_SIZE + 1).unwrap_err(), Error::Invalid);
}

#[test]
fn set_end_reaches_max_file_size() {
    // A volume large enough for the full pointer tree: the data blocks plus
    // one indirect, two double-indirect and 257 second-level index blocks.
    let total = 34_000u32;
    let disk = MemDisk::new(total as usize * BLOCK_SIZE);
    let mut fs = Ktfs::format(disk, total, 8).unwrap();

    fs.create("big").unwrap();
    let fid = fs.open("big").unwrap();
    fs.set_end(fid, MAX_FILE_SIZE).unwrap();
    assert_eq!(fs.size(fid).unwrap(), MAX_FILE_SIZE);

    // The very last block is addressable.
    let tail = [0xeeu8; 16];
    assert_eq!(fs.write_at(fid, MAX_FILE_SIZE - 16, &tail).unwrap(), 16);
    let mut back = [0u8; 16];
    assert_eq!(fs.read_at(fid, MAX_FILE_SIZE - 16, &mut back).unwrap(), 16);
    assert_eq!(back, tail);
}

#[test]
fn double_indirect_blocks_round_trip() {
    let mut fs = fresh_fs();
    fs.create("f").unwrap();
    let fid = fs.open("f").unwrap();

    // Past the direct and indirect regions: (3 + 128) blocks + a bit more.
    let size = (3 + 128 + 5) * BLOCK_SIZE as u64;
    fs.set_end(fid, size).unwrap();

    let data = pattern(2 * BLOCK_SIZE);
    let pos = (3 + 128 + 1) * BLOCK_SIZE as u64;
    fs.write_at(fid, pos, &data).unwrap();

    let mut back = vec![0u8; data.len()];
    fs.read_at(fid, pos, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn open_is_exclusive() {
    let mut fs = fresh_fs();
    fs.create("a").unwrap();

    let fid = fs.open("a").unwrap();
    assert_eq!(fs.open("a").unwrap_err(), Error::Busy);

    fs.close(fid);
    fs.open("a").unwrap();
}

#[test]
fn open_table_is_bounded() {
    let mut fs = fresh_fs();

    // 96 names fill the root directory exactly.
    for i in 0..MAX_OPEN_FILES {
        fs.create(&format!("f{i}")).unwrap();
    }
    for i in 0..MAX_OPEN_FILES {
        fs.open(&format!("f{i}")).unwrap();
    }

    assert_eq!(fs.open("one-more").unwrap_err(), Error::TooManyOpen);
}

#[test]
fn root_directory_is_bounded() {
    let mut fs = fresh_fs();
    for i in 0..MAX_OPEN_FILES {
        fs.create(&format!("f{i}")).unwrap();
    }
    assert_eq!(fs.create("overflow").unwrap_err(), Error::NoSpace);
}

#[test]
fn create_errors() {
    let mut fs = fresh_fs();
    fs.create("dup").unwrap();
    assert_eq!(fs.create("dup").unwrap_err(), Error::Busy);
    assert_eq!(fs.create("").unwrap_err(), Error::Invalid);
    assert_eq!(fs.create("name-is-too-long").unwrap_err(), Error::Invalid);
    assert_eq!(fs.open("missing").unwrap_err(), Error::NotFound);
    assert_eq!(fs.delete("missing").unwrap_err(), Error::NotFound);
}

#[test]
fn delete_revokes_open_handles() {
    let mut fs = fresh_fs();
    fs.create("a").unwrap();
    let fid = fs.open("a").unwrap();

    fs.delete("a").unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(fs.read_at(fid, 0, &mut buf).unwrap_err(), Error::Invalid);
}

#[test]
fn create_then_delete_restores_the_image() {
    let mut fs = fresh_fs();
    fs.create("keep").unwrap();
    fs.flush().unwrap();
    let disk = fs.unmount().unwrap();
    let before = disk.image().to_vec();

    let mut fs = Ktfs::mount(disk).unwrap();
    fs.create("temp").unwrap();
    let fid = fs.open("temp").unwrap();
    fs.set_end(fid, 10_000).unwrap();
    fs.close(fid);
    fs.delete("temp").unwrap();
    fs.flush().unwrap();

    assert_eq!(fs.unmount().unwrap().image(), &before[..]);
}

#[test]
fn delete_frees_the_whole_pointer_tree() {
    let mut fs = fresh_fs();

    // Deep enough to need indirect and double-indirect index blocks.
    let size = (3 + 128 + 200) * BLOCK_SIZE as u64;

    fs.flush().unwrap();
    let baseline = free_bits(fs.device_mut().image());

    for _ in 0..3 {
        fs.create("cycle").unwrap();
        let fid = fs.open("cycle").unwrap();
        fs.set_end(fid, size).unwrap();
        fs.close(fid);
        fs.delete("cycle").unwrap();
    }
    fs.flush().unwrap();

    // Every data and index block went back to the bitmap.
    assert_eq!(free_bits(fs.device_mut().image()), baseline);
}

#[test]
fn sparse_blocks_read_as_zeros() {
    let mut fs = fresh_fs();
    fs.create("s").unwrap();
    let fid = fs.open("s").unwrap();
    fs.set_end(fid, 2 * BLOCK_SIZE as u64).unwrap();
    fs.write_at(fid, 0, &[0xaa; 2 * BLOCK_SIZE]).unwrap();
    fs.flush().unwrap();
    let mut image = fs.unmount().unwrap().into_image();

    // Punch a hole: clear the second direct pointer of inode 1 in the image
    // (inode region starts right after the single bitmap block).
    let inode_off = 2 * BLOCK_SIZE + 32;
    let block1 = inode_off + 12;
    image[block1..block1 + 4].fill(0);

    let mut fs = Ktfs::mount(MemDisk::from_image(image)).unwrap();
    let fid = fs.open("s").unwrap();
    let mut back = vec![0u8; 2 * BLOCK_SIZE];
    assert_eq!(fs.read_at(fid, 0, &mut back).unwrap(), 2 * BLOCK_SIZE);
    assert_eq!(&back[..BLOCK_SIZE], &[0xaa; BLOCK_SIZE][..]);
    assert_eq!(&back[BLOCK_SIZE..], &[0u8; BLOCK_SIZE][..]);
}

/// Counts clear bits in the (single) bitmap block of a raw image.
fn free_bits(image: &[u8]) -> u32 {
    image[BLOCK_SIZE..2 * BLOCK_SIZE]
        .iter()
        .map(|b| b.count_zeros())
        .sum()
}
