//! ELF executable loader.
//!
//! Loads 64-bit little-endian RISC-V `ET_EXEC` images into the active
//! address space. Only `PT_LOAD` segments are honored; each must lie inside
//! the user memory window. Segments are mapped R/W/U for loading, then the
//! flags are tightened according to the segment's own permission bits.

use bitflags::bitflags;
use riscv::addr::{page_aligned, round_up, PAGE_SIZE};
use riscv::mmu::EntryFlags;

use crate::io::Io;
use crate::mm::{alloc_and_map_range, set_range_flags};
use crate::{Error, Result};

// e_ident indices and expected values.
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;
const PT_LOAD: u32 = 1;

bitflags! {
    /// Program header permission bits.
    struct SegmentFlags: u32 {
        const X = 0x1;
        const W = 0x2;
        const R = 0x4;
    }
}

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

/// Every loadable address must fall inside this window.
const LOAD_LOWER_BOUND: u64 = 0xC000_0000;
const LOAD_UPPER_BOUND: u64 = 0x1_0000_0000;

fn get_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn get_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn get_u64(b: &[u8], off: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(v)
}

fn read_exact(io: &dyn Io, pos: u64, buf: &mut [u8]) -> Result<()> {
    match io.read_at(pos, buf) {
        Ok(n) if n == buf.len() => Ok(()),
        Ok(_) => Err(Error::Io),
        Err(e) => Err(e),
    }
}

/// Loads the executable on `io` into the active space and returns its entry
/// point.
pub fn elf_load(io: &dyn Io) -> Result<usize> {
    let mut ehdr = [0u8; EHDR_SIZE];
    read_exact(io, 0, &mut ehdr)?;

    if &ehdr[..4] != b"\x7fELF" {
        return Err(Error::Invalid);
    }
    if ehdr[EI_CLASS] != ELFCLASS64
        || ehdr[EI_DATA] != ELFDATA2LSB
        || ehdr[EI_VERSION] != EV_CURRENT
    {
        return Err(Error::BadFormat);
    }
    if get_u16(&ehdr, 16) != ET_EXEC || get_u16(&ehdr, 18) != EM_RISCV {
        return Err(Error::BadFormat);
    }
    if get_u32(&ehdr, 20) != EV_CURRENT as u32 {
        return Err(Error::BadFormat);
    }

    let entry = get_u64(&ehdr, 24);
    let phoff = get_u64(&ehdr, 32);
    let phentsize = get_u16(&ehdr, 54) as u64;
    let phnum = get_u16(&ehdr, 56);

    if (phentsize as usize) < PHDR_SIZE {
        return Err(Error::BadFormat);
    }

    for i in 0..phnum {
        let mut phdr = [0u8; PHDR_SIZE];
        read_exact(io, phoff + i as u64 * phentsize, &mut phdr)?;

        let p_type = get_u32(&phdr, 0);
        if p_type != PT_LOAD {
            continue;
        }

        let p_flags = get_u32(&phdr, 4);
        let p_offset = get_u64(&phdr, 8);
        let p_vaddr = get_u64(&phdr, 16);
        let p_filesz = get_u64(&phdr, 32);
        let p_memsz = get_u64(&phdr, 40);

        if p_vaddr < LOAD_LOWER_BOUND || p_vaddr.checked_add(p_memsz).is_none()
            || p_vaddr + p_memsz > LOAD_UPPER_BOUND
            || p_filesz > p_memsz
        {
            return Err(Error::BadFormat);
        }
        if !page_aligned(p_vaddr as usize) {
            return Err(Error::BadFormat);
        }

        // Map writable for loading; the real permissions land below.
        let map_size = round_up(p_memsz as usize, PAGE_SIZE);
        let load_flags = EntryFlags::RW | EntryFlags::USER;
        alloc_and_map_range(p_vaddr as usize, map_size, load_flags)?;

        // SAFETY: the segment range was just mapped R/W for the kernel
        // (SUM is enabled) and nothing else points into it yet.
        let seg =
            unsafe { core::slice::from_raw_parts_mut(p_vaddr as *mut u8, p_memsz as usize) };
        read_exact(io, p_offset, &mut seg[..p_filesz as usize])?;
        seg[p_filesz as usize..].fill(0);

        let mut flags = load_flags;
        if SegmentFlags::from_bits_truncate(p_flags).contains(SegmentFlags::X) {
            flags |= EntryFlags::EXEC;
        }
        set_range_flags(p_vaddr as usize, map_size, flags);
    }

    Ok(entry as usize)
}
