//! Abstractions for Sv39 page tables and the SATP address-space tag.

use core::fmt;
use core::slice::{Iter, IterMut};

use bitflags::bitflags;

use crate::addr::{page_addr, page_num, PTE_CNT};

const PTE_PPN_OFFSET: u64 = 10;
const PTE_PPN_MASK: u64 = 0xfff_ffff_ffff;

const SATP_PPN_MASK: u64 = 0xfff_ffff_ffff;
const SATP_ASID_SHIFT: u64 = 44;
const SATP_MODE_SHIFT: u64 = 60;
const SATP_MODE_SV39: u64 = 8;

bitflags! {
    /// Bitfields of a page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        /// If set, this entry represents a valid mapping.
        const VALID = 1 << 0;
        /// If set, this page contains readable memory.
        const READ = 1 << 1;
        /// If set, this page contains writable memory.
        const WRITE = 1 << 2;
        /// If set, this page contains executable memory.
        const EXEC = 1 << 3;
        /// If set, this page can be accessed in U-mode.
        const USER = 1 << 4;
        /// If set, this mapping is present in all address spaces.
        const GLOBAL = 1 << 5;
        /// If set, this page has been accessed by the CPU.
        const ACCESS = 1 << 6;
        /// If set, this page has been written by the CPU.
        const DIRTY = 1 << 7;

        /// If set, this page contains read-write memory.
        const RW = Self::READ.bits() | Self::WRITE.bits();
        /// If set, this page contains read-exec memory.
        const RX = Self::READ.bits() | Self::EXEC.bits();
        /// Mask of the flags a caller may request on a mapping.
        const RWXUG = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits()
            | Self::USER.bits() | Self::GLOBAL.bits();
    }
}

/// An entry in a `PageTable`.
///
/// An entry is either invalid, a leaf (any of R/W/X set), or a pointer to a
/// next-level table (valid with none of R/W/X set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u64);

impl Entry {
    /// Creates a new empty, non-valid entry.
    pub const fn invalid() -> Entry {
        Entry(0)
    }

    /// Creates a leaf entry mapping the page at `pp` with the given flags.
    ///
    /// A, D and V are always set on leaves so that the MMU never faults to
    /// record an access.
    pub fn leaf(pp: usize, flags: EntryFlags) -> Entry {
        let flags = flags | EntryFlags::ACCESS | EntryFlags::DIRTY | EntryFlags::VALID;
        Entry(((page_num(pp) as u64) << PTE_PPN_OFFSET) | flags.bits())
    }

    /// Creates an interior entry pointing to the next-level table at `pt`.
    pub fn table(pt: usize, flags: EntryFlags) -> Entry {
        let flags = flags | EntryFlags::VALID;
        Entry(((page_num(pt) as u64) << PTE_PPN_OFFSET) | flags.bits())
    }

    /// Returns whether this entry is valid for use in translation.
    pub fn is_valid(self) -> bool {
        self.flags().contains(EntryFlags::VALID)
    }

    /// Returns whether this entry is a leaf rather than a table pointer.
    pub fn is_leaf(self) -> bool {
        self.flags()
            .intersects(EntryFlags::READ | EntryFlags::WRITE | EntryFlags::EXEC)
    }

    /// Returns whether the mapping in this entry is global.
    pub fn is_global(self) -> bool {
        self.flags().contains(EntryFlags::GLOBAL)
    }

    /// Returns the flags set on this entry.
    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// Rewrites the flag bits of this entry, preserving the PPN.
    pub fn set_flags(&mut self, flags: EntryFlags) {
        self.0 = (self.0 & (PTE_PPN_MASK << PTE_PPN_OFFSET)) | flags.bits();
    }

    /// Returns the physical address of the page or table this entry points to.
    pub fn page(self) -> usize {
        page_addr(((self.0 >> PTE_PPN_OFFSET) & PTE_PPN_MASK) as usize)
    }

    /// Resets this entry to the invalid state.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fl = self.flags();
        let bit = |b, c| if fl.contains(b) { c } else { ' ' };
        write!(f, "phy: {:#016x} ", self.page())?;
        write!(
            f,
            "{}{}{}{}{}",
            bit(EntryFlags::READ, 'R'),
            bit(EntryFlags::WRITE, 'W'),
            bit(EntryFlags::EXEC, 'X'),
            bit(EntryFlags::USER, 'U'),
            bit(EntryFlags::GLOBAL, 'G'),
        )
    }
}

/// A page table of any of the three Sv39 levels.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Entry; PTE_CNT],
}

impl PageTable {
    /// Creates a new page table with cleared entries.
    pub const fn new() -> Self {
        Self {
            entries: [Entry::invalid(); PTE_CNT],
        }
    }

    /// Resets all the entries of this page table to zero.
    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }

    /// Returns an iterator over the entries in this page table.
    pub fn iter(&self) -> Iter<'_, Entry> {
        self.entries.iter()
    }

    /// Returns a mutable iterator over the entries in this page table.
    pub fn iter_mut(&mut self) -> IterMut<'_, Entry> {
        self.entries.iter_mut()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = Entry;

    fn index(&self, i: usize) -> &Entry {
        &self.entries[i]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, i: usize) -> &mut Entry {
        &mut self.entries[i]
    }
}

/// An address-space tag: the value of the SATP register, encoding the paging
/// mode, the ASID, and the physical page number of the root table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Mtag(u64);

impl Mtag {
    /// The all-zero tag, denoting bare (disabled) translation.
    pub const fn bare() -> Mtag {
        Mtag(0)
    }

    /// Builds an Sv39 tag for the root table at physical address `root`.
    pub fn new(root: usize, asid: u16) -> Mtag {
        Mtag(
            (SATP_MODE_SV39 << SATP_MODE_SHIFT)
                | ((asid as u64) << SATP_ASID_SHIFT)
                | page_num(root) as u64,
        )
    }

    /// Reconstructs a tag from a raw SATP value.
    pub const fn from_raw(raw: u64) -> Mtag {
        Mtag(raw)
    }

    /// Returns the raw SATP value of this tag.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the physical address of the root page table.
    pub fn root(self) -> usize {
        page_addr((self.0 & SATP_PPN_MASK) as usize)
    }

    /// Returns the address-space identifier.
    pub fn asid(self) -> u16 {
        ((self.0 >> SATP_ASID_SHIFT) & 0xffff) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_entry_packing() {
        let e = Entry::leaf(0x8020_3000, EntryFlags::RW | EntryFlags::GLOBAL);
        assert!(e.is_valid());
        assert!(e.is_leaf());
        assert!(e.is_global());
        assert_eq!(e.page(), 0x8020_3000);
        assert!(e
            .flags()
            .contains(EntryFlags::ACCESS | EntryFlags::DIRTY | EntryFlags::VALID));
    }

    #[test]
    fn table_entry_is_not_leaf() {
        let e = Entry::table(0x8040_0000, EntryFlags::empty());
        assert!(e.is_valid());
        assert!(!e.is_leaf());
        assert_eq!(e.page(), 0x8040_0000);
    }

    #[test]
    fn set_flags_preserves_ppn() {
        let mut e = Entry::leaf(0x8000_1000, EntryFlags::READ);
        e.set_flags(
            EntryFlags::RW
                | EntryFlags::USER
                | EntryFlags::ACCESS
                | EntryFlags::DIRTY
                | EntryFlags::VALID,
        );
        assert_eq!(e.page(), 0x8000_1000);
        assert!(e.flags().contains(EntryFlags::USER));
    }

    #[test]
    fn mtag_round_trip() {
        let tag = Mtag::new(0x8100_0000, 7);
        assert_eq!(tag.root(), 0x8100_0000);
        assert_eq!(tag.asid(), 7);
        assert_eq!(Mtag::from_raw(tag.raw()), tag);
    }
}
