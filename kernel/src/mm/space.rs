//! Virtual address spaces.
//!
//! All operations act on the _active_ space, identified by the SATP tag.
//! Kernel mappings are global and shared by reference between spaces; user
//! mappings are per-space. The kernel runs identity-mapped, so a physical
//! page number can be dereferenced directly while walking tables.

use riscv::addr::{page_aligned, round_down, vpn, wellformed, PAGE_SIZE, PTE_CNT};
use riscv::instructions::sfence_vma;
use riscv::mmu::{Entry, EntryFlags, Mtag, PageTable};
use riscv::registers::Satp;

use crate::config::{UMEM_END_VMA, UMEM_START_VMA};
use crate::mm::{alloc_phys_page, free_phys_page, main_mtag};
use crate::{Error, Result};

/// Bound on the length of a user-supplied string.
const VSTR_MAX: usize = 8192;

fn table_at(pa: usize) -> &'static mut PageTable {
    // SAFETY: RAM is identity-mapped; table pages are exclusively owned by
    // the address space that references them.
    unsafe { &mut *(pa as *mut PageTable) }
}

fn table_pa(pt: &PageTable) -> usize {
    pt as *const PageTable as usize
}

fn active_ptab() -> &'static mut PageTable {
    table_at(Satp::read().root())
}

fn alloc_table() -> Result<&'static mut PageTable> {
    let page = alloc_phys_page()?;
    let table = table_at(page.as_ptr() as usize);
    table.clear();
    Ok(table)
}

/// Returns the tag of the active memory space.
pub fn active_mspace() -> Mtag {
    Satp::read()
}

/// Switches to the memory space identified by `mtag`, returning the
/// previously active tag.
pub fn switch_mspace(mtag: Mtag) -> Mtag {
    // SAFETY: tags are only ever built from well-formed root tables that
    // carry the global kernel mappings.
    let prev = unsafe { Satp::swap(mtag) };
    sfence_vma();
    prev
}

/// Walks the active table to the leaf entry for `vma`, optionally creating
/// the intermediate tables.
fn walk(vma: usize, create: bool) -> Result<&'static mut Entry> {
    let pt2 = active_ptab();

    let pte2 = &mut pt2[vpn(vma, 2)];
    let pt1 = if pte2.is_valid() {
        table_at(pte2.page())
    } else if create {
        let pt = alloc_table()?;
        *pte2 = Entry::table(table_pa(pt), EntryFlags::empty());
        pt
    } else {
        return Err(Error::Invalid);
    };

    let pte1 = &mut pt1[vpn(vma, 1)];
    let pt0 = if pte1.is_valid() {
        table_at(pte1.page())
    } else if create {
        let pt = alloc_table()?;
        *pte1 = Entry::table(table_pa(pt), EntryFlags::empty());
        pt
    } else {
        return Err(Error::Invalid);
    };

    Ok(&mut pt0[vpn(vma, 0)])
}

/// Maps the physical page at `pp` into the active space at `vma`.
///
/// Refuses to overwrite an existing mapping.
pub fn map_page(vma: usize, pp: *mut u8, rwxug_flags: EntryFlags) -> Result<()> {
    if !wellformed(vma) || !page_aligned(vma) || pp.is_null() {
        return Err(Error::Invalid);
    }

    let leaf = walk(vma, true)?;
    if leaf.is_valid() {
        return Err(Error::Invalid);
    }
    *leaf = Entry::leaf(pp as usize, rwxug_flags & EntryFlags::RWXUG);
    Ok(())
}

/// Maps `size` bytes of contiguous physical memory starting at `pp` into the
/// active space at `vma`.
///
/// On partial failure the pages already placed are unmapped and freed.
pub fn map_range(vma: usize, size: usize, pp: *mut u8, rwxug_flags: EntryFlags) -> Result<()> {
    if !wellformed(vma) || !page_aligned(vma) || pp.is_null() || size == 0 || size % PAGE_SIZE != 0
    {
        return Err(Error::Invalid);
    }

    for i in 0..size / PAGE_SIZE {
        let pa = (pp as usize + i * PAGE_SIZE) as *mut u8;
        if let Err(e) = map_page(vma + i * PAGE_SIZE, pa, rwxug_flags) {
            free_phys_page(pa);
            unmap_and_free_range(vma, i * PAGE_SIZE);
            return Err(e);
        }
    }
    Ok(())
}

/// Allocates fresh physical pages and maps them at `[vma, vma+size)`.
pub fn alloc_and_map_range(vma: usize, size: usize, rwxug_flags: EntryFlags) -> Result<()> {
    if !wellformed(vma) || !page_aligned(vma) || size == 0 || size % PAGE_SIZE != 0 {
        return Err(Error::Invalid);
    }

    for i in 0..size / PAGE_SIZE {
        let pa = match alloc_phys_page() {
            Ok(p) => p.as_ptr(),
            Err(e) => {
                unmap_and_free_range(vma, i * PAGE_SIZE);
                return Err(e);
            }
        };
        if let Err(e) = map_page(vma + i * PAGE_SIZE, pa, rwxug_flags) {
            free_phys_page(pa);
            unmap_and_free_range(vma, i * PAGE_SIZE);
            return Err(e);
        }
    }
    Ok(())
}

/// Rewrites the flags of every valid leaf in `[vp, vp+size)`.
///
/// Only leaf entries are touched; A, D and V are always kept set.
pub fn set_range_flags(vp: usize, size: usize, rwxug_flags: EntryFlags) {
    if !wellformed(vp) || !page_aligned(vp) || size == 0 || size % PAGE_SIZE != 0 {
        return;
    }

    let flags = (rwxug_flags & EntryFlags::RWXUG)
        | EntryFlags::ACCESS
        | EntryFlags::DIRTY
        | EntryFlags::VALID;

    for i in 0..size / PAGE_SIZE {
        if let Ok(leaf) = walk(vp + i * PAGE_SIZE, false) {
            if leaf.is_valid() && leaf.is_leaf() {
                leaf.set_flags(flags);
            }
        }
    }
    sfence_vma();
}

/// Unmaps `[vp, vp+size)` from the active space, freeing the backing pages.
///
/// Only valid, non-global leaves are affected; everything else is left
/// alone. The TLB is fenced before returning so stale user translations
/// cannot survive into user mode.
pub fn unmap_and_free_range(vp: usize, size: usize) {
    if !wellformed(vp) || !page_aligned(vp) || size == 0 || size % PAGE_SIZE != 0 {
        return;
    }

    for i in 0..size / PAGE_SIZE {
        if let Ok(leaf) = walk(vp + i * PAGE_SIZE, false) {
            if leaf.is_valid() && leaf.is_leaf() && !leaf.is_global() {
                free_phys_page(leaf.page() as *mut u8);
                leaf.clear();
            }
        }
    }
    sfence_vma();
}

/// Clones the active space.
///
/// Global entries and superpage leaves are shared by reference; non-global
/// 4 KiB user pages are materialized by copying. Panics on allocation
/// failure partway through, since the half-built space cannot be unwound.
pub fn clone_active_mspace() -> Mtag {
    let oom = || -> ! { panic!("clone_active_mspace: out of memory") };

    let old_pt2 = active_ptab();
    let new_pt2 = alloc_table().unwrap_or_else(|_| oom());

    for i2 in 0..PTE_CNT {
        let pte2 = old_pt2[i2];
        if !pte2.is_valid() {
            continue;
        }
        // Share gigapages and the global kernel subtree as-is.
        if pte2.is_leaf() || pte2.is_global() {
            new_pt2[i2] = pte2;
            continue;
        }

        let old_pt1 = table_at(pte2.page());
        let new_pt1 = alloc_table().unwrap_or_else(|_| oom());
        new_pt2[i2] = Entry::table(table_pa(new_pt1), EntryFlags::empty());

        for i1 in 0..PTE_CNT {
            let pte1 = old_pt1[i1];
            if !pte1.is_valid() {
                continue;
            }
            if pte1.is_leaf() || pte1.is_global() {
                new_pt1[i1] = pte1;
                continue;
            }

            let old_pt0 = table_at(pte1.page());
            let new_pt0 = alloc_table().unwrap_or_else(|_| oom());
            new_pt1[i1] = Entry::table(table_pa(new_pt0), EntryFlags::empty());

            for i0 in 0..PTE_CNT {
                let pte0 = old_pt0[i0];
                if !pte0.is_valid() {
                    continue;
                }
                if pte0.is_global() {
                    new_pt0[i0] = pte0;
                } else {
                    let new_page = alloc_phys_page().unwrap_or_else(|_| oom());
                    // SAFETY: both pages are identity-mapped and page-sized.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            pte0.page() as *const u8,
                            new_page.as_ptr(),
                            PAGE_SIZE,
                        );
                    }
                    new_pt0[i0] = Entry::leaf(new_page.as_ptr() as usize, pte0.flags());
                }
            }
        }
    }

    Mtag::new(table_pa(new_pt2), 0)
}

/// Frees every non-global leaf page of the active space and clears its
/// entries, leaving the table structure in place for reuse.
pub fn reset_active_mspace() {
    let pt2 = active_ptab();
    for i2 in 0..PTE_CNT {
        let pte2 = pt2[i2];
        if !pte2.is_valid() || pte2.is_leaf() {
            continue;
        }
        let pt1 = table_at(pte2.page());
        for i1 in 0..PTE_CNT {
            let pte1 = pt1[i1];
            if !pte1.is_valid() || pte1.is_leaf() {
                continue;
            }
            let pt0 = table_at(pte1.page());
            for i0 in 0..PTE_CNT {
                let pte0 = pt0[i0];
                if pte0.is_valid() && pte0.is_leaf() && !pte0.is_global() {
                    free_phys_page(pte0.page() as *mut u8);
                    pt0[i0].clear();
                }
            }
        }
    }
    sfence_vma();
}

/// Tears down the active space: frees its user pages and private tables,
/// switches to the main space, and returns the main tag.
pub fn discard_active_mspace() -> Mtag {
    reset_active_mspace();

    let discarded = switch_mspace(main_mtag());

    // The cloned space's private (non-global) tables are no longer
    // reachable from any SATP value; release them.
    if discarded.root() != main_mtag().root() {
        let pt2 = table_at(discarded.root());
        for i2 in 0..PTE_CNT {
            let pte2 = pt2[i2];
            if !pte2.is_valid() || pte2.is_leaf() || pte2.is_global() {
                continue;
            }
            let pt1 = table_at(pte2.page());
            for i1 in 0..PTE_CNT {
                let pte1 = pt1[i1];
                if pte1.is_valid() && !pte1.is_leaf() && !pte1.is_global() {
                    free_phys_page(pte1.page() as *mut u8);
                }
            }
            free_phys_page(pte2.page() as *mut u8);
        }
        free_phys_page(discarded.root() as *mut u8);
    }

    main_mtag()
}

/// Lazily backs a faulting user page with fresh memory.
///
/// Returns whether the fault was handled: only page-aligned addresses
/// inside the user window are eligible.
pub fn handle_umode_page_fault(vma: usize) -> bool {
    if !wellformed(vma)
        || !page_aligned(vma)
        || vma < UMEM_START_VMA
        || vma >= UMEM_END_VMA
    {
        return false;
    }

    let pp = match alloc_phys_page() {
        Ok(p) => p.as_ptr(),
        Err(_) => return false,
    };
    if map_page(vma, pp, EntryFlags::RW | EntryFlags::USER).is_err() {
        free_phys_page(pp);
        return false;
    }
    true
}

/// Checks that every page of `[vp, vp+len)` is mapped with at least
/// `rwxug_flags` in the active space.
///
/// Returns `NoAccess` when a page is mapped with insufficient flags and
/// `Invalid` for unmapped or malformed ranges.
pub fn validate_vptr(vp: usize, len: usize, rwxug_flags: EntryFlags) -> Result<()> {
    if vp == 0 || len == 0 {
        return Err(Error::Invalid);
    }
    let end = vp.checked_add(len).ok_or(Error::Invalid)?;
    if !wellformed(vp) || !wellformed(end - 1) {
        return Err(Error::Invalid);
    }

    let mut va = vp;
    while va < end {
        let leaf = walk(va, false).map_err(|_| Error::Invalid)?;
        if !leaf.is_valid() || !leaf.is_leaf() {
            return Err(Error::Invalid);
        }
        if !leaf.flags().contains(rwxug_flags) {
            return Err(Error::NoAccess);
        }
        va = (round_down(va, PAGE_SIZE) + PAGE_SIZE).min(end);
    }
    Ok(())
}

/// Checks that `vp` points at a NUL-terminated string readable with
/// `rwxug_flags`, bounded at `VSTR_MAX` bytes.
pub fn validate_vstr(vp: usize, rwxug_flags: EntryFlags) -> Result<()> {
    if vp == 0 || !wellformed(vp) {
        return Err(Error::Invalid);
    }

    for i in 0..VSTR_MAX {
        validate_vptr(vp + i, 1, rwxug_flags).map_err(|_| Error::NoAccess)?;
        // SAFETY: the byte was just validated as mapped and readable.
        let b = unsafe { *((vp + i) as *const u8) };
        if b == 0 {
            return Ok(());
        }
    }
    Err(Error::Invalid)
}
