//! The physical page pool.
//!
//! Free pages are kept in a linked list of _chunks_, where each chunk is a
//! run of consecutive pages described by a header stored in its first page.
//! Initially all free pages form a single large chunk; allocation breaks up
//! the smallest chunk that satisfies the request (best fit). Freeing
//! prepends a new chunk in O(1) and performs no coalescing, so long-run
//! fragmentation is bounded only by the number of chunks.
//!
//! The header of an allocated chunk is overwritten by caller content;
//! freeing rebuilds it, so callers must return the original base pointer and
//! page count.

use core::ptr::{self, NonNull};

use riscv::addr::PAGE_SIZE;
use spin::Mutex;

use crate::{Error, Result};

struct PageChunk {
    next: *mut PageChunk,
    pagecnt: usize,
}

struct Pool {
    head: *mut PageChunk,
}

// SAFETY: the chunk pointers reference pool-owned physical pages and every
// access happens under the mutex.
unsafe impl Send for Pool {}

static POOL: Mutex<Pool> = Mutex::new(Pool {
    head: ptr::null_mut(),
});

/// Hands the page-aligned region `[start, end)` to the pool.
///
/// # Safety
///
/// The region must be unused RAM, identity-mapped and writable, and must not
/// be handed to the pool twice.
pub unsafe fn init(start: usize, end: usize) {
    debug_assert!(start % PAGE_SIZE == 0 && end % PAGE_SIZE == 0);

    let chunk = start as *mut PageChunk;
    // SAFETY: per the caller contract, the first page of the region is ours.
    unsafe {
        (*chunk).next = ptr::null_mut();
        (*chunk).pagecnt = (end - start) / PAGE_SIZE;
    }
    POOL.lock().head = chunk;
}

/// Allocates a run of `cnt` contiguous physical pages.
pub fn alloc_phys_pages(cnt: usize) -> Result<NonNull<u8>> {
    if cnt == 0 {
        return Err(Error::Invalid);
    }

    let mut pool = POOL.lock();

    // Find the smallest chunk that satisfies the request. `best` links to
    // the pointer that refers to the best chunk so it can be unlinked.
    let mut best: *mut *mut PageChunk = ptr::null_mut();
    let mut link: *mut *mut PageChunk = &mut pool.head as *mut *mut PageChunk;
    // SAFETY: the list is well formed; every node lives in a pool-owned page.
    unsafe {
        while !(*link).is_null() {
            let chunk = *link;
            if (*chunk).pagecnt >= cnt
                && (best.is_null() || (*chunk).pagecnt < (**best).pagecnt)
            {
                best = link;
            }
            link = &mut (*chunk).next;
        }

        if best.is_null() {
            return Err(Error::OutOfMemory);
        }

        let chunk = *best;
        if (*chunk).pagecnt == cnt {
            *best = (*chunk).next;
        } else {
            // Return the leading pages; relink the remainder in place.
            let rest = (chunk as usize + cnt * PAGE_SIZE) as *mut PageChunk;
            (*rest).next = (*chunk).next;
            (*rest).pagecnt = (*chunk).pagecnt - cnt;
            *best = rest;
        }

        Ok(NonNull::new_unchecked(chunk as *mut u8))
    }
}

/// Returns a run of pages obtained from [`alloc_phys_pages`] to the pool.
pub fn free_phys_pages(pp: *mut u8, cnt: usize) {
    if pp.is_null() || cnt == 0 {
        return;
    }

    let mut pool = POOL.lock();
    let chunk = pp as *mut PageChunk;
    // SAFETY: the caller returns a region previously allocated from the pool.
    unsafe {
        (*chunk).next = pool.head;
        (*chunk).pagecnt = cnt;
    }
    pool.head = chunk;
}

/// Allocates a single physical page.
pub fn alloc_phys_page() -> Result<NonNull<u8>> {
    alloc_phys_pages(1)
}

/// Frees a single physical page.
pub fn free_phys_page(pp: *mut u8) {
    free_phys_pages(pp, 1);
}

/// Counts the free pages by walking the chunk list.
pub fn free_phys_page_count() -> usize {
    let pool = POOL.lock();
    let mut cnt = 0;
    let mut cur = pool.head;
    // SAFETY: the list is well formed.
    unsafe {
        while !cur.is_null() {
            cnt += (*cur).pagecnt;
            cur = (*cur).next;
        }
    }
    cnt
}

/// An owned, zeroed physical page.
///
/// Used for kernel stacks and pipe buffers; the page returns to the pool on
/// drop. Pages that are handed over to an address space must be released
/// with [`Page::into_raw`] instead.
pub struct Page {
    ptr: NonNull<u8>,
}

// SAFETY: a Page is exclusively owned memory.
unsafe impl Send for Page {}

impl Page {
    /// Allocates one pool page and zeroes it.
    pub fn new() -> Result<Page> {
        let ptr = alloc_phys_page()?;
        // SAFETY: the page was just allocated and is identity-mapped.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, PAGE_SIZE) };
        Ok(Page { ptr })
    }

    /// Returns the physical (= virtual) address of the page.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Returns a raw pointer to the page contents.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the page contents as a byte slice.
    pub fn as_slice(&self) -> &[u8; PAGE_SIZE] {
        // SAFETY: the page is owned and PAGE_SIZE bytes long.
        unsafe { &*(self.ptr.as_ptr() as *const [u8; PAGE_SIZE]) }
    }

    /// Returns the page contents as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8; PAGE_SIZE] {
        // SAFETY: the page is owned and PAGE_SIZE bytes long.
        unsafe { &mut *(self.ptr.as_ptr() as *mut [u8; PAGE_SIZE]) }
    }

    /// Transfers ownership of the page out of the wrapper.
    pub fn into_raw(self) -> *mut u8 {
        let ptr = self.ptr.as_ptr();
        core::mem::forget(self);
        ptr
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        free_phys_page(self.ptr.as_ptr());
    }
}
