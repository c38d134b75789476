//! The kernel heap allocator.

use buddy_system_allocator::LockedHeap;

#[global_allocator]
static HEAP: LockedHeap<32> = LockedHeap::empty();

/// Hands the region `[start, end)` to the heap allocator.
///
/// # Safety
///
/// The region must be unused, writable RAM and must only be added once.
pub unsafe fn init(start: usize, end: usize) {
    // SAFETY: forwarded to the caller.
    unsafe { HEAP.lock().init(start, end - start) };
}
