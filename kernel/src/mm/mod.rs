//! Memory management: boot mappings, the kernel heap, the physical page
//! pool, and per-process virtual address spaces.

pub mod heap;
pub mod pool;
pub mod space;

use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU64, Ordering};

use riscv::addr::{round_up, vpn, GIGA_SIZE, MEGA_SIZE, PAGE_SIZE};
use riscv::instructions::sfence_vma;
use riscv::mmu::{Entry, EntryFlags, Mtag, PageTable};
use riscv::registers::{Satp, Sstatus, SstatusFlags};

use crate::config::{HEAP_INIT_MIN, RAM_END, RAM_SIZE, RAM_START};

pub use pool::{alloc_phys_page, alloc_phys_pages, free_phys_page, free_phys_pages,
    free_phys_page_count, Page};
pub use space::{
    active_mspace, alloc_and_map_range, clone_active_mspace, discard_active_mspace,
    handle_umode_page_fault, map_page, map_range, reset_active_mspace, set_range_flags,
    switch_mspace, unmap_and_free_range, validate_vptr, validate_vstr,
};

// Linker-provided kernel image layout (qemu-virt.ld).
extern "C" {
    static _kimg_start: u8;
    static _kimg_text_start: u8;
    static _kimg_text_end: u8;
    static _kimg_rodata_start: u8;
    static _kimg_rodata_end: u8;
    static _kimg_data_start: u8;
    static _kimg_end: u8;
}

// The boot page tables: one root, and one level-1/level-0 pair for the first
// gigarange and megarange of RAM, which hold the kernel image.
static mut MAIN_PT2: PageTable = PageTable::new();
static mut MAIN_PT1_RAM: PageTable = PageTable::new();
static mut MAIN_PT0_RAM: PageTable = PageTable::new();

static MAIN_MTAG: AtomicU64 = AtomicU64::new(0);

/// Returns the tag of the main (kernel-only) memory space.
pub fn main_mtag() -> Mtag {
    Mtag::from_raw(MAIN_MTAG.load(Ordering::Relaxed))
}

fn sym_addr(sym: &u8) -> usize {
    sym as *const u8 as usize
}

/// Builds the boot mappings, enables paging, and seeds the heap and the
/// physical page pool with the RAM above the kernel image.
///
/// The direct mapping installed here:
///
/// ```text
///         0 to RAM_START:           RW gigapages (MMIO region)
/// RAM_START to _kimg_end:           RX/R/RW pages based on kernel image
/// _kimg_end to RAM_START+MEGA_SIZE: RW pages (heap and free page pool)
/// RAM_START+MEGA_SIZE to RAM_END:   RW megapages (free page pool)
/// ```
///
/// Everything is global: kernel mappings are shared by reference into every
/// process space.
pub fn memory_init() {
    // SAFETY: populated by the linker script.
    let (kimg_start, text_start, text_end, rodata_start, rodata_end, data_start, kimg_end) = unsafe {
        (
            sym_addr(&_kimg_start),
            sym_addr(&_kimg_text_start),
            sym_addr(&_kimg_text_end),
            sym_addr(&_kimg_rodata_start),
            sym_addr(&_kimg_rodata_end),
            sym_addr(&_kimg_data_start),
            sym_addr(&_kimg_end),
        )
    };

    assert!(kimg_start == RAM_START);
    // Kernel must fit inside a 2MB megapage (one level 1 PTE)
    assert!(kimg_end - kimg_start <= MEGA_SIZE);

    kprintln!(
        "           RAM: [{:#x},{:#x}): {} MB",
        RAM_START,
        RAM_END,
        RAM_SIZE / 1024 / 1024
    );
    kprintln!("  Kernel image: [{:#x},{:#x})", kimg_start, kimg_end);

    // SAFETY: single-threaded at boot; these statics are not yet shared.
    let (pt2, pt1, pt0) = unsafe {
        (
            &mut *addr_of_mut!(MAIN_PT2),
            &mut *addr_of_mut!(MAIN_PT1_RAM),
            &mut *addr_of_mut!(MAIN_PT0_RAM),
        )
    };

    let global_rw = EntryFlags::RW | EntryFlags::GLOBAL;

    // Identity mapping of the MMIO region as gigapages.
    for pma in (0..RAM_START).step_by(GIGA_SIZE) {
        pt2[vpn(pma, 2)] = Entry::leaf(pma, global_rw);
    }

    // The gigarange holding RAM gets a second-level subtable, and the first
    // megarange of RAM a third level with per-page kernel image permissions.
    pt2[vpn(RAM_START, 2)] = Entry::table(pt1 as *const PageTable as usize, EntryFlags::GLOBAL);
    pt1[vpn(RAM_START, 1)] = Entry::table(pt0 as *const PageTable as usize, EntryFlags::GLOBAL);

    for pp in (text_start..text_end).step_by(PAGE_SIZE) {
        pt0[vpn(pp, 0)] = Entry::leaf(pp, EntryFlags::RX | EntryFlags::GLOBAL);
    }
    for pp in (rodata_start..rodata_end).step_by(PAGE_SIZE) {
        pt0[vpn(pp, 0)] = Entry::leaf(pp, EntryFlags::READ | EntryFlags::GLOBAL);
    }
    for pp in (data_start..RAM_START + MEGA_SIZE).step_by(PAGE_SIZE) {
        pt0[vpn(pp, 0)] = Entry::leaf(pp, global_rw);
    }

    // Remaining RAM mapped in 2MB megapages.
    for pp in (RAM_START + MEGA_SIZE..RAM_END).step_by(MEGA_SIZE) {
        pt1[vpn(pp, 1)] = Entry::leaf(pp, global_rw);
    }

    // Enable paging; this part always makes me nervous.
    let mtag = Mtag::new(pt2 as *const PageTable as usize, 0);
    MAIN_MTAG.store(mtag.raw(), Ordering::Relaxed);
    // SAFETY: the tables above identity-map the executing kernel.
    unsafe { Satp::write(mtag) };
    sfence_vma();

    // Give the memory between the end of the kernel image and the next page
    // boundary to the heap, topped up to at least HEAP_INIT_MIN bytes.
    let heap_start = kimg_end;
    let mut heap_end = round_up(heap_start, PAGE_SIZE);
    if heap_end - heap_start < HEAP_INIT_MIN {
        heap_end += round_up(HEAP_INIT_MIN - (heap_end - heap_start), PAGE_SIZE);
    }
    assert!(heap_end <= RAM_END, "out of memory");

    // SAFETY: the region is mapped RW and owned by nobody else.
    unsafe { heap::init(heap_start, heap_end) };
    kprintln!(
        "Heap allocator: [{:#x},{:#x}): {} KB free",
        heap_start,
        heap_end,
        (heap_end - heap_start) / 1024
    );

    // The rest of RAM seeds the physical page pool.
    // SAFETY: the region is mapped RW and owned by nobody else.
    unsafe { pool::init(heap_end, RAM_END) };
    kprintln!(
        "     Page pool: [{:#x},{:#x}): {} pages free",
        heap_end,
        RAM_END,
        free_phys_page_count()
    );

    // Allow supervisor access to user memory. We could be more precise by
    // only enabling this around explicit user-memory accesses, which would
    // catch stray kernel dereferences of user pointers.
    Sstatus::set(SstatusFlags::SUM);
}
