//! Compile-time configuration for the QEMU `virt` machine.

#![allow(missing_docs)]

/// First byte of RAM; the kernel image is linked here.
pub const RAM_START: usize = 0x8000_0000;

/// Size of physical memory.
pub const RAM_SIZE: usize = 128 * 1024 * 1024;

/// One past the last byte of RAM.
pub const RAM_END: usize = RAM_START + RAM_SIZE;

/// Minimum size of the kernel heap carved out after the kernel image.
pub const HEAP_INIT_MIN: usize = 2 * 1024 * 1024;

/// First virtual address usable by user processes.
pub const UMEM_START_VMA: usize = 0xC000_0000;

/// One past the last user virtual address; the user stack page sits below.
pub const UMEM_END_VMA: usize = 0x1_0000_0000;

/// Maximum number of threads, including the main and idle threads.
pub const NTHR: usize = 16;

/// Maximum number of processes.
pub const NPROC: usize = 16;

/// Size of each process's file descriptor table.
pub const PROCESS_IOMAX: usize = 16;

/// Frequency of the `time` counter in Hz.
pub const TIMER_FREQ: u64 = 10_000_000;

/// Period of the preemption interrupter thread, in milliseconds.
pub const QUANTUM_MS: u64 = 10;

/// MMIO base of the NS8250 console UART.
pub const UART0_MMIO_BASE: usize = 0x1000_0000;

/// MMIO base of the test finisher used for power-off.
pub const SYSCON_MMIO_BASE: usize = 0x10_0000;

/// Name of the program exec'd at the end of boot.
pub const INIT_NAME: &str = "init";
