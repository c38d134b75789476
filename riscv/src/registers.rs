//! Access to various system registers.
//!
//! The accessors compile to single CSR instructions on `riscv64`. On other
//! targets they panic at runtime, which keeps host builds of dependent
//! crates working without pretending the registers exist.

use bitflags::bitflags;

use crate::mmu::Mtag;

macro_rules! csr_read {
    ($csr:literal) => {{
        #[cfg(not(target_arch = "riscv64"))]
        unimplemented!(concat!($csr, " is only accessible on riscv64"));

        #[allow(unreachable_code)]
        {
            let value: u64;
            #[cfg(target_arch = "riscv64")]
            unsafe {
                core::arch::asm!(concat!("csrr {}, ", $csr), out(reg) value, options(nomem));
            }
            #[cfg(not(target_arch = "riscv64"))]
            {
                value = 0;
            }
            value
        }
    }};
}

macro_rules! csr_write {
    ($csr:literal, $val:expr) => {{
        #[allow(unused_variables)]
        let val: u64 = $val;
        #[cfg(target_arch = "riscv64")]
        unsafe {
            core::arch::asm!(concat!("csrw ", $csr, ", {}"), in(reg) val, options(nostack));
        }
        #[cfg(not(target_arch = "riscv64"))]
        unimplemented!(concat!($csr, " is only accessible on riscv64"));
    }};
}

// csrrw/csrrs/csrrc: write/set/clear returning the previous value.
macro_rules! csr_exchange {
    ($insn:literal, $csr:literal, $val:expr) => {{
        #[cfg(not(target_arch = "riscv64"))]
        {
            let _ = $val;
            unimplemented!(concat!($csr, " is only accessible on riscv64"));
        }

        #[allow(unreachable_code, unused_variables)]
        {
            let val: u64 = $val;
            let prev: u64;
            #[cfg(target_arch = "riscv64")]
            unsafe {
                core::arch::asm!(concat!($insn, " {}, ", $csr, ", {}"),
                    out(reg) prev, in(reg) val, options(nostack));
            }
            #[cfg(not(target_arch = "riscv64"))]
            {
                prev = 0;
            }
            prev
        }
    }};
}

bitflags! {
    /// Flags for the `sstatus` register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SstatusFlags: u64 {
        /// S-mode interrupt enable.
        const SIE = 1 << 1;
        /// S-mode previous interrupt enable.
        const SPIE = 1 << 5;
        /// S-mode previous privilege level (set = S, clear = U).
        const SPP = 1 << 8;
        /// Permit S-mode access to user memory.
        const SUM = 1 << 18;
    }
}

/// The `sstatus` register tracks the processor's current operating state.
#[derive(Debug)]
pub struct Sstatus;

impl Sstatus {
    /// Reads the content of `sstatus`.
    #[inline]
    pub fn read() -> SstatusFlags {
        SstatusFlags::from_bits_truncate(Self::read_raw())
    }

    /// Reads the raw content of `sstatus`.
    #[inline]
    pub fn read_raw() -> u64 {
        csr_read!("sstatus")
    }

    /// Sets the specified flags in `sstatus`, returning the previous value.
    #[inline]
    pub fn set(flags: SstatusFlags) -> SstatusFlags {
        SstatusFlags::from_bits_truncate(csr_exchange!("csrrs", "sstatus", flags.bits()))
    }

    /// Clears the specified flags from `sstatus`, returning the previous
    /// value.
    #[inline]
    pub fn clear(flags: SstatusFlags) -> SstatusFlags {
        SstatusFlags::from_bits_truncate(csr_exchange!("csrrc", "sstatus", flags.bits()))
    }
}

bitflags! {
    /// Flags for the `sie`/`sip` registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SiFlags: u64 {
        /// S-mode software interrupt enable.
        const SSIE = 1 << 1;
        /// S-mode timer interrupt enable.
        const STIE = 1 << 5;
        /// S-mode external interrupt enable.
        const SEIE = 1 << 9;
    }
}

/// The `sie` register contains interrupt enable bits.
#[derive(Debug)]
pub struct Sie;

impl Sie {
    /// Reads the content of `sie`.
    #[inline]
    pub fn read() -> SiFlags {
        SiFlags::from_bits_truncate(csr_read!("sie"))
    }

    /// Sets the specified flags in `sie`.
    #[inline]
    pub fn set(flags: SiFlags) {
        let _ = csr_exchange!("csrrs", "sie", flags.bits());
    }

    /// Clears the specified flags from `sie`.
    #[inline]
    pub fn clear(flags: SiFlags) {
        let _ = csr_exchange!("csrrc", "sie", flags.bits());
    }
}

/// The `satp` register controls S-mode address translation and protection.
#[derive(Debug)]
pub struct Satp;

impl Satp {
    /// Reads the active address-space tag.
    #[inline]
    pub fn read() -> Mtag {
        Mtag::from_raw(csr_read!("satp"))
    }

    /// Installs a new address-space tag.
    ///
    /// # Safety
    ///
    /// The tag must point to a well-formed root page table that keeps the
    /// currently executing code mapped.
    #[inline]
    pub unsafe fn write(tag: Mtag) {
        csr_write!("satp", tag.raw());
    }

    /// Atomically installs a new tag and returns the previous one.
    ///
    /// # Safety
    ///
    /// See [`Satp::write`].
    #[inline]
    pub unsafe fn swap(tag: Mtag) -> Mtag {
        Mtag::from_raw(csr_exchange!("csrrw", "satp", tag.raw()))
    }
}

/// The `stvec` register holds the trap vector configuration.
#[derive(Debug)]
pub struct Stvec;

impl Stvec {
    /// Writes to `stvec`.
    #[inline]
    pub fn write(v: u64) {
        csr_write!("stvec", v);
    }
}

/// The `stval` register holds exception-specific information.
#[derive(Debug)]
pub struct Stval;

impl Stval {
    /// Reads the content of `stval`.
    #[inline]
    pub fn read() -> u64 {
        csr_read!("stval")
    }
}

/// The `time` counter, incremented at the platform timebase frequency.
#[derive(Debug)]
pub struct Time;

impl Time {
    /// Reads the current value of the `time` counter.
    #[inline]
    pub fn read() -> u64 {
        csr_read!("time")
    }
}

/// The `stimecmp` register of the Sstc extension: a timer interrupt fires
/// whenever `time >= stimecmp`.
#[derive(Debug)]
pub struct Stimecmp;

impl Stimecmp {
    /// Programs the next timer interrupt.
    #[inline]
    pub fn write(v: u64) {
        csr_write!("stimecmp", v);
    }
}

/// Disables S-mode interrupts and returns whether they were enabled before.
#[inline]
pub fn disable_interrupts() -> bool {
    Sstatus::clear(SstatusFlags::SIE).contains(SstatusFlags::SIE)
}

/// Enables S-mode interrupts.
#[inline]
pub fn enable_interrupts() {
    Sstatus::set(SstatusFlags::SIE);
}

/// Restores the interrupt state saved by [`disable_interrupts`].
#[inline]
pub fn restore_interrupts(was_enabled: bool) {
    if was_enabled {
        enable_interrupts();
    }
}
