//! Special RISC-V instructions.

/// Halts the hart until the next interrupt arrives.
#[inline]
pub fn wfi() {
    #[cfg(target_arch = "riscv64")]
    // SAFETY: `wfi` has no side effects
    unsafe {
        core::arch::asm!("wfi", options(nostack, nomem));
    }
}

/// Executes a supervisor fence, flushing the local TLB.
#[inline]
pub fn sfence_vma() {
    #[cfg(target_arch = "riscv64")]
    // SAFETY: no memory side effects
    unsafe {
        core::arch::asm!("sfence.vma", options(nostack));
    }
}

/// Executes a full memory fence, ordering device-visible accesses.
#[inline]
pub fn fence() {
    #[cfg(target_arch = "riscv64")]
    // SAFETY: no memory side effects
    unsafe {
        core::arch::asm!("fence", options(nostack));
    }
}
