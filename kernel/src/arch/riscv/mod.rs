//! RISC-V specific kernel pieces: the trap path and the assembly shims
//! (`head.S`, `swtch.S`, `trap.S`).

pub mod trap;
