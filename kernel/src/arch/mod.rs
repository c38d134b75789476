//! Architecture-specific functions.

pub mod riscv;
