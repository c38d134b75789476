//! This crate provides RISC-V specific functions and data structures for a
//! single-hart Sv39 kernel: page-table entries and tables, SATP tag
//! encoding, virtual-address arithmetic, and access to various system
//! registers.
//!
//! Everything except the CSR accessors and special instructions is plain bit
//! math and can be exercised on the host.

#![no_std]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod instructions;
pub mod mmu;
pub mod registers;

pub use addr::{PAGE_ORDER, PAGE_SIZE};
pub use mmu::{Entry, EntryFlags, Mtag, PageTable};
