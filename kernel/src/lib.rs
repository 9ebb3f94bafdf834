//! Demand-paging virtual memory core for KidneyOS user processes.
//!
//! [`vm`] holds the frame table, swap and supplemental page tables;
//! [`user_program`] is where the fault handler, the loader and the `mmap`
//! syscalls call in. The block, file and paging modules are the parts of the
//! surrounding kernel the core talks to.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod paging;
pub mod sync;
pub mod user_program;
pub mod vm;
