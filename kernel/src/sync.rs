//! Kernel locks.
//!
//! `Mutex` is a spinning lock. With the `ticket_mutex` feature (on by default)
//! it hands the lock out in FIFO order, so a thread stuck behind eviction I/O
//! is served in the order it arrived.
//!
//! Lock order in the VM core, outermost first:
//!
//! 1. the frame table
//! 2. one supplemental page table (the faulting process's, or a single victim's)
//! 3. a page directory
//! 4. the bytes of one physical frame
//! 5. the swap device
//!
//! The user pool's core map and open files are leaves. A thread may skip
//! levels but never go back up: in particular, nothing that holds an SPT lock
//! may ask the frame table for a frame.

pub use spin::{Mutex, MutexGuard};
