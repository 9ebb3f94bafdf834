//! Demand-paged virtual memory for user processes.
//!
//! A user page is either resident in a frame of the user pool, or recorded in
//! its process's supplemental page table as reproducible from zeros, from a
//! file, or from a swap slot. Pages are brought in on fault and evicted with
//! the clock algorithm when the pool runs out.

pub mod frame;
pub mod page;
pub mod replacement;
pub mod space;
pub mod swap;
pub mod user_pool;

pub use frame::{AllocFlags, FrameTable};
pub use page::{FileKind, FileSource, PageEntry, PageSource, SupplementalPageTable};
pub use space::AddressSpace;
pub use swap::{SwapError, SwapManager, SwapSlot};
pub use user_pool::{PageBuf, PhysFrame, UserPool};

use crate::block::Block;
use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicU16, Ordering};
use log::{error, info};
use once_cell::race::OnceBox;
use thiserror::Error;

pub type Pid = u16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("no page registered at {0:#x}")]
    NotMapped(usize),
    #[error("page {0:#x} is already registered")]
    AlreadyRegistered(usize),
    #[error("page {0:#x} is already resident")]
    AlreadyResident(usize),
    #[error("page {0:#x} is already mapped")]
    AlreadyMapped(usize),
    #[error("page {0:#x} has no copy to load")]
    NoBacking(usize),
    #[error("page {upage:#x}: read {actual} of {expected} bytes from file")]
    ShortRead {
        upage: usize,
        expected: usize,
        actual: usize,
    },
    #[error("out of frames: no user frame exists for page {0:#x}")]
    OutOfFrames(usize),
    #[error(transparent)]
    Swap(#[from] SwapError),
}

impl VmError {
    /// Errors the kernel cannot continue after, as opposed to ones that only
    /// fail the process that ran into them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::OutOfFrames(_) | Self::Swap(SwapError::NoDevice))
    }
}

/// The shared half of the VM: frames and swap, used by every process.
pub struct Vm {
    frames: FrameTable,
    swap: SwapManager,
    next_pid: AtomicU16,
}

impl Vm {
    /// A VM with `user_frames` frames of user memory, swapping to
    /// `swap_device`.
    pub fn new(user_frames: usize, swap_device: Option<Block>) -> Result<Self, VmError> {
        let swap = SwapManager::new(swap_device)?;
        Ok(Self {
            frames: FrameTable::new(user_frames),
            swap,
            next_pid: AtomicU16::new(1),
        })
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapManager {
        &self.swap
    }

    pub fn allocate_pid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if pid == 0 {
            panic!("PID overflow");
        }
        pid
    }
}

static VM: OnceBox<Arc<Vm>> = OnceBox::new();

/// Set up the system VM. Halts if there is no swap device or if called twice.
pub fn init(user_frames: usize, swap_device: Option<Block>) -> Arc<Vm> {
    let vm = match Vm::new(user_frames, swap_device) {
        Ok(vm) => Arc::new(vm),
        Err(e) => {
            error!("vm: {e}");
            panic!("vm init failed: {e}");
        }
    };
    if VM.set(Box::new(vm.clone())).is_err() {
        panic!("vm initialized twice");
    }
    info!("vm: {user_frames} user frames, {} swap slots", vm.swap.capacity());
    vm
}

/// The system VM, once [`init`] has run.
pub fn get() -> Option<Arc<Vm>> {
    VM.get().cloned()
}
