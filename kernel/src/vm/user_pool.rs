//! Physical frames handed out to user pages.

use crate::sync::{Mutex, MutexGuard};
use alloc::boxed::Box;
use bitbybit::bitfield;
use core::fmt;
use kidneyos_shared::{mem::PAGE_FRAME_SIZE, paging::MAX_FRAME_NUMBER};

/// The contents of one page.
pub type PageBuf = [u8; PAGE_FRAME_SIZE];

/// A physical frame of the user pool, by frame number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame(usize);

impl PhysFrame {
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    pub const fn number(self) -> usize {
        self.0
    }

    pub const fn start_address(self) -> usize {
        self.0 * PAGE_FRAME_SIZE
    }
}

impl fmt::Display for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {:#x}", self.start_address())
    }
}

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

struct CoreMap {
    entries: Box<[CoreMapEntry]>,
    /// Where the next-fit search resumes.
    position: usize,
    allocated: usize,
}

impl CoreMap {
    fn place(&mut self) -> Option<usize> {
        let total = self.entries.len();
        if self.allocated == total {
            return None;
        }
        let found = (0..total)
            .map(|i| (self.position + i) % total)
            .find(|&i| !self.entries[i].allocated())?;
        self.position = (found + 1) % total;
        Some(found)
    }
}

/// The user pool: a fixed set of page frames plus the core map that says
/// which of them are handed out.
pub struct UserPool {
    core_map: Mutex<CoreMap>,
    frames: Box<[Mutex<PageBuf>]>,
}

impl UserPool {
    pub fn new(frames: usize) -> Self {
        assert!(
            frames <= MAX_FRAME_NUMBER + 1,
            "{frames} frames cannot be addressed by a page table entry"
        );
        Self {
            core_map: Mutex::new(CoreMap {
                entries: (0..frames).map(|_| CoreMapEntry::DEFAULT).collect(),
                position: 0,
                allocated: 0,
            }),
            frames: (0..frames)
                .map(|_| Mutex::new([0; PAGE_FRAME_SIZE]))
                .collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn free_frames(&self) -> usize {
        let core_map = self.core_map.lock();
        core_map.entries.len() - core_map.allocated
    }

    /// Take a free frame, zeroed if `zero` is set. `None` when the pool is
    /// exhausted.
    pub fn alloc(&self, zero: bool) -> Option<PhysFrame> {
        let frame = {
            let mut core_map = self.core_map.lock();
            let idx = core_map.place()?;
            core_map.entries[idx] = core_map.entries[idx].with_allocated(true);
            core_map.allocated += 1;
            PhysFrame::new(idx)
        };
        if zero {
            self.frame(frame).fill(0);
        }
        Some(frame)
    }

    /// Return `frame` to the pool.
    ///
    /// Panics if `frame` is not allocated; a double free means the frame
    /// table lost track of its frames.
    pub fn free(&self, frame: PhysFrame) {
        let mut core_map = self.core_map.lock();
        let entry = core_map.entries[frame.number()];
        assert!(entry.allocated(), "{frame} freed while not allocated");
        core_map.entries[frame.number()] = entry.with_allocated(false);
        core_map.allocated -= 1;
    }

    /// Lock the bytes of `frame`.
    pub fn frame(&self, frame: PhysFrame) -> MutexGuard<'_, PageBuf> {
        self.frames[frame.number()].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_fit_allocation() {
        let pool = UserPool::new(4);
        let a = pool.alloc(false).unwrap();
        let b = pool.alloc(false).unwrap();
        let c = pool.alloc(false).unwrap();
        assert_eq!([a, b, c].map(PhysFrame::number), [0, 1, 2]);

        pool.free(a);
        // The search continues after the last placement before wrapping.
        assert_eq!(pool.alloc(false), Some(PhysFrame::new(3)));
        assert_eq!(pool.alloc(false), Some(PhysFrame::new(0)));
        assert_eq!(pool.alloc(false), None);
        assert_eq!(pool.free_frames(), 0);
    }

    #[test]
    fn zeroed_allocation() {
        let pool = UserPool::new(1);
        let frame = pool.alloc(false).unwrap();
        pool.frame(frame).fill(0xCC);
        pool.free(frame);

        let frame = pool.alloc(false).unwrap();
        assert!(pool.frame(frame).iter().all(|&b| b == 0xCC));
        pool.free(frame);

        let frame = pool.alloc(true).unwrap();
        assert!(pool.frame(frame).iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "freed while not allocated")]
    fn double_free() {
        let pool = UserPool::new(2);
        let frame = pool.alloc(false).unwrap();
        pool.free(frame);
        pool.free(frame);
    }
}
