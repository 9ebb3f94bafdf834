//! Swap space: page-sized slots on the swap block device.

use super::user_pool::PageBuf;
use crate::block::{Block, BlockError, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use core::fmt;
use kidneyos_shared::{bitmap::Bitmap, mem::SECTORS_PER_PAGE};
use log::{debug, info, trace, warn};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    #[error("no swap device present")]
    NoDevice,
    #[error("swap space is full")]
    Full,
    #[error("swap slot {0} out of range")]
    SlotOutOfRange(usize),
    #[error("swap slot {0} is not in use")]
    SlotNotInUse(usize),
    #[error("swap device: {0}")]
    Block(#[from] BlockError),
}

/// Index of a page-sized slot in swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn index(self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index)
    }

    fn first_sector(self) -> BlockSector {
        self.0 as BlockSector * SECTORS_PER_PAGE
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

struct SwapTable {
    device: Block,
    /// Set bits are occupied slots.
    used: Bitmap,
    rejected_frees: usize,
}

impl SwapTable {
    fn check(&self, slot: SwapSlot) -> Result<(), SwapError> {
        if slot.index() >= self.used.len() {
            return Err(SwapError::SlotOutOfRange(slot.index()));
        }
        if !self.used.test(slot.index()) {
            return Err(SwapError::SlotNotInUse(slot.index()));
        }
        Ok(())
    }
}

/// Slot allocator over the swap device. Every operation holds the one
/// device-wide lock for its whole duration, I/O included.
pub struct SwapManager {
    table: Mutex<SwapTable>,
}

impl SwapManager {
    /// Take over `device` as swap. Only a block with the [`BlockType::Swap`]
    /// role qualifies.
    pub fn new(device: Option<Block>) -> Result<Self, SwapError> {
        let device = device
            .filter(|device| device.get_type() == BlockType::Swap)
            .ok_or(SwapError::NoDevice)?;
        let slots = (device.get_size() / SECTORS_PER_PAGE) as usize;
        info!("swap: {device}, {slots} slots");
        Ok(Self {
            table: Mutex::new(SwapTable {
                device,
                used: Bitmap::new(slots),
                rejected_frees: 0,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.table.lock().used.len()
    }

    pub fn used_slots(&self) -> usize {
        self.table.lock().used.count(true)
    }

    pub fn is_occupied(&self, slot: SwapSlot) -> bool {
        let table = self.table.lock();
        slot.index() < table.used.len() && table.used.test(slot.index())
    }

    /// Sectors read from and written to the swap device so far.
    pub fn io_counts(&self) -> (u32, u32) {
        let table = self.table.lock();
        (table.device.read_count(), table.device.write_count())
    }

    /// Frees of slots that were out of range or not in use.
    pub fn rejected_frees(&self) -> usize {
        self.table.lock().rejected_frees
    }

    /// Write `page` to the first free slot.
    pub fn store(&self, page: &PageBuf) -> Result<SwapSlot, SwapError> {
        let mut table = self.table.lock();
        let slot = SwapSlot(table.used.scan_and_flip(false).ok_or(SwapError::Full)?);

        let first = slot.first_sector();
        for (sector, chunk) in (first..).zip(page.chunks_exact(BLOCK_SECTOR_SIZE)) {
            if let Err(e) = table.device.write(sector, chunk) {
                table.used.set(slot.index(), false);
                warn!("swap: writing {slot} failed: {e}");
                return Err(e.into());
            }
        }
        trace!("swap: stored page in {slot}");
        Ok(slot)
    }

    /// Read `slot` into `page` and free it. A slot's contents can be loaded
    /// only once.
    pub fn load(&self, slot: SwapSlot, page: &mut PageBuf) -> Result<(), SwapError> {
        let mut table = self.table.lock();
        table.check(slot)?;

        let first = slot.first_sector();
        for (sector, chunk) in (first..).zip(page.chunks_exact_mut(BLOCK_SECTOR_SIZE)) {
            table.device.read(sector, chunk)?;
        }
        table.used.set(slot.index(), false);
        trace!("swap: loaded page from {slot}");
        Ok(())
    }

    /// Free `slot` without reading it.
    pub fn free(&self, slot: SwapSlot) {
        let mut table = self.table.lock();
        match table.check(slot) {
            Ok(()) => {
                table.used.set(slot.index(), false);
                debug!("swap: freed {slot}");
            }
            Err(e) => {
                table.rejected_frees += 1;
                warn!("swap: ignoring free of {slot}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block::BlockOp, drivers::RamDisk};
    use alloc::boxed::Box;
    use kidneyos_shared::mem::PAGE_FRAME_SIZE;

    fn swap_with_slots(slots: u32) -> SwapManager {
        let device = RamDisk::new(slots * SECTORS_PER_PAGE).into_block("swap", BlockType::Swap);
        SwapManager::new(Some(device)).unwrap()
    }

    fn patterned(seed: u8) -> PageBuf {
        let mut page = [0; PAGE_FRAME_SIZE];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = seed.wrapping_add(i as u8);
        }
        page
    }

    #[test]
    fn needs_a_swap_device() {
        assert_eq!(SwapManager::new(None).err(), Some(SwapError::NoDevice));
        let scratch = RamDisk::new(16).into_block("scratch", BlockType::Scratch);
        assert_eq!(SwapManager::new(Some(scratch)).err(), Some(SwapError::NoDevice));
    }

    #[test]
    fn store_then_load() {
        let swap = swap_with_slots(4);
        let page = patterned(7);
        let slot = swap.store(&page).unwrap();
        assert!(swap.is_occupied(slot));

        let mut dest = [0; PAGE_FRAME_SIZE];
        swap.load(slot, &mut dest).unwrap();
        assert_eq!(dest, page);
        assert!(!swap.is_occupied(slot));
        assert_eq!(swap.io_counts(), (SECTORS_PER_PAGE, SECTORS_PER_PAGE));

        // The freed slot is the first free one again.
        assert_eq!(swap.store(&patterned(9)).unwrap(), slot);
    }

    #[test]
    fn slots_do_not_overlap() {
        let swap = swap_with_slots(3);
        let slots = [1, 2, 3].map(|seed| swap.store(&patterned(seed)).unwrap());
        assert_eq!(slots.map(SwapSlot::index), [0, 1, 2]);

        let mut dest = [0; PAGE_FRAME_SIZE];
        swap.load(slots[1], &mut dest).unwrap();
        assert_eq!(dest, patterned(2));
        swap.load(slots[2], &mut dest).unwrap();
        assert_eq!(dest, patterned(3));
        swap.load(slots[0], &mut dest).unwrap();
        assert_eq!(dest, patterned(1));
    }

    #[test]
    fn exhaustion() {
        let swap = swap_with_slots(2);
        let page = patterned(0);
        swap.store(&page).unwrap();
        swap.store(&page).unwrap();
        assert_eq!(swap.store(&page), Err(SwapError::Full));
        assert_eq!(swap.used_slots(), 2);
        assert_eq!(swap.capacity(), 2);
    }

    #[test]
    fn load_is_one_shot() {
        let swap = swap_with_slots(1);
        let slot = swap.store(&patterned(1)).unwrap();
        let mut dest = [0; PAGE_FRAME_SIZE];
        swap.load(slot, &mut dest).unwrap();
        assert_eq!(
            swap.load(slot, &mut dest),
            Err(SwapError::SlotNotInUse(0))
        );
        assert_eq!(
            swap.load(SwapSlot(5), &mut dest),
            Err(SwapError::SlotOutOfRange(5))
        );
    }

    #[test]
    fn free_is_idempotent() {
        let swap = swap_with_slots(2);
        let slot = swap.store(&patterned(1)).unwrap();
        swap.free(slot);
        assert_eq!(swap.rejected_frees(), 0);
        swap.free(slot);
        assert_eq!(swap.used_slots(), 0);
        swap.free(SwapSlot(9));
        assert_eq!(swap.used_slots(), 0);
        assert_eq!(swap.rejected_frees(), 2);
    }

    /// Fails every write past the first `budget` sectors.
    struct FlakyDisk {
        inner: RamDisk,
        budget: u32,
    }

    impl BlockOp for FlakyDisk {
        fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
            self.inner.read(sector, buf)
        }

        fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
            if self.budget == 0 {
                return Err(BlockError::WriteError(sector));
            }
            self.budget -= 1;
            self.inner.write(sector, buf)
        }
    }

    #[test]
    fn failed_store_releases_its_slot() {
        let disk = FlakyDisk {
            inner: RamDisk::new(2 * SECTORS_PER_PAGE),
            budget: 3,
        };
        let device = Block::new("swap", BlockType::Swap, 2 * SECTORS_PER_PAGE, Box::new(disk));
        let swap = SwapManager::new(Some(device)).unwrap();
        assert_eq!(
            swap.store(&patterned(0)),
            Err(SwapError::Block(BlockError::WriteError(3)))
        );
        assert_eq!(swap.used_slots(), 0);
    }
}
