use crate::block::{Block, BlockError, BlockOp, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use alloc::{boxed::Box, vec, vec::Vec};

/// A block device driver backed by kernel memory. Its contents vanish with it,
/// which is all swap ever needs.
pub struct RamDisk {
    data: Vec<u8>,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: vec![0; sectors as usize * BLOCK_SECTOR_SIZE],
        }
    }

    pub fn sectors(&self) -> BlockSector {
        (self.data.len() / BLOCK_SECTOR_SIZE) as BlockSector
    }

    /// Register this disk as a block device.
    pub fn into_block(self, name: &str, block_type: BlockType) -> Block {
        let sectors = self.sectors();
        Block::new(name, block_type, sectors, Box::new(self))
    }

    fn range(&self, sector: BlockSector) -> Option<core::ops::Range<usize>> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        let end = start + BLOCK_SECTOR_SIZE;
        (end <= self.data.len()).then_some(start..end)
    }
}

impl BlockOp for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(sector).ok_or(BlockError::ReadError(sector))?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(sector).ok_or(BlockError::WriteError(sector))?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}
