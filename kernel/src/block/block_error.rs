use super::block_core::BlockSector;
use thiserror::Error;

/// Error type for block operations
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The sector is out of bounds (greater than the block size)
    #[error("sector {sector} out of bounds (block size: {size})")]
    SectorOutOfBounds { sector: BlockSector, size: BlockSector },
    /// The buffer has an invalid size (not `BLOCK_SECTOR_SIZE`)
    #[error("invalid buffer size {0}")]
    BufferInvalid(usize),
    /// Error reading from the disk
    #[error("error reading sector {0}")]
    ReadError(BlockSector),
    /// Error writing to the disk
    #[error("error writing sector {0}")]
    WriteError(BlockSector),
    /// Blocks owned by another operating system are never written
    #[error("cannot write to foreign block")]
    ForeignWrite,
}
