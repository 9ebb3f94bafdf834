use super::block_error::BlockError;
use alloc::{boxed::Box, string::String};
use core::fmt;
use log::trace;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = kidneyos_shared::sizes::SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Roles a block device can play
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// OS Kernel
    Kernel,
    /// File system
    FileSystem,
    /// Scratch
    Scratch,
    /// Swap
    Swap,
    /// "Raw" device with unidentified contents
    Raw,
    /// Owned by non-KidneyOS operating system
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Kernel => write!(f, "Kernel"),
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Raw => write!(f, "Raw"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers
///
/// Drivers are only called with in-range sectors and `BLOCK_SECTOR_SIZE`
/// buffers; [`Block`] checks both first.
pub trait BlockOp: Send {
    /// Read a block sector
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// A block device
pub struct Block {
    /// Tha name of the block device
    block_name: String,
    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: Box<dyn BlockOp>,
    /// The size of the block device in sectors
    block_size: BlockSector,

    /// The read count
    read_count: u32,
    /// The write count
    write_count: u32,
}

impl Block {
    /// Wrap `driver` as a device called `block_name` with `block_size` sectors.
    pub fn new(
        block_name: &str,
        block_type: BlockType,
        block_size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> Self {
        Self {
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: 0,
            write_count: 0,
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid(buf.len()));
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds {
                sector,
                size: self.block_size,
            });
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.read(sector, buf)?;
        self.read_count += 1;
        trace!("{}: read sector {}", self.block_name, sector);
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        if self.block_type == BlockType::Foreign {
            return Err(BlockError::ForeignWrite);
        }

        self.driver.write(sector, buf)?;
        self.write_count += 1;
        trace!("{}: wrote sector {}", self.block_name, sector);
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn read_count(&self) -> u32 {
        self.read_count
    }
    pub fn write_count(&self) -> u32 {
        self.write_count
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.block_name, self.block_type, self.block_size, self.read_count, self.write_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::RamDisk;
    use alloc::format;

    #[test]
    fn read_back_what_was_written() {
        let mut block = RamDisk::new(4).into_block("scratch", BlockType::Scratch);
        let data = [0xAB; BLOCK_SECTOR_SIZE];
        block.write(2, &data).unwrap();

        let mut buf = [0; BLOCK_SECTOR_SIZE];
        block.read(2, &mut buf).unwrap();
        assert_eq!(buf, data);
        block.read(1, &mut buf).unwrap();
        assert_eq!(buf, [0; BLOCK_SECTOR_SIZE]);

        assert_eq!(block.read_count(), 2);
        assert_eq!(block.write_count(), 1);
    }

    #[test]
    fn rejects_bad_requests() {
        let mut block = RamDisk::new(4).into_block("scratch", BlockType::Scratch);
        let mut buf = [0; BLOCK_SECTOR_SIZE];
        assert_eq!(
            block.read(4, &mut buf),
            Err(BlockError::SectorOutOfBounds { sector: 4, size: 4 })
        );
        assert_eq!(
            block.write(0, &buf[..10]),
            Err(BlockError::BufferInvalid(10))
        );
        assert_eq!(block.read_count(), 0);
        assert_eq!(block.write_count(), 0);
    }

    #[test]
    fn foreign_blocks_are_read_only() {
        let mut block = RamDisk::new(1).into_block("other", BlockType::Foreign);
        let buf = [0; BLOCK_SECTOR_SIZE];
        assert_eq!(block.write(0, &buf), Err(BlockError::ForeignWrite));
    }

    #[test]
    fn display() {
        let block = RamDisk::new(8).into_block("swap", BlockType::Swap);
        assert_eq!(
            format!("{block}"),
            "\"swap\" (Swap): 0008 sectors, 0000 read, 0000 write"
        );
    }
}
