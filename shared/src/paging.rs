// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::PAGE_FRAME_SIZE;
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::{
    mem::size_of,
    ops::{Deref, DerefMut},
};

pub const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

/// Number of page tables a page directory can reference.
pub const PAGE_DIRECTORY_LEN: usize = PAGE_TABLE_LEN;

/// Largest frame number a page table entry can hold.
pub const MAX_FRAME_NUMBER: usize = (1 << 20) - 1;

#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl Default for PageTable {
    fn default() -> Self {
        Self([PageTableEntry::default(); PAGE_TABLE_LEN])
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; PAGE_TABLE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl PageTable {
    /// Number of present entries in this table.
    pub fn present_count(&self) -> usize {
        self.iter().filter(|entry| entry.present()).count()
    }
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user-mode entry pointing at frame number `frame`.
    ///
    /// Panics if `frame` does not fit in the 20 address bits.
    pub fn user(frame: usize, writable: bool) -> Self {
        assert!(frame <= MAX_FRAME_NUMBER, "frame {frame} out of range");
        Self::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(u20::new(frame as u32))
    }

    pub fn frame_number(&self) -> usize {
        self.page_frame_address().value() as usize
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    pub fn from_usize(addr: usize) -> Self {
        Self::new_with_raw_value(addr as u32)
    }

    pub fn directory_index(&self) -> usize {
        usize::from(self.page_directory_index().value())
    }

    pub fn table_index(&self) -> usize {
        usize::from(self.page_table_index().value())
    }
}
