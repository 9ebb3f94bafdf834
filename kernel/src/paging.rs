//! User page tables, as the VM core sees them.

use crate::vm::PhysFrame;
use alloc::{boxed::Box, vec::Vec};
use kidneyos_shared::{
    mem::{is_page_aligned, is_user_vaddr},
    paging::{PageTable, PageTableEntry, VirtualAddress, PAGE_DIRECTORY_LEN},
};

/// The hardware page-table layer of one address space.
///
/// All addresses are page-aligned user virtual addresses. Queries on an
/// address with no mapping answer `false`/`None`, and updates to it are
/// ignored.
pub trait PageMapper: Send {
    /// Map `upage` to `frame`. Returns `false`, without touching the existing
    /// mapping, if `upage` is already mapped.
    #[must_use]
    fn map(&mut self, upage: usize, frame: PhysFrame, writable: bool) -> bool;
    /// Remove the mapping for `upage`.
    fn unmap(&mut self, upage: usize);
    /// The frame `upage` maps to.
    fn translate(&self, upage: usize) -> Option<PhysFrame>;
    fn is_writable(&self, upage: usize) -> bool;
    fn is_accessed(&self, upage: usize) -> bool;
    fn set_accessed(&mut self, upage: usize, accessed: bool);
    fn is_dirty(&self, upage: usize) -> bool;
    fn set_dirty(&mut self, upage: usize, dirty: bool);
}

/// A two-level x86 page directory covering user memory.
///
/// Page tables are allocated on first use, like the ones the MMU walks.
pub struct PageDirectory {
    tables: Box<[Option<Box<PageTable>>]>,
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            tables: (0..PAGE_DIRECTORY_LEN).map(|_| None).collect(),
        }
    }

    fn entry(&self, upage: usize) -> Option<&PageTableEntry> {
        debug_assert!(is_page_aligned(upage));
        let va = VirtualAddress::from_usize(upage);
        let table = self.tables[va.directory_index()].as_ref()?;
        Some(&table[va.table_index()]).filter(|entry| entry.present())
    }

    fn entry_mut(&mut self, upage: usize) -> Option<&mut PageTableEntry> {
        debug_assert!(is_page_aligned(upage));
        let va = VirtualAddress::from_usize(upage);
        let table = self.tables[va.directory_index()].as_mut()?;
        Some(&mut table[va.table_index()]).filter(|entry| entry.present())
    }

    /// Every mapped user page, in address order.
    pub fn mapped_pages(&self) -> Vec<usize> {
        let mut pages = Vec::new();
        for (dir, table) in self.tables.iter().enumerate() {
            let Some(table) = table else { continue };
            for (idx, entry) in table.iter().enumerate() {
                if entry.present() {
                    pages.push(dir << 22 | idx << 12);
                }
            }
        }
        pages
    }
}

impl PageMapper for PageDirectory {
    fn map(&mut self, upage: usize, frame: PhysFrame, writable: bool) -> bool {
        assert!(is_user_vaddr(upage), "{upage:#x} is not a user address");
        if self.entry(upage).is_some() {
            return false;
        }
        let va = VirtualAddress::from_usize(upage);
        let table = self.tables[va.directory_index()].get_or_insert_with(Default::default);
        table[va.table_index()] = PageTableEntry::user(frame.number(), writable);
        true
    }

    fn unmap(&mut self, upage: usize) {
        if let Some(entry) = self.entry_mut(upage) {
            *entry = PageTableEntry::DEFAULT;
        }
    }

    fn translate(&self, upage: usize) -> Option<PhysFrame> {
        self.entry(upage)
            .map(|entry| PhysFrame::new(entry.frame_number()))
    }

    fn is_writable(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|entry| entry.read_write())
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|entry| entry.accessed())
    }

    fn set_accessed(&mut self, upage: usize, accessed: bool) {
        if let Some(entry) = self.entry_mut(upage) {
            *entry = entry.with_accessed(accessed);
        }
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|entry| entry.dirty())
    }

    fn set_dirty(&mut self, upage: usize, dirty: bool) {
        if let Some(entry) = self.entry_mut(upage) {
            *entry = entry.with_dirty(dirty);
        }
    }
}
