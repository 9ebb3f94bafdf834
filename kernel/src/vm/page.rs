//! The supplemental page table: how each registered user page of a process
//! can be reproduced when it is not resident.

use super::{swap::SwapSlot, user_pool::PageBuf, VmError};
use crate::fs::File;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::fmt;
use kidneyos_shared::mem::{is_page_aligned, pg_round_down, PAGE_FRAME_SIZE};

/// Why a file backs a page. Executable pages are never written back;
/// mapped pages are flushed to their file on unmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Executable,
    Mapped,
}

/// The part of a file one page is read from. `read_bytes` never exceeds a
/// page.
#[derive(Clone)]
pub struct FileSource {
    file: Arc<dyn File>,
    offset: u64,
    read_bytes: usize,
    kind: FileKind,
}

impl FileSource {
    /// Read `read_bytes` from `offset` and zero the rest of the page.
    ///
    /// # Panics
    ///
    /// If `read_bytes` is larger than a page.
    pub fn new(file: Arc<dyn File>, offset: u64, read_bytes: usize, kind: FileKind) -> Self {
        assert!(
            read_bytes <= PAGE_FRAME_SIZE,
            "{read_bytes} bytes do not fit in a page"
        );
        Self {
            file,
            offset,
            read_bytes,
            kind,
        }
    }

    pub fn file(&self) -> &Arc<dyn File> {
        &self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn zero_bytes(&self) -> usize {
        PAGE_FRAME_SIZE - self.read_bytes
    }

    /// Fill `page` for `upage`: file contents first, zeros after.
    pub(super) fn read_page(&self, upage: usize, page: &mut PageBuf) -> Result<(), VmError> {
        let (head, tail) = page.split_at_mut(self.read_bytes);
        let actual = self.file.read_at(head, self.offset);
        if actual != self.read_bytes {
            return Err(VmError::ShortRead {
                upage,
                expected: self.read_bytes,
                actual,
            });
        }
        tail.fill(0);
        Ok(())
    }
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSource")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Where a page's contents come from.
#[derive(Clone, Debug)]
pub enum PageSource {
    /// An all-zero page.
    Zero,
    File(FileSource),
    /// Anonymous contents. The slot is held only while the page is swapped
    /// out; a resident page of this kind has no copy anywhere else.
    Swap(Option<SwapSlot>),
}

#[derive(Clone, Debug)]
pub struct PageEntry {
    upage: usize,
    writable: bool,
    loaded: bool,
    source: PageSource,
}

impl PageEntry {
    pub fn new(upage: usize, writable: bool, source: PageSource) -> Self {
        assert!(is_page_aligned(upage), "{upage:#x} is not page aligned");
        Self {
            upage,
            writable,
            loaded: false,
            source,
        }
    }

    pub fn zero(upage: usize, writable: bool) -> Self {
        Self::new(upage, writable, PageSource::Zero)
    }

    pub fn file(upage: usize, writable: bool, source: FileSource) -> Self {
        Self::new(upage, writable, PageSource::File(source))
    }

    pub fn upage(&self) -> usize {
        self.upage
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Whether the page is currently resident.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn source(&self) -> &PageSource {
        &self.source
    }

    /// Pages with no file or zero origin, whose only copy outside memory is
    /// in swap.
    pub fn is_anonymous(&self) -> bool {
        matches!(self.source, PageSource::Swap(_))
    }

    /// The page was mapped. A slot it was read from has been consumed.
    pub(super) fn mark_resident(&mut self) {
        self.loaded = true;
        if let PageSource::Swap(slot) = &mut self.source {
            *slot = None;
        }
    }

    /// The page was evicted with its contents in `slot`.
    pub(super) fn swap_out(&mut self, slot: SwapSlot) {
        self.loaded = false;
        self.source = PageSource::Swap(Some(slot));
    }

    /// The page was evicted unchanged and can be reproduced from its source.
    pub(super) fn evict_clean(&mut self) {
        debug_assert!(!self.is_anonymous());
        self.loaded = false;
    }
}

/// Per-process map from page-aligned user address to [`PageEntry`].
#[derive(Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<usize, PageEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a page. A page already present is left untouched.
    pub fn insert(&mut self, entry: PageEntry) -> Result<(), VmError> {
        let upage = entry.upage();
        if self.entries.contains_key(&upage) {
            return Err(VmError::AlreadyRegistered(upage));
        }
        self.entries.insert(upage, entry);
        Ok(())
    }

    /// The entry for the page containing `addr`.
    pub fn lookup(&self, addr: usize) -> Option<&PageEntry> {
        self.entries.get(&pg_round_down(addr))
    }

    pub fn lookup_mut(&mut self, addr: usize) -> Option<&mut PageEntry> {
        self.entries.get_mut(&pg_round_down(addr))
    }

    pub fn remove(&mut self, upage: usize) -> Option<PageEntry> {
        self.entries.remove(&upage)
    }

    /// Whether any page in `start..end` is registered.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.entries.range(start..end).next().is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.values()
    }

    /// Take every entry out, in address order.
    pub fn drain(&mut self) -> Vec<PageEntry> {
        core::mem::take(&mut self.entries).into_values().collect()
    }

    /// Drop every entry. Files and swap slots the entries refer to are not
    /// released here. Returns how many entries there were.
    pub fn destroy(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}

impl fmt::Display for SupplementalPageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} pages", self.entries.len())?;
        for entry in self.entries.values() {
            write!(
                f,
                "  {:#010x} {} {} ",
                entry.upage,
                if entry.writable { "rw" } else { "ro" },
                if entry.loaded { "resident" } else { "absent  " },
            )?;
            match &entry.source {
                PageSource::Zero => writeln!(f, "zero")?,
                PageSource::File(src) => writeln!(
                    f,
                    "file {:?} @ {:#x}, {} read, {} zero",
                    src.kind,
                    src.offset,
                    src.read_bytes,
                    src.zero_bytes()
                )?,
                PageSource::Swap(Some(slot)) => writeln!(f, "swap {slot}")?,
                PageSource::Swap(None) => writeln!(f, "swap")?,
            }
        }
        Ok(())
    }
}
