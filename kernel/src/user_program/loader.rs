//! Lazy registration of executable segments and the initial stack.

use crate::{
    fs::File,
    vm::{AddressSpace, FileKind, FileSource, PageEntry, Vm, VmError},
};
use alloc::sync::Arc;
use kidneyos_shared::mem::{
    is_page_aligned, is_user_vaddr, pg_ofs, pg_round_down, pg_round_up, OFFSET, PAGE_FRAME_SIZE,
};
use log::trace;
use thiserror::Error;

// Segment permission flags.
pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

/// A loadable (`PT_LOAD`) program segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub offset: u32,
    pub vaddr: u32,
    pub file_size: u32,
    pub mem_size: u32,
    pub flags: u32,
}

impl Segment {
    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SegmentError {
    #[error("file offset and virtual address differ in page offset")]
    DifferentPageOffset,
    #[error("file offset past end of file")]
    OffsetOutOfRange,
    #[error("memory size smaller than file size")]
    MemSizeLesserThanFileSize,
    #[error("empty segment")]
    EmptyMemSize,
    #[error("segment outside user memory")]
    VMRegionOutOfRange,
    #[error("segment wraps around the address space")]
    VMRegionWrapAround,
    #[error("segment maps page 0")]
    PageZeroMapping,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("invalid segment: {0}")]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Vm(#[from] VmError),
}

pub fn validate_segment(segment: &Segment, file_len: u64) -> Result<(), SegmentError> {
    let vaddr = segment.vaddr as usize;

    // offset and vaddr must have the same page offset.
    if pg_ofs(segment.offset as usize) != pg_ofs(vaddr) {
        return Err(SegmentError::DifferentPageOffset);
    }

    // offset must point within the file.
    if u64::from(segment.offset) > file_len {
        return Err(SegmentError::OffsetOutOfRange);
    }

    if segment.mem_size < segment.file_size {
        return Err(SegmentError::MemSizeLesserThanFileSize);
    }

    if segment.mem_size == 0 {
        return Err(SegmentError::EmptyMemSize);
    }

    // The region must both start and end within user memory.
    if !is_user_vaddr(vaddr) {
        return Err(SegmentError::VMRegionOutOfRange);
    }
    let end = vaddr
        .checked_add(segment.mem_size as usize)
        .ok_or(SegmentError::VMRegionWrapAround)?;
    if !is_user_vaddr(end - 1) {
        return Err(SegmentError::VMRegionOutOfRange);
    }

    // Disallow mapping page 0.
    if vaddr < PAGE_FRAME_SIZE {
        return Err(SegmentError::PageZeroMapping);
    }

    Ok(())
}

/// Register every page of `segment` for loading on first touch. Returns the
/// number of pages registered.
pub fn load_segment(
    space: &AddressSpace,
    file: &Arc<dyn File>,
    segment: &Segment,
) -> Result<usize, LoadError> {
    validate_segment(segment, file.len())?;

    let vaddr = segment.vaddr as usize;
    let file_page = pg_round_down(segment.offset as usize) as u64;
    let mem_page = pg_round_down(vaddr);
    let page_offset = pg_ofs(vaddr);
    let mem_end = pg_round_up(page_offset + segment.mem_size as usize);
    let read_bytes = if segment.file_size > 0 {
        page_offset + segment.file_size as usize
    } else {
        0
    };

    let pages = register_lazy(
        space,
        file,
        file_page,
        mem_page,
        read_bytes,
        mem_end - read_bytes,
        segment.is_writable(),
    )?;
    trace!(
        "pid {}: segment at {vaddr:#x}, {pages} pages, {read_bytes} bytes from file",
        space.pid()
    );
    Ok(pages)
}

/// Register consecutive pages starting at `upage`: the first `read_bytes`
/// come from `file` at `offset`, the following `zero_bytes` are zero. Pages
/// with nothing to read are plain zero pages.
fn register_lazy(
    space: &AddressSpace,
    file: &Arc<dyn File>,
    mut offset: u64,
    mut upage: usize,
    mut read_bytes: usize,
    mut zero_bytes: usize,
    writable: bool,
) -> Result<usize, VmError> {
    assert!((read_bytes + zero_bytes) % PAGE_FRAME_SIZE == 0);
    assert!(is_page_aligned(upage));

    let mut pages = 0;
    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = read_bytes.min(PAGE_FRAME_SIZE);
        let page_zero_bytes = PAGE_FRAME_SIZE - page_read_bytes;

        let entry = if page_read_bytes == 0 {
            PageEntry::zero(upage, writable)
        } else {
            let source = FileSource::new(file.clone(), offset, page_read_bytes, FileKind::Executable);
            PageEntry::file(upage, writable, source)
        };
        space.register(entry)?;

        read_bytes -= page_read_bytes;
        zero_bytes -= page_zero_bytes;
        upage += PAGE_FRAME_SIZE;
        offset += PAGE_FRAME_SIZE as u64;
        pages += 1;
    }
    Ok(pages)
}

/// Map the top stack page right away, since the process needs a valid stack
/// pointer before it runs. Returns the initial stack pointer.
pub fn setup_stack(vm: &Vm, space: &Arc<AddressSpace>) -> Result<usize, VmError> {
    let upage = OFFSET - PAGE_FRAME_SIZE;
    space.register(PageEntry::zero(upage, true))?;
    space.realize(vm, upage)?;
    Ok(OFFSET)
}
