//! Memory-mapped files.

use crate::{
    fs::File,
    vm::{AddressSpace, FileKind, FileSource, PageEntry, PageSource, Vm, VmError},
};
use alloc::{boxed::Box, sync::Arc};
use core::fmt;
use kidneyos_shared::mem::{is_page_aligned, OFFSET, PAGE_FRAME_SIZE, STACK_LIMIT};
use log::{debug, warn};
use thiserror::Error;

/// Identifies a mapping by the address it starts at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(usize);

impl MapId {
    pub fn base(self) -> usize {
        self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mapping@{:#x}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MmapError {
    #[error("cannot map at address 0")]
    NullAddress,
    #[error("{0:#x} is not page aligned")]
    Misaligned(usize),
    #[error("cannot map an empty file")]
    EmptyFile,
    #[error("mapping at {0:#x} does not fit in user memory")]
    OutsideUserSpace(usize),
    #[error("mapping at {0:#x} reaches into the stack")]
    StackOverlap(usize),
    #[error("mapping at {0:#x} overlaps registered pages")]
    Overlap(usize),
    #[error("no {0}")]
    UnknownMapping(MapId),
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// A mapped file region. Owns its own handle to the file, so the mapping
/// outlives the descriptor it was made from.
pub struct Mapping {
    file: Arc<dyn File>,
    base: usize,
    length: usize,
    pages: usize,
}

impl Mapping {
    pub fn id(&self) -> MapId {
        MapId(self.base)
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

/// Map `file` at `addr` in `space`, one lazily loaded page per page of file.
pub fn mmap(space: &AddressSpace, file: &Arc<dyn File>, addr: usize) -> Result<Mapping, MmapError> {
    if addr == 0 {
        return Err(MmapError::NullAddress);
    }
    if !is_page_aligned(addr) {
        return Err(MmapError::Misaligned(addr));
    }
    if file.is_empty() {
        return Err(MmapError::EmptyFile);
    }
    let length = usize::try_from(file.len()).map_err(|_| MmapError::OutsideUserSpace(addr))?;
    let pages = length.div_ceil(PAGE_FRAME_SIZE);
    let end = pages
        .checked_mul(PAGE_FRAME_SIZE)
        .and_then(|size| addr.checked_add(size))
        .filter(|&end| end <= OFFSET)
        .ok_or(MmapError::OutsideUserSpace(addr))?;
    if end > STACK_LIMIT {
        return Err(MmapError::StackOverlap(addr));
    }

    let mut spt = space.spt();
    if spt.overlaps(addr, end) {
        return Err(MmapError::Overlap(addr));
    }
    let file = file.reopen();
    for page in 0..pages {
        let offset = page * PAGE_FRAME_SIZE;
        let read_bytes = (length - offset).min(PAGE_FRAME_SIZE);
        let source = FileSource::new(file.clone(), offset as u64, read_bytes, FileKind::Mapped);
        spt.insert(PageEntry::file(addr + offset, true, source))?;
    }
    debug!("pid {}: mapped {length} bytes at {addr:#x}", space.pid());

    Ok(Mapping {
        file,
        base: addr,
        length,
        pages,
    })
}

/// Remove `mapping` from `space`, writing every modified page back to the
/// file. The mapping's file handle is closed when this returns. Returns the
/// number of pages written back.
pub fn munmap(vm: &Vm, space: &AddressSpace, mapping: Mapping) -> usize {
    let mut written = 0;
    for page in 0..mapping.pages {
        let offset = page * PAGE_FRAME_SIZE;
        let upage = mapping.base + offset;
        let len = (mapping.length - offset).min(PAGE_FRAME_SIZE);

        let resident = vm.frames().reclaim(space, upage);
        let Some(entry) = space.spt().remove(upage) else {
            warn!("pid {}: mapped page {upage:#x} vanished", space.pid());
            continue;
        };
        let contents = match (resident, entry.source()) {
            (Some(page), _) if page.dirty || entry.is_anonymous() => Some(page.contents),
            (None, PageSource::Swap(Some(slot))) => {
                let mut buf = Box::new([0; PAGE_FRAME_SIZE]);
                match vm.swap().load(*slot, &mut buf) {
                    Ok(()) => Some(buf),
                    Err(e) => {
                        warn!("pid {}: lost mapped page {upage:#x}: {e}", space.pid());
                        vm.swap().free(*slot);
                        None
                    }
                }
            }
            _ => None,
        };
        if let Some(contents) = contents {
            let count = mapping.file.write_at(&contents[..len], offset as u64);
            if count != len {
                warn!("pid {}: wrote {count} of {len} bytes back", space.pid());
            }
            written += 1;
        }
    }
    debug!(
        "pid {}: unmapped {}, {written} pages written back",
        space.pid(),
        mapping.id()
    );
    written
}
