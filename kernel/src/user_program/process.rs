//! A user process as the VM sees it: an address space, its memory mappings,
//! and the entry points the fault handler, loader and syscalls call into.

use super::{
    loader::{self, LoadError, Segment},
    mmap::{self, MapId, Mapping, MmapError},
};
use crate::{
    fs::File,
    paging::{PageDirectory, PageMapper},
    vm::{AddressSpace, PageEntry, Pid, Vm, VmError},
};
use alloc::{
    boxed::Box,
    collections::BTreeMap,
    string::{String, ToString},
    sync::Arc,
    vec,
    vec::Vec,
};
use kidneyos_shared::mem::{
    is_user_vaddr, pg_ofs, pg_round_down, OFFSET, PAGE_FRAME_SIZE, STACK_LIMIT, STACK_SLACK,
};
use log::{debug, error, info, trace};

/// What the fault handler should do after a page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is mapped now; retry the access.
    Resolved,
    /// A real access violation. The process must be killed.
    Unrecoverable,
}

/// Whether a fault at `addr` with stack pointer `esp` is the stack growing.
fn is_stack_access(addr: usize, esp: usize) -> bool {
    (STACK_LIMIT..OFFSET).contains(&addr) && addr.saturating_add(STACK_SLACK) >= esp
}

pub struct Process {
    name: String,
    vm: Arc<Vm>,
    space: Arc<AddressSpace>,
    mappings: BTreeMap<MapId, Mapping>,
}

impl Process {
    pub fn new(vm: Arc<Vm>, name: &str) -> Self {
        Self::with_page_dir(vm, name, Box::new(PageDirectory::new()))
    }

    pub fn with_page_dir(vm: Arc<Vm>, name: &str, page_dir: Box<dyn PageMapper>) -> Self {
        let space = AddressSpace::new(vm.allocate_pid(), page_dir);
        Self {
            name: name.to_string(),
            vm,
            space,
            mappings: BTreeMap::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.space.pid()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn load_segment(&self, file: &Arc<dyn File>, segment: &Segment) -> Result<usize, LoadError> {
        loader::load_segment(&self.space, file, segment)
    }

    /// Returns the initial stack pointer.
    pub fn setup_stack(&self) -> Result<usize, VmError> {
        loader::setup_stack(&self.vm, &self.space)
    }

    /// Handle a page fault at `addr`.
    ///
    /// Panics if the fault cannot be served because no frame can be freed.
    pub fn on_fault(&self, addr: usize) -> FaultOutcome {
        if !is_user_vaddr(addr) {
            debug!("{}: fault on kernel address {addr:#x}", self.name);
            return FaultOutcome::Unrecoverable;
        }
        match self.space.realize(&self.vm, addr) {
            Ok(kpage) => {
                trace!("{}: fault at {addr:#x} served with {kpage}", self.name);
                FaultOutcome::Resolved
            }
            Err(e) if e.is_fatal() => {
                error!("{}: fault at {addr:#x}: {e}", self.name);
                panic!("unrecoverable page fault: {e}");
            }
            Err(e) => {
                debug!("{}: fault at {addr:#x}: {e}", self.name);
                FaultOutcome::Unrecoverable
            }
        }
    }

    /// Handle a page fault at `addr` taken with user stack pointer `esp`,
    /// growing the stack if that is what the access was doing.
    pub fn on_fault_with_stack(&self, addr: usize, esp: usize) -> FaultOutcome {
        if is_stack_access(addr, esp) {
            let upage = pg_round_down(addr);
            let mut spt = self.space.spt();
            if spt.lookup(upage).is_none() && spt.insert(PageEntry::zero(upage, true)).is_ok() {
                trace!("{}: stack grows to {upage:#x}", self.name);
            }
        }
        self.on_fault(addr)
    }

    /// Map `file` at `addr`.
    pub fn mmap(&mut self, file: &Arc<dyn File>, addr: usize) -> Result<MapId, MmapError> {
        let mapping = mmap::mmap(&self.space, file, addr)?;
        let id = mapping.id();
        self.mappings.insert(id, mapping);
        Ok(id)
    }

    pub fn munmap(&mut self, id: MapId) -> Result<(), MmapError> {
        let mapping = self
            .mappings
            .remove(&id)
            .ok_or(MmapError::UnknownMapping(id))?;
        let (pages, length) = (mapping.pages(), mapping.length());
        let written = mmap::munmap(&self.vm, &self.space, mapping);
        debug!(
            "{}: unmapped {id} ({length} bytes), {written} of {pages} pages written back",
            self.name
        );
        Ok(())
    }

    pub fn mappings(&self) -> impl Iterator<Item = MapId> + '_ {
        self.mappings.keys().copied()
    }

    /// Run `access` on each page-sized piece of `addr..addr + len`, faulting
    /// pages in as the MMU would. `access` gets the piece of the frame and its
    /// position in the range.
    fn access_user(
        &self,
        addr: usize,
        len: usize,
        write: bool,
        mut access: impl FnMut(&mut [u8], usize),
    ) -> bool {
        let Some(end) = addr.checked_add(len).filter(|&end| end <= OFFSET) else {
            return false;
        };
        let mut pos = addr;
        while pos < end {
            let upage = pg_round_down(pos);
            let ofs = pg_ofs(pos);
            let count = (PAGE_FRAME_SIZE - ofs).min(end - pos);
            loop {
                {
                    let mut page_dir = self.space.page_dir();
                    if let Some(kpage) = page_dir.translate(upage) {
                        if write && !page_dir.is_writable(upage) {
                            return false;
                        }
                        let mut frame = self.vm.frames().pool().frame(kpage);
                        access(&mut frame[ofs..ofs + count], pos - addr);
                        page_dir.set_accessed(upage, true);
                        if write {
                            page_dir.set_dirty(upage, true);
                        }
                        break;
                    }
                }
                if self.on_fault(pos) == FaultOutcome::Unrecoverable {
                    return false;
                }
            }
            pos += count;
        }
        true
    }

    /// Copy `len` bytes of user memory at `addr`. `None` on an access
    /// violation.
    pub fn read_user(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        let mut data = vec![0; len];
        let ok = self.access_user(addr, len, false, |page, at| {
            data[at..at + page.len()].copy_from_slice(page);
        });
        ok.then_some(data)
    }

    /// Copy `data` into user memory at `addr`. Returns `false` on an access
    /// violation, possibly after part of `data` was written.
    #[must_use]
    pub fn write_user(&self, addr: usize, data: &[u8]) -> bool {
        self.access_user(addr, data.len(), true, |page, at| {
            page.copy_from_slice(&data[at..at + page.len()]);
        })
    }

    /// Terminate the process with `status`, releasing all of its memory.
    pub fn exit(self, status: i32) -> i32 {
        info!("{}: exit({status})", self.name);
        status
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        for (_, mapping) in core::mem::take(&mut self.mappings) {
            mmap::munmap(&self.vm, &self.space, mapping);
        }
        self.space.teardown(&self.vm);
    }
}
