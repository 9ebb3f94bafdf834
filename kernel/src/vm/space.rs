//! A process's view of user memory: its supplemental page table and its page
//! directory, and the page-in and teardown paths that keep them in step.

use super::{
    frame::AllocFlags,
    page::{PageEntry, PageSource, SupplementalPageTable},
    user_pool::PhysFrame,
    Pid, Vm, VmError,
};
use crate::{
    paging::PageMapper,
    sync::{Mutex, MutexGuard},
};
use alloc::{boxed::Box, sync::Arc};
use kidneyos_shared::mem::pg_round_down;
use log::{debug, trace, warn};

pub struct AddressSpace {
    pid: Pid,
    spt: Mutex<SupplementalPageTable>,
    page_dir: Mutex<Box<dyn PageMapper>>,
}

impl AddressSpace {
    pub fn new(pid: Pid, page_dir: Box<dyn PageMapper>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            spt: Mutex::new(SupplementalPageTable::new()),
            page_dir: Mutex::new(page_dir),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn spt(&self) -> MutexGuard<'_, SupplementalPageTable> {
        self.spt.lock()
    }

    pub fn page_dir(&self) -> MutexGuard<'_, Box<dyn PageMapper>> {
        self.page_dir.lock()
    }

    /// Record how to produce a page without touching memory.
    pub fn register(&self, entry: PageEntry) -> Result<(), VmError> {
        self.spt().insert(entry)
    }

    /// Bring the page containing `addr` into memory and map it.
    ///
    /// The SPT lock is not held while a frame is acquired, since acquiring
    /// may evict one of this process's own pages. The frame stays pinned
    /// until it is mapped.
    pub fn realize(self: &Arc<Self>, vm: &Vm, addr: usize) -> Result<PhysFrame, VmError> {
        let upage = pg_round_down(addr);
        let (source, writable) = {
            let spt = self.spt();
            let entry = spt.lookup(upage).ok_or(VmError::NotMapped(addr))?;
            if entry.is_loaded() {
                return Err(VmError::AlreadyResident(upage));
            }
            (entry.source().clone(), entry.writable())
        };
        if self.page_dir().translate(upage).is_some() {
            return Err(VmError::AlreadyMapped(upage));
        }

        let flags = AllocFlags::DEFAULT.with_zero(matches!(source, PageSource::Zero));
        let kpage = vm.frames().acquire(vm.swap(), flags, self, upage)?;

        let filled = match &source {
            PageSource::Zero => Ok(()),
            PageSource::File(file) => file.read_page(upage, &mut vm.frames().pool().frame(kpage)),
            PageSource::Swap(Some(slot)) => vm
                .swap()
                .load(*slot, &mut vm.frames().pool().frame(kpage))
                .map_err(VmError::from),
            PageSource::Swap(None) => Err(VmError::NoBacking(upage)),
        };
        if let Err(e) = filled {
            vm.frames().release(kpage);
            return Err(e);
        }

        if let Err(e) = self.install(upage, kpage, writable) {
            if matches!(source, PageSource::Swap(Some(_))) {
                self.restore_to_swap(vm, upage, kpage);
            }
            vm.frames().release(kpage);
            return Err(e);
        }
        vm.frames().unpin(kpage);
        trace!("pid {}: realized {upage:#x} in {kpage}", self.pid);
        Ok(kpage)
    }

    fn install(&self, upage: usize, kpage: PhysFrame, writable: bool) -> Result<(), VmError> {
        let mut spt = self.spt();
        let entry = spt.lookup_mut(upage).ok_or(VmError::NotMapped(upage))?;
        if !self.page_dir().map(upage, kpage, writable) {
            return Err(VmError::AlreadyMapped(upage));
        }
        entry.mark_resident();
        Ok(())
    }

    /// The slot a page was loaded from is gone once read. Put the contents
    /// back in swap if the page could not be mapped after all.
    fn restore_to_swap(&self, vm: &Vm, upage: usize, kpage: PhysFrame) {
        let stored = vm.swap().store(&vm.frames().pool().frame(kpage));
        let mut spt = self.spt();
        match (stored, spt.lookup_mut(upage)) {
            (Ok(slot), Some(entry)) => entry.swap_out(slot),
            (Ok(slot), None) => vm.swap().free(slot),
            (Err(e), _) => warn!("pid {}: lost swapped page {upage:#x}: {e}", self.pid),
        }
    }

    /// Release everything this address space holds: resident frames, swap
    /// slots of swapped-out pages and every SPT entry. Safe to call more
    /// than once.
    pub fn teardown(&self, vm: &Vm) {
        let frames = vm.frames().release_all(self);
        let entries = self.spt().drain();
        let mut slots = 0;
        for entry in &entries {
            if let PageSource::Swap(Some(slot)) = entry.source() {
                vm.swap().free(*slot);
                slots += 1;
            }
        }
        debug!(
            "pid {}: released {frames} frames, {slots} swap slots, {} pages",
            self.pid,
            entries.len()
        );
    }
}
