//! The frame table: every user page that currently occupies a physical frame,
//! and the eviction engine that frees frames once the user pool runs dry.

use super::{
    page::SupplementalPageTable,
    replacement::{Clock, ReplacementPolicy},
    space::AddressSpace,
    swap::SwapManager,
    user_pool::{PageBuf, PhysFrame, UserPool},
    Pid, VmError,
};
use crate::sync::{Mutex, MutexGuard};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use bitbybit::bitfield;
use core::fmt;
use log::{debug, error, trace, warn};
use spin::relax::{RelaxStrategy, Spin};

/// How [`FrameTable::acquire`] prepares a frame. `zero` hands it out filled
/// with zeros.
#[bitfield(u8, default = 0)]
pub struct AllocFlags {
    #[bit(0, rw)]
    zero: bool,
}

/// A user page resident in a physical frame.
pub struct Frame {
    owner: Arc<AddressSpace>,
    upage: usize,
    kpage: PhysFrame,
    pinned: bool,
}

impl Frame {
    pub fn owner(&self) -> &Arc<AddressSpace> {
        &self.owner
    }

    pub fn upage(&self) -> usize {
        self.upage
    }

    pub fn kpage(&self) -> PhysFrame {
        self.kpage
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

/// A resident page taken back by its owner.
pub struct Reclaimed {
    /// Whether the page was written since it was mapped.
    pub dirty: bool,
    pub contents: Box<PageBuf>,
}

/// State behind the frame table lock.
///
/// Frames live in an arena so the clock hand stays valid across removals.
pub(super) struct Frames {
    slots: Vec<Option<Frame>>,
    vacant: Vec<usize>,
    by_page: BTreeMap<(Pid, usize), usize>,
    by_kpage: BTreeMap<PhysFrame, usize>,
    policy: Box<dyn ReplacementPolicy>,
}

impl Frames {
    fn insert(&mut self, frame: Frame) -> usize {
        let page = (frame.owner.pid(), frame.upage);
        let kpage = frame.kpage;
        let idx = match self.vacant.pop() {
            Some(idx) => {
                self.slots[idx] = Some(frame);
                idx
            }
            None => {
                self.slots.push(Some(frame));
                self.slots.len() - 1
            }
        };
        let previous = self.by_page.insert(page, idx);
        debug_assert!(previous.is_none());
        self.by_kpage.insert(kpage, idx);
        idx
    }

    fn remove(&mut self, idx: usize) -> Option<Frame> {
        let frame = self.slots.get_mut(idx)?.take()?;
        self.by_page.remove(&(frame.owner.pid(), frame.upage));
        self.by_kpage.remove(&frame.kpage);
        self.vacant.push(idx);
        Some(frame)
    }

    fn get_mut(&mut self, kpage: PhysFrame) -> Option<&mut Frame> {
        let idx = *self.by_kpage.get(&kpage)?;
        self.slots[idx].as_mut()
    }

    fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.slots.iter().flatten()
    }
}

/// A frame chosen for eviction, with its owner's page table locked.
///
/// Only constructible from the locked frame table, which stays mutably
/// borrowed for as long as this exists: the victim's SPT lock is therefore
/// always taken after the frame table lock, and no two victims are ever
/// locked at once.
struct VictimPage<'t> {
    frame: &'t Frame,
    spt: MutexGuard<'t, SupplementalPageTable>,
}

impl<'t> VictimPage<'t> {
    fn lock(frames: &'t mut Frames, idx: usize) -> Option<Self> {
        let frame = frames.slots.get(idx)?.as_ref()?;
        let spt = frame.owner.spt();
        Some(Self { frame, spt })
    }

    /// Detach the victim from its owner, saving its contents if they cannot
    /// be reproduced otherwise. On failure the victim is left as it was.
    fn page_out(mut self, pool: &UserPool, swap: &SwapManager) -> Result<(), VmError> {
        let Frame {
            owner,
            upage,
            kpage,
            ..
        } = self.frame;
        let (upage, kpage) = (*upage, *kpage);
        let (accessed, dirty) = {
            let mut page_dir = owner.page_dir();
            let bits = (page_dir.is_accessed(upage), page_dir.is_dirty(upage));
            page_dir.unmap(upage);
            bits
        };

        let Some(entry) = self.spt.lookup_mut(upage) else {
            warn!("pid {}: evicted {upage:#x} has no page entry", owner.pid());
            return Ok(());
        };
        if !dirty && !entry.is_anonymous() {
            entry.evict_clean();
            debug!("pid {}: evicted clean page {upage:#x}", owner.pid());
            return Ok(());
        }

        let stored = swap.store(&pool.frame(kpage));
        match stored {
            Ok(slot) => {
                entry.swap_out(slot);
                debug!("pid {}: evicted {upage:#x} to swap {slot}", owner.pid());
                Ok(())
            }
            Err(e) => {
                let mut page_dir = owner.page_dir();
                if page_dir.map(upage, kpage, entry.writable()) {
                    page_dir.set_accessed(upage, accessed);
                    page_dir.set_dirty(upage, dirty);
                } else {
                    error!("pid {}: could not restore {upage:#x}", owner.pid());
                }
                Err(e.into())
            }
        }
    }
}

/// The system-wide frame table, with the user pool it hands frames out of.
pub struct FrameTable {
    frames: Mutex<Frames>,
    pool: UserPool,
}

impl FrameTable {
    pub fn new(user_frames: usize) -> Self {
        Self::with_policy(user_frames, Box::new(Clock::default()))
    }

    pub fn with_policy(user_frames: usize, policy: Box<dyn ReplacementPolicy>) -> Self {
        Self {
            frames: Mutex::new(Frames {
                slots: Vec::new(),
                vacant: Vec::new(),
                by_page: BTreeMap::new(),
                by_kpage: BTreeMap::new(),
                policy,
            }),
            pool: UserPool::new(user_frames),
        }
    }

    pub fn pool(&self) -> &UserPool {
        &self.pool
    }

    /// Get a frame for `owner`'s `upage`, evicting another page if the pool
    /// is exhausted. The frame comes back pinned; [`FrameTable::unpin`] it
    /// once it is mapped.
    ///
    /// While every resident frame is pinned by a page-in still under way,
    /// this spins with the frame table unlocked until one becomes free or
    /// evictable. Only a table with no frames at all is out of memory.
    pub fn acquire(
        &self,
        swap: &SwapManager,
        flags: AllocFlags,
        owner: &Arc<AddressSpace>,
        upage: usize,
    ) -> Result<PhysFrame, VmError> {
        loop {
            let mut frames = self.frames.lock();
            if frames.by_page.contains_key(&(owner.pid(), upage)) {
                return Err(VmError::AlreadyResident(upage));
            }
            let kpage = match self.pool.alloc(flags.zero()) {
                Some(kpage) => kpage,
                None => {
                    let Some(kpage) = self.evict(&mut frames, swap, upage)? else {
                        drop(frames);
                        Spin::relax();
                        continue;
                    };
                    if flags.zero() {
                        self.pool.frame(kpage).fill(0);
                    }
                    kpage
                }
            };
            frames.insert(Frame {
                owner: owner.clone(),
                upage,
                kpage,
                pinned: true,
            });
            trace!("pid {}: {kpage} for {upage:#x}", owner.pid());
            return Ok(kpage);
        }
    }

    /// Free a frame by evicting a resident page. The frame goes straight to
    /// the caller instead of back to the pool. `None` if every frame is
    /// pinned right now.
    fn evict(
        &self,
        frames: &mut Frames,
        swap: &SwapManager,
        upage: usize,
    ) -> Result<Option<PhysFrame>, VmError> {
        if frames.by_page.is_empty() {
            return Err(VmError::OutOfFrames(upage));
        }
        let Some(victim) = frames.policy.select_victim(&frames.slots) else {
            trace!("all frames pinned, waiting to evict for {upage:#x}");
            return Ok(None);
        };
        VictimPage::lock(frames, victim)
            .ok_or(VmError::OutOfFrames(upage))?
            .page_out(&self.pool, swap)?;
        let frame = frames.remove(victim).ok_or(VmError::OutOfFrames(upage))?;
        Ok(Some(frame.kpage))
    }

    /// Make `kpage` evictable again.
    pub fn unpin(&self, kpage: PhysFrame) {
        if let Some(frame) = self.frames.lock().get_mut(kpage) {
            frame.pinned = false;
        }
    }

    /// Return `kpage` to the pool. Its mapping must already be gone or never
    /// have been installed. Frames not in the table are ignored.
    pub fn release(&self, kpage: PhysFrame) {
        let mut frames = self.frames.lock();
        let Some(&idx) = frames.by_kpage.get(&kpage) else {
            trace!("release of untracked {kpage}");
            return;
        };
        frames.remove(idx);
        self.pool.free(kpage);
    }

    /// Take `owner`'s resident `upage` out of memory: unmap it, copy its
    /// contents out and free the frame. `None` if the page is not resident.
    pub fn reclaim(&self, owner: &AddressSpace, upage: usize) -> Option<Reclaimed> {
        let mut frames = self.frames.lock();
        let idx = *frames.by_page.get(&(owner.pid(), upage))?;
        let frame = frames.remove(idx)?;
        let dirty = {
            let mut page_dir = owner.page_dir();
            let dirty = page_dir.is_dirty(upage);
            page_dir.unmap(upage);
            dirty
        };
        let contents = Box::new(*self.pool.frame(frame.kpage));
        self.pool.free(frame.kpage);
        Some(Reclaimed { dirty, contents })
    }

    /// Unmap and free every frame `owner` holds. Returns how many there were.
    pub fn release_all(&self, owner: &AddressSpace) -> usize {
        let mut frames = self.frames.lock();
        let pid = owner.pid();
        let owned: Vec<usize> = frames
            .by_page
            .range((pid, 0)..=(pid, usize::MAX))
            .map(|(_, &idx)| idx)
            .collect();
        let mut page_dir = owner.page_dir();
        for &idx in &owned {
            if let Some(frame) = frames.remove(idx) {
                page_dir.unmap(frame.upage);
                self.pool.free(frame.kpage);
            }
        }
        owned.len()
    }

    /// Number of resident pages.
    pub fn len(&self) -> usize {
        self.frames.lock().by_page.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every resident page as (owner, upage), in order.
    pub fn resident_pages(&self) -> Vec<(Pid, usize)> {
        self.frames.lock().by_page.keys().copied().collect()
    }

    pub fn is_pinned(&self, kpage: PhysFrame) -> Option<bool> {
        self.frames.lock().get_mut(kpage).map(|frame| frame.pinned)
    }
}

impl fmt::Display for FrameTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frames = self.frames.lock();
        writeln!(
            f,
            "{} frames in use, {} free",
            frames.by_page.len(),
            self.pool.free_frames()
        )?;
        for frame in frames.iter() {
            writeln!(
                f,
                "  pid {:>3} {:#010x} -> {}{}",
                frame.owner.pid(),
                frame.upage,
                frame.kpage,
                if frame.pinned { " (pinned)" } else { "" }
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{
        page::{PageEntry, PageSource},
        test_support::{read_byte, space, touch, vm},
        SwapError,
    };
    use alloc::{format, vec};

    fn zero_pages(space: &AddressSpace, upages: &[usize]) {
        for &upage in upages {
            space.register(PageEntry::zero(upage, true)).unwrap();
        }
    }

    #[test]
    fn clock_skips_accessed_frames() {
        let vm = vm(2, 4);
        let p = space(&vm);
        zero_pages(&p, &[0x1000, 0x2000, 0x3000]);
        p.realize(&vm, 0x1000).unwrap();
        p.realize(&vm, 0x2000).unwrap();
        p.page_dir().set_accessed(0x2000, true);

        p.realize(&vm, 0x3000).unwrap();
        let pid = p.pid();
        assert_eq!(vm.frames().resident_pages(), [(pid, 0x2000), (pid, 0x3000)]);

        // Clean zero page: dropped, not swapped.
        let spt = p.spt();
        let evicted = spt.lookup(0x1000).unwrap();
        assert!(!evicted.is_loaded());
        assert!(matches!(evicted.source(), PageSource::Zero));
        assert_eq!(vm.swap().used_slots(), 0);
        assert!(p.page_dir().translate(0x1000).is_none());
    }

    #[test]
    fn accessed_frame_gets_a_second_chance() {
        let vm = vm(2, 4);
        let p = space(&vm);
        zero_pages(&p, &[0x1000, 0x2000, 0x3000]);
        p.realize(&vm, 0x1000).unwrap();
        p.realize(&vm, 0x2000).unwrap();
        p.page_dir().set_accessed(0x1000, true);

        p.realize(&vm, 0x3000).unwrap();
        let pid = p.pid();
        assert_eq!(vm.frames().resident_pages(), [(pid, 0x1000), (pid, 0x3000)]);
        // The sweep cleared the bit it passed over.
        assert!(!p.page_dir().is_accessed(0x1000));
    }

    #[test]
    fn dirty_victim_goes_to_swap() {
        let vm = vm(2, 4);
        let p = space(&vm);
        zero_pages(&p, &[0x1000, 0x2000, 0x3000]);
        p.realize(&vm, 0x1000).unwrap();
        p.realize(&vm, 0x2000).unwrap();
        touch(&vm, &p, 0x1000, 0x5A);
        p.page_dir().set_accessed(0x1000, false);

        p.realize(&vm, 0x3000).unwrap();
        assert!(matches!(
            p.spt().lookup(0x1000).unwrap().source(),
            PageSource::Swap(Some(_))
        ));
        assert_eq!(vm.swap().used_slots(), 1);

        // Bringing it back consumes the slot and restores the contents.
        p.realize(&vm, 0x1000).unwrap();
        assert_eq!(read_byte(&vm, &p, 0x1000), 0x5A);
        assert_eq!(vm.swap().used_slots(), 0);
        let spt = p.spt();
        let entry = spt.lookup(0x1000).unwrap();
        assert!(entry.is_loaded());
        assert!(matches!(entry.source(), PageSource::Swap(None)));
    }

    #[test]
    fn reloaded_page_is_swapped_again_even_when_clean() {
        let vm = vm(1, 4);
        let p = space(&vm);
        zero_pages(&p, &[0x1000, 0x2000]);
        p.realize(&vm, 0x1000).unwrap();
        touch(&vm, &p, 0x1000, 0x11);
        p.realize(&vm, 0x2000).unwrap();
        touch(&vm, &p, 0x2000, 0x22);

        // 0x2000 goes to swap while 0x1000 still holds its first slot.
        p.realize(&vm, 0x1000).unwrap();
        let held = match p.spt().lookup(0x2000).unwrap().source() {
            PageSource::Swap(Some(slot)) => *slot,
            other => panic!("unexpected source {other:?}"),
        };
        assert!(!p.page_dir().is_dirty(0x1000));

        // Not dirty since it came back, yet its only copy is in memory.
        p.realize(&vm, 0x2000).unwrap();
        let slot = match p.spt().lookup(0x1000).unwrap().source() {
            PageSource::Swap(Some(slot)) => *slot,
            other => panic!("unexpected source {other:?}"),
        };
        assert!(vm.swap().is_occupied(slot));
        assert!(!vm.swap().is_occupied(held));
        assert_eq!(vm.swap().used_slots(), 1);

        p.realize(&vm, 0x1000).unwrap();
        assert_eq!(read_byte(&vm, &p, 0x1000), 0x11);
    }

    #[test]
    fn pinned_frames_are_never_evicted() {
        let vm = vm(2, 4);
        let p = space(&vm);
        zero_pages(&p, &[0x1000, 0x2000, 0x3000]);
        let kpage = vm
            .frames()
            .acquire(vm.swap(), AllocFlags::DEFAULT, &p, 0x1000)
            .unwrap();
        assert_eq!(vm.frames().is_pinned(kpage), Some(true));
        p.realize(&vm, 0x2000).unwrap();
        p.page_dir().set_accessed(0x2000, true);

        // The sweep passes the pinned frame twice and takes the other one.
        p.realize(&vm, 0x3000).unwrap();
        let pid = p.pid();
        assert_eq!(vm.frames().resident_pages(), [(pid, 0x1000), (pid, 0x3000)]);
        assert_eq!(vm.frames().is_pinned(kpage), Some(true));

        vm.frames().unpin(kpage);
        assert_eq!(vm.frames().is_pinned(kpage), Some(false));
    }

    #[test]
    fn clock_hand_survives_removals() {
        let vm = vm(0, 4);
        let p = space(&vm);
        let frame = |upage: usize, number: usize| {
            assert!(p.page_dir().map(upage, PhysFrame::new(number), true));
            Some(Frame {
                owner: p.clone(),
                upage,
                kpage: PhysFrame::new(number),
                pinned: false,
            })
        };
        let mut slots = vec![frame(0x1000, 0), None, frame(0x3000, 2)];
        p.page_dir().set_accessed(0x1000, true);

        let mut clock = Clock::default();
        assert_eq!(clock.select_victim(&slots), Some(2));
        assert_eq!(clock.hand(), 0);
        assert!(!p.page_dir().is_accessed(0x1000));

        // The hand stays put when the victim's slot is vacated.
        slots[2] = None;
        assert_eq!(clock.select_victim(&slots), Some(0));
        assert_eq!(clock.hand(), 1);

        slots[0].as_mut().unwrap().pinned = true;
        assert_eq!(clock.select_victim(&slots), None);
        assert_eq!(clock.hand(), 1);
    }

    #[test]
    fn empty_pool_is_fatal() {
        let vm = vm(0, 4);
        let p = space(&vm);
        zero_pages(&p, &[0x1000]);
        let err = p.realize(&vm, 0x1000).unwrap_err();
        assert!(err.is_fatal());
        assert!(!p.spt().lookup(0x1000).unwrap().is_loaded());
    }

    #[test]
    fn full_swap_fails_the_request_and_keeps_the_victim() {
        let vm = vm(1, 0);
        let p = space(&vm);
        zero_pages(&p, &[0x1000, 0x2000]);
        let kpage = p.realize(&vm, 0x1000).unwrap();
        touch(&vm, &p, 0x1000, 0x77);
        p.page_dir().set_accessed(0x1000, false);

        let err = p.realize(&vm, 0x2000).unwrap_err();
        assert_eq!(err, VmError::Swap(SwapError::Full));
        assert!(!err.is_fatal());

        assert_eq!(p.page_dir().translate(0x1000), Some(kpage));
        assert!(p.page_dir().is_dirty(0x1000));
        assert_eq!(read_byte(&vm, &p, 0x1000), 0x77);
        assert!(p.spt().lookup(0x1000).unwrap().is_loaded());
        assert!(!p.spt().lookup(0x2000).unwrap().is_loaded());
        assert_eq!(vm.frames().len(), 1);
    }

    #[test]
    fn victims_of_other_processes() {
        let vm = vm(1, 4);
        let a = space(&vm);
        let b = space(&vm);
        zero_pages(&a, &[0x1000]);
        zero_pages(&b, &[0x1000]);
        a.realize(&vm, 0x1000).unwrap();
        touch(&vm, &a, 0x1000, 0xAA);
        a.page_dir().set_accessed(0x1000, false);

        b.realize(&vm, 0x1000).unwrap();
        assert_eq!(vm.frames().resident_pages(), [(b.pid(), 0x1000)]);
        assert!(a.page_dir().translate(0x1000).is_none());
        assert!(matches!(
            a.spt().lookup(0x1000).unwrap().source(),
            PageSource::Swap(Some(_))
        ));
        assert_eq!(read_byte(&vm, &b, 0x1000), 0);
    }

    #[test]
    fn release_and_reclaim() {
        let vm = vm(2, 4);
        let p = space(&vm);
        zero_pages(&p, &[0x1000, 0x2000]);
        let first = p.realize(&vm, 0x1000).unwrap();
        p.realize(&vm, 0x2000).unwrap();
        touch(&vm, &p, 0x2000, 0x42);

        p.page_dir().unmap(0x1000);
        vm.frames().release(first);
        vm.frames().release(first);
        assert_eq!(vm.frames().pool().free_frames(), 1);

        let reclaimed = vm.frames().reclaim(&p, 0x2000).unwrap();
        assert!(reclaimed.dirty);
        assert!(reclaimed.contents.iter().all(|&b| b == 0x42));
        assert!(p.page_dir().translate(0x2000).is_none());
        assert!(vm.frames().reclaim(&p, 0x2000).is_none());
        assert!(vm.frames().is_empty());
        assert_eq!(vm.frames().pool().free_frames(), 2);
    }

    #[test]
    fn release_all_only_touches_the_owner() {
        let vm = vm(4, 4);
        let a = space(&vm);
        let b = space(&vm);
        zero_pages(&a, &[0x1000, 0x2000]);
        zero_pages(&b, &[0x1000]);
        a.realize(&vm, 0x1000).unwrap();
        a.realize(&vm, 0x2000).unwrap();
        b.realize(&vm, 0x1000).unwrap();

        assert_eq!(vm.frames().release_all(&a), 2);
        assert_eq!(vm.frames().resident_pages(), [(b.pid(), 0x1000)]);
        assert!(a.page_dir().translate(0x1000).is_none());
        assert!(b.page_dir().translate(0x1000).is_some());
        assert_eq!(vm.frames().pool().free_frames(), 3);
    }

    #[test]
    fn display() {
        let vm = vm(2, 1);
        let p = space(&vm);
        zero_pages(&p, &[0x1000]);
        p.realize(&vm, 0x1000).unwrap();
        assert_eq!(
            format!("{}", vm.frames()),
            format!(
                "1 frames in use, 1 free\n  pid {:>3} 0x00001000 -> frame 0x0\n",
                p.pid()
            )
        );
    }
}
