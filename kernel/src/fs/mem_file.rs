use super::File;
use crate::sync::Mutex;
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

/// A file that lives in kernel memory.
///
/// Handles opened with [`File::reopen`] share contents, and the number of
/// open handles is tracked so callers can check that every handle they
/// opened was closed.
pub struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    handles: Arc<AtomicUsize>,
}

impl MemFile {
    pub fn open(contents: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            data: Arc::new(Mutex::new(contents.to_vec())),
            handles: Arc::new(AtomicUsize::new(1)),
        })
    }

    /// Number of handles to this file that are still open.
    pub fn open_handles(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl File for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= data.len() {
            return 0;
        }
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        count
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let mut data = self.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= data.len() {
            return 0;
        }
        let count = buf.len().min(data.len() - start);
        data[start..start + count].copy_from_slice(&buf[..count]);
        count
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn reopen(&self) -> Arc<dyn File> {
        self.handles.fetch_add(1, Ordering::SeqCst);
        Arc::new(Self {
            data: self.data.clone(),
            handles: self.handles.clone(),
        })
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        self.handles.fetch_sub(1, Ordering::SeqCst);
    }
}
