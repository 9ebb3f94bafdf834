//! The slice of the file layer the VM core relies on.

pub mod mem_file;

pub use mem_file::MemFile;

use alloc::sync::Arc;

/// An open file.
///
/// Reads and writes are positional, so handles never share a cursor.
/// Dropping the last reference to a handle closes it.
pub trait File: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read, which is short only at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Write up to `buf.len()` bytes starting at `offset`. Files do not grow,
    /// so the count is short when the write would pass end of file.
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;

    /// Length of the file in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a new, independent handle to the same file.
    fn reopen(&self) -> Arc<dyn File>;
}
