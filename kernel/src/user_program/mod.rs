pub mod loader;
pub mod mmap;
pub mod process;

pub use loader::{LoadError, Segment, SegmentError};
pub use mmap::{MapId, MmapError};
pub use process::{FaultOutcome, Process};
