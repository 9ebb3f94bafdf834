pub mod ram_disk;

pub use ram_disk::RamDisk;
