pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = MB * KB;
pub const SECTOR_SIZE: u32 = 512;
