use crate::sizes::{KB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// Number of block sectors backing one page of swap.
pub const SECTORS_PER_PAGE: u32 = PAGE_FRAME_SIZE as u32 / SECTOR_SIZE;

/// Maximum number of pages the user stack may grow to.
pub const STACK_PAGES: usize = 2000;

/// Lowest address the user stack may grow down to.
pub const STACK_LIMIT: usize = OFFSET - PAGE_FRAME_SIZE * STACK_PAGES;

/// How far below the stack pointer a fault may land and still count as a
/// stack access. `pusha` writes 32 bytes before moving `esp`.
pub const STACK_SLACK: usize = 32;

#[inline]
pub const fn pg_ofs(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_round_up(addr: usize) -> usize {
    pg_round_down(addr + PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    pg_ofs(addr) == 0
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(pg_round_down(0x1fff), 0x1000);
        assert_eq!(pg_round_down(0x2000), 0x2000);
        assert_eq!(pg_round_up(0x1001), 0x2000);
        assert_eq!(pg_round_up(0x1000), 0x1000);
        assert_eq!(pg_ofs(0x1234), 0x234);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3004));
    }

    #[test]
    fn stack_reservation_is_user_memory() {
        assert!(is_user_vaddr(STACK_LIMIT));
        assert!(is_user_vaddr(OFFSET - 1));
        assert!(!is_user_vaddr(OFFSET));
        assert_eq!(SECTORS_PER_PAGE, 8);
    }
}
