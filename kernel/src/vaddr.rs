//! User virtual address layout and page arithmetic.
//!
//! User virtual memory spans [0, PHYS_BASE); everything at or above
//! PHYS_BASE belongs to the kernel.

use x86_64::VirtAddr;

/// Bytes in a page.
pub const PGSIZE: u64 = 4096;

/// First address past the user virtual address space.
pub const PHYS_BASE: VirtAddr = VirtAddr::new_truncate(0xc000_0000);

/// Maximum size of a user stack.
pub const STACK_SIZE: u64 = 8 * 1024 * 1024;

/// Lowest address of the user stack region.
pub const STACK_BASE: VirtAddr = VirtAddr::new_truncate(0xc000_0000 - STACK_SIZE);

/// Rounds down to the start of the containing page.
pub fn pg_round_down(va: VirtAddr) -> VirtAddr {
    va.align_down(PGSIZE)
}

/// Rounds up to the nearest page boundary.
pub fn pg_round_up(va: VirtAddr) -> VirtAddr {
    va.align_up(PGSIZE)
}

/// Offset of `va` within its page.
pub fn pg_ofs(va: VirtAddr) -> u64 {
    va.as_u64() & (PGSIZE - 1)
}

/// True if `va` lies in user space.
pub fn is_user_vaddr(va: VirtAddr) -> bool {
    va < PHYS_BASE
}
