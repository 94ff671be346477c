//! Stack growth.
//!
//! Every process starts with a zero-fill, writable segment spanning the
//! top 8 MiB of user space. Pages in it materialise on faults that look
//! like stack accesses: within 64 bytes of the stack pointer, the reach
//! of the push instructions that trap before moving esp.

use x86_64::VirtAddr;

use super::page::SuppPageTable;
use crate::vaddr::{PHYS_BASE, STACK_BASE, STACK_SIZE};

/// How far from the stack pointer a fault may land and still grow the
/// stack.
const STACK_SLACK: i64 = 64;

/// Creates the stack segment. Fails if something already overlaps the
/// stack region.
pub(crate) fn init_stack(spt: &SuppPageTable) -> bool {
    spt.create_segment(STACK_BASE, true, STACK_SIZE).is_some()
}

/// True if `va` falls inside the stack region.
pub(crate) fn is_stack_addr(va: VirtAddr) -> bool {
    STACK_BASE <= va && va < PHYS_BASE
}

/// The growth heuristic: accept the fault iff it lands within
/// [`STACK_SLACK`] bytes of the stack pointer, on either side.
pub(crate) fn should_grow(fault_addr: VirtAddr, esp: VirtAddr) -> bool {
    let distance = fault_addr.as_u64() as i64 - esp.as_u64() as i64;
    distance.abs() < STACK_SLACK
}
