//! Virtual memory.
//!
//! The supplementary page table ([`page`]) says what each user address
//! range is backed by; the frame table ([`frame`]) owns physical frames
//! and evicts with a pinned-aware second-chance clock; [`swap`] parks
//! evicted anonymous pages on the swap block device; [`growth`] decides
//! when a fault below the stack may grow it.

pub mod frame;
pub mod growth;
pub mod page;
pub mod swap;

use x86_64::VirtAddr;

use crate::userprog::Process;
use crate::vaddr::is_user_vaddr;

/// An unservable user-memory access. The faulting thread is killed by
/// the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fault;

/// Page-fault entry: resolves `fault_addr` for `process` or reports the
/// access as invalid. Returns the kernel address of the mapped frame.
pub(crate) fn handle_fault(process: &Process, fault_addr: VirtAddr, write: bool) -> Result<usize, Fault> {
    fault_common(process, fault_addr, write, false)
}

/// Like [`handle_fault`], but the frame stays pinned for the caller.
pub(crate) fn handle_fault_pinned(
    process: &Process,
    fault_addr: VirtAddr,
    write: bool,
) -> Result<usize, Fault> {
    fault_common(process, fault_addr, write, true)
}

fn fault_common(
    process: &Process,
    fault_addr: VirtAddr,
    write: bool,
    keep_pinned: bool,
) -> Result<usize, Fault> {
    if fault_addr.as_u64() == 0 || !is_user_vaddr(fault_addr) {
        return Err(Fault);
    }
    let segment = process.spt.lookup(fault_addr).ok_or(Fault)?;
    if write && !segment.writable {
        return Err(Fault);
    }
    // A first touch inside the stack region only grows the stack when
    // it looks like a stack access. Pages touched before — swapped out
    // since — always come back.
    if growth::is_stack_addr(fault_addr)
        && !segment.is_touched(crate::vaddr::pg_round_down(fault_addr))
        && !growth::should_grow(fault_addr, process.user_esp())
    {
        return Err(Fault);
    }
    page::map_addr(&process.spt, &process.pagedir, fault_addr, keep_pinned)
}
