//! Checked access to user memory.
//!
//! Every byte the kernel moves in or out of a user address space goes
//! through here: the page directory supplies the frame, missing pages
//! are faulted in through the supplementary page table, and the
//! accessed/dirty bits are set so eviction sees the traffic.
//!
//! Plain copies are safe against eviction without pinning because the
//! processor is single and cooperative: between translating an address
//! and touching the bytes the kernel neither blocks nor yields, so no
//! evictor can run. The exception is file I/O into a user buffer, which
//! sleeps with the filesystem lock held — for that, [`pin_for_io`]
//! faults the buffer in and pins its frames first.

use alloc::string::String;
use alloc::vec::Vec;

use x86_64::VirtAddr;

use super::Process;
use crate::vaddr::{is_user_vaddr, pg_ofs, pg_round_down, PGSIZE};
use crate::vm::{self, Fault};

/// Validates `[va, va + len)` without touching it: every byte must be
/// below the kernel base and either resident or covered by a segment
/// (writable, if the access will write).
pub(crate) fn check_range(p: &Process, va: VirtAddr, len: usize, write: bool) -> Result<(), Fault> {
    if len == 0 {
        return Ok(());
    }
    if va.as_u64() == 0 {
        return Err(Fault);
    }
    let end = VirtAddr::new(va.as_u64().checked_add(len as u64).ok_or(Fault)?);
    if !is_user_vaddr(va) || !is_user_vaddr(end - 1u64) {
        return Err(Fault);
    }
    let mut upage = pg_round_down(va);
    while upage < end {
        let resident_ok = match p.pagedir.entry(upage) {
            Some(pte) => !write || pte.flags.contains(super::pagedir::PteFlags::WRITABLE),
            None => match p.spt.lookup(upage) {
                Some(seg) => !write || seg.writable,
                None => false,
            },
        };
        if !resident_ok {
            return Err(Fault);
        }
        upage = upage + PGSIZE;
    }
    Ok(())
}

/// Translates one user address to a kernel pointer, faulting the page in
/// if needed and recording the access.
fn translate(p: &Process, va: VirtAddr, write: bool) -> Result<*mut u8, Fault> {
    if va.as_u64() == 0 || !is_user_vaddr(va) {
        return Err(Fault);
    }
    let upage = pg_round_down(va);
    let pte = match p.pagedir.entry(upage) {
        Some(pte) => pte,
        None => {
            vm::handle_fault(p, va, write)?;
            p.pagedir.entry(upage).ok_or(Fault)?
        }
    };
    if write && !pte.flags.contains(super::pagedir::PteFlags::WRITABLE) {
        return Err(Fault);
    }
    p.pagedir.mark_access(upage, write);
    Ok((pte.kpage + pg_ofs(va) as usize) as *mut u8)
}

/// Copies user memory into `buf`.
pub(crate) fn copy_from_user(p: &Process, va: VirtAddr, buf: &mut [u8]) -> Result<(), Fault> {
    let mut done = 0;
    while done < buf.len() {
        let at = va + done as u64;
        let chunk = chunk_len(at, buf.len() - done);
        let src = translate(p, at, false)?;
        unsafe { core::ptr::copy_nonoverlapping(src, buf[done..].as_mut_ptr(), chunk) };
        done += chunk;
    }
    Ok(())
}

/// Copies `buf` into user memory.
pub(crate) fn copy_to_user(p: &Process, va: VirtAddr, buf: &[u8]) -> Result<(), Fault> {
    let mut done = 0;
    while done < buf.len() {
        let at = va + done as u64;
        let chunk = chunk_len(at, buf.len() - done);
        let dst = translate(p, at, true)?;
        unsafe { core::ptr::copy_nonoverlapping(buf[done..].as_ptr(), dst, chunk) };
        done += chunk;
    }
    Ok(())
}

/// Bytes from `va` to the end of its page, capped at `remaining`.
fn chunk_len(va: VirtAddr, remaining: usize) -> usize {
    ((PGSIZE - pg_ofs(va)) as usize).min(remaining)
}

pub(crate) fn read_u32(p: &Process, va: VirtAddr) -> Result<u32, Fault> {
    let mut bytes = [0u8; 4];
    copy_from_user(p, va, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

pub(crate) fn write_u32(p: &Process, va: VirtAddr, value: u32) -> Result<(), Fault> {
    copy_to_user(p, va, &value.to_le_bytes())
}

/// Reads a NUL-terminated string of at most `max` bytes.
pub(crate) fn read_cstr(p: &Process, va: VirtAddr, max: usize) -> Result<String, Fault> {
    let mut bytes = Vec::new();
    for i in 0..max {
        let mut byte = [0u8; 1];
        copy_from_user(p, va + i as u64, &mut byte)?;
        if byte[0] == 0 {
            return String::from_utf8(bytes).map_err(|_| Fault);
        }
        bytes.push(byte[0]);
    }
    Err(Fault)
}

/// User buffer pages faulted in and pinned against eviction. Unpins on
/// drop, on every exit path.
pub(crate) struct PinnedPages {
    kpages: Vec<usize>,
}

impl Drop for PinnedPages {
    fn drop(&mut self) {
        for &kpage in &self.kpages {
            vm::frame::unpin(kpage);
        }
    }
}

/// Faults in and pins every page of `[va, va + len)`, returning the pin
/// guard and the kernel-space chunks covering the range in order.
///
/// Must be called before taking the filesystem lock: a pinned buffer is
/// what lets the caller sleep in file I/O without the evictor pulling
/// the frame out from under it.
pub(crate) fn pin_for_io(
    p: &Process,
    va: VirtAddr,
    len: usize,
    write: bool,
) -> Result<(PinnedPages, Vec<(*mut u8, usize)>), Fault> {
    let mut pinned = PinnedPages { kpages: Vec::new() };
    let mut chunks = Vec::new();
    let mut done = 0;
    while done < len {
        let at = va + done as u64;
        let chunk = chunk_len(at, len - done);
        let kpage = pin_page(p, at, write)?;
        pinned.kpages.push(kpage);
        p.pagedir.mark_access(pg_round_down(at), write);
        chunks.push(((kpage + pg_ofs(at) as usize) as *mut u8, chunk));
        done += chunk;
    }
    Ok((pinned, chunks))
}

/// Pins the frame behind the page containing `at`, faulting it in first
/// if needed. The fault carries the precise address, which the stack
/// growth heuristic judges. The re-check after pinning closes the
/// window where the evictor pulled the page between lookup and pin.
fn pin_page(p: &Process, at: VirtAddr, write: bool) -> Result<usize, Fault> {
    let upage = pg_round_down(at);
    loop {
        match p.pagedir.entry(upage) {
            Some(pte) => {
                if write && !pte.flags.contains(super::pagedir::PteFlags::WRITABLE) {
                    return Err(Fault);
                }
                if vm::frame::pin(pte.kpage) {
                    if p.pagedir.get_page(upage) == Some(pte.kpage) {
                        return Ok(pte.kpage);
                    }
                    vm::frame::unpin(pte.kpage);
                }
            }
            None => {
                let kpage = vm::handle_fault_pinned(p, at, write)?;
                return Ok(kpage);
            }
        }
    }
}
