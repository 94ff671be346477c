//! Per-process page directory.
//!
//! Maps page-aligned user addresses to the kernel address of the frame
//! holding them, with the writable/accessed/dirty state the eviction
//! clock and write-back paths read. The hardware tables that would
//! mirror this live outside the core; all user-memory traffic goes
//! through `usermem`, which keeps the accessed and dirty bits honest.

use alloc::collections::BTreeMap;

use bitflags::bitflags;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::vaddr::pg_ofs;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Pte {
    pub kpage: usize,
    pub flags: PteFlags,
}

pub struct Pagedir {
    entries: Mutex<BTreeMap<VirtAddr, Pte>>,
}

impl Pagedir {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Pagedir {
        Pagedir {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn entry(&self, upage: VirtAddr) -> Option<Pte> {
        debug_assert_eq!(pg_ofs(upage), 0);
        self.entries.lock().get(&upage).copied()
    }

    /// Kernel address of the frame mapped at `upage`, if resident.
    pub fn get_page(&self, upage: VirtAddr) -> Option<usize> {
        self.entry(upage).map(|e| e.kpage)
    }

    /// Installs a mapping. Fails if `upage` is already mapped.
    pub fn set_page(&self, upage: VirtAddr, kpage: usize, writable: bool) -> bool {
        debug_assert_eq!(pg_ofs(upage), 0);
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage) {
            return false;
        }
        let mut flags = PteFlags::empty();
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        entries.insert(upage, Pte { kpage, flags });
        true
    }

    /// Removes a mapping; later accesses fault.
    pub fn clear_page(&self, upage: VirtAddr) {
        self.entries.lock().remove(&upage);
    }

    pub fn is_accessed(&self, upage: VirtAddr) -> bool {
        self.entry(upage)
            .map(|e| e.flags.contains(PteFlags::ACCESSED))
            .unwrap_or(false)
    }

    pub fn set_accessed(&self, upage: VirtAddr, accessed: bool) {
        if let Some(e) = self.entries.lock().get_mut(&upage) {
            e.flags.set(PteFlags::ACCESSED, accessed);
        }
    }

    pub fn is_dirty(&self, upage: VirtAddr) -> bool {
        self.entry(upage)
            .map(|e| e.flags.contains(PteFlags::DIRTY))
            .unwrap_or(false)
    }

    pub fn set_dirty(&self, upage: VirtAddr, dirty: bool) {
        if let Some(e) = self.entries.lock().get_mut(&upage) {
            e.flags.set(PteFlags::DIRTY, dirty);
        }
    }

    /// Records an access, marking the page dirty on writes.
    pub(crate) fn mark_access(&self, upage: VirtAddr, write: bool) {
        if let Some(e) = self.entries.lock().get_mut(&upage) {
            e.flags |= PteFlags::ACCESSED;
            if write {
                e.flags |= PteFlags::DIRTY;
            }
        }
    }

    /// Drops every mapping.
    pub fn destroy(&self) {
        self.entries.lock().clear();
    }

    /// Number of resident pages.
    pub fn resident_pages(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_unmap_and_bits() {
        let pd = Pagedir::new();
        let u = VirtAddr::new(0x8048_000);
        assert!(pd.set_page(u, 0xdead_000, true));
        assert!(!pd.set_page(u, 0xbeef_000, true));
        assert_eq!(pd.get_page(u), Some(0xdead_000));
        assert!(!pd.is_accessed(u));
        pd.mark_access(u, false);
        assert!(pd.is_accessed(u));
        assert!(!pd.is_dirty(u));
        pd.mark_access(u, true);
        assert!(pd.is_dirty(u));
        pd.set_accessed(u, false);
        assert!(!pd.is_accessed(u));
        pd.clear_page(u);
        assert_eq!(pd.get_page(u), None);
    }
}
