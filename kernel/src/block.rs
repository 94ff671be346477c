//! Block devices.
//!
//! The kernel addresses persistent storage in 512-byte sectors through
//! the [`BlockDevice`] trait and finds devices by role. Real controller
//! drivers live outside this crate; [`MemDisk`] is the RAM-backed device
//! the hosted kernel runs on.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

pub const SECTOR_SIZE: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Swap,
}

pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> u64;
    fn read_sector(&self, sector: u64, buf: &mut [u8]);
    fn write_sector(&self, sector: u64, buf: &[u8]);
}

/// A RAM-backed block device.
pub struct MemDisk {
    sectors: Mutex<Vec<u8>>,
    count: u64,
}

impl MemDisk {
    pub fn new(sector_count: u64) -> MemDisk {
        MemDisk {
            sectors: Mutex::new(vec![0u8; sector_count as usize * SECTOR_SIZE]),
            count: sector_count,
        }
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> u64 {
        self.count
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) {
        assert!(sector < self.count, "sector out of range");
        assert_eq!(buf.len(), SECTOR_SIZE);
        let data = self.sectors.lock();
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) {
        assert!(sector < self.count, "sector out of range");
        assert_eq!(buf.len(), SECTOR_SIZE);
        let mut data = self.sectors.lock();
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
    }
}

static DEVICES: Mutex<BTreeMap<Role, Arc<dyn BlockDevice>>> = Mutex::new(BTreeMap::new());

/// Registers the device serving `role`, replacing any previous one.
pub fn register(role: Role, device: Arc<dyn BlockDevice>) {
    DEVICES.lock().insert(role, device);
}

/// The device registered for `role`.
pub fn by_role(role: Role) -> Option<Arc<dyn BlockDevice>> {
    DEVICES.lock().get(&role).cloned()
}

pub(crate) fn reset() {
    DEVICES.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memdisk_round_trip() {
        let disk = MemDisk::new(8);
        let mut sector = [0xabu8; SECTOR_SIZE];
        disk.write_sector(3, &sector);
        sector.fill(0);
        disk.read_sector(3, &mut sector);
        assert!(sector.iter().all(|&b| b == 0xab));
        disk.read_sector(2, &mut sector);
        assert!(sector.iter().all(|&b| b == 0));
    }
}
