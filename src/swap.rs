// SPDX-License-Identifier: MIT OR Apache-2.0

//! The anonymous swap store (§4.2): a bitmap-allocated pool of page-sized
//! slots on a block device.
//!
//! Grounded in Pintos `vm/anon.c`'s `swap_table`/`SECTORS_PER_PAGE` and in
//! the teacher's own `kernel/src/swap.rs`, which names its lock
//! `bitmap_lock` for exactly the same scan-and-flip allocator. `bitvec` is
//! used for the bitmap itself (no fragmentation concerns -- every slot is
//! one page, so a flat bit per slot is all that's needed).

use bitvec::prelude::*;
use log::trace;
use parking_lot::Mutex;

use crate::disk::BlockDevice;
use crate::error::{VmError, VmResult};

/// Index of a single page-sized slot on the swap disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(usize);

/// Owns the swap disk and the bitmap tracking which slots are occupied,
/// behind two independent locks. `bitmap_lock` from the distilled spec is
/// the `bitmap` mutex: slot selection happens under it and is released
/// before any disk I/O is issued. The disk itself sits behind its own
/// mutex (`BlockDevice::read_sector`/`write_sector` need `&mut self`) so
/// that per §5 no thread ever holds `bitmap_lock` while an I/O is in
/// flight.
pub struct SwapStore<D> {
    sectors_per_page: usize,
    bitmap: Mutex<BitVec>,
    disk: Mutex<D>,
}

impl<D: BlockDevice> SwapStore<D> {
    pub fn new(disk: D, sectors_per_page: usize) -> Self {
        let slot_count = disk.sector_count() / sectors_per_page;
        SwapStore { sectors_per_page, bitmap: Mutex::new(bitvec![0; slot_count]), disk: Mutex::new(disk) }
    }

    /// Scan-and-flip: find the first cleared bit and set it atomically.
    /// Swap exhaustion is fatal to the evicting page per §4.2; callers
    /// must abort the eviction on `Err`.
    pub fn slot_alloc(&self) -> VmResult<SwapSlot> {
        let mut bitmap = self.bitmap.lock();
        match bitmap.first_zero() {
            Some(idx) => {
                bitmap.set(idx, true);
                trace!("swap: allocated slot {idx}");
                Ok(SwapSlot(idx))
            }
            None => Err(VmError::SwapExhausted),
        }
    }

    pub fn slot_free(&self, slot: SwapSlot) {
        self.bitmap.lock().set(slot.0, false);
        trace!("swap: freed slot {}", slot.0);
    }

    pub fn is_occupied(&self, slot: SwapSlot) -> bool { self.bitmap.lock()[slot.0] }

    /// Read a whole slot's worth of sectors into `buf`, which must be
    /// exactly one page long.
    pub fn slot_read(&self, slot: SwapSlot, buf: &mut [u8]) {
        let mut disk = self.disk.lock();
        let sector_size = disk.sector_size();
        let base = slot.0 * self.sectors_per_page;
        for i in 0..self.sectors_per_page {
            let start = i * sector_size;
            disk.read_sector(base + i, &mut buf[start..start + sector_size]);
        }
    }

    /// Write a whole page-sized buffer out to `slot`.
    pub fn slot_write(&self, slot: SwapSlot, buf: &[u8]) {
        let mut disk = self.disk.lock();
        let sector_size = disk.sector_size();
        let base = slot.0 * self.sectors_per_page;
        for i in 0..self.sectors_per_page {
            let start = i * sector_size;
            disk.write_sector(base + i, &buf[start..start + sector_size]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;

    fn store(slots: usize) -> SwapStore<MemDisk> {
        let disk = MemDisk::new(slots * 8, 512);
        SwapStore::new(disk, 8)
    }

    #[test]
    fn alloc_is_first_fit() {
        let s = store(4);
        let a = s.slot_alloc().unwrap();
        let b = s.slot_alloc().unwrap();
        assert_ne!(a, b);
        s.slot_free(a);
        let c = s.slot_alloc().unwrap();
        assert_eq!(a, c, "freed slot should be reused first");
    }

    #[test]
    fn exhaustion_is_an_error() {
        let s = store(1);
        s.slot_alloc().unwrap();
        assert!(matches!(s.slot_alloc(), Err(VmError::SwapExhausted)));
    }

    #[test]
    fn round_trips_a_page() {
        let s = store(2);
        let slot = s.slot_alloc().unwrap();
        let page = vec![0xABu8; 4096];
        s.slot_write(slot, &page);
        let mut back = vec![0u8; 4096];
        s.slot_read(slot, &mut back);
        assert_eq!(page, back);
    }
}
