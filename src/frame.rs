// SPDX-License-Identifier: MIT OR Apache-2.0

//! The global frame table and clock (second-chance) eviction policy.
//!
//! Mirrors `vm_get_victim` / `vm_evict_frame` / `vm_get_frame` from the
//! Pintos `vm/vm.c` this crate's spec was distilled from, and the
//! frame-list bookkeeping in the teacher's `kernel/src/mem.rs`
//! (`MEMORY_ALLOCATIONS`, `frame_list` et al.) -- but expressed as owned,
//! slotmap-keyed storage instead of an intrusive `list_elem` threaded
//! through a C struct.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

use crate::addr::VirtAddr;
use crate::mmu::Mmu;
use crate::page::Page;
use crate::Pid;

new_key_type! {
    /// Stands in for the kernel-mapped address (`kva`) of the original.
    /// The MMU adapter and the page backends never need the raw bytes
    /// directly addressable; they only ever ask the frame table for the
    /// buffer belonging to a `FrameId`, so the key itself is a perfectly
    /// good non-owning handle.
    pub struct FrameId;
}

/// A physical frame: the fixed-size buffer backing one resident page.
pub struct Frame {
    pub content: Box<[u8]>,
    pub owner: Pid,
    pub va: VirtAddr,
    /// Non-owning link back to the page this frame backs. The SPT owns the
    /// `Arc`; the frame table only ever sees a `Weak`.
    pub page: Weak<Mutex<Page>>,
}

impl Frame {
    fn new(page_size: usize, owner: Pid, va: VirtAddr, page: Weak<Mutex<Page>>) -> Self {
        Frame { content: vec![0u8; page_size].into_boxed_slice(), owner, va, page }
    }
}

/// Global table of resident frames plus the clock hand's scan order.
///
/// `order` holds frame insertion order and doubles as the clock list from
/// the distilled spec; walking it front-to-back and rotating unaccessed
/// entries to the back is exactly the second-chance algorithm.
pub struct FrameTable {
    frames: SlotMap<FrameId, Frame>,
    order: Vec<FrameId>,
    capacity: usize,
}

impl FrameTable {
    pub fn new(capacity: usize) -> Self {
        FrameTable { frames: SlotMap::with_key(), order: Vec::with_capacity(capacity), capacity }
    }

    pub fn len(&self) -> usize { self.frames.len() }

    pub fn is_empty(&self) -> bool { self.frames.is_empty() }

    pub fn get(&self, id: FrameId) -> Option<&Frame> { self.frames.get(id) }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut Frame> { self.frames.get_mut(id) }

    /// Obtain a fresh frame directly from the pool, with no eviction.
    /// Returns `None` if the pool is full; the caller (`VmSystem::alloc_frame`)
    /// is responsible for evicting and retrying.
    pub fn try_alloc(
        &mut self,
        page_size: usize,
        owner: Pid,
        va: VirtAddr,
        page: Weak<Mutex<Page>>,
    ) -> Option<FrameId> {
        if self.frames.len() >= self.capacity {
            return None;
        }
        let id = self.frames.insert(Frame::new(page_size, owner, va, page));
        self.order.push(id);
        Some(id)
    }

    /// Run the clock scan: find the first frame whose owning page is not
    /// accessed, clearing the accessed bit of everything it skips along
    /// the way. Falls back to the head of the list if every frame has been
    /// touched recently. The victim is unlinked from the scan order but
    /// left in the slotmap -- the caller still needs its contents to swap
    /// out, and releases it explicitly via [`FrameTable::release`].
    pub fn select_victim(&mut self, mmu: &mut dyn Mmu) -> Option<FrameId> {
        if self.order.is_empty() {
            return None;
        }
        let mut victim_pos = None;
        for (pos, &id) in self.order.iter().enumerate() {
            let frame = self.frames.get(id)?;
            if mmu.accessed(frame.owner, frame.va) {
                mmu.clear_accessed(frame.owner, frame.va);
            } else {
                victim_pos = Some(pos);
                break;
            }
        }
        let pos = victim_pos.unwrap_or(0);
        Some(self.order.remove(pos))
    }

    /// Drop a frame's contents and return its slot to the pool. Used both
    /// after a successful eviction and when a page is destroyed while
    /// still resident.
    pub fn release(&mut self, id: FrameId) {
        if let Some(pos) = self.order.iter().position(|&x| x == id) {
            self.order.remove(pos);
        }
        self.frames.remove(id);
    }

    /// All frames currently owned by `pid`, used by teardown to assert
    /// that nothing of the departing process remains resident.
    pub fn frames_owned_by(&self, pid: Pid) -> Vec<FrameId> {
        self.frames.iter().filter(|(_, f)| f.owner == pid).map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::TestMmu;

    #[test]
    fn pool_respects_capacity() {
        let mut table = FrameTable::new(2);
        let pid = Pid::new(1);
        let va = VirtAddr::new(0x1000);
        assert!(table.try_alloc(4096, pid, va, Weak::new()).is_some());
        assert!(table.try_alloc(4096, pid, va, Weak::new()).is_some());
        assert!(table.try_alloc(4096, pid, va, Weak::new()).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn victim_scan_prefers_unaccessed() {
        let mut table = FrameTable::new(3);
        let pid = Pid::new(1);
        let mut mmu = TestMmu::new();
        let va_a = VirtAddr::new(0x1000);
        let va_b = VirtAddr::new(0x2000);
        let id_a = table.try_alloc(4096, pid, va_a, Weak::new()).unwrap();
        let id_b = table.try_alloc(4096, pid, va_b, Weak::new()).unwrap();
        mmu.force_map(pid, va_a, id_a, true);
        mmu.force_map(pid, va_b, id_b, true);
        mmu.mark_accessed(pid, va_a);
        // va_b was never accessed, so it should be chosen as victim.
        let victim = table.select_victim(&mut mmu).unwrap();
        assert_eq!(victim, id_b);
        // va_a's accessed bit should have been cleared on the pass.
        assert!(!mmu.accessed(pid, va_a));
    }
}
