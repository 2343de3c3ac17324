// SPDX-License-Identifier: MIT OR Apache-2.0

//! The hardware/MMU adapter contract (§4.1).
//!
//! In the original Pintos source this is `pml4_set_page`, `pml4_clear_page`,
//! `pml4_is_accessed`, `pml4_set_accessed`, `pml4_is_dirty`, `pml4_set_dirty`.
//! This crate treats it exactly the way the teacher treats its own
//! `arch::mem` module (see `arch/hosted/mem.rs` vs. `arch/riscv/mem.rs`):
//! a small trait implemented once per real backend, plus a [`TestMmu`]
//! analogous to the teacher's hosted build, used throughout this crate's
//! test suite.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::addr::VirtAddr;
use crate::frame::FrameId;
use crate::Pid;

bitflags! {
    /// Per-entry software bits tracked by [`TestMmu`]. Mirrors the shape of
    /// the teacher's own `MMUFlags` (`arch/riscv/mem.rs`) -- `W`/`A`/`D` here
    /// play exactly the role its `W`/`A`/`D` bits do, just without the
    /// `VALID`/`USER`/`GLOBAL`/`P` bits a real page-table entry also needs,
    /// since those belong to the hardware backend this trait stands in for.
    struct EntryFlags: u8 {
        const WRITABLE = 0b001;
        const ACCESSED = 0b010;
        const DIRTY    = 0b100;
    }
}

/// The page-table primitives the VM core needs from the environment. None
/// of the algorithms in this crate assume anything beyond these six calls.
pub trait Mmu: Send {
    /// Install `va -> frame` with the given writable bit. Fails (returns
    /// `false`) if a mapping already exists at `va`.
    fn map(&mut self, pid: Pid, va: VirtAddr, frame: FrameId, writable: bool) -> bool;

    /// Remove the mapping at `va`, if any. Idempotent.
    fn unmap(&mut self, pid: Pid, va: VirtAddr);

    /// Look up the frame currently mapped at `va`.
    fn translate(&self, pid: Pid, va: VirtAddr) -> Option<FrameId>;

    fn accessed(&self, pid: Pid, va: VirtAddr) -> bool;

    fn clear_accessed(&mut self, pid: Pid, va: VirtAddr);

    fn dirty(&self, pid: Pid, va: VirtAddr) -> bool;

    /// `pml4_set_dirty`: the hardware sets this on a CPU write; the VM core
    /// only ever clears it (after writeback), but the embedder's simulated
    /// "CPU" needs to be able to set it too, hence the bool rather than a
    /// dedicated `clear_dirty`.
    fn set_dirty(&mut self, pid: Pid, va: VirtAddr, dirty: bool);
}

#[derive(Clone, Copy)]
struct Entry {
    frame: FrameId,
    flags: EntryFlags,
}

/// An in-memory MMU double, standing in for real page-table hardware the
/// same way the teacher's `arch::hosted` backend stands in for a real MMU
/// when the kernel runs under `cargo test` on a developer's workstation.
#[derive(Default)]
pub struct TestMmu {
    entries: HashMap<(Pid, VirtAddr), Entry>,
}

impl TestMmu {
    pub fn new() -> Self { TestMmu::default() }

    /// Test helper: mark a mapped page as having been touched by the CPU.
    pub fn mark_accessed(&mut self, pid: Pid, va: VirtAddr) {
        if let Some(e) = self.entries.get_mut(&(pid, va)) {
            e.flags.insert(EntryFlags::ACCESSED);
        }
    }

    /// Test helper for constructing fixtures without going through the
    /// full claim path.
    pub fn force_map(&mut self, pid: Pid, va: VirtAddr, frame: FrameId, writable: bool) {
        let flags = if writable { EntryFlags::WRITABLE } else { EntryFlags::empty() };
        self.entries.insert((pid, va), Entry { frame, flags });
    }
}

impl Mmu for TestMmu {
    fn map(&mut self, pid: Pid, va: VirtAddr, frame: FrameId, writable: bool) -> bool {
        if self.entries.contains_key(&(pid, va)) {
            return false;
        }
        let flags = if writable { EntryFlags::WRITABLE } else { EntryFlags::empty() };
        self.entries.insert((pid, va), Entry { frame, flags });
        true
    }

    fn unmap(&mut self, pid: Pid, va: VirtAddr) { self.entries.remove(&(pid, va)); }

    fn translate(&self, pid: Pid, va: VirtAddr) -> Option<FrameId> {
        self.entries.get(&(pid, va)).map(|e| e.frame)
    }

    fn accessed(&self, pid: Pid, va: VirtAddr) -> bool {
        self.entries.get(&(pid, va)).is_some_and(|e| e.flags.contains(EntryFlags::ACCESSED))
    }

    fn clear_accessed(&mut self, pid: Pid, va: VirtAddr) {
        if let Some(e) = self.entries.get_mut(&(pid, va)) {
            e.flags.remove(EntryFlags::ACCESSED);
        }
    }

    fn dirty(&self, pid: Pid, va: VirtAddr) -> bool {
        self.entries.get(&(pid, va)).is_some_and(|e| e.flags.contains(EntryFlags::DIRTY))
    }

    fn set_dirty(&mut self, pid: Pid, va: VirtAddr, dirty: bool) {
        if let Some(e) = self.entries.get_mut(&(pid, va)) {
            e.flags.set(EntryFlags::DIRTY, dirty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameTable;
    use std::sync::Weak;

    #[test]
    fn accessed_and_dirty_bits_are_independent() {
        let mut mmu = TestMmu::new();
        let mut table = FrameTable::new(1);
        let pid = Pid::new(1);
        let va = VirtAddr::new(0x3000);
        let id = table.try_alloc(4096, pid, va, Weak::new()).unwrap();

        mmu.force_map(pid, va, id, true);
        assert!(!mmu.accessed(pid, va));
        assert!(!mmu.dirty(pid, va));

        mmu.mark_accessed(pid, va);
        mmu.set_dirty(pid, va, true);
        assert!(mmu.accessed(pid, va));
        assert!(mmu.dirty(pid, va));

        mmu.clear_accessed(pid, va);
        assert!(!mmu.accessed(pid, va));
        assert!(mmu.dirty(pid, va), "clearing accessed must not clear dirty");
    }
}
