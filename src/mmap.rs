// SPDX-License-Identifier: MIT OR Apache-2.0

//! `do_mmap` / `do_munmap` (§4.7): map a byte range of a file into a
//! process's address space as a run of lazily-loaded `File` pages.
//!
//! Grounded in `userprog/syscall.c`'s `mmap`/`munmap` handlers and
//! `vm/vm.c`'s `do_mmap`/`do_munmap` from the original source this crate's
//! design was distilled from.

use std::sync::Arc;

use log::trace;

use crate::addr::VirtAddr;
use crate::disk::BlockDevice;
use crate::error::{VmError, VmResult};
use crate::file::FileHandle;
use crate::mmu::Mmu;
use crate::page::{BackingKind, LazyLoadAux, PageKind};
use crate::system::{mmap_loader, VmSystem};
use crate::Pid;

impl<M: Mmu, D: BlockDevice> VmSystem<M, D> {
    /// Map `length` bytes of `file` starting at `offset` into `length`'s
    /// worth of pages starting at `addr`. `addr` and `length` must already
    /// be page-aligned by the caller's syscall boundary, same as the
    /// original (`mmap` rejects misaligned requests before calling in).
    ///
    /// Returns `None`, with nothing inserted, when `length` is zero or the
    /// region overlaps any existing SPT entry. Returns `None` on the first
    /// per-page allocation failure partway through the run too -- but that
    /// case does *not* roll back pages it already installed in this same
    /// call (§4.7: preserved as-is from the original, which has the same
    /// behavior).
    pub fn do_mmap(
        &self,
        pid: Pid,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: Arc<dyn FileHandle>,
        offset: u64,
    ) -> Option<VirtAddr> {
        self.try_mmap(pid, addr, length, writable, file, offset).ok()
    }

    fn try_mmap(
        &self,
        pid: Pid,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: Arc<dyn FileHandle>,
        offset: u64,
    ) -> VmResult<VirtAddr> {
        if length == 0 {
            return Err(VmError::EmptyMapping);
        }
        let page_size = self.config().page_size;
        let page_count = length.div_ceil(page_size);

        let spt = self.spt_of(pid)?;
        {
            let spt = spt.lock();
            for i in 0..page_count {
                if spt.find(addr + i * page_size, page_size).is_some() {
                    return Err(VmError::Overlap);
                }
            }
        }

        let reopened = file.reopen();
        let mut remaining = length;
        let mut cursor = offset;
        for i in 0..page_count {
            let page_va = addr + i * page_size;
            let read_bytes = remaining.min(page_size);
            let zero_bytes = page_size - read_bytes;
            let aux = LazyLoadAux {
                file: reopened.clone(),
                offset: cursor,
                read_bytes,
                zero_bytes,
                page_count,
            };
            self.vm_alloc_page_with_initializer(
                pid,
                BackingKind::File,
                page_va,
                writable,
                mmap_loader(),
                Some(aux),
            )?;
            remaining -= read_bytes;
            cursor += read_bytes as u64;
        }
        trace!("vm: mapped {page_count} page(s) at {addr:?} for pid={pid:?}");
        Ok(addr)
    }

    /// Unmap the whole region that was installed by the `do_mmap` call
    /// whose first page is `addr`. Every dirty page is written back to its
    /// own offset in the file before being dropped.
    pub fn do_munmap(&self, pid: Pid, addr: VirtAddr) -> VmResult<()> {
        let page_size = self.config().page_size;
        let addr = addr.page_floor(page_size);
        let spt = self.spt_of(pid)?;

        let page_count = {
            let spt = spt.lock();
            let first = spt.find(addr, page_size).ok_or(VmError::NotMapped)?;
            let g = first.lock();
            match &g.kind {
                PageKind::File { count, .. } => *count,
                _ => return Err(VmError::CorruptSpt("munmap target is not file-backed")),
            }
        };

        for i in 0..page_count {
            let va = addr + i * page_size;
            let page = { spt.lock().find(va, page_size) };
            let Some(page) = page else { continue };

            let frame_id = { page.lock().frame };
            if let Some(fid) = frame_id {
                let dirty = self.mmu_lock().lock().dirty(pid, va);
                if dirty {
                    let (file, offset, read_bytes) = {
                        let g = page.lock();
                        match &g.kind {
                            PageKind::File { file, offset, read_bytes, .. } => {
                                (file.clone(), *offset, *read_bytes)
                            }
                            _ => unreachable!("munmap region contains only File pages"),
                        }
                    };
                    let buf = {
                        let frames = self.frames_lock().lock();
                        frames.get(fid).expect("frame missing during munmap").content.clone()
                    };
                    file.write_at(&buf[..read_bytes], offset)?;
                    self.mmu_lock().lock().set_dirty(pid, va, false);
                }
            }

            // Detach from the SPT and release any frame it still holds.
            // Each page's own dirty bit was already handled above -- the
            // original source clears the *first* page's dirty bit on every
            // iteration instead of the current one, a bug this crate does
            // not reproduce.
            if let Some(removed) = spt.lock().remove(va) {
                if let Some(fid) = removed.lock().frame {
                    self.mmu_lock().lock().unmap(pid, va);
                    self.frames_lock().lock().release(fid);
                }
            }
        }
        trace!("vm: unmapped {page_count} page(s) at {addr:?} for pid={pid:?}");
        Ok(())
    }
}
