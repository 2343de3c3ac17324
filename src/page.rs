// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-virtual-page record and its three backend variants (§3, §4.4).
//!
//! The original Pintos source dispatches `swap_in`/`swap_out`/`destroy`
//! through a `struct page_operations` vtable installed by
//! `anon_initializer`/`file_backed_initializer`/`uninit_new`. Per the
//! REDESIGN note in the distilled spec (§9), this crate instead uses a
//! tagged `enum PageKind` matched on on by [`crate::system::VmSystem`] --
//! the dispatch logic itself lives there, since it needs access to the MMU,
//! the frame table, and the swap store, none of which a `Page` owns.

use std::sync::Arc;

use crate::addr::VirtAddr;
use crate::file::FileHandle;
use crate::frame::FrameId;
use crate::swap::SwapSlot;

/// The real backend kind an `Uninit` page will materialize into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    Anon,
    File,
}

/// Opaque lazy-load parameters threaded through from `do_mmap` (or any
/// other lazy loader, e.g. ELF segment loading) to the first fault.
/// Mirrors the Pintos `struct aux_data` / `struct container`.
#[derive(Clone)]
pub struct LazyLoadAux {
    pub file: Arc<dyn FileHandle>,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    /// Length of the whole lazily-loaded region, in pages. Only the first
    /// page's copy of this is consulted by `do_munmap`.
    pub page_count: usize,
}

/// The user-supplied lazy loader. Given the (zeroed) frame buffer and the
/// aux data (absent for plain `vm_alloc_page` allocations, present for
/// `do_mmap`/ELF-style lazy loads), fill in the page's contents and report
/// success.
pub type Initializer = Arc<dyn Fn(&mut [u8], Option<&LazyLoadAux>) -> bool + Send + Sync>;

/// The trivial initializer used by `vm_alloc_page`: the frame arrives
/// already zeroed, so there is nothing to do.
pub fn zero_initializer() -> Initializer { Arc::new(|_buf, _aux| true) }

pub enum PageKind {
    /// First fault has not yet occurred; `init` materializes the page into
    /// `target` on demand.
    Uninit { target: BackingKind, init: Initializer, aux: Option<LazyLoadAux> },
    /// Backed by swap; `slot` is `Some` only while the page is not resident.
    Anon { slot: Option<SwapSlot> },
    /// Backed by a byte range of a file.
    File { file: Arc<dyn FileHandle>, offset: u64, read_bytes: usize, zero_bytes: usize, count: usize },
}

pub struct Page {
    pub va: VirtAddr,
    pub writable: bool,
    pub frame: Option<FrameId>,
    pub kind: PageKind,
    /// Set by `stack_growth`; informational only (matches Pintos's
    /// `VM_MARKER_0`, which this crate does not otherwise interpret).
    pub is_stack: bool,
}

impl Page {
    pub fn new_uninit(
        va: VirtAddr,
        writable: bool,
        target: BackingKind,
        init: Initializer,
        aux: Option<LazyLoadAux>,
    ) -> Self {
        Page { va, writable, frame: None, kind: PageKind::Uninit { target, init, aux }, is_stack: false }
    }

    pub fn new_anon(va: VirtAddr, writable: bool) -> Self {
        Page { va, writable, frame: None, kind: PageKind::Anon { slot: None }, is_stack: false }
    }

    pub fn new_file(
        va: VirtAddr,
        writable: bool,
        file: Arc<dyn FileHandle>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        count: usize,
    ) -> Self {
        Page {
            va,
            writable,
            frame: None,
            kind: PageKind::File { file, offset, read_bytes, zero_bytes, count },
            is_stack: false,
        }
    }

    pub fn is_resident(&self) -> bool { self.frame.is_some() }
}
