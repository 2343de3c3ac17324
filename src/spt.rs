// SPDX-License-Identifier: MIT OR Apache-2.0

//! The supplemental page table (§4.5): a per-process index from
//! page-aligned virtual address to [`Page`].
//!
//! Pintos keys this with a `struct hash` over `page_hash`/`page_less`; a
//! `std::collections::HashMap<VirtAddr, _>` is the direct idiomatic
//! rendition since the key is already a plain, `Hash`-able value type.
//! Backend dispatch (`destroy` during teardown, the copy logic during
//! fork) needs the MMU/frame table/swap store that an `Spt` does not own,
//! so those operations live on [`crate::system::VmSystem`]; this type only
//! owns the table itself.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::VirtAddr;
use crate::page::Page;

/// Pages are wrapped in `Arc<Mutex<_>>` so the frame table's back-link
/// (`Frame::page`, a `Weak`) can observe the same object the SPT owns
/// without sharing ownership of it -- see the "cyclic page <-> frame
/// link" design note.
pub type PageHandle = Arc<Mutex<Page>>;

#[derive(Default)]
pub struct Spt {
    pages: HashMap<VirtAddr, PageHandle>,
}

impl Spt {
    pub fn new() -> Self { Spt::default() }

    /// Round `va` down to a page boundary and look it up.
    pub fn find(&self, va: VirtAddr, page_size: usize) -> Option<PageHandle> {
        self.pages.get(&va.page_floor(page_size)).cloned()
    }

    /// Insert a freshly-allocated page. Rejects a double-insert at the
    /// same `va`, leaving the existing entry untouched.
    pub fn insert(&mut self, page: Page) -> bool {
        let va = page.va;
        if self.pages.contains_key(&va) {
            return false;
        }
        self.pages.insert(va, Arc::new(Mutex::new(page)));
        true
    }

    /// Detach a page from the table without running its destructor; the
    /// caller (`VmSystem`) is responsible for releasing any frame it still
    /// holds.
    pub fn remove(&mut self, va: VirtAddr) -> Option<PageHandle> { self.pages.remove(&va) }

    pub fn contains(&self, va: VirtAddr) -> bool { self.pages.contains_key(&va) }

    pub fn iter(&self) -> impl Iterator<Item = (&VirtAddr, &PageHandle)> { self.pages.iter() }

    pub fn len(&self) -> usize { self.pages.len() }

    pub fn is_empty(&self) -> bool { self.pages.is_empty() }

    /// Remove and return every page, in preparation for teardown.
    pub fn drain_all(&mut self) -> Vec<PageHandle> { self.pages.drain().map(|(_, p)| p).collect() }
}
