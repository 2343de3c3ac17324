// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed errors for the VM core.
//!
//! The distilled contract (see `SPEC_FULL.md` §7) wants booleans at the
//! fault-handler boundary and nothing else; everywhere below that boundary
//! this crate propagates a real error with `?`, the way the rest of the
//! Rust ecosystem does it, and only [`crate::system::VmSystem::vm_try_handle_fault`]
//! collapses the result to `bool`.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("a page is already mapped at this address")]
    AlreadyMapped,

    #[error("no page is mapped at this address")]
    NotMapped,

    #[error("physical memory exhausted even after eviction")]
    OutOfMemory,

    #[error("swap space exhausted during eviction")]
    SwapExhausted,

    #[error("process {0:?} has no registered address space")]
    UnknownProcess(crate::Pid),

    #[error("mmap region overlaps an existing mapping")]
    Overlap,

    #[error("mmap length must be non-zero")]
    EmptyMapping,

    #[error("backing store I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("lazy loader failed to materialize a page")]
    LazyLoadFailed,

    #[error("supplemental page table is corrupt: {0}")]
    CorruptSpt(&'static str),
}

pub type VmResult<T> = Result<T, VmError>;
