// SPDX-License-Identifier: MIT OR Apache-2.0

//! The file-object contract mmap needs: `file_reopen`, `file_read_at`,
//! `file_write_at`, `file_length`. Out of scope per §1 is the filesystem
//! itself; this crate only needs a handle that can be reopened (so
//! `do_mmap` gets an independent, ref-counted reference, matching
//! `file_reopen` in the original) and read/written at an offset.

use std::sync::{Arc, Mutex};

use crate::error::VmResult;

/// A reopenable, offset-addressable file. Implemented by whatever the
/// embedding kernel's filesystem layer provides; [`MemFile`] is the
/// in-memory double used by this crate's own tests.
pub trait FileHandle: Send + Sync {
    /// Obtain an independent handle to the same underlying file, the way
    /// `file_reopen` hands back a second `struct file *` sharing the inode
    /// but with its own lifetime.
    fn reopen(&self) -> Arc<dyn FileHandle>;

    fn read_at(&self, buf: &mut [u8], offset: u64) -> VmResult<usize>;

    fn write_at(&self, buf: &[u8], offset: u64) -> VmResult<usize>;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool { self.len() == 0 }
}

/// An in-memory file, standing in for the real filesystem that this crate
/// treats as an external collaborator (§1). Shared via `Arc` so cloned
/// handles from `reopen` observe each other's writes, same as real file
/// descriptors pointing at the same inode.
#[derive(Clone)]
pub struct MemFile {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemFile {
    pub fn new(initial: Vec<u8>) -> Arc<MemFile> { Arc::new(MemFile { bytes: Arc::new(Mutex::new(initial)) }) }

    /// Snapshot the current contents, for test assertions.
    pub fn snapshot(&self) -> Vec<u8> { self.bytes.lock().unwrap().clone() }
}

impl FileHandle for MemFile {
    fn reopen(&self) -> Arc<dyn FileHandle> { Arc::new(self.clone()) }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> VmResult<usize> {
        let data = self.bytes.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            buf.fill(0);
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> VmResult<usize> {
        let mut data = self.bytes.lock().unwrap();
        let offset = offset as usize;
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> u64 { self.bytes.lock().unwrap().len() as u64 }
}
