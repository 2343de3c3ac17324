// SPDX-License-Identifier: MIT OR Apache-2.0

//! User virtual addresses.
//!
//! A thin newtype rather than a bare `usize` so that "is this page-aligned"
//! and "round this down" can't be confused with ordinary pointer math
//! anywhere else in the crate.

use std::fmt;
use std::ops::{Add, Sub};

/// A user-space virtual address. Not necessarily page-aligned; pages keys
/// are always rounded down via [`VirtAddr::page_floor`] before use.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    pub const fn new(addr: usize) -> Self { VirtAddr(addr) }

    /// Round down to the nearest page boundary.
    pub fn page_floor(self, page_size: usize) -> Self { VirtAddr(self.0 & !(page_size - 1)) }

    pub fn is_page_aligned(self, page_size: usize) -> bool { self.0 & (page_size - 1) == 0 }

    pub const fn as_usize(self) -> usize { self.0 }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:#x}", self.0) }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:#x}", self.0) }
}

impl Add<usize> for VirtAddr {
    type Output = VirtAddr;
    fn add(self, rhs: usize) -> VirtAddr { VirtAddr(self.0 + rhs) }
}

impl Sub<usize> for VirtAddr {
    type Output = VirtAddr;
    fn sub(self, rhs: usize) -> VirtAddr { VirtAddr(self.0 - rhs) }
}

impl Sub for VirtAddr {
    type Output = usize;
    fn sub(self, rhs: VirtAddr) -> usize { self.0 - rhs.0 }
}
