//! Virtual-memory primitives for heap segments: aligned anonymous mappings,
//! page size queries and page advice.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::{allocation_granularity, page_size};

/// An anonymous read/write mapping, unmapped on drop.
pub struct Mmap {
    region: os::Region,
}

impl Mmap {
    /// Start of the mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.region.base()
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// Returns `true` if the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.region.len() == 0
    }

    /// Gives the pages in `[offset, offset + len)` back to the OS. They stay
    /// mapped; their contents are unspecified once touched again.
    ///
    /// Only whole pages inside the range are released, so a range smaller
    /// than a page is a no-op.
    pub fn advise_unused(&self, offset: usize, len: usize) -> io::Result<()> {
        match whole_pages(offset, len, self.len()) {
            Some((start, len)) => unsafe { os::advise_unused(self.ptr().add(start), len) },
            None => Ok(()),
        }
    }
}

/// The whole pages inside `[offset, offset + len)`, clamped to `limit`.
fn whole_pages(offset: usize, len: usize, limit: usize) -> Option<(usize, usize)> {
    let ps = page_size();
    let end = offset.checked_add(len)?.min(limit) / ps * ps;
    let start = offset.div_ceil(ps) * ps;
    (start < end).then(|| (start, end - start))
}

/// Hints that `[ptr, ptr + len)` will be read soon. Advisory only.
///
/// # Safety
///
/// `ptr` must lie inside a mapping owned by the caller for `len` bytes.
pub unsafe fn advise_will_need(ptr: *const u8, len: usize) -> io::Result<()> {
    let misalign = ptr as usize & (page_size() - 1);
    // SAFETY: rounding down stays on the first page of the caller's mapping.
    unsafe { os::advise_will_need(ptr.sub(misalign), len + misalign) }
}

/// Builder for [`Mmap`].
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    align: usize,
}

impl MmapOptions {
    /// Options with no length set; [`MmapOptions::len`] is required.
    pub fn new() -> Self {
        Self::default()
    }

    /// Length of the mapping in bytes.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Start the mapping on a multiple of `align` (a power of two).
    pub fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Creates the mapping.
    ///
    /// # Safety
    ///
    /// Raw pointers derived from the returned `Mmap` must not outlive it.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "length must be greater than 0"));
        }
        if self.align != 0 && !self.align.is_power_of_two() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "alignment must be a power of two"));
        }

        let region = if self.align > allocation_granularity() {
            unsafe { os::Region::reserve_aligned(self.len, self.align)? }
        } else {
            unsafe { os::Region::reserve(self.len)? }
        };
        Ok(Mmap { region })
    }
}
