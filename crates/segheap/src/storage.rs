//! Segment storage acquisition.
//!
//! A [`StorageProvider`] hands out fixed-size regions aligned to their own
//! size. Every heap segment is backed by exactly one [`Storage`].

use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sys_alloc::{Mmap, MmapOptions};

use crate::error::StorageError;

/// Name passed to the provider for nursery storage.
pub const YOUNG_STORAGE_NAME: &str = "segheap-young-segment";
/// Name passed to the provider for old generation storage.
pub const OLD_STORAGE_NAME: &str = "segheap-old-segment";

enum Backing {
    Mmap(Mmap),
    Malloc(Layout),
}

/// Single-owner handle to an aligned region. Frees the region on drop.
pub struct Storage {
    base: NonNull<u8>,
    size: usize,
    backing: Backing,
}

// SAFETY: the region is exclusively owned by this handle.
unsafe impl Send for Storage {}

impl Storage {
    /// Start of the region. Aligned to [`size`](Self::size).
    #[must_use]
    pub const fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Length of the region in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns `true` if `addr` lies inside the region.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.size
    }

    /// Gives the physical pages of `[offset, offset + len)` back to the OS.
    /// The range stays addressable. A no-op for malloc-backed storage.
    ///
    /// # Errors
    ///
    /// Propagates the OS error from the advice call.
    pub fn advise_unused(&self, offset: usize, len: usize) -> io::Result<()> {
        match &self.backing {
            Backing::Mmap(map) => map.advise_unused(offset, len),
            Backing::Malloc(_) => Ok(()),
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Backing::Malloc(layout) = self.backing {
            // SAFETY: allocated in `MallocStorageProvider::new_storage` with this layout.
            unsafe { alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Source of segment storage.
///
/// Failures are ordinary results: the heap treats them as a failed growth
/// attempt.
pub trait StorageProvider {
    /// Size (and alignment) of every storage this provider returns.
    fn storage_size(&self) -> usize;

    /// Acquire a new storage. `name` identifies the consumer in diagnostics.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] when no memory is available.
    fn new_storage(&mut self, name: &'static str) -> Result<Storage, StorageError>;

    /// Return a storage obtained from this provider.
    fn delete_storage(&mut self, storage: Storage) {
        drop(storage);
    }
}

/// Anonymous mappings from the OS.
#[derive(Debug)]
pub struct MmapStorageProvider {
    size: usize,
}

impl MmapStorageProvider {
    /// Provider for `size`-byte, `size`-aligned regions.
    #[must_use]
    pub const fn new(size: usize) -> Self {
        Self { size }
    }
}

impl StorageProvider for MmapStorageProvider {
    fn storage_size(&self) -> usize {
        self.size
    }

    fn new_storage(&mut self, name: &'static str) -> Result<Storage, StorageError> {
        // SAFETY: the mapping is owned by the returned `Storage`.
        let map = unsafe { MmapOptions::new().len(self.size).align(self.size).map_anon() }
            .map_err(|source| StorageError::Map { name, source })?;
        let base = NonNull::new(map.ptr()).ok_or(StorageError::Alloc {
            name,
            size: self.size,
        })?;
        Ok(Storage {
            base,
            size: self.size,
            backing: Backing::Mmap(map),
        })
    }
}

/// Regions from the global allocator. Useful where mappings are unavailable
/// or expensive.
#[derive(Debug)]
pub struct MallocStorageProvider {
    size: usize,
}

impl MallocStorageProvider {
    #[must_use]
    pub const fn new(size: usize) -> Self {
        Self { size }
    }
}

impl StorageProvider for MallocStorageProvider {
    fn storage_size(&self) -> usize {
        self.size
    }

    fn new_storage(&mut self, name: &'static str) -> Result<Storage, StorageError> {
        let err = StorageError::Alloc {
            name,
            size: self.size,
        };
        let Ok(layout) = Layout::from_size_align(self.size, self.size) else {
            return Err(err);
        };
        // SAFETY: `layout` has non-zero size (segment sizes are page multiples).
        let ptr = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(ptr).ok_or(err)?;
        Ok(Storage {
            base,
            size: self.size,
            backing: Backing::Malloc(layout),
        })
    }
}

/// Refuses to hand out more than `limit` live storages.
pub struct LimitedStorageProvider {
    delegate: Box<dyn StorageProvider>,
    limit: usize,
    live: usize,
}

impl LimitedStorageProvider {
    pub fn new(delegate: Box<dyn StorageProvider>, limit: usize) -> Self {
        Self {
            delegate,
            limit,
            live: 0,
        }
    }
}

impl StorageProvider for LimitedStorageProvider {
    fn storage_size(&self) -> usize {
        self.delegate.storage_size()
    }

    fn new_storage(&mut self, name: &'static str) -> Result<Storage, StorageError> {
        if self.live >= self.limit {
            return Err(StorageError::LimitReached { limit: self.limit });
        }
        let storage = self.delegate.new_storage(name)?;
        self.live += 1;
        Ok(storage)
    }

    fn delete_storage(&mut self, storage: Storage) {
        self.live -= 1;
        self.delegate.delete_storage(storage);
    }
}

/// Counters shared between a [`CountingStorageProvider`] and its observers.
#[derive(Debug, Default)]
pub struct StorageCounters {
    allocated: AtomicUsize,
    deleted: AtomicUsize,
}

impl StorageCounters {
    /// Storages handed out so far.
    pub fn num_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Storages returned so far.
    pub fn num_deleted(&self) -> usize {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Storages currently held by the heap.
    pub fn num_live(&self) -> usize {
        self.num_allocated() - self.num_deleted()
    }
}

/// Counts storage traffic through a delegate.
pub struct CountingStorageProvider {
    delegate: Box<dyn StorageProvider>,
    counters: Arc<StorageCounters>,
}

impl CountingStorageProvider {
    pub fn new(delegate: Box<dyn StorageProvider>) -> Self {
        Self {
            delegate,
            counters: Arc::default(),
        }
    }

    /// Handle to the counters, valid after the provider moves into a heap.
    #[must_use]
    pub fn counters(&self) -> Arc<StorageCounters> {
        Arc::clone(&self.counters)
    }
}

impl StorageProvider for CountingStorageProvider {
    fn storage_size(&self) -> usize {
        self.delegate.storage_size()
    }

    fn new_storage(&mut self, name: &'static str) -> Result<Storage, StorageError> {
        let storage = self.delegate.new_storage(name)?;
        self.counters.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(storage)
    }

    fn delete_storage(&mut self, storage: Storage) {
        self.counters.deleted.fetch_add(1, Ordering::Relaxed);
        self.delegate.delete_storage(storage);
    }
}
