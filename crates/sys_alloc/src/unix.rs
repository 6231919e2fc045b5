use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// System page size, read once.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

/// Mappings can start on any page.
pub fn allocation_granularity() -> usize {
    page_size()
}

/// An anonymous read/write region owned by this value.
pub struct Region {
    base: *mut libc::c_void,
    len: usize,
}

impl Region {
    /// Maps `len` fresh zeroed bytes anywhere in the address space.
    ///
    /// # Safety
    ///
    /// Calls `mmap`.
    pub unsafe fn reserve(len: usize) -> io::Result<Self> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let base = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
        if base == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(Self { base, len })
    }

    /// Maps `len` bytes starting on a multiple of `align`.
    ///
    /// Over-reserves by `align` and hands the misaligned head and the unused
    /// tail back with `munmap`.
    ///
    /// # Safety
    ///
    /// Calls `mmap` and `munmap`.
    pub unsafe fn reserve_aligned(len: usize, align: usize) -> io::Result<Self> {
        let padded = len
            .checked_add(align)
            .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;
        let raw = unsafe { Self::reserve(padded)? };

        let start = raw.base as usize;
        let aligned = (start + align - 1) & !(align - 1);
        let head = aligned - start;
        let tail = padded - head - len;

        std::mem::forget(raw);
        unsafe {
            if head > 0 {
                libc::munmap(start as *mut libc::c_void, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }

        Ok(Self {
            base: aligned as *mut libc::c_void,
            len,
        })
    }

    pub const fn base(&self) -> *mut u8 {
        self.base.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.base, self.len);
            }
        }
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

fn madvise(ptr: *mut u8, len: usize, advice: libc::c_int) -> io::Result<()> {
    let res = unsafe { libc::madvise(ptr.cast::<libc::c_void>(), len, advice) };
    if res == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// # Safety
///
/// `[ptr, ptr + len)` must be page aligned and inside a live mapping.
pub unsafe fn advise_unused(ptr: *mut u8, len: usize) -> io::Result<()> {
    madvise(ptr, len, libc::MADV_DONTNEED)
}

/// # Safety
///
/// `ptr` must be page aligned and `[ptr, ptr + len)` inside a live mapping.
pub unsafe fn advise_will_need(ptr: *const u8, len: usize) -> io::Result<()> {
    madvise(ptr.cast_mut(), len, libc::MADV_WILLNEED)
}
