use std::ffi::c_void;
use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Another thread can take the probed range before we reserve it, so an
/// aligned reservation is retried a few times.
const ALIGNED_RESERVE_ATTEMPTS: usize = 8;

fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// System page size (4 KiB when the OS reports nothing).
pub fn page_size() -> usize {
    match system_info().dwPageSize as usize {
        0 => 4096,
        size => size,
    }
}

/// `VirtualAlloc` places reservations on this boundary, usually 64 KiB.
pub fn allocation_granularity() -> usize {
    match system_info().dwAllocationGranularity as usize {
        0 => 65536,
        gran => gran,
    }
}

/// A committed read/write reservation owned by this value.
pub struct Region {
    base: *mut c_void,
    len: usize,
}

impl Region {
    unsafe fn commit_at(addr: *const c_void, len: usize) -> *mut c_void {
        unsafe { VirtualAlloc(addr, len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) }
    }

    /// Reserves and commits `len` zeroed bytes.
    ///
    /// # Safety
    ///
    /// Calls `VirtualAlloc`.
    pub unsafe fn reserve(len: usize) -> io::Result<Self> {
        let base = unsafe { Self::commit_at(ptr::null(), len) };
        if base.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { base, len })
    }

    /// Reserves `len` bytes starting on a multiple of `align`.
    ///
    /// A reservation cannot be partially released, so this probes with an
    /// oversized reservation, releases it, then reserves the aligned range.
    ///
    /// # Safety
    ///
    /// Calls `VirtualAlloc` and `VirtualFree`.
    pub unsafe fn reserve_aligned(len: usize, align: usize) -> io::Result<Self> {
        let padded = len
            .checked_add(align)
            .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;

        for _ in 0..ALIGNED_RESERVE_ATTEMPTS {
            let probe = unsafe { VirtualAlloc(ptr::null(), padded, MEM_RESERVE, PAGE_READWRITE) };
            if probe.is_null() {
                return Err(Error::last_os_error());
            }
            let aligned = (probe as usize + align - 1) & !(align - 1);
            unsafe { VirtualFree(probe, 0, MEM_RELEASE) };

            let base = unsafe { Self::commit_at(aligned as *const c_void, len) };
            if !base.is_null() {
                return Ok(Self { base, len });
            }
        }

        Err(Error::from(io::ErrorKind::OutOfMemory))
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
            // MEM_RELEASE wants a size of 0.
            unsafe { VirtualFree(self.base, 0, MEM_RELEASE) };
        }
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// # Safety
///
/// `[ptr, ptr + len)` must be page aligned and inside a live reservation.
pub unsafe fn advise_unused(ptr: *mut u8, len: usize) -> io::Result<()> {
    let res = unsafe { VirtualAlloc(ptr.cast::<c_void>(), len, MEM_RESET, PAGE_READWRITE) };
    if res.is_null() {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// No read-ahead hint is issued here; the prefetcher's page touches do the work.
///
/// # Safety
///
/// Same contract as the Unix version.
pub unsafe fn advise_will_need(_ptr: *const u8, _len: usize) -> io::Result<()> {
    Ok(())
}
