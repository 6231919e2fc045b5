//! Cell headers and pointer values.
//!
//! Every heap object starts with a [`GcCell`] header followed by its payload.
//! The header carries the allocated size, so a segment can be walked
//! linearly with [`GcCell::next_cell`], and the kind used to dispatch tracing
//! and finalization.

use std::fmt;
use std::ptr::NonNull;

use crate::kind::CellKind;

/// Alignment of every cell and every allocation size.
pub const CELL_ALIGN: usize = 8;

/// Size of the cell header.
pub const HEADER_SIZE: usize = std::mem::size_of::<GcCell>();

const MARKED: u16 = 1 << 0;
const FORWARDED: u16 = 1 << 1;

/// Allocated size of a cell with a `payload`-byte payload.
#[inline]
#[must_use]
pub const fn cell_size(payload: usize) -> usize {
    (HEADER_SIZE + payload + CELL_ALIGN - 1) & !(CELL_ALIGN - 1)
}

/// Header state of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    /// The payload is valid at this address.
    Live,
    /// The cell was (or is about to be) moved. The payload must not be
    /// accessed through this address.
    Forwarded(NonNull<GcCell>),
}

/// Object header.
#[repr(C, align(8))]
pub struct GcCell {
    size: u32,
    kind: u16,
    flags: u16,
    forward: usize,
}

impl GcCell {
    /// Write a fresh header at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be valid for writes of `size` bytes and aligned to
    /// [`CELL_ALIGN`].
    pub(crate) unsafe fn init(at: NonNull<u8>, size: usize, kind: CellKind) -> NonNull<Self> {
        debug_assert!(size >= HEADER_SIZE && size % CELL_ALIGN == 0);
        let cell = at.cast::<Self>();
        // Segment sizes are validated to fit in 32 bits.
        #[allow(clippy::cast_possible_truncation)]
        let size = size as u32;
        // SAFETY: guaranteed by the caller.
        unsafe {
            cell.as_ptr().write(Self {
                size,
                kind: kind.0,
                flags: 0,
                forward: 0,
            });
        }
        cell
    }

    #[inline]
    #[must_use]
    pub const fn allocated_size(&self) -> usize {
        self.size as usize
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> CellKind {
        CellKind(self.kind)
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> CellState {
        if self.flags & FORWARDED == 0 {
            CellState::Live
        } else {
            // SAFETY: the forwarding word is set together with the flag.
            CellState::Forwarded(unsafe { NonNull::new_unchecked(self.forward as *mut Self) })
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_marked(&self) -> bool {
        self.flags & MARKED != 0
    }

    /// Set the mark bit. Returns `false` if it was already set.
    #[inline]
    pub(crate) fn mark(&mut self) -> bool {
        let was = self.is_marked();
        self.flags |= MARKED;
        !was
    }

    #[inline]
    pub(crate) fn forward_to(&mut self, to: NonNull<Self>) {
        self.forward = to.as_ptr() as usize;
        self.flags |= FORWARDED;
    }

    /// Clear mark and forwarding state.
    #[inline]
    pub(crate) fn reset_gc_state(&mut self) {
        self.flags = 0;
        self.forward = 0;
    }

    /// The cell following `cell` in its segment.
    ///
    /// # Safety
    ///
    /// `cell` must point to a well-formed header.
    #[inline]
    #[must_use]
    pub unsafe fn next_cell(cell: NonNull<Self>) -> *mut Self {
        // SAFETY: guaranteed by the caller; the result may be one past the level.
        unsafe {
            let size = cell.as_ref().allocated_size();
            cell.as_ptr().cast::<u8>().add(size).cast::<Self>()
        }
    }

    /// Payload of a live cell.
    ///
    /// # Safety
    ///
    /// `cell` must point to a well-formed header.
    #[inline]
    #[must_use]
    pub unsafe fn payload(cell: NonNull<Self>) -> NonNull<u8> {
        // SAFETY: guaranteed by the caller.
        debug_assert!(
            unsafe { cell.as_ref() }.state() == CellState::Live,
            "payload accessed through a forwarded cell"
        );
        unsafe { Self::payload_unchecked(cell) }
    }

    /// Payload without the forwarding check. Only the collector traces
    /// forwarded cells, while their references are being rewritten in place.
    #[inline]
    pub(crate) unsafe fn payload_unchecked(cell: NonNull<Self>) -> NonNull<u8> {
        // SAFETY: the payload directly follows the header.
        unsafe { cell.cast::<u8>().add(HEADER_SIZE) }
    }
}

impl fmt::Debug for GcCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcCell")
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("marked", &self.is_marked())
            .field("state", &self.state())
            .finish()
    }
}

/// A possibly-null reference to a heap cell.
///
/// A `CellPtr` is a plain address: it is not a root and is invalidated when
/// its referent moves. Keep pointers that must survive allocation in a root
/// handle or in another heap object.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CellPtr(Option<NonNull<GcCell>>);

impl CellPtr {
    pub const NULL: Self = Self(None);

    #[inline]
    #[must_use]
    pub const fn from_cell(cell: NonNull<GcCell>) -> Self {
        Self(Some(cell))
    }

    #[inline]
    #[must_use]
    pub const fn as_cell(self) -> Option<NonNull<GcCell>> {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0.is_none()
    }

    /// Address of the referent, `0` when null.
    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.map_or(0, |p| p.as_ptr() as usize)
    }
}

impl From<NonNull<GcCell>> for CellPtr {
    fn from(cell: NonNull<GcCell>) -> Self {
        Self::from_cell(cell)
    }
}

impl fmt::Debug for CellPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(p) => write!(f, "CellPtr({p:p})"),
            None => f.write_str("CellPtr(null)"),
        }
    }
}

/// A dynamically typed slot value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum TaggedValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Object(CellPtr),
}

impl TaggedValue {
    /// The referenced cell, if this value is an object.
    #[must_use]
    pub const fn as_ptr(&self) -> Option<CellPtr> {
        match self {
            Self::Object(p) => Some(*p),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }
}

impl From<CellPtr> for TaggedValue {
    fn from(p: CellPtr) -> Self {
        if p.is_null() {
            Self::Null
        } else {
            Self::Object(p)
        }
    }
}

impl From<f64> for TaggedValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for TaggedValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(8))]
    struct Buf([u8; 64]);

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(std::mem::align_of::<GcCell>(), CELL_ALIGN);
        assert_eq!(cell_size(0), 16);
        assert_eq!(cell_size(1), 24);
        assert_eq!(cell_size(8), 24);
        assert_eq!(cell_size(9), 32);
    }

    #[test]
    fn test_state_transitions() {
        let mut buf = Buf([0; 64]);
        let at = NonNull::new(buf.0.as_mut_ptr()).unwrap();
        let mut cell = unsafe { GcCell::init(at, 32, CellKind(3)) };
        let header = unsafe { cell.as_mut() };
        assert_eq!(header.allocated_size(), 32);
        assert_eq!(header.kind(), CellKind(3));
        assert_eq!(header.state(), CellState::Live);

        assert!(header.mark());
        assert!(!header.mark());
        let target = unsafe { at.add(32) }.cast::<GcCell>();
        header.forward_to(target);
        assert_eq!(header.state(), CellState::Forwarded(target));
        header.reset_gc_state();
        assert!(!header.is_marked());
        assert_eq!(header.state(), CellState::Live);
    }

    #[test]
    fn test_next_cell_steps_by_size() {
        let mut buf = Buf([0; 64]);
        let at = NonNull::new(buf.0.as_mut_ptr()).unwrap();
        let cell = unsafe { GcCell::init(at, 40, CellKind(0)) };
        let next = unsafe { GcCell::next_cell(cell) };
        assert_eq!(next as usize - cell.as_ptr() as usize, 40);
        let payload = unsafe { GcCell::payload(cell) };
        assert_eq!(payload.as_ptr() as usize - cell.as_ptr() as usize, HEADER_SIZE);
    }

    #[test]
    fn test_tagged_value_conversions() {
        assert_eq!(TaggedValue::from(CellPtr::NULL), TaggedValue::Null);
        assert_eq!(TaggedValue::from(1.5), TaggedValue::Number(1.5));
        assert!(TaggedValue::default().as_ptr().is_none());
        assert_eq!(CellPtr::NULL.addr(), 0);
    }
}
