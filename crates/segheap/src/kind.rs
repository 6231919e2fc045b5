//! Cell kinds and their dispatch table.
//!
//! Every cell header stores a [`CellKind`], an index into the heap's
//! [`KindTable`]. The table holds one [`VTable`] per payload type with the
//! functions the collector needs: trace the payload's slots and, for types
//! with drop glue, finalize it when the cell dies.

use std::any::TypeId;
use std::collections::HashMap;
use std::ptr::NonNull;

use crate::cell::{GcCell, TaggedValue, CELL_ALIGN, HEADER_SIZE};
use crate::trace::{SlotVisitor, Trace};

/// Index into the kind table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellKind(pub(crate) u16);

impl CellKind {
    /// Built-in variable-length array of [`TaggedValue`]s.
    pub const SLOT_ARRAY: Self = Self(0);

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Visits the slots of the cell's payload.
pub type TraceFn = unsafe fn(NonNull<GcCell>, &mut dyn SlotVisitor);

/// Releases resources owned by a dead cell's payload.
pub type FinalizeFn = unsafe fn(NonNull<GcCell>);

/// Per-kind dispatch entry.
#[derive(Clone, Copy)]
pub struct VTable {
    pub name: &'static str,
    /// Payload size in bytes, `0` for variable-length kinds.
    pub size: usize,
    pub trace: TraceFn,
    pub finalize: Option<FinalizeFn>,
}

impl std::fmt::Debug for VTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VTable")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("finalize", &self.finalize.is_some())
            .finish_non_exhaustive()
    }
}

/// A type that can be stored in the heap.
pub trait HeapObject: Trace + 'static {}

impl<T: Trace + 'static> HeapObject for T {}

unsafe fn trace_payload<T: Trace>(cell: NonNull<GcCell>, visitor: &mut dyn SlotVisitor) {
    // SAFETY: the kind table only pairs this function with cells holding a `T`.
    unsafe {
        let payload = GcCell::payload_unchecked(cell).cast::<T>();
        (*payload.as_ptr()).trace(visitor);
    }
}

unsafe fn finalize_payload<T>(cell: NonNull<GcCell>) {
    // SAFETY: the cell holds an initialized `T` that is never used again.
    unsafe { std::ptr::drop_in_place(GcCell::payload(cell).cast::<T>().as_ptr()) };
}

/// Registered kinds, indexed by [`CellKind`].
pub struct KindTable {
    vtables: Vec<VTable>,
    by_type: HashMap<TypeId, CellKind>,
}

impl Default for KindTable {
    fn default() -> Self {
        Self::new()
    }
}

impl KindTable {
    /// A table holding only the built-in kinds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            vtables: vec![slot_array::VTABLE],
            by_type: HashMap::new(),
        }
    }

    /// Kind of `T`, registering it on first use.
    ///
    /// # Panics
    ///
    /// Panics if more than `u16::MAX` kinds are registered.
    pub fn kind_of<T: HeapObject>(&mut self) -> CellKind {
        const {
            assert!(
                std::mem::align_of::<T>() <= CELL_ALIGN,
                "heap payloads must not need more than 8-byte alignment"
            );
        }
        if let Some(&kind) = self.by_type.get(&TypeId::of::<T>()) {
            return kind;
        }
        let index = u16::try_from(self.vtables.len()).expect("kind table overflow");
        let kind = CellKind(index);
        self.vtables.push(VTable {
            name: std::any::type_name::<T>(),
            size: std::mem::size_of::<T>(),
            trace: trace_payload::<T>,
            finalize: std::mem::needs_drop::<T>().then_some(finalize_payload::<T> as FinalizeFn),
        });
        self.by_type.insert(TypeId::of::<T>(), kind);
        #[cfg(feature = "tracing")]
        tracing::trace!(kind = index, name = std::any::type_name::<T>(), "kind_registered");
        kind
    }

    /// Kind of `T` if it was registered.
    #[must_use]
    pub fn lookup<T: HeapObject>(&self) -> Option<CellKind> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    #[inline]
    #[must_use]
    pub fn vtable(&self, kind: CellKind) -> &VTable {
        &self.vtables[kind.index()]
    }

    /// Number of registered kinds, built-ins included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vtables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vtables.is_empty()
    }

    /// Trace the payload of `cell` with `visitor`.
    ///
    /// # Safety
    ///
    /// `cell` must be a well-formed cell whose kind belongs to this table.
    #[inline]
    pub unsafe fn trace(&self, cell: NonNull<GcCell>, visitor: &mut dyn SlotVisitor) {
        // SAFETY: guaranteed by the caller.
        unsafe {
            let trace = self.vtable(cell.as_ref().kind()).trace;
            trace(cell, visitor);
        }
    }

    /// Run the finalizer of `cell`'s kind, if it has one. Returns whether a
    /// finalizer ran.
    ///
    /// # Safety
    ///
    /// `cell` must be a dead, live-state cell whose payload is never used
    /// again.
    pub unsafe fn finalize(&self, cell: NonNull<GcCell>) -> bool {
        // SAFETY: guaranteed by the caller.
        unsafe {
            match self.vtable(cell.as_ref().kind()).finalize {
                Some(finalize) => {
                    finalize(cell);
                    true
                }
                None => false,
            }
        }
    }
}

/// Layout of the built-in slot array: a `u32` length, padding, then the
/// elements.
pub mod slot_array {
    use super::{
        CellKind, GcCell, NonNull, SlotVisitor, TaggedValue, VTable, CELL_ALIGN, HEADER_SIZE,
    };
    use crate::cell::cell_size;

    const ELEMENTS_OFFSET: usize = 8;

    pub(super) const VTABLE: VTable = VTable {
        name: "SlotArray",
        size: 0,
        trace,
        finalize: None,
    };

    /// Allocated size of an array of `len` elements, or `None` on overflow.
    #[must_use]
    pub fn size_for(len: usize) -> Option<usize> {
        let payload = len
            .checked_mul(std::mem::size_of::<TaggedValue>())?
            .checked_add(ELEMENTS_OFFSET)?;
        if payload > usize::MAX - HEADER_SIZE - CELL_ALIGN {
            return None;
        }
        Some(cell_size(payload))
    }

    /// Write the length and `Undefined` elements into a fresh cell.
    ///
    /// # Safety
    ///
    /// `cell` must have been allocated with `size_for(len)` bytes.
    pub(crate) unsafe fn init(cell: NonNull<GcCell>, len: u32) {
        // SAFETY: guaranteed by the caller.
        unsafe {
            debug_assert_eq!(cell.as_ref().kind(), CellKind::SLOT_ARRAY);
            let payload = GcCell::payload(cell);
            payload.cast::<u32>().write(len);
            let elements = elements(cell);
            for i in 0..len as usize {
                elements.add(i).write(TaggedValue::Undefined);
            }
        }
    }

    /// Number of elements.
    ///
    /// # Safety
    ///
    /// `cell` must be a slot array.
    #[must_use]
    pub unsafe fn len(cell: NonNull<GcCell>) -> usize {
        // SAFETY: guaranteed by the caller.
        unsafe { GcCell::payload_unchecked(cell).cast::<u32>().read() as usize }
    }

    /// Pointer to the first element.
    ///
    /// # Safety
    ///
    /// `cell` must be a slot array.
    #[must_use]
    pub unsafe fn elements(cell: NonNull<GcCell>) -> *mut TaggedValue {
        // SAFETY: guaranteed by the caller.
        unsafe {
            GcCell::payload_unchecked(cell)
                .add(ELEMENTS_OFFSET)
                .cast::<TaggedValue>()
                .as_ptr()
        }
    }

    unsafe fn trace(cell: NonNull<GcCell>, visitor: &mut dyn SlotVisitor) {
        // SAFETY: only registered for slot arrays.
        unsafe {
            let elements = elements(cell);
            for i in 0..len(cell) {
                visitor.accept_value(&mut *elements.add(i));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{cell_size, CellPtr};
    use std::rc::Rc;

    struct Pair {
        left: CellPtr,
        right: CellPtr,
    }

    unsafe impl Trace for Pair {
        fn trace(&mut self, visitor: &mut dyn SlotVisitor) {
            visitor.accept_ptr(&mut self.left);
            visitor.accept_ptr(&mut self.right);
        }
    }

    struct Owned(Rc<()>);

    unsafe impl Trace for Owned {
        fn trace(&mut self, _visitor: &mut dyn SlotVisitor) {}
    }

    #[test]
    fn test_registration_is_stable() {
        let mut table = KindTable::new();
        let a = table.kind_of::<Pair>();
        let b = table.kind_of::<u64>();
        assert_ne!(a, CellKind::SLOT_ARRAY);
        assert_ne!(a, b);
        assert_eq!(table.kind_of::<Pair>(), a);
        assert_eq!(table.lookup::<u64>(), Some(b));
        assert_eq!(table.lookup::<Owned>(), None);
        assert_eq!(table.len(), 3);
        assert_eq!(table.vtable(a).size, std::mem::size_of::<Pair>());
        assert!(table.vtable(a).finalize.is_none());
    }

    #[test]
    fn test_finalizer_drops_payload() {
        #[repr(C, align(8))]
        struct Buf([u8; 64]);

        let mut table = KindTable::new();
        let kind = table.kind_of::<Owned>();
        assert!(table.vtable(kind).finalize.is_some());

        let shared = Rc::new(());
        let mut buf = Buf([0; 64]);
        let at = NonNull::new(buf.0.as_mut_ptr()).unwrap();
        unsafe {
            let cell = GcCell::init(at, cell_size(std::mem::size_of::<Owned>()), kind);
            GcCell::payload(cell)
                .cast::<Owned>()
                .write(Owned(Rc::clone(&shared)));
            assert_eq!(Rc::strong_count(&shared), 2);
            assert!(table.finalize(cell));
        }
        assert_eq!(Rc::strong_count(&shared), 1);
    }

    #[test]
    fn test_slot_array_layout() {
        assert_eq!(slot_array::size_for(0), Some(cell_size(8)));
        assert_eq!(slot_array::size_for(2), Some(cell_size(8 + 32)));
        assert_eq!(slot_array::size_for(usize::MAX), None);
    }
}
