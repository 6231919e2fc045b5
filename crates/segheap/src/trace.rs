//! Trace trait and slot visitors.
//!
//! The collector never knows the concrete layout of a payload. It hands a
//! [`SlotVisitor`] to the payload's [`Trace`] implementation, which reports
//! every pointer and tagged-value slot it owns. Marking, promotion and
//! reference updating are all visitors.

use crate::cell::{CellPtr, TaggedValue};

// ============================================================================
// Core Traits
// ============================================================================

/// A payload type that can live in the heap.
///
/// # Safety
///
/// Implementations **MUST** report every [`CellPtr`] and [`TaggedValue`]
/// slot stored inline in `self`, by passing a mutable reference to the slot
/// itself. The collector rewrites slots through these references when it
/// moves objects; a missed slot dangles after the next collection.
///
/// Slots must live inline in the payload. Containers that keep their
/// elements in a separate allocation (such as `Vec`) do not implement
/// `Trace`: the write barrier can only map in-heap slot addresses to cards.
///
/// Prefer `#[derive(Trace)]` over manual implementations.
pub unsafe trait Trace {
    /// Report every slot of `self` to `visitor`.
    fn trace(&mut self, visitor: &mut dyn SlotVisitor);
}

/// Receives the slots of traced payloads.
pub trait SlotVisitor {
    /// Visit a pointer slot.
    fn accept_ptr(&mut self, slot: &mut CellPtr);

    /// Visit a tagged-value slot. Object values are forwarded to
    /// [`accept_ptr`](Self::accept_ptr) by default.
    fn accept_value(&mut self, slot: &mut TaggedValue) {
        if let TaggedValue::Object(ptr) = slot {
            self.accept_ptr(ptr);
        }
    }
}

/// Forwards only slots whose address lies in `[lo, hi)`.
///
/// Card scanning uses this for objects that straddle the edge of a dirty
/// run, so slots on clean cards are not revisited. A tagged value is
/// filtered by the address of the whole value, matching the address the
/// write barrier records.
pub struct RangeVisitor<'a> {
    inner: &'a mut dyn SlotVisitor,
    lo: usize,
    hi: usize,
}

impl<'a> RangeVisitor<'a> {
    pub fn new(inner: &'a mut dyn SlotVisitor, lo: usize, hi: usize) -> Self {
        Self { inner, lo, hi }
    }

    #[inline]
    fn in_range<T>(&self, slot: *const T) -> bool {
        let addr = slot as usize;
        addr >= self.lo && addr < self.hi
    }
}

impl SlotVisitor for RangeVisitor<'_> {
    fn accept_ptr(&mut self, slot: &mut CellPtr) {
        if self.in_range(std::ptr::from_mut(slot)) {
            self.inner.accept_ptr(slot);
        }
    }

    fn accept_value(&mut self, slot: &mut TaggedValue) {
        if self.in_range(std::ptr::from_mut(slot)) {
            self.inner.accept_value(slot);
        }
    }
}

/// Adapts a closure over pointer slots into a [`SlotVisitor`].
pub struct FnVisitor<F>(pub F);

impl<F: FnMut(&mut CellPtr)> SlotVisitor for FnVisitor<F> {
    fn accept_ptr(&mut self, slot: &mut CellPtr) {
        (self.0)(slot);
    }
}

// ============================================================================
// Trace implementations
// ============================================================================

unsafe impl Trace for CellPtr {
    #[inline]
    fn trace(&mut self, visitor: &mut dyn SlotVisitor) {
        visitor.accept_ptr(self);
    }
}

unsafe impl Trace for TaggedValue {
    #[inline]
    fn trace(&mut self, visitor: &mut dyn SlotVisitor) {
        visitor.accept_value(self);
    }
}

macro_rules! impl_trace_leaf {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl Trace for $t {
                #[inline(always)]
                fn trace(&mut self, _visitor: &mut dyn SlotVisitor) {}
            }
        )*
    };
}

impl_trace_leaf!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    &'static str,
);

unsafe impl<T: Trace> Trace for Option<T> {
    #[inline]
    fn trace(&mut self, visitor: &mut dyn SlotVisitor) {
        if let Some(value) = self {
            value.trace(visitor);
        }
    }
}

unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    #[inline]
    fn trace(&mut self, visitor: &mut dyn SlotVisitor) {
        for item in self {
            item.trace(visitor);
        }
    }
}

unsafe impl<T: Trace> Trace for std::cell::Cell<T> {
    #[inline]
    fn trace(&mut self, visitor: &mut dyn SlotVisitor) {
        self.get_mut().trace(visitor);
    }
}

macro_rules! impl_trace_tuple {
    ($($name:ident),+) => {
        unsafe impl<$($name: Trace),+> Trace for ($($name,)+) {
            #[inline]
            #[allow(non_snake_case)]
            fn trace(&mut self, visitor: &mut dyn SlotVisitor) {
                let ($($name,)+) = self;
                $($name.trace(visitor);)+
            }
        }
    };
}

impl_trace_tuple!(A);
impl_trace_tuple!(A, B);
impl_trace_tuple!(A, B, C);
impl_trace_tuple!(A, B, C, D);

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    struct Counter {
        ptrs: usize,
        values: usize,
    }

    impl SlotVisitor for Counter {
        fn accept_ptr(&mut self, _slot: &mut CellPtr) {
            self.ptrs += 1;
        }

        fn accept_value(&mut self, _slot: &mut TaggedValue) {
            self.values += 1;
        }
    }

    fn fake_ptr(addr: usize) -> CellPtr {
        CellPtr::from_cell(NonNull::new(addr as *mut _).unwrap())
    }

    #[test]
    fn test_composite_trace_reports_every_slot() {
        let mut value = (
            fake_ptr(0x1000),
            Some([TaggedValue::Null, TaggedValue::Number(1.0)]),
            42_u64,
        );
        let mut counter = Counter { ptrs: 0, values: 0 };
        value.trace(&mut counter);
        assert_eq!(counter.ptrs, 1);
        assert_eq!(counter.values, 2);
    }

    #[test]
    fn test_default_accept_value_forwards_objects() {
        let mut seen = Vec::new();
        let mut visitor = FnVisitor(|slot: &mut CellPtr| seen.push(slot.addr()));
        let mut values = [
            TaggedValue::Object(fake_ptr(0x2000)),
            TaggedValue::Bool(true),
            TaggedValue::Object(fake_ptr(0x3000)),
        ];
        values.trace(&mut visitor);
        assert_eq!(seen, vec![0x2000, 0x3000]);
    }

    #[test]
    fn test_range_visitor_filters_by_slot_address() {
        let mut slots = [fake_ptr(0x10), fake_ptr(0x20), fake_ptr(0x30), fake_ptr(0x40)];
        let base = slots.as_ptr() as usize;
        let width = std::mem::size_of::<CellPtr>();

        let mut counter = Counter { ptrs: 0, values: 0 };
        let mut range = RangeVisitor::new(&mut counter, base + width, base + 3 * width);
        slots.trace(&mut range);
        assert_eq!(counter.ptrs, 2);
    }
}
