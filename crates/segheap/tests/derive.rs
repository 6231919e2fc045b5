//! Tests for `#[derive(Trace)]`.

#![cfg(feature = "derive")]

mod common;

use common::small_heap;
use segheap::{CellPtr, FnVisitor, SlotVisitor, TaggedValue, Trace};

#[derive(Trace)]
struct Pair {
    left: CellPtr,
    right: CellPtr,
    #[segheap(skip)]
    hidden: CellPtr,
    weight: u32,
}

#[derive(Trace)]
struct Wrapper(CellPtr, u64, TaggedValue);

#[derive(Trace)]
enum Shape {
    Empty,
    One(CellPtr),
    Named { first: CellPtr, label: u32 },
}

#[derive(Trace)]
struct Generic<T> {
    inner: T,
}

fn count_ptrs(value: &mut impl Trace) -> usize {
    let mut count = 0;
    value.trace(&mut FnVisitor(|_: &mut CellPtr| count += 1));
    count
}

#[test]
fn test_struct_fields_are_traced() {
    let mut heap = small_heap();
    let a = heap.alloc(1u64);
    let b = heap.alloc(2u64);
    let mut pair = Pair {
        left: a,
        right: b,
        hidden: a,
        weight: 3,
    };
    assert_eq!(count_ptrs(&mut pair), 2);
    assert_eq!(pair.weight, 3);
    assert_eq!(pair.hidden, a);
}

#[test]
fn test_tuple_struct_and_values() {
    let mut heap = small_heap();
    let a = heap.alloc(1u64);
    let mut w = Wrapper(a, 0, TaggedValue::Object(a));
    assert_eq!(count_ptrs(&mut w), 2);
}

#[test]
fn test_enum_variants() {
    let mut heap = small_heap();
    let a = heap.alloc(1u64);
    assert_eq!(count_ptrs(&mut Shape::Empty), 0);
    assert_eq!(count_ptrs(&mut Shape::One(a)), 1);
    assert_eq!(count_ptrs(&mut Shape::Named { first: a, label: 1 }), 1);
}

#[test]
fn test_generic_struct() {
    let mut heap = small_heap();
    let a = heap.alloc(1u64);
    let mut g = Generic { inner: [a, a, CellPtr::NULL] };
    assert_eq!(count_ptrs(&mut g), 3);
}

#[test]
fn test_derived_payload_survives_collection() {
    let mut heap = small_heap();
    let left = heap.alloc(10u64);
    let right = heap.alloc(20u64);
    let pair = heap.alloc(Pair {
        left,
        right,
        hidden: CellPtr::NULL,
        weight: 1,
    });
    let root = heap.new_root(pair);

    heap.collect_young();
    heap.collect_full();

    let pair = heap.root(root);
    // SAFETY: read from a root after the collections.
    unsafe {
        let pair = heap.get::<Pair>(pair);
        assert_eq!(*heap.get::<u64>(pair.left), 10);
        assert_eq!(*heap.get::<u64>(pair.right), 20);
    }
}

struct Counter(usize);

impl SlotVisitor for Counter {
    fn accept_ptr(&mut self, _slot: &mut CellPtr) {
        self.0 += 1;
    }
}

#[test]
fn test_option_fields() {
    #[derive(Trace)]
    struct Maybe {
        a: Option<CellPtr>,
        b: Option<CellPtr>,
    }

    let mut heap = small_heap();
    let p = heap.alloc(1u64);
    let mut m = Maybe { a: Some(p), b: None };
    let mut counter = Counter(0);
    m.trace(&mut counter);
    assert_eq!(counter.0, 1);
}
