//! Basic allocation and collection tests for segheap.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::{build_list, list_values, small_config, small_heap, Blob, Dropper, Node};
use segheap::{CellPtr, GcConfig, GcPhase, Heap, TaggedValue};

#[test]
fn test_basic_allocation() {
    let mut heap = Heap::new(GcConfig::default()).unwrap();
    let x = heap.alloc(42u64);
    assert!(heap.contains(x));
    assert!(heap.young_gen().contains(x.addr()));
    // SAFETY: no collection since the allocation.
    assert_eq!(unsafe { *heap.get::<u64>(x) }, 42);
    assert_eq!(heap.phase(), GcPhase::Idle);
}

#[test]
fn test_rooted_cell_survives_young_collection() {
    let mut heap = small_heap();
    let x = heap.alloc(String::from("hello"));
    let root = heap.new_root(x);

    heap.collect_young();

    let x = heap.root(root);
    assert!(heap.old_gen().contains(x.addr()));
    assert!(heap.young_gen().is_empty());
    // SAFETY: read back from the root after the collection.
    assert_eq!(unsafe { heap.get::<String>(x) }, "hello");
}

#[test]
fn test_unrooted_cells_are_reclaimed() {
    let mut heap = small_heap();
    for i in 0..10 {
        heap.alloc(Blob::new(i));
    }
    heap.collect_full();
    assert_eq!(heap.bytes_used(), 0);
    assert_eq!(heap.info().total_used(), 0);
}

#[test]
fn test_list_survives_many_collections() {
    let mut heap = small_heap();
    let head = build_list(&mut heap, 2_000);

    // Garbage to force more collections.
    for i in 0..200 {
        heap.alloc(Blob::new(i));
    }
    heap.collect_full();
    heap.collect_young();

    let values = list_values(&heap, heap.root(head));
    assert_eq!(values, (0..2_000).collect::<Vec<_>>());
    let info = heap.info();
    assert!(info.num_young_collections > 0);
    heap.check_well_formed();
}

#[test]
fn test_cycles_are_collected() {
    let mut heap = small_heap();
    let a = heap.alloc(Node { value: 1, next: CellPtr::NULL });
    let root = heap.new_root(a);
    let b = heap.alloc(Node { value: 2, next: heap.root(root) });
    let a = heap.root(root);
    // SAFETY: no collection since `a` was read from the root.
    unsafe { heap.set_ptr_field::<Node>(a, b, |n| &mut n.next) };
    heap.collect_full();
    assert_eq!(heap.bytes_used(), 2 * segheap::cell::cell_size(std::mem::size_of::<Node>()));

    heap.drop_root(root);
    heap.collect_full();
    assert_eq!(heap.bytes_used(), 0);
}

#[test]
fn test_finalizers_run_for_dead_cells_only() {
    let drops = Rc::new(Cell::new(0));
    let mut heap = small_heap();
    let keep = heap.alloc(Dropper(Rc::clone(&drops)));
    let root = heap.new_root(keep);
    for _ in 0..50 {
        heap.alloc(Dropper(Rc::clone(&drops)));
    }

    heap.collect_young();
    assert_eq!(drops.get(), 50);
    assert_eq!(heap.last_gc_metrics().cells_finalized, 50);

    heap.collect_full();
    assert_eq!(drops.get(), 50);

    heap.drop_root(root);
    heap.collect_full();
    assert_eq!(drops.get(), 51);
}

#[test]
fn test_drop_finalizes_survivors() {
    let drops = Rc::new(Cell::new(0));
    {
        let mut heap = small_heap();
        let a = heap.alloc(Dropper(Rc::clone(&drops)));
        heap.new_root(a);
        let b = heap.alloc_long_lived(Dropper(Rc::clone(&drops)));
        heap.new_root(b);
        heap.collect_young();
        assert_eq!(drops.get(), 0);
    }
    assert_eq!(drops.get(), 2);
}

#[test]
fn test_arrays_hold_values() {
    let mut heap = small_heap();
    let arr = heap.alloc_array(4);
    let root = heap.new_root(arr);
    let item = heap.alloc(Node { value: 9, next: CellPtr::NULL });

    let arr = heap.root(root);
    // SAFETY: no collection since `arr` was read from the root.
    unsafe {
        assert_eq!(heap.array_len(arr), 4);
        assert_eq!(heap.array_get(arr, 0), TaggedValue::Undefined);
        heap.array_set(arr, 0, TaggedValue::Number(1.5));
        heap.array_set(arr, 1, TaggedValue::Bool(true));
        heap.array_set(arr, 2, item.into());
        heap.array_set(arr, 3, TaggedValue::Null);
    }

    heap.collect_young();
    heap.collect_full();

    let arr = heap.root(root);
    // SAFETY: read back from the root after the collections.
    unsafe {
        assert_eq!(heap.array_get(arr, 0), TaggedValue::Number(1.5));
        assert_eq!(heap.array_get(arr, 1), TaggedValue::Bool(true));
        assert_eq!(heap.array_get(arr, 3), TaggedValue::Null);
        let item = heap.array_get(arr, 2).as_ptr().unwrap();
        assert_eq!(heap.get::<Node>(item).value, 9);
    }
}

#[test]
#[should_panic(expected = "out of bounds")]
fn test_array_index_checked() {
    let mut heap = small_heap();
    let arr = heap.alloc_array(2);
    // SAFETY: `arr` is live; the bounds check fails first.
    let _ = unsafe { heap.array_get(arr, 2) };
}

#[test]
fn test_large_cells_skip_the_nursery() {
    let mut heap = Heap::new(small_config()).unwrap();
    // Larger than the 16 KiB nursery, smaller than a segment.
    let arr = heap.alloc_array(4_000);
    assert!(heap.old_gen().contains(arr.addr()));
    // SAFETY: no collection since the allocation.
    assert_eq!(unsafe { heap.array_len(arr) }, 4_000);
}

#[test]
fn test_for_all_objs_visits_both_generations() {
    let mut heap = small_heap();
    let old = heap.alloc_long_lived(1u64);
    let young = heap.alloc(2u64);
    let mut seen = Vec::new();
    heap.for_all_objs(|p| seen.push(p));
    assert_eq!(seen, vec![old, young]);
}
