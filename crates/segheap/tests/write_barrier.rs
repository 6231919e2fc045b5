//! Write barrier and card table tests.

mod common;

use common::{small_heap, Node};
use segheap::{CellPtr, TaggedValue};

fn long_lived_holder(heap: &mut segheap::Heap) -> segheap::RootHandle {
    let holder = heap.alloc_long_lived(Node { value: 0, next: CellPtr::NULL });
    heap.new_root(holder)
}

#[test]
fn test_old_to_young_store_dirties_card() {
    let mut heap = small_heap();
    let root = long_lived_holder(&mut heap);
    let young = heap.alloc(Node { value: 42, next: CellPtr::NULL });

    let holder = heap.root(root);
    // SAFETY: no collection since `holder` was read from the root.
    let slot = unsafe {
        heap.set_ptr_field::<Node>(holder, young, |n| &mut n.next);
        std::ptr::addr_of!(heap.get::<Node>(holder).next) as usize
    };
    assert!(heap.old_gen().is_card_for_address_dirty(slot));
    heap.check_well_formed();
}

#[test]
fn test_old_to_old_store_leaves_card_clean() {
    let mut heap = small_heap();
    let root = long_lived_holder(&mut heap);
    let other = heap.alloc_long_lived(Node { value: 1, next: CellPtr::NULL });

    let holder = heap.root(root);
    // SAFETY: no collection since `holder` was read from the root.
    let slot = unsafe {
        heap.set_ptr_field::<Node>(holder, other, |n| &mut n.next);
        std::ptr::addr_of!(heap.get::<Node>(holder).next) as usize
    };
    assert!(!heap.old_gen().is_card_for_address_dirty(slot));
}

#[test]
fn test_card_keeps_young_referent_alive() {
    let mut heap = small_heap();
    let root = long_lived_holder(&mut heap);
    let young = heap.alloc(Node { value: 42, next: CellPtr::NULL });
    let holder = heap.root(root);
    // SAFETY: no collection since `holder` was read from the root.
    unsafe { heap.set_ptr_field::<Node>(holder, young, |n| &mut n.next) };

    heap.collect_young();

    let holder = heap.root(root);
    // SAFETY: read back from the root after the collection.
    let next = unsafe { heap.get::<Node>(holder) }.next;
    assert!(heap.old_gen().contains(next.addr()));
    assert_eq!(unsafe { heap.get::<Node>(next) }.value, 42);
    assert!(heap.young_gen().is_empty());
    heap.check_well_formed();
}

#[test]
fn test_array_element_store_keeps_referent_alive() {
    let mut heap = small_heap();
    let arr = heap.alloc_array(8);
    let root = heap.new_root(arr);
    heap.collect_young();

    let arr = heap.root(root);
    assert!(heap.old_gen().contains(arr.addr()));
    let young = heap.alloc(Node { value: 7, next: CellPtr::NULL });
    // SAFETY: no collection since `arr` was read from the root.
    unsafe { heap.array_set(arr, 5, TaggedValue::Object(young)) };

    heap.collect_young();

    let arr = heap.root(root);
    // SAFETY: read back from the root after the collection.
    unsafe {
        let item = heap.array_get(arr, 5).as_ptr().unwrap();
        assert!(heap.old_gen().contains(item.addr()));
        assert_eq!(heap.get::<Node>(item).value, 7);
    }
}

#[test]
fn test_manual_barrier_after_raw_store() {
    let mut heap = small_heap();
    let root = long_lived_holder(&mut heap);
    let young = heap.alloc(Node { value: 3, next: CellPtr::NULL });
    let holder = heap.root(root);
    // SAFETY: no collection since `holder` was read from the root.
    let slot = unsafe {
        let node = heap.get_mut::<Node>(holder);
        node.next = young;
        std::ptr::addr_of!(node.next)
    };
    heap.write_barrier(slot, young);

    heap.collect_young();

    let holder = heap.root(root);
    // SAFETY: read back from the root after the collection.
    let next = unsafe { heap.get::<Node>(holder) }.next;
    assert_eq!(unsafe { heap.get::<Node>(next) }.value, 3);
}

#[test]
fn test_long_lived_init_with_young_reference() {
    let mut heap = small_heap();
    let young = heap.alloc(Node { value: 5, next: CellPtr::NULL });
    let holder = heap.alloc_long_lived(Node { value: 0, next: young });
    let root = heap.new_root(holder);
    heap.check_well_formed();

    heap.collect_young();

    let holder = heap.root(root);
    // SAFETY: read back from the root after the collection.
    let next = unsafe { heap.get::<Node>(holder) }.next;
    assert_eq!(unsafe { heap.get::<Node>(next) }.value, 5);
}

#[test]
fn test_cards_cleaned_by_young_collection() {
    let mut heap = small_heap();
    let root = long_lived_holder(&mut heap);
    let young = heap.alloc(Node { value: 1, next: CellPtr::NULL });
    let holder = heap.root(root);
    // SAFETY: no collection since `holder` was read from the root.
    unsafe { heap.set_ptr_field::<Node>(holder, young, |n| &mut n.next) };

    heap.collect_young();

    let holder = heap.root(root);
    // SAFETY: read back from the root after the collection.
    let slot = unsafe { std::ptr::addr_of!(heap.get::<Node>(holder).next) as usize };
    assert!(!heap.old_gen().is_card_for_address_dirty(slot));
}
