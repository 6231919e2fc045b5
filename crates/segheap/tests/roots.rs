//! Root set, scopes and root providers.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use common::{small_heap, Dropper, Node};
use segheap::{CellPtr, SlotVisitor};

#[test]
fn test_scope_releases_roots() {
    let drops = Rc::new(Cell::new(0));
    let mut heap = small_heap();

    heap.enter_scope();
    for _ in 0..3 {
        let d = heap.alloc(Dropper(Rc::clone(&drops)));
        heap.new_root(d);
    }
    assert_eq!(heap.root_set().len(), 3);
    assert_eq!(heap.root_set().scope_depth(), 1);
    heap.collect_young();
    assert_eq!(drops.get(), 0);

    heap.exit_scope();
    assert_eq!(heap.root_set().len(), 0);
    heap.collect_full();
    assert_eq!(drops.get(), 3);
}

#[test]
fn test_outer_root_dropped_inside_scope() {
    let mut heap = small_heap();
    let outer = heap.alloc(1u64);
    let outer = heap.new_root(outer);

    heap.enter_scope();
    heap.drop_root(outer);
    let inner = heap.alloc(2u64);
    heap.new_root(inner);
    heap.exit_scope();
    assert_eq!(heap.root_set().len(), 0);

    heap.collect_full();
    assert_eq!(heap.old_gen().used(), 0);
    assert_eq!(heap.info().total_used(), 0);
}

#[test]
fn test_nested_scopes() {
    let mut heap = small_heap();
    let outer = heap.alloc(1u64);
    let outer = heap.new_root(outer);
    heap.enter_scope();
    let a = heap.alloc(2u64);
    heap.new_root(a);
    heap.enter_scope();
    let b = heap.alloc(3u64);
    heap.new_root(b);
    assert_eq!(heap.root_set().len(), 3);
    heap.exit_scope();
    assert_eq!(heap.root_set().len(), 2);
    heap.exit_scope();
    assert_eq!(heap.root_set().len(), 1);

    heap.collect_full();
    // SAFETY: read from a root after the collection.
    assert_eq!(unsafe { *heap.get::<u64>(heap.root(outer)) }, 1);
    assert_eq!(heap.bytes_used(), segheap::cell::cell_size(8));
}

#[test]
fn test_dropped_root_slot_is_cleared() {
    let mut heap = small_heap();
    let a = heap.alloc(1u64);
    let a = heap.new_root(a);
    let b = heap.alloc(2u64);
    let b = heap.new_root(b);
    heap.drop_root(a);
    heap.drop_root(a);
    heap.collect_full();
    assert_eq!(heap.bytes_used(), segheap::cell::cell_size(8));
    // SAFETY: read from a root after the collection.
    assert_eq!(unsafe { *heap.get::<u64>(heap.root(b)) }, 2);
}

#[test]
fn test_root_provider_slots_are_updated() {
    let mut heap = small_heap();
    let node = heap.alloc(Node { value: 11, next: CellPtr::NULL });
    let slot = Rc::new(RefCell::new(node));

    let provider_slot = Rc::clone(&slot);
    heap.add_root_provider(move |visitor: &mut dyn SlotVisitor| {
        visitor.accept_ptr(&mut provider_slot.borrow_mut());
    });

    heap.collect_young();
    let moved = *slot.borrow();
    assert_ne!(moved, node);
    assert!(heap.old_gen().contains(moved.addr()));

    heap.collect_full();
    let moved = *slot.borrow();
    // SAFETY: read from the provider's slot after the collections.
    assert_eq!(unsafe { heap.get::<Node>(moved) }.value, 11);
}

#[test]
fn test_set_root_replaces_value() {
    let mut heap = small_heap();
    let a = heap.alloc(1u64);
    let root = heap.new_root(a);
    let b = heap.alloc(2u64);
    heap.set_root(root, b);
    heap.collect_full();
    // SAFETY: read from a root after the collection.
    assert_eq!(unsafe { *heap.get::<u64>(heap.root(root)) }, 2);
    assert_eq!(heap.bytes_used(), segheap::cell::cell_size(8));
}
