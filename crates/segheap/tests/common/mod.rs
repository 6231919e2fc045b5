//! Shared configuration and payload types for the integration tests.

#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use segheap::{
    CellPtr, CountingStorageProvider, GcConfig, Heap, MmapStorageProvider, SlotVisitor,
    StorageCounters, Trace,
};

pub const SEGMENT: usize = 64 << 10;
pub const NURSERY: usize = 16 << 10;

/// 64 KiB segments, a 16 KiB nursery, one to eight old segments.
pub fn small_config() -> GcConfig {
    GcConfig::default()
        .with_segment_size(SEGMENT)
        .with_young_size(NURSERY)
        .with_old_bounds(SEGMENT, 8 * SEGMENT)
}

pub fn small_heap() -> Heap {
    Heap::new(small_config()).unwrap()
}

/// A heap whose segment traffic is counted.
pub fn counting_heap(config: GcConfig) -> (Heap, Arc<StorageCounters>) {
    let provider =
        CountingStorageProvider::new(Box::new(MmapStorageProvider::new(config.segment_size)));
    let counters = provider.counters();
    let heap = Heap::with_storage_provider(config, Box::new(provider)).unwrap();
    (heap, counters)
}

/// A singly linked list node.
pub struct Node {
    pub value: u64,
    pub next: CellPtr,
}

unsafe impl Trace for Node {
    fn trace(&mut self, visitor: &mut dyn SlotVisitor) {
        visitor.accept_ptr(&mut self.next);
    }
}

/// A 1 KiB cell with no slots.
pub struct Blob {
    pub id: u64,
    pub pad: [u64; 125],
}

impl Blob {
    pub const fn new(id: u64) -> Self {
        Self { id, pad: [id; 125] }
    }
}

unsafe impl Trace for Blob {
    fn trace(&mut self, _visitor: &mut dyn SlotVisitor) {}
}

/// Counts its drops.
pub struct Dropper(pub Rc<Cell<usize>>);

unsafe impl Trace for Dropper {
    fn trace(&mut self, _visitor: &mut dyn SlotVisitor) {}
}

impl Drop for Dropper {
    fn drop(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

/// Build a rooted list holding `0..len`, head first, and return the root
/// slot holding the head.
pub fn build_list(heap: &mut Heap, len: u64) -> segheap::RootHandle {
    let head = heap.new_root(CellPtr::NULL);
    for value in (0..len).rev() {
        let next = heap.root(head);
        let node = heap.alloc(Node { value, next });
        heap.set_root(head, node);
    }
    head
}

/// Values of the list starting at `head`.
pub fn list_values(heap: &Heap, head: CellPtr) -> Vec<u64> {
    let mut values = Vec::new();
    let mut cur = head;
    while !cur.is_null() {
        // SAFETY: no collection runs during the walk.
        let node = unsafe { heap.get::<Node>(cur) };
        values.push(node.value);
        cur = node.next;
    }
    values
}
