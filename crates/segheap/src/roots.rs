//! Root tracking.
//!
//! The heap keeps its own table of root slots. Handles are indices into
//! the table, so a collection can rewrite the slot when the referent moves
//! and the handle stays valid. Scopes release every root registered since
//! they were entered.

use crate::cell::CellPtr;
use crate::trace::SlotVisitor;

// ============================================================================
// RootSet
// ============================================================================

/// A handle to a slot in a [`RootSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle(usize);

impl RootHandle {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Table of root slots.
#[derive(Debug, Default)]
pub struct RootSet {
    slots: Vec<CellPtr>,
    /// Indices of dropped slots below the innermost scope marker.
    free: Vec<usize>,
    /// Slot count at each `enter_scope`.
    frame_markers: Vec<usize>,
}

impl RootSet {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            frame_markers: Vec::new(),
        }
    }

    /// Register `ptr` as a root.
    pub fn push(&mut self, ptr: CellPtr) -> RootHandle {
        // Inside a scope, reusing a slot from an outer scope would let
        // `exit_scope` keep it alive past its own lifetime.
        if self.frame_markers.is_empty() {
            if let Some(index) = self.free.pop() {
                self.slots[index] = ptr;
                return RootHandle(index);
            }
        }
        self.slots.push(ptr);
        RootHandle(self.slots.len() - 1)
    }

    /// # Panics
    ///
    /// Panics if `handle` was released by `exit_scope`.
    #[must_use]
    pub fn get(&self, handle: RootHandle) -> CellPtr {
        self.slots[handle.0]
    }

    /// # Panics
    ///
    /// Panics if `handle` was released by `exit_scope`.
    pub fn set(&mut self, handle: RootHandle, ptr: CellPtr) {
        self.slots[handle.0] = ptr;
    }

    /// Release one root. The slot is cleared so it no longer keeps its
    /// referent alive.
    pub fn remove(&mut self, handle: RootHandle) {
        if self.free.contains(&handle.0) {
            return;
        }
        if let Some(slot) = self.slots.get_mut(handle.0) {
            *slot = CellPtr::NULL;
            // Popping below the innermost marker would hand that index to a
            // root of the open scope, which `exit_scope` then fails to drop.
            let in_open_scope = self
                .frame_markers
                .last()
                .is_none_or(|&marker| handle.0 >= marker);
            if handle.0 + 1 == self.slots.len() && in_open_scope {
                self.slots.pop();
            } else {
                self.free.push(handle.0);
            }
        }
    }

    /// Start a scope; [`exit_scope`](Self::exit_scope) releases every root
    /// registered after this call.
    pub fn enter_scope(&mut self) {
        self.frame_markers.push(self.slots.len());
    }

    /// End the innermost scope. Does nothing without an open scope.
    pub fn exit_scope(&mut self) {
        if let Some(marker) = self.frame_markers.pop() {
            self.slots.truncate(marker);
            self.free.retain(|&index| index < marker);
        }
    }

    #[must_use]
    pub fn scope_depth(&self) -> usize {
        self.frame_markers.len()
    }

    /// Number of live roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every non-null root slot.
    pub fn visit(&mut self, visitor: &mut dyn SlotVisitor) {
        for slot in &mut self.slots {
            if !slot.is_null() {
                visitor.accept_ptr(slot);
            }
        }
    }
}

// ============================================================================
// RootProvider
// ============================================================================

/// Additional roots owned by the embedder, such as interpreter registers.
///
/// Every slot reported to the visitor may be rewritten by the collector.
pub trait RootProvider {
    fn mark_roots(&mut self, visitor: &mut dyn SlotVisitor);
}

impl<F> RootProvider for F
where
    F: FnMut(&mut dyn SlotVisitor),
{
    fn mark_roots(&mut self, visitor: &mut dyn SlotVisitor) {
        self(visitor);
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;

    use super::*;
    use crate::cell::GcCell;
    use crate::trace::FnVisitor;

    fn fake_ptr(addr: usize) -> CellPtr {
        CellPtr::from_cell(NonNull::new(addr as *mut GcCell).unwrap())
    }

    fn collect(roots: &mut RootSet) -> Vec<usize> {
        let mut seen = Vec::new();
        roots.visit(&mut FnVisitor(|slot: &mut CellPtr| seen.push(slot.addr())));
        seen
    }

    #[test]
    fn test_push_get_set() {
        let mut roots = RootSet::new();
        let a = roots.push(fake_ptr(0x1000));
        let b = roots.push(fake_ptr(0x2000));
        assert_eq!(roots.get(a).addr(), 0x1000);
        roots.set(b, fake_ptr(0x3000));
        assert_eq!(collect(&mut roots), vec![0x1000, 0x3000]);
        assert_eq!(roots.len(), 2);
    }

    #[test]
    fn test_remove_reuses_slots() {
        let mut roots = RootSet::new();
        let a = roots.push(fake_ptr(0x1000));
        let _b = roots.push(fake_ptr(0x2000));
        roots.remove(a);
        assert_eq!(roots.len(), 1);
        assert_eq!(collect(&mut roots), vec![0x2000]);

        let c = roots.push(fake_ptr(0x4000));
        assert_eq!(c, a);
        assert_eq!(roots.len(), 2);
    }

    #[test]
    fn test_scopes_release_inner_roots() {
        let mut roots = RootSet::new();
        let outer = roots.push(fake_ptr(0x1000));
        let dropped = roots.push(fake_ptr(0x1800));
        roots.push(fake_ptr(0x1c00));
        roots.remove(dropped);

        roots.enter_scope();
        let inner = roots.push(fake_ptr(0x2000));
        assert_ne!(inner, dropped);
        roots.enter_scope();
        roots.push(fake_ptr(0x3000));
        assert_eq!(roots.scope_depth(), 2);

        roots.exit_scope();
        assert_eq!(collect(&mut roots), vec![0x1000, 0x1c00, 0x2000]);
        roots.exit_scope();
        assert_eq!(collect(&mut roots), vec![0x1000, 0x1c00]);
        assert_eq!(roots.get(outer).addr(), 0x1000);

        // Unbalanced exits are ignored.
        roots.exit_scope();
        assert_eq!(roots.len(), 2);
    }

    #[test]
    fn test_outer_root_dropped_inside_scope() {
        let mut roots = RootSet::new();
        let outer = roots.push(fake_ptr(0x1000));

        roots.enter_scope();
        roots.remove(outer);
        let inner = roots.push(fake_ptr(0x2000));
        assert_ne!(inner, outer);
        roots.exit_scope();

        assert!(roots.is_empty());
        assert!(collect(&mut roots).is_empty());

        let reused = roots.push(fake_ptr(0x3000));
        assert_eq!(reused, outer);
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn test_closure_provider() {
        let mut registers = [fake_ptr(0x5000), CellPtr::NULL];
        let mut provider = |visitor: &mut dyn SlotVisitor| {
            for slot in &mut registers {
                visitor.accept_ptr(slot);
            }
        };
        let mut count = 0;
        provider.mark_roots(&mut FnVisitor(|_: &mut CellPtr| count += 1));
        assert_eq!(count, 2);
    }
}
