//! The scoped heap: a slab arena of objects plus a tree of GC scopes.
//!
//! Every heap object is owned by exactly one scope. Scopes are destroyed in
//! bulk: tearing one down destroys every object it owns, in insertion order.
//! A value that must outlive its scope is *moved*, i.e. re-parented to an
//! ancestor scope, transitively through everything it references.
//!
//! Objects are addressed by [`ObjRef`], a slot index paired with a
//! generation counter. A stale reference (its object was torn down with its
//! scope) no longer resolves, so a scoping bug surfaces as a lookup failure
//! instead of touching unrelated memory.

use crate::object::Payload;
use crate::value::Value;

/// Reference to a heap object: slab slot + generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

/// Identifier of a GC scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(u32);

/// Scope id of the engine root scope, alive for the engine's lifetime.
pub const ROOT_SCOPE: ScopeId = ScopeId(0);

#[derive(Debug)]
struct Slot {
    generation: u32,
    object: Option<HeapObject>,
}

/// A heap-allocated object: its payload plus the scope that owns it.
#[derive(Debug)]
pub struct HeapObject {
    pub scope: ScopeId,
    pub payload: Payload,
}

#[derive(Debug)]
struct ScopeData {
    parent: Option<ScopeId>,
    /// Distance from the root. Strictly greater than the parent's depth, so
    /// "move only toward ancestors" is checkable as a depth comparison.
    depth: u32,
    /// Owned object slots in insertion order.
    owned: Vec<u32>,
    alive: bool,
}

/// The slab arena and scope tree.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    scopes: Vec<ScopeData>,
    scope_free: Vec<u32>,
}

impl Heap {
    /// Create a heap with the root scope already in place.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            scopes: vec![ScopeData {
                parent: None,
                depth: 0,
                owned: Vec::new(),
                alive: true,
            }],
            scope_free: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Scopes
    // -----------------------------------------------------------------------

    /// Create a child scope of `parent`.
    pub fn enter_scope(&mut self, parent: ScopeId) -> ScopeId {
        debug_assert!(self.scopes[parent.0 as usize].alive);
        let depth = self.scopes[parent.0 as usize].depth + 1;
        let data = ScopeData {
            parent: Some(parent),
            depth,
            owned: Vec::new(),
            alive: true,
        };
        match self.scope_free.pop() {
            Some(idx) => {
                self.scopes[idx as usize] = data;
                ScopeId(idx)
            }
            None => {
                self.scopes.push(data);
                ScopeId((self.scopes.len() - 1) as u32)
            }
        }
    }

    /// Destroy a scope and every object it owns, in insertion order.
    /// Returns the parent scope.
    pub fn exit_scope(&mut self, scope: ScopeId) -> Option<ScopeId> {
        let owned = std::mem::take(&mut self.scopes[scope.0 as usize].owned);
        for slot in owned {
            // An object may have been moved out of this scope; only destroy
            // slots that still name this scope as their owner.
            if let Some(obj) = &self.slots[slot as usize].object
                && obj.scope == scope
            {
                self.slots[slot as usize].object = None;
                self.slots[slot as usize].generation += 1;
                self.free.push(slot);
            }
        }
        let parent = self.scopes[scope.0 as usize].parent;
        self.scopes[scope.0 as usize].alive = false;
        if scope != ROOT_SCOPE {
            self.scope_free.push(scope.0);
        }
        parent
    }

    pub fn scope_depth(&self, scope: ScopeId) -> u32 {
        self.scopes[scope.0 as usize].depth
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Allocate an object owned by `scope`.
    pub fn alloc(&mut self, scope: ScopeId, payload: Payload) -> ObjRef {
        debug_assert!(self.scopes[scope.0 as usize].alive);
        let object = HeapObject { scope, payload };
        let index = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize].object = Some(object);
                idx
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    object: Some(object),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.scopes[scope.0 as usize].owned.push(index);
        ObjRef {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// Resolve a reference, or `None` if it is stale.
    pub fn get(&self, r: ObjRef) -> Option<&HeapObject> {
        let slot = self.slots.get(r.index as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        slot.object.as_ref()
    }

    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut HeapObject> {
        let slot = self.slots.get_mut(r.index as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        slot.object.as_mut()
    }

    /// Payload accessor that treats a stale reference as a bug.
    pub fn payload(&self, r: ObjRef) -> &Payload {
        &self.get(r).expect("stale object reference").payload
    }

    pub fn payload_mut(&mut self, r: ObjRef) -> &mut Payload {
        &mut self.get_mut(r).expect("stale object reference").payload
    }

    // -----------------------------------------------------------------------
    // Move
    // -----------------------------------------------------------------------

    /// Re-parent `root` (and everything reachable from it) to `target`.
    ///
    /// Only moves toward ancestors: an object whose scope is already at or
    /// above `target`'s depth stays put, which also terminates cycles: once
    /// relinked, an object's depth equals the target depth and a revisit is
    /// a no-op.
    pub fn move_to(&mut self, root: ObjRef, target: ScopeId) {
        let target_depth = self.scope_depth(target);
        let mut work = vec![root];
        while let Some(r) = work.pop() {
            let Some(obj) = self.get(r) else { continue };
            let from = obj.scope;
            if self.scope_depth(from) <= target_depth {
                continue;
            }
            // Relink: drop from the old scope's owned list, add to the new.
            let owned = &mut self.scopes[from.0 as usize].owned;
            if let Some(pos) = owned.iter().position(|&s| s == r.index) {
                owned.remove(pos);
            }
            self.scopes[target.0 as usize].owned.push(r.index);
            let obj = self.get_mut(r).expect("object vanished during move");
            obj.scope = target;
            for v in obj.payload.referenced_values() {
                if let Some(child) = v.obj_ref() {
                    work.push(child);
                }
            }
        }
    }

    /// Lift an object `levels` scopes up from its current owner.
    pub fn lift(&mut self, r: ObjRef, levels: u32) {
        let Some(obj) = self.get(r) else { return };
        let mut target = obj.scope;
        for _ in 0..levels {
            match self.scopes[target.0 as usize].parent {
                Some(p) => target = p,
                None => break,
            }
        }
        self.move_to(r, target);
    }

    /// Move a value's referent to `target` and return the value unchanged.
    /// Primitives pass through.
    pub fn move_value(&mut self, v: Value, target: ScopeId) -> Value {
        if let Some(r) = v.obj_ref() {
            self.move_to(r, target);
        }
        v
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Payload;

    #[test]
    fn scope_teardown_invalidates_references() {
        let mut heap = Heap::new();
        let scope = heap.enter_scope(ROOT_SCOPE);
        let r = heap.alloc(scope, Payload::Str("hello".into()));
        assert!(heap.get(r).is_some());
        heap.exit_scope(scope);
        assert!(heap.get(r).is_none());
    }

    #[test]
    fn moved_object_survives_scope_exit() {
        let mut heap = Heap::new();
        let inner = heap.enter_scope(ROOT_SCOPE);
        let r = heap.alloc(inner, Payload::Str("kept".into()));
        heap.move_to(r, ROOT_SCOPE);
        heap.exit_scope(inner);
        assert!(heap.get(r).is_some());
    }

    #[test]
    fn move_is_transitive_through_containers() {
        let mut heap = Heap::new();
        let inner = heap.enter_scope(ROOT_SCOPE);
        let elem = heap.alloc(inner, Payload::Str("elem".into()));
        let list = heap.alloc(inner, Payload::List(vec![Value::Str(elem)]));
        heap.move_to(list, ROOT_SCOPE);
        heap.exit_scope(inner);
        assert!(heap.get(list).is_some());
        assert!(heap.get(elem).is_some());
    }

    #[test]
    fn move_never_descends() {
        let mut heap = Heap::new();
        let r = heap.alloc(ROOT_SCOPE, Payload::Str("rooted".into()));
        let inner = heap.enter_scope(ROOT_SCOPE);
        heap.move_to(r, inner);
        heap.exit_scope(inner);
        // Still owned by the root: moving downward is a no-op.
        assert!(heap.get(r).is_some());
    }

    #[test]
    fn depth_increases_along_the_chain() {
        let mut heap = Heap::new();
        let a = heap.enter_scope(ROOT_SCOPE);
        let b = heap.enter_scope(a);
        assert!(heap.scope_depth(b) > heap.scope_depth(a));
        assert!(heap.scope_depth(a) > heap.scope_depth(ROOT_SCOPE));
        heap.exit_scope(b);
        heap.exit_scope(a);
    }

    #[test]
    fn slots_are_reused_with_fresh_generations() {
        let mut heap = Heap::new();
        let scope = heap.enter_scope(ROOT_SCOPE);
        let r1 = heap.alloc(scope, Payload::Str("one".into()));
        heap.exit_scope(scope);
        let scope2 = heap.enter_scope(ROOT_SCOPE);
        let r2 = heap.alloc(scope2, Payload::Str("two".into()));
        // Same slot, different generation.
        assert!(heap.get(r1).is_none());
        assert!(heap.get(r2).is_some());
        assert_ne!(r1, r2);
        heap.exit_scope(scope2);
    }
}
