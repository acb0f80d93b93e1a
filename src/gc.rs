// File: src/gc.rs
//
// The heap arena and the tri-color mark-sweep collector that manages it.
// Objects live in a dense, index-addressed arena rather than behind raw
// `next`-pointers: Rust's ownership model makes a hand-spliced intrusive
// list both unsafe and unnecessary, and a sweep over the arena's slots
// visits exactly the same set of objects in the same relative order as
// walking the object chain would. Freed slots are recycled via a free
// list so the arena doesn't grow unboundedly across GC cycles.

use crate::object::{Obj, ObjRef};
use crate::table::Table;
use crate::value::Value;

const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

struct Slot {
    marked: bool,
    obj: Obj,
}

pub struct Heap {
    objects: Vec<Option<Slot>>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<ObjRef>,
    strings: Table,
    /// Engine-owned singletons (e.g. the interned `"init"` method name)
    /// that must survive a collection even when no in-flight root
    /// snapshot mentions them yet — a compile-time GC cycle only knows
    /// about the compiler's own roots, not the VM's.
    pinned: Vec<ObjRef>,
    pub stress_gc: bool,
    pub log_gc: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            gray: Vec::new(),
            strings: Table::new(),
            pinned: Vec::new(),
            stress_gc: false,
            log_gc: false,
        }
    }

    /// Marks `r` as permanently reachable, regardless of any particular
    /// root snapshot. Used for the handful of objects the VM keeps alive
    /// for its whole lifetime.
    pub fn pin(&mut self, r: ObjRef) {
        self.pinned.push(r);
    }

    pub fn needs_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    /// Allocates a new heap object. Callers are responsible for marking
    /// whatever roots this allocation doesn't by itself protect *before*
    /// calling this — see `Vm::alloc`/`Compiler::alloc`, which check
    /// `needs_collect` and call the owner's `mark_roots` first.
    pub fn raw_alloc(&mut self, obj: Obj) -> ObjRef {
        let size = obj.size();
        self.bytes_allocated += size;
        if self.log_gc {
            eprintln!("alloc {size} bytes for a {}", obj.kind_name());
        }
        let slot = Slot { marked: false, obj };
        let index = if let Some(free) = self.free.pop() {
            self.objects[free as usize] = Some(slot);
            free
        } else {
            self.objects.push(Some(slot));
            (self.objects.len() - 1) as u32
        };
        ObjRef(index)
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        &self.objects[r.index()].as_ref().expect("dangling ObjRef").obj
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        &mut self.objects[r.index()].as_mut().expect("dangling ObjRef").obj
    }

    pub fn get_string(&self, r: ObjRef) -> &str {
        self.get_string_obj(r).as_str()
    }

    pub fn get_string_obj(&self, r: ObjRef) -> &crate::object::ObjString {
        match self.get(r) {
            Obj::String(s) => s,
            other => panic!("ObjRef did not name a string: {}", other.kind_name()),
        }
    }

    /// Interns `bytes`, returning the canonical string object. Two calls
    /// with equal bytes return the same `ObjRef`.
    pub fn intern(&mut self, bytes: &[u8], mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        let hash = fnv1a_hash(bytes);
        let strings = std::mem::take(&mut self.strings);
        let existing = strings.find_string(self, bytes, hash);
        self.strings = strings;
        if let Some(existing) = existing {
            return existing;
        }
        if self.needs_collect() {
            mark_roots(self);
            self.collect();
        }
        let r = self.raw_alloc(Obj::String(crate::object::ObjString {
            bytes: bytes.to_vec().into_boxed_slice(),
            hash,
        }));
        let mut strings = std::mem::take(&mut self.strings);
        strings.set(self, r, Value::Nil);
        self.strings = strings;
        r
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let slot = self.objects[r.index()].as_mut().expect("dangling ObjRef");
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(r);
    }

    /// Marks an object's out-edges. Edges are snapshotted into plain
    /// vectors first so marking them (which needs `&mut self`) doesn't
    /// conflict with the `&self` borrow of the object being blackened.
    fn blacken(&mut self, r: ObjRef) {
        let mut obj_edges: Vec<ObjRef> = Vec::new();
        let mut value_edges: Vec<Value> = Vec::new();
        match self.get(r) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Upvalue(u) => value_edges.push(u.closed),
            Obj::Function(f) => {
                value_edges.extend(f.chunk.constants.iter().copied());
                if let Some(n) = f.name {
                    obj_edges.push(n);
                }
            }
            Obj::Closure(c) => {
                obj_edges.push(c.function);
                obj_edges.extend(c.upvalues.iter().copied());
            }
            Obj::Class(c) => {
                obj_edges.push(c.name);
                for (k, v) in c.methods.iter() {
                    obj_edges.push(k);
                    value_edges.push(v);
                }
            }
            Obj::Instance(i) => {
                obj_edges.push(i.class);
                for (k, v) in i.fields.iter() {
                    obj_edges.push(k);
                    value_edges.push(v);
                }
            }
            Obj::BoundMethod(b) => {
                value_edges.push(b.receiver);
                obj_edges.push(b.method);
            }
        }
        for o in obj_edges {
            self.mark_object(o);
        }
        for v in value_edges {
            self.mark_value(v);
        }
    }

    pub fn trace_references(&mut self) {
        let pinned = self.pinned.clone();
        for r in pinned {
            self.mark_object(r);
        }
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    /// Pre-sweep pass over the weakly-held intern table: unmarked keys are
    /// dropped (converted to tombstones) so sweep can free the strings.
    fn clean_intern_table(&mut self) {
        let marked: Vec<ObjRef> = self
            .objects
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().filter(|s| s.marked).map(|_| ObjRef(i as u32)))
            .collect();
        let marked_set: std::collections::HashSet<u32> = marked.iter().map(|r| r.0).collect();
        self.strings.remove_unmarked(|r| marked_set.contains(&r.0));
    }

    pub fn sweep(&mut self) {
        self.clean_intern_table();
        for i in 0..self.objects.len() {
            let free_this = match &self.objects[i] {
                Some(slot) if !slot.marked => true,
                Some(_) => false,
                None => false,
            };
            if free_this {
                let slot = self.objects[i].take().unwrap();
                self.bytes_allocated -= slot.obj.size();
                self.free.push(i as u32);
            } else if let Some(slot) = &mut self.objects[i] {
                slot.marked = false;
            }
        }
    }

    pub fn collect(&mut self) {
        self.trace_references();
        self.sweep();
        self.next_gc = (self.bytes_allocated * 2).max(INITIAL_GC_THRESHOLD);
        if self.log_gc {
            eprintln!("collected, next gc at {} bytes", self.next_gc);
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjNative;
    use crate::value::Value;

    fn alloc_native(heap: &mut Heap) -> ObjRef {
        heap.raw_alloc(Obj::Native(ObjNative { function: |_| Value::Nil }))
    }

    #[test]
    fn unreachable_objects_are_freed_and_reachable_ones_survive() {
        let mut heap = Heap::new();
        let kept = alloc_native(&mut heap);
        let garbage = alloc_native(&mut heap);
        heap.mark_object(kept);
        heap.trace_references();
        heap.sweep();
        assert!(std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| heap.get(kept))).is_ok());
        assert!(std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| heap.get(garbage))).is_err());
    }

    #[test]
    fn sweep_clears_mark_bits_so_the_next_cycle_starts_white() {
        let mut heap = Heap::new();
        let r = alloc_native(&mut heap);
        heap.mark_object(r);
        heap.trace_references();
        heap.sweep();
        assert!(!heap.objects[r.index()].as_ref().unwrap().marked);
    }

    #[test]
    fn collect_frees_an_interned_string_once_nothing_roots_it() {
        let mut heap = Heap::new();
        let s = heap.intern(b"ephemeral", |_| {});
        assert!(heap.strings.find_string(&heap, b"ephemeral", fnv1a_hash(b"ephemeral")).is_some());
        heap.collect();
        assert!(heap.strings.find_string(&heap, b"ephemeral", fnv1a_hash(b"ephemeral")).is_none());
        assert!(std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| heap.get(s))).is_err());
    }

    #[test]
    fn pinned_objects_survive_collection_with_no_other_roots() {
        let mut heap = Heap::new();
        let init = heap.intern(b"init", |_| {});
        heap.pin(init);
        heap.collect();
        assert_eq!(heap.get_string(init), "init");
    }
}
