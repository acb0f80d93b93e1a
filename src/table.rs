// File: src/table.rs
//
// Open-addressed, linear-probing hash table keyed by interned-string
// identity. Used for globals, instance fields, class method tables, and
// the string-intern table. Ported from the book's `table.c` algorithm:
// capacity is always a power of two (or zero), grown by doubling with a
// minimum of 8 once the load factor would exceed 0.75.

use crate::gc::Heap;
use crate::object::ObjRef;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone)]
struct Entry {
    key: Option<ObjRef>,
    value: Value,
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Self { count: 0, entries: Vec::new() }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn hash_of(&self, key: ObjRef, heap: &Heap) -> u32 {
        heap.get_string_obj(key).hash
    }

    /// Probes for `key`'s slot, or the slot it would occupy on insert
    /// (preferring the first tombstone seen along the probe chain).
    fn find_slot(entries: &[Entry], capacity: usize, key: ObjRef, hash: u32) -> usize {
        let mut index = (hash as usize) & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.value.is_nil() {
                        return tombstone.unwrap_or(index);
                    } else if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn grow(&mut self, heap: &Heap, new_capacity: usize) {
        let mut new_entries = vec![Entry { key: None, value: Value::Nil }; new_capacity];
        let mut new_count = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let hash = self.hash_of(key, heap);
                let slot = Self::find_slot(&new_entries, new_capacity, key, hash);
                new_entries[slot] = Entry { key: Some(key), value: entry.value };
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    /// Inserts or updates `key`. Returns true if this created a new entry.
    pub fn set(&mut self, heap: &Heap, key: ObjRef, value: Value) -> bool {
        if self.entries.is_empty() || (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            let new_cap = if self.capacity() == 0 { 8 } else { self.capacity() * 2 };
            self.grow(heap, new_cap);
        }
        let hash = self.hash_of(key, heap);
        let cap = self.capacity();
        let slot = Self::find_slot(&self.entries, cap, key, hash);
        let entry = &mut self.entries[slot];
        let is_new_key = entry.key.is_none();
        if is_new_key && entry.value.is_nil() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    pub fn get(&self, heap: &Heap, key: ObjRef) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let hash = self.hash_of(key, heap);
        let slot = Self::find_slot(&self.entries, self.capacity(), key, hash);
        self.entries[slot].key.map(|_| self.entries[slot].value)
    }

    pub fn delete(&mut self, heap: &Heap, key: ObjRef) -> bool {
        if self.count == 0 {
            return false;
        }
        let hash = self.hash_of(key, heap);
        let slot = Self::find_slot(&self.entries, self.capacity(), key, hash);
        if self.entries[slot].key.is_none() {
            return false;
        }
        self.entries[slot] = Entry { key: None, value: Value::Bool(true) };
        true
    }

    pub fn add_all(&mut self, heap: &Heap, from: &Table) {
        for entry in &from.entries {
            if let Some(key) = entry.key {
                self.set(heap, key, entry.value);
            }
        }
    }

    /// Specialized lookup used solely during string interning: compares by
    /// length, cached hash, then bytes, since the candidate string has no
    /// `ObjRef` yet.
    pub fn find_string(&self, heap: &Heap, bytes: &[u8], hash: u32) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.value.is_nil() {
                        return None;
                    }
                }
                Some(key) => {
                    let s = heap.get_string_obj(key);
                    if s.hash == hash && s.bytes.as_ref() == bytes {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Pre-sweep cleanup of a weakly-held table (the intern table): drops
    /// any entry whose key didn't survive marking.
    pub fn remove_unmarked(&mut self, is_marked: impl Fn(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !is_marked(key) {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;

    fn intern(heap: &mut Heap, s: &str) -> ObjRef {
        heap.intern(s.as_bytes(), |_| {})
    }

    #[test]
    fn set_reports_new_vs_update() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = intern(&mut heap, "x");
        assert!(table.set(&heap, key, Value::Number(1.0)));
        assert!(!table.set(&heap, key, Value::Number(2.0)));
        assert_eq!(table.get(&heap, key).and_then(Value::as_number), Some(2.0));
        assert_eq!(table.iter().count(), 1);
    }

    #[test]
    fn delete_leaves_a_tombstone_that_keeps_probing_working() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let a = intern(&mut heap, "a");
        let b = intern(&mut heap, "b");
        table.set(&heap, a, Value::Number(1.0));
        table.set(&heap, b, Value::Number(2.0));
        assert!(table.delete(&heap, a));
        // tombstone at `a`'s slot must not break the probe chain to `b`.
        assert_eq!(table.get(&heap, b).and_then(Value::as_number), Some(2.0));
        assert!(table.get(&heap, a).is_none());
    }

    #[test]
    fn grows_when_load_factor_would_exceed_three_quarters() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..20 {
            let key = intern(&mut heap, &format!("key{i}"));
            table.set(&heap, key, Value::Number(i as f64));
        }
        assert!(table.iter().count() == 20);
        assert!((20.0_f64) <= table.capacity() as f64 * MAX_LOAD + 1.0);
        for i in 0..20 {
            let key = intern(&mut heap, &format!("key{i}"));
            assert_eq!(table.get(&heap, key).and_then(Value::as_number), Some(i as f64));
        }
    }

    #[test]
    fn find_string_matches_by_length_hash_then_bytes() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let s = intern(&mut heap, "hello");
        table.set(&heap, s, Value::Nil);
        let hash = heap.get_string_obj(s).hash;
        assert_eq!(table.find_string(&heap, b"hello", hash), Some(s));
        assert_eq!(table.find_string(&heap, b"world", hash), None);
    }
}
