//! Pointer allocation arena (spec §3.4, §9 REDESIGN FLAGS).
//!
//! The original VM hands out raw `malloc`ed addresses and, on `Dispose`,
//! scans every global and active frame slot for a pointer holding that
//! bit pattern, nilling each one out (`vmNullifyAliases`). Per the
//! redesign note in spec.md §9 ("replace pointer aliasing via raw
//! addresses with... an arena allocator keyed by generation indices"),
//! this crate hands out `Heap` slot indices instead of real addresses —
//! `New` allocates a slot, `Dispose` clears it and the VM (which alone
//! has access to the globals table and the live operand stack) walks
//! those scopes nilling any `Pointer` whose address matches. The arena
//! itself doesn't need a generation counter: once a slot is cleared,
//! `Dispose`d-but-still-aliased pointers are nilled eagerly by the same
//! call, so a stale index can never outlive the nullification pass.

use pvm_core::{PointerValue, Value, VarType};

/// Allocates `Value`s addressed by `Pointer` (spec §3.1 "Reference-like:
/// Pointer"). One per VM; siblings spawned by `THREAD_CREATE` get their
/// own heap, since pointers are not among the tables spec §5 lists as
/// shared across sibling VMs.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<Value>>,
}

impl Heap {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// `New(p)`: allocate a zero-valued slot of `base_type` and return a
    /// pointer to it.
    pub fn allocate(&mut self, base_type: VarType, initial: Value) -> PointerValue {
        let address = self.slots.len() as u64;
        self.slots.push(Some(initial));
        PointerValue {
            address: Some(address),
            base_type,
        }
    }

    pub fn get(&self, address: u64) -> Option<&Value> {
        self.slots.get(address as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, address: u64) -> Option<&mut Value> {
        self.slots.get_mut(address as usize).and_then(|s| s.as_mut())
    }

    /// `Dispose(p)`: free the slot. Idempotent — disposing an
    /// already-cleared slot is a no-op, matching `Value::Free`'s
    /// idempotence invariant (spec §3.1).
    pub fn dispose(&mut self, address: u64) {
        if let Some(slot) = self.slots.get_mut(address as usize) {
            *slot = None;
        }
    }

    pub fn is_live(&self, address: u64) -> bool {
        matches!(self.slots.get(address as usize), Some(Some(_)))
    }
}

/// Replace every `Value::Pointer` in `value` whose address equals
/// `disposed` with a nil pointer of the same base type (spec §3.4
/// "nullify aliases" protocol). Recurses into arrays/records since a
/// disposed address can be aliased from inside an aggregate, not just a
/// bare slot.
pub fn nullify_in_place(value: &mut Value, disposed: u64) {
    match value {
        Value::Pointer(p) if p.address == Some(disposed) => {
            *p = PointerValue::nil(p.base_type);
        }
        Value::Array(arr) => {
            for idx in 0..arr.len() {
                if let Ok(elem) = arr.get_flat(idx) {
                    let mut elem = elem.clone();
                    nullify_in_place(&mut elem, disposed);
                    let _ = arr.set_flat(idx, elem);
                }
            }
        }
        Value::Record(rec) => {
            let names: Vec<String> = rec.field_names().map(str::to_string).collect();
            for (offset, _) in names.iter().enumerate() {
                if let Ok(field) = rec.get_by_offset(offset) {
                    let mut field = field.clone();
                    nullify_in_place(&mut field, disposed);
                    let _ = rec.set_by_offset(offset, field);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_dispose_clears_the_slot() {
        let mut heap = Heap::new();
        let ptr = heap.allocate(VarType::Integer, Value::Integer(42));
        assert!(heap.is_live(ptr.address.unwrap()));
        heap.dispose(ptr.address.unwrap());
        assert!(!heap.is_live(ptr.address.unwrap()));
    }

    #[test]
    fn dispose_is_idempotent() {
        let mut heap = Heap::new();
        let ptr = heap.allocate(VarType::Integer, Value::Integer(1));
        heap.dispose(ptr.address.unwrap());
        heap.dispose(ptr.address.unwrap());
        assert!(!heap.is_live(ptr.address.unwrap()));
    }

    #[test]
    fn nullify_replaces_matching_pointer_with_nil() {
        let mut value = Value::Pointer(PointerValue {
            address: Some(3),
            base_type: VarType::Integer,
        });
        nullify_in_place(&mut value, 3);
        match value {
            Value::Pointer(p) => assert!(p.is_nil()),
            _ => panic!("expected pointer"),
        }
    }

    #[test]
    fn nullify_ignores_non_matching_pointer() {
        let mut value = Value::Pointer(PointerValue {
            address: Some(5),
            base_type: VarType::Integer,
        });
        nullify_in_place(&mut value, 3);
        match value {
            Value::Pointer(p) => assert_eq!(p.address, Some(5)),
            _ => panic!("expected pointer"),
        }
    }
}
