//! Symbols and symbol tables (spec §3.3).
//!
//! The original VM buckets symbols by hashed name in a fixed-size array of
//! chains. A `HashMap` gives the same O(1) lookup without hand-rolled
//! bucket math, so that's what this crate uses — the bucketing scheme
//! itself isn't part of the observable contract, only "lookup by lowercased
//! name in O(1)" is.

use crate::types::VarType;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A declared name: a global, a local slot descriptor, or a procedure entry.
///
/// For globals, `storage` is the shared cell the inline cache in
/// `BytecodeChunk::global_symbol_cache` (and the in-code 8-byte slot) points
/// at. For procedures, `bytecode_address` is the byte offset of the
/// procedure's first instruction and `locals_count`/`param_count` describe
/// the call frame window `CALL` must reserve.
#[derive(Debug)]
pub struct Symbol {
    /// Always lowercased — lookups are case-insensitive (spec §4.3).
    pub name: String,
    pub declared_type: VarType,
    /// Byte offset of the routine's entry point, for procedure symbols.
    pub bytecode_address: Option<usize>,
    pub locals_count: u8,
    pub param_count: u8,
    /// True for `VAR` parameters: passed by reference.
    pub by_reference: bool,
    /// Shared storage cell for a global variable. `None` for procedure
    /// symbols (which have no runtime value, just an entry point).
    pub storage: Option<Arc<Mutex<Value>>>,
}

impl Symbol {
    pub fn new_global(name: impl Into<String>, declared_type: VarType, initial: Value) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            declared_type,
            bytecode_address: None,
            locals_count: 0,
            param_count: 0,
            by_reference: false,
            storage: Some(Arc::new(Mutex::new(initial))),
        }
    }

    pub fn new_procedure(
        name: impl Into<String>,
        bytecode_address: usize,
        locals_count: u8,
        param_count: u8,
    ) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            declared_type: VarType::Void,
            bytecode_address: Some(bytecode_address),
            locals_count,
            param_count,
            by_reference: false,
            storage: None,
        }
    }
}

/// A name-keyed table of symbols. One instance each for globals, const
/// globals, and the procedure table (spec §3.3) — kept as separate
/// `HashTable`s rather than one table with a "kind" field because const
/// globals need no locking even under threading, and procedures need no
/// storage cell at all.
///
/// `Clone`able because sibling VMs spawned by `THREAD_CREATE` (spec §4.7)
/// share the owning VM's globals/procedure tables: cloning a `HashTable`
/// only clones the `Arc<Symbol>` handles, so every sibling still observes
/// writes through the same shared storage cells.
#[derive(Debug, Default, Clone)]
pub struct HashTable {
    entries: HashMap<String, Arc<Symbol>>,
}

impl HashTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert a symbol, keyed by its (already-lowercased) name. Returns the
    /// shared handle so the caller can wire up an inline cache immediately.
    pub fn insert(&mut self, symbol: Symbol) -> Arc<Symbol> {
        let handle = Arc::new(symbol);
        self.entries.insert(handle.name.clone(), handle.clone());
        handle
    }

    /// Look up by name, case-insensitively (the caller is expected to have
    /// already lowercased, but we defend here since callers sometimes pass
    /// through unlowercased builtin-name constants).
    pub fn get(&self, name: &str) -> Option<Arc<Symbol>> {
        if name.chars().any(|c| c.is_ascii_uppercase()) {
            self.entries.get(&name.to_ascii_lowercase()).cloned()
        } else {
            self.entries.get(name).cloned()
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Symbol>)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn insert_and_lookup_is_case_insensitive() {
        let mut table = HashTable::new();
        table.insert(Symbol::new_global("Counter", VarType::Integer, Value::Integer(0)));

        assert!(table.contains("counter"));
        assert!(table.contains("COUNTER"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn missing_symbol_is_none() {
        let table = HashTable::new();
        assert!(table.get("nope").is_none());
    }

    #[test]
    fn procedure_symbol_has_no_storage() {
        let sym = Symbol::new_procedure("DoThing", 128, 2, 1);
        assert!(sym.storage.is_none());
        assert_eq!(sym.bytecode_address, Some(128));
    }
}
