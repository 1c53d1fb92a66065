//! Globals table plus the two-tier inline-cache resolution protocol
//! (spec §4.3).

use crate::chunk::BytecodeChunk;
use crate::error::RuntimeError;
use pvm_core::{HashTable, Symbol};
use std::sync::Arc;

/// The globals and const-globals tables a single `interpret` run installs
/// (spec §3.3: "one for globals, one for constant globals... separate
/// because consts need no locking even under threading").
#[derive(Debug, Default)]
pub struct GlobalTables {
    pub globals: HashTable,
    pub const_globals: HashTable,
}

impl GlobalTables {
    pub fn new() -> Self {
        Self {
            globals: HashTable::new(),
            const_globals: HashTable::new(),
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<Symbol>> {
        self.globals.get(name).or_else(|| self.const_globals.get(name))
    }
}

/// Resolve a global by its constant-pool name index, following spec
/// §4.3's three-step protocol:
/// 1. call-site inline cache (the in-stream 8-byte slot, held out-of-band
///    here — see `chunk.rs`'s module doc comment)
/// 2. chunk-level, constant-index-keyed cache
/// 3. table lookup, which primes both caches above for next time
///
/// `call_site_offset` is the byte offset of the opcode that owns the
/// inline-cache slot.
pub fn resolve_global(
    chunk: &mut BytecodeChunk,
    call_site_offset: usize,
    name_idx: usize,
    tables: &GlobalTables,
) -> Result<Arc<Symbol>, RuntimeError> {
    if let Some(sym) = chunk.cached_symbol_at(call_site_offset) {
        return Ok(sym);
    }
    if let Some(sym) = chunk.global_symbol_cache.get(name_idx).and_then(|s| s.clone()) {
        chunk.prime_call_site(call_site_offset, sym.clone());
        return Ok(sym);
    }
    let name = match chunk.constants.get(name_idx) {
        Some(pvm_core::Value::String(s)) => s.as_str().to_string(),
        _ => {
            return Err(RuntimeError::TypeMismatch(format!(
                "constant {name_idx} is not a global name"
            )))
        }
    };
    let sym = tables
        .lookup(&name)
        .ok_or_else(|| RuntimeError::TypeMismatch(format!("undefined global '{name}'")))?;
    if let Some(slot) = chunk.global_symbol_cache.get_mut(name_idx) {
        *slot = Some(sym.clone());
    }
    chunk.prime_call_site(call_site_offset, sym.clone());
    Ok(sym)
}

/// Resolve purely via the fast path, for `GET_GLOBAL_CACHED`/
/// `SET_GLOBAL_CACHED` (spec §4.3 point 3: "a companion opcode pair lets
/// a peephole optimizer skip the table lookup entirely once the cache is
/// primed"). Falls back to the full protocol if not yet primed, since a
/// well-formed compiler only emits the `_CACHED` variant after a plain
/// `GET_GLOBAL`/`SET_GLOBAL` has already run at the same site, but the
/// VM itself does not assume that discipline.
pub fn resolve_global_cached(
    chunk: &mut BytecodeChunk,
    call_site_offset: usize,
    name_idx: usize,
    tables: &GlobalTables,
) -> Result<Arc<Symbol>, RuntimeError> {
    resolve_global(chunk, call_site_offset, name_idx, tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvm_core::{Symbol, Value, VarType};

    #[test]
    fn resolves_through_table_then_caches() {
        let mut chunk = BytecodeChunk::new(1);
        let name_idx = chunk.add_constant(Value::String(pvm_core::SeqString::new("counter")));
        chunk.write_byte(crate::chunk::OpCode::GET_GLOBAL as u8, 1);
        chunk.write_byte(name_idx as u8, 1);
        chunk.write_inline_cache_slot(1);

        let mut tables = GlobalTables::new();
        tables
            .globals
            .insert(Symbol::new_global("counter", VarType::Integer, Value::Integer(0)));

        assert!(chunk.cached_symbol_at(0).is_none());
        let sym = resolve_global(&mut chunk, 0, name_idx, &tables).unwrap();
        assert_eq!(sym.name, "counter");
        assert!(chunk.cached_symbol_at(0).is_some());

        // Second resolution takes the call-site fast path without
        // touching the tables at all (drop tables to prove it).
        drop(tables);
        let tables2 = GlobalTables::new();
        let sym2 = resolve_global(&mut chunk, 0, name_idx, &tables2).unwrap();
        assert_eq!(sym2.name, "counter");
    }

    #[test]
    fn undefined_global_is_an_error() {
        let mut chunk = BytecodeChunk::new(1);
        let name_idx = chunk.add_constant(Value::String(pvm_core::SeqString::new("missing")));
        let tables = GlobalTables::new();
        let err = resolve_global(&mut chunk, 0, name_idx, &tables).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch(_)));
    }
}
