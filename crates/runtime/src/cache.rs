//! On-disk bytecode cache (spec §6.4): a compiled chunk persisted next to
//! its source so a second run can skip recompilation if the cache's
//! version stamp still matches.
//!
//! Grounded on the teacher's `crates/runtime/src/serialize.rs`: `Value`
//! itself isn't `Serialize` (it holds `Arc<Mutex<_>>`/`File` handles that
//! make no sense on disk), so a shadow `CachedValue` enum mirrors the
//! serializable subset, and a `BTreeMap` stands in anywhere the runtime
//! uses a `HashMap`-backed table, for deterministic byte-identical output
//! across runs with the same input.

use crate::chunk::BytecodeChunk;
use pvm_core::{ArrayValue, RealKind, RecordValue, SeqString, Value, VarType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub enum CacheError {
    ClosureNotSerializable,
    EnumNotSerializable,
    FileNotSerializable,
    VersionMismatch { expected: u32, found: u32 },
    Bincode(String),
    Io(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::ClosureNotSerializable => write!(f, "a Closure constant cannot be cached"),
            CacheError::EnumNotSerializable => write!(f, "an Enum constant cannot be cached"),
            CacheError::FileNotSerializable => write!(f, "a File constant cannot be cached"),
            CacheError::VersionMismatch { expected, found } => {
                write!(f, "cache version {found} does not match chunk version {expected}")
            }
            CacheError::Bincode(msg) => write!(f, "cache (de)serialization failed: {msg}"),
            CacheError::Io(msg) => write!(f, "cache I/O error: {msg}"),
        }
    }
}

impl std::error::Error for CacheError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum CachedRealKind {
    Float,
    Double,
    LongDouble,
}

impl From<RealKind> for CachedRealKind {
    fn from(k: RealKind) -> Self {
        match k {
            RealKind::Float => CachedRealKind::Float,
            RealKind::Double => CachedRealKind::Double,
            RealKind::LongDouble => CachedRealKind::LongDouble,
        }
    }
}

impl From<CachedRealKind> for RealKind {
    fn from(k: CachedRealKind) -> Self {
        match k {
            CachedRealKind::Float => RealKind::Float,
            CachedRealKind::Double => RealKind::Double,
            CachedRealKind::LongDouble => RealKind::LongDouble,
        }
    }
}

/// Serializable shadow of [`Value`] (see module doc comment). Only the
/// constant-pool-representable subset is covered — a chunk's constants
/// are never `File`/`Closure`/`Enum` in practice, since those can only
/// exist at runtime, but we still reject them explicitly rather than
/// silently dropping data.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum CachedValue {
    Integer(i64),
    Byte(u8),
    Word(u16),
    Cardinal(u32),
    Real(CachedRealKind, f64),
    Boolean(bool),
    Char(u8),
    String(String, Option<usize>),
    Array {
        lower_bounds: Vec<i64>,
        upper_bounds: Vec<i64>,
        elem_type: u8,
        elements: Vec<CachedValue>,
    },
    Record(Vec<(String, CachedValue)>),
    Nil,
    Void,
}

fn to_cached(value: &Value) -> Result<CachedValue, CacheError> {
    Ok(match value {
        Value::Integer(n) => CachedValue::Integer(*n),
        Value::Byte(n) => CachedValue::Byte(*n),
        Value::Word(n) => CachedValue::Word(*n),
        Value::Cardinal(n) => CachedValue::Cardinal(*n),
        Value::Real(k, n) => CachedValue::Real((*k).into(), *n),
        Value::Boolean(b) => CachedValue::Boolean(*b),
        Value::Char(c) => CachedValue::Char(*c),
        Value::String(s) => CachedValue::String(s.as_str().to_string(), s.max_length()),
        Value::Array(arr) => CachedValue::Array {
            lower_bounds: arr.lower_bounds.clone(),
            upper_bounds: arr.upper_bounds.clone(),
            elem_type: crate::chunk::var_type_wire_tag(arr.elem_type),
            elements: (0..arr.len())
                .map(|i| to_cached(arr.get_flat(i).expect("flat index within bounds")))
                .collect::<Result<_, _>>()?,
        },
        Value::Record(rec) => CachedValue::Record(
            rec.field_names()
                .map(|name| {
                    let v = rec.get_by_name(name).expect("field present by its own name");
                    to_cached(v).map(|cv| (name.to_string(), cv))
                })
                .collect::<Result<_, _>>()?,
        ),
        Value::Nil => CachedValue::Nil,
        Value::Void => CachedValue::Void,
        Value::Closure(_) => return Err(CacheError::ClosureNotSerializable),
        Value::Enum { .. } => return Err(CacheError::EnumNotSerializable),
        Value::File(_) => return Err(CacheError::FileNotSerializable),
        Value::Set(_) | Value::MemoryStream(_) | Value::Pointer(_) => {
            // Neither appears as a literal constant in practice; treat
            // the same as the other runtime-only kinds.
            return Err(CacheError::FileNotSerializable);
        }
    })
}

fn from_cached(value: &CachedValue) -> Value {
    match value {
        CachedValue::Integer(n) => Value::Integer(*n),
        CachedValue::Byte(n) => Value::Byte(*n),
        CachedValue::Word(n) => Value::Word(*n),
        CachedValue::Cardinal(n) => Value::Cardinal(*n),
        CachedValue::Real(k, n) => Value::Real((*k).clone().into(), *n),
        CachedValue::Boolean(b) => Value::Boolean(*b),
        CachedValue::Char(c) => Value::Char(*c),
        CachedValue::String(s, max_length) => Value::String(match max_length {
            Some(len) => SeqString::with_max_length(s.clone(), *len),
            None => SeqString::new(s.clone()),
        }),
        CachedValue::Array { lower_bounds, upper_bounds, elem_type, elements } => {
            let elem_vt = crate::chunk::var_type_from_wire_tag(*elem_type).unwrap_or(VarType::Integer);
            let mut arr = ArrayValue::new(
                lower_bounds.clone(),
                upper_bounds.clone(),
                elem_vt,
                Value::Void,
            )
            .expect("cached bounds were valid when written");
            for (i, cv) in elements.iter().enumerate() {
                let _ = arr.set_flat(i, from_cached(cv));
            }
            Value::Array(Box::new(arr))
        }
        CachedValue::Record(fields) => Value::Record(Box::new(RecordValue::new(
            fields.iter().map(|(n, v)| (n.clone(), from_cached(v))).collect(),
        ))),
        CachedValue::Nil => Value::Nil,
        CachedValue::Void => Value::Void,
    }
}

/// On-disk representation of a [`BytecodeChunk`] (spec §6.4). Everything
/// but the caches, which are rebuilt cold on load — shipping a stale
/// inline cache across a process boundary buys nothing and risks
/// pointing at a `Symbol` the loading process never constructed.
#[derive(Debug, Serialize, Deserialize)]
struct CachedChunk {
    version: u32,
    code: Vec<u8>,
    lines: Vec<i32>,
    constants: Vec<CachedValue>,
    record_shapes: Vec<Vec<String>>,
}

/// Serialize `chunk` to `path`, version-stamped first so a mismatched
/// reader fails fast (spec §6.4: "a version mismatch invalidates the
/// cache file outright").
pub fn save(chunk: &BytecodeChunk, path: &Path) -> Result<(), CacheError> {
    let constants = chunk
        .constants
        .iter()
        .map(to_cached)
        .collect::<Result<Vec<_>, _>>()?;
    let cached = CachedChunk {
        version: chunk.version,
        code: chunk.code.clone(),
        lines: chunk.lines.clone(),
        constants,
        record_shapes: chunk.record_shapes.clone(),
    };
    let bytes = bincode::serialize(&cached).map_err(|e| CacheError::Bincode(e.to_string()))?;
    let mut file = std::fs::File::create(path).map_err(|e| CacheError::Io(e.to_string()))?;
    file.write_all(&bytes).map_err(|e| CacheError::Io(e.to_string()))
}

/// Load a cache file, rejecting it if its version stamp doesn't match
/// `expected_version` — the caller's cue to recompile from source
/// instead of trusting stale bytecode.
pub fn load(path: &Path, expected_version: u32) -> Result<BytecodeChunk, CacheError> {
    let mut bytes = Vec::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| CacheError::Io(e.to_string()))?;
    let cached: CachedChunk = bincode::deserialize(&bytes).map_err(|e| CacheError::Bincode(e.to_string()))?;
    if cached.version != expected_version {
        return Err(CacheError::VersionMismatch {
            expected: expected_version,
            found: cached.version,
        });
    }
    let mut chunk = BytecodeChunk::new(cached.version);
    chunk.code = cached.code;
    chunk.lines = cached.lines;
    for value in &cached.constants {
        chunk.add_constant(from_cached(value));
    }
    chunk.record_shapes = cached.record_shapes;
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::OpCode;

    #[test]
    fn round_trips_through_a_temp_file() {
        let mut chunk = BytecodeChunk::new(9);
        chunk.add_constant(Value::Integer(42));
        chunk.add_constant(Value::String(SeqString::new("hello")));
        chunk.write_byte(OpCode::CONST_0 as u8, 1);
        chunk.write_byte(OpCode::HALT as u8, 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk.cache");
        save(&chunk, &path).unwrap();
        let loaded = load(&path, 9).unwrap();

        assert_eq!(loaded.code, chunk.code);
        assert_eq!(loaded.constants.len(), chunk.constants.len());
        assert_eq!(loaded.constants[0], Value::Integer(42));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let chunk = BytecodeChunk::new(9);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk.cache");
        save(&chunk, &path).unwrap();
        let err = load(&path, 10).unwrap_err();
        assert!(matches!(err, CacheError::VersionMismatch { .. }));
    }

    #[test]
    fn closure_constants_are_rejected() {
        let closure = Value::Closure(pvm_core::ClosureValue {
            entry_offset: 0,
            env: None,
            defining_symbol: None,
        });
        let err = to_cached(&closure).unwrap_err();
        assert_eq!(err, CacheError::ClosureNotSerializable);
    }
}
