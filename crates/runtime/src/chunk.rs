//! Bytecode chunk: code buffer, line table, constant pool, and the two
//! inline-cache mechanisms (spec §3.2, §4.2, §4.3).
//!
//! Per the REDESIGN FLAGS in spec.md §9 ("rather than writing a raw
//! host-pointer into the code stream, an implementation may keep an
//! external `Vec<Option<SymbolIndex>>` parallel to the code... reserve 8
//! bytes for wire compatibility"), the in-stream 8-byte slot that
//! `GET_GLOBAL`/`SET_GLOBAL` reserve is zero-filled and never read
//! directly; the actual per-call-site cache lives in `call_site_cache`,
//! keyed by the byte offset of the instruction. `global_symbol_cache`
//! is the separate, constant-index-keyed cache spec.md §3.2 also asks
//! for, used by `GET_GLOBAL_CACHED`/`SET_GLOBAL_CACHED`.

use pvm_core::{Symbol, Value, VarType};
use std::collections::HashMap;
use std::sync::Arc;

/// Number of trailing bytes every `GET_GLOBAL`/`SET_GLOBAL` family opcode
/// reserves after its name-index operand (spec §3.2).
pub const GLOBAL_INLINE_CACHE_SLOT_SIZE: usize = 8;

macro_rules! opcodes {
    ($($name:ident = $value:expr),* $(,)?) => {
        /// The VM's instruction set (spec §4.6, wire format in §6.3).
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum OpCode {
            $($name = $value),*
        }

        impl OpCode {
            pub fn from_u8(byte: u8) -> Option<OpCode> {
                match byte {
                    $($value => Some(OpCode::$name)),*,
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(OpCode::$name => stringify!($name)),*
                }
            }
        }
    };
}

opcodes! {
    CONSTANT = 0, CONSTANT16 = 1,
    CONST_0 = 2, CONST_1 = 3, CONST_TRUE = 4, CONST_FALSE = 5,
    PUSH_IMMEDIATE_INT8 = 6,
    POP = 7, SWAP = 8, DUP = 9,

    ADD = 10, SUBTRACT = 11, MULTIPLY = 12, DIVIDE = 13,
    INT_DIV = 14, MOD = 15, NEGATE = 16, NOT = 17, TO_BOOL = 18,

    EQUAL = 19, NOT_EQUAL = 20, GREATER = 21, GREATER_EQUAL = 22,
    LESS = 23, LESS_EQUAL = 24,

    AND = 25, OR = 26, XOR = 27, SHL = 28, SHR = 29,

    JUMP = 30, JUMP_IF_FALSE = 31, RETURN = 32, HALT = 33, EXIT = 34,

    DEFINE_GLOBAL = 35, DEFINE_GLOBAL16 = 36,
    GET_GLOBAL = 37, GET_GLOBAL16 = 38,
    GET_GLOBAL_CACHED = 39, GET_GLOBAL16_CACHED = 40,
    SET_GLOBAL = 41, SET_GLOBAL16 = 42,
    SET_GLOBAL_CACHED = 43, SET_GLOBAL16_CACHED = 44,
    GET_GLOBAL_ADDRESS = 45, GET_GLOBAL_ADDRESS16 = 46,

    GET_LOCAL = 47, SET_LOCAL = 48, INC_LOCAL = 49, DEC_LOCAL = 50,
    GET_LOCAL_ADDRESS = 51,
    INIT_LOCAL_FILE = 52, INIT_LOCAL_STRING = 53, INIT_LOCAL_POINTER = 54,
    INIT_LOCAL_ARRAY = 55,

    GET_FIELD_ADDRESS = 56, GET_FIELD_ADDRESS16 = 57,
    GET_FIELD_OFFSET = 58, GET_FIELD_OFFSET16 = 59,
    LOAD_FIELD_VALUE = 60, LOAD_FIELD_VALUE16 = 61,
    LOAD_FIELD_VALUE_BY_NAME = 62, LOAD_FIELD_VALUE_BY_NAME16 = 63,
    ALLOC_OBJECT = 64, ALLOC_OBJECT16 = 65,
    INIT_FIELD_ARRAY = 66,

    GET_ELEMENT_ADDRESS = 67, GET_ELEMENT_ADDRESS_CONST = 68,
    LOAD_ELEMENT_VALUE = 69, LOAD_ELEMENT_VALUE_CONST = 70,
    GET_CHAR_ADDRESS = 71, GET_CHAR_FROM_STRING = 72,
    SET_INDIRECT = 73, GET_INDIRECT = 74, IN = 75,

    GET_UPVALUE = 76, SET_UPVALUE = 77, GET_UPVALUE_ADDRESS = 78,

    CALL = 79, CALL_INDIRECT = 80, PROC_CALL_INDIRECT = 81,
    CALL_USER_PROC = 82, CALL_BUILTIN = 83, CALL_BUILTIN_PROC = 84,
    CALL_METHOD = 85, CALL_HOST = 86,

    FORMAT_VALUE = 87,

    THREAD_CREATE = 88, THREAD_JOIN = 89,
    MUTEX_CREATE = 90, RCMUTEX_CREATE = 91,
    MUTEX_LOCK = 92, MUTEX_UNLOCK = 93, MUTEX_DESTROY = 94,
}

/// A constant pool entry's declared-type byte, as it appears in
/// `DEFINE_GLOBAL`'s payload (spec §6.3). Mirrors the original's
/// `VarType` byte encoding closely enough to share a wire format.
pub fn var_type_wire_tag(t: VarType) -> u8 {
    match t {
        VarType::Integer => 0,
        VarType::Byte => 1,
        VarType::Word => 2,
        VarType::Cardinal => 3,
        VarType::Real(_) => 4,
        VarType::Boolean => 5,
        VarType::Char => 6,
        VarType::Enum => 7,
        VarType::String => 8,
        VarType::Set => 9,
        VarType::Array => 10,
        VarType::Record => 11,
        VarType::MemoryStream => 12,
        VarType::File => 13,
        VarType::Pointer => 14,
        VarType::Nil => 15,
        VarType::Closure => 16,
        VarType::Void => 17,
    }
}

/// Inverse of [`var_type_wire_tag`], used by `DEFINE_GLOBAL`/
/// `INIT_LOCAL_*` to decode a declared-type byte back into a `VarType`.
/// `Real` always decodes to `RealKind::Double` — the wire byte doesn't
/// carry the float/double/long-double sub-kind, so a global or local
/// declared as `Float`/`LongDouble` loses that distinction across the
/// wire format. See DESIGN.md.
pub fn var_type_from_wire_tag(tag: u8) -> Option<VarType> {
    use pvm_core::RealKind;
    match tag {
        0 => Some(VarType::Integer),
        1 => Some(VarType::Byte),
        2 => Some(VarType::Word),
        3 => Some(VarType::Cardinal),
        4 => Some(VarType::Real(RealKind::Double)),
        5 => Some(VarType::Boolean),
        6 => Some(VarType::Char),
        7 => Some(VarType::Enum),
        8 => Some(VarType::String),
        9 => Some(VarType::Set),
        10 => Some(VarType::Array),
        11 => Some(VarType::Record),
        12 => Some(VarType::MemoryStream),
        13 => Some(VarType::File),
        14 => Some(VarType::Pointer),
        15 => Some(VarType::Nil),
        16 => Some(VarType::Closure),
        17 => Some(VarType::Void),
        _ => None,
    }
}

/// A complete compiled unit: code, line table, constant pool, and the
/// chunk-level caches (spec §3.2).
///
/// `Clone`able deliberately: spec §9's "threaded VM siblings" redesign
/// note allows caches to live purely out-of-band, so each worker VM
/// spawned by `THREAD_CREATE` gets its own cloned chunk (code/constants
/// shared by value, caches starting cold) instead of sharing one chunk
/// behind a lock that every opcode fetch would have to take. A sibling's
/// cache simply re-resolves once on first use — no different, from a
/// correctness standpoint, than a stale inline-cache read in the
/// original's shared-pointer model (spec §5: "a stale NULL read by
/// another thread simply re-resolves").
#[derive(Debug, Clone)]
pub struct BytecodeChunk {
    pub version: u32,
    pub code: Vec<u8>,
    pub lines: Vec<i32>,
    pub constants: Vec<Value>,
    /// Parallel to `constants`: for string constants holding builtin
    /// names, the index of the lowercased alias.
    pub builtin_lowercase_indices: Vec<Option<usize>>,
    /// Parallel to `constants`: resolved global symbol, keyed by the
    /// constant index that names it (spec §3.2).
    pub global_symbol_cache: Vec<Option<Arc<Symbol>>>,
    /// Out-of-band stand-in for the in-stream 8-byte inline-cache slot
    /// (see module doc comment). Keyed by the byte offset of the
    /// opcode that owns the slot.
    call_site_cache: HashMap<usize, Arc<Symbol>>,
    /// Record field-name shapes, indexed by `ALLOC_OBJECT`'s operand.
    /// Spec §4.6 names `ALLOC_OBJECT[16] fields` without specifying how
    /// the VM learns field *names* (only `GET_FIELD_OFFSET`/
    /// `LOAD_FIELD_VALUE_BY_NAME` carry a name constant at the access
    /// site) — resolved here by treating the operand as an index into
    /// this side table, the same way every other opcode in its wire-
    /// format group (`GET_FIELD_ADDRESS`, `CALL_HOST`, ...) treats its
    /// operand as an index rather than a literal count. See DESIGN.md.
    pub record_shapes: Vec<Vec<String>>,
}

impl BytecodeChunk {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            builtin_lowercase_indices: Vec::new(),
            global_symbol_cache: Vec::new(),
            call_site_cache: HashMap::new(),
            record_shapes: Vec::new(),
        }
    }

    /// Register a record shape (ordered field names) for `ALLOC_OBJECT`
    /// to reference by index.
    pub fn add_record_shape(&mut self, field_names: Vec<String>) -> usize {
        let idx = self.record_shapes.len();
        self.record_shapes.push(field_names);
        idx
    }

    pub fn write_byte(&mut self, byte: u8, line: i32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Big-endian 16-bit operand (spec §4.2).
    pub fn emit_short(&mut self, value: u16, line: i32) {
        self.write_byte((value >> 8) as u8, line);
        self.write_byte((value & 0xFF) as u8, line);
    }

    /// Big-endian 32-bit operand.
    pub fn emit_int32(&mut self, value: u32, line: i32) {
        self.write_byte((value >> 24) as u8, line);
        self.write_byte((value >> 16 & 0xFF) as u8, line);
        self.write_byte((value >> 8 & 0xFF) as u8, line);
        self.write_byte((value & 0xFF) as u8, line);
    }

    /// Overwrite a previously emitted 16-bit operand in place (jump
    /// fixups). Bounds-checked: panics on an out-of-range offset, since
    /// that can only happen from a compiler bug, not bad input data.
    pub fn patch_short(&mut self, offset: usize, value: u16) {
        assert!(
            offset + 1 < self.code.len(),
            "patch_short offset {offset} out of bounds (len {})",
            self.code.len()
        );
        self.code[offset] = (value >> 8) as u8;
        self.code[offset + 1] = (value & 0xFF) as u8;
    }

    /// Reserve the 8 trailing bytes an inline-cache-bearing opcode needs
    /// (spec §3.2). Zero-filled; never read back directly — see the
    /// module doc comment.
    pub fn write_inline_cache_slot(&mut self, line: i32) {
        for _ in 0..GLOBAL_INLINE_CACHE_SLOT_SIZE {
            self.write_byte(0, line);
        }
    }

    /// Deduplicate-or-append into the constant pool (spec §4.2). Only
    /// `Integer`, `Real`, `String`, and `Char` are deduplicated; every
    /// other kind is always appended fresh (arrays/records are rarely
    /// repeated literally and comparing them for dedup would cost more
    /// than the pool entry it might save).
    pub fn add_constant(&mut self, value: Value) -> usize {
        let dedupe_candidate = matches!(
            value,
            Value::Integer(_) | Value::Real(_, _) | Value::String(_) | Value::Char(_)
        );
        if dedupe_candidate {
            if let Some(idx) = self.constants.iter().position(|existing| existing == &value) {
                return idx;
            }
        }
        let idx = self.constants.len();
        self.constants.push(value);
        self.builtin_lowercase_indices.push(None);
        self.global_symbol_cache.push(None);
        idx
    }

    pub fn set_builtin_lowercase_index(&mut self, original: usize, lower: usize) {
        if let Some(slot) = self.builtin_lowercase_indices.get_mut(original) {
            *slot = Some(lower);
        }
    }

    pub fn get_builtin_lowercase_index(&self, index: usize) -> Option<usize> {
        self.builtin_lowercase_indices.get(index).copied().flatten()
    }

    /// Read the call-site inline cache for the instruction starting at
    /// `offset`, if primed.
    pub fn cached_symbol_at(&self, offset: usize) -> Option<Arc<Symbol>> {
        self.call_site_cache.get(&offset).cloned()
    }

    /// Prime the call-site inline cache (spec §4.3 step 2: "store the
    /// resolved pointer into the inline-cache slot").
    pub fn prime_call_site(&mut self, offset: usize, symbol: Arc<Symbol>) {
        self.call_site_cache.insert(offset, symbol);
    }

    /// Decoded length of the instruction starting at `offset` (spec
    /// §4.2, normative table in §6.3). Grounded on
    /// `examples/original_source/src/compiler/bytecode.c`'s
    /// `getInstructionLength`.
    pub fn get_instruction_length(&self, offset: usize) -> usize {
        use OpCode::*;
        let Some(op) = OpCode::from_u8(self.code[offset]) else {
            return 1;
        };
        match op {
            RETURN | ADD | SUBTRACT | MULTIPLY | DIVIDE | INT_DIV | MOD | NEGATE | NOT
            | TO_BOOL | EQUAL | NOT_EQUAL | GREATER | GREATER_EQUAL | LESS | LESS_EQUAL
            | AND | OR | XOR | SHL | SHR | CONST_0 | CONST_1 | CONST_TRUE | CONST_FALSE
            | SWAP | DUP | POP | HALT | EXIT | GET_CHAR_ADDRESS | SET_INDIRECT
            | GET_INDIRECT | IN | GET_CHAR_FROM_STRING | THREAD_JOIN | MUTEX_CREATE
            | RCMUTEX_CREATE | MUTEX_LOCK | MUTEX_UNLOCK | MUTEX_DESTROY => 1,

            PUSH_IMMEDIATE_INT8 => 2,

            CONSTANT | GET_LOCAL | SET_LOCAL | INC_LOCAL | DEC_LOCAL | GET_LOCAL_ADDRESS
            | GET_FIELD_ADDRESS | GET_FIELD_OFFSET | LOAD_FIELD_VALUE
            | LOAD_FIELD_VALUE_BY_NAME | ALLOC_OBJECT | GET_ELEMENT_ADDRESS
            | LOAD_ELEMENT_VALUE | GET_UPVALUE | SET_UPVALUE | GET_UPVALUE_ADDRESS
            | CALL_HOST | CALL_INDIRECT | PROC_CALL_INDIRECT | GET_GLOBAL_ADDRESS => 2,

            CONSTANT16 | GET_FIELD_ADDRESS16 | GET_FIELD_OFFSET16 | LOAD_FIELD_VALUE16
            | LOAD_FIELD_VALUE_BY_NAME16 | ALLOC_OBJECT16 | GET_GLOBAL_ADDRESS16
            | THREAD_CREATE | JUMP | JUMP_IF_FALSE => 3,

            FORMAT_VALUE => 3,

            GET_GLOBAL | SET_GLOBAL | GET_GLOBAL_CACHED | SET_GLOBAL_CACHED => {
                2 + GLOBAL_INLINE_CACHE_SLOT_SIZE
            }
            GET_GLOBAL16 | SET_GLOBAL16 | GET_GLOBAL16_CACHED | SET_GLOBAL16_CACHED => {
                3 + GLOBAL_INLINE_CACHE_SLOT_SIZE
            }

            CALL_BUILTIN | CALL_USER_PROC => 4,
            CALL_BUILTIN_PROC => 6,
            CALL => 6,
            CALL_METHOD => 3,

            GET_ELEMENT_ADDRESS_CONST | LOAD_ELEMENT_VALUE_CONST => 5,

            INIT_LOCAL_STRING => 3,
            INIT_LOCAL_POINTER => 4,
            INIT_LOCAL_FILE => 5,

            INIT_LOCAL_ARRAY => self.array_init_length(offset, 2),
            INIT_FIELD_ARRAY => self.array_init_length(offset, 2),

            DEFINE_GLOBAL => self.define_global_length(offset, 2),
            DEFINE_GLOBAL16 => self.define_global_length(offset, 3),
        }
    }

    /// `INIT_LOCAL_ARRAY`/`INIT_FIELD_ARRAY` share a shape: opcode + slot
    /// byte + dims byte + dims*4 bound-index bytes + elem type byte +
    /// 2-byte elem-type-name index (spec §6.3).
    fn array_init_length(&self, offset: usize, header: usize) -> usize {
        let dims_pos = offset + header;
        if dims_pos >= self.code.len() {
            return 1;
        }
        let dims = self.code[dims_pos] as usize;
        header + 1 + dims * 4 + 3
    }

    /// `DEFINE_GLOBAL`/`DEFINE_GLOBAL16` variable-length payload (spec
    /// §6.3). `header` is the byte count before the declared-type byte
    /// (2 for the 8-bit name index, 3 for the 16-bit one).
    fn define_global_length(&self, offset: usize, header: usize) -> usize {
        let type_pos = offset + header;
        if type_pos >= self.code.len() {
            return 1;
        }
        let declared = self.code[type_pos];
        let mut pos = offset + header + 1;
        if declared == var_type_wire_tag(VarType::Array) {
            if pos < self.code.len() {
                let dims = self.code[pos] as usize;
                pos += 1 + dims * 4 + 3;
            }
        } else {
            pos += 2; // type-name index
            if declared == var_type_wire_tag(VarType::String) {
                pos += 2; // length-constant index
            } else if declared == var_type_wire_tag(VarType::File) {
                pos += 3; // elem type byte + elem-type-name index
            }
        }
        pos - offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_dedup_returns_same_index() {
        let mut chunk = BytecodeChunk::new(1);
        let a = chunk.add_constant(Value::Integer(42));
        let b = chunk.add_constant(Value::Integer(42));
        assert_eq!(a, b);
        assert_eq!(chunk.constants.len(), 1);
    }

    #[test]
    fn array_and_record_constants_are_never_deduped() {
        let mut chunk = BytecodeChunk::new(1);
        let arr = pvm_core::ArrayValue::new(vec![0], vec![2], VarType::Integer, Value::Integer(0))
            .unwrap();
        let a = chunk.add_constant(Value::Array(Box::new(arr.clone())));
        let b = chunk.add_constant(Value::Array(Box::new(arr)));
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_length_opcodes_report_correct_size() {
        let mut chunk = BytecodeChunk::new(1);
        chunk.write_byte(OpCode::ADD as u8, 1);
        assert_eq!(chunk.get_instruction_length(0), 1);

        chunk.write_byte(OpCode::CALL as u8, 1);
        chunk.emit_short(7, 1);
        chunk.emit_short(100, 1);
        chunk.write_byte(2, 1);
        assert_eq!(chunk.get_instruction_length(1), 6);
    }

    #[test]
    fn get_global_reserves_inline_cache_bytes() {
        let mut chunk = BytecodeChunk::new(1);
        chunk.write_byte(OpCode::GET_GLOBAL as u8, 1);
        chunk.write_byte(3, 1);
        chunk.write_inline_cache_slot(1);
        assert_eq!(chunk.get_instruction_length(0), 2 + GLOBAL_INLINE_CACHE_SLOT_SIZE);
        assert_eq!(chunk.code.len(), 2 + GLOBAL_INLINE_CACHE_SLOT_SIZE);
    }

    #[test]
    fn instruction_lengths_sum_to_code_length() {
        let mut chunk = BytecodeChunk::new(1);
        chunk.write_byte(OpCode::CONST_0 as u8, 1);
        chunk.write_byte(OpCode::CONST_1 as u8, 1);
        chunk.write_byte(OpCode::ADD as u8, 1);
        chunk.write_byte(OpCode::HALT as u8, 1);

        let mut offset = 0;
        let mut total = 0;
        while offset < chunk.code.len() {
            let len = chunk.get_instruction_length(offset);
            total += len;
            offset += len;
        }
        assert_eq!(total, chunk.code.len());
    }

    #[test]
    fn init_local_array_length_accounts_for_dimension_count() {
        let mut chunk = BytecodeChunk::new(1);
        chunk.write_byte(OpCode::INIT_LOCAL_ARRAY as u8, 1); // opcode
        chunk.write_byte(0, 1); // slot
        chunk.write_byte(2, 1); // 2 dimensions
        for _ in 0..2 {
            chunk.emit_short(0, 1); // lower bound const idx
            chunk.emit_short(1, 1); // upper bound const idx
        }
        chunk.write_byte(var_type_wire_tag(VarType::Integer), 1);
        chunk.emit_short(0xFFFF, 1);

        // header(2) + dims_byte(1) + 2*4 + 3 = 14
        assert_eq!(chunk.get_instruction_length(0), 14);
    }

    #[test]
    fn define_global_length_matches_bytes_actually_consumed() {
        let mut chunk = BytecodeChunk::new(1);
        chunk.write_byte(OpCode::DEFINE_GLOBAL as u8, 1); // opcode
        chunk.write_byte(0, 1); // name_idx
        chunk.write_byte(var_type_wire_tag(VarType::Integer), 1); // declared type
        chunk.emit_short(0xFFFF, 1); // type-name index (unused for Integer)
        chunk.write_byte(OpCode::HALT as u8, 1);

        // opcode(1) + name_idx(1) + declared(1) + type-name-idx(2) = 5
        assert_eq!(chunk.get_instruction_length(0), 5);
        assert_eq!(chunk.code[5], OpCode::HALT as u8);
    }
}
