//! The VM itself: operand stack, call frames, globals, heap, concurrency
//! handle, and the opcode dispatch loop (spec §4, §6.1, §6.3).
//!
//! Struct shape grounded on `examples/original_source/src/vm/vm.h`'s
//! `VM_s`; the dispatch loop's opcode groups follow spec.md §4.6 exactly,
//! since `vm.c` itself (the original dispatch loop) was not retrieved —
//! only the header. Frontend-only `VM_s` fields (`frontendContext`,
//! `shellIndexing`) have no counterpart here per spec §1 ("frontends are
//! free"; CORE only).

use crate::builtins::{self, BuiltinFn, BuiltinKind, BuiltinRegistry};
use crate::chunk::{var_type_from_wire_tag, BytecodeChunk, OpCode, GLOBAL_INLINE_CACHE_SLOT_SIZE};
use crate::concurrency::ConcurrencyHandle;
use crate::config::Config;
use crate::diagnostics::{self, OpcodeProfile};
use crate::error::{runtime_error, runtime_warning, InterpretResult, RuntimeError};
use crate::frame::CallFrame;
use crate::globals::{resolve_global, resolve_global_cached, GlobalTables};
use crate::heap::{self, Heap};
use crate::host::{HostFunction, HostFunctionId, HostRegistry};
use pvm_core::{
    ArrayValue, ClosureEnv, ClosureValue, FileValue, HashTable, PointerValue, RecordValue,
    SeqString, SetValue, Symbol, Value, VarType,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Current wire format version (spec §3.2, §6.4). Matches
/// `PSCAL_VM_VERSION` in `examples/original_source/src/core/version.h`.
pub const VM_VERSION: u32 = 9;

/// An internal addressing target for `GET_*_ADDRESS`/`GET_INDIRECT`/
/// `SET_INDIRECT` (spec §4.6). The original VM hands out real pointers
/// into one flat address space (stack, globals, and heap share it); Rust
/// can't do that safely, so this crate keeps a VM-owned table of
/// "places" instead and threads a synthetic index through `Value::Pointer`
/// (see [`Vm::PLACE_TAG`]).
#[derive(Debug, Clone)]
enum Place {
    Stack(usize),
    Global(Arc<Symbol>),
    Upvalue(Arc<Mutex<Value>>),
    /// A `New`-allocated heap slot used as an addressing base (e.g.
    /// `p^.field` where `p` came from `New`, not `GET_LOCAL_ADDRESS`).
    Heap(u64),
    Field(Box<Place>, usize),
    Element(Box<Place>, usize),
    CharInString(Box<Place>, usize),
}

/// A free-standing record/class-method table, keyed by class name then
/// `CALL_METHOD`'s `method_idx` operand (spec §4.6 `CALL_METHOD`;
/// registration/lookup grounded on `vmRegisterClassMethod`/
/// `vmFindClassMethod` in `vm.h`). A method's receiver is expected to be
/// a `Record` whose first field, by convention, is named `__class__` and
/// holds the class name as a `String` — the wire format itself carries
/// no class tag, so this convention is the calling-convention decision
/// recorded in DESIGN.md.
pub type ClassMethodTable = HashMap<String, Vec<Option<Arc<Symbol>>>>;

/// The virtual machine (spec GLOSSARY "VM"). One owns the others it
/// spawns via `THREAD_CREATE`: siblings share `globals`/`procedures`
/// (cheaply, via `Arc<Symbol>` clones) and `concurrency`, but each gets
/// its own operand stack, call-frame stack, address table, and heap.
pub struct Vm {
    pub config: Config,
    pub chunk: BytecodeChunk,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    addresses: Vec<Place>,
    pub globals: GlobalTables,
    pub procedures: HashTable,
    procedure_by_address: HashMap<usize, Arc<Symbol>>,
    class_methods: ClassMethodTable,
    host_registry: Arc<HostRegistry>,
    pub builtins: Arc<BuiltinRegistry>,
    pub concurrency: ConcurrencyHandle,
    pub heap: Heap,
    ip: usize,
    pub exit_requested: bool,
    pub abort_requested: bool,
    pub current_builtin_name: Option<String>,
    /// Per-VM `errno`-style slot `IOResult` reads and clears (spec §7).
    pub last_io_error: i32,
    opcode_profile: Option<OpcodeProfile>,
}

const PLACE_TAG: u64 = 1 << 63;

impl Vm {
    pub fn new(config: Config) -> Self {
        let mut builtins = BuiltinRegistry::new();
        builtins::install_standard_library(&mut builtins);
        Self {
            concurrency: ConcurrencyHandle::new(config.worker_cap, config.mutex_cap),
            config,
            chunk: BytecodeChunk::new(VM_VERSION),
            stack: Vec::new(),
            frames: Vec::new(),
            addresses: Vec::new(),
            globals: GlobalTables::new(),
            procedures: HashTable::new(),
            procedure_by_address: HashMap::new(),
            class_methods: HashMap::new(),
            host_registry: Arc::new(HostRegistry::new()),
            builtins: Arc::new(builtins),
            heap: Heap::new(),
            ip: 0,
            exit_requested: false,
            abort_requested: false,
            current_builtin_name: None,
            last_io_error: 0,
            opcode_profile: None,
        }
    }

    /// Register a native callback for `id` (spec §6.2). Only valid
    /// before any sibling VM has been spawned (after that the registry
    /// is shared by `Arc` and no longer uniquely owned) — that's a
    /// startup-only constraint every real frontend already respects,
    /// since host functions are wired up once before `interpret` runs.
    pub fn register_host_function(&mut self, id: HostFunctionId, f: HostFunction) {
        Arc::get_mut(&mut self.host_registry)
            .expect("cannot register host functions after the VM has spawned sibling threads")
            .register(id, f);
    }

    pub fn register_class_method(&mut self, class_name: &str, method_idx: usize, symbol: Arc<Symbol>) {
        let table = self.class_methods.entry(class_name.to_string()).or_default();
        if table.len() <= method_idx {
            table.resize(method_idx + 1, None);
        }
        table[method_idx] = Some(symbol);
    }

    pub fn enable_opcode_profiling(&mut self) {
        self.opcode_profile = Some(OpcodeProfile::new());
    }

    pub fn opcode_profile_dump(&self) -> Option<String> {
        self.opcode_profile.as_ref().map(OpcodeProfile::dump)
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// The value left on top of the operand stack after `interpret`
    /// returns `InterpretResult::Ok`, if any (a procedure-only program
    /// leaves the stack empty).
    pub fn peek_top(&self) -> Option<&Value> {
        self.stack.last()
    }

    /// The value `depth` slots below the top (0 is the top itself).
    pub fn peek(&self, depth: usize) -> Option<&Value> {
        let len = self.stack.len();
        if depth >= len {
            None
        } else {
            self.stack.get(len - 1 - depth)
        }
    }

    /// Build a sibling `Vm` sharing globals/procedures/concurrency/host
    /// functions/builtins with `self`, for `THREAD_CREATE` (spec §4.7,
    /// §5: "siblings share the globals table, the procedure table...").
    fn spawn_sibling(&self) -> Self {
        Self {
            config: self.config,
            chunk: self.chunk.clone(),
            stack: Vec::new(),
            frames: Vec::new(),
            addresses: Vec::new(),
            globals: GlobalTables {
                globals: self.globals.globals.clone(),
                const_globals: self.globals.const_globals.clone(),
            },
            procedures: self.procedures.clone(),
            procedure_by_address: self.procedure_by_address.clone(),
            class_methods: self.class_methods.clone(),
            host_registry: Arc::clone(&self.host_registry),
            builtins: Arc::clone(&self.builtins),
            concurrency: self.concurrency.clone(),
            heap: Heap::new(),
            ip: 0,
            exit_requested: false,
            abort_requested: false,
            current_builtin_name: None,
            last_io_error: 0,
            opcode_profile: None,
        }
    }

    // ---- operand stack -------------------------------------------------

    fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.config.stack_cap {
            return Err(RuntimeError::Resource("operand stack overflow".to_string()));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| RuntimeError::Resource("operand stack underflow".to_string()))
    }

    fn peek(&self, distance: usize) -> Result<&Value, RuntimeError> {
        let len = self.stack.len();
        if distance >= len {
            return Err(RuntimeError::Resource("operand stack underflow".to_string()));
        }
        Ok(&self.stack[len - 1 - distance])
    }

    // ---- operand decoding -----------------------------------------------

    fn read_u8(&mut self) -> u8 {
        let b = self.chunk.code[self.ip];
        self.ip += 1;
        b
    }

    fn read_i8(&mut self) -> i8 {
        self.read_u8() as i8
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8();
        let lo = self.read_u8();
        ((hi as u16) << 8) | lo as u16
    }

    fn read_i16(&mut self) -> i16 {
        self.read_u16() as i16
    }

    fn read_u32(&mut self) -> u32 {
        let a = self.read_u8();
        let b = self.read_u8();
        let c = self.read_u8();
        let d = self.read_u8();
        ((a as u32) << 24) | ((b as u32) << 16) | ((c as u32) << 8) | d as u32
    }

    fn skip_inline_cache_slot(&mut self) {
        self.ip += GLOBAL_INLINE_CACHE_SLOT_SIZE;
    }

    fn constant_string(&self, idx: usize) -> Result<String, RuntimeError> {
        match self.chunk.constants.get(idx) {
            Some(Value::String(s)) => Ok(s.as_str().to_string()),
            Some(Value::Char(c)) => Ok((*c as char).to_string()),
            other => Err(RuntimeError::TypeMismatch(format!(
                "constant {idx} is not a name (found {other:?})"
            ))),
        }
    }

    fn constant_int(&self, idx: usize) -> Result<i64, RuntimeError> {
        match self.chunk.constants.get(idx) {
            Some(v) => Ok(v.ordinal().map_err(RuntimeError::from)?),
            None => Err(RuntimeError::TypeMismatch(format!("constant {idx} out of bounds"))),
        }
    }

    fn line_at(&self, offset: usize) -> i32 {
        self.chunk.lines.get(offset).copied().unwrap_or(-1)
    }

    /// Source line of the instruction currently executing, for builtins
    /// (which have no direct access to `ip`) to attach to `runtime_warning`.
    pub fn current_line(&self) -> i32 {
        self.line_at(self.ip)
    }

    // ---- address table ---------------------------------------------------

    fn alloc_place(&mut self, place: Place) -> u64 {
        let idx = self.addresses.len() as u64;
        self.addresses.push(place);
        idx | PLACE_TAG
    }

    fn place_at(&self, addr: u64) -> Option<Place> {
        if addr & PLACE_TAG == 0 {
            return None;
        }
        self.addresses.get((addr & !PLACE_TAG) as usize).cloned()
    }

    fn resolve_place(&self, place: &Place) -> Result<Value, RuntimeError> {
        match place {
            Place::Stack(idx) => self
                .stack
                .get(*idx)
                .cloned()
                .ok_or_else(|| RuntimeError::Resource(format!("stack slot {idx} out of bounds"))),
            Place::Global(sym) => Ok(sym
                .storage
                .as_ref()
                .expect("global symbol always has storage")
                .lock()
                .expect("global storage mutex poisoned")
                .clone()),
            Place::Upvalue(cell) => Ok(cell.lock().expect("upvalue mutex poisoned").clone()),
            Place::Heap(addr) => self
                .heap
                .get(*addr)
                .cloned()
                .ok_or_else(|| RuntimeError::NilDereference(format!("heap address {addr} is not live"))),
            Place::Field(base, offset) => match self.resolve_place(base)? {
                Value::Record(r) => Ok(r.get_by_offset(*offset)?.clone()),
                other => Err(RuntimeError::TypeMismatch(format!(
                    "field address base is {} not Record",
                    other.var_type()
                ))),
            },
            Place::Element(base, flat) => match self.resolve_place(base)? {
                Value::Array(a) => Ok(a.get_flat(*flat)?.clone()),
                other => Err(RuntimeError::TypeMismatch(format!(
                    "element address base is {} not Array",
                    other.var_type()
                ))),
            },
            Place::CharInString(base, index) => match self.resolve_place(base)? {
                Value::String(s) => Ok(Value::Char(s.byte_at(*index)?)),
                other => Err(RuntimeError::TypeMismatch(format!(
                    "char address base is {} not String",
                    other.var_type()
                ))),
            },
        }
    }

    /// Read-modify-write through a (possibly nested) place, rewriting
    /// every enclosing parent so the mutation is visible through the
    /// root stack/global/heap slot (spec §4.6: `SET_INDIRECT`).
    fn write_through_place(&mut self, place: &Place, new_value: Value) -> Result<(), RuntimeError> {
        match place {
            Place::Stack(idx) => {
                let slot = self
                    .stack
                    .get_mut(*idx)
                    .ok_or_else(|| RuntimeError::Resource(format!("stack slot {idx} out of bounds")))?;
                assign_into(slot, new_value)
            }
            Place::Global(sym) => {
                let mut guard = sym
                    .storage
                    .as_ref()
                    .expect("global symbol always has storage")
                    .lock()
                    .expect("global storage mutex poisoned");
                assign_into(&mut guard, new_value)
            }
            Place::Upvalue(cell) => {
                let mut guard = cell.lock().expect("upvalue mutex poisoned");
                assign_into(&mut guard, new_value)
            }
            Place::Heap(addr) => {
                let slot = self
                    .heap
                    .get_mut(*addr)
                    .ok_or_else(|| RuntimeError::NilDereference(format!("heap address {addr} is not live")))?;
                assign_into(slot, new_value)
            }
            Place::Field(base, offset) => {
                let mut parent = self.resolve_place(base)?;
                match &mut parent {
                    Value::Record(r) => r.set_by_offset(*offset, new_value)?,
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "field address base is {} not Record",
                            other.var_type()
                        )))
                    }
                }
                self.write_through_place(base, parent)
            }
            Place::Element(base, flat) => {
                let mut parent = self.resolve_place(base)?;
                match &mut parent {
                    Value::Array(a) => a.set_flat(*flat, new_value)?,
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "element address base is {} not Array",
                            other.var_type()
                        )))
                    }
                }
                self.write_through_place(base, parent)
            }
            Place::CharInString(base, index) => {
                let byte = match &new_value {
                    Value::Char(c) => *c,
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "cannot write a {} through a char address",
                            other.var_type()
                        )))
                    }
                };
                let mut parent = self.resolve_place(base)?;
                match &mut parent {
                    Value::String(s) => s.set_byte(*index, byte)?,
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "char address base is {} not String",
                            other.var_type()
                        )))
                    }
                }
                self.write_through_place(base, parent)
            }
        }
    }

    /// Dereference a pointer value, whichever table its address belongs
    /// to (the VM's internal address table for `GET_*_ADDRESS` results,
    /// or the heap for `New`-allocated blocks). Exposed for builtins
    /// (`Inc`, `Dispose`, `ReadLn`, ...) that take `VAR` parameters.
    pub fn deref_pointer(&self, ptr: &PointerValue) -> Result<Value, RuntimeError> {
        let addr = ptr
            .address
            .ok_or_else(|| RuntimeError::NilDereference("dereferenced a nil pointer".to_string()))?;
        if let Some(place) = self.place_at(addr) {
            self.resolve_place(&place)
        } else {
            self.heap
                .get(addr)
                .cloned()
                .ok_or_else(|| RuntimeError::NilDereference(format!("pointer {addr} is not live")))
        }
    }

    pub fn assign_through_pointer(&mut self, ptr: &PointerValue, value: Value) -> Result<(), RuntimeError> {
        let addr = ptr
            .address
            .ok_or_else(|| RuntimeError::NilDereference("assigned through a nil pointer".to_string()))?;
        if let Some(place) = self.place_at(addr) {
            self.write_through_place(&place, value)
        } else {
            let slot = self
                .heap
                .get_mut(addr)
                .ok_or_else(|| RuntimeError::NilDereference(format!("pointer {addr} is not live")))?;
            *slot = value;
            Ok(())
        }
    }

    /// `vmNullifyAliases`: walk every global and every live stack slot,
    /// nilling any `Pointer` that addresses `disposed` (spec §3.4).
    pub fn nullify_aliases(&mut self, disposed: u64) {
        for (_, sym) in self.globals.globals.iter() {
            if let Some(storage) = &sym.storage {
                let mut guard = storage.lock().expect("global storage mutex poisoned");
                heap::nullify_in_place(&mut guard, disposed);
            }
        }
        for slot in self.stack.iter_mut() {
            heap::nullify_in_place(slot, disposed);
        }
    }

    // ---- entry point ------------------------------------------------------

    /// Run `chunk` starting at `entry_offset` (spec §6.1: `interpret(vm,
    /// chunk, globals, const_globals, procedures, entry_offset)`).
    /// Installs the tables, clears execution state, and dispatches until
    /// `HALT`, a top-level `RETURN`, or an unrecovered error.
    pub fn interpret(
        &mut self,
        chunk: BytecodeChunk,
        globals: HashTable,
        const_globals: HashTable,
        procedures: HashTable,
        entry_offset: u16,
    ) -> InterpretResult {
        self.chunk = chunk;
        self.globals = GlobalTables { globals, const_globals };
        self.procedures = procedures;
        self.procedure_by_address.clear();
        for (_, sym) in self.procedures.iter() {
            if let Some(addr) = sym.bytecode_address {
                self.procedure_by_address.insert(addr, sym.clone());
            }
        }
        self.stack.clear();
        self.frames.clear();
        self.addresses.clear();
        self.ip = entry_offset as usize;
        self.exit_requested = false;
        self.abort_requested = false;

        loop {
            if self.abort_requested {
                return InterpretResult::RuntimeError;
            }
            if self.ip >= self.chunk.code.len() {
                return InterpretResult::Ok;
            }
            match self.step() {
                Ok(true) => return InterpretResult::Ok,
                Ok(false) => {}
                Err(err) => {
                    let line = self.line_at(self.ip);
                    let _ = runtime_error(line, err);
                    if self.config.verbose_errors {
                        tracing::error!(
                            "{}",
                            diagnostics::dump_stack_info_detailed(
                                &self.chunk,
                                self.ip,
                                &self.stack,
                                &self.frames,
                                "runtime error"
                            )
                        );
                    }
                    return InterpretResult::RuntimeError;
                }
            }
        }
    }

    /// Execute one instruction. Returns `Ok(true)` if the program should
    /// halt (`HALT`, or a `RETURN` with no enclosing frame).
    fn step(&mut self) -> Result<bool, RuntimeError> {
        let offset = self.ip;
        let byte = self.chunk.code[offset];
        let op = OpCode::from_u8(byte)
            .ok_or_else(|| RuntimeError::TypeMismatch(format!("unknown opcode byte {byte} at {offset}")))?;
        self.ip += 1;
        if let Some(profile) = &mut self.opcode_profile {
            profile.record(op);
        }

        use OpCode::*;
        match op {
            CONSTANT => {
                let idx = self.read_u8() as usize;
                let v = self.chunk.constants.get(idx).cloned().unwrap_or(Value::Nil);
                self.push(v)?;
            }
            CONSTANT16 => {
                let idx = self.read_u16() as usize;
                let v = self.chunk.constants.get(idx).cloned().unwrap_or(Value::Nil);
                self.push(v)?;
            }
            CONST_0 => self.push(Value::Integer(0))?,
            CONST_1 => self.push(Value::Integer(1))?,
            CONST_TRUE => self.push(Value::Boolean(true))?,
            CONST_FALSE => self.push(Value::Boolean(false))?,
            PUSH_IMMEDIATE_INT8 => {
                let n = self.read_i8();
                self.push(Value::Integer(n as i64))?;
            }
            POP => {
                self.pop()?;
            }
            SWAP => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(RuntimeError::Resource("operand stack underflow".to_string()));
                }
                self.stack.swap(len - 1, len - 2);
            }
            DUP => {
                let top = self.peek(0)?.clone();
                self.push(top)?;
            }

            ADD | SUBTRACT | MULTIPLY | DIVIDE | INT_DIV | MOD | AND | OR | XOR | SHL | SHR => {
                self.binary_arith(op)?;
            }
            NEGATE => {
                let v = self.pop()?;
                self.push(pvm_core::arithmetic::neg(&v)?)?;
            }
            NOT => {
                let v = self.pop()?;
                self.push(pvm_core::arithmetic::not(&v)?)?;
            }
            TO_BOOL => {
                let v = self.pop()?;
                self.push(Value::Boolean(v.is_truthy()?))?;
            }

            EQUAL | NOT_EQUAL | GREATER | GREATER_EQUAL | LESS | LESS_EQUAL => {
                self.compare_op(op)?;
            }

            JUMP => {
                let rel = self.read_i16();
                self.ip = (self.ip as i64 + rel as i64) as usize;
            }
            JUMP_IF_FALSE => {
                let rel = self.read_i16();
                let cond = self.pop()?;
                if !cond.is_truthy()? {
                    self.ip = (self.ip as i64 + rel as i64) as usize;
                }
            }
            RETURN => {
                return self.do_return();
            }
            HALT => return Ok(true),
            EXIT => {
                self.exit_requested = true;
                let halt = self.do_return()?;
                self.exit_requested = false;
                return Ok(halt);
            }

            DEFINE_GLOBAL => self.define_global(1)?,
            DEFINE_GLOBAL16 => self.define_global(2)?,

            GET_GLOBAL => self.get_global(1, false, offset)?,
            GET_GLOBAL16 => self.get_global(2, false, offset)?,
            GET_GLOBAL_CACHED => self.get_global(1, true, offset)?,
            GET_GLOBAL16_CACHED => self.get_global(2, true, offset)?,
            SET_GLOBAL => self.set_global(1, false, offset)?,
            SET_GLOBAL16 => self.set_global(2, false, offset)?,
            SET_GLOBAL_CACHED => self.set_global(1, true, offset)?,
            SET_GLOBAL16_CACHED => self.set_global(2, true, offset)?,
            GET_GLOBAL_ADDRESS => self.get_global_address(1)?,
            GET_GLOBAL_ADDRESS16 => self.get_global_address(2)?,

            GET_LOCAL => {
                let slot = self.read_u8() as usize;
                let abs = self.current_frame()?.local_slot(slot);
                let v = self
                    .stack
                    .get(abs)
                    .cloned()
                    .ok_or_else(|| RuntimeError::Resource(format!("local slot {slot} out of bounds")))?;
                self.push(v)?;
            }
            SET_LOCAL => {
                let slot = self.read_u8() as usize;
                let abs = self.current_frame()?.local_slot(slot);
                let v = self.pop()?;
                let target = self
                    .stack
                    .get_mut(abs)
                    .ok_or_else(|| RuntimeError::Resource(format!("local slot {slot} out of bounds")))?;
                assign_into(target, v)?;
            }
            INC_LOCAL | DEC_LOCAL => {
                let slot = self.read_u8() as usize;
                let abs = self.current_frame()?.local_slot(slot);
                let by = if op == INC_LOCAL { 1 } else { -1 };
                let current = self
                    .stack
                    .get(abs)
                    .ok_or_else(|| RuntimeError::Resource(format!("local slot {slot} out of bounds")))?;
                let (updated, wrapped) = pvm_core::arithmetic::inc(current, by)?;
                if wrapped {
                    runtime_warning(self.line_at(offset), &format!("{} overflowed and wrapped", updated.var_type()));
                }
                self.stack[abs] = updated;
            }
            GET_LOCAL_ADDRESS => {
                let slot = self.read_u8() as usize;
                let abs = self.current_frame()?.local_slot(slot);
                let base_type = self.stack.get(abs).map(Value::var_type).unwrap_or(VarType::Void);
                let addr = self.alloc_place(Place::Stack(abs));
                self.push(Value::Pointer(PointerValue { address: Some(addr), base_type }))?;
            }
            INIT_LOCAL_FILE => {
                let slot = self.read_u8() as usize;
                let elem_byte = self.read_u8();
                let _type_name_idx = self.read_u16();
                let elem_type = var_type_from_wire_tag(elem_byte).unwrap_or(VarType::Void);
                let abs = self.current_frame()?.local_slot(slot);
                self.set_stack_slot(abs, Value::File(Box::new(FileValue::closed(elem_type))))?;
            }
            INIT_LOCAL_STRING => {
                let slot = self.read_u8() as usize;
                let max_len_idx = self.read_u16() as usize;
                let max_len = self.constant_int(max_len_idx)? as usize;
                let abs = self.current_frame()?.local_slot(slot);
                self.set_stack_slot(abs, Value::String(SeqString::with_max_length("", max_len)))?;
            }
            INIT_LOCAL_POINTER => {
                let slot = self.read_u8() as usize;
                let _type_name_idx = self.read_u16();
                let abs = self.current_frame()?.local_slot(slot);
                self.set_stack_slot(abs, Value::Pointer(PointerValue::nil(VarType::Void)))?;
            }
            INIT_LOCAL_ARRAY => {
                let slot = self.read_u8() as usize;
                let value = self.read_array_init()?;
                let abs = self.current_frame()?.local_slot(slot);
                self.set_stack_slot(abs, value)?;
            }

            GET_FIELD_ADDRESS | GET_FIELD_ADDRESS16 => {
                let name_idx = if op == GET_FIELD_ADDRESS { self.read_u8() as usize } else { self.read_u16() as usize };
                let name = self.constant_string(name_idx)?;
                let ptr = self.pop_pointer("GET_FIELD_ADDRESS")?;
                let place = self.place_for_pointer(&ptr)?;
                let base = self.resolve_place(&place)?;
                let offset = match base {
                    Value::Record(r) => r
                        .field_offset(&name)
                        .ok_or_else(|| RuntimeError::TypeMismatch(format!("no field named '{name}'")))?,
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "GET_FIELD_ADDRESS base is {} not Record",
                            other.var_type()
                        )))
                    }
                };
                let addr = self.alloc_place(Place::Field(Box::new(place), offset));
                self.push(Value::Pointer(PointerValue { address: Some(addr), base_type: VarType::Void }))?;
            }
            GET_FIELD_OFFSET | GET_FIELD_OFFSET16 => {
                let idx = if op == GET_FIELD_OFFSET { self.read_u8() as usize } else { self.read_u16() as usize };
                self.push(Value::Integer(idx as i64))?;
            }
            LOAD_FIELD_VALUE | LOAD_FIELD_VALUE16 => {
                let idx = if op == LOAD_FIELD_VALUE { self.read_u8() as usize } else { self.read_u16() as usize };
                let base = self.pop()?;
                match base {
                    Value::Record(r) => {
                        let v = r.get_by_offset(idx)?.clone();
                        self.push(v)?;
                    }
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "LOAD_FIELD_VALUE base is {} not Record",
                            other.var_type()
                        )))
                    }
                }
            }
            LOAD_FIELD_VALUE_BY_NAME | LOAD_FIELD_VALUE_BY_NAME16 => {
                let name_idx = if op == LOAD_FIELD_VALUE_BY_NAME { self.read_u8() as usize } else { self.read_u16() as usize };
                let name = self.constant_string(name_idx)?;
                let base = self.pop()?;
                match base {
                    Value::Record(r) => {
                        let v = r.get_by_name(&name)?.clone();
                        self.push(v)?;
                    }
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "LOAD_FIELD_VALUE_BY_NAME base is {} not Record",
                            other.var_type()
                        )))
                    }
                }
            }
            ALLOC_OBJECT | ALLOC_OBJECT16 => {
                let idx = if op == ALLOC_OBJECT { self.read_u8() as usize } else { self.read_u16() as usize };
                let shape = self
                    .chunk
                    .record_shapes
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| RuntimeError::TypeMismatch(format!("no record shape at index {idx}")))?;
                let fields = shape.into_iter().map(|name| (name, Value::Nil)).collect();
                self.push(Value::Record(Box::new(RecordValue::new(fields))))?;
            }
            INIT_FIELD_ARRAY => {
                let field = self.read_u8() as usize;
                let value = self.read_array_init()?;
                let top = self
                    .stack
                    .last_mut()
                    .ok_or_else(|| RuntimeError::Resource("operand stack underflow".to_string()))?;
                match top {
                    Value::Record(r) => r.set_by_offset(field, value)?,
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "INIT_FIELD_ARRAY target is {} not Record",
                            other.var_type()
                        )))
                    }
                }
            }

            GET_ELEMENT_ADDRESS => {
                let dims = self.read_u8() as usize;
                let indices = self.pop_indices(dims)?;
                let ptr = self.pop_pointer("GET_ELEMENT_ADDRESS")?;
                let place = self.place_for_pointer(&ptr)?;
                let base = self.resolve_place(&place)?;
                let flat = match base {
                    Value::Array(a) => a.flat_index(&indices)?,
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "GET_ELEMENT_ADDRESS base is {} not Array",
                            other.var_type()
                        )))
                    }
                };
                let addr = self.alloc_place(Place::Element(Box::new(place), flat));
                self.push(Value::Pointer(PointerValue { address: Some(addr), base_type: VarType::Void }))?;
            }
            GET_ELEMENT_ADDRESS_CONST => {
                let flat = self.read_u32() as usize;
                let ptr = self.pop_pointer("GET_ELEMENT_ADDRESS_CONST")?;
                let place = self.place_for_pointer(&ptr)?;
                let addr = self.alloc_place(Place::Element(Box::new(place), flat));
                self.push(Value::Pointer(PointerValue { address: Some(addr), base_type: VarType::Void }))?;
            }
            LOAD_ELEMENT_VALUE => {
                let dims = self.read_u8() as usize;
                let indices = self.pop_indices(dims)?;
                let base = self.pop()?;
                match base {
                    Value::Array(a) => {
                        let v = a.get(&indices)?.clone();
                        self.push(v)?;
                    }
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "LOAD_ELEMENT_VALUE base is {} not Array",
                            other.var_type()
                        )))
                    }
                }
            }
            LOAD_ELEMENT_VALUE_CONST => {
                let flat = self.read_u32() as usize;
                let base = self.pop()?;
                match base {
                    Value::Array(a) => {
                        let v = a.get_flat(flat)?.clone();
                        self.push(v)?;
                    }
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "LOAD_ELEMENT_VALUE_CONST base is {} not Array",
                            other.var_type()
                        )))
                    }
                }
            }
            GET_CHAR_ADDRESS => {
                let index = self.pop()?.ordinal()? as usize;
                let ptr = self.pop_pointer("GET_CHAR_ADDRESS")?;
                let place = self.place_for_pointer(&ptr)?;
                let addr = self.alloc_place(Place::CharInString(Box::new(place), index));
                self.push(Value::Pointer(PointerValue { address: Some(addr), base_type: VarType::Char }))?;
            }
            GET_CHAR_FROM_STRING => {
                let index = self.pop()?.ordinal()? as usize;
                let s = self.pop()?;
                match s {
                    Value::String(s) => self.push(Value::Char(s.byte_at(index)?))?,
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "GET_CHAR_FROM_STRING base is {} not String",
                            other.var_type()
                        )))
                    }
                }
            }
            SET_INDIRECT => {
                let value = self.pop()?;
                let ptr = self.pop_pointer("SET_INDIRECT")?;
                self.assign_through_pointer(&ptr, value)?;
            }
            GET_INDIRECT => {
                let ptr = self.pop_pointer("GET_INDIRECT")?;
                let v = self.deref_pointer(&ptr)?;
                self.push(v)?;
            }
            IN => {
                let set = self.pop()?;
                let ordinal = self.pop()?.ordinal()?;
                match set {
                    Value::Set(s) => self.push(Value::Boolean(s.contains(ordinal)))?,
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "IN right-hand side is {} not Set",
                            other.var_type()
                        )))
                    }
                }
            }

            GET_UPVALUE => {
                let idx = self.read_u8() as usize;
                let cell = self.current_frame()?.upvalues.get(idx).cloned().ok_or_else(|| {
                    RuntimeError::Resource(format!("upvalue index {idx} out of bounds"))
                })?;
                let v = cell.lock().expect("upvalue mutex poisoned").clone();
                self.push(v)?;
            }
            SET_UPVALUE => {
                let idx = self.read_u8() as usize;
                let cell = self.current_frame()?.upvalues.get(idx).cloned().ok_or_else(|| {
                    RuntimeError::Resource(format!("upvalue index {idx} out of bounds"))
                })?;
                let v = self.pop()?;
                *cell.lock().expect("upvalue mutex poisoned") = v;
            }
            GET_UPVALUE_ADDRESS => {
                let idx = self.read_u8() as usize;
                let cell = self.current_frame()?.upvalues.get(idx).cloned().ok_or_else(|| {
                    RuntimeError::Resource(format!("upvalue index {idx} out of bounds"))
                })?;
                let addr = self.alloc_place(Place::Upvalue(cell));
                self.push(Value::Pointer(PointerValue { address: Some(addr), base_type: VarType::Void }))?;
            }

            CALL => self.do_call()?,
            CALL_USER_PROC => self.do_call_user_proc()?,
            CALL_INDIRECT => self.do_call_indirect(false)?,
            PROC_CALL_INDIRECT => self.do_call_indirect(true)?,
            CALL_BUILTIN => self.do_call_builtin(false)?,
            CALL_BUILTIN_PROC => self.do_call_builtin(true)?,
            CALL_METHOD => self.do_call_method()?,
            CALL_HOST => self.do_call_host()?,

            FORMAT_VALUE => {
                let width = self.read_u8();
                let precision = self.read_i8();
                let v = self.pop()?;
                self.push(Value::String(SeqString::new(format_value(&v, width, precision))))?;
            }

            THREAD_CREATE => self.do_thread_create()?,
            THREAD_JOIN => self.do_thread_join()?,
            MUTEX_CREATE => {
                let id = self.concurrency.mutexes.create()?;
                self.push(Value::Integer(id as i64))?;
            }
            RCMUTEX_CREATE => {
                let id = self.concurrency.mutexes.create_reentrant()?;
                self.push(Value::Integer(id as i64))?;
            }
            MUTEX_LOCK => {
                let id = self.pop()?.ordinal()? as u64;
                self.concurrency.mutexes.lock(id)?;
            }
            MUTEX_UNLOCK => {
                let id = self.pop()?.ordinal()? as u64;
                self.concurrency.mutexes.unlock(id)?;
            }
            MUTEX_DESTROY => {
                let id = self.pop()?.ordinal()? as u64;
                self.concurrency.mutexes.destroy(id)?;
            }
        }
        Ok(false)
    }

    fn current_frame(&self) -> Result<&CallFrame, RuntimeError> {
        self.frames
            .last()
            .ok_or_else(|| RuntimeError::Resource("no active call frame".to_string()))
    }

    fn set_stack_slot(&mut self, abs: usize, value: Value) -> Result<(), RuntimeError> {
        let slot = self
            .stack
            .get_mut(abs)
            .ok_or_else(|| RuntimeError::Resource(format!("stack slot {abs} out of bounds")))?;
        *slot = value;
        Ok(())
    }

    fn pop_pointer(&mut self, who: &str) -> Result<PointerValue, RuntimeError> {
        match self.pop()? {
            Value::Pointer(p) => Ok(p),
            other => Err(RuntimeError::TypeMismatch(format!(
                "{who} expects a pointer on top of stack, found {}",
                other.var_type()
            ))),
        }
    }

    /// Turn a pointer value into the `Place` it addresses, whichever
    /// table the address belongs to: the VM's internal address table
    /// (`GET_*_ADDRESS` results) or the heap (`New`-allocated blocks).
    fn place_for_pointer(&mut self, ptr: &PointerValue) -> Result<Place, RuntimeError> {
        let addr = ptr
            .address
            .ok_or_else(|| RuntimeError::NilDereference("address-of a nil pointer".to_string()))?;
        match self.place_at(addr) {
            Some(place) => Ok(place),
            None => Ok(Place::Heap(addr)),
        }
    }

    fn pop_indices(&mut self, dims: usize) -> Result<Vec<i64>, RuntimeError> {
        let mut indices = Vec::with_capacity(dims);
        for _ in 0..dims {
            indices.push(self.pop()?.ordinal()?);
        }
        indices.reverse();
        Ok(indices)
    }

    fn read_array_init(&mut self) -> Result<Value, RuntimeError> {
        let dims = self.read_u8() as usize;
        let mut lower = Vec::with_capacity(dims);
        let mut upper = Vec::with_capacity(dims);
        for _ in 0..dims {
            let lo_idx = self.read_u16() as usize;
            let hi_idx = self.read_u16() as usize;
            lower.push(self.constant_int(lo_idx)?);
            upper.push(self.constant_int(hi_idx)?);
        }
        let elem_byte = self.read_u8();
        let _elem_type_name_idx = self.read_u16();
        let elem_type = var_type_from_wire_tag(elem_byte)
            .ok_or_else(|| RuntimeError::TypeMismatch(format!("unknown element type byte {elem_byte}")))?;
        let fill = builtins::default_value_for(elem_type);
        let arr = ArrayValue::new(lower, upper, elem_type, fill)?;
        Ok(Value::Array(Box::new(arr)))
    }

    fn binary_arith(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        use OpCode::*;
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match op {
            ADD => add_values(&a, &b)?,
            SUBTRACT => pvm_core::arithmetic::sub(&a, &b)?,
            MULTIPLY => pvm_core::arithmetic::mul(&a, &b)?,
            DIVIDE => pvm_core::arithmetic::div(&a, &b)?,
            INT_DIV => pvm_core::arithmetic::int_div(&a, &b)?,
            MOD => pvm_core::arithmetic::modulo(&a, &b)?,
            AND => pvm_core::arithmetic::and(&a, &b)?,
            OR => pvm_core::arithmetic::or(&a, &b)?,
            XOR => pvm_core::arithmetic::xor(&a, &b)?,
            SHL => pvm_core::arithmetic::shl(&a, &b)?,
            SHR => pvm_core::arithmetic::shr(&a, &b)?,
            _ => unreachable!("binary_arith called with non-arithmetic opcode"),
        };
        self.push(result)
    }

    fn compare_op(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        use OpCode::*;
        let b = self.pop()?;
        let a = self.pop()?;
        let result = if matches!(op, EQUAL | NOT_EQUAL) {
            let eq = a == b;
            if op == EQUAL {
                eq
            } else {
                !eq
            }
        } else {
            let ord = pvm_core::arithmetic::compare(&a, &b)?;
            use std::cmp::Ordering::*;
            match op {
                GREATER => ord == Greater,
                GREATER_EQUAL => ord != Less,
                LESS => ord == Less,
                LESS_EQUAL => ord != Greater,
                _ => unreachable!(),
            }
        };
        self.push(Value::Boolean(result))
    }

    /// `RETURN`/`EXIT` (spec §4.4 point 3). Returns `Ok(true)` when there
    /// was no enclosing frame (top-level return = halt).
    fn do_return(&mut self) -> Result<bool, RuntimeError> {
        let Some(frame) = self.frames.pop() else {
            return Ok(true);
        };
        let window_end = frame.stack_base + frame.slot_count;
        let result = if self.stack.len() > window_end {
            Some(self.pop()?)
        } else {
            None
        };
        self.stack.truncate(frame.stack_base);
        self.ip = frame.return_ip;
        if let Some(v) = result {
            if !frame.discard_result_on_return {
                self.push(v)?;
            }
        }
        Ok(false)
    }

    fn define_global(&mut self, name_width: u8) -> Result<(), RuntimeError> {
        let name_idx = if name_width == 1 { self.read_u8() as usize } else { self.read_u16() as usize };
        let declared_byte = self.read_u8();
        let declared = var_type_from_wire_tag(declared_byte)
            .ok_or_else(|| RuntimeError::TypeMismatch(format!("unknown declared type byte {declared_byte}")))?;
        let name = self.constant_string(name_idx)?;
        let value = match declared {
            VarType::Array => self.read_array_init()?,
            VarType::String => {
                let _type_name_idx = self.read_u16();
                let len_idx = self.read_u16() as usize;
                let max_len = self.constant_int(len_idx)? as usize;
                Value::String(SeqString::with_max_length("", max_len))
            }
            VarType::File => {
                let _type_name_idx = self.read_u16();
                let elem_byte = self.read_u8();
                let _elem_type_name_idx = self.read_u16();
                let elem_type = var_type_from_wire_tag(elem_byte).unwrap_or(VarType::Void);
                Value::File(Box::new(FileValue::closed(elem_type)))
            }
            other => {
                let _type_name_idx = self.read_u16();
                builtins::default_value_for(other)
            }
        };
        if !self.globals.globals.contains(&name) {
            self.globals.globals.insert(Symbol::new_global(name, declared, value));
        }
        Ok(())
    }

    fn get_global(&mut self, name_width: u8, cached: bool, call_site_offset: usize) -> Result<(), RuntimeError> {
        let name_idx = if name_width == 1 { self.read_u8() as usize } else { self.read_u16() as usize };
        self.skip_inline_cache_slot();
        let sym = if cached {
            resolve_global_cached(&mut self.chunk, call_site_offset, name_idx, &self.globals)?
        } else {
            resolve_global(&mut self.chunk, call_site_offset, name_idx, &self.globals)?
        };
        let value = sym.storage.as_ref().expect("global has storage").lock().expect("poisoned").clone();
        self.push(value)
    }

    fn set_global(&mut self, name_width: u8, cached: bool, call_site_offset: usize) -> Result<(), RuntimeError> {
        let name_idx = if name_width == 1 { self.read_u8() as usize } else { self.read_u16() as usize };
        self.skip_inline_cache_slot();
        let sym = if cached {
            resolve_global_cached(&mut self.chunk, call_site_offset, name_idx, &self.globals)?
        } else {
            resolve_global(&mut self.chunk, call_site_offset, name_idx, &self.globals)?
        };
        let value = self.pop()?;
        let mut guard = sym.storage.as_ref().expect("global has storage").lock().expect("poisoned");
        assign_into(&mut guard, value)
    }

    fn get_global_address(&mut self, name_width: u8) -> Result<(), RuntimeError> {
        let name_idx = if name_width == 1 { self.read_u8() as usize } else { self.read_u16() as usize };
        let name = self.constant_string(name_idx)?;
        let sym = self
            .globals
            .globals
            .get(&name)
            .or_else(|| self.globals.const_globals.get(&name))
            .ok_or_else(|| RuntimeError::TypeMismatch(format!("undefined global '{name}'")))?;
        let base_type = sym.declared_type;
        let addr = self.alloc_place(Place::Global(sym));
        self.push(Value::Pointer(PointerValue { address: Some(addr), base_type }))
    }

    fn resolve_callee(&self, addr: usize) -> Option<Arc<Symbol>> {
        self.procedure_by_address.get(&addr).cloned()
    }

    fn enter_call(&mut self, target: usize, symbol: Arc<Symbol>, discard_result: bool) -> Result<(), RuntimeError> {
        if self.frames.len() >= self.config.frame_cap {
            return Err(RuntimeError::Resource("call stack overflow".to_string()));
        }
        let arity = symbol.param_count as usize;
        if self.stack.len() < arity {
            return Err(RuntimeError::ArityMismatch {
                expected: arity,
                got: self.stack.len(),
                callee: symbol.name.clone(),
            });
        }
        let stack_base = self.stack.len() - arity;
        for _ in 0..symbol.locals_count {
            self.push(Value::Void)?;
        }
        let mut frame = CallFrame::new(self.ip, stack_base, symbol);
        frame.discard_result_on_return = discard_result;
        self.frames.push(frame);
        self.ip = target;
        Ok(())
    }

    fn do_call(&mut self) -> Result<(), RuntimeError> {
        let _name_idx = self.read_u16();
        let target = self.read_u16() as usize;
        let arity = self.read_u8() as usize;
        let symbol = self.resolve_callee(target).unwrap_or_else(|| {
            Arc::new(Symbol::new_procedure(format!("<anonymous@{target}>"), target, 0, arity as u8))
        });
        self.enter_call(target, symbol, false)
    }

    fn do_call_user_proc(&mut self) -> Result<(), RuntimeError> {
        let name_idx = self.read_u16() as usize;
        let _arity = self.read_u8();
        let name = self.constant_string(name_idx)?;
        let symbol = self
            .procedures
            .get(&name)
            .ok_or_else(|| RuntimeError::TypeMismatch(format!("undefined procedure '{name}'")))?;
        let target = symbol
            .bytecode_address
            .ok_or_else(|| RuntimeError::TypeMismatch(format!("'{name}' has no bytecode address")))?;
        self.enter_call(target, symbol, true)
    }

    fn do_call_indirect(&mut self, discard_result: bool) -> Result<(), RuntimeError> {
        let arity = self.read_u8() as usize;
        if self.stack.len() < arity + 1 {
            return Err(RuntimeError::Resource("operand stack underflow".to_string()));
        }
        let callee_index = self.stack.len() - arity - 1;
        let callee = self.stack.remove(callee_index);
        let closure = match callee {
            Value::Closure(c) => c,
            other => {
                return Err(RuntimeError::TypeMismatch(format!(
                    "CALL_INDIRECT target is {} not Closure",
                    other.var_type()
                )))
            }
        };
        let symbol = closure
            .defining_symbol
            .as_deref()
            .and_then(|name| self.procedures.get(name))
            .unwrap_or_else(|| Arc::new(Symbol::new_procedure("<closure>", closure.entry_offset, 0, arity as u8)));
        if self.frames.len() >= self.config.frame_cap {
            return Err(RuntimeError::Resource("call stack overflow".to_string()));
        }
        let stack_base = self.stack.len() - arity;
        for _ in 0..symbol.locals_count {
            self.push(Value::Void)?;
        }
        let upvalues = closure
            .env
            .as_ref()
            .map(|env| env.upvalues.clone())
            .unwrap_or_default();
        let mut frame = match &closure.env {
            Some(env) => CallFrame::with_closure(self.ip, stack_base, symbol, upvalues, env.clone()),
            None => CallFrame::new(self.ip, stack_base, symbol),
        };
        frame.discard_result_on_return = discard_result;
        self.frames.push(frame);
        self.ip = closure.entry_offset;
        Ok(())
    }

    /// `CALL_BUILTIN name_idx:u16, arity:u8` (function form, pushes a
    /// result) and `CALL_BUILTIN_PROC cached_id:u16, name_idx:u16,
    /// arity:u8` (procedure form, result discarded) share this helper.
    /// The procedure form carries an extra leading id slot since
    /// procedure calls (`WriteLn`, `Inc`, ...) dominate hot loops and
    /// benefit from skipping the by-name lookup on repeat visits; the
    /// lookup result is stable for the lifetime of a chunk, so `0xFFFF`
    /// marks "not yet resolved" and gets patched in place on first hit.
    fn do_call_builtin(&mut self, is_proc: bool) -> Result<(), RuntimeError> {
        let cache_slot_offset = if is_proc {
            let off = self.ip;
            let _cached = self.read_u16();
            Some(off)
        } else {
            None
        };
        let name_idx = self.read_u16() as usize;
        let arity = self.read_u8() as usize;
        let cached = cache_slot_offset.and_then(|off| {
            let hi = self.chunk.code[off];
            let lo = self.chunk.code[off + 1];
            let v = ((hi as u16) << 8) | lo as u16;
            if v == 0xFFFF {
                None
            } else {
                Some(v as usize)
            }
        });
        let id = match cached {
            Some(id) => id,
            None => {
                let lowered = self.chunk.get_builtin_lowercase_index(name_idx);
                let name = match lowered {
                    Some(lower_idx) => self.constant_string(lower_idx)?,
                    None => self.constant_string(name_idx)?,
                };
                let resolved = self
                    .builtins
                    .lookup_by_name(&name)
                    .ok_or_else(|| RuntimeError::HostMissing(format!("builtin '{name}'")))?;
                if let Some(off) = cache_slot_offset {
                    self.chunk.patch_short(off, resolved as u16);
                }
                resolved
            }
        };
        if self.stack.len() < arity {
            return Err(RuntimeError::Resource("operand stack underflow".to_string()));
        }
        let mut args: Vec<Value> = self.stack.split_off(self.stack.len() - arity);
        let entry_kind = self.builtins.get(id).map(|e| e.kind);
        let name_for_error = self
            .builtins
            .get(id)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| format!("builtin#{id}"));
        self.current_builtin_name = Some(name_for_error);
        let result = BuiltinRegistry::invoke(self, id, &mut args)?;
        self.current_builtin_name = None;
        if entry_kind != Some(BuiltinKind::Procedure) || !matches!(result, Value::Void) {
            if entry_kind == Some(BuiltinKind::Function) {
                self.push(result)?;
            }
        }
        Ok(())
    }

    fn do_call_method(&mut self) -> Result<(), RuntimeError> {
        let method_idx = self.read_u8() as usize;
        let arity = self.read_u8() as usize;
        if self.stack.len() < arity + 1 {
            return Err(RuntimeError::Resource("operand stack underflow".to_string()));
        }
        let receiver_index = self.stack.len() - arity - 1;
        let receiver = self.stack[receiver_index].clone();
        let class_name = match &receiver {
            Value::Record(r) => r
                .get_by_name("__class__")
                .ok()
                .map(|v| render_class_name(v))
                .ok_or_else(|| RuntimeError::TypeMismatch("CALL_METHOD receiver has no __class__ field".to_string()))?,
            other => {
                return Err(RuntimeError::TypeMismatch(format!(
                    "CALL_METHOD receiver is {} not Record",
                    other.var_type()
                )))
            }
        };
        let symbol = self
            .class_methods
            .get(&class_name)
            .and_then(|methods| methods.get(method_idx))
            .and_then(|m| m.clone())
            .ok_or_else(|| {
                RuntimeError::TypeMismatch(format!("no method #{method_idx} registered for class '{class_name}'"))
            })?;
        let target = symbol
            .bytecode_address
            .ok_or_else(|| RuntimeError::TypeMismatch(format!("'{}' has no bytecode address", symbol.name)))?;
        self.enter_call(target, symbol, true)
    }

    fn do_call_host(&mut self) -> Result<(), RuntimeError> {
        let index = self.read_u8() as usize;
        let id = HostFunctionId::from_index(index)
            .ok_or_else(|| RuntimeError::HostMissing(format!("host function id {index}")))?;
        let registry = Arc::clone(&self.host_registry);
        if !registry.is_registered(id) {
            return Err(RuntimeError::HostMissing(format!("{id:?}")));
        }
        // Registered functions are installed once at startup and never
        // removed, so re-fetching through the shared registry (rather
        // than `take`/`put_back`, which assumes unique ownership) is
        // safe here: `Arc<HostRegistry>` is read-only after `Vm::new`.
        let result = registry.call(id, self)?;
        self.push(result)
    }

    fn do_thread_create(&mut self) -> Result<(), RuntimeError> {
        let entry = self.read_u16() as usize;
        let mut sibling = self.spawn_sibling();
        sibling.ip = entry;
        let chunk_for_thread = self.chunk.clone();
        let globals_snapshot = self.globals.globals.clone();
        let const_globals_snapshot = self.globals.const_globals.clone();
        let procedures_snapshot = self.procedures.clone();
        let name = format!("pvm-worker-{entry}");
        let slot = self.concurrency.threads.spawn(name, move |thread_slot| {
            sibling.current_builtin_name = None;
            let result = sibling.interpret(
                chunk_for_thread,
                globals_snapshot,
                const_globals_snapshot,
                procedures_snapshot,
                entry as u16,
            );
            let status = result == InterpretResult::Ok;
            let value = sibling.stack.last().cloned();
            thread_slot.store_result(value, status);
        })?;
        self.push(Value::Integer(slot.id as i64))
    }

    fn do_thread_join(&mut self) -> Result<(), RuntimeError> {
        let id = self.pop()?.ordinal()? as usize;
        let slot = self
            .concurrency
            .threads
            .get(id)
            .ok_or_else(|| RuntimeError::Concurrency(format!("unknown thread id {id}")))?;
        slot.join();
        let (value, _status) = slot.take_result(true, true);
        self.push(value.unwrap_or(Value::Void))
    }
}

/// Coerce `new_value` into `slot`'s existing representation (spec §4.1:
/// numeric widening/narrowing on assignment; string truncation to the
/// slot's declared maximum length). Aggregates (Array/Record/Set/...)
/// are replaced outright, which is already a deep copy since `new_value`
/// is an owned, independently-cloned `Value`.
fn assign_into(slot: &mut Value, new_value: Value) -> Result<(), RuntimeError> {
    match slot {
        Value::String(dst) => match new_value {
            Value::String(src) => {
                dst.assign(src.as_str());
                Ok(())
            }
            Value::Char(c) => {
                dst.assign(&(c as char).to_string());
                Ok(())
            }
            other => Err(RuntimeError::TypeMismatch(format!(
                "cannot assign {} into a String slot",
                other.var_type()
            ))),
        },
        Value::Integer(_) | Value::Byte(_) | Value::Word(_) | Value::Cardinal(_) | Value::Real(_, _)
        | Value::Char(_) | Value::Boolean(_)
            if new_value.var_type().is_numeric() || matches!(new_value, Value::Boolean(_)) =>
        {
            *slot = coerce_numeric(slot.var_type(), &new_value)?;
            Ok(())
        }
        _ => {
            *slot = new_value;
            Ok(())
        }
    }
}

fn coerce_numeric(target: VarType, src: &Value) -> Result<Value, RuntimeError> {
    Ok(match target {
        VarType::Integer => Value::Integer(numeric_ordinal(src)?),
        VarType::Byte => {
            let n = numeric_ordinal(src)?;
            Value::Byte(u8::try_from(n).map_err(|_| RuntimeError::RangeCheck(format!("Byte overflow: {n}")))?)
        }
        VarType::Word => {
            let n = numeric_ordinal(src)?;
            Value::Word(u16::try_from(n).map_err(|_| RuntimeError::RangeCheck(format!("Word overflow: {n}")))?)
        }
        VarType::Cardinal => {
            let n = numeric_ordinal(src)?;
            Value::Cardinal(u32::try_from(n).map_err(|_| RuntimeError::RangeCheck(format!("Cardinal overflow: {n}")))?)
        }
        VarType::Real(k) => Value::Real(k, src.as_f64()?),
        VarType::Char => {
            let n = numeric_ordinal(src)?;
            Value::Char(u8::try_from(n).map_err(|_| RuntimeError::RangeCheck(format!("Char overflow: {n}")))?)
        }
        VarType::Boolean => Value::Boolean(src.is_truthy().unwrap_or(numeric_ordinal(src)? != 0)),
        _ => src.clone(),
    })
}

fn numeric_ordinal(v: &Value) -> Result<i64, RuntimeError> {
    match v {
        Value::Real(_, f) => Ok(*f as i64),
        other => Ok(other.ordinal()?),
    }
}

/// `+` (spec §4.1): string/char concatenation when either operand is
/// string-like, numeric addition otherwise.
fn add_values(a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(Value::String(x.concat(y))),
        (Value::String(x), Value::Char(c)) => {
            Ok(Value::String(x.concat(&SeqString::new((*c as char).to_string()))))
        }
        (Value::Char(c), Value::String(y)) => {
            Ok(Value::String(SeqString::new((*c as char).to_string()).concat(y)))
        }
        (Value::Char(c1), Value::Char(c2)) => {
            Ok(Value::String(SeqString::new(format!("{}{}", *c1 as char, *c2 as char))))
        }
        _ => Ok(pvm_core::arithmetic::add(a, b)?),
    }
}

fn render_class_name(v: &Value) -> String {
    match v {
        Value::String(s) => s.as_str().to_string(),
        other => format!("{other:?}"),
    }
}

/// `FORMAT_VALUE width, precision` (spec §4.6). `precision = -1` means
/// "unspecified" (no decimal truncation).
fn format_value(v: &Value, width: u8, precision: i8) -> String {
    let base = match v {
        Value::Integer(n) => n.to_string(),
        Value::Byte(n) => n.to_string(),
        Value::Word(n) => n.to_string(),
        Value::Cardinal(n) => n.to_string(),
        Value::Real(_, f) => {
            if precision >= 0 {
                format!("{:.*}", precision as usize, f)
            } else {
                format!("{f}")
            }
        }
        Value::String(s) => s.as_str().to_string(),
        Value::Char(c) => (*c as char).to_string(),
        Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        other => format!("{other:?}"),
    };
    if (width as usize) > base.len() {
        format!("{:>w$}", base, w = width as usize)
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::OpCode as OC;

    fn simple_chunk() -> BytecodeChunk {
        BytecodeChunk::new(VM_VERSION)
    }

    #[test]
    fn constant_folding_arithmetic_halts_with_expected_stack() {
        let mut chunk = simple_chunk();
        let one = chunk.add_constant(Value::Integer(2));
        let two = chunk.add_constant(Value::Integer(3));
        chunk.write_byte(OC::CONSTANT as u8, 1);
        chunk.write_byte(one as u8, 1);
        chunk.write_byte(OC::CONSTANT as u8, 1);
        chunk.write_byte(two as u8, 1);
        chunk.write_byte(OC::ADD as u8, 1);
        chunk.write_byte(OC::HALT as u8, 1);

        let mut vm = Vm::new(Config::default());
        let result = vm.interpret(chunk, HashTable::new(), HashTable::new(), HashTable::new(), 0);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(vm.stack.last(), Some(&Value::Integer(5)));
    }

    #[test]
    fn define_then_get_global_round_trips() {
        let mut chunk = simple_chunk();
        let name_idx = chunk.add_constant(Value::String(SeqString::new("counter")));
        chunk.write_byte(OC::DEFINE_GLOBAL as u8, 1);
        chunk.write_byte(name_idx as u8, 1);
        chunk.write_byte(crate::chunk::var_type_wire_tag(VarType::Integer), 1);
        chunk.emit_short(0, 1); // type name idx (unused)

        chunk.write_byte(OC::GET_GLOBAL as u8, 1);
        chunk.write_byte(name_idx as u8, 1);
        chunk.write_inline_cache_slot(1);
        chunk.write_byte(OC::HALT as u8, 1);

        let mut vm = Vm::new(Config::default());
        let result = vm.interpret(chunk, HashTable::new(), HashTable::new(), HashTable::new(), 0);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(vm.stack.last(), Some(&Value::Integer(0)));
    }

    #[test]
    fn call_builtin_proc_cache_survives_a_second_call() {
        // Regression test: `CALL_BUILTIN_PROC`'s call-site cache slot must
        // be read back from the same offset it was written to. Calls
        // `Inc(@counter)` twice through the cached procedure-call opcode
        // and checks the global reaches 2, proving the second call reuses
        // the id patched in by the first rather than misreading neighboring
        // bytes as a bogus cached id.
        let mut chunk = simple_chunk();
        let counter_name = chunk.add_constant(Value::String(SeqString::new("counter")));
        let inc_name = chunk.add_constant(Value::String(SeqString::new("inc")));

        chunk.write_byte(OC::DEFINE_GLOBAL as u8, 1);
        chunk.write_byte(counter_name as u8, 1);
        chunk.write_byte(crate::chunk::var_type_wire_tag(VarType::Integer), 1);
        chunk.emit_short(0, 1);

        for _ in 0..2 {
            chunk.write_byte(OC::GET_GLOBAL_ADDRESS as u8, 1);
            chunk.write_byte(counter_name as u8, 1);
            chunk.write_byte(OC::CALL_BUILTIN_PROC as u8, 1);
            chunk.emit_short(0xFFFF, 1); // call-site cache, unresolved
            chunk.emit_short(inc_name as u16, 1);
            chunk.write_byte(1, 1); // arity
        }
        chunk.write_byte(OC::HALT as u8, 1);

        let mut vm = Vm::new(Config::default());
        let result = vm.interpret(chunk, HashTable::new(), HashTable::new(), HashTable::new(), 0);
        assert_eq!(result, InterpretResult::Ok);
        let sym = vm.globals.globals.get("counter").unwrap();
        let value = sym.storage.as_ref().unwrap().lock().unwrap().clone();
        assert_eq!(value, Value::Integer(2));
    }

    #[test]
    fn stack_overflow_is_a_resource_error() {
        let mut chunk = simple_chunk();
        let zero = chunk.add_constant(Value::Integer(1));
        // Loop forever pushing constants, to overflow a tiny stack cap.
        chunk.write_byte(OC::CONSTANT as u8, 1);
        chunk.write_byte(zero as u8, 1);
        chunk.write_byte(OC::JUMP as u8, 1);
        chunk.emit_short((-3i16) as u16, 1);

        let mut config = Config::default();
        config.stack_cap = 4;
        let mut vm = Vm::new(config);
        let result = vm.interpret(chunk, HashTable::new(), HashTable::new(), HashTable::new(), 0);
        assert_eq!(result, InterpretResult::RuntimeError);
    }
}
