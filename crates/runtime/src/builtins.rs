//! Name-keyed builtin registry and the standard builtin library (spec
//! §4.5 part 2), as distinct from the fixed-ID host-function table in
//! `host.rs`.
//!
//! Grounded on `examples/original_source/src/backend_ast/builtin.c`'s
//! registration pattern (`registerBuiltinFunction("fibonacci", ...)`:
//! every builtin is looked up by lowercased name, and a handful also get
//! a canonical-cased alias for disassembly/diagnostics) and on the two
//! concrete builtins `fibonacci.c` and `vm_version.c` implement, which
//! are ported here close to verbatim.

use crate::error::{runtime_warning, RuntimeError};
use crate::vm::Vm;
use pvm_core::{arithmetic, FileValue, PointerValue, SeqString, Value, VarType};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufRead, Write as _};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    Procedure,
    Function,
}

/// A builtin handler. Receives the VM (for heap/file/IO-error access) and
/// its arguments, evaluated left to right. `VAR` parameters arrive as
/// `Value::Pointer`s the handler dereferences itself via
/// [`Vm::deref_pointer`]/[`Vm::assign_through_pointer`].
pub type BuiltinFn = Box<dyn Fn(&mut Vm, &mut [Value]) -> Result<Value, RuntimeError> + Send + Sync>;

pub struct BuiltinEntry {
    pub name: String,
    pub canonical_alias: Option<String>,
    pub kind: BuiltinKind,
    handler: BuiltinFn,
}

impl fmt::Debug for BuiltinEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinEntry")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Builtins are looked up by name (spec §4.5: "`CALL_BUILTIN name_idx,
/// arity` — the generic path, resolving `name_idx`'s lowercased alias
/// (or the name itself) against a sorted builtin table"). `builtin_id`
/// for the optimized `CALL_BUILTIN_PROC` path is just the entry's
/// registration-order index — stable for the registry's lifetime, since
/// nothing is ever removed after startup.
#[derive(Default)]
pub struct BuiltinRegistry {
    entries: Vec<BuiltinEntry>,
    sorted: Vec<usize>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        kind: BuiltinKind,
        canonical_alias: Option<&str>,
        handler: BuiltinFn,
    ) -> usize {
        let id = self.entries.len();
        let lowered = name.to_ascii_lowercase();
        let pos = self
            .sorted
            .partition_point(|&i| self.entries[i].name.as_str() < lowered.as_str());
        self.entries.push(BuiltinEntry {
            name: lowered,
            canonical_alias: canonical_alias.map(str::to_string),
            kind,
            handler,
        });
        self.sorted.insert(pos, id);
        id
    }

    /// Resolve by name. Tries the lowercased form first (the normal
    /// path — spec §9 Open Question: `getBuiltinLowercaseIndex` is
    /// `Option<usize>`, populated only by explicit call), then falls
    /// back to an exact case-sensitive match so a constant with no
    /// lowercase alias still resolves if it happens to already be
    /// lowercase or to collide with a registered name verbatim.
    pub fn lookup_by_name(&self, name: &str) -> Option<usize> {
        let lowered = name.to_ascii_lowercase();
        self.sorted
            .binary_search_by(|&i| self.entries[i].name.as_str().cmp(lowered.as_str()))
            .ok()
            .map(|pos| self.sorted[pos])
            .or_else(|| self.entries.iter().position(|e| e.name == name))
    }

    pub fn get(&self, id: usize) -> Option<&BuiltinEntry> {
        self.entries.get(id)
    }

    pub fn invoke(vm: &mut Vm, id: usize, args: &mut [Value]) -> Result<Value, RuntimeError> {
        let registry = vm.builtins.clone();
        let entry = registry
            .entries
            .get(id)
            .ok_or_else(|| RuntimeError::HostMissing(format!("builtin id {id}")))?;
        (entry.handler)(vm, args)
    }
}

/// Original VM bytecode format version this crate implements (spec §6.4,
/// `examples/original_source/src/core/version.h`'s `PSCAL_VM_VERSION`).
pub const VM_VERSION: i64 = 9;

fn want_pointer(args: &[Value], index: usize, who: &str) -> Result<PointerValue, RuntimeError> {
    match args.get(index) {
        Some(Value::Pointer(p)) => Ok(*p),
        Some(other) => Err(RuntimeError::TypeMismatch(format!(
            "{who} expects a VAR reference for argument {index}, got {}",
            other.var_type()
        ))),
        None => Err(RuntimeError::ArityMismatch {
            expected: index + 1,
            got: args.len(),
            callee: who.to_string(),
        }),
    }
}

/// `Fibonacci(n)`: O(log n) matrix-power algorithm, ported from
/// `examples/original_source/src/ext_builtins/math/fibonacci.c`.
fn matrix_mul(a: [[i64; 2]; 2], b: [[i64; 2]; 2]) -> [[i64; 2]; 2] {
    [
        [
            a[0][0] * b[0][0] + a[0][1] * b[1][0],
            a[0][0] * b[0][1] + a[0][1] * b[1][1],
        ],
        [
            a[1][0] * b[0][0] + a[1][1] * b[1][0],
            a[1][0] * b[0][1] + a[1][1] * b[1][1],
        ],
    ]
}

fn matrix_pow(m: [[i64; 2]; 2], n: i64) -> [[i64; 2]; 2] {
    if n == 1 {
        return m;
    }
    let half = matrix_pow(m, n / 2);
    let squared = matrix_mul(half, half);
    if n % 2 == 0 {
        squared
    } else {
        matrix_mul(squared, m)
    }
}

fn fibonacci(n: i64) -> i64 {
    if n == 0 {
        return 0;
    }
    let f = matrix_pow([[1, 1], [1, 0]], n - 1);
    f[0][0]
}

fn builtin_fibonacci(_vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::ArityMismatch {
            expected: 1,
            got: args.len(),
            callee: "Fibonacci".to_string(),
        });
    }
    let n = args[0].ordinal().map_err(RuntimeError::from)?;
    if n < 0 {
        return Err(RuntimeError::RangeCheck("Fibonacci argument must be non-negative".into()));
    }
    Ok(Value::Integer(fibonacci(n)))
}

/// `VMVersion()`/`BytecodeVersion()`, ported from
/// `examples/original_source/src/ext_builtins/system/vm_version.c`.
fn builtin_vm_version(_vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    if !args.is_empty() {
        return Err(RuntimeError::ArityMismatch {
            expected: 0,
            got: args.len(),
            callee: "VMVersion".to_string(),
        });
    }
    Ok(Value::Integer(VM_VERSION))
}

fn builtin_bytecode_version(vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    if !args.is_empty() {
        return Err(RuntimeError::ArityMismatch {
            expected: 0,
            got: args.len(),
            callee: "BytecodeVersion".to_string(),
        });
    }
    Ok(Value::Integer(vm.chunk.version as i64))
}

fn builtin_inc(vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    let ptr = want_pointer(args, 0, "Inc")?;
    let by = match args.get(1) {
        Some(v) => v.ordinal().map_err(RuntimeError::from)?,
        None => 1,
    };
    let current = vm.deref_pointer(&ptr)?;
    let (updated, wrapped) = arithmetic::inc(&current, by)?;
    if wrapped {
        let line = vm.current_line();
        runtime_warning(line, &format!("{} overflowed and wrapped", updated.var_type()));
    }
    vm.assign_through_pointer(&ptr, updated)?;
    Ok(Value::Void)
}

fn builtin_dec(vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    let ptr = want_pointer(args, 0, "Dec")?;
    let by = match args.get(1) {
        Some(v) => v.ordinal().map_err(RuntimeError::from)?,
        None => 1,
    };
    let current = vm.deref_pointer(&ptr)?;
    let (updated, wrapped) = arithmetic::dec(&current, by)?;
    if wrapped {
        let line = vm.current_line();
        runtime_warning(line, &format!("{} overflowed and wrapped", updated.var_type()));
    }
    vm.assign_through_pointer(&ptr, updated)?;
    Ok(Value::Void)
}

fn builtin_succ(_vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    let v = args.first().ok_or_else(|| RuntimeError::ArityMismatch {
        expected: 1,
        got: 0,
        callee: "Succ".to_string(),
    })?;
    Ok(arithmetic::succ(v)?)
}

fn builtin_pred(_vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    let v = args.first().ok_or_else(|| RuntimeError::ArityMismatch {
        expected: 1,
        got: 0,
        callee: "Pred".to_string(),
    })?;
    Ok(arithmetic::pred(v)?)
}

/// `New(var p)`: allocate a heap slot of `p`'s declared base type and
/// point `p` at it (spec §3.4, §9 pointer-arena redesign).
fn builtin_new(vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    let ptr = want_pointer(args, 0, "New")?;
    let initial = default_value_for(ptr.base_type);
    let allocated = vm.heap.allocate(ptr.base_type, initial);
    vm.assign_through_pointer(&ptr, Value::Pointer(allocated))?;
    Ok(Value::Void)
}

/// `Dispose(var p)`: free the slot `p` addresses and nil every other
/// pointer aliasing it (spec §3.4 "nullify aliases" protocol).
fn builtin_dispose(vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    let ptr = want_pointer(args, 0, "Dispose")?;
    if let Some(addr) = ptr.address {
        vm.heap.dispose(addr);
        vm.nullify_aliases(addr);
        vm.assign_through_pointer(&ptr, Value::Pointer(PointerValue::nil(ptr.base_type)))?;
    }
    Ok(Value::Void)
}

fn builtin_assign(vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    let ptr = want_pointer(args, 0, "Assign")?;
    let filename = match args.get(1) {
        Some(Value::String(s)) => s.as_str().to_string(),
        _ => return Err(RuntimeError::TypeMismatch("Assign expects a filename string".into())),
    };
    let mut file = vm.deref_pointer(&ptr)?;
    match &mut file {
        Value::File(f) => f.assign(filename),
        _ => return Err(RuntimeError::TypeMismatch("Assign target is not a File".into())),
    }
    vm.assign_through_pointer(&ptr, file)?;
    Ok(Value::Void)
}

fn open_file(vm: &mut Vm, args: &[Value], who: &str, write: bool) -> Result<Value, RuntimeError> {
    let ptr = want_pointer(args, 0, who)?;
    let file = vm.deref_pointer(&ptr)?;
    let filename = match &file {
        Value::File(f) => f.filename.clone().ok_or_else(|| {
            RuntimeError::Io(format!("{who}: file variable has no filename (call Assign first)"))
        })?,
        _ => return Err(RuntimeError::TypeMismatch(format!("{who} target is not a File"))),
    };
    let opened = if write {
        OpenOptions::new().write(true).create(true).truncate(true).open(&filename)
    } else {
        OpenOptions::new().read(true).open(&filename)
    };
    match opened {
        Ok(handle) => {
            if let Value::File(f) = &file {
                f.open(handle);
            }
            vm.last_io_error = 0;
        }
        Err(e) => {
            vm.last_io_error = e.raw_os_error().unwrap_or(1);
        }
    }
    vm.assign_through_pointer(&ptr, file)?;
    Ok(Value::Void)
}

fn builtin_reset(vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    open_file(vm, args, "Reset", false)
}

fn builtin_rewrite(vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    open_file(vm, args, "Rewrite", true)
}

fn builtin_close(vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    let ptr = want_pointer(args, 0, "Close")?;
    let file = vm.deref_pointer(&ptr)?;
    match &file {
        Value::File(f) => f.close(),
        _ => return Err(RuntimeError::TypeMismatch("Close target is not a File".into())),
    }
    Ok(Value::Void)
}

/// `IOResult()`: read-and-reset the per-VM last I/O error (spec §7, and
/// `executeBuiltinIOResult` in `builtin.c`).
fn builtin_io_result(vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    if !args.is_empty() {
        return Err(RuntimeError::ArityMismatch {
            expected: 0,
            got: args.len(),
            callee: "IOResult".to_string(),
        });
    }
    let err = vm.last_io_error;
    vm.last_io_error = 0;
    Ok(Value::Integer(err as i64))
}

/// `ReadLn(var a, var b, ...)`: read one line from stdin, split on
/// whitespace, coerce each token into the corresponding VAR argument's
/// current declared type. Spec §9 Open Question: a `Nil`-typed target
/// raises `TypeMismatch` rather than silently coercing to an empty
/// string.
fn builtin_readln(vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    let mut line = String::new();
    let read = std::io::stdin().lock().read_line(&mut line);
    if let Err(e) = read {
        vm.last_io_error = e.raw_os_error().unwrap_or(1);
        return Ok(Value::Void);
    }
    let tokens: Vec<&str> = line.split_whitespace().collect();
    for (i, arg) in args.iter().enumerate() {
        let ptr = match arg {
            Value::Pointer(p) => *p,
            other => {
                return Err(RuntimeError::TypeMismatch(format!(
                    "ReadLn expects a VAR reference for argument {i}, got {}",
                    other.var_type()
                )))
            }
        };
        let current = vm.deref_pointer(&ptr)?;
        let token = tokens.get(i).copied().unwrap_or("");
        let parsed = match current.var_type() {
            VarType::Nil => {
                return Err(RuntimeError::TypeMismatch(
                    "ReadLn target has declared type Nil".to_string(),
                ))
            }
            VarType::Integer => Value::Integer(token.parse().unwrap_or(0)),
            VarType::Real(k) => Value::Real(k, token.parse().unwrap_or(0.0)),
            VarType::String => {
                let mut s = match current {
                    Value::String(s) => s,
                    _ => SeqString::new(""),
                };
                s.assign(token);
                Value::String(s)
            }
            VarType::Char => Value::Char(token.bytes().next().unwrap_or(0)),
            _ => current,
        };
        vm.assign_through_pointer(&ptr, parsed)?;
    }
    vm.last_io_error = 0;
    Ok(Value::Void)
}

fn render(value: &Value) -> String {
    match value {
        Value::Integer(n) => n.to_string(),
        Value::Byte(n) => n.to_string(),
        Value::Word(n) => n.to_string(),
        Value::Cardinal(n) => n.to_string(),
        Value::Real(_, f) => format!("{f}"),
        Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Char(c) => (*c as char).to_string(),
        Value::String(s) => s.as_str().to_string(),
        Value::Nil => "nil".to_string(),
        other => format!("{other:?}"),
    }
}

/// `Write(args...)`/`WriteLn(args...)`: format and print to stdout. Real
/// programs route this through `CALL_HOST Printf` instead (spec §4.5
/// part 1), but these builtins exist for parity with the original's
/// `write`/`writeln` and for frontends that haven't wired a host printf.
fn builtin_write(_vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    let mut out = std::io::stdout().lock();
    for arg in args.iter() {
        let _ = write!(out, "{}", render(arg));
    }
    Ok(Value::Void)
}

fn builtin_writeln(_vm: &mut Vm, args: &mut [Value]) -> Result<Value, RuntimeError> {
    let mut out = std::io::stdout().lock();
    for arg in args.iter() {
        let _ = write!(out, "{}", render(arg));
    }
    let _ = writeln!(out);
    Ok(Value::Void)
}

pub(crate) fn default_value_for(vt: VarType) -> Value {
    match vt {
        VarType::Integer => Value::Integer(0),
        VarType::Byte => Value::Byte(0),
        VarType::Word => Value::Word(0),
        VarType::Cardinal => Value::Cardinal(0),
        VarType::Real(k) => Value::Real(k, 0.0),
        VarType::Boolean => Value::Boolean(false),
        VarType::Char => Value::Char(0),
        VarType::String => Value::String(SeqString::new("")),
        VarType::Set => Value::Set(pvm_core::SetValue::new(0, -1)),
        VarType::Record => Value::Record(Box::new(pvm_core::RecordValue::new(Vec::new()))),
        VarType::MemoryStream => Value::MemoryStream(Vec::new()),
        VarType::File => Value::File(Box::new(FileValue::closed(VarType::Void))),
        VarType::Pointer => Value::Pointer(PointerValue::nil(VarType::Void)),
        VarType::Array => Value::Array(Box::new(
            pvm_core::ArrayValue::new(vec![0], vec![0], VarType::Integer, Value::Integer(0))
                .expect("1-element default array is always valid"),
        )),
        VarType::Enum | VarType::Closure | VarType::Nil | VarType::Void => Value::Nil,
    }
}

/// Install every standard builtin (spec §4.5 part 2). Called once from
/// `Vm::new`.
pub fn install_standard_library(registry: &mut BuiltinRegistry) {
    registry.register("inc", BuiltinKind::Procedure, Some("Inc"), Box::new(builtin_inc));
    registry.register("dec", BuiltinKind::Procedure, Some("Dec"), Box::new(builtin_dec));
    registry.register("succ", BuiltinKind::Function, Some("Succ"), Box::new(builtin_succ));
    registry.register("pred", BuiltinKind::Function, Some("Pred"), Box::new(builtin_pred));
    registry.register("new", BuiltinKind::Procedure, Some("New"), Box::new(builtin_new));
    registry.register("dispose", BuiltinKind::Procedure, Some("Dispose"), Box::new(builtin_dispose));
    registry.register("assign", BuiltinKind::Procedure, Some("Assign"), Box::new(builtin_assign));
    registry.register("reset", BuiltinKind::Procedure, Some("Reset"), Box::new(builtin_reset));
    registry.register("rewrite", BuiltinKind::Procedure, Some("Rewrite"), Box::new(builtin_rewrite));
    registry.register("close", BuiltinKind::Procedure, Some("Close"), Box::new(builtin_close));
    registry.register("ioresult", BuiltinKind::Function, Some("IOResult"), Box::new(builtin_io_result));
    registry.register("readln", BuiltinKind::Procedure, Some("ReadLn"), Box::new(builtin_readln));
    registry.register("write", BuiltinKind::Procedure, Some("Write"), Box::new(builtin_write));
    registry.register("writeln", BuiltinKind::Procedure, Some("WriteLn"), Box::new(builtin_writeln));
    registry.register(
        "fibonacci",
        BuiltinKind::Function,
        Some("Fibonacci"),
        Box::new(builtin_fibonacci),
    );
    registry.register(
        "vmversion",
        BuiltinKind::Function,
        Some("VMVersion"),
        Box::new(builtin_vm_version),
    );
    registry.register(
        "bytecodeversion",
        BuiltinKind::Function,
        Some("BytecodeVersion"),
        Box::new(builtin_bytecode_version),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fibonacci_matches_known_values() {
        assert_eq!(fibonacci(0), 0);
        assert_eq!(fibonacci(1), 1);
        assert_eq!(fibonacci(10), 55);
        assert_eq!(fibonacci(20), 6765);
    }

    #[test]
    fn registry_resolves_by_lowercase_name() {
        let mut registry = BuiltinRegistry::new();
        install_standard_library(&mut registry);
        let id = registry.lookup_by_name("FIBONACCI").unwrap();
        assert_eq!(registry.get(id).unwrap().canonical_alias.as_deref(), Some("Fibonacci"));
    }

    #[test]
    fn registry_lookup_is_sorted_and_binary_searchable() {
        let mut registry = BuiltinRegistry::new();
        install_standard_library(&mut registry);
        assert!(registry.lookup_by_name("dec").is_some());
        assert!(registry.lookup_by_name("nonexistent").is_none());
    }
}
