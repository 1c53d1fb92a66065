//! End-to-end scenarios driving the VM the way a real frontend would:
//! hand-assembled chunks in, `interpret`, checked results out.

use pvm_core::{HashTable, SeqString, Symbol, Value, VarType};
use pvm_runtime::chunk::var_type_wire_tag;
use pvm_runtime::{BytecodeChunk, Config, InterpretResult, OpCode as OC, Vm, VM_VERSION};

fn empty_chunk() -> BytecodeChunk {
    BytecodeChunk::new(VM_VERSION)
}

fn run(chunk: BytecodeChunk) -> (InterpretResult, Vm) {
    let mut vm = Vm::new(Config::default());
    let result = vm.interpret(chunk, HashTable::new(), HashTable::new(), HashTable::new(), 0);
    (result, vm)
}

#[test]
fn fibonacci_via_matrix_power_builtin() {
    let mut chunk = empty_chunk();
    let arg = chunk.add_constant(Value::Integer(10));
    let name = chunk.add_constant(Value::String(SeqString::new("fibonacci")));
    chunk.write_byte(OC::CONSTANT as u8, 1);
    chunk.write_byte(arg as u8, 1);
    chunk.write_byte(OC::CALL_BUILTIN as u8, 1);
    chunk.emit_short(name as u16, 1);
    chunk.write_byte(1, 1);
    chunk.write_byte(OC::HALT as u8, 1);

    let (result, vm) = run(chunk);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(vm.peek_top(), Some(&Value::Integer(55)));
}

#[test]
fn string_concatenation_and_format_value() {
    let mut chunk = empty_chunk();
    let hello = chunk.add_constant(Value::String(SeqString::new("Hello, ")));
    let world = chunk.add_constant(Value::String(SeqString::new("world")));
    chunk.write_byte(OC::CONSTANT as u8, 1);
    chunk.write_byte(hello as u8, 1);
    chunk.write_byte(OC::CONSTANT as u8, 1);
    chunk.write_byte(world as u8, 1);
    chunk.write_byte(OC::ADD as u8, 1);
    chunk.write_byte(OC::FORMAT_VALUE as u8, 1);
    chunk.write_byte(0, 1); // width 0
    chunk.write_byte(0xFF, 1); // precision -1 (no truncation)
    chunk.write_byte(OC::HALT as u8, 1);

    let (result, vm) = run(chunk);
    assert_eq!(result, InterpretResult::Ok);
    match vm.peek_top() {
        Some(Value::String(s)) => assert_eq!(s.as_str(), "Hello, world"),
        other => panic!("expected a formatted string, got {other:?}"),
    }
}

/// Four worker threads each `Inc` a shared global counter under a mutex
/// (spec §5: "a mutex guards the shared counter; every increment is
/// serialized"). The main routine defines the global and the mutex,
/// spawns four sibling VMs at the worker subroutine's offset, joins all
/// four, and checks the counter reached 4 exactly once each.
#[test]
fn four_worker_mutex_guarded_counter_reaches_four() {
    let mut chunk = empty_chunk();
    let counter_name = chunk.add_constant(Value::String(SeqString::new("counter")));
    let mutex_name = chunk.add_constant(Value::String(SeqString::new("mtxid")));
    let inc_name = chunk.add_constant(Value::String(SeqString::new("inc")));

    // --- main routine (offset 0) ---
    chunk.write_byte(OC::DEFINE_GLOBAL as u8, 1);
    chunk.write_byte(counter_name as u8, 1);
    chunk.write_byte(var_type_wire_tag(VarType::Integer), 1);
    chunk.emit_short(0, 1);

    chunk.write_byte(OC::DEFINE_GLOBAL as u8, 1);
    chunk.write_byte(mutex_name as u8, 1);
    chunk.write_byte(var_type_wire_tag(VarType::Integer), 1);
    chunk.emit_short(0, 1);

    chunk.write_byte(OC::MUTEX_CREATE as u8, 1);
    chunk.write_byte(OC::SET_GLOBAL as u8, 1);
    chunk.write_byte(mutex_name as u8, 1);
    chunk.write_inline_cache_slot(1);

    // Placeholder THREAD_CREATE operands, patched once the worker
    // offset is known below.
    let mut thread_create_operand_offsets = Vec::new();
    for _ in 0..4 {
        chunk.write_byte(OC::THREAD_CREATE as u8, 1);
        thread_create_operand_offsets.push(chunk.code.len());
        chunk.emit_short(0, 1);
    }
    for _ in 0..4 {
        chunk.write_byte(OC::THREAD_JOIN as u8, 1);
        chunk.write_byte(OC::POP as u8, 1);
    }
    chunk.write_byte(OC::GET_GLOBAL as u8, 1);
    chunk.write_byte(counter_name as u8, 1);
    chunk.write_inline_cache_slot(1);
    chunk.write_byte(OC::HALT as u8, 1);

    // --- worker subroutine ---
    let worker_offset = chunk.code.len() as u16;
    chunk.write_byte(OC::GET_GLOBAL as u8, 1);
    chunk.write_byte(mutex_name as u8, 1);
    chunk.write_inline_cache_slot(1);
    chunk.write_byte(OC::MUTEX_LOCK as u8, 1);

    chunk.write_byte(OC::GET_GLOBAL_ADDRESS as u8, 1);
    chunk.write_byte(counter_name as u8, 1);
    chunk.write_byte(OC::CALL_BUILTIN_PROC as u8, 1);
    chunk.emit_short(0xFFFF, 1);
    chunk.emit_short(inc_name as u16, 1);
    chunk.write_byte(1, 1);

    chunk.write_byte(OC::GET_GLOBAL as u8, 1);
    chunk.write_byte(mutex_name as u8, 1);
    chunk.write_inline_cache_slot(1);
    chunk.write_byte(OC::MUTEX_UNLOCK as u8, 1);
    chunk.write_byte(OC::HALT as u8, 1);

    for offset in thread_create_operand_offsets {
        chunk.patch_short(offset, worker_offset);
    }

    let (result, vm) = run(chunk);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(vm.peek_top(), Some(&Value::Integer(4)));
}

/// `Assign`+`Reset` on a path guaranteed not to exist reports a nonzero
/// `IOResult`; the same on a real file reports zero, and a second
/// `IOResult` call (clearing the slot) reads back to zero again.
#[test]
fn io_result_reports_missing_then_present_file() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist.txt");
    let present = dir.path().join("present.txt");
    std::fs::write(&present, b"hello").unwrap();

    let mut chunk = empty_chunk();
    let file_name = chunk.add_constant(Value::String(SeqString::new("f")));
    let assign_name = chunk.add_constant(Value::String(SeqString::new("assign")));
    let reset_name = chunk.add_constant(Value::String(SeqString::new("reset")));
    let ioresult_name = chunk.add_constant(Value::String(SeqString::new("ioresult")));
    let missing_path = chunk.add_constant(Value::String(SeqString::new(missing.display().to_string())));
    let present_path = chunk.add_constant(Value::String(SeqString::new(present.display().to_string())));

    chunk.write_byte(OC::DEFINE_GLOBAL as u8, 1);
    chunk.write_byte(file_name as u8, 1);
    chunk.write_byte(var_type_wire_tag(VarType::File), 1);
    chunk.emit_short(0, 1); // type name idx (unused)
    chunk.write_byte(var_type_wire_tag(VarType::Char), 1); // elem type
    chunk.emit_short(0, 1); // elem type name idx (unused)

    // Assign+Reset the missing path, then IOResult (expect nonzero).
    chunk.write_byte(OC::GET_GLOBAL_ADDRESS as u8, 1);
    chunk.write_byte(file_name as u8, 1);
    chunk.write_byte(OC::CONSTANT as u8, 1);
    chunk.write_byte(missing_path as u8, 1);
    chunk.write_byte(OC::CALL_BUILTIN_PROC as u8, 1);
    chunk.emit_short(0xFFFF, 1);
    chunk.emit_short(assign_name as u16, 1);
    chunk.write_byte(2, 1);

    chunk.write_byte(OC::GET_GLOBAL_ADDRESS as u8, 1);
    chunk.write_byte(file_name as u8, 1);
    chunk.write_byte(OC::CALL_BUILTIN_PROC as u8, 1);
    chunk.emit_short(0xFFFF, 1);
    chunk.emit_short(reset_name as u16, 1);
    chunk.write_byte(1, 1);

    chunk.write_byte(OC::CALL_BUILTIN as u8, 1);
    chunk.emit_short(ioresult_name as u16, 1);
    chunk.write_byte(0, 1);

    // Assign+Reset the present path, then IOResult again (expect zero).
    chunk.write_byte(OC::GET_GLOBAL_ADDRESS as u8, 1);
    chunk.write_byte(file_name as u8, 1);
    chunk.write_byte(OC::CONSTANT as u8, 1);
    chunk.write_byte(present_path as u8, 1);
    chunk.write_byte(OC::CALL_BUILTIN_PROC as u8, 1);
    chunk.emit_short(0xFFFF, 1);
    chunk.emit_short(assign_name as u16, 1);
    chunk.write_byte(2, 1);

    chunk.write_byte(OC::GET_GLOBAL_ADDRESS as u8, 1);
    chunk.write_byte(file_name as u8, 1);
    chunk.write_byte(OC::CALL_BUILTIN_PROC as u8, 1);
    chunk.emit_short(0xFFFF, 1);
    chunk.emit_short(reset_name as u16, 1);
    chunk.write_byte(1, 1);

    chunk.write_byte(OC::CALL_BUILTIN as u8, 1);
    chunk.emit_short(ioresult_name as u16, 1);
    chunk.write_byte(0, 1);

    chunk.write_byte(OC::HALT as u8, 1);

    let (result, vm) = run(chunk);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(vm.stack_len(), 2);
    match vm.peek(1) {
        Some(Value::Integer(n)) => assert_ne!(*n, 0, "missing-file Reset should report a nonzero IOResult"),
        other => panic!("expected an Integer, got {other:?}"),
    }
    assert_eq!(vm.peek(0), Some(&Value::Integer(0)));
}

/// Resolving a global through `GET_GLOBAL` primes both the call-site
/// and chunk-level caches; a fresh `interpret` call on a rebuilt globals
/// table observes the new value rather than a stale cached pointer,
/// since `interpret` installs a brand new `GlobalTables` each time.
#[test]
fn inline_cache_resolves_fresh_globals_on_each_interpret_call() {
    let mut chunk = empty_chunk();
    let name_idx = chunk.add_constant(Value::String(SeqString::new("x")));
    chunk.write_byte(OC::DEFINE_GLOBAL as u8, 1);
    chunk.write_byte(name_idx as u8, 1);
    chunk.write_byte(var_type_wire_tag(VarType::Integer), 1);
    chunk.emit_short(0, 1);
    chunk.write_byte(OC::GET_GLOBAL as u8, 1);
    chunk.write_byte(name_idx as u8, 1);
    chunk.write_inline_cache_slot(1);
    chunk.write_byte(OC::HALT as u8, 1);

    let mut vm = Vm::new(Config::default());
    let first = vm.interpret(
        chunk.clone(),
        HashTable::new(),
        HashTable::new(),
        HashTable::new(),
        0,
    );
    assert_eq!(first, InterpretResult::Ok);
    assert_eq!(vm.peek_top(), Some(&Value::Integer(0)));

    // A fresh globals table, pre-seeded with a non-default value: since
    // `DEFINE_GLOBAL` only inserts when the name isn't already present,
    // this value survives untouched, proving the second `interpret`
    // call re-resolved the symbol rather than reusing the first run's
    // cached pointer.
    let mut preset_globals = HashTable::new();
    preset_globals.insert(Symbol::new_global("x", VarType::Integer, Value::Integer(99)));
    let second = vm.interpret(chunk, preset_globals, HashTable::new(), HashTable::new(), 0);
    assert_eq!(second, InterpretResult::Ok);
    assert_eq!(vm.peek_top(), Some(&Value::Integer(99)));
}

/// Two globals both point at the same heap-allocated record; disposing
/// through one nullifies the other as well (spec §9 REDESIGN FLAGS: the
/// VM walks globals/stack to nil any pointer matching the disposed
/// address, rather than requiring a generation counter).
#[test]
fn dispose_nullifies_every_alias() {
    let mut vm = Vm::new(Config::default());
    let allocated = vm.heap.allocate(VarType::Integer, Value::Integer(7));

    vm.globals.globals.insert(Symbol::new_global(
        "a",
        VarType::Pointer,
        Value::Pointer(allocated),
    ));
    vm.globals.globals.insert(Symbol::new_global(
        "b",
        VarType::Pointer,
        Value::Pointer(allocated),
    ));

    let disposed_addr = allocated.address.unwrap();
    vm.heap.dispose(disposed_addr);
    vm.nullify_aliases(disposed_addr);

    for name in ["a", "b"] {
        let sym = vm.globals.globals.get(name).unwrap();
        let value = sym.storage.as_ref().unwrap().lock().unwrap().clone();
        match value {
            Value::Pointer(p) => assert!(p.is_nil(), "{name} should have been nilled"),
            other => panic!("expected a Pointer, got {other:?}"),
        }
    }
}
