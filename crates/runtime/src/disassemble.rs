//! Disassembler (spec §4.2): one human-readable line per instruction,
//! for debugging and bytecode-cache verification. Grounded on
//! `examples/original_source/src/compiler/bytecode.c`'s
//! `disassembleInstruction`.

use crate::chunk::{BytecodeChunk, OpCode};
use std::fmt::Write as _;

fn read_u16(code: &[u8], at: usize) -> u16 {
    (u16::from(code[at]) << 8) | u16::from(code[at + 1])
}

fn read_u32(code: &[u8], at: usize) -> u32 {
    (u32::from(code[at]) << 24)
        | (u32::from(code[at + 1]) << 16)
        | (u32::from(code[at + 2]) << 8)
        | u32::from(code[at + 3])
}

/// Disassemble the instruction at `offset`, returning the formatted line
/// and the offset of the next instruction.
pub fn disassemble_instruction(chunk: &BytecodeChunk, offset: usize) -> (String, usize) {
    let len = chunk.get_instruction_length(offset);
    let line = chunk.lines.get(offset).copied().unwrap_or(-1);
    let mut out = format!("{offset:04} {line:4} ");

    let Some(op) = OpCode::from_u8(chunk.code[offset]) else {
        write!(out, "UNKNOWN({:#04x})", chunk.code[offset]).unwrap();
        return (out, offset + len);
    };

    match op {
        OpCode::CONSTANT => {
            let idx = chunk.code[offset + 1] as usize;
            write!(out, "{:<24} {idx:4} '{:?}'", op.mnemonic(), chunk.constants.get(idx)).unwrap();
        }
        OpCode::CONSTANT16 => {
            let idx = read_u16(&chunk.code, offset + 1) as usize;
            write!(out, "{:<24} {idx:4} '{:?}'", op.mnemonic(), chunk.constants.get(idx)).unwrap();
        }
        OpCode::GET_GLOBAL | OpCode::SET_GLOBAL | OpCode::GET_GLOBAL_CACHED
        | OpCode::SET_GLOBAL_CACHED => {
            let idx = chunk.code[offset + 1] as usize;
            let cached = chunk.cached_symbol_at(offset).is_some();
            write!(
                out,
                "{:<24} {idx:4}  ic={}",
                op.mnemonic(),
                if cached { "primed" } else { "empty" }
            )
            .unwrap();
        }
        OpCode::GET_GLOBAL16 | OpCode::SET_GLOBAL16 | OpCode::GET_GLOBAL16_CACHED
        | OpCode::SET_GLOBAL16_CACHED => {
            let idx = read_u16(&chunk.code, offset + 1) as usize;
            let cached = chunk.cached_symbol_at(offset).is_some();
            write!(
                out,
                "{:<24} {idx:4}  ic={}",
                op.mnemonic(),
                if cached { "primed" } else { "empty" }
            )
            .unwrap();
        }
        OpCode::JUMP | OpCode::JUMP_IF_FALSE => {
            let rel = read_u16(&chunk.code, offset + 1) as i16;
            let target = (offset as i64 + len as i64 + rel as i64) as usize;
            write!(out, "{:<24} -> {target:04}", op.mnemonic()).unwrap();
        }
        OpCode::CALL => {
            let name_idx = read_u16(&chunk.code, offset + 1);
            let addr = read_u16(&chunk.code, offset + 3);
            let arity = chunk.code[offset + 5];
            write!(
                out,
                "{:<24} name={name_idx} addr={addr:04} arity={arity}",
                op.mnemonic()
            )
            .unwrap();
        }
        OpCode::CALL_BUILTIN | OpCode::CALL_USER_PROC => {
            let name_idx = read_u16(&chunk.code, offset + 1);
            let arity = chunk.code[offset + 3];
            write!(out, "{:<24} name={name_idx} arity={arity}", op.mnemonic()).unwrap();
        }
        OpCode::CALL_BUILTIN_PROC => {
            let builtin_id = read_u16(&chunk.code, offset + 1);
            let name_idx = read_u16(&chunk.code, offset + 3);
            let arity = chunk.code[offset + 5];
            write!(
                out,
                "{:<24} id={builtin_id} name={name_idx} arity={arity}",
                op.mnemonic()
            )
            .unwrap();
        }
        OpCode::GET_ELEMENT_ADDRESS_CONST | OpCode::LOAD_ELEMENT_VALUE_CONST => {
            let flat = read_u32(&chunk.code, offset + 1);
            write!(out, "{:<24} flat={flat}", op.mnemonic()).unwrap();
        }
        OpCode::THREAD_CREATE => {
            let entry = read_u16(&chunk.code, offset + 1);
            write!(out, "{:<24} entry={entry:04}", op.mnemonic()).unwrap();
        }
        OpCode::PUSH_IMMEDIATE_INT8 => {
            write!(out, "{:<24} {}", op.mnemonic(), chunk.code[offset + 1] as i8).unwrap();
        }
        OpCode::FORMAT_VALUE => {
            let width = chunk.code[offset + 1];
            let precision = chunk.code[offset + 2] as i8;
            write!(out, "{:<24} width={width} precision={precision}", op.mnemonic()).unwrap();
        }
        _ if len > 1 => {
            // Generic single-operand-byte (or u16) opcodes not given a
            // bespoke format above.
            let operand: u32 = if len - 1 >= 2 {
                read_u16(&chunk.code, offset + 1) as u32
            } else {
                chunk.code[offset + 1] as u32
            };
            write!(out, "{:<24} {operand}", op.mnemonic()).unwrap();
        }
        _ => {
            write!(out, "{}", op.mnemonic()).unwrap();
        }
    }

    (out, offset + len)
}

/// Disassemble an entire chunk (spec §4.2).
pub fn disassemble_chunk(chunk: &BytecodeChunk, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(chunk, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::BytecodeChunk;
    use pvm_core::Value;

    #[test]
    fn disassembles_a_constant_load() {
        let mut chunk = BytecodeChunk::new(1);
        let idx = chunk.add_constant(Value::Integer(42));
        chunk.write_byte(OpCode::CONSTANT as u8, 7);
        chunk.write_byte(idx as u8, 7);
        chunk.write_byte(OpCode::HALT as u8, 7);

        let dump = disassemble_chunk(&chunk, "test");
        assert!(dump.contains("CONSTANT"));
        assert!(dump.contains("HALT"));
    }

    #[test]
    fn jump_resolves_target_offset() {
        let mut chunk = BytecodeChunk::new(1);
        chunk.write_byte(OpCode::JUMP as u8, 1);
        chunk.emit_short(0, 1);
        chunk.write_byte(OpCode::HALT as u8, 1);

        let (line, _) = disassemble_instruction(&chunk, 0);
        assert!(line.contains("-> 0003"));
    }
}
