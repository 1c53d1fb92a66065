//! Stack/frame dumps and opcode profiling (spec §4.8), grounded on
//! `examples/original_source/src/vm/vm.h`'s `vmDumpStackInfo`/
//! `vmDumpStackInfoDetailed`/`vmOpcodeProfileDump` declarations.
//!
//! Unlike `runtime_error`/`runtime_warning` (in `error.rs`), which always
//! fire, the detailed dump and the opcode profile are both opt-in:
//! verbose dumps gated on `Config::verbose_errors`, the profiler gated on
//! whether `Vm::enable_opcode_profiling` was ever called.

use crate::chunk::{BytecodeChunk, OpCode};
use crate::disassemble::disassemble_instruction;
use crate::frame::CallFrame;
use pvm_core::Value;

/// One line per live call frame plus the current operand stack, in the
/// original's "innermost frame first" order.
pub fn dump_stack_info(stack: &[Value], frames: &[CallFrame]) -> String {
    let mut out = String::new();
    out.push_str("call stack:\n");
    for (depth, frame) in frames.iter().rev().enumerate() {
        out.push_str(&format!(
            "  #{depth} {} (base {}, window {})\n",
            frame.function.name, frame.stack_base, frame.slot_count
        ));
    }
    out.push_str("operand stack:\n");
    for (i, v) in stack.iter().enumerate().rev() {
        out.push_str(&format!("  [{i}] {v:?}\n"));
    }
    out
}

/// The detailed variant also disassembles the faulting instruction.
/// Spec §4.8: "Verbose mode (config-gated) also dumps the disassembled
/// current instruction and its operands." `context` is a short label
/// (e.g. the error message) printed ahead of the dump.
pub fn dump_stack_info_detailed(
    chunk: &BytecodeChunk,
    ip: usize,
    stack: &[Value],
    frames: &[CallFrame],
    context: &str,
) -> String {
    let mut out = format!("{context}\n");
    if ip < chunk.code.len() {
        let (text, _) = disassemble_instruction(chunk, ip);
        out.push_str(&format!("at ip={ip}: {text}\n"));
    }
    out.push_str(&dump_stack_info(stack, frames));
    out
}

/// Per-opcode execution counters (spec: `vmOpcodeProfileDump`,
/// `vmOpcodeProfileIsEnabled`). `OpCode` has contiguous discriminants
/// 0..=94, so a flat array indexed by the raw byte is simplest.
pub const OPCODE_COUNT: usize = 95;

#[derive(Debug, Clone)]
pub struct OpcodeProfile {
    counts: [u64; OPCODE_COUNT],
}

impl Default for OpcodeProfile {
    fn default() -> Self {
        Self { counts: [0; OPCODE_COUNT] }
    }
}

impl OpcodeProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, op: OpCode) {
        self.counts[op as usize] += 1;
    }

    /// Human-readable dump, one line per opcode with a non-zero count,
    /// most-executed first.
    pub fn dump(&self) -> String {
        let mut rows: Vec<(usize, u64)> = self
            .counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(i, &c)| (i, c))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1));
        let mut out = String::new();
        for (byte, count) in rows {
            if let Some(op) = OpCode::from_u8(byte as u8) {
                out.push_str(&format!("{:<24} {count}\n", op.mnemonic()));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_counts_recorded_opcodes() {
        let mut profile = OpcodeProfile::new();
        profile.record(OpCode::ADD);
        profile.record(OpCode::ADD);
        profile.record(OpCode::POP);
        let dump = profile.dump();
        assert!(dump.contains("ADD"));
        assert!(dump.contains("2"));
    }

    #[test]
    fn dump_stack_info_lists_frames_innermost_first() {
        use pvm_core::Symbol;
        use std::sync::Arc;
        let frames = vec![
            CallFrame::new(0, 0, Arc::new(Symbol::new_procedure("outer", 0, 0, 0))),
            CallFrame::new(0, 0, Arc::new(Symbol::new_procedure("inner", 0, 0, 0))),
        ];
        let out = dump_stack_info(&[], &frames);
        let inner_pos = out.find("inner").unwrap();
        let outer_pos = out.find("outer").unwrap();
        assert!(inner_pos < outer_pos);
    }
}
