//! `pvmrun`: a demo frontend for the PVM runtime.
//!
//! This is deliberately not a compiler — no frontend that parses a
//! Pascal-like source file into a `BytecodeChunk` lives in this crate.
//! It can run a chunk previously saved with `pvm_runtime::cache::save`,
//! disassemble one, or build and run a couple of hand-assembled demo
//! chunks that exercise the VM end to end without needing a compiler.

use clap::{Parser, Subcommand};
use pvm_core::{HashTable, Value};
use pvm_runtime::{cache, disassemble, BytecodeChunk, Config, InterpretResult, OpCode, Vm, VM_VERSION};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "pvmrun")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run or inspect PVM bytecode chunks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a chunk cached on disk (see `pvm_runtime::cache::save`)
    Run {
        /// Path to a cached chunk file
        path: PathBuf,

        /// Byte offset to start execution at
        #[arg(long, default_value_t = 0)]
        entry: u16,

        /// Dump an opcode-frequency profile after running
        #[arg(long)]
        profile: bool,
    },

    /// Print a disassembly of a cached chunk
    Disassemble {
        /// Path to a cached chunk file
        path: PathBuf,
    },

    /// Run one of the built-in demo programs, with no cache file needed
    Demo {
        #[command(subcommand)]
        which: DemoKind,
    },
}

#[derive(Subcommand)]
enum DemoKind {
    /// Compute the nth Fibonacci number via the `Fibonacci` builtin
    Fibonacci {
        /// Which term to compute
        n: i64,
    },
    /// Concatenate a couple of strings and format the result
    Greeting,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("pvm_runtime=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { path, entry, profile } => run_cached(&path, entry, profile),
        Commands::Disassemble { path } => disassemble_cached(&path),
        Commands::Demo { which } => run_demo(which),
    }
}

fn run_cached(path: &PathBuf, entry: u16, profile: bool) -> ExitCode {
    let chunk = match cache::load(path, VM_VERSION) {
        Ok(chunk) => chunk,
        Err(err) => {
            eprintln!("failed to load '{}': {err}", path.display());
            return ExitCode::FAILURE;
        }
    };
    let mut vm = Vm::new(Config::from_env());
    if profile {
        vm.enable_opcode_profiling();
    }
    let result = vm.interpret(chunk, HashTable::new(), HashTable::new(), HashTable::new(), entry);
    report(&vm, result, profile)
}

fn disassemble_cached(path: &PathBuf) -> ExitCode {
    match cache::load(path, VM_VERSION) {
        Ok(chunk) => {
            print!("{}", disassemble::disassemble_chunk(&chunk, &path.display().to_string()));
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("failed to load '{}': {err}", path.display());
            ExitCode::FAILURE
        }
    }
}

fn run_demo(which: DemoKind) -> ExitCode {
    let mut vm = Vm::new(Config::from_env());
    let chunk = match which {
        DemoKind::Fibonacci { n } => fibonacci_chunk(n),
        DemoKind::Greeting => greeting_chunk(),
    };
    let result = vm.interpret(chunk, HashTable::new(), HashTable::new(), HashTable::new(), 0);
    report(&vm, result, false)
}

/// `Fibonacci(n)` via `CALL_BUILTIN`, mirroring the wire shape
/// `CALL_BUILTIN name_idx:u16, arity:u8` (no call-site cache slot — the
/// demo only ever runs this chunk once, so caching buys nothing).
fn fibonacci_chunk(n: i64) -> BytecodeChunk {
    let mut chunk = BytecodeChunk::new(VM_VERSION);
    let arg = chunk.add_constant(Value::Integer(n));
    let name = chunk.add_constant(Value::String(pvm_core::SeqString::new("fibonacci")));
    chunk.write_byte(OpCode::CONSTANT as u8, 1);
    chunk.write_byte(arg as u8, 1);
    chunk.write_byte(OpCode::CALL_BUILTIN as u8, 1);
    chunk.emit_short(name as u16, 1);
    chunk.write_byte(1, 1); // arity
    chunk.write_byte(OpCode::HALT as u8, 1);
    chunk
}

fn greeting_chunk() -> BytecodeChunk {
    let mut chunk = BytecodeChunk::new(VM_VERSION);
    let hello = chunk.add_constant(Value::String(pvm_core::SeqString::new("Hello, ")));
    let world = chunk.add_constant(Value::String(pvm_core::SeqString::new("world")));
    chunk.write_byte(OpCode::CONSTANT as u8, 1);
    chunk.write_byte(hello as u8, 1);
    chunk.write_byte(OpCode::CONSTANT as u8, 1);
    chunk.write_byte(world as u8, 1);
    chunk.write_byte(OpCode::ADD as u8, 1);
    chunk.write_byte(OpCode::FORMAT_VALUE as u8, 1);
    chunk.write_byte(0xFF, 1); // precision -1 (no truncation)
    chunk.write_byte(0, 1); // width 0
    chunk.write_byte(OpCode::HALT as u8, 1);
    chunk
}

fn report(vm: &Vm, result: InterpretResult, profile: bool) -> ExitCode {
    match result {
        InterpretResult::Ok => {
            match vm.peek_top() {
                Some(v) => println!("{}", render_top(v)),
                None => println!("(no value on the stack)"),
            }
            if profile {
                if let Some(dump) = vm.opcode_profile_dump() {
                    eprintln!("{dump}");
                }
            }
            ExitCode::SUCCESS
        }
        InterpretResult::RuntimeError | InterpretResult::CompileError => {
            eprintln!("run failed: {result:?}");
            ExitCode::FAILURE
        }
    }
}

fn render_top(value: &Value) -> String {
    match value {
        Value::String(s) => s.as_str().to_string(),
        Value::Integer(n) => n.to_string(),
        Value::Real(_, n) => n.to_string(),
        Value::Boolean(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}
