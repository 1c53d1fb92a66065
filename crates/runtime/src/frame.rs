//! Call frames (spec §4.4).
//!
//! Closure-env refcounting ("each frame that binds an env increments its
//! refcount; on frame pop, the env is decremented and freed at zero") is
//! exactly what `Arc<ClosureEnv>`'s `Clone`/`Drop` already does — binding
//! an env to a frame is `Arc::clone`, and popping the frame is letting it
//! drop, with no manual refcount bookkeeping needed.

use pvm_core::{ClosureEnv, Symbol, Value};
use std::sync::{Arc, Mutex};

/// A window on the operand stack representing one active call (spec
/// GLOSSARY: "Frame").
#[derive(Debug)]
pub struct CallFrame {
    /// Byte offset to resume at in the caller, once this frame returns.
    pub return_ip: usize,
    /// Index into the VM's operand stack where this frame's slot window
    /// (parameters then locals) begins.
    pub stack_base: usize,
    /// The function symbol this frame is executing (arity/locals counts,
    /// name for diagnostics).
    pub function: Arc<Symbol>,
    /// Total window size (`param_count + locals_count`) reserved on the
    /// operand stack at call time. `RETURN` uses this to tell whether the
    /// callee left an extra return value above the window (spec §4.4
    /// point 3: a function pushes a result, a procedure leaves the stack
    /// unchanged).
    pub slot_count: usize,
    /// Captured upvalues, bound from the invoking closure if any (spec
    /// §4.4: `CALL_INDIRECT`/`PROC_CALL_INDIRECT` bind these before
    /// entering).
    pub upvalues: Vec<Arc<Mutex<Value>>>,
    /// The active closure env, if this frame was entered via a closure
    /// call. Held as an `Arc` purely so it outlives the frame that needs
    /// it; dropped automatically on frame pop.
    pub closure_env: Option<Arc<ClosureEnv>>,
    /// Statement-call sites set this so `RETURN` discards an unused
    /// function result rather than leaving it on the stack.
    pub discard_result_on_return: bool,
}

impl CallFrame {
    pub fn new(return_ip: usize, stack_base: usize, function: Arc<Symbol>) -> Self {
        let slot_count = function.param_count as usize + function.locals_count as usize;
        Self {
            return_ip,
            stack_base,
            function,
            slot_count,
            upvalues: Vec::new(),
            closure_env: None,
            discard_result_on_return: false,
        }
    }

    pub fn with_closure(
        return_ip: usize,
        stack_base: usize,
        function: Arc<Symbol>,
        upvalues: Vec<Arc<Mutex<Value>>>,
        closure_env: Arc<ClosureEnv>,
    ) -> Self {
        let slot_count = function.param_count as usize + function.locals_count as usize;
        Self {
            return_ip,
            stack_base,
            function,
            slot_count,
            upvalues,
            closure_env: Some(closure_env),
            discard_result_on_return: false,
        }
    }

    pub fn local_slot(&self, index: usize) -> usize {
        self.stack_base + index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_slot_is_relative_to_stack_base() {
        let sym = Arc::new(Symbol::new_procedure("foo", 10, 3, 1));
        let frame = CallFrame::new(0, 5, sym);
        assert_eq!(frame.local_slot(0), 5);
        assert_eq!(frame.local_slot(2), 7);
    }

    #[test]
    fn closure_env_drops_when_frame_drops() {
        let sym = Arc::new(Symbol::new_procedure("bar", 0, 0, 0));
        let env = Arc::new(ClosureEnv::new(vec![Arc::new(Mutex::new(Value::Integer(1)))]));
        let weak = Arc::downgrade(&env);
        {
            let frame = CallFrame::with_closure(0, 0, sym, vec![], env);
            assert!(weak.upgrade().is_some());
            drop(frame);
        }
        assert!(weak.upgrade().is_none());
    }
}
