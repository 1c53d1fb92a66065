//! Host-function registry (spec §4.5 part 1): a fixed set of IDs, each
//! bound to a native callback at startup, invoked by `CALL_HOST id`.
//!
//! Grounded on `examples/original_source/src/vm/vm.h`'s `HostFunctionID`
//! enum. Frontend-specific hooks (shell loop polling, interface glue) are
//! kept here as inert IDs per spec §1 ("frontends are free") — CORE only
//! specifies dispatch, not what `PRINTF` or `SHELL_LOOP_*` actually do.

use crate::error::RuntimeError;
use crate::vm::Vm;
use pvm_core::Value;

/// Sentinel IDs baked into bytecode at compile time (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostFunctionId {
    QuitRequested,
    CreateThreadAddr,
    WaitThread,
    Printf,
    ShellLastStatus,
    ShellLoopCheckCondition,
    ShellLoopCheckBody,
    ShellLoopExecBody,
    ShellLoopAdvance,
    ShellPollJobs,
    ShellLoopIsReady,
    CreateClosure,
    BoxInterface,
    InterfaceLookup,
    InterfaceAssert,
}

impl HostFunctionId {
    pub const COUNT: usize = 15;

    pub fn index(self) -> usize {
        self as usize
    }
}

pub type HostFunction = Box<dyn Fn(&mut Vm) -> Result<Value, RuntimeError> + Send + Sync>;

/// Fixed-size table indexed by [`HostFunctionId`] (spec §4.5: "`CALL_HOST
/// id` simply invokes `host_functions[id](vm)`").
#[derive(Default)]
pub struct HostRegistry {
    slots: Vec<Option<HostFunction>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(HostFunctionId::COUNT);
        slots.resize_with(HostFunctionId::COUNT, || None);
        Self { slots }
    }

    /// Register (or replace) the callback for `id` (spec §6.2:
    /// `register_host_function`).
    pub fn register(&mut self, id: HostFunctionId, f: HostFunction) {
        self.slots[id.index()] = Some(f);
    }

    pub fn is_registered(&self, id: HostFunctionId) -> bool {
        self.slots[id.index()].is_some()
    }

    /// Temporarily remove the callback for `id` so the caller can invoke
    /// it with `&mut Vm` without the table itself (which lives inside
    /// `Vm`) being simultaneously borrowed. Pair with [`Self::put_back`].
    pub fn take(&mut self, id: HostFunctionId) -> Result<HostFunction, RuntimeError> {
        self.slots[id.index()]
            .take()
            .ok_or_else(|| RuntimeError::HostMissing(format!("{id:?}")))
    }

    pub fn put_back(&mut self, id: HostFunctionId, f: HostFunction) {
        self.slots[id.index()] = Some(f);
    }
}

impl std::fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<bool> = self.slots.iter().map(Option::is_some).collect();
        f.debug_struct("HostRegistry").field("registered", &registered).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_host_id_is_host_missing() {
        let registry = HostRegistry::new();
        assert!(!registry.is_registered(HostFunctionId::Printf));
    }

    #[test]
    fn registering_marks_the_slot_live() {
        let mut registry = HostRegistry::new();
        registry.register(HostFunctionId::QuitRequested, Box::new(|_vm| Ok(Value::Void)));
        assert!(registry.is_registered(HostFunctionId::QuitRequested));
    }
}
