//! Environment-driven tunables (SPEC_FULL.md §9.3), in the teacher's
//! warn-and-fallback style (see the teacher's `scheduler.rs`
//! `SEQ_STACK_SIZE`/`SEQ_STRAND_REGISTRY_SIZE` handling).

use std::env;

fn read_env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(value) if value > 0 => value,
            _ => {
                tracing::warn!(%key, %raw, default, "invalid value, falling back to default");
                default
            }
        },
        Err(_) => default,
    }
}

fn read_env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => match raw.as_str() {
            "1" | "true" | "TRUE" | "yes" => true,
            "0" | "false" | "FALSE" | "no" => false,
            _ => {
                tracing::warn!(%key, %raw, default, "invalid boolean, falling back to default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Runtime tunables, read once at [`crate::vm::Vm::new`] (mirrors
/// `VM_MAX_THREADS`/`VM_MAX_MUTEXES`/`VM_STACK_MAX`/`VM_CALL_STACK_MAX`
/// in `examples/original_source/src/vm/vm.h`, but as soft configurable
/// caps rather than fixed-size-array bounds).
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub worker_cap: usize,
    pub mutex_cap: usize,
    pub stack_cap: usize,
    pub frame_cap: usize,
    pub verbose_errors: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_cap: 16,
            mutex_cap: 64,
            stack_cap: 8192,
            frame_cap: 4096,
            verbose_errors: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            worker_cap: read_env_usize("SEQ_VM_WORKER_CAP", default.worker_cap),
            mutex_cap: read_env_usize("SEQ_VM_MUTEX_CAP", default.mutex_cap),
            stack_cap: read_env_usize("SEQ_VM_STACK_CAP", default.stack_cap),
            frame_cap: read_env_usize("SEQ_VM_FRAME_CAP", default.frame_cap),
            verbose_errors: read_env_bool("SEQ_VM_VERBOSE_ERRORS", default.verbose_errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_vm_caps() {
        let cfg = Config::default();
        assert_eq!(cfg.worker_cap, 16);
        assert_eq!(cfg.mutex_cap, 64);
    }
}
