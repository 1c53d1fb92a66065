//! Concurrency subsystem (spec §4.7, §5): worker threads, pause/cancel/
//! kill, result hand-off, and a mutex registry, all rooted at the owning
//! VM and shared by every sibling worker VM it spawns.

pub mod mutex;
pub mod pool;
pub mod thread;

pub use mutex::{MutexHandle, MutexRegistry};
pub use pool::ThreadPool;
pub use thread::{ThreadMetrics, ThreadMetricsSample, ThreadSlot};

use std::sync::Arc;

/// Shared concurrency state, rooted at the owner VM and `Arc`-cloned into
/// every sibling worker VM (spec §4.7: "every sibling VM has
/// `threadOwner` pointing back to the main VM; concurrency operations
/// must walk to the owner before touching the registry" — here, walking
/// to the owner is just following the `Arc`, since the registries
/// themselves are the shared owner state rather than a pointer to a
/// separate VM struct).
#[derive(Clone)]
pub struct ConcurrencyHandle {
    pub threads: Arc<ThreadPool>,
    pub mutexes: Arc<MutexRegistry>,
}

impl ConcurrencyHandle {
    pub fn new(worker_cap: usize, mutex_cap: usize) -> Self {
        Self {
            threads: Arc::new(ThreadPool::new(worker_cap)),
            mutexes: Arc::new(MutexRegistry::new(mutex_cap)),
        }
    }
}
