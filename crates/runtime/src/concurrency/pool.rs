//! Worker pool (spec §4.7: "a fixed-size pool of native OS threads").
//!
//! Every other teacher subsystem (`scheduler.rs`) schedules cooperative
//! `may` coroutines onto a handful of carrier threads; this spec is
//! explicit that VM threads are real OS threads running in parallel, so
//! the pool here spawns `std::thread::Builder` workers directly rather
//! than reusing that scheduler. Capacity is enforced the same way the
//! scheduler enforces its strand registry size — a fixed cap, checked
//! before spawn, configurable via an env var (see `crate::config::Config`).

use crate::concurrency::thread::ThreadSlot;
use crate::error::RuntimeError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct ThreadPool {
    cap: usize,
    next_id: AtomicUsize,
    slots: Mutex<Vec<Arc<ThreadSlot>>>,
}

impl ThreadPool {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            next_id: AtomicUsize::new(0),
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `job` on a fresh worker thread, returning its slot. `job`
    /// receives the slot so it can call `poll()` at cooperative checkpoints
    /// and publish its result via `store_result`.
    pub fn spawn<F>(&self, name: String, job: F) -> Result<Arc<ThreadSlot>, RuntimeError>
    where
        F: FnOnce(Arc<ThreadSlot>) + Send + 'static,
    {
        let mut slots = self.slots.lock().expect("thread pool poisoned");
        slots.retain(|s| !s.is_joinable_and_finished());
        if slots.len() >= self.cap {
            return Err(RuntimeError::Resource(
                "thread pool exhausted: no free workers".to_string(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::new(ThreadSlot::new(id, name.clone()));
        let spawned = slot.clone();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                spawned.mark_started();
                job(spawned.clone());
                spawned.mark_finished();
            })
            .map_err(|e| RuntimeError::Resource(format!("failed to spawn worker thread: {e}")))?;
        slot.set_handle(handle);
        slots.push(slot.clone());
        Ok(slot)
    }

    pub fn get(&self, id: usize) -> Option<Arc<ThreadSlot>> {
        self.slots
            .lock()
            .expect("thread pool poisoned")
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn live_count(&self) -> usize {
        self.slots.lock().expect("thread pool poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn spawn_runs_job_and_reports_completion() {
        let pool = ThreadPool::new(4);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let slot = pool
            .spawn("worker-test".to_string(), move |_slot| {
                ran2.store(true, Ordering::SeqCst);
            })
            .unwrap();
        slot.join();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn exhausting_the_pool_is_an_error() {
        let pool = ThreadPool::new(1);
        let slot = pool
            .spawn("first".to_string(), |slot| {
                while !slot.poll() {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    break;
                }
            })
            .unwrap();
        slot.pause();
        let err = pool.spawn("second".to_string(), |_| {});
        slot.kill();
        slot.join();
        assert!(err.is_err());
    }
}
