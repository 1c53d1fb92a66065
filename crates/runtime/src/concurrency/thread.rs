//! A `Thread` slot: cooperative flags, timing marks, resource snapshots,
//! and result hand-off state (spec §4.7).

use pvm_core::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// A resource-usage snapshot, taken via `libc::getrusage` where available
/// (spec §4.7: "timing marks... and resource snapshots at start and end
/// (wall, CPU, RSS via `getrusage` or equivalent)").
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadMetricsSample {
    pub valid: bool,
    pub cpu_time_micros: i64,
    pub rss_bytes: i64,
}

impl ThreadMetricsSample {
    /// Capture a snapshot for the calling thread. `valid = false` if the
    /// platform call fails, mirroring the original's `valid` flag (spec
    /// §4.7: "`start.valid`/`end.valid` indicate whether the OS supported
    /// each snapshot").
    pub fn capture() -> Self {
        // SAFETY: `getrusage` with `RUSAGE_THREAD` writes into a
        // stack-local, fully-initialized `rusage` struct; the syscall
        // itself performs no aliasing of Rust-managed memory.
        unsafe {
            let mut usage: libc::rusage = std::mem::zeroed();
            let rc = libc::getrusage(libc::RUSAGE_THREAD, &mut usage);
            if rc != 0 {
                return Self::default();
            }
            let cpu_time_micros = (usage.ru_utime.tv_sec + usage.ru_stime.tv_sec) * 1_000_000
                + i64::from(usage.ru_utime.tv_usec + usage.ru_stime.tv_usec);
            Self {
                valid: true,
                cpu_time_micros,
                rss_bytes: usage.ru_maxrss * 1024,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadMetrics {
    pub start: ThreadMetricsSample,
    pub end: ThreadMetricsSample,
}

#[derive(Default)]
struct ResultSlot {
    status_ready: bool,
    status: bool,
    status_consumed: bool,
    result_ready: bool,
    result: Option<Value>,
    result_consumed: bool,
}

/// One worker slot (spec §4.7). Held behind an `Arc` so both the spawning
/// VM and the spawned `std::thread` closure can reference it.
pub struct ThreadSlot {
    pub id: usize,
    pub name: Mutex<String>,
    pub paused: AtomicBool,
    pub cancel_requested: AtomicBool,
    pub kill_requested: AtomicBool,
    pub queued_at: Instant,
    pub started_at: Mutex<Option<Instant>>,
    pub finished_at: Mutex<Option<Instant>>,
    pub metrics: Mutex<ThreadMetrics>,
    result: Mutex<ResultSlot>,
    result_cond: Condvar,
    state_cond: Condvar,
    joined: AtomicBool,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ThreadSlot {
    pub fn new(id: usize, name: String) -> Self {
        Self {
            id,
            name: Mutex::new(name),
            paused: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            kill_requested: AtomicBool::new(false),
            queued_at: Instant::now(),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            metrics: Mutex::new(ThreadMetrics::default()),
            result: Mutex::new(ResultSlot::default()),
            result_cond: Condvar::new(),
            state_cond: Condvar::new(),
            joined: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn set_handle(&self, handle: std::thread::JoinHandle<()>) {
        *self.handle.lock().expect("thread slot mutex poisoned") = Some(handle);
    }

    pub fn mark_started(&self) {
        *self.started_at.lock().expect("mutex poisoned") = Some(Instant::now());
        self.metrics.lock().expect("mutex poisoned").start = ThreadMetricsSample::capture();
    }

    pub fn mark_finished(&self) {
        *self.finished_at.lock().expect("mutex poisoned") = Some(Instant::now());
        self.metrics.lock().expect("mutex poisoned").end = ThreadMetricsSample::capture();
    }

    /// Cooperative poll point (spec §4.7 pause contract). Blocks on the
    /// state condvar while paused; returns `true` if the caller should
    /// unwind (cancel or kill observed).
    pub fn poll(&self) -> bool {
        let mut guard = self.handle.lock().expect("mutex poisoned");
        while self.paused.load(Ordering::SeqCst)
            && !self.cancel_requested.load(Ordering::SeqCst)
            && !self.kill_requested.load(Ordering::SeqCst)
        {
            guard = self
                .state_cond
                .wait_timeout(guard, std::time::Duration::from_millis(50))
                .expect("mutex poisoned")
                .0;
        }
        self.cancel_requested.load(Ordering::SeqCst) || self.kill_requested.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.state_cond.notify_all();
    }

    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.state_cond.notify_all();
    }

    pub fn kill(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
        self.state_cond.notify_all();
    }

    /// `vm_thread_store_result` (spec §4.7 result hand-off).
    pub fn store_result(&self, value: Option<Value>, status: bool) {
        let mut slot = self.result.lock().expect("mutex poisoned");
        slot.status = status;
        slot.status_ready = true;
        slot.status_consumed = false;
        if let Some(v) = value {
            slot.result = Some(v);
            slot.result_ready = true;
            slot.result_consumed = false;
        }
        self.result_cond.notify_all();
    }

    /// `vm_thread_take_result`. Blocks until a result or status is
    /// published, then takes whichever the caller asked for.
    pub fn take_result(&self, take_value: bool, take_status: bool) -> (Option<Value>, Option<bool>) {
        let mut slot = self.result.lock().expect("mutex poisoned");
        while !slot.status_ready && !slot.result_ready {
            slot = self.result_cond.wait(slot).expect("mutex poisoned");
        }
        let value = if take_value && slot.result_ready && !slot.result_consumed {
            slot.result_consumed = true;
            slot.result.clone()
        } else {
            None
        };
        let status = if take_status && slot.status_ready && !slot.status_consumed {
            slot.status_consumed = true;
            Some(slot.status)
        } else {
            None
        };
        (value, status)
    }

    /// `vm_join_thread_by_id`.
    pub fn join(&self) {
        if self.joined.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().expect("mutex poisoned").take() {
            let _ = handle.join();
        }
    }

    /// True once the slot has both finished its job and been joined, so
    /// the pool can recycle its capacity (spec §4.7 job lifecycle: "a
    /// free pool worker is reused").
    pub fn is_joinable_and_finished(&self) -> bool {
        self.finished_at.lock().expect("mutex poisoned").is_some()
            && self.handle.lock().expect("mutex poisoned").is_none()
    }
}

impl std::fmt::Debug for ThreadSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSlot")
            .field("id", &self.id)
            .field("name", &*self.name.lock().expect("mutex poisoned"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_round_trips_through_store_and_take() {
        let slot = ThreadSlot::new(0, "worker-0".into());
        slot.store_result(Some(Value::Integer(55)), true);
        let (value, status) = slot.take_result(true, true);
        assert_eq!(value, Some(Value::Integer(55)));
        assert_eq!(status, Some(true));
    }

    #[test]
    fn pause_then_resume_unblocks_poll() {
        let slot = std::sync::Arc::new(ThreadSlot::new(0, "worker".into()));
        slot.pause();
        let clone = slot.clone();
        let handle = std::thread::spawn(move || clone.poll());
        std::thread::sleep(std::time::Duration::from_millis(20));
        slot.resume();
        let unwind = handle.join().unwrap();
        assert!(!unwind);
    }
}
