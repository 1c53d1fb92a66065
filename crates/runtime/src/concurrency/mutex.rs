//! Mutex registry (spec §4.7): `MUTEX_CREATE`/`RCMUTEX_CREATE` allocate a
//! handle, `MUTEX_LOCK`/`MUTEX_UNLOCK`/`MUTEX_DESTROY` operate on it.
//!
//! `std::sync::Mutex` doesn't expose ownership/reentrancy or a way to ask
//! "is this currently locked" without taking the lock, so handles are
//! backed by a small condvar-guarded state struct instead — the same
//! shape the original's `pthread_mutex_t` + a reentrant variant needs,
//! minus the libc FFI.

use crate::error::RuntimeError;
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

struct LockState {
    locked: bool,
    owner: Option<ThreadId>,
    hold_count: u32,
}

/// One registered mutex (spec: "`RCMUTEX_CREATE` allocates a reentrant
/// mutex"). `reentrant` lets the same thread re-lock without deadlocking
/// itself, matching `pthread_mutexattr_settype(PTHREAD_MUTEX_RECURSIVE)`.
pub struct MutexHandle {
    pub id: u64,
    pub reentrant: bool,
    state: Mutex<LockState>,
    cond: Condvar,
}

impl MutexHandle {
    fn new(id: u64, reentrant: bool) -> Self {
        Self {
            id,
            reentrant,
            state: Mutex::new(LockState {
                locked: false,
                owner: None,
                hold_count: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> Result<(), RuntimeError> {
        let me = std::thread::current().id();
        let mut st = self.state.lock().expect("mutex registry poisoned");
        loop {
            if !st.locked {
                st.locked = true;
                st.owner = Some(me);
                st.hold_count = 1;
                return Ok(());
            }
            if self.reentrant && st.owner == Some(me) {
                st.hold_count += 1;
                return Ok(());
            }
            st = self.cond.wait(st).expect("mutex registry poisoned");
        }
    }

    pub fn unlock(&self) -> Result<(), RuntimeError> {
        let me = std::thread::current().id();
        let mut st = self.state.lock().expect("mutex registry poisoned");
        if !st.locked {
            return Err(RuntimeError::Concurrency(format!(
                "mutex {} is not locked",
                self.id
            )));
        }
        if self.reentrant && st.owner != Some(me) {
            return Err(RuntimeError::Concurrency(format!(
                "mutex {} unlocked by a thread that does not own it",
                self.id
            )));
        }
        st.hold_count = st.hold_count.saturating_sub(1);
        if st.hold_count == 0 {
            st.locked = false;
            st.owner = None;
            self.cond.notify_all();
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().expect("mutex registry poisoned").locked
    }
}

/// The owner VM's mutex table (spec: "protected by `mutexRegistryLock`.
/// Operations on a sibling VM walk to `mutexOwner`" — here, siblings just
/// hold a clone of the same `Arc<MutexRegistry>`, so there is no owner
/// pointer to walk).
pub struct MutexRegistry {
    cap: usize,
    handles: Mutex<Vec<Option<std::sync::Arc<MutexHandle>>>>,
    next_id: Mutex<u64>,
}

impl MutexRegistry {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            handles: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }

    fn allocate(&self, reentrant: bool) -> Result<u64, RuntimeError> {
        let mut handles = self.handles.lock().expect("mutex registry poisoned");
        let live = handles.iter().filter(|h| h.is_some()).count();
        if live >= self.cap {
            return Err(RuntimeError::Resource(
                "mutex registry exhausted".to_string(),
            ));
        }
        let mut next_id = self.next_id.lock().expect("mutex registry poisoned");
        let id = *next_id;
        *next_id += 1;
        handles.push(Some(std::sync::Arc::new(MutexHandle::new(id, reentrant))));
        Ok(id)
    }

    pub fn create(&self) -> Result<u64, RuntimeError> {
        self.allocate(false)
    }

    pub fn create_reentrant(&self) -> Result<u64, RuntimeError> {
        self.allocate(true)
    }

    fn find(&self, id: u64) -> Result<std::sync::Arc<MutexHandle>, RuntimeError> {
        let handles = self.handles.lock().expect("mutex registry poisoned");
        handles
            .iter()
            .flatten()
            .find(|h| h.id == id)
            .cloned()
            .ok_or_else(|| RuntimeError::Concurrency(format!("unknown mutex handle {id}")))
    }

    pub fn lock(&self, id: u64) -> Result<(), RuntimeError> {
        self.find(id)?.lock()
    }

    pub fn unlock(&self, id: u64) -> Result<(), RuntimeError> {
        self.find(id)?.unlock()
    }

    /// "Destroying a locked or pending mutex is a runtime error" (spec
    /// §4.7).
    pub fn destroy(&self, id: u64) -> Result<(), RuntimeError> {
        let mut handles = self.handles.lock().expect("mutex registry poisoned");
        let slot = handles
            .iter_mut()
            .find(|h| h.as_ref().is_some_and(|m| m.id == id));
        match slot {
            Some(slot) => {
                let handle = slot.as_ref().unwrap();
                if handle.is_locked() {
                    return Err(RuntimeError::Concurrency(format!(
                        "cannot destroy locked mutex {id}"
                    )));
                }
                *slot = None;
                Ok(())
            }
            None => Err(RuntimeError::Concurrency(format!(
                "unknown mutex handle {id}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_round_trips() {
        let reg = MutexRegistry::new(4);
        let id = reg.create().unwrap();
        reg.lock(id).unwrap();
        reg.unlock(id).unwrap();
    }

    #[test]
    fn destroying_a_locked_mutex_is_an_error() {
        let reg = MutexRegistry::new(4);
        let id = reg.create().unwrap();
        reg.lock(id).unwrap();
        assert!(reg.destroy(id).is_err());
        reg.unlock(id).unwrap();
        assert!(reg.destroy(id).is_ok());
    }

    #[test]
    fn reentrant_mutex_allows_same_thread_relock() {
        let reg = MutexRegistry::new(4);
        let id = reg.create_reentrant().unwrap();
        reg.lock(id).unwrap();
        reg.lock(id).unwrap();
        reg.unlock(id).unwrap();
        reg.unlock(id).unwrap();
    }

    #[test]
    fn unlocking_an_unlocked_mutex_is_an_error() {
        let reg = MutexRegistry::new(4);
        let id = reg.create().unwrap();
        assert!(reg.unlock(id).is_err());
    }
}
