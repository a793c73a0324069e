//! Single-value mailbox used between pipeline stages.
//!
//! A write replaces whatever is stored, a read hands out the newest value
//! without consuming it. Values are published behind an `Arc`, so the lock is
//! held only for the pointer swap and a reader never sees a partially written
//! value.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Newest value in a slot together with its commit number.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub value: Arc<T>,
    /// Starts at 1 for the first write and grows by one per write.
    pub generation: u64,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            generation: self.generation,
        }
    }
}

struct SlotState<T> {
    value: Option<Arc<T>>,
    generation: u64,
}

pub struct LatestSlot<T> {
    state: Mutex<SlotState<T>>,
    written: Condvar,
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                value: None,
                generation: 0,
            }),
            written: Condvar::new(),
        }
    }

    /// Replace the stored value. Never blocks on readers.
    ///
    /// Returns the generation assigned to `value`.
    pub fn publish(&self, value: T) -> u64 {
        let value = Arc::new(value);
        let (generation, superseded) = {
            let mut state = self.lock();
            state.generation += 1;
            (state.generation, state.value.replace(value))
        };
        // Dropped outside the lock; it may be the last owner of a large buffer.
        drop(superseded);
        self.written.notify_all();
        generation
    }

    /// Newest value, or `None` if the slot was never written.
    pub fn latest(&self) -> Option<Snapshot<T>> {
        let state = self.lock();
        state.value.as_ref().map(|value| Snapshot {
            value: value.clone(),
            generation: state.generation,
        })
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Wait up to `timeout` for a value newer than generation `seen`.
    ///
    /// Returns immediately if one is already stored.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> Option<Snapshot<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.generation <= seen {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .written
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.value.as_ref().map(|value| Snapshot {
            value: value.clone(),
            generation: state.generation,
        })
    }

    /// Wait up to `timeout` for the first write. Returns whether the slot holds a value.
    pub fn wait_written(&self, timeout: Duration) -> bool {
        self.wait_newer(0, timeout).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        // Writers never panic while holding the lock, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
