//! Cancellable one-shot timers keyed by an owner-chosen key.
//!
//! Each key holds at most one pending timer; scheduling again replaces (and
//! aborts) the previous one. Timers run on tokio time, so tests driven with
//! a paused clock advance them deterministically.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

struct Entry {
    id: u64,
    handle: JoinHandle<()>,
}

pub struct TimerRegistry<K> {
    timers: Arc<Mutex<HashMap<K, Entry>>>,
    next_id: Arc<AtomicU64>,
}

impl<K> Clone for TimerRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            timers: Arc::clone(&self.timers),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<K> Default for TimerRegistry<K>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    pub fn new() -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `task` after `delay` unless cancelled first.
    ///
    /// The entry is released before `task` starts, so a task may cancel
    /// other timers (or reschedule its own key) without aborting itself.
    pub fn schedule<F>(&self, key: K, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = self.clone();
        let task_key = key.clone();

        let mut timers = self.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.release(&task_key, id);
            task.await;
        });
        if let Some(previous) = timers.insert(key.clone(), Entry { id, handle }) {
            previous.handle.abort();
            debug!(key = ?key, "Replaced pending timer");
        }
    }

    fn release(&self, key: &K, id: u64) {
        let mut timers = self.lock();
        if timers.get(key).is_some_and(|entry| entry.id == id) {
            timers.remove(key);
        }
    }

    /// Cancel the timer for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match self.lock().remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer whose key matches `predicate`.
    pub fn cancel_matching(&self, predicate: impl Fn(&K) -> bool) -> usize {
        let mut timers = self.lock();
        let keys: Vec<K> = timers.keys().filter(|k| predicate(k)).cloned().collect();
        for key in &keys {
            if let Some(entry) = timers.remove(key) {
                entry.handle.abort();
            }
        }
        keys.len()
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
