//! One pending transcript request per call.
//!
//! Registering a new wait rejects the previous one. Each registration gets
//! a generation so a timed-out waiter only removes its own slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use callforge_core::CallError;

pub type TranscriptResult = Result<String, CallError>;

struct Slot {
    generation: u64,
    tx: oneshot::Sender<TranscriptResult>,
}

#[derive(Default)]
pub struct TranscriptWaiters {
    slots: Mutex<HashMap<String, Slot>>,
    next_generation: AtomicU64,
}

impl TranscriptWaiters {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, call_id: &str) -> (u64, oneshot::Receiver<TranscriptResult>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let previous = self.slots().insert(call_id.to_string(), Slot { generation, tx });
        if let Some(previous) = previous {
            let _ = previous
                .tx
                .send(Err(CallError::WaitCancelled("superseded by a newer wait".into())));
        }
        (generation, rx)
    }

    pub fn resolve(&self, call_id: &str, transcript: impl Into<String>) -> bool {
        match self.slots().remove(call_id) {
            Some(slot) => slot.tx.send(Ok(transcript.into())).is_ok(),
            None => false,
        }
    }

    pub fn reject(&self, call_id: &str, reason: &str) -> bool {
        match self.slots().remove(call_id) {
            Some(slot) => slot.tx.send(Err(CallError::WaitCancelled(reason.to_string()))).is_ok(),
            None => false,
        }
    }

    /// Drop the slot only if it still belongs to `generation`.
    pub fn release(&self, call_id: &str, generation: u64) {
        let mut slots = self.slots();
        if slots.get(call_id).is_some_and(|s| s.generation == generation) {
            slots.remove(call_id);
        }
    }

    pub fn is_waiting(&self, call_id: &str) -> bool {
        self.slots().contains_key(call_id)
    }
}
