//! Mid-call instructions waiting for the carrier to fetch them.
//!
//! Markup carriers cannot be pushed a verb directly: the adapter parks the
//! verb here and redirects the call to a webhook that drains it. A redirect
//! interrupts whatever the call is doing, so a listen request waits behind
//! speech that is still playing and is picked up by the speech's trailing
//! redirect instead.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Speak(String),
    Listen(String),
}

impl Instruction {
    fn markup(&self) -> &str {
        match self {
            Self::Speak(xml) | Self::Listen(xml) => xml,
        }
    }
}

#[derive(Default)]
struct Script {
    queued: Vec<Instruction>,
    speaking: bool,
}

#[derive(Default)]
pub struct PendingInstructions {
    scripts: Mutex<HashMap<String, Script>>,
}

impl PendingInstructions {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Script>> {
        self.scripts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park speech. The caller should redirect the call now.
    pub fn push_speech(&self, provider_call_id: &str, markup: String) {
        let mut scripts = self.lock();
        let script = scripts.entry(provider_call_id.to_string()).or_default();
        script.queued.push(Instruction::Speak(markup));
        script.speaking = true;
    }

    /// Park a listen request. Returns whether the caller should redirect
    /// now; `false` while speech is still playing.
    pub fn push_listen(&self, provider_call_id: &str, markup: String) -> bool {
        let mut scripts = self.lock();
        let script = scripts.entry(provider_call_id.to_string()).or_default();
        script.queued.retain(|i| !matches!(i, Instruction::Listen(_)));
        script.queued.push(Instruction::Listen(markup));
        !script.speaking
    }

    pub fn cancel_listen(&self, provider_call_id: &str) {
        if let Some(script) = self.lock().get_mut(provider_call_id) {
            script.queued.retain(|i| !matches!(i, Instruction::Listen(_)));
        }
    }

    /// Drain everything parked for a call, in order.
    pub fn take(&self, provider_call_id: &str) -> Vec<String> {
        let mut scripts = self.lock();
        let Some(script) = scripts.get_mut(provider_call_id) else {
            return Vec::new();
        };
        let drained: Vec<Instruction> = script.queued.drain(..).collect();
        script.speaking = drained.iter().any(|i| matches!(i, Instruction::Speak(_)));
        drained.iter().map(|i| i.markup().to_string()).collect()
    }

    pub fn is_speaking(&self, provider_call_id: &str) -> bool {
        self.lock().get(provider_call_id).is_some_and(|s| s.speaking)
    }

    /// Move parked instructions to a new carrier id.
    pub fn rekey(&self, from: &str, to: &str) {
        let mut scripts = self.lock();
        if let Some(script) = scripts.remove(from) {
            scripts.insert(to.to_string(), script);
        }
    }

    pub fn forget(&self, provider_call_id: &str) {
        self.lock().remove(provider_call_id);
    }
}
