//! Per-stream FIFO of speech playback jobs.
//!
//! Jobs run one at a time in submission order. Clearing the queue settles
//! every pending job as cancelled and trips the running job's token so it
//! stops emitting frames.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Pending {
    job: Job,
    done: oneshot::Sender<PlaybackOutcome>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    active: Option<CancellationToken>,
    worker_running: bool,
}

#[derive(Clone, Default)]
pub struct TtsQueue {
    state: Arc<Mutex<QueueState>>,
}

impl TtsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job. The receiver settles once the job finishes, fails, or
    /// is cancelled.
    pub fn enqueue<F, Fut>(&self, job: F) -> oneshot::Receiver<PlaybackOutcome>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let job: Job = Box::new(move |token| Box::pin(job(token)));

        let mut state = self.lock();
        state.pending.push_back(Pending { job, done });
        if !state.worker_running {
            state.worker_running = true;
            let queue = self.clone();
            tokio::spawn(async move { queue.run().await });
        }
        rx
    }

    async fn run(self) {
        loop {
            let (next, token) = {
                let mut state = self.lock();
                let Some(next) = state.pending.pop_front() else {
                    state.worker_running = false;
                    state.active = None;
                    return;
                };
                let token = CancellationToken::new();
                state.active = Some(token.clone());
                (next, token)
            };

            let result = (next.job)(token.clone()).await;
            let outcome = match result {
                _ if token.is_cancelled() => PlaybackOutcome::Cancelled,
                Ok(()) => PlaybackOutcome::Completed,
                Err(e) => {
                    warn!("[TtsQueue] Playback failed: {e:#}");
                    PlaybackOutcome::Failed(e.to_string())
                }
            };
            self.lock().active = None;
            let _ = next.done.send(outcome);
        }
    }

    /// Cancel the running job and drop everything queued behind it.
    pub fn clear(&self) -> usize {
        let (drained, active) = {
            let mut state = self.lock();
            let drained: Vec<Pending> = state.pending.drain(..).collect();
            (drained, state.active.clone())
        };
        if let Some(token) = active {
            token.cancel();
        }
        let count = drained.len();
        for pending in drained {
            let _ = pending.done.send(PlaybackOutcome::Cancelled);
        }
        if count > 0 {
            debug!(dropped = count, "[TtsQueue] Cleared pending playback");
        }
        count
    }

    /// Jobs waiting behind the running one.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_playing(&self) -> bool {
        self.lock().active.is_some()
    }
}
