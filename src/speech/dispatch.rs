//! Concurrent synthesis dispatch.
//!
//! Each recognized sentence gets its own task so synthesis runs while
//! generation continues. The index is registered with the
//! [`PlaybackQueue`] before the task starts, so playback order is fixed at
//! dispatch time regardless of which synthesis finishes first.

use crate::runtime::RuntimeEvent;
use crate::speech::engine::EngineChain;
use crate::speech::playback::PlaybackQueue;
use crate::speech::segmenter::SentenceSegment;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Starts one synthesis task per sentence and feeds results to the queue.
pub struct SpeechDispatcher {
    chain: Arc<EngineChain>,
    queue: Arc<PlaybackQueue>,
    jobs: Mutex<CancellationToken>,
    in_flight: Arc<AtomicUsize>,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
    playback: bool,
}

impl SpeechDispatcher {
    pub fn new(chain: Arc<EngineChain>, queue: Arc<PlaybackQueue>) -> Self {
        Self {
            chain,
            queue,
            jobs: Mutex::new(CancellationToken::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            runtime_tx: None,
            playback: true,
        }
    }

    /// Mark that no coordinator drains the queue, so [`can_speak`](Self::can_speak) is false.
    pub fn without_playback(mut self) -> Self {
        self.playback = false;
        self
    }

    pub fn with_runtime_events(mut self, tx: broadcast::Sender<RuntimeEvent>) -> Self {
        self.runtime_tx = Some(tx);
        self
    }

    pub fn queue(&self) -> &Arc<PlaybackQueue> {
        &self.queue
    }

    /// Whether sentences can be both synthesized and played.
    pub fn can_speak(&self) -> bool {
        self.playback && !self.chain.is_empty()
    }

    /// Number of synthesis tasks still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn job_token(&self) -> CancellationToken {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).child_token()
    }

    /// Register `sentence` for playback and synthesize it in the background.
    ///
    /// Returns `false` if the queue refused the index (it is behind the
    /// playback cursor after a hush).
    pub fn dispatch(&self, sentence: SentenceSegment, voice: &str) -> bool {
        let index = sentence.index;
        if !self.queue.register(index) {
            debug!(index, "sentence behind playback cursor, not dispatched");
            return false;
        }

        let chain = Arc::clone(&self.chain);
        let queue = Arc::clone(&self.queue);
        let cancel = self.job_token();
        let in_flight = Arc::clone(&self.in_flight);
        let runtime_tx = self.runtime_tx.clone();
        let voice = voice.to_owned();
        in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            match chain.synthesize(&sentence.text, &voice, index, &cancel).await {
                Ok(path) => {
                    if cancel.is_cancelled() || !queue.mark_ready(index, path.clone()) {
                        let _ = tokio::fs::remove_file(&path).await;
                    }
                }
                Err(e) if cancel.is_cancelled() => {
                    debug!(index, error = %e, "synthesis cancelled");
                }
                Err(e) => {
                    warn!(index, error = %e, "synthesis failed for sentence");
                    queue.mark_failed(index);
                    if let Some(tx) = &runtime_tx {
                        let _ = tx.send(RuntimeEvent::SynthesisFailed {
                            index,
                            error: e.to_string(),
                        });
                    }
                }
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        true
    }

    /// Cancel every synthesis job, stop playback and empty the queue.
    /// Returns the number of queued entries discarded.
    pub fn hush(&self) -> usize {
        {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.cancel();
            *jobs = CancellationToken::new();
        }
        self.queue.reset()
    }
}
