use crate::cancel::{CancellationController, InterruptAction, join_with_grace};
use crate::error::{DeckError, Result};
use crate::generation::{ChatRequest, GenerationEvent, GenerationOutcome, GenerationProcessor, HaltReason};
use crate::routing::RouteHandle;
use crate::session::ChatSession;
use crate::speech::{SentenceSegmenter, SpeechDispatcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Receives the live narration of one exchange.
pub trait Narrator: Send {
    fn reasoning(&mut self, text: &str);
    fn visible(&mut self, text: &str);
    /// Text previously passed to [`visible`](Self::visible) that was reasoning.
    fn reclassified(&mut self, text: &str);
    fn notice(&mut self, text: &str);
    fn interrupted(&mut self, action: InterruptAction);
    fn finished(&mut self, outcome: &GenerationOutcome);
}

/// Summary of a finished exchange.
#[derive(Debug, Clone)]
pub struct ExchangeReport {
    pub outcome: GenerationOutcome,
    /// Sentences sent for synthesis.
    pub dispatched: usize,
    /// The user turn was removed because no reply was produced.
    pub rolled_back: bool,
    /// The generation went to the local fallback.
    pub fallback: bool,
}

/// Runs exchanges: generation → narration → segmentation → speech dispatch.
pub struct Pipeline {
    processor: GenerationProcessor,
    route: RouteHandle,
    dispatcher: Arc<SpeechDispatcher>,
    controller: Arc<CancellationController>,
    segmenter: SentenceSegmenter,
    drain_poll: Duration,
}

impl Pipeline {
    pub fn new(
        processor: GenerationProcessor,
        route: RouteHandle,
        dispatcher: Arc<SpeechDispatcher>,
        controller: Arc<CancellationController>,
        min_sentence_chars: usize,
    ) -> Self {
        Self {
            processor,
            route,
            dispatcher,
            controller,
            segmenter: SentenceSegmenter::new(min_sentence_chars),
            drain_poll: Duration::from_millis(50),
        }
    }

    pub fn with_drain_poll(mut self, poll: Duration) -> Self {
        self.drain_poll = poll;
        self
    }

    pub fn controller(&self) -> &Arc<CancellationController> {
        &self.controller
    }

    pub fn dispatcher(&self) -> &Arc<SpeechDispatcher> {
        &self.dispatcher
    }

    pub fn route(&self) -> &RouteHandle {
        &self.route
    }

    /// Run one exchange for `user_message`.
    ///
    /// Interrupts arriving on `interrupts` while tokens stream are passed to
    /// the cancellation controller. The first one ends the exchange; audio
    /// already queued keeps playing.
    ///
    /// # Errors
    ///
    /// Returns [`DeckError::Routing`] when there is neither an active route
    /// nor a local fallback. History is left untouched in that case.
    pub async fn run_exchange(
        &mut self,
        session: &mut ChatSession,
        user_message: &str,
        narrator: &mut dyn Narrator,
        interrupts: &mut mpsc::UnboundedReceiver<()>,
    ) -> Result<ExchangeReport> {
        let target = self
            .route
            .target()
            .ok_or_else(|| DeckError::Routing("no reachable endpoint and no local fallback".to_owned()))?;

        if self.dispatcher.queue().is_stalled_on_failure() {
            let cleared = self.dispatcher.hush();
            info!(cleared, "discarding audio stalled behind a failed sentence");
        }

        let (exchange, cancel) = self.controller.begin_exchange();
        let messages = session.begin_exchange(user_message);
        let request = ChatRequest::new(&target.model, messages, session.temperature, session.max_tokens);
        info!(
            exchange,
            url = %target.url,
            model = %target.model,
            fallback = target.fallback,
            "exchange started"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let processor = self.processor.clone();
        let task_target = target.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { processor.run(&task_target, &request, &tx, &task_cancel).await });

        let speak = session.audio_enabled && self.dispatcher.can_speak();
        let mut dispatched = 0;
        let mut narrated = String::new();
        let mut stopped = false;

        loop {
            tokio::select! {
                biased;
                Some(()) = interrupts.recv() => {
                    let action = self.controller.interrupt();
                    narrator.interrupted(action);
                    if cancel.is_cancelled() {
                        stopped = true;
                        break;
                    }
                }
                event = rx.recv() => match event {
                    Some(event) => {
                        dispatched += self.handle_event(event, session, narrator, speak, &mut narrated);
                    }
                    None => break,
                },
            }
        }

        let mut outcome = join_with_grace(handle, &cancel, self.controller.grace_period())
            .await
            .unwrap_or_else(|| GenerationOutcome {
                halt: HaltReason::Interrupted,
                visible: narrated.clone(),
                reasoning: String::new(),
                output_chars: narrated.chars().count(),
                orphan_close: false,
            });
        if stopped {
            // Tokens still queued in `rx` were never shown or spoken.
            outcome.halt = HaltReason::Interrupted;
            outcome.visible = narrated;
        }

        if speak && outcome.halt.is_finished() {
            // The stream is over, so a terminator at the end of the buffer is final.
            for sentence in self.segmenter.feed("\n") {
                if self.dispatcher.dispatch(sentence, &session.voice) {
                    dispatched += 1;
                }
            }
        }
        let discarded = self.segmenter.flush();
        if !discarded.trim().is_empty() {
            debug!(chars = discarded.len(), "unterminated text not spoken");
        }

        narrator.finished(&outcome);
        let rolled_back = match outcome.reply() {
            Some(reply) => {
                session.complete_exchange(reply);
                false
            }
            None => session.rollback(),
        };

        let audio_pending = !self.dispatcher.queue().is_empty();
        self.controller.generation_finished(exchange, audio_pending);
        if audio_pending {
            let queue = Arc::clone(self.dispatcher.queue());
            let controller = Arc::clone(&self.controller);
            let poll = self.drain_poll;
            tokio::spawn(async move {
                queue.wait_drained(poll).await;
                controller.settle(exchange);
            });
        }

        info!(exchange, halt = %outcome.halt, dispatched, rolled_back, "exchange finished");
        Ok(ExchangeReport {
            outcome,
            dispatched,
            rolled_back,
            fallback: target.fallback,
        })
    }

    fn handle_event(
        &mut self,
        event: GenerationEvent,
        session: &ChatSession,
        narrator: &mut dyn Narrator,
        speak: bool,
        narrated: &mut String,
    ) -> usize {
        match event {
            GenerationEvent::Reasoning(text) => narrator.reasoning(&text),
            GenerationEvent::Visible(text) => {
                narrator.visible(&text);
                narrated.push_str(&text);
                if speak {
                    let mut dispatched = 0;
                    for sentence in self.segmenter.feed(&text) {
                        if self.dispatcher.dispatch(sentence, &session.voice) {
                            dispatched += 1;
                        }
                    }
                    return dispatched;
                }
            }
            GenerationEvent::Reclassified(text) => {
                narrator.reclassified(&text);
                if let Some(kept) = narrated.strip_suffix(text.as_str()) {
                    narrated.truncate(kept.len());
                }
                // Buffered text belonged to the reasoning region.
                self.segmenter.flush();
            }
            GenerationEvent::Notice(text) => narrator.notice(&text),
        }
        0
    }

    /// Stop everything and forget queued audio. Used by `/hush` and `/clear`.
    pub fn hush(&self) -> usize {
        self.controller.hush()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::config::{EndpointsConfig, GenerationConfig, LocalFallbackConfig, SpeechConfig};
    use crate::generation::{ChatBackend, TokenStream};
    use crate::routing::{HealthMonitor, HttpProber};
    use crate::speech::{EngineChain, PlaybackQueue, SpeechEngine};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::path::Path;
    use tokio_util::sync::CancellationToken;

    /// Streams a fixed token list, pausing `delay` before each token.
    struct ScriptedBackend {
        tokens: Vec<&'static str>,
        delay: Duration,
        fail: bool,
        /// Stream error yielded after the last token.
        break_with: Option<&'static str>,
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn stream_chat(&self, _url: &str, _request: &ChatRequest) -> Result<TokenStream> {
            if self.fail {
                return Err(DeckError::Connectivity("refused".to_owned()));
            }
            let delay = self.delay;
            let mut items: Vec<Result<String>> = self.tokens.iter().map(|t| Ok((*t).to_owned())).collect();
            if let Some(reason) = self.break_with {
                items.push(Err(DeckError::Stream(reason.to_owned())));
            }
            Ok(Box::pin(stream::unfold(items.into_iter(), move |mut it| async move {
                let item = it.next()?;
                tokio::time::sleep(delay).await;
                Some((item, it))
            })))
        }
    }

    struct InstantEngine;

    #[async_trait]
    impl SpeechEngine for InstantEngine {
        fn name(&self) -> &str {
            "instant"
        }

        async fn synthesize(&self, _text: &str, _voice: &str, out: &Path, _cancel: &CancellationToken) -> Result<()> {
            tokio::fs::write(out, b"RIFF").await?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Transcript {
        visible: String,
        reasoning: String,
        notices: Vec<String>,
        reclassified: Vec<String>,
        interrupts: Vec<InterruptAction>,
        finished: usize,
    }

    impl Narrator for Transcript {
        fn reasoning(&mut self, text: &str) {
            self.reasoning.push_str(text);
        }
        fn visible(&mut self, text: &str) {
            self.visible.push_str(text);
        }
        fn reclassified(&mut self, text: &str) {
            self.reclassified.push(text.to_owned());
        }
        fn notice(&mut self, text: &str) {
            self.notices.push(text.to_owned());
        }
        fn interrupted(&mut self, action: InterruptAction) {
            self.interrupts.push(action);
        }
        fn finished(&mut self, _outcome: &GenerationOutcome) {
            self.finished += 1;
        }
    }

    fn route(fallback: bool) -> RouteHandle {
        let config = EndpointsConfig {
            urls: Vec::new(),
            local_fallback: fallback.then(|| LocalFallbackConfig {
                url: "http://127.0.0.1:9".to_owned(),
                model: "local".to_owned(),
            }),
            ..EndpointsConfig::default()
        };
        let (_monitor, handle) = HealthMonitor::new(&config, Arc::new(HttpProber::new(Duration::from_millis(50))));
        handle
    }

    fn pipeline(backend: ScriptedBackend, dir: &Path, fallback: bool) -> Pipeline {
        let engines: Vec<Arc<dyn SpeechEngine>> = vec![Arc::new(InstantEngine)];
        let chain = Arc::new(EngineChain::new(engines, dir));
        let dispatcher = Arc::new(SpeechDispatcher::new(chain, PlaybackQueue::new()));
        let controller = Arc::new(CancellationController::new(
            Arc::clone(&dispatcher),
            Duration::from_millis(100),
        ));
        let processor = GenerationProcessor::new(Arc::new(backend), GenerationConfig::default());
        Pipeline::new(processor, route(fallback), dispatcher, controller, 4).with_drain_poll(Duration::from_millis(5))
    }

    fn session() -> ChatSession {
        ChatSession::new(&GenerationConfig::default(), &SpeechConfig::default(), None)
    }

    #[tokio::test]
    async fn completed_exchange_records_reply_and_dispatches_sentences() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend {
            tokens: vec!["<think>plan</think>", "Hello there. ", "How are", " you?"],
            delay: Duration::ZERO,
            fail: false,
            break_with: None,
        };
        let mut p = pipeline(backend, dir.path(), true);
        let mut s = session();
        let mut narrator = Transcript::default();
        let (_tx, mut interrupts) = mpsc::unbounded_channel();

        let report = p.run_exchange(&mut s, "hi", &mut narrator, &mut interrupts).await.unwrap();

        assert_eq!(report.outcome.halt, HaltReason::Completed);
        assert!(report.fallback);
        assert_eq!(report.dispatched, 2, "final terminated sentence is spoken too");
        assert_eq!(narrator.reasoning, "plan");
        assert_eq!(narrator.visible, "Hello there. How are you?");
        assert_eq!(s.history().len(), 2);
        assert_eq!(s.history()[1].content, "Hello there. How are you?");
        assert_eq!(narrator.finished, 1);
    }

    #[tokio::test]
    async fn failed_request_rolls_back_user_turn() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend {
            tokens: Vec::new(),
            delay: Duration::ZERO,
            fail: true,
            break_with: None,
        };
        let mut p = pipeline(backend, dir.path(), true);
        let mut s = session();
        let (_tx, mut interrupts) = mpsc::unbounded_channel();

        let report = p
            .run_exchange(&mut s, "hi", &mut Transcript::default(), &mut interrupts)
            .await
            .unwrap();

        assert!(matches!(report.outcome.halt, HaltReason::Failed(_)));
        assert!(report.rolled_back);
        assert!(s.history().is_empty());
        assert_eq!(p.controller().state(), crate::cancel::ControllerState::Idle);
    }

    #[tokio::test]
    async fn no_route_leaves_history_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend {
            tokens: vec!["unused"],
            delay: Duration::ZERO,
            fail: false,
            break_with: None,
        };
        let mut p = pipeline(backend, dir.path(), false);
        let mut s = session();
        let (_tx, mut interrupts) = mpsc::unbounded_channel();

        let err = p
            .run_exchange(&mut s, "hi", &mut Transcript::default(), &mut interrupts)
            .await
            .unwrap_err();
        assert!(matches!(err, DeckError::Routing(_)));
        assert!(s.history().is_empty());
    }

    #[tokio::test]
    async fn orphan_close_discards_buffered_reasoning() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend {
            tokens: vec!["secret plan", " more</think>", "Answer here. "],
            delay: Duration::ZERO,
            fail: false,
            break_with: None,
        };
        let mut p = pipeline(backend, dir.path(), true);
        let mut s = session();
        let mut narrator = Transcript::default();
        let (_tx, mut interrupts) = mpsc::unbounded_channel();

        let report = p.run_exchange(&mut s, "hi", &mut narrator, &mut interrupts).await.unwrap();

        assert!(report.outcome.orphan_close);
        assert_eq!(narrator.reclassified.len(), 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(s.history()[1].content, "Answer here. ");
    }

    #[tokio::test]
    async fn interrupt_stops_generation_and_keeps_partial_reply() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend {
            tokens: vec!["First sentence here. ", "second", " never", " arrives."],
            delay: Duration::from_millis(40),
            fail: false,
            break_with: None,
        };
        let mut p = pipeline(backend, dir.path(), true);
        let mut s = session();
        let mut narrator = Transcript::default();
        let (tx, mut interrupts) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let _ = tx.send(());
        });
        let report = p.run_exchange(&mut s, "hi", &mut narrator, &mut interrupts).await.unwrap();

        assert_eq!(report.outcome.halt, HaltReason::Interrupted);
        assert_eq!(narrator.interrupts, vec![InterruptAction::StopGeneration]);
        assert!(!narrator.visible.contains("arrives"));
        assert_eq!(s.history().len(), 2);
        assert_eq!(s.history()[1].content, "First sentence here. ");
    }

    #[tokio::test]
    async fn interrupt_before_any_content_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend {
            tokens: vec!["late"],
            delay: Duration::from_millis(500),
            fail: false,
            break_with: None,
        };
        let mut p = pipeline(backend, dir.path(), true);
        let mut s = session();
        let (tx, mut interrupts) = mpsc::unbounded_channel();
        tx.send(()).unwrap();

        let report = p
            .run_exchange(&mut s, "hi", &mut Transcript::default(), &mut interrupts)
            .await
            .unwrap();
        assert!(report.rolled_back);
        assert!(s.history().is_empty());
    }

    #[tokio::test]
    async fn stream_error_after_partial_text_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend {
            tokens: vec!["Partial answer"],
            delay: Duration::ZERO,
            fail: false,
            break_with: Some("connection reset"),
        };
        let mut p = pipeline(backend, dir.path(), true);
        let mut s = session();
        let mut narrator = Transcript::default();
        let (_tx, mut interrupts) = mpsc::unbounded_channel();

        let report = p.run_exchange(&mut s, "hi", &mut narrator, &mut interrupts).await.unwrap();

        assert!(matches!(report.outcome.halt, HaltReason::Failed(_)));
        assert_eq!(narrator.visible, "Partial answer");
        assert!(report.rolled_back);
        assert!(s.history().is_empty());
    }

    /// Sends an interrupt as soon as the first visible text is shown.
    struct InterruptOnFirstText {
        transcript: Transcript,
        tx: Option<mpsc::UnboundedSender<()>>,
    }

    impl Narrator for InterruptOnFirstText {
        fn reasoning(&mut self, text: &str) {
            self.transcript.reasoning(text);
        }
        fn visible(&mut self, text: &str) {
            self.transcript.visible(text);
            if let Some(tx) = self.tx.take() {
                tx.send(()).unwrap();
            }
        }
        fn reclassified(&mut self, text: &str) {
            self.transcript.reclassified(text);
        }
        fn notice(&mut self, text: &str) {
            self.transcript.notice(text);
        }
        fn interrupted(&mut self, action: InterruptAction) {
            self.transcript.interrupted(action);
        }
        fn finished(&mut self, outcome: &GenerationOutcome) {
            self.transcript.finished(outcome);
        }
    }

    #[tokio::test]
    async fn interrupted_reply_holds_only_narrated_text() {
        let dir = tempfile::tempdir().unwrap();
        // Every token is queued before the first one is narrated.
        let backend = ScriptedBackend {
            tokens: vec!["Shown text. ", "Queued but ", "never shown."],
            delay: Duration::ZERO,
            fail: false,
            break_with: None,
        };
        let mut p = pipeline(backend, dir.path(), true);
        let mut s = session();
        let (tx, mut interrupts) = mpsc::unbounded_channel();
        let mut narrator = InterruptOnFirstText {
            transcript: Transcript::default(),
            tx: Some(tx),
        };

        let report = p.run_exchange(&mut s, "hi", &mut narrator, &mut interrupts).await.unwrap();

        assert_eq!(report.outcome.halt, HaltReason::Interrupted);
        assert_eq!(narrator.transcript.visible, "Shown text. ");
        assert_eq!(narrator.transcript.interrupts, vec![InterruptAction::StopGeneration]);
        assert_eq!(s.history().len(), 2);
        assert_eq!(s.history()[1].content, narrator.transcript.visible);
    }
}
