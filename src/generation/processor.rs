//! Generation stream processor.
//!
//! [`StreamProcessor`] is the synchronous per-token state machine:
//! classification, loop detection and the length ceiling.
//! [`GenerationProcessor`] drives it from a backend token stream, observing
//! the cancellation token between tokens.

use super::backend::{ChatBackend, ChatRequest};
use super::classifier::{ReasoningClassifier, Region};
use super::loop_detect::{LoopDetector, LoopSettings};
use crate::config::GenerationConfig;
use crate::routing::RouteTarget;
use futures_util::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Incremental output of a generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    /// Text inside a reasoning region.
    Reasoning(String),
    /// Answer text; forwarded to the sentence segmenter.
    Visible(String),
    /// Text already sent as [`Visible`](Self::Visible) that turned out to be reasoning.
    Reclassified(String),
    /// A notice for the user that is not part of the answer.
    Notice(String),
}

/// Why a generation stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// The stream ended normally.
    Completed,
    /// Repetition loop detected; the closing remark was appended.
    LoopDetected,
    /// The output ceiling was exceeded.
    LengthExceeded,
    /// Cancelled by the user.
    Interrupted,
    /// The request or stream failed.
    Failed(String),
}

impl HaltReason {
    /// Whether the reply should be recorded even when it is empty.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::LoopDetected | Self::LengthExceeded)
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::LoopDetected => write!(f, "loop detected"),
            Self::LengthExceeded => write!(f, "length exceeded"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Final result of one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub halt: HaltReason,
    /// Visible text, including any loop closing remark.
    pub visible: String,
    pub reasoning: String,
    /// Characters received from the backend.
    pub output_chars: usize,
    /// Whether the orphaned-close case fired.
    pub orphan_close: bool,
}

impl GenerationOutcome {
    /// Text to store as the assistant turn, or `None` to roll the user turn back.
    ///
    /// A failed generation never produces a reply. An interrupted one keeps
    /// its partial text unless that is blank.
    pub fn reply(&self) -> Option<&str> {
        match &self.halt {
            HaltReason::Failed(_) => None,
            HaltReason::Interrupted if self.visible.trim().is_empty() => None,
            _ => Some(&self.visible),
        }
    }
}

/// Events and halt decision produced by one token.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    pub events: Vec<GenerationEvent>,
    pub halt: Option<HaltReason>,
}

/// Per-request stream state.
#[derive(Debug)]
pub struct StreamProcessor {
    classifier: ReasoningClassifier,
    loops: LoopDetector,
    max_chars: usize,
    end_marker: Option<String>,
    loop_suffix: String,
    truncation_notice: String,
    output: String,
    output_chars: usize,
    visible: String,
    reasoning: String,
    end_marker_seen: bool,
    loop_detected: bool,
    length_exceeded: bool,
}

impl StreamProcessor {
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            classifier: ReasoningClassifier::new(&config.reasoning_open, &config.reasoning_close),
            loops: LoopDetector::new(LoopSettings {
                segment_words: config.loop_segment_words,
                window: config.loop_window,
                threshold: config.loop_similarity,
                matches_to_trigger: config.loop_matches,
            }),
            max_chars: config.max_output_chars,
            end_marker: config.end_marker.clone().filter(|m| !m.is_empty()),
            loop_suffix: config.loop_suffix.clone(),
            truncation_notice: config.truncation_notice.clone(),
            output: String::new(),
            output_chars: 0,
            visible: String::new(),
            reasoning: String::new(),
            end_marker_seen: false,
            loop_detected: false,
            length_exceeded: false,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.loop_detected || self.length_exceeded
    }

    /// Process one token.
    pub fn push(&mut self, token: &str) -> Step {
        let mut step = Step::default();
        if self.is_halted() {
            return step;
        }

        self.output.push_str(token);
        self.output_chars += token.chars().count();

        let classified = self.classifier.feed(token);
        if let Some(moved) = classified.reclassified {
            debug!(chars = moved.len(), "orphaned reasoning close, reclassifying earlier output");
            let keep = self.visible.len().saturating_sub(moved.len());
            self.visible.truncate(keep);
            self.reasoning.insert_str(0, &moved);
            step.events.push(GenerationEvent::Reclassified(moved));
        }
        for fragment in classified.fragments {
            match fragment.region {
                Region::Reasoning => {
                    self.reasoning.push_str(&fragment.text);
                    step.events.push(GenerationEvent::Reasoning(fragment.text));
                }
                Region::Visible => {
                    self.visible.push_str(&fragment.text);
                    step.events.push(GenerationEvent::Visible(fragment.text));
                }
            }
        }

        if !self.end_marker_seen {
            if let Some(marker) = &self.end_marker {
                self.end_marker_seen = self.output.contains(marker.as_str());
            }
        }

        if self.loops.push(token) {
            info!("repetition loop detected, halting generation");
            self.loop_detected = true;
            self.visible.push_str(&self.loop_suffix);
            step.events
                .push(GenerationEvent::Visible(self.loop_suffix.clone()));
            step.halt = Some(HaltReason::LoopDetected);
        } else if !self.end_marker_seen && self.output_chars > self.max_chars {
            info!(chars = self.output_chars, max = self.max_chars, "output length exceeded, halting generation");
            self.length_exceeded = true;
            step.events
                .push(GenerationEvent::Notice(self.truncation_notice.clone()));
            step.halt = Some(HaltReason::LengthExceeded);
        }

        step
    }

    /// Release text held back by the classifier at the end of a stream.
    pub fn finish(&mut self) -> Vec<GenerationEvent> {
        if self.is_halted() {
            return Vec::new();
        }
        let mut events = Vec::new();
        for fragment in self.classifier.flush().fragments {
            match fragment.region {
                Region::Reasoning => {
                    self.reasoning.push_str(&fragment.text);
                    events.push(GenerationEvent::Reasoning(fragment.text));
                }
                Region::Visible => {
                    self.visible.push_str(&fragment.text);
                    events.push(GenerationEvent::Visible(fragment.text));
                }
            }
        }
        events
    }

    pub fn visible(&self) -> &str {
        &self.visible
    }

    pub fn into_outcome(self, halt: HaltReason) -> GenerationOutcome {
        GenerationOutcome {
            halt,
            visible: self.visible,
            reasoning: self.reasoning,
            output_chars: self.output_chars,
            orphan_close: self.classifier.orphan_handled(),
        }
    }
}

/// Issues a streaming request and runs the token loop.
#[derive(Clone)]
pub struct GenerationProcessor {
    backend: Arc<dyn ChatBackend>,
    config: GenerationConfig,
}

impl GenerationProcessor {
    pub fn new(backend: Arc<dyn ChatBackend>, config: GenerationConfig) -> Self {
        Self { backend, config }
    }

    /// Stream a completion for `request` from `target`, sending events as
    /// they are produced. Returns when the stream ends, a halt condition
    /// fires, or `cancel` is triggered.
    pub async fn run(
        &self,
        target: &RouteTarget,
        request: &ChatRequest,
        events: &mpsc::UnboundedSender<GenerationEvent>,
        cancel: &CancellationToken,
    ) -> GenerationOutcome {
        let mut state = StreamProcessor::new(&self.config);

        let connect = tokio::select! {
            biased;
            _ = cancel.cancelled() => return state.into_outcome(HaltReason::Interrupted),
            result = self.backend.stream_chat(&target.url, request) => result,
        };
        let mut stream = match connect {
            Ok(stream) => stream,
            Err(e) => {
                warn!(url = %target.url, error = %e, "generation request failed");
                return state.into_outcome(HaltReason::Failed(e.to_string()));
            }
        };

        let halt = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break HaltReason::Interrupted,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(token)) => {
                    if cancel.is_cancelled() {
                        break HaltReason::Interrupted;
                    }
                    let step = state.push(&token);
                    for event in step.events {
                        let _ = events.send(event);
                    }
                    if let Some(halt) = step.halt {
                        break halt;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "generation stream broke");
                    break HaltReason::Failed(e.to_string());
                }
                None => break HaltReason::Completed,
            }
        };

        if halt != HaltReason::Interrupted {
            for event in state.finish() {
                let _ = events.send(event);
            }
        }
        debug!(%halt, "generation finished");
        state.into_outcome(halt)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::error::{DeckError, Result};
    use crate::generation::backend::TokenStream;
    use async_trait::async_trait;
    use std::time::Duration;

    fn config() -> GenerationConfig {
        GenerationConfig::default()
    }

    fn visible_text(events: &[GenerationEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Visible(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    // ── StreamProcessor ──────────────────────────────────────────

    #[test]
    fn classifies_and_accumulates() {
        let mut p = StreamProcessor::new(&config());
        let mut events = p.push("<think>hmm</think>");
        events.events.extend(p.push("Hello.").events);
        assert_eq!(
            events.events,
            vec![
                GenerationEvent::Reasoning("hmm".into()),
                GenerationEvent::Visible("Hello.".into())
            ]
        );
        let outcome = p.into_outcome(HaltReason::Completed);
        assert_eq!(outcome.visible, "Hello.");
        assert_eq!(outcome.reasoning, "hmm");
        assert!(!outcome.orphan_close);
    }

    #[test]
    fn orphaned_close_moves_text_out_of_the_reply() {
        let mut p = StreamProcessor::new(&config());
        p.push("thinking aloud ");
        let step = p.push("done</think>Answer.");
        assert_eq!(
            step.events,
            vec![
                GenerationEvent::Reclassified("thinking aloud ".into()),
                GenerationEvent::Reasoning("done".into()),
                GenerationEvent::Visible("Answer.".into()),
            ]
        );
        let outcome = p.into_outcome(HaltReason::Completed);
        assert_eq!(outcome.visible, "Answer.");
        assert_eq!(outcome.reasoning, "thinking aloud done");
        assert!(outcome.orphan_close);
    }

    #[test]
    fn length_cap_halts_with_notice() {
        let mut cfg = config();
        cfg.max_output_chars = 50;
        let mut p = StreamProcessor::new(&cfg);

        let mut halted_at = None;
        for i in 0..20 {
            let step = p.push("abcdefghij");
            if let Some(halt) = step.halt {
                assert_eq!(halt, HaltReason::LengthExceeded);
                assert!(step
                    .events
                    .contains(&GenerationEvent::Notice(cfg.truncation_notice.clone())));
                halted_at = Some(i);
                break;
            }
        }
        // 60 characters is the first count above 50.
        assert_eq!(halted_at, Some(5));
        assert!(p.push("more").events.is_empty());
    }

    #[test]
    fn end_marker_lifts_length_cap() {
        let mut cfg = config();
        cfg.max_output_chars = 10;
        cfg.end_marker = Some("</think>".into());
        let mut p = StreamProcessor::new(&cfg);
        p.push("<think>short</think>");
        for _ in 0..10 {
            assert!(p.push("long answer text ").halt.is_none());
        }
    }

    #[test]
    fn loop_halts_with_suffix() {
        let cfg = config();
        let mut p = StreamProcessor::new(&cfg);
        let sentence = "I am going to say the same thing again and again because \
                        that is what broken models tend to do ";
        assert_eq!(sentence.split_whitespace().count(), 20);

        let mut halt = None;
        let mut events = Vec::new();
        for _ in 0..5 {
            let step = p.push(sentence);
            events.extend(step.events);
            if step.halt.is_some() {
                halt = step.halt;
                break;
            }
        }
        assert_eq!(halt, Some(HaltReason::LoopDetected));
        assert!(visible_text(&events).ends_with(&cfg.loop_suffix));
        let outcome = p.into_outcome(HaltReason::LoopDetected);
        assert!(outcome.visible.ends_with(&cfg.loop_suffix));
        assert_eq!(outcome.visible.matches("same thing").count(), 3);
    }

    #[test]
    fn finish_releases_held_partial_marker() {
        let mut p = StreamProcessor::new(&config());
        p.push("x <");
        assert_eq!(p.finish(), vec![GenerationEvent::Visible("<".into())]);
        assert_eq!(p.visible(), "x <");
    }

    #[test]
    fn reply_rules() {
        let outcome = |halt, visible: &str| GenerationOutcome {
            halt,
            visible: visible.into(),
            reasoning: String::new(),
            output_chars: 0,
            orphan_close: false,
        };
        assert_eq!(outcome(HaltReason::Completed, "").reply(), Some(""));
        assert_eq!(outcome(HaltReason::Interrupted, "").reply(), None);
        assert_eq!(outcome(HaltReason::Interrupted, "  ").reply(), None);
        assert_eq!(outcome(HaltReason::Interrupted, "partial").reply(), Some("partial"));
        assert_eq!(outcome(HaltReason::Failed("x".into()), "").reply(), None);
        assert_eq!(outcome(HaltReason::Failed("reset".into()), "partial").reply(), None);
    }

    // ── GenerationProcessor ──────────────────────────────────────

    /// Backend yielding scripted tokens with a delay between them.
    struct ScriptedBackend {
        tokens: Vec<&'static str>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn stream_chat(&self, _url: &str, _request: &ChatRequest) -> Result<TokenStream> {
            if self.fail {
                return Err(DeckError::Connectivity("refused".into()));
            }
            let delay = self.delay;
            let tokens: Vec<String> = self.tokens.iter().map(|t| (*t).to_owned()).collect();
            Ok(Box::pin(futures_util::stream::iter(tokens).then(move |t| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, DeckError>(t)
            })))
        }
    }

    fn target() -> RouteTarget {
        RouteTarget {
            url: "http://unused".into(),
            model: "m".into(),
            fallback: false,
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new("m", vec![], 0.7, 64)
    }

    #[tokio::test]
    async fn run_streams_to_completion() {
        let backend = Arc::new(ScriptedBackend {
            tokens: vec!["<think>plan</think>", "Hello", " there."],
            delay: Duration::ZERO,
            fail: false,
        });
        let processor = GenerationProcessor::new(backend, config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = processor
            .run(&target(), &request(), &tx, &CancellationToken::new())
            .await;
        drop(tx);

        assert_eq!(outcome.halt, HaltReason::Completed);
        assert_eq!(outcome.visible, "Hello there.");
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        assert_eq!(visible_text(&events), "Hello there.");
    }

    #[tokio::test]
    async fn run_stops_promptly_on_cancel() {
        let backend = Arc::new(ScriptedBackend {
            tokens: vec!["one "; 1000],
            delay: Duration::from_millis(5),
            fail: false,
        });
        let processor = GenerationProcessor::new(backend, config());
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            processor.run(&target(), &request(), &tx, &cancel),
        )
        .await
        .unwrap();
        assert_eq!(outcome.halt, HaltReason::Interrupted);
        assert!(outcome.output_chars < 1000 * 4);
    }

    #[tokio::test]
    async fn run_reports_connect_failure() {
        let backend = Arc::new(ScriptedBackend {
            tokens: vec![],
            delay: Duration::ZERO,
            fail: true,
        });
        let processor = GenerationProcessor::new(backend, config());
        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = processor
            .run(&target(), &request(), &tx, &CancellationToken::new())
            .await;
        assert!(matches!(outcome.halt, HaltReason::Failed(_)));
        assert_eq!(outcome.reply(), None);
    }
}
