//! Repetition loop detection over fixed-size word segments.
//!
//! Words are grouped into segments of `segment_words`. Each completed segment
//! is compared with up to `window` previous segments using a word-level
//! similarity ratio; every comparison above `threshold` is a match. A loop is
//! reported once the matches recorded across the retained window reach
//! `matches_to_trigger`.

use similar::TextDiff;
use std::collections::VecDeque;

/// Tunables for [`LoopDetector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    pub segment_words: usize,
    pub window: usize,
    pub threshold: f32,
    pub matches_to_trigger: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            segment_words: 20,
            window: 5,
            threshold: 0.85,
            matches_to_trigger: 3,
        }
    }
}

/// Similarity ratio of two segments, 0.0 (disjoint) to 1.0 (identical).
pub fn similarity(a: &str, b: &str) -> f32 {
    TextDiff::from_words(a, b).ratio()
}

#[derive(Debug)]
struct Segment {
    text: String,
    matches: usize,
}

/// Streaming repetition detector for one generation.
#[derive(Debug)]
pub struct LoopDetector {
    settings: LoopSettings,
    partial_word: String,
    words: Vec<String>,
    recent: VecDeque<Segment>,
    detected: bool,
}

impl LoopDetector {
    pub fn new(settings: LoopSettings) -> Self {
        Self {
            settings,
            partial_word: String::new(),
            words: Vec::new(),
            recent: VecDeque::new(),
            detected: false,
        }
    }

    pub fn detected(&self) -> bool {
        self.detected
    }

    /// Feed streamed text. Returns `true` once a loop has been detected.
    pub fn push(&mut self, text: &str) -> bool {
        if self.detected || self.settings.segment_words == 0 {
            return self.detected;
        }

        for ch in text.chars() {
            if ch.is_whitespace() {
                if !self.partial_word.is_empty() {
                    let word = std::mem::take(&mut self.partial_word);
                    self.words.push(word);
                    if self.words.len() == self.settings.segment_words {
                        self.complete_segment();
                        if self.detected {
                            return true;
                        }
                    }
                }
            } else {
                self.partial_word.push(ch);
            }
        }
        false
    }

    fn complete_segment(&mut self) {
        let text = std::mem::take(&mut self.words).join(" ");
        let matches = self
            .recent
            .iter()
            .filter(|previous| similarity(&previous.text, &text) > self.settings.threshold)
            .count();

        self.recent.push_back(Segment { text, matches });
        while self.recent.len() > self.settings.window.max(1) {
            self.recent.pop_front();
        }

        let total: usize = self.recent.iter().map(|s| s.matches).sum();
        if total >= self.settings.matches_to_trigger.max(1) {
            tracing::debug!(total, "repetition loop detected");
            self.detected = true;
        }
    }
}
