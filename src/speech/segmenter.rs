//! Incremental sentence extraction from the visible token stream.
//!
//! A boundary is a run of `.`, `!` or `?` (optionally followed by closing
//! quotes or brackets) followed by whitespace. A terminator at the very end
//! of the buffer is not a boundary yet, since the next chunk may continue it
//! (`3.` + `14`). Each recognized sentence takes the next index from a
//! counter that lives as long as the segmenter, so indices are never reused.

/// A sentence ready for synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceSegment {
    pub text: String,
    /// Strictly increasing, starting at 1.
    pub index: u64,
}

/// Streaming sentence segmenter.
#[derive(Debug)]
pub struct SentenceSegmenter {
    buffer: String,
    next_index: u64,
    min_chars: usize,
}

impl SentenceSegmenter {
    pub fn new(min_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            next_index: 1,
            min_chars,
        }
    }

    /// Append a chunk and return every sentence it completes.
    pub fn feed(&mut self, chunk: &str) -> Vec<SentenceSegment> {
        self.buffer.push_str(chunk);
        let mut sentences = Vec::new();

        while let Some(end) = find_boundary(&self.buffer) {
            let rest = self.buffer.split_off(end);
            let raw = std::mem::replace(&mut self.buffer, rest);
            let text = raw.trim();
            if self.accepts(text) {
                sentences.push(SentenceSegment {
                    text: text.to_owned(),
                    index: self.next_index,
                });
                self.next_index += 1;
            } else if !text.is_empty() {
                tracing::debug!(text, "sentence filtered");
            }
        }

        sentences
    }

    /// Discard the unterminated remainder. Returns what was dropped.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    /// Index the next sentence will receive.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Unterminated text currently buffered.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn accepts(&self, text: &str) -> bool {
        text.chars().count() >= self.min_chars && !is_annotation(text) && !is_bare_url(text)
    }
}

/// Byte offset just past the first sentence terminator (and closing
/// punctuation) that is followed by whitespace.
fn find_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        while let Some(&(_, next)) = chars.peek() {
            if matches!(next, '.' | '!' | '?' | '"' | '\'' | ')' | ']' | '\u{201d}' | '\u{2019}') {
                chars.next();
            } else {
                break;
            }
        }
        match chars.peek() {
            Some(&(i, next)) if next.is_whitespace() => return Some(i),
            Some(_) => {}
            None => return None,
        }
    }
    None
}

/// `[system: ...]`, `(pause)` and similar stage directions.
fn is_annotation(text: &str) -> bool {
    let body = text.trim_end_matches(['.', '!', '?']);
    (body.starts_with('[') && body.ends_with(']')) || (body.starts_with('(') && body.ends_with(')'))
}

fn is_bare_url(text: &str) -> bool {
    let body = text.trim_end_matches(['.', '!', '?']);
    !body.contains(char::is_whitespace)
        && (body.starts_with("http://") || body.starts_with("https://") || body.starts_with("www."))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn texts(sentences: &[SentenceSegment]) -> Vec<&str> {
        sentences.iter().map(|s| s.text.as_str()).collect()
    }

    #[test]
    fn emits_complete_sentences_only() {
        let mut seg = SentenceSegmenter::new(4);
        let out = seg.feed("Hello there. How are");
        assert_eq!(texts(&out), vec!["Hello there."]);
        assert_eq!(seg.pending(), " How are");
        let out = seg.feed(" you? Fine");
        assert_eq!(texts(&out), vec!["How are you?"]);
    }

    #[test]
    fn terminator_at_end_waits_for_more() {
        let mut seg = SentenceSegmenter::new(4);
        assert!(seg.feed("Pi is 3.").is_empty());
        let out = seg.feed("14 exactly. ");
        assert_eq!(texts(&out), vec!["Pi is 3.14 exactly."]);
    }

    #[test]
    fn indices_increase_across_feeds_and_flushes() {
        let mut seg = SentenceSegmenter::new(4);
        let a = seg.feed("First one. Second one! ");
        seg.flush();
        let b = seg.feed("Third one? ");
        let indices: Vec<u64> = a.iter().chain(b.iter()).map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(seg.next_index(), 4);
    }

    #[test]
    fn flush_discards_partial_sentence() {
        let mut seg = SentenceSegmenter::new(4);
        seg.feed("Unfinished thought");
        assert_eq!(seg.flush(), "Unfinished thought");
        let out = seg.feed(" continues. ");
        assert_eq!(texts(&out), vec!["continues."]);
    }

    #[test]
    fn punctuation_runs_and_closing_quotes() {
        let mut seg = SentenceSegmenter::new(4);
        let out = seg.feed("Really?! She said \"stop.\" Then left. ");
        assert_eq!(texts(&out), vec!["Really?!", "She said \"stop.\"", "Then left."]);
    }

    #[test]
    fn filters_short_annotations_and_urls() {
        let mut seg = SentenceSegmenter::new(4);
        let out = seg.feed(
            "Ok. [system: tool finished]. https://example.com/page. (laughs). Real sentence here. ",
        );
        assert_eq!(texts(&out), vec!["Real sentence here."]);
        assert_eq!(out[0].index, 1);
    }

    #[test]
    fn newlines_count_as_whitespace() {
        let mut seg = SentenceSegmenter::new(4);
        let out = seg.feed("Line one.\nLine two.\n");
        assert_eq!(texts(&out), vec!["Line one.", "Line two."]);
    }

    #[test]
    fn multibyte_text() {
        let mut seg = SentenceSegmenter::new(4);
        let out = seg.feed("Caf\u{e9} au lait? Tr\u{e8}s bien. ");
        assert_eq!(texts(&out), vec!["Caf\u{e9} au lait?", "Tr\u{e8}s bien."]);
    }
}
