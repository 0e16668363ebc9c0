//! Single-pass reasoning/visible classification of a token stream.
//!
//! The classifier counts reasoning-open and reasoning-close markers seen so
//! far; text is reasoning whenever opens exceed closes. Tokens containing a
//! marker are split at the marker, and a marker split across tokens is held
//! back until it can be recognized. Markers themselves are never emitted.
//!
//! A close marker with no matching open means the model started reasoning
//! without announcing it (common when the chat template injects the open
//! marker). The first such close per generation is treated as if reasoning
//! began at the start of the output: already-emitted visible text is handed
//! back as [`Classified::reclassified`] and an open is assumed.

/// Which region a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Reasoning,
    Visible,
}

/// A run of text in a single region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub region: Region,
    pub text: String,
}

impl Fragment {
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            region: Region::Reasoning,
            text: text.into(),
        }
    }

    pub fn visible(text: impl Into<String>) -> Self {
        Self {
            region: Region::Visible,
            text: text.into(),
        }
    }
}

/// Output of classifying one token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    pub fragments: Vec<Fragment>,
    /// Previously emitted visible text that turned out to be reasoning.
    /// Set only on the token where the orphaned close was handled.
    pub reclassified: Option<String>,
}

impl Classified {
    fn push(&mut self, region: Region, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.fragments.last_mut() {
            Some(last) if last.region == region => last.text.push_str(text),
            _ => self.fragments.push(Fragment {
                region,
                text: text.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Open,
    Close,
}

/// Streaming reasoning-marker classifier for one generation.
#[derive(Debug, Clone)]
pub struct ReasoningClassifier {
    open: String,
    close: String,
    opens: usize,
    closes: usize,
    orphan_handled: bool,
    held: String,
    visible_so_far: String,
}

impl ReasoningClassifier {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
            opens: 0,
            closes: 0,
            orphan_handled: false,
            held: String::new(),
            visible_so_far: String::new(),
        }
    }

    /// Whether text arriving now would be classified as reasoning.
    pub fn in_reasoning(&self) -> bool {
        self.opens > self.closes
    }

    /// Whether the orphaned-close case has fired in this generation.
    pub fn orphan_handled(&self) -> bool {
        self.orphan_handled
    }

    pub fn opens(&self) -> usize {
        self.opens
    }

    pub fn closes(&self) -> usize {
        self.closes
    }

    /// Classify one token.
    pub fn feed(&mut self, token: &str) -> Classified {
        let mut out = Classified::default();
        let mut pending = std::mem::take(&mut self.held);
        pending.push_str(token);

        let mut rest = pending.as_str();
        while let Some((pos, marker)) = self.next_marker(rest) {
            self.emit(&mut out, &rest[..pos]);
            let len = match marker {
                Marker::Open => self.open.len(),
                Marker::Close => self.close.len(),
            };
            rest = &rest[pos + len..];
            self.apply(marker, &mut out);
        }

        let keep = self.partial_marker_suffix(rest);
        let (emit_now, hold) = rest.split_at(rest.len() - keep);
        self.emit(&mut out, emit_now);
        self.held = hold.to_owned();
        out
    }

    /// End of stream: release any held-back partial marker as plain text.
    pub fn flush(&mut self) -> Classified {
        let mut out = Classified::default();
        let held = std::mem::take(&mut self.held);
        self.emit(&mut out, &held);
        out
    }

    fn emit(&mut self, out: &mut Classified, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.in_reasoning() {
            out.push(Region::Reasoning, text);
        } else {
            self.visible_so_far.push_str(text);
            out.push(Region::Visible, text);
        }
    }

    fn apply(&mut self, marker: Marker, out: &mut Classified) {
        match marker {
            Marker::Open => self.opens += 1,
            Marker::Close => {
                self.closes += 1;
                if self.closes > self.opens && !self.orphan_handled {
                    self.orphan_handled = true;
                    self.opens += 1;
                    self.reclassify(out);
                }
            }
        }
    }

    /// Move everything emitted as visible so far (including earlier
    /// fragments of this token) into the reasoning region.
    fn reclassify(&mut self, out: &mut Classified) {
        let mut earlier = std::mem::take(&mut self.visible_so_far);
        let mut in_token = String::new();
        for fragment in &mut out.fragments {
            if fragment.region == Region::Visible {
                in_token.push_str(&fragment.text);
                fragment.region = Region::Reasoning;
            }
        }
        out.fragments.dedup_by(|b, a| {
            if a.region == b.region {
                a.text.push_str(&b.text);
                true
            } else {
                false
            }
        });

        let emitted_before = earlier.len().saturating_sub(in_token.len());
        earlier.truncate(emitted_before);
        if !earlier.is_empty() {
            out.reclassified = Some(earlier);
        }
    }

    fn next_marker(&self, text: &str) -> Option<(usize, Marker)> {
        let open = find_marker(text, &self.open).map(|p| (p, Marker::Open));
        let close = find_marker(text, &self.close).map(|p| (p, Marker::Close));
        match (open, close) {
            (Some(o), Some(c)) => Some(if o.0 <= c.0 { o } else { c }),
            (o, c) => o.or(c),
        }
    }

    /// Length of the longest suffix of `text` that could begin a marker.
    fn partial_marker_suffix(&self, text: &str) -> usize {
        let longest = self.open.len().max(self.close.len());
        (1..longest.min(text.len() + 1))
            .rev()
            .filter(|n| text.is_char_boundary(text.len() - n))
            .find(|n| {
                let tail = &text[text.len() - n..];
                self.open.starts_with(tail) || self.close.starts_with(tail)
            })
            .unwrap_or(0)
    }
}

fn find_marker(text: &str, marker: &str) -> Option<usize> {
    if marker.is_empty() {
        None
    } else {
        text.find(marker)
    }
}
