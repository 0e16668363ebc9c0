//! Plain-text rendering of a streaming exchange.

use crate::cancel::InterruptAction;
use crate::generation::{GenerationOutcome, HaltReason, Region};
use crate::pipeline::Narrator;
use std::io::Write;

/// Writes narration to a terminal-like sink, marking reasoning regions.
pub struct TerminalNarrator<'a, W: Write + Send> {
    out: &'a mut W,
    region: Option<Region>,
}

impl<'a, W: Write + Send> TerminalNarrator<'a, W> {
    pub fn new(out: &'a mut W) -> Self {
        Self { out, region: None }
    }

    fn enter(&mut self, region: Region) {
        if self.region == Some(region) {
            return;
        }
        let _ = match (self.region, region) {
            (_, Region::Reasoning) => write!(self.out, "\n(thinking) "),
            (Some(Region::Reasoning), Region::Visible) => write!(self.out, "\n\n"),
            (_, Region::Visible) => Ok(()),
        };
        self.region = Some(region);
    }

    fn write(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
    }
}

impl<W: Write + Send> Narrator for TerminalNarrator<'_, W> {
    fn reasoning(&mut self, text: &str) {
        self.enter(Region::Reasoning);
        self.write(text);
    }

    fn visible(&mut self, text: &str) {
        self.enter(Region::Visible);
        self.write(text);
    }

    fn reclassified(&mut self, text: &str) {
        let chars = text.chars().count();
        self.write(&format!("\n(the previous {chars} characters were reasoning)\n"));
        self.region = Some(Region::Reasoning);
    }

    fn notice(&mut self, text: &str) {
        self.write(&format!("\n[{text}]"));
    }

    fn interrupted(&mut self, action: InterruptAction) {
        match action {
            InterruptAction::StopGeneration => {
                self.write("\n[interrupted: audio will finish, Ctrl+C again to hush]");
            }
            InterruptAction::Hush => self.write("\n[hushed]"),
            InterruptAction::Absorbed => {}
        }
    }

    fn finished(&mut self, outcome: &GenerationOutcome) {
        match &outcome.halt {
            HaltReason::Failed(e) => self.write(&format!("\n[generation failed: {e}]")),
            HaltReason::LoopDetected => self.write("\n[repetition detected, generation stopped]"),
            HaltReason::Completed | HaltReason::LengthExceeded | HaltReason::Interrupted => {}
        }
        self.write("\n");
        self.region = None;
    }
}
