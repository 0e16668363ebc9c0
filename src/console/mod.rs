//! Line-oriented command loop.
//!
//! Reads stdin lines, runs chat exchanges through the [`Pipeline`], answers
//! slash commands and prints route announcements as they arrive. Interrupts
//! received at the prompt go to the cancellation controller too, so a
//! second Ctrl+C after an interrupted exchange still hushes the audio.

pub mod commands;
pub mod narrator;

pub use commands::{Command, HELP, Input, parse_input};
pub use narrator::TerminalNarrator;

use crate::config::DeckConfig;
use crate::error::{DeckError, Result};
use crate::mood::MoodBook;
use crate::pipeline::Pipeline;
use crate::routing::{ActiveRoute, RouteStatus};
use crate::runtime::RuntimeEvent;
use crate::session::ChatSession;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Whether the loop should keep going after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Interactive console state.
pub struct Console<W: Write + Send> {
    config: DeckConfig,
    config_path: PathBuf,
    session: ChatSession,
    moods: MoodBook,
    pipeline: Pipeline,
    out: W,
}

impl<W: Write + Send> Console<W> {
    pub fn new(
        config: DeckConfig,
        config_path: PathBuf,
        session: ChatSession,
        moods: MoodBook,
        pipeline: Pipeline,
        out: W,
    ) -> Self {
        Self {
            config,
            config_path,
            session,
            moods,
            pipeline,
            out,
        }
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    /// Run until `/quit` or end of input.
    ///
    /// # Errors
    ///
    /// Returns [`DeckError::Io`] when stdin or stdout fails.
    pub async fn run<R: AsyncBufRead + Unpin>(
        &mut self,
        input: R,
        interrupts: &mut mpsc::UnboundedReceiver<()>,
        events: &mut broadcast::Receiver<RuntimeEvent>,
    ) -> Result<()> {
        let mut lines = input.lines();
        let mut events_open = true;
        writeln!(self.out, "codedeck {} - /help for commands", env!("CARGO_PKG_VERSION"))?;

        loop {
            self.prompt()?;
            let line = loop {
                tokio::select! {
                    line = lines.next_line() => break line?,
                    Some(()) = interrupts.recv() => {
                        let action = self.pipeline.controller().interrupt();
                        info!(?action, "interrupt at prompt");
                        if action == crate::cancel::InterruptAction::Hush {
                            writeln!(self.out, "\n[hushed]")?;
                            self.prompt()?;
                        }
                    }
                    event = events.recv(), if events_open => match event {
                        Ok(event) => {
                            if self.render_event(&event)? {
                                self.prompt()?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "runtime events lagged"),
                        Err(broadcast::error::RecvError::Closed) => events_open = false,
                    },
                }
            };

            let Some(line) = line else {
                writeln!(self.out)?;
                break;
            };
            if self.handle_line(&line, interrupts).await? == Flow::Quit {
                break;
            }
            while let Ok(event) = events.try_recv() {
                self.render_event(&event)?;
            }
        }

        self.pipeline.hush();
        Ok(())
    }

    fn prompt(&mut self) -> Result<()> {
        write!(self.out, "> ")?;
        self.out.flush()?;
        Ok(())
    }

    /// Print an event worth showing. Returns whether anything was printed.
    fn render_event(&mut self, event: &RuntimeEvent) -> Result<bool> {
        match event {
            RuntimeEvent::RouteStatus { status, route } => {
                writeln!(self.out, "\n{}", announcement(*status, route.as_ref()))?;
                Ok(true)
            }
            RuntimeEvent::SynthesisFailed { index, .. } => {
                writeln!(self.out, "\n[no audio for sentence {index}]")?;
                Ok(true)
            }
            RuntimeEvent::PlaybackStalled { index, waited_secs } => {
                writeln!(self.out, "\n[audio waiting on sentence {index} for {waited_secs}s, /hush to skip]")?;
                Ok(true)
            }
            RuntimeEvent::PlaybackStarted { .. } | RuntimeEvent::PlaybackFinished { .. } => Ok(false),
        }
    }

    async fn handle_line(&mut self, line: &str, interrupts: &mut mpsc::UnboundedReceiver<()>) -> Result<Flow> {
        match parse_input(line) {
            Input::Empty => {}
            Input::Invalid(usage) => writeln!(self.out, "{usage}")?,
            Input::Chat(text) => self.chat(&text, interrupts).await?,
            Input::Command(command) => return self.command(command).await,
        }
        Ok(Flow::Continue)
    }

    async fn chat(&mut self, text: &str, interrupts: &mut mpsc::UnboundedReceiver<()>) -> Result<()> {
        let mut narrator = TerminalNarrator::new(&mut self.out);
        match self
            .pipeline
            .run_exchange(&mut self.session, text, &mut narrator, interrupts)
            .await
        {
            Ok(_) => Ok(()),
            Err(DeckError::Routing(reason)) => {
                writeln!(self.out, "[{reason}]")?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn command(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::Status => self.status()?,
            Command::History => {
                if self.session.history().is_empty() {
                    writeln!(self.out, "(no history)")?;
                }
                for message in self.session.history() {
                    writeln!(self.out, "{}: {}", message.role, message.content.trim())?;
                }
            }
            Command::Clear => {
                self.session.clear();
                self.pipeline.hush();
                writeln!(self.out, "history cleared")?;
            }
            Command::Endpoints => self.endpoints()?,
            Command::SelectEndpoint(selection) => {
                match self.pipeline.route().select_endpoint(selection).await {
                    Ok(route) => writeln!(self.out, "routing to {} ({})", route.endpoint, route.model)?,
                    Err(e) => writeln!(self.out, "{e}")?,
                }
            }
            Command::Models => match self.pipeline.route().list_models().await {
                Ok(models) => {
                    let current = self.pipeline.route().route().map(|r| r.model);
                    for (i, model) in models.iter().enumerate() {
                        let mark = if current.as_deref() == Some(model.as_str()) { "*" } else { " " };
                        writeln!(self.out, "{mark} {}. {model}", i + 1)?;
                    }
                }
                Err(e) => writeln!(self.out, "{e}")?,
            },
            Command::SelectModel(selection) => {
                match self.pipeline.route().select_model(selection).await {
                    Ok(route) => writeln!(self.out, "model {} on {}", route.model, route.endpoint)?,
                    Err(e) => writeln!(self.out, "{e}")?,
                }
            }
            Command::Context(None) => {
                writeln!(self.out, "context: {} pairs", self.session.context_length())?;
            }
            Command::Context(Some(pairs)) => {
                self.session.set_context_length(pairs);
                writeln!(self.out, "context: {pairs} pairs")?;
            }
            Command::Mood(None) => {
                for mood in self.moods.iter() {
                    let mark = if mood.name == self.session.mood { "*" } else { " " };
                    writeln!(self.out, "{mark} {:<12} {}", mood.name, mood.description)?;
                }
            }
            Command::Mood(Some(name)) => match self.moods.get(&name) {
                Some(mood) => {
                    self.session.apply_mood(mood);
                    writeln!(self.out, "mood: {name}")?;
                }
                None => writeln!(self.out, "unknown mood '{name}' (try: {})", self.moods.names().join(", "))?,
            },
            Command::Voice(None) => writeln!(self.out, "voice: {}", self.session.voice)?,
            Command::Voice(Some(voice)) => {
                self.session.voice = voice;
                writeln!(self.out, "voice: {}", self.session.voice)?;
            }
            Command::Audio(None) => writeln!(self.out, "audio: {}", on_off(self.session.audio_enabled))?,
            Command::Audio(Some(true)) if !self.pipeline.dispatcher().can_speak() => {
                self.session.audio_enabled = false;
                writeln!(self.out, "(speech unavailable: no engine or audio player)")?;
                writeln!(self.out, "audio: off")?;
            }
            Command::Audio(Some(enabled)) => {
                self.session.audio_enabled = enabled;
                if !enabled {
                    self.pipeline.hush();
                }
                writeln!(self.out, "audio: {}", on_off(enabled))?;
            }
            Command::Temperature(None) => writeln!(self.out, "temperature: {}", self.session.temperature)?,
            Command::Temperature(Some(t)) => {
                self.session.temperature = t;
                writeln!(self.out, "temperature: {t}")?;
            }
            Command::Hush => {
                let cleared = self.pipeline.hush();
                writeln!(self.out, "hushed ({cleared} queued)")?;
            }
            Command::Save => self.save()?,
            Command::Help => writeln!(self.out, "{HELP}")?,
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    fn status(&mut self) -> Result<()> {
        let route = self.pipeline.route().clone();
        let active = route.route();
        writeln!(self.out, "{}", announcement(route.status(), active.as_ref()))?;
        if let Some(target) = route.target().filter(|t| t.fallback) {
            writeln!(self.out, "  local fallback: {} ({})", target.url, target.model)?;
        }
        self.endpoints()?;
        let queue = self.pipeline.dispatcher().queue();
        writeln!(
            self.out,
            "  context {} pairs, temperature {}, mood {}, voice {}, audio {}",
            self.session.context_length(),
            self.session.temperature,
            self.session.mood,
            self.session.voice,
            on_off(self.session.audio_enabled),
        )?;
        writeln!(
            self.out,
            "  {}, {} queued sentences",
            self.pipeline.controller().state(),
            queue.len()
        )?;
        Ok(())
    }

    fn endpoints(&mut self) -> Result<()> {
        let route = self.pipeline.route();
        let active = route.route().map(|r| r.endpoint);
        let endpoints = route.endpoints();
        if endpoints.is_empty() {
            writeln!(self.out, "  (no endpoints configured)")?;
        }
        for (i, endpoint) in endpoints.iter().enumerate() {
            let mark = if active.as_deref() == Some(endpoint.url.as_str()) { "*" } else { " " };
            let checked = endpoint
                .last_checked
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_owned());
            writeln!(
                self.out,
                "{mark} {}. {} [{}, checked {checked}]",
                i + 1,
                endpoint.url,
                endpoint.reachability
            )?;
        }
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        self.config.generation.context_length = self.session.context_length();
        self.config.generation.temperature = self.session.temperature;
        self.config.generation.mood = self.session.mood.clone();
        self.config.speech.voice = self.session.voice.clone();
        self.config.speech.enabled = self.session.audio_enabled;
        match self.config.save_to_file(&self.config_path) {
            Ok(()) => writeln!(self.out, "saved {}", self.config_path.display())?,
            Err(e) => writeln!(self.out, "save failed: {e}")?,
        }
        Ok(())
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

/// One-line status announcement.
pub fn announcement(status: RouteStatus, route: Option<&ActiveRoute>) -> String {
    match (status, route) {
        (RouteStatus::Connected, Some(route)) => format!("[connected] {} ({})", route.endpoint, route.model),
        (RouteStatus::Connected, None) => "[connected]".to_owned(),
        (RouteStatus::Fallback, _) => "[fallback] no remote endpoint, using local backend".to_owned(),
        (RouteStatus::Disconnected, _) => "[disconnected] no endpoint reachable".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::cancel::CancellationController;
    use crate::config::LocalFallbackConfig;
    use crate::generation::{ChatBackend, ChatRequest, GenerationProcessor, TokenStream};
    use crate::routing::{HealthMonitor, HttpProber};
    use crate::speech::{EngineChain, PlaybackQueue, SpeechDispatcher, SpeechEngine};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct EchoBackend;

    #[async_trait]
    impl ChatBackend for EchoBackend {
        async fn stream_chat(&self, _url: &str, request: &ChatRequest) -> Result<TokenStream> {
            let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            let reply = format!("You said {last}.");
            Ok(Box::pin(stream::iter(vec![Ok::<_, DeckError>(reply)])))
        }
    }

    struct SilentEngine;

    #[async_trait]
    impl SpeechEngine for SilentEngine {
        fn name(&self) -> &str {
            "silent"
        }

        async fn synthesize(&self, _text: &str, _voice: &str, out: &Path, _cancel: &CancellationToken) -> Result<()> {
            tokio::fs::write(out, b"RIFF").await?;
            Ok(())
        }
    }

    fn console(dir: &Path) -> Console<Vec<u8>> {
        let chain = Arc::new(EngineChain::new(Vec::new(), dir));
        console_with(dir, SpeechDispatcher::new(chain, PlaybackQueue::new()))
    }

    fn console_with(dir: &Path, dispatcher: SpeechDispatcher) -> Console<Vec<u8>> {
        let mut config = DeckConfig::default();
        config.endpoints.local_fallback = Some(LocalFallbackConfig {
            url: "http://127.0.0.1:9".to_owned(),
            model: "local".to_owned(),
        });
        let (_monitor, route) =
            HealthMonitor::new(&config.endpoints, Arc::new(HttpProber::new(Duration::from_millis(50))));
        let dispatcher = Arc::new(dispatcher);
        let controller = Arc::new(CancellationController::new(
            Arc::clone(&dispatcher),
            Duration::from_millis(50),
        ));
        let processor = GenerationProcessor::new(Arc::new(EchoBackend), config.generation.clone());
        let pipeline = Pipeline::new(processor, route, dispatcher, controller, 4);
        let moods = MoodBook::default();
        let session = ChatSession::new(&config.generation, &config.speech, moods.get("assistant"));
        Console::new(config, dir.join("config.toml"), session, moods, pipeline, Vec::new())
    }

    async fn run_script(console: &mut Console<Vec<u8>>, script: &str) -> String {
        let (_tx, mut interrupts) = mpsc::unbounded_channel();
        let (_events_tx, mut events) = broadcast::channel(8);
        console
            .run(script.as_bytes(), &mut interrupts, &mut events)
            .await
            .unwrap();
        String::from_utf8(console.output().clone()).unwrap()
    }

    #[tokio::test]
    async fn chat_then_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = console(dir.path());
        let out = run_script(&mut c, "hello\n/history\n/quit\n").await;
        assert!(out.contains("You said hello."));
        assert!(out.contains("user: hello"));
        assert!(out.contains("assistant: You said hello."));
        assert_eq!(c.session().history().len(), 2);
    }

    #[tokio::test]
    async fn context_change_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = console(dir.path());
        run_script(&mut c, "one\ntwo\n/context 0\n").await;
        assert_eq!(c.session().context_length(), 0);
        assert_eq!(c.session().history().len(), 4);
        assert_eq!(c.session().build_messages("three").len(), 2);
    }

    #[tokio::test]
    async fn mood_switch_and_unknown_mood() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = console(dir.path());
        let out = run_script(&mut c, "/mood coder\n/mood pirate\n").await;
        assert_eq!(c.session().mood, "coder");
        assert!(out.contains("unknown mood 'pirate'"));
    }

    #[tokio::test]
    async fn save_persists_session_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = console(dir.path());
        run_script(&mut c, "/voice alba\n/audio off\n/context 2\n/save\n").await;
        let saved = DeckConfig::from_file(&dir.path().join("config.toml")).unwrap();
        assert_eq!(saved.speech.voice, "alba");
        assert!(!saved.speech.enabled);
        assert_eq!(saved.generation.context_length, 2);
    }

    #[tokio::test]
    async fn status_shows_fallback_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = console(dir.path());
        let out = run_script(&mut c, "/status\n").await;
        assert!(out.contains("[fallback]"));
        assert!(out.contains("local fallback: http://127.0.0.1:9 (local)"));
        assert!(out.contains("idle, 0 queued sentences"));
    }

    #[tokio::test]
    async fn audio_stays_off_without_a_player() {
        let dir = tempfile::tempdir().unwrap();
        let engines: Vec<Arc<dyn SpeechEngine>> = vec![Arc::new(SilentEngine)];
        let chain = Arc::new(EngineChain::new(engines, dir.path()));
        let dispatcher = SpeechDispatcher::new(chain, PlaybackQueue::new()).without_playback();
        let mut c = console_with(dir.path(), dispatcher);
        c.session.audio_enabled = false;

        let out = run_script(&mut c, "/audio on\nhi\nagain\n/status\n").await;

        assert!(out.contains("speech unavailable"));
        assert!(!c.session().audio_enabled);
        assert_eq!(c.session().history().len(), 4);
        assert!(out.contains("idle, 0 queued sentences"));
    }

    #[test]
    fn announcements() {
        let route = ActiveRoute {
            endpoint: "http://gpu:8080".to_owned(),
            model: "qwen".to_owned(),
            priority: 0,
            pinned: false,
        };
        assert_eq!(
            announcement(RouteStatus::Connected, Some(&route)),
            "[connected] http://gpu:8080 (qwen)"
        );
        assert!(announcement(RouteStatus::Disconnected, None).starts_with("[disconnected]"));
    }
}
