//! Index-ordered audio playback.
//!
//! [`PlaybackQueue`] is the shared state between synthesis jobs (writers)
//! and the [`PlaybackCoordinator`] (the reader that advances the cursor).
//! Writers register an index when a sentence is dispatched and mark it ready
//! when its artifact exists. The coordinator only plays the entry at the
//! cursor, so a sentence that finishes synthesis early waits for every
//! earlier index to be played first.
//!
//! A failed synthesis leaves its entry unplayable and the coordinator stalls
//! on it until [`PlaybackQueue::reset`] (hush, `/clear`, or the next exchange).

use crate::config::PlaybackConfig;
use crate::error::{DeckError, Result};
use crate::runtime::RuntimeEvent;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Plays one audio artifact to completion.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Play `path`, returning early when `stop` fires.
    ///
    /// # Errors
    ///
    /// Returns [`DeckError::Playback`] when the player cannot be started or fails.
    async fn play(&self, path: &Path, stop: &CancellationToken) -> Result<()>;
}

/// Candidate players, tried in order when none is configured.
const PLAYER_CANDIDATES: &[(&str, &[&str])] = &[
    ("afplay", &[]),
    ("paplay", &[]),
    ("aplay", &["-q"]),
    ("ffplay", &["-nodisp", "-autoexit", "-loglevel", "quiet"]),
];

/// An external player program.
#[derive(Debug, Clone)]
pub struct CommandPlayer {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandPlayer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The configured player, or the first known player found on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`DeckError::Playback`] when no player can be found.
    pub fn from_config(config: &PlaybackConfig) -> Result<Self> {
        if let Some(player) = &config.player {
            let program = which::which(player)
                .map_err(|e| DeckError::Playback(format!("player {player}: {e}")))?;
            return Ok(Self::new(program, config.args.clone()));
        }
        for (name, default_args) in PLAYER_CANDIDATES {
            if let Ok(program) = which::which(name) {
                let mut args: Vec<String> = default_args.iter().map(|a| (*a).to_owned()).collect();
                args.extend(config.args.iter().cloned());
                info!(player = %program.display(), "audio player detected");
                return Ok(Self::new(program, args));
            }
        }
        Err(DeckError::Playback(
            "no audio player found (tried afplay, paplay, aplay, ffplay)".to_owned(),
        ))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl AudioPlayer for CommandPlayer {
    async fn play(&self, path: &Path, stop: &CancellationToken) -> Result<()> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeckError::Playback(format!("{}: {e}", self.program.display())))?;

        tokio::select! {
            _ = stop.cancelled() => {
                let _ = child.kill().await;
                Ok(())
            }
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(DeckError::Playback(format!("{} exited with {status}", self.program.display())))
                }
            }
        }
    }
}

/// State of one queued sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    /// Dispatched, synthesis in progress.
    Pending,
    /// Artifact ready to play.
    Ready(PathBuf),
    /// Every engine failed; never becomes playable.
    Failed,
}

#[derive(Debug)]
struct QueueState {
    entries: BTreeMap<u64, EntryState>,
    cursor: u64,
    highest: u64,
    stop: CancellationToken,
}

/// Index-keyed queue shared by dispatch and the coordinator.
#[derive(Debug)]
pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    changed: Notify,
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: BTreeMap::new(),
                cursor: 1,
                highest: 0,
                stop: CancellationToken::new(),
            }),
            changed: Notify::new(),
        }
    }
}

impl PlaybackQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a pending entry for a dispatched sentence.
    ///
    /// Returns `false` if the index is behind the cursor (already played or
    /// discarded by a reset).
    pub fn register(&self, index: u64) -> bool {
        let mut state = self.lock();
        if index < state.cursor {
            return false;
        }
        state.highest = state.highest.max(index);
        state.entries.entry(index).or_insert(EntryState::Pending);
        true
    }

    /// Attach a finished artifact. Returns `false` when the entry is gone
    /// (reset in the meantime); the caller then owns the file.
    pub fn mark_ready(&self, index: u64, path: PathBuf) -> bool {
        let accepted = {
            let mut state = self.lock();
            match state.entries.get_mut(&index) {
                Some(entry) => {
                    *entry = EntryState::Ready(path);
                    true
                }
                None => false,
            }
        };
        if accepted {
            self.changed.notify_one();
        }
        accepted
    }

    /// Record that synthesis failed for `index`.
    pub fn mark_failed(&self, index: u64) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(&index) {
            *entry = EntryState::Failed;
        }
    }

    /// The ready entry at the cursor, with the token that stops its playback.
    pub fn next_ready(&self) -> Option<(u64, PathBuf, CancellationToken)> {
        let state = self.lock();
        match state.entries.get(&state.cursor) {
            Some(EntryState::Ready(path)) => Some((state.cursor, path.clone(), state.stop.child_token())),
            _ => None,
        }
    }

    /// Remove the played entry at `index` and advance the cursor past it.
    /// A no-op when a reset moved the cursor in the meantime.
    pub fn complete(&self, index: u64) {
        let mut state = self.lock();
        if state.cursor == index {
            state.entries.remove(&index);
            state.cursor += 1;
        }
    }

    /// Index the coordinator is waiting on, if an entry exists for it.
    pub fn waiting_on(&self) -> Option<(u64, EntryState)> {
        let state = self.lock();
        state
            .entries
            .get(&state.cursor)
            .map(|entry| (state.cursor, entry.clone()))
    }

    /// Whether the cursor is blocked on a failed synthesis.
    pub fn is_stalled_on_failure(&self) -> bool {
        matches!(self.waiting_on(), Some((_, EntryState::Failed)))
    }

    pub fn cursor(&self) -> u64 {
        self.lock().cursor
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, stop current playback and move the cursor past
    /// everything dispatched so far. Ready artifacts are deleted.
    pub fn reset(&self) -> usize {
        let (paths, cleared) = {
            let mut state = self.lock();
            let cleared = state.entries.len();
            let paths: Vec<PathBuf> = std::mem::take(&mut state.entries)
                .into_values()
                .filter_map(|entry| match entry {
                    EntryState::Ready(path) => Some(path),
                    _ => None,
                })
                .collect();
            state.cursor = state.cursor.max(state.highest + 1);
            state.stop.cancel();
            state.stop = CancellationToken::new();
            (paths, cleared)
        };
        for path in paths {
            let _ = std::fs::remove_file(&path);
        }
        self.changed.notify_one();
        debug!(cleared, "playback queue reset");
        cleared
    }

    /// Wait until something changes or `timeout` elapses.
    pub async fn wait_for_change(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.changed.notified()).await;
    }

    /// Wait until every queued entry has been played or discarded.
    pub async fn wait_drained(&self, poll: Duration) {
        while !self.is_empty() {
            tokio::time::sleep(poll).await;
        }
    }
}

/// Plays queued artifacts strictly in index order.
pub struct PlaybackCoordinator {
    queue: Arc<PlaybackQueue>,
    player: Arc<dyn AudioPlayer>,
    poll_interval: Duration,
    stall_warning: Duration,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
}

impl PlaybackCoordinator {
    pub fn new(queue: Arc<PlaybackQueue>, player: Arc<dyn AudioPlayer>, config: &PlaybackConfig) -> Self {
        Self {
            queue,
            player,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            stall_warning: Duration::from_secs(config.stall_warning_secs),
            runtime_tx: None,
        }
    }

    pub fn with_runtime_events(mut self, tx: broadcast::Sender<RuntimeEvent>) -> Self {
        self.runtime_tx = Some(tx);
        self
    }

    fn emit(&self, event: RuntimeEvent) {
        if let Some(tx) = &self.runtime_tx {
            let _ = tx.send(event);
        }
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut stalled: Option<(u64, Instant, bool)> = None;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Some((index, path, stop)) = self.queue.next_ready() {
                stalled = None;
                debug!(index, path = %path.display(), "playing sentence");
                self.emit(RuntimeEvent::PlaybackStarted { index });

                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = self.player.play(&path, &stop) => result,
                };
                if let Err(e) = result {
                    warn!(index, error = %e, "playback failed");
                }
                let _ = tokio::fs::remove_file(&path).await;
                self.queue.complete(index);
                self.emit(RuntimeEvent::PlaybackFinished {
                    index,
                    interrupted: stop.is_cancelled(),
                });
                continue;
            }

            match self.queue.waiting_on() {
                Some((index, _)) => {
                    let (since, warned) = match stalled {
                        Some((stalled_index, since, warned)) if stalled_index == index => (since, warned),
                        _ => (Instant::now(), false),
                    };
                    let waited = since.elapsed();
                    let warn_now = !warned && !self.stall_warning.is_zero() && waited >= self.stall_warning;
                    if warn_now {
                        warn!(index, waited_secs = waited.as_secs(), "playback stalled waiting for sentence");
                        self.emit(RuntimeEvent::PlaybackStalled {
                            index,
                            waited_secs: waited.as_secs(),
                        });
                    }
                    stalled = Some((index, since, warned || warn_now));
                }
                None => stalled = None,
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue.wait_for_change(self.poll_interval) => {}
            }
        }
        debug!("playback coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    /// Player that records indices (parsed from file names) instantly.
    #[derive(Default)]
    struct RecordingPlayer {
        played: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AudioPlayer for RecordingPlayer {
        async fn play(&self, path: &Path, _stop: &CancellationToken) -> Result<()> {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            self.played.lock().unwrap().push(name);
            Ok(())
        }
    }

    fn artifact(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"RIFF").unwrap();
        path
    }

    fn config() -> PlaybackConfig {
        PlaybackConfig {
            poll_interval_ms: 5,
            stall_warning_secs: 0,
            ..PlaybackConfig::default()
        }
    }

    // ── PlaybackQueue ────────────────────────────────────────────

    #[test]
    fn only_cursor_entry_is_playable() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PlaybackQueue::new();
        for i in 1..=3 {
            assert!(queue.register(i));
        }
        assert!(queue.mark_ready(3, artifact(dir.path(), "3")));
        assert!(queue.next_ready().is_none());
        assert_eq!(queue.waiting_on().unwrap(), (1, EntryState::Pending));

        queue.mark_ready(1, artifact(dir.path(), "1"));
        let (index, _, _) = queue.next_ready().unwrap();
        assert_eq!(index, 1);
        queue.complete(1);
        assert_eq!(queue.cursor(), 2);
        assert!(queue.next_ready().is_none());
    }

    #[test]
    fn complete_never_double_advances() {
        let queue = PlaybackQueue::new();
        queue.register(1);
        queue.complete(1);
        queue.complete(1);
        assert_eq!(queue.cursor(), 2);
    }

    #[test]
    fn reset_clears_entries_and_skips_cursor_forward() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PlaybackQueue::new();
        for i in 1..=4 {
            queue.register(i);
        }
        let ready = artifact(dir.path(), "2");
        queue.mark_ready(2, ready.clone());

        assert_eq!(queue.reset(), 4);
        assert!(queue.is_empty());
        assert_eq!(queue.cursor(), 5);
        assert!(!ready.exists());

        // Late results for discarded indices are refused.
        assert!(!queue.mark_ready(3, artifact(dir.path(), "3")));
        assert!(!queue.register(4));
        assert!(queue.register(5));
    }

    #[test]
    fn reset_stops_current_playback() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PlaybackQueue::new();
        queue.register(1);
        queue.mark_ready(1, artifact(dir.path(), "1"));
        let (_, _, stop) = queue.next_ready().unwrap();
        assert!(!stop.is_cancelled());
        queue.reset();
        assert!(stop.is_cancelled());
        // The in-flight completion does not move the new cursor.
        queue.complete(1);
        assert_eq!(queue.cursor(), 2);
    }

    #[test]
    fn failed_entry_stalls() {
        let queue = PlaybackQueue::new();
        queue.register(1);
        queue.register(2);
        queue.mark_failed(1);
        assert!(queue.is_stalled_on_failure());
        assert!(queue.next_ready().is_none());
    }

    // ── PlaybackCoordinator ──────────────────────────────────────

    #[tokio::test]
    async fn plays_in_index_order_despite_completion_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PlaybackQueue::new();
        let player = Arc::new(RecordingPlayer::default());
        let shutdown = CancellationToken::new();
        let coordinator = PlaybackCoordinator::new(queue.clone(), player.clone(), &config());
        let task = tokio::spawn(coordinator.run(shutdown.clone()));

        for i in 1..=3 {
            queue.register(i);
        }
        for i in [3u64, 1, 2] {
            queue.mark_ready(i, artifact(dir.path(), &i.to_string()));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tokio::time::timeout(Duration::from_secs(2), queue.wait_drained(Duration::from_millis(5)))
            .await
            .unwrap();
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(*player.played.lock().unwrap(), vec!["1", "2", "3"]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stall_warning_is_emitted_once() {
        let queue = PlaybackQueue::new();
        let (tx, mut rx) = broadcast::channel(16);
        let shutdown = CancellationToken::new();
        let mut cfg = config();
        cfg.stall_warning_secs = 1;
        let coordinator = PlaybackCoordinator::new(queue.clone(), Arc::new(RecordingPlayer::default()), &cfg)
            .with_runtime_events(tx);
        let task = tokio::spawn(coordinator.run(shutdown.clone()));
        queue.register(1);
        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown.cancel();
        task.await.unwrap();

        let mut stalls = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RuntimeEvent::PlaybackStalled { index, .. } = event {
                stalls.push(index);
            }
        }
        assert_eq!(stalls, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_threshold_disables_stall_warning() {
        let queue = PlaybackQueue::new();
        let (tx, mut rx) = broadcast::channel(16);
        let shutdown = CancellationToken::new();
        let coordinator = PlaybackCoordinator::new(queue.clone(), Arc::new(RecordingPlayer::default()), &config())
            .with_runtime_events(tx);
        let task = tokio::spawn(coordinator.run(shutdown.clone()));
        queue.register(1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        shutdown.cancel();
        task.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
