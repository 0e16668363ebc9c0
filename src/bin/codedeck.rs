//! codedeck: streaming chat console with endpoint failover and spoken replies.

use clap::Parser;
use codedeck::cancel::{CancellationController, spawn_signal_listener};
use codedeck::config::DeckConfig;
use codedeck::console::Console;
use codedeck::generation::{GenerationProcessor, OpenAiBackend};
use codedeck::logging::{self, LogTarget};
use codedeck::mood::{MoodBook, moods_dir};
use codedeck::pipeline::Pipeline;
use codedeck::routing::{HealthMonitor, HttpProber};
use codedeck::session::ChatSession;
use codedeck::speech::{CommandPlayer, EngineChain, PlaybackCoordinator, PlaybackQueue, SpeechDispatcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Streaming chat console with endpoint failover and spoken replies.
#[derive(Parser)]
#[command(name = "codedeck", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write logs to stderr instead of the daily log file.
    #[arg(long)]
    log_stderr: bool,

    /// Start with speech output disabled.
    #[arg(long)]
    mute: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(DeckConfig::default_config_path);
    let config = DeckConfig::load_or_default(&config_path)?;
    let _log_guard = logging::init(&config.logging, &LogTarget::from_config(&config.logging, cli.log_stderr))?;
    info!(config = %config_path.display(), "codedeck starting");

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let result = runtime.block_on(run(cli, config, config_path));
    // Stdin is read on a blocking thread that only returns on the next line.
    runtime.shutdown_timeout(Duration::from_millis(250));
    result
}

async fn run(cli: Cli, config: DeckConfig, config_path: PathBuf) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let (runtime_tx, mut runtime_rx) = broadcast::channel(64);

    // Routing
    let prober = Arc::new(HttpProber::new(Duration::from_secs(config.endpoints.probe_timeout_secs)));
    let (monitor, route) = HealthMonitor::new(&config.endpoints, prober);
    let monitor_task = tokio::spawn(monitor.with_runtime_events(runtime_tx.clone()).run(shutdown.clone()));

    // Speech
    let chain = Arc::new(EngineChain::from_config(&config.speech));
    let queue = PlaybackQueue::new();
    let player = if chain.is_empty() {
        warn!("no speech engine available, speech disabled");
        None
    } else {
        match CommandPlayer::from_config(&config.playback) {
            Ok(player) => Some(player),
            Err(e) => {
                warn!(error = %e, "speech disabled");
                None
            }
        }
    };
    let mut dispatcher =
        SpeechDispatcher::new(Arc::clone(&chain), Arc::clone(&queue)).with_runtime_events(runtime_tx.clone());
    let coordinator_task = match player {
        Some(player) => {
            let coordinator = PlaybackCoordinator::new(Arc::clone(&queue), Arc::new(player), &config.playback)
                .with_runtime_events(runtime_tx.clone());
            Some(tokio::spawn(coordinator.run(shutdown.clone())))
        }
        None => {
            dispatcher = dispatcher.without_playback();
            None
        }
    };
    let dispatcher = Arc::new(dispatcher);
    let audio_available = dispatcher.can_speak();

    // Generation
    let controller = Arc::new(CancellationController::new(
        Arc::clone(&dispatcher),
        Duration::from_millis(config.cancellation.grace_period_ms),
    ));
    let backend = Arc::new(OpenAiBackend::new(Duration::from_secs(config.generation.request_timeout_secs)));
    let processor = GenerationProcessor::new(backend, config.generation.clone());
    let pipeline = Pipeline::new(
        processor,
        route,
        dispatcher,
        controller,
        config.speech.min_sentence_chars,
    )
    .with_drain_poll(Duration::from_millis(config.playback.poll_interval_ms.max(1)));

    // Session
    let moods = MoodBook::load(&moods_dir());
    let mood = moods.get(&config.generation.mood);
    if mood.is_none() {
        warn!(mood = %config.generation.mood, "unknown mood, using configured defaults");
    }
    let mut session = ChatSession::new(&config.generation, &config.speech, mood);
    session.audio_enabled = session.audio_enabled && audio_available && !cli.mute;

    let (interrupt_tx, mut interrupts) = mpsc::unbounded_channel();
    let signal_task = spawn_signal_listener(interrupt_tx, shutdown.clone());

    let mut console = Console::new(config, config_path, session, moods, pipeline, std::io::stdout());
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let result = console.run(stdin, &mut interrupts, &mut runtime_rx).await;

    shutdown.cancel();
    let _ = monitor_task.await;
    let _ = signal_task.await;
    if let Some(task) = coordinator_task {
        let _ = task.await;
    }
    info!("codedeck stopped");
    result.map_err(Into::into)
}
