//! Configuration types for the chat console.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the console.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeckConfig {
    /// Candidate inference endpoints and health monitoring.
    pub endpoints: EndpointsConfig,
    /// Generation request and stream-processing settings.
    pub generation: GenerationConfig,
    /// Sentence-to-speech settings.
    pub speech: SpeechConfig,
    /// Ordered audio playback settings.
    pub playback: PlaybackConfig,
    /// Interrupt handling.
    pub cancellation: CancellationConfig,
    /// Log file settings.
    pub logging: LoggingConfig,
}

/// A designated local backend used when no remote route is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFallbackConfig {
    /// Base URL of the local OpenAI-compatible server.
    pub url: String,
    /// Model name to request from it.
    pub model: String,
}

/// Endpoint registry and health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Candidate endpoint base URLs, highest priority first.
    pub urls: Vec<String>,
    /// Model selected when an endpoint lists it; otherwise the first listed model is used.
    pub preferred_model: String,
    /// Timeout for each liveness probe and model listing.
    pub probe_timeout_secs: u64,
    /// Interval between re-probes of the active endpoint.
    pub monitor_interval_secs: u64,
    /// Extra probe attempts before an active endpoint is declared dead.
    pub retry_count: u32,
    /// Initial backoff between those attempts (doubles each retry).
    pub retry_delay_ms: u64,
    /// Local backend used when no remote endpoint is reachable.
    pub local_fallback: Option<LocalFallbackConfig>,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            urls: vec![
                "http://localhost:8000".to_owned(),
                "http://localhost:11434".to_owned(),
            ],
            preferred_model: String::new(),
            probe_timeout_secs: 3,
            monitor_interval_secs: 15,
            retry_count: 2,
            retry_delay_ms: 750,
            local_fallback: None,
        }
    }
}

/// Generation stream processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Sampling temperature (0.0 = greedy).
    pub temperature: f64,
    /// Maximum tokens requested from the backend.
    pub max_tokens: usize,
    /// Output character ceiling enforced while streaming.
    pub max_output_chars: usize,
    /// Number of most recent (user, assistant) pairs sent with each request.
    pub context_length: usize,
    /// Timeout for the whole generation request.
    pub request_timeout_secs: u64,
    /// Marker opening a reasoning region.
    pub reasoning_open: String,
    /// Marker closing a reasoning region.
    pub reasoning_close: String,
    /// Marker after which the length ceiling no longer applies.
    pub end_marker: Option<String>,
    /// Words per loop-detection segment.
    pub loop_segment_words: usize,
    /// Number of trailing segments compared against each new one.
    pub loop_window: usize,
    /// Similarity ratio above which two segments count as a repetition.
    pub loop_similarity: f32,
    /// Repetitions within the window that halt generation.
    pub loop_matches: usize,
    /// Closing remark appended when a loop halts generation.
    pub loop_suffix: String,
    /// Notice shown when the length ceiling halts generation.
    pub truncation_notice: String,
    /// System message override; empty means "use the mood's".
    pub system_message: String,
    /// Active mood name.
    pub mood: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 512,
            max_output_chars: 6000,
            context_length: 6,
            request_timeout_secs: 120,
            reasoning_open: "<think>".to_owned(),
            reasoning_close: "</think>".to_owned(),
            end_marker: None,
            loop_segment_words: 20,
            loop_window: 5,
            loop_similarity: 0.85,
            loop_matches: 3,
            loop_suffix: " ...I seem to be repeating myself, so I'll stop here.".to_owned(),
            truncation_notice: "[output truncated: length limit reached]".to_owned(),
            system_message: String::new(),
            mood: "assistant".to_owned(),
        }
    }
}

/// A speech synthesis engine tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EngineConfig {
    /// A local program that writes an audio file.
    ///
    /// `args` may contain `{text}`, `{voice}` and `{out}` placeholders. When
    /// no argument contains `{text}`, the text is written to stdin.
    Command {
        /// Display name used in logs.
        name: String,
        /// Program name or path (looked up on `PATH`).
        program: String,
        /// Argument template.
        #[serde(default)]
        args: Vec<String>,
        /// Voice identifier overriding the session voice for this engine.
        #[serde(default)]
        voice: Option<String>,
    },
    /// A remote OpenAI-compatible `/v1/audio/speech` API.
    Http {
        /// Display name used in logs.
        name: String,
        /// Full endpoint URL.
        url: String,
        /// Model requested from the API.
        model: String,
        /// Environment variable holding the API key.
        #[serde(default)]
        api_key_env: Option<String>,
        /// Voice identifier overriding the session voice for this engine.
        #[serde(default)]
        voice: Option<String>,
    },
}

impl EngineConfig {
    /// Display name of this engine.
    pub fn name(&self) -> &str {
        match self {
            Self::Command { name, .. } | Self::Http { name, .. } => name,
        }
    }
}

/// Sentence-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Whether visible sentences are spoken.
    pub enabled: bool,
    /// Voice identifier passed to the engines.
    pub voice: String,
    /// Sentences shorter than this (after trimming) are not spoken.
    pub min_sentence_chars: usize,
    /// Engine tiers, tried in order until one succeeds.
    pub engines: Vec<EngineConfig>,
    /// Directory for synthesized audio artifacts (`None` = temp dir).
    pub artifact_dir: Option<PathBuf>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            voice: "en_US-lessac-medium".to_owned(),
            min_sentence_chars: 4,
            engines: vec![
                EngineConfig::Command {
                    name: "piper".to_owned(),
                    program: "piper".to_owned(),
                    args: vec![
                        "--model".to_owned(),
                        "{voice}".to_owned(),
                        "--output_file".to_owned(),
                        "{out}".to_owned(),
                    ],
                    voice: None,
                },
                EngineConfig::Http {
                    name: "openai".to_owned(),
                    url: "https://api.openai.com/v1/audio/speech".to_owned(),
                    model: "tts-1".to_owned(),
                    api_key_env: Some("OPENAI_API_KEY".to_owned()),
                    voice: Some("alloy".to_owned()),
                },
                EngineConfig::Command {
                    name: "espeak".to_owned(),
                    program: "espeak-ng".to_owned(),
                    args: vec![
                        "-v".to_owned(),
                        "{voice}".to_owned(),
                        "-w".to_owned(),
                        "{out}".to_owned(),
                        "{text}".to_owned(),
                    ],
                    voice: Some("en".to_owned()),
                },
            ],
            artifact_dir: None,
        }
    }
}

/// Audio playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Player program (`None` = first of `afplay`, `paplay`, `aplay`, `ffplay` found on `PATH`).
    pub player: Option<String>,
    /// Extra arguments placed before the artifact path.
    pub args: Vec<String>,
    /// Upper bound on a single wait for the next artifact.
    pub poll_interval_ms: u64,
    /// Log a warning when waiting on one index longer than this.
    pub stall_warning_secs: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            player: None,
            args: Vec::new(),
            poll_interval_ms: 50,
            stall_warning_secs: 10,
        }
    }
}

/// Interrupt handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CancellationConfig {
    /// How long a cancelled generation may take to wind down before it is aborted.
    pub grace_period_ms: u64,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 1500,
        }
    }
}

/// Log file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily log files (`None` = platform data dir).
    pub log_dir: Option<PathBuf>,
    /// Log file name prefix.
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            file_prefix: "codedeck.log".to_owned(),
        }
    }
}

impl LoggingConfig {
    /// Resolved log directory.
    pub fn effective_log_dir(&self) -> PathBuf {
        if let Some(dir) = &self.log_dir {
            return dir.clone();
        }
        dirs::data_local_dir()
            .map(|d| d.join("codedeck").join("logs"))
            .unwrap_or_else(|| std::env::temp_dir().join("codedeck-logs"))
    }
}

impl DeckConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::DeckError::Config(e.to_string()))
    }

    /// Load from `path` when it exists, otherwise return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_or_default(path: &std::path::Path) -> crate::error::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::DeckError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Directory holding `config.toml` and user moods: `~/.config/codedeck/`.
    pub fn config_dir() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("codedeck")
        } else if let Some(config) = dirs::config_dir() {
            config.join("codedeck")
        } else {
            std::env::temp_dir().join("codedeck-config")
        }
    }

    /// Returns the default config file path: `~/.config/codedeck/config.toml`.
    pub fn default_config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}
