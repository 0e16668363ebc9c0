//! Speech synthesis engines and the tiered fallback chain.
//!
//! Engines are opaque "render text to an audio file" collaborators: local
//! programs ([`CommandEngine`]) or an OpenAI-compatible speech API
//! ([`HttpEngine`]). [`EngineChain`] tries them in configured order until
//! one produces an artifact.

use crate::config::{EngineConfig, SpeechConfig};
use crate::error::{DeckError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Renders text to an audio file.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Write audio for `text` to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`DeckError::Synthesis`] when no usable audio was produced,
    /// including when `cancel` fires first.
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// A local program such as `piper` or `espeak-ng`.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    voice: Option<String>,
}

impl CommandEngine {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<PathBuf>,
        args: Vec<String>,
        voice: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            voice,
        }
    }

    /// Substitute `{text}`, `{voice}` and `{out}`. Returns the arguments and
    /// whether the text still needs to go to stdin.
    fn render_args(&self, text: &str, voice: &str, out: &Path) -> (Vec<String>, bool) {
        let out = out.to_string_lossy();
        let mut text_in_args = false;
        let args = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains("{text}") {
                    text_in_args = true;
                }
                arg.replace("{text}", text)
                    .replace("{voice}", voice)
                    .replace("{out}", &out)
            })
            .collect();
        (args, !text_in_args)
    }
}

#[async_trait]
impl SpeechEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let voice = self.voice.as_deref().unwrap_or(voice);
        let (args, use_stdin) = self.render_args(text, voice, out);

        let mut child = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(if use_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DeckError::Synthesis(format!("{}: failed to start {}: {e}", self.name, self.program.display()))
            })?;

        if use_stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(text.as_bytes())
                    .await
                    .map_err(|e| DeckError::Synthesis(format!("{}: stdin: {e}", self.name)))?;
                // Closing stdin tells the engine the text is complete.
                drop(stdin);
            }
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(DeckError::Synthesis(format!("{}: cancelled", self.name)));
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };
            let stderr = String::from_utf8_lossy(&stderr);
            let stderr: String = stderr.trim().chars().take(200).collect();
            return Err(DeckError::Synthesis(format!(
                "{} exited with {status}: {stderr}",
                self.name
            )));
        }
        ensure_artifact(&self.name, out).await
    }
}

/// OpenAI-compatible `/v1/audio/speech` client.
#[derive(Debug, Clone)]
pub struct HttpEngine {
    name: String,
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    voice: Option<String>,
}

impl HttpEngine {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        voice: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            url: url.into(),
            model: model.into(),
            api_key,
            voice,
        }
    }
}

#[async_trait]
impl SpeechEngine for HttpEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let voice = self.voice.as_deref().unwrap_or(voice);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice,
            "response_format": "wav",
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let fetch = async {
            let response = request
                .send()
                .await
                .map_err(|e| DeckError::Synthesis(format!("{}: {e}", self.name)))?;
            let status = response.status();
            if !status.is_success() {
                return Err(DeckError::Synthesis(format!(
                    "{} returned HTTP {}",
                    self.name,
                    status.as_u16()
                )));
            }
            response
                .bytes()
                .await
                .map_err(|e| DeckError::Synthesis(format!("{}: {e}", self.name)))
        };

        let audio = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DeckError::Synthesis(format!("{}: cancelled", self.name)));
            }
            audio = fetch => audio?,
        };
        tokio::fs::write(out, &audio).await?;
        ensure_artifact(&self.name, out).await
    }
}

async fn ensure_artifact(engine: &str, out: &Path) -> Result<()> {
    match tokio::fs::metadata(out).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(DeckError::Synthesis(format!(
            "{engine} produced no audio at {}",
            out.display()
        ))),
    }
}

/// Engines tried in order until one succeeds.
#[derive(Clone)]
pub struct EngineChain {
    engines: Vec<Arc<dyn SpeechEngine>>,
    artifact_dir: PathBuf,
}

impl EngineChain {
    pub fn new(engines: Vec<Arc<dyn SpeechEngine>>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            engines,
            artifact_dir: artifact_dir.into(),
        }
    }

    /// Build the chain from configuration. Command engines whose program is
    /// not installed and HTTP engines whose API key is unset are skipped.
    pub fn from_config(config: &SpeechConfig) -> Self {
        let mut engines: Vec<Arc<dyn SpeechEngine>> = Vec::new();
        for engine in &config.engines {
            match engine {
                EngineConfig::Command {
                    name,
                    program,
                    args,
                    voice,
                } => match which::which(program) {
                    Ok(path) => {
                        engines.push(Arc::new(CommandEngine::new(name, path, args.clone(), voice.clone())));
                    }
                    Err(_) => debug!(engine = %name, program, "speech engine not installed, skipping"),
                },
                EngineConfig::Http {
                    name,
                    url,
                    model,
                    api_key_env,
                    voice,
                } => {
                    let api_key = api_key_env
                        .as_deref()
                        .and_then(|var| std::env::var(var).ok())
                        .filter(|key| !key.is_empty());
                    if api_key_env.is_some() && api_key.is_none() {
                        debug!(engine = %name, "speech API key not set, skipping");
                        continue;
                    }
                    engines.push(Arc::new(HttpEngine::new(name, url, model, api_key, voice.clone())));
                }
            }
        }

        let artifact_dir = config
            .artifact_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("codedeck-audio"));
        info!(
            engines = ?engines.iter().map(|e| e.name().to_owned()).collect::<Vec<_>>(),
            dir = %artifact_dir.display(),
            "speech engines ready"
        );
        Self::new(engines, artifact_dir)
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn engine_names(&self) -> Vec<&str> {
        self.engines.iter().map(|e| e.name()).collect()
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Synthesize `text` for sentence `index`, returning the artifact path.
    ///
    /// # Errors
    ///
    /// Returns [`DeckError::Synthesis`] when every engine fails.
    pub async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        index: u64,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        if self.engines.is_empty() {
            return Err(DeckError::Synthesis("no speech engine available".to_owned()));
        }
        tokio::fs::create_dir_all(&self.artifact_dir).await?;

        let mut failures = Vec::new();
        for engine in &self.engines {
            if cancel.is_cancelled() {
                return Err(DeckError::Synthesis("cancelled".to_owned()));
            }
            let out = self
                .artifact_dir
                .join(format!("codedeck-{index:06}-{}.wav", uuid::Uuid::new_v4()));
            match engine.synthesize(text, voice, &out, cancel).await {
                Ok(()) => {
                    debug!(index, engine = engine.name(), "sentence synthesized");
                    return Ok(out);
                }
                Err(e) => {
                    warn!(index, engine = engine.name(), error = %e, "speech engine failed, trying next");
                    let _ = tokio::fs::remove_file(&out).await;
                    failures.push(e.to_string());
                }
            }
        }

        Err(DeckError::Synthesis(failures.join("; ")))
    }
}
