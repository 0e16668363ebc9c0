//! Endpoint liveness probing and model listing.
//!
//! [`HttpProber`] talks to OpenAI-compatible inference servers. It never
//! mutates registry state; callers (the health monitor) decide what a
//! [`ProbeStatus`] means for the active route.
//!
//! # Status Model
//!
//! - [`Reachable`](ProbeStatus::Reachable): endpoint answered a liveness request
//! - [`NotRunning`](ProbeStatus::NotRunning): connection refused / unreachable
//! - [`Timeout`](ProbeStatus::Timeout): no response within the probe timeout
//! - [`Unhealthy`](ProbeStatus::Unhealthy): responded with an HTTP error status

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Status of an endpoint after a liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeStatus {
    /// Endpoint answered with a success status.
    Reachable {
        /// Round-trip latency in milliseconds.
        latency_ms: u64,
    },
    /// Connection refused or host unreachable.
    NotRunning,
    /// No response within the probe timeout.
    Timeout,
    /// Endpoint responded with an HTTP error status.
    Unhealthy {
        /// HTTP status code.
        status_code: u16,
        /// Truncated response body.
        message: String,
    },
}

impl ProbeStatus {
    /// Returns `true` if the endpoint answered the probe.
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable { .. })
    }

    /// Whether retrying might change the outcome.
    ///
    /// An HTTP error status is an answer, so it is not retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotRunning | Self::Timeout)
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reachable { latency_ms } => write!(f, "reachable ({latency_ms}ms)"),
            Self::NotRunning => write!(f, "not running (connection refused)"),
            Self::Timeout => write!(f, "timeout (no response)"),
            Self::Unhealthy {
                status_code,
                message,
            } => write!(f, "unhealthy (HTTP {status_code}): {message}"),
        }
    }
}

/// Failures while listing models on an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    /// The endpoint could not be reached while listing models.
    #[error("endpoint unreachable: {0}")]
    Unreachable(ProbeStatus),

    /// The endpoint answered, but not with a recognized model list.
    #[error("incompatible response: {0}")]
    IncompatibleResponse(String),
}

/// Liveness and model-listing contract used by discovery and the monitor.
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    /// Check whether the endpoint at `url` is alive.
    async fn probe(&self, url: &str) -> ProbeStatus;

    /// List the models the endpoint currently serves, in the order it reports them.
    async fn list_models(&self, url: &str) -> Result<Vec<String>, ProbeError>;
}

/// HTTP prober for OpenAI-compatible (and Ollama) servers.
///
/// Every request carries the configured timeout; exceeding it yields
/// [`ProbeStatus::Timeout`], which callers treat like any other failure.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProber {
    /// Create a prober whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, timeout }
    }

    /// The per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn get_status(&self, url: &str) -> Result<(u16, String), ProbeStatus> {
        match self.client.get(url).timeout(self.timeout).send().await {
            Ok(resp) => {
                let code = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                Ok((code, body))
            }
            Err(e) => Err(classify_reqwest_error(&e)),
        }
    }
}

#[async_trait]
impl EndpointProbe for HttpProber {
    /// Sends `GET /health`, falling back to `GET /` when the server has no
    /// health route. Any 2xx answer means reachable.
    async fn probe(&self, url: &str) -> ProbeStatus {
        let base = base_url(url);
        let start = Instant::now();

        let (code, body) = match self.get_status(&format!("{base}/health")).await {
            Ok((404, _)) | Ok((405, _)) => match self.get_status(&format!("{base}/")).await {
                Ok(answer) => answer,
                Err(status) => return status,
            },
            Ok(answer) => answer,
            Err(status) => return status,
        };

        if (200..300).contains(&code) {
            ProbeStatus::Reachable {
                latency_ms: start.elapsed().as_millis() as u64,
            }
        } else {
            let message = if body.is_empty() {
                format!("HTTP {code}")
            } else {
                body.chars().take(200).collect()
            };
            ProbeStatus::Unhealthy {
                status_code: code,
                message,
            }
        }
    }

    /// Queries `/v1/models`, falling back to Ollama's `/api/tags`.
    async fn list_models(&self, url: &str) -> Result<Vec<String>, ProbeError> {
        let base = base_url(url);

        if let Ok((code, body)) = self.get_status(&format!("{base}/v1/models")).await {
            if (200..300).contains(&code) {
                if let Some(models) = parse_openai_models_response(&body) {
                    return Ok(models);
                }
            }
        }

        match self.get_status(&format!("{base}/api/tags")).await {
            Ok((code, body)) if (200..300).contains(&code) => parse_ollama_tags_response(&body)
                .ok_or_else(|| {
                    ProbeError::IncompatibleResponse(
                        "neither /v1/models nor /api/tags returned a model list".to_owned(),
                    )
                }),
            Ok((code, body)) => Err(ProbeError::Unreachable(ProbeStatus::Unhealthy {
                status_code: code,
                message: body.chars().take(200).collect(),
            })),
            Err(status) => Err(ProbeError::Unreachable(status)),
        }
    }
}

/// Normalize an endpoint URL to its server root (no trailing `/` or `/v1`).
pub fn base_url(url: &str) -> &str {
    let trimmed = url.trim_end_matches('/');
    trimmed.strip_suffix("/v1").unwrap_or(trimmed)
}

fn classify_reqwest_error(err: &reqwest::Error) -> ProbeStatus {
    if err.is_timeout() {
        ProbeStatus::Timeout
    } else {
        ProbeStatus::NotRunning
    }
}

/// Parse an OpenAI-compatible `/v1/models` response.
///
/// Expected format: `{"data": [{"id": "model-name", ...}, ...]}`
fn parse_openai_models_response(body: &str) -> Option<Vec<String>> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    let data = json.get("data")?.as_array()?;
    Some(
        data.iter()
            .filter_map(|entry| entry.get("id")?.as_str().map(str::to_owned))
            .collect(),
    )
}

/// Parse an Ollama `/api/tags` response.
///
/// Expected format: `{"models": [{"name": "llama3:8b", ...}, ...]}`
fn parse_ollama_tags_response(body: &str) -> Option<Vec<String>> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    let models = json.get("models")?.as_array()?;
    Some(
        models
            .iter()
            .filter_map(|entry| entry.get("name")?.as_str().map(str::to_owned))
            .collect(),
    )
}
