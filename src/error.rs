//! Error types for the codedeck console.

/// Top-level error type for the chat console.
#[derive(Debug, thiserror::Error)]
pub enum DeckError {
    /// A backend could not be reached (probe, listing, or generation request).
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The generation stream broke after it started.
    #[error("stream error: {0}")]
    Stream(String),

    /// Endpoint or model selection failed validation.
    #[error("routing error: {0}")]
    Routing(String),

    /// Speech synthesis failed on every configured engine.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Audio playback could not be started.
    #[error("playback error: {0}")]
    Playback(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, DeckError>;
