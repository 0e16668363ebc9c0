//! codedeck: streaming chat console with endpoint failover and spoken replies.
//!
//! A user message flows through a chain of independent stages:
//! Route → Generate → Classify → Segment → Synthesize → Play
//!
//! # Architecture
//!
//! - **Routing**: priority-ordered endpoints, probed by a background health
//!   monitor that owns the single active `(endpoint, model)` route
//! - **Generation**: streams tokens from an OpenAI-compatible backend and
//!   splits them into reasoning and visible text, halting on repetition
//!   loops or the output ceiling
//! - **Speech**: visible text is cut into sentences, each synthesized on its
//!   own task, and played strictly in sentence order
//! - **Cancellation**: one interrupt stops generation and lets audio drain;
//!   a second stops everything

pub mod cancel;
pub mod config;
pub mod console;
pub mod error;
pub mod generation;
pub mod logging;
pub mod mood;
pub mod pipeline;
pub mod routing;
pub mod runtime;
pub mod session;
pub mod speech;

pub use config::DeckConfig;
pub use error::{DeckError, Result};
pub use pipeline::Pipeline;
pub use runtime::RuntimeEvent;
