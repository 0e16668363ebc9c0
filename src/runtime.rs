//! Runtime events emitted by background tasks for the console and logs.
//!
//! Kept lightweight (no audio payloads) so emitters never block on
//! subscribers. Senders ignore the error returned when nobody listens.

use crate::routing::{ActiveRoute, RouteStatus};

/// Events that describe what the background tasks are doing "right now".
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Connectivity changed category (or was observed for the first time).
    RouteStatus {
        status: RouteStatus,
        route: Option<ActiveRoute>,
    },
    /// The coordinator started playing sentence `index`.
    PlaybackStarted { index: u64 },
    /// Sentence `index` finished playing, or was cut short by a hush.
    PlaybackFinished { index: u64, interrupted: bool },
    /// The coordinator has waited on sentence `index` past the stall threshold.
    PlaybackStalled { index: u64, waited_secs: u64 },
    /// Every speech engine failed for sentence `index`.
    SynthesisFailed { index: u64, error: String },
}
