//! One chat exchange, end to end.
//!
//! The generation task streams tokens on its own task; the exchange loop
//! narrates events, feeds visible text to the sentence segmenter and hands
//! each sentence to the speech dispatcher. Playback runs independently on
//! the [`PlaybackCoordinator`](crate::speech::PlaybackCoordinator).

mod exchange;

pub use exchange::{ExchangeReport, Narrator, Pipeline};
