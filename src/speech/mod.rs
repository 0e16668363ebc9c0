//! Speech output: sentence segmentation, synthesis and ordered playback.

pub mod dispatch;
pub mod engine;
pub mod playback;
pub mod segmenter;

pub use dispatch::SpeechDispatcher;
pub use engine::{CommandEngine, EngineChain, HttpEngine, SpeechEngine};
pub use playback::{AudioPlayer, CommandPlayer, EntryState, PlaybackCoordinator, PlaybackQueue};
pub use segmenter::{SentenceSegment, SentenceSegmenter};
