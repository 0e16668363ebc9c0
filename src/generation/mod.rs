//! Streaming generation: request, token classification and halt conditions.

pub mod backend;
pub mod classifier;
pub mod loop_detect;
pub mod processor;
pub mod sse;

pub use backend::{ChatBackend, ChatRequest, OpenAiBackend, TokenStream};
pub use classifier::{Classified, Fragment, ReasoningClassifier, Region};
pub use loop_detect::{LoopDetector, LoopSettings};
pub use processor::{
    GenerationEvent, GenerationOutcome, GenerationProcessor, HaltReason, StreamProcessor,
};
