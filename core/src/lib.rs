// Narrate Core Library
// Streaming text-to-speech narration pipeline

pub mod cancel;
pub mod config;
pub mod narrator;
pub mod playback;
pub mod session;
pub mod sink;
pub mod synth;
pub mod text;

mod typewriter;

// Export core types
pub use cancel::CancelFlag;
pub use config::{
    BackendKind, CloudRestConfig, DuplexConfig, LocalRestConfig, NarratorConfig,
    TranslationConfig,
};
pub use narrator::Narrator;
pub use playback::{PlaybackOutcome, SegmentPlayer};
pub use session::{AudioPackage, SessionHandle, SessionOutcome, SessionSignal};
pub use sink::{NarrationSink, NullSink};
pub use synth::SpeechSynthesizer;
pub use text::markup::{parse_markup, strip_markup, EmotionMarker, ParsedText};
pub use text::segmenter::TextSegmenter;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NarrateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Synthesis backend error: {0}")]
    Backend(String),

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NarrateError {
    /// True when the error came from an abort rather than a backend fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NarrateError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, NarrateError>;
