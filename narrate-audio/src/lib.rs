// Audio side of the narration pipeline: synthesis backends, translation,
// decoding and playback.

// Shared helpers
pub(crate) mod utils;

pub mod clip;
pub mod engine;
pub mod output;
pub mod synthesis;
pub mod translate;

#[cfg(feature = "playback")]
pub mod cpal_output;

pub use clip::{encode_wav, pcm16_to_wav, Clip};
pub use engine::{PlaybackEngine, PlaybackSettings};
pub use output::{AudioOutput, ClockOutput, PlaybackHandle};
pub use synthesis::{
    ClientFrame, CloudRestBackend, DuplexBackend, LocalRestBackend, ServerEvent, SpeechBackend,
    SynthesisAdapter,
};
pub use translate::{ChatTranslator, Translator};

#[cfg(feature = "playback")]
pub use cpal_output::CpalOutput;
