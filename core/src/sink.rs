//! Outbound callbacks consumed by the renderer, subtitle layer and caller.

/// Receives everything the narrator emits. Every method has a no-op default so a
/// sink implements only what it renders.
///
/// Callbacks run on narrator tasks and must return quickly.
pub trait NarrationSink: Send + Sync {
    /// Mouth/viseme openness in `0.0..=1.0`, once per animation tick while audio plays.
    fn on_amplitude(&self, _value: f32) {}

    /// Full caption revealed so far in this session.
    fn on_caption_update(&self, _text: &str) {}

    fn on_caption_hidden(&self) {}

    fn on_emotion_trigger(&self, _tag: &str) {}

    /// A segment's audio started; `text` is its display text.
    fn on_playback_start(&self, _text: &str) {}

    fn on_session_start(&self) {}

    fn on_session_end(&self) {}

    /// Accumulated response text of a finished or interrupted session.
    fn on_transcript(&self, _text: &str) {}
}

/// Sink that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl NarrationSink for NullSink {}
