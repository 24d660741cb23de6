use crate::cancel::CancelFlag;
use crate::session::AudioPackage;
use crate::sink::NarrationSink;
use async_trait::async_trait;
use std::sync::Arc;

/// Result of playing one package.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackOutcome {
    /// The audio reached its natural end.
    pub completed: bool,
    /// Caption text after this package: the prefix plus whatever was revealed.
    pub displayed: String,
}

/// Plays packages one at a time and drives amplitude, caption and emotion callbacks.
#[async_trait]
pub trait SegmentPlayer: Send + Sync {
    /// Play `package`, appending its caption to `caption_prefix`. Never fails:
    /// decode or device errors come back as `completed: false`. Once `cancel` fires
    /// the playback emits nothing further and returns.
    async fn play(
        &self,
        package: AudioPackage,
        caption_prefix: String,
        sink: Arc<dyn NarrationSink>,
        cancel: CancelFlag,
    ) -> PlaybackOutcome;

    /// Detach callbacks of the current playback, then stop its audio.
    fn stop(&self);
}
