use crate::Result;
use async_trait::async_trait;

/// Turns one text segment into encoded audio.
///
/// Contract:
/// - `Ok(None)`: nothing speakable in the segment; no request was made
/// - `Err(NarrateError::Cancelled)`: aborted through [`abort_all`](Self::abort_all)
/// - any other `Err`: a backend failure, which trips the session breaker
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, segment: &str) -> Result<Option<Vec<u8>>>;

    /// Cancel every request currently in flight.
    fn abort_all(&self);
}
