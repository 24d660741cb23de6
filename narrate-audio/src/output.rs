//! Audio outputs and the handle the playback engine observes them through.

use crate::clip::Clip;
use crossbeam::atomic::AtomicCell;
use narrate_core::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Shared {
    position: AtomicU64,
    finished: AtomicBool,
    stopped: AtomicBool,
    gain: AtomicCell<f32>,
    error: Mutex<Option<String>>,
}

/// Shared view of one running clip. Cloning yields another view of the same playback.
#[derive(Clone, Debug)]
pub struct PlaybackHandle {
    shared: Arc<Shared>,
}

impl Default for PlaybackHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackHandle {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                position: AtomicU64::new(0),
                finished: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                gain: AtomicCell::new(1.0),
                error: Mutex::new(None),
            }),
        }
    }

    /// Frames of the clip rendered so far.
    pub fn position(&self) -> u64 {
        self.shared.position.load(Ordering::Acquire)
    }

    pub fn set_position(&self, frames: u64) {
        self.shared.position.store(frames, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    pub fn mark_finished(&self) {
        self.shared.finished.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Ask the output to stop rendering; it also counts as finished.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.mark_finished();
    }

    pub fn gain(&self) -> f32 {
        self.shared.gain.load()
    }

    pub fn set_gain(&self, gain: f32) {
        self.shared.gain.store(gain.clamp(0.0, 1.0));
    }

    /// Record a device failure and end playback.
    pub fn fail(&self, error: impl Into<String>) {
        if let Ok(mut slot) = self.shared.error.lock() {
            slot.get_or_insert(error.into());
        }
        self.mark_finished();
    }

    pub fn take_error(&self) -> Option<String> {
        self.shared.error.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Renders clips. `start` must return promptly; rendering continues in the background
/// and is observed through the returned handle.
pub trait AudioOutput: Send + Sync {
    fn start(&self, clip: Arc<Clip>) -> Result<PlaybackHandle>;
}

/// Device-less output that advances the play position on the tokio clock.
///
/// Used headless and in tests, where `tokio::time::pause` makes playback timing exact.
#[derive(Clone, Debug)]
pub struct ClockOutput {
    tick: Duration,
}

impl Default for ClockOutput {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
        }
    }
}

impl ClockOutput {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick: tick.max(Duration::from_millis(1)),
        }
    }
}

impl AudioOutput for ClockOutput {
    fn start(&self, clip: Arc<Clip>) -> Result<PlaybackHandle> {
        let handle = PlaybackHandle::new();
        let view = handle.clone();
        let tick = self.tick;
        tokio::spawn(async move {
            let started = Instant::now();
            let total = clip.frames();
            loop {
                tokio::time::sleep(tick).await;
                if view.is_stopped() {
                    break;
                }
                let position = clip.frames_for(started.elapsed()).min(total);
                view.set_position(position);
                if position >= total {
                    view.mark_finished();
                    break;
                }
            }
        });
        Ok(handle)
    }
}
