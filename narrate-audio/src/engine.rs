//! Plays one audio package at a time and drives amplitude, caption and emotion
//! callbacks from the output's play position.

use crate::clip::Clip;
use crate::output::{AudioOutput, PlaybackHandle};
use async_trait::async_trait;
use narrate_core::{
    parse_markup, AudioPackage, CancelFlag, EmotionMarker, NarrationSink, NarratorConfig,
    PlaybackOutcome, SegmentPlayer,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Samples in the amplitude analysis window.
const RMS_WINDOW: usize = 1024;

/// Timing knobs taken from [`NarratorConfig`].
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackSettings {
    pub fade_out: Duration,
    pub caption_reveal_min: Duration,
    pub caption_reveal_max: Duration,
    pub amplitude_tick: Duration,
    pub amplitude_gain: f32,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self::from_config(&NarratorConfig::default())
    }
}

impl PlaybackSettings {
    pub fn from_config(cfg: &NarratorConfig) -> Self {
        Self {
            fade_out: Duration::from_millis(cfg.fade_out_ms),
            caption_reveal_min: Duration::from_millis(cfg.caption_reveal_min_ms),
            caption_reveal_max: Duration::from_millis(cfg.caption_reveal_max_ms),
            amplitude_tick: Duration::from_millis(cfg.amplitude_tick_ms.max(1)),
            amplitude_gain: cfg.amplitude_gain,
        }
    }

    /// Per-character reveal interval for a clip of `duration` showing `chars` characters.
    pub fn reveal_interval(&self, duration: Duration, chars: usize) -> Duration {
        let even = duration / (chars.max(1) as u32);
        even.clamp(self.caption_reveal_min, self.caption_reveal_max)
    }
}

struct Current {
    handle: PlaybackHandle,
    attached: Arc<AtomicBool>,
}

enum Ending {
    Natural,
    Failed(String),
    Detached,
}

/// [`SegmentPlayer`] over any [`AudioOutput`].
pub struct PlaybackEngine {
    output: Arc<dyn AudioOutput>,
    settings: PlaybackSettings,
    current: Mutex<Option<Current>>,
}

impl PlaybackEngine {
    pub fn new(output: Arc<dyn AudioOutput>, settings: PlaybackSettings) -> Self {
        Self {
            output,
            settings,
            current: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &PlaybackSettings {
        &self.settings
    }

    fn install(&self, handle: PlaybackHandle) -> Arc<AtomicBool> {
        let attached = Arc::new(AtomicBool::new(true));
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = current.replace(Current {
            handle,
            attached: Arc::clone(&attached),
        }) {
            previous.attached.store(false, Ordering::SeqCst);
            previous.handle.stop();
        }
        attached
    }

    fn release(&self, attached: &Arc<AtomicBool>) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if current
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(&c.attached, attached))
        {
            *current = None;
        }
    }

    /// Runs `emit` only while the playback is still attached. The check and the
    /// callbacks share the `current` lock with [`SegmentPlayer::stop`], so nothing is
    /// emitted once `stop()` has returned.
    fn emit_if_attached(&self, attached: &AtomicBool, emit: impl FnOnce()) -> bool {
        let _current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if !attached.load(Ordering::SeqCst) {
            return false;
        }
        emit();
        true
    }

    fn failed(
        sink: &dyn NarrationSink,
        caption_prefix: String,
        display: &str,
        reason: &str,
    ) -> PlaybackOutcome {
        warn!(target = "playback", error = reason, "Segment playback failed");
        sink.on_amplitude(0.0);
        let displayed = format!("{caption_prefix}{display}");
        sink.on_caption_update(&displayed);
        PlaybackOutcome {
            completed: false,
            displayed,
        }
    }
}

fn fire_markers(
    markers: &[EmotionMarker],
    next: &mut usize,
    cursor: usize,
    sink: &dyn NarrationSink,
) {
    while let Some(marker) = markers.get(*next) {
        if marker.char_position > cursor {
            break;
        }
        sink.on_emotion_trigger(&marker.tag);
        *next += 1;
    }
}

#[async_trait]
impl SegmentPlayer for PlaybackEngine {
    async fn play(
        &self,
        package: AudioPackage,
        caption_prefix: String,
        sink: Arc<dyn NarrationSink>,
        cancel: CancelFlag,
    ) -> PlaybackOutcome {
        let parsed = parse_markup(&package.source_text);
        let clip = match Clip::decode(&package.audio) {
            Ok(clip) => Arc::new(clip),
            Err(e) => {
                return Self::failed(&*sink, caption_prefix, &parsed.display, &e.to_string())
            }
        };
        if cancel.is_cancelled() {
            return PlaybackOutcome {
                completed: false,
                displayed: caption_prefix,
            };
        }
        let handle = match self.output.start(Arc::clone(&clip)) {
            Ok(handle) => handle,
            Err(e) => {
                return Self::failed(&*sink, caption_prefix, &parsed.display, &e.to_string())
            }
        };
        let attached = self.install(handle.clone());

        let display: Vec<char> = parsed.display.chars().collect();
        let reveal = self.settings.reveal_interval(clip.duration(), display.len());
        let total = clip.frames();
        let fade_frames = clip.frames_for(self.settings.fade_out);
        debug!(
            target = "playback",
            text = %parsed.display,
            duration_ms = clip.duration().as_millis() as u64,
            reveal_ms = reveal.as_millis() as u64,
            "Playing segment"
        );

        let mut revealed = 0usize;
        let mut next_marker = 0usize;
        self.emit_if_attached(&attached, || {
            sink.on_playback_start(&parsed.display);
            fire_markers(&parsed.markers, &mut next_marker, 0, &*sink);
        });

        let mut amplitude_tick = interval(self.settings.amplitude_tick);
        amplitude_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut caption_tick = interval_at(Instant::now() + reveal, reveal);

        let ending = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ending::Detached,
                _ = amplitude_tick.tick() => {
                    if let Some(e) = handle.take_error() {
                        break Ending::Failed(e);
                    }
                    let position = handle.position();
                    if handle.is_finished() || position >= total {
                        break Ending::Natural;
                    }
                    let remaining = total - position;
                    let gain = if fade_frames > 0 && remaining < fade_frames {
                        remaining as f32 / fade_frames as f32
                    } else {
                        1.0
                    };
                    handle.set_gain(gain);
                    let level = (clip.rms_before(position, RMS_WINDOW)
                        * gain
                        * self.settings.amplitude_gain)
                        .clamp(0.0, 1.0);
                    if !self.emit_if_attached(&attached, || sink.on_amplitude(level)) {
                        break Ending::Detached;
                    }
                }
                _ = caption_tick.tick(), if revealed < display.len() => {
                    let next = revealed + 1;
                    let emitted = self.emit_if_attached(&attached, || {
                        fire_markers(&parsed.markers, &mut next_marker, next, &*sink);
                        let shown: String = display[..next].iter().collect();
                        sink.on_caption_update(&format!("{caption_prefix}{shown}"));
                    });
                    if !emitted {
                        break Ending::Detached;
                    }
                    revealed = next;
                }
            }
        };

        let outcome = match ending {
            Ending::Natural => {
                let displayed = format!("{caption_prefix}{}", parsed.display);
                let emitted = self.emit_if_attached(&attached, || {
                    sink.on_amplitude(0.0);
                    fire_markers(&parsed.markers, &mut next_marker, usize::MAX, &*sink);
                    sink.on_caption_update(&displayed);
                });
                emitted.then_some(PlaybackOutcome {
                    completed: true,
                    displayed,
                })
            }
            Ending::Failed(e) => {
                handle.stop();
                let mut failed = None;
                self.emit_if_attached(&attached, || {
                    failed = Some(Self::failed(
                        &*sink,
                        caption_prefix.clone(),
                        &parsed.display,
                        &e,
                    ));
                });
                failed
            }
            Ending::Detached => None,
        };
        self.release(&attached);

        outcome.unwrap_or_else(|| {
            handle.stop();
            debug!(target = "playback", "Playback detached before its end");
            let shown: String = display[..revealed].iter().collect();
            PlaybackOutcome {
                completed: false,
                displayed: format!("{caption_prefix}{shown}"),
            }
        })
    }

    fn stop(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(current) = current {
            current.attached.store(false, Ordering::SeqCst);
            current.handle.stop();
        }
    }
}
