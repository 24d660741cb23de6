mod config;

use crate::config::{DemoConfig, StreamConfig};
use narrate_audio::{AudioOutput, PlaybackEngine, PlaybackSettings, SynthesisAdapter};
use narrate_core::{NarrationSink, Narrator, SessionSignal};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, trace, warn};

/// Renders narration callbacks as log lines.
struct ConsoleSink;

impl NarrationSink for ConsoleSink {
    fn on_amplitude(&self, value: f32) {
        trace!(target = "narrator", value, "mouth");
    }

    fn on_caption_update(&self, text: &str) {
        debug!(target = "narrator", caption = %text, "caption");
    }

    fn on_caption_hidden(&self) {
        debug!(target = "narrator", "caption hidden");
    }

    fn on_emotion_trigger(&self, tag: &str) {
        info!(target = "narrator", tag, "🎭 emotion");
    }

    fn on_playback_start(&self, text: &str) {
        info!(target = "narrator", text, "🗣️  speaking");
    }

    fn on_transcript(&self, text: &str) {
        info!(target = "narrator", transcript = %text, "Response finished");
    }
}

#[cfg(feature = "playback")]
fn output() -> Arc<dyn AudioOutput> {
    Arc::new(narrate_audio::CpalOutput::from_env())
}

#[cfg(not(feature = "playback"))]
fn output() -> Arc<dyn AudioOutput> {
    info!(target = "narrator", "Built without `playback`; audio is timed but silent");
    Arc::new(narrate_audio::ClockOutput::default())
}

/// Replay one line as a streamed response, a few characters at a time.
async fn stream_line(narrator: &Narrator, line: &str, stream: &StreamConfig) {
    let chars: Vec<char> = line.chars().collect();
    for chunk in chars.chunks(stream.chunk_chars.max(1)) {
        let chunk: String = chunk.iter().collect();
        narrator.feed_streaming_text(&chunk);
        tokio::time::sleep(Duration::from_millis(stream.chunk_delay_ms)).await;
    }
    narrator.finalize_stream();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Logging / tracing
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        "info,narrate_core=info,narrate_audio=info,narrator=info".to_string()
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let cfg = DemoConfig::load();
    info!(target = "narrator", backend = ?cfg.narrator.backend, "Starting narrator demo");

    let synth = Arc::new(SynthesisAdapter::from_config(&cfg.narrator)?);
    let player = Arc::new(PlaybackEngine::new(
        output(),
        PlaybackSettings::from_config(&cfg.narrator),
    ));
    let narrator = Narrator::start(cfg.narrator.clone(), synth, player, Arc::new(ConsoleSink)).await?;

    let mut signals = narrator.subscribe();
    let signal_task = tokio::spawn(async move {
        while let Ok(signal) = signals.recv().await {
            match signal {
                SessionSignal::Started { session, .. } => {
                    debug!(target = "narrator", session, "ASR paused")
                }
                SessionSignal::Ended {
                    session, outcome, ..
                } => debug!(target = "narrator", session, ?outcome, "ASR resumed"),
            }
        }
    });

    info!(target = "narrator", "Type a line and press Enter; Ctrl+C interrupts, Ctrl+D quits");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = signal::ctrl_c() => {
                info!(target = "narrator", "Shutting down...");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        stream_line(&narrator, &line, &cfg.stream).await;
        let Some(handle) = narrator.session_handle() else {
            continue;
        };
        tokio::select! {
            outcome = handle.wait() => {
                info!(target = "narrator", ?outcome, breaker = narrator.breaker_tripped(), "Session ended");
            }
            _ = signal::ctrl_c() => {
                warn!(target = "narrator", "Interrupted");
                narrator.interrupt();
            }
        }
    }

    signal_task.abort();
    Ok(())
}
