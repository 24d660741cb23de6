//! Speaker output using cpal.
//!
//! Linux build note: you need ALSA development headers for `cpal`.
//! On Debian/Ubuntu:
//!   sudo apt-get update && sudo apt-get install -y libasound2-dev pkg-config
//! Then build the demo with:
//!   cargo run -p narrator --features playback
use crate::clip::Clip;
use crate::output::{AudioOutput, PlaybackHandle};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use narrate_core::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Renders clips on an output device. Each clip gets a dedicated thread that owns the
/// (non-`Send`) cpal stream until the clip ends or is stopped.
#[derive(Clone, Debug, Default)]
pub struct CpalOutput {
    /// Optional output device name substring to match
    device_name: Option<String>,
}

impl CpalOutput {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    /// Reads `NARRATE_OUTPUT_DEVICE`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("NARRATE_OUTPUT_DEVICE").ok().filter(|s| !s.is_empty()))
    }
}

impl AudioOutput for CpalOutput {
    fn start(&self, clip: Arc<Clip>) -> Result<PlaybackHandle> {
        let handle = PlaybackHandle::new();
        let view = handle.clone();
        let device_name = self.device_name.clone();
        std::thread::spawn(move || {
            if let Err(e) = render(&clip, &view, device_name.as_deref()) {
                error!(target = "playback", error = %e, "Output device failed");
                view.fail(e);
            }
        });
        Ok(handle)
    }
}

fn select_device(host: &cpal::Host, needle: Option<&str>) -> Option<cpal::Device> {
    if let Some(needle) = needle {
        match host.output_devices() {
            Ok(devices) => {
                for dev in devices {
                    if let Ok(name) = dev.name() {
                        if name.to_lowercase().contains(&needle.to_lowercase()) {
                            info!(target = "playback", device = %name, "Selected output device");
                            return Some(dev);
                        }
                    }
                }
                warn!(target = "playback", needle, "No output device matched; using default");
            }
            Err(e) => warn!(target = "playback", error = %e, "Failed to list output devices"),
        }
    }
    host.default_output_device()
}

fn render(
    clip: &Arc<Clip>,
    handle: &PlaybackHandle,
    device_name: Option<&str>,
) -> std::result::Result<(), String> {
    let host = cpal::default_host();
    let device = select_device(&host, device_name).ok_or("no output device available")?;
    let supported = device
        .default_output_config()
        .map_err(|e| format!("failed to query output config: {e}"))?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels as usize;
    let step = clip.sample_rate() as f64 / config.sample_rate.0 as f64;

    let err_view = handle.clone();
    let on_error = move |e: cpal::StreamError| err_view.fail(format!("stream error: {e}"));

    // Position is tracked in fractional source frames so any device rate works.
    let stream = match sample_format {
        cpal::SampleFormat::F32 => {
            let mut cursor = 0f64;
            let clip = Arc::clone(clip);
            let view = handle.clone();
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _| {
                    fill(data, channels, &clip, &view, &mut cursor, step, |s| s)
                },
                on_error,
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let mut cursor = 0f64;
            let clip = Arc::clone(clip);
            let view = handle.clone();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _| {
                    fill(data, channels, &clip, &view, &mut cursor, step, |s| {
                        (s * i16::MAX as f32) as i16
                    })
                },
                on_error,
                None,
            )
        }
        other => return Err(format!("unsupported output sample format {other:?}")),
    }
    .map_err(|e| format!("failed to build output stream: {e}"))?;

    stream
        .play()
        .map_err(|e| format!("failed to start output stream: {e}"))?;

    while !handle.is_finished() {
        std::thread::sleep(Duration::from_millis(10));
    }
    drop(stream);
    Ok(())
}

fn fill<T: Copy + Default>(
    data: &mut [T],
    channels: usize,
    clip: &Clip,
    handle: &PlaybackHandle,
    cursor: &mut f64,
    step: f64,
    convert: impl Fn(f32) -> T,
) {
    let samples = clip.samples();
    let gain = handle.gain();
    let stopped = handle.is_stopped();
    for frame in data.chunks_mut(channels.max(1)) {
        let index = *cursor as usize;
        let value = if stopped || index >= samples.len() {
            T::default()
        } else {
            convert(samples[index] * gain)
        };
        frame.iter_mut().for_each(|s| *s = value);
        if index < samples.len() {
            *cursor += step;
        }
    }
    let position = (*cursor as u64).min(clip.frames());
    handle.set_position(position);
    if position >= clip.frames() {
        handle.mark_finished();
    }
}
