//! Decoding synthesized audio into mono samples.
//!
//! Backends return WAV or MP3. Both are decoded to mono `f32` in `-1.0..=1.0` at the
//! source rate; stereo and wider layouts are averaged down.

use narrate_core::{NarrateError, Result};
use std::io::Cursor;
use std::time::Duration;

/// Decoded, mono audio ready for an output.
#[derive(Clone, Debug)]
pub struct Clip {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl Clip {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate: sample_rate.max(1),
        }
    }

    /// Sniff the container and decode.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            return Self::from_wav(bytes);
        }
        let mpeg_sync = bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0;
        if bytes.starts_with(b"ID3") || mpeg_sync {
            return Self::from_mp3(bytes);
        }
        Err(NarrateError::Decode(format!(
            "unrecognized audio container ({} bytes)",
            bytes.len()
        )))
    }

    pub fn from_wav(bytes: &[u8]) -> Result<Self> {
        let reader = hound::WavReader::new(Cursor::new(bytes))
            .map_err(|e| NarrateError::Decode(format!("WAV header: {e}")))?;
        let spec = reader.spec();
        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
                .into_samples::<i16>()
                .filter_map(|s| s.ok())
                .map(|s| s as f32 / 32_768.0)
                .collect(),
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .filter_map(|s| s.ok())
                    .map(|s| s as f32 / scale)
                    .collect()
            }
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .filter_map(|s| s.ok())
                .collect(),
        };
        let samples = downmix(&interleaved, spec.channels as usize);
        if samples.is_empty() {
            return Err(NarrateError::Decode("WAV contains no samples".into()));
        }
        Ok(Self::new(samples, spec.sample_rate))
    }

    pub fn from_mp3(bytes: &[u8]) -> Result<Self> {
        use minimp3::{Decoder, Frame};

        let mut decoder = Decoder::new(Cursor::new(bytes));
        let mut samples = Vec::new();
        let mut sample_rate = 0u32;
        loop {
            match decoder.next_frame() {
                Ok(Frame {
                    data,
                    sample_rate: rate,
                    channels,
                    ..
                }) => {
                    sample_rate = rate as u32;
                    let frame: Vec<f32> = data.iter().map(|&s| s as f32 / 32_768.0).collect();
                    samples.extend(downmix(&frame, channels));
                }
                Err(minimp3::Error::Eof) => break,
                Err(e) => {
                    if samples.is_empty() {
                        return Err(NarrateError::Decode(format!("MP3: {e:?}")));
                    }
                    break;
                }
            }
        }
        if samples.is_empty() || sample_rate == 0 {
            return Err(NarrateError::Decode("MP3 contains no frames".into()));
        }
        Ok(Self::new(samples, sample_rate))
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Length in frames (one sample per frame, the clip is mono).
    pub fn frames(&self) -> u64 {
        self.samples.len() as u64
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn frames_for(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * self.sample_rate as f64) as u64
    }

    /// RMS of the `window` samples that end at `position`.
    pub fn rms_before(&self, position: u64, window: usize) -> f32 {
        let end = (position as usize).min(self.samples.len());
        let start = end.saturating_sub(window);
        let slice = &self.samples[start..end];
        if slice.is_empty() {
            return 0.0;
        }
        let sum: f32 = slice.iter().map(|s| s * s).sum();
        (sum / slice.len() as f32).sqrt()
    }
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Wrap raw little-endian 16-bit PCM in a WAV container.
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| NarrateError::Decode(format!("WAV writer: {e}")))?;
        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| NarrateError::Decode(format!("WAV write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| NarrateError::Decode(format!("WAV finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}

/// Encode mono `f32` samples as a 16-bit WAV.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let pcm: Vec<u8> = samples
        .iter()
        .flat_map(|s| ((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).to_le_bytes())
        .collect();
    pcm16_to_wav(&pcm, sample_rate, 1)
}
