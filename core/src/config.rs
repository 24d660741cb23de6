//! Narrator configuration.
//!
//! Every struct carries env-driven defaults so an unconfigured process still runs
//! against a local synthesis endpoint. All fields are `#[serde(default)]`, which lets
//! a partial TOML file override only what it names.
//!
//! Env overrides:
//! - NARRATE_BACKEND (local|gateway|cloud_rest|streaming_provider), NARRATE_LANGUAGE
//! - TTS_LOCAL_URL, TTS_GATEWAY_URL, TTS_GATEWAY_API_KEY
//! - TTS_CLOUD_BASE_URL, TTS_CLOUD_API_KEY, TTS_CLOUD_MODEL, TTS_CLOUD_VOICE
//! - TTS_STREAM_URL, TTS_STREAM_API_KEY, TTS_STREAM_MODEL, TTS_STREAM_VOICE
//! - TRANSLATE_ENABLED, TRANSLATE_BASE_URL, TRANSLATE_MODEL, TRANSLATE_API_KEY, TRANSLATE_TARGET

use crate::{NarrateError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Default segment-closing punctuation: ASCII and full-width forms.
pub const DEFAULT_PUNCTUATION: &str = "，,。.？?！!；;：:";

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// Which synthesis backend handles every segment of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
    Gateway,
    CloudRest,
    StreamingProvider,
}

impl FromStr for BackendKind {
    type Err = NarrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "local" => Ok(BackendKind::Local),
            "gateway" => Ok(BackendKind::Gateway),
            "cloud_rest" | "cloud" => Ok(BackendKind::CloudRest),
            "streaming_provider" | "streaming" | "duplex" => Ok(BackendKind::StreamingProvider),
            other => Err(NarrateError::Config(format!("unknown backend '{other}'"))),
        }
    }
}

/// Local or gateway REST endpoint: `POST {text, language}` returns audio bytes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalRestConfig {
    pub url: String,
    /// Sent as `x-api-key`; only the gateway variant requires it.
    pub api_key: Option<String>,
}

/// OpenAI-style cloud speech endpoint: `POST {model, voice, input, format, speed}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudRestConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub format: String,
    pub speed: f32,
}

impl Default for CloudRestConfig {
    fn default() -> Self {
        Self {
            base_url: env_string("TTS_CLOUD_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: env_string("TTS_CLOUD_API_KEY"),
            model: env_string("TTS_CLOUD_MODEL").unwrap_or_else(|| "tts-1".to_string()),
            voice: env_string("TTS_CLOUD_VOICE").unwrap_or_else(|| "alloy".to_string()),
            format: "wav".to_string(),
            speed: 1.0,
        }
    }
}

/// Duplex streaming provider speaking the run-task/continue-task/finish-task protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplexConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    /// `pcm` frames are wrapped into a WAV container after assembly.
    pub format: String,
    pub sample_rate: u32,
    /// Socket read poll; bounds how quickly an abort is observed.
    pub read_poll_ms: u64,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            url: env_string("TTS_STREAM_URL")
                .unwrap_or_else(|| "wss://dashscope.aliyuncs.com/api-ws/v1/inference/".to_string()),
            api_key: env_string("TTS_STREAM_API_KEY"),
            model: env_string("TTS_STREAM_MODEL").unwrap_or_else(|| "cosyvoice-v1".to_string()),
            voice: env_string("TTS_STREAM_VOICE").unwrap_or_else(|| "longxiaochun".to_string()),
            format: "pcm".to_string(),
            sample_rate: 22_050,
            read_poll_ms: 200,
        }
    }
}

/// Optional pre-synthesis translation through an OpenAI-compatible chat endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub target_language: String,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: env_parse::<bool>("TRANSLATE_ENABLED").unwrap_or(false),
            endpoint: env_string("TRANSLATE_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8000/v1".to_string()),
            model: env_string("TRANSLATE_MODEL")
                .unwrap_or_else(|| "qwen2.5-0.5b-instruct".to_string()),
            api_key: env_string("TRANSLATE_API_KEY"),
            target_language: env_string("TRANSLATE_TARGET").unwrap_or_else(|| "ja".to_string()),
        }
    }
}

/// Top-level narrator configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarratorConfig {
    pub backend: BackendKind,
    /// Language code passed to REST backends
    pub language: String,
    /// HTTP client timeout for synthesis and translation requests
    pub request_timeout_ms: u64,
    pub local: LocalRestConfig,
    pub gateway: LocalRestConfig,
    pub cloud: CloudRestConfig,
    pub duplex: DuplexConfig,
    pub translation: TranslationConfig,
    /// Characters that close a segment
    pub punctuation: String,
    /// Re-poll delay of the synthesis and playback loops
    pub poll_interval_ms: u64,
    /// Time after interrupt() before the loops accept work again
    pub interrupt_cooldown_ms: u64,
    /// Per-character delay of the fallback typewriter
    pub fallback_char_interval_ms: u64,
    pub fade_out_ms: u64,
    pub caption_reveal_min_ms: u64,
    pub caption_reveal_max_ms: u64,
    /// Amplitude sampling period during playback
    pub amplitude_tick_ms: u64,
    /// Multiplier applied to window RMS before clamping to 0..=1
    pub amplitude_gain: f32,
    /// Caption hold after the last audio segment
    pub display_hold_ms: u64,
    /// Caption hold when the typewriter produced the caption
    pub typewriter_hold_ms: u64,
    /// Synthesized packages allowed to wait for playback
    pub max_ready_audio: usize,
    /// Pending segments before overflow is coalesced into the last one
    pub max_pending_segments: usize,
}

impl Default for NarratorConfig {
    fn default() -> Self {
        let backend = env_string("NARRATE_BACKEND")
            .and_then(|s| s.parse::<BackendKind>().ok())
            .unwrap_or_default();
        Self {
            backend,
            language: env_string("NARRATE_LANGUAGE").unwrap_or_else(|| "zh".to_string()),
            request_timeout_ms: env_parse("REQUEST_TIMEOUT_MS").unwrap_or(30_000),
            local: LocalRestConfig {
                url: env_string("TTS_LOCAL_URL")
                    .unwrap_or_else(|| "http://127.0.0.1:9880/tts".to_string()),
                api_key: None,
            },
            gateway: LocalRestConfig {
                url: env_string("TTS_GATEWAY_URL").unwrap_or_default(),
                api_key: env_string("TTS_GATEWAY_API_KEY"),
            },
            cloud: CloudRestConfig::default(),
            duplex: DuplexConfig::default(),
            translation: TranslationConfig::default(),
            punctuation: DEFAULT_PUNCTUATION.to_string(),
            poll_interval_ms: 50,
            interrupt_cooldown_ms: 300,
            fallback_char_interval_ms: 180,
            fade_out_ms: 150,
            caption_reveal_min_ms: 30,
            caption_reveal_max_ms: 200,
            amplitude_tick_ms: 16,
            amplitude_gain: 4.0,
            display_hold_ms: 1_000,
            typewriter_hold_ms: 3_000,
            max_ready_audio: 3,
            max_pending_segments: 64,
        }
    }
}

impl NarratorConfig {
    /// Check the configuration once, before any loop starts.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("fallback_char_interval_ms", self.fallback_char_interval_ms),
            ("caption_reveal_min_ms", self.caption_reveal_min_ms),
            ("amplitude_tick_ms", self.amplitude_tick_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(NarrateError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.caption_reveal_min_ms > self.caption_reveal_max_ms {
            return Err(NarrateError::Config(format!(
                "caption_reveal_min_ms ({}) exceeds caption_reveal_max_ms ({})",
                self.caption_reveal_min_ms, self.caption_reveal_max_ms
            )));
        }
        if self.max_ready_audio == 0 || self.max_pending_segments == 0 {
            return Err(NarrateError::Config("queue capacities must be at least 1".into()));
        }
        if self.punctuation.trim().is_empty() {
            return Err(NarrateError::Config("punctuation set is empty".into()));
        }
        if !(self.amplitude_gain.is_finite() && self.amplitude_gain > 0.0) {
            return Err(NarrateError::Config("amplitude_gain must be positive".into()));
        }

        match self.backend {
            BackendKind::Local => require("local.url", &self.local.url)?,
            BackendKind::Gateway => {
                require("gateway.url", &self.gateway.url)?;
                require_key("gateway.api_key", &self.gateway.api_key)?;
            }
            BackendKind::CloudRest => {
                require("cloud.base_url", &self.cloud.base_url)?;
                require("cloud.model", &self.cloud.model)?;
                require("cloud.voice", &self.cloud.voice)?;
                require_key("cloud.api_key", &self.cloud.api_key)?;
                if !self.cloud.speed.is_finite() || self.cloud.speed <= 0.0 {
                    return Err(NarrateError::Config("cloud.speed must be positive".into()));
                }
            }
            BackendKind::StreamingProvider => {
                require("duplex.url", &self.duplex.url)?;
                require("duplex.voice", &self.duplex.voice)?;
                require_key("duplex.api_key", &self.duplex.api_key)?;
                if self.duplex.sample_rate == 0 {
                    return Err(NarrateError::Config("duplex.sample_rate must be positive".into()));
                }
            }
        }

        if self.translation.enabled {
            require("translation.endpoint", &self.translation.endpoint)?;
            require("translation.model", &self.translation.model)?;
            require("translation.target_language", &self.translation.target_language)?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn interrupt_cooldown(&self) -> Duration {
        Duration::from_millis(self.interrupt_cooldown_ms)
    }

    pub fn fallback_char_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_char_interval_ms)
    }

    /// Display hold before the caption is hidden at session end.
    pub fn hold_for(&self, typewriter_used: bool) -> Duration {
        if typewriter_used {
            Duration::from_millis(self.typewriter_hold_ms)
        } else {
            Duration::from_millis(self.display_hold_ms)
        }
    }
}

fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(NarrateError::Config(format!("{name} is required for this backend")));
    }
    Ok(())
}

fn require_key(name: &str, value: &Option<String>) -> Result<()> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(NarrateError::Config(format!("{name} is required for this backend"))),
    }
}
