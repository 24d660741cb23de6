use std::fs;
use std::path::Path;

use narrate_core::NarratorConfig;
use serde::Deserialize;

/// High-level configuration for the narrator demo
#[derive(Clone, Debug, Default)]
pub struct DemoConfig {
    pub narrator: NarratorConfig,
    pub stream: StreamConfig,
}

/// How stdin lines are replayed as a streamed response
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Characters per simulated chunk
    pub chunk_chars: usize,
    pub chunk_delay_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_chars: std::env::var("DEMO_CHUNK_CHARS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(4),
            chunk_delay_ms: std::env::var("DEMO_CHUNK_DELAY_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60),
        }
    }
}

impl DemoConfig {
    /// Load configuration from a TOML file (path via NARRATOR_CONFIG or ./narrator.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("NARRATOR_CONFIG").unwrap_or_else(|_| "narrator.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target = "narrator", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<DemoToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target = "narrator", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target = "narrator", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }
}

// Every narrator struct is `#[serde(default)]`, so a present section already carries
// the env-driven defaults for the keys it omits.
#[derive(Debug, Default, Deserialize)]
struct DemoToml {
    narrator: Option<NarratorConfig>,
    stream: Option<StreamConfig>,
}

impl DemoToml {
    fn overlay(self, mut base: DemoConfig) -> DemoConfig {
        if let Some(n) = self.narrator {
            base.narrator = n;
        }
        if let Some(s) = self.stream {
            base.stream = s;
        }
        base
    }
}
