//! REST synthesis backends: local/gateway `{text, language}` and cloud speech.

use super::SpeechBackend;
use async_trait::async_trait;
use narrate_core::{CancelFlag, CloudRestConfig, LocalRestConfig, NarrateError, Result};
use reqwest::{Client, RequestBuilder};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error};

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| NarrateError::Config(format!("Failed to build HTTP client: {e}")))
}

/// Send `req` and read the body as audio, racing the request against `cancel`.
pub(crate) async fn fetch_audio(
    req: RequestBuilder,
    cancel: &CancelFlag,
    backend: &'static str,
) -> Result<Vec<u8>> {
    let request = async {
        let resp = req
            .send()
            .await
            .map_err(|e| NarrateError::Backend(format!("{backend} HTTP error: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            error!(target = "synthesis", backend, %status, body = %text, "Synthesis request rejected");
            return Err(NarrateError::Backend(format!(
                "{backend} error: status={} body={}",
                status, text
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| NarrateError::Backend(format!("{backend} body error: {e}")))?;
        Ok(bytes.to_vec())
    };
    tokio::select! {
        result = request => result,
        _ = cancel.cancelled() => Err(NarrateError::Cancelled),
    }
}

/// Local TTS server, or the same contract behind an authenticated gateway.
#[derive(Clone)]
pub struct LocalRestBackend {
    http: Client,
    url: String,
    api_key: Option<String>,
    language: String,
    name: &'static str,
}

impl LocalRestBackend {
    pub fn local(cfg: &LocalRestConfig, language: &str, timeout: Duration) -> Result<Self> {
        Self::build(cfg, language, timeout, "local")
    }

    /// Gateway variant; sends `x-api-key`.
    pub fn gateway(cfg: &LocalRestConfig, language: &str, timeout: Duration) -> Result<Self> {
        if cfg.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(NarrateError::Config("gateway api_key is required".into()));
        }
        Self::build(cfg, language, timeout, "gateway")
    }

    fn build(
        cfg: &LocalRestConfig,
        language: &str,
        timeout: Duration,
        name: &'static str,
    ) -> Result<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            url: cfg.url.clone(),
            api_key: cfg.api_key.clone().filter(|k| !k.is_empty()),
            language: language.to_string(),
            name,
        })
    }
}

#[async_trait]
impl SpeechBackend for LocalRestBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn synthesize(&self, text: &str, cancel: &CancelFlag) -> Result<Vec<u8>> {
        debug!(target = "synthesis", backend = self.name, "POST {}", self.url);
        let mut req = self.http.post(&self.url).json(&json!({
            "text": text,
            "language": self.language,
        }));
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        fetch_audio(req, cancel, self.name).await
    }
}

/// OpenAI-style `POST {base_url}/audio/speech` with bearer auth.
#[derive(Clone)]
pub struct CloudRestBackend {
    http: Client,
    cfg: CloudRestConfig,
}

impl CloudRestBackend {
    pub fn new(cfg: CloudRestConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            cfg,
        })
    }

    fn url(&self) -> String {
        format!("{}/audio/speech", self.cfg.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SpeechBackend for CloudRestBackend {
    fn name(&self) -> &'static str {
        "cloud_rest"
    }

    async fn synthesize(&self, text: &str, cancel: &CancelFlag) -> Result<Vec<u8>> {
        let url = self.url();
        debug!(target = "synthesis", backend = "cloud_rest", model = %self.cfg.model, "POST {}", url);
        let mut req = self.http.post(&url).json(&json!({
            "model": self.cfg.model,
            "voice": self.cfg.voice,
            "input": text,
            "format": self.cfg.format,
            "speed": self.cfg.speed,
        }));
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }
        fetch_audio(req, cancel, "cloud_rest").await
    }
}
