//! Pre-synthesis translation through an OpenAI-compatible chat endpoint.

use async_trait::async_trait;
use narrate_core::{NarrateError, Result, TranslationConfig};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error};

/// Translates one segment before it is synthesized.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str) -> Result<String>;
}

/// [`Translator`] backed by `POST {endpoint}/chat/completions`.
#[derive(Clone)]
pub struct ChatTranslator {
    http: Client,
    cfg: TranslationConfig,
}

impl ChatTranslator {
    pub fn new(cfg: TranslationConfig, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NarrateError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    fn system_prompt(&self) -> String {
        format!(
            "Translate the user's text into {}. Reply with the translation only, \
             keeping punctuation and tone. Do not explain.",
            self.cfg.target_language
        )
    }
}

#[async_trait]
impl Translator for ChatTranslator {
    async fn translate(&self, text: &str) -> Result<String> {
        let url = format!(
            "{}/chat/completions",
            self.cfg.endpoint.trim_end_matches('/')
        );
        debug!(target = "translate", "POST {} via Chat Completions", url);

        let mut req = self
            .http
            .post(&url)
            .header("content-type", "application/json");
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }
        let body = json!({
            "model": self.cfg.model,
            "messages": [
                { "role": "system", "content": self.system_prompt() },
                { "role": "user", "content": text },
            ],
            "temperature": 0.2,
        });

        let resp = req
            .json(&body)
            .send()
            .await
            .map_err(|e| NarrateError::Translation(format!("HTTP error: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            error!(target = "translate", %status, body = %text, "Chat Completions error");
            return Err(NarrateError::Translation(format!(
                "status={} body={}",
                status, text
            )));
        }

        let val: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| NarrateError::Translation(format!("Failed to parse JSON: {e}")))?;
        extract_text_from_chat_completions(&val)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                NarrateError::Translation("Missing choices[0].message.content".into())
            })
    }
}

fn extract_text_from_chat_completions(v: &serde_json::Value) -> Option<String> {
    v.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}
