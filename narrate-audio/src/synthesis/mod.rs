//! Synthesis adapter and backends.
//!
//! [`SynthesisAdapter`] implements the narrator's [`SpeechSynthesizer`] seam:
//! strip markup, optionally translate, dispatch to exactly one [`SpeechBackend`].
//! Every call is tracked in an active-request set so `abort_all` reaches all of them.

pub mod duplex;
pub mod frames;
pub mod rest;

pub use duplex::DuplexBackend;
pub use frames::{ClientFrame, ServerEvent};
pub use rest::{CloudRestBackend, LocalRestBackend};

use crate::translate::{ChatTranslator, Translator};
use async_trait::async_trait;
use dashmap::DashMap;
use narrate_core::text::markup::{is_speakable, strip_markup};
use narrate_core::{
    BackendKind, CancelFlag, NarrateError, NarratorConfig, Result, SpeechSynthesizer,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One synthesis service. Implementations return the complete audio of `text`, or
/// `NarrateError::Cancelled` once `cancel` fires.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn synthesize(&self, text: &str, cancel: &CancelFlag) -> Result<Vec<u8>>;
}

/// Removes a request from the active set when the call finishes, however it ends.
struct ActiveGuard<'a> {
    active: &'a DashMap<u64, CancelFlag>,
    id: u64,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

pub struct SynthesisAdapter {
    backend: Arc<dyn SpeechBackend>,
    translator: Option<Arc<dyn Translator>>,
    active: DashMap<u64, CancelFlag>,
    next_request: AtomicU64,
}

impl SynthesisAdapter {
    pub fn new(backend: Arc<dyn SpeechBackend>) -> Self {
        Self {
            backend,
            translator: None,
            active: DashMap::new(),
            next_request: AtomicU64::new(0),
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    /// Build the backend (and translator, if enabled) named by `cfg`.
    pub fn from_config(cfg: &NarratorConfig) -> Result<Self> {
        cfg.validate()?;
        let timeout = Duration::from_millis(cfg.request_timeout_ms);
        let backend: Arc<dyn SpeechBackend> = match cfg.backend {
            BackendKind::Local => Arc::new(LocalRestBackend::local(
                &cfg.local,
                &cfg.language,
                timeout,
            )?),
            BackendKind::Gateway => Arc::new(LocalRestBackend::gateway(
                &cfg.gateway,
                &cfg.language,
                timeout,
            )?),
            BackendKind::CloudRest => Arc::new(CloudRestBackend::new(cfg.cloud.clone(), timeout)?),
            BackendKind::StreamingProvider => {
                Arc::new(DuplexBackend::new(cfg.duplex.clone(), timeout))
            }
        };
        let mut adapter = Self::new(backend);
        if cfg.translation.enabled {
            adapter = adapter.with_translator(Arc::new(ChatTranslator::new(
                cfg.translation.clone(),
                timeout,
            )?));
        }
        info!(
            target = "synthesis",
            backend = adapter.backend.name(),
            translation = cfg.translation.enabled,
            "Synthesis adapter ready"
        );
        Ok(adapter)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    async fn translate_or_original(&self, text: String, cancel: &CancelFlag) -> Result<String> {
        let Some(translator) = &self.translator else {
            return Ok(text);
        };
        tokio::select! {
            translated = translator.translate(&text) => match translated {
                Ok(t) if !t.trim().is_empty() => Ok(t),
                Ok(_) => Ok(text),
                Err(e) => {
                    warn!(target = "translate", error = %e, "Translation failed; using original text");
                    Ok(text)
                }
            },
            _ = cancel.cancelled() => Err(NarrateError::Cancelled),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for SynthesisAdapter {
    async fn synthesize(&self, segment: &str) -> Result<Option<Vec<u8>>> {
        let text = strip_markup(segment).trim().to_string();
        if !is_speakable(&text) {
            debug!(target = "synthesis", segment, "Nothing speakable; no request made");
            return Ok(None);
        }

        let id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let cancel = CancelFlag::new();
        self.active.insert(id, cancel.clone());
        let _guard = ActiveGuard {
            active: &self.active,
            id,
        };

        let text = self.translate_or_original(text, &cancel).await?;
        if cancel.is_cancelled() {
            return Err(NarrateError::Cancelled);
        }
        let audio = self.backend.synthesize(&text, &cancel).await?;
        if cancel.is_cancelled() {
            return Err(NarrateError::Cancelled);
        }
        if audio.is_empty() {
            return Err(NarrateError::Backend(format!(
                "{} returned empty audio",
                self.backend.name()
            )));
        }
        debug!(
            target = "synthesis",
            backend = self.backend.name(),
            bytes = audio.len(),
            "Segment synthesized"
        );
        Ok(Some(audio))
    }

    fn abort_all(&self) {
        let mut aborted = 0usize;
        for entry in self.active.iter() {
            entry.value().cancel();
            aborted += 1;
        }
        if aborted > 0 {
            debug!(target = "synthesis", aborted, "Aborted in-flight synthesis requests");
        }
    }
}
