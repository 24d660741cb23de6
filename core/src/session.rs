//! Per-session state and the handles callers use to observe a session.

use crate::cancel::CancelFlag;
use crate::text::segmenter::TextSegmenter;
use crate::typewriter::Typewriter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

/// Synthesized audio paired with the exact text that produced it.
#[derive(Clone, Debug)]
pub struct AudioPackage {
    pub audio: Vec<u8>,
    pub source_text: String,
}

/// How a narration session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Everything queued was spoken (or typed) and the caption hold elapsed.
    Completed,
    /// Abandoned by `interrupt()`.
    Interrupted,
    /// Dropped by `reset()` before completing.
    Superseded,
}

/// Lifecycle signals broadcast to external observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionSignal {
    Started {
        session: u64,
        at: DateTime<Utc>,
    },
    Ended {
        session: u64,
        outcome: SessionOutcome,
        at: DateTime<Utc>,
    },
}

/// Awaitable completion of one session.
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    rx: watch::Receiver<Option<SessionOutcome>>,
}

impl SessionHandle {
    pub(crate) fn new(id: u64, rx: watch::Receiver<Option<SessionOutcome>>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current outcome without waiting.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        *self.rx.borrow()
    }

    /// Wait for the session to end. A dropped coordinator counts as interrupted.
    pub async fn wait(mut self) -> SessionOutcome {
        loop {
            if let Some(outcome) = *self.rx.borrow_and_update() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                return self.outcome().unwrap_or(SessionOutcome::Interrupted);
            }
        }
    }
}

/// Mutable state of the session currently owned by the narrator.
///
/// `id` is bumped whenever a session begins or state is torn down; results from
/// synthesis, playback and typewriter ticks are discarded unless their captured id
/// still matches.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub id: u64,
    /// A session has begun and has not yet been declared complete.
    pub active: bool,
    /// Declared complete; the caption hold has not elapsed yet.
    pub completing: bool,
    /// The caller has not finalized the stream yet.
    pub stream_open: bool,
    pub segments: VecDeque<String>,
    pub audio: VecDeque<AudioPackage>,
    pub synthesizing: bool,
    pub playing: bool,
    pub segmenter: TextSegmenter,
    /// Full response text for the transcript sink.
    pub full_text: String,
    /// Caption text shown so far in this session.
    pub displayed: String,
    pub typewriter: Typewriter,
    pub typewriter_used: bool,
    /// Shared with the caption-hold task so the handle outlives this state.
    pub completion: Arc<watch::Sender<Option<SessionOutcome>>>,
    /// Cancelled when this state is torn down; playback watches it.
    pub cancel: CancelFlag,
}

impl SessionState {
    pub fn new(id: u64, punctuation: &str) -> Self {
        Self {
            id,
            active: false,
            completing: false,
            stream_open: false,
            segments: VecDeque::new(),
            audio: VecDeque::new(),
            synthesizing: false,
            playing: false,
            segmenter: TextSegmenter::new(punctuation),
            full_text: String::new(),
            displayed: String::new(),
            typewriter: Typewriter::default(),
            typewriter_used: false,
            completion: Arc::new(watch::channel(None).0),
            cancel: CancelFlag::new(),
        }
    }

    /// Owns a session that has not ended yet.
    pub fn has_session(&self) -> bool {
        self.active || self.completing
    }

    /// Nothing left to synthesize, play or type, and no more text is coming.
    pub fn is_quiescent(&self) -> bool {
        !self.stream_open
            && self.segments.is_empty()
            && self.audio.is_empty()
            && !self.synthesizing
            && !self.playing
            && !self.segmenter.has_pending()
            && self.typewriter.is_idle()
    }

    /// Queue a segment, merging into the last one once the queue is at capacity.
    pub fn push_segment(&mut self, segment: String, capacity: usize) -> bool {
        if self.segments.len() >= capacity {
            if let Some(last) = self.segments.back_mut() {
                last.push_str(&segment);
                return false;
            }
        }
        self.segments.push_back(segment);
        true
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.id, self.completion.subscribe())
    }

    pub fn resolve(&self, outcome: SessionOutcome) -> bool {
        resolve_once(&self.completion, outcome)
    }
}

/// Set the outcome unless one is already recorded; true if this call set it.
pub(crate) fn resolve_once(
    completion: &watch::Sender<Option<SessionOutcome>>,
    outcome: SessionOutcome,
) -> bool {
    completion.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(outcome);
        true
    })
}
