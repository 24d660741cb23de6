//! Pipeline coordinator.
//!
//! Two loops live for as long as the narrator does:
//! - synthesis: pending segment → [`SpeechSynthesizer`] → ready-audio queue
//! - playback: ready-audio queue → [`SegmentPlayer`]
//!
//! Each loop holds a single-slot gate (`synthesizing` / `playing`) and re-polls on
//! `poll_interval_ms`, so segment N+1 is synthesized while segment N plays and the
//! spoken order still equals the enqueue order.
//!
//! The first genuine synthesis failure trips the breaker. From then on every segment
//! is revealed by the fallback typewriter instead of audio, until `interrupt()`.

use crate::config::NarratorConfig;
use crate::playback::SegmentPlayer;
use crate::session::{
    resolve_once, AudioPackage, SessionHandle, SessionOutcome, SessionSignal, SessionState,
};
use crate::sink::NarrationSink;
use crate::synth::SpeechSynthesizer;
use crate::text::markup::strip_markup;
use crate::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Streaming narration coordinator. See the module docs.
pub struct Narrator {
    inner: Arc<Inner>,
    loops: Vec<JoinHandle<()>>,
}

struct Inner {
    cfg: NarratorConfig,
    synth: Arc<dyn SpeechSynthesizer>,
    player: Arc<dyn SegmentPlayer>,
    sink: Arc<dyn NarrationSink>,
    runtime: Handle,
    state: Mutex<SessionState>,
    next_id: AtomicU64,
    /// Backend judged unavailable; survives reset(), cleared by interrupt().
    breaker: AtomicBool,
    /// Loops take no new work while set.
    stopping: AtomicBool,
    stop_generation: AtomicU64,
    signals: broadcast::Sender<SessionSignal>,
}

/// A session that just began.
struct Begun {
    id: u64,
    /// Transcript of a completing session cut short by this one.
    ended_previous: Option<String>,
}

impl Narrator {
    /// Validate `cfg` and spawn both loops on the current runtime.
    pub async fn start(
        cfg: NarratorConfig,
        synth: Arc<dyn SpeechSynthesizer>,
        player: Arc<dyn SegmentPlayer>,
        sink: Arc<dyn NarrationSink>,
    ) -> Result<Self> {
        cfg.validate()?;
        let (signals, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            state: Mutex::new(SessionState::new(0, &cfg.punctuation)),
            cfg,
            synth,
            player,
            sink,
            runtime: Handle::current(),
            next_id: AtomicU64::new(0),
            breaker: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stop_generation: AtomicU64::new(0),
            signals,
        });

        let synthesis = tokio::spawn(Arc::clone(&inner).synthesis_loop());
        let playback = tokio::spawn(Arc::clone(&inner).playback_loop());
        info!(
            target = "narrator",
            backend = ?inner.cfg.backend,
            poll_ms = inner.cfg.poll_interval_ms,
            "Narrator started"
        );
        Ok(Self {
            inner,
            loops: vec![synthesis, playback],
        })
    }

    /// Append a chunk of a streamed response. Starts a session if none is active.
    pub fn feed_streaming_text(&self, chunk: &str) {
        self.inner.feed(chunk);
    }

    /// Mark the streamed response as finished, flushing any partial segment.
    pub fn finalize_stream(&self) {
        self.inner.finalize();
    }

    /// Narrate a complete text. The handle resolves when the session ends.
    pub fn narrate_complete(&self, text: &str) -> SessionHandle {
        self.inner.narrate(text)
    }

    /// Handle of the session in progress, if any.
    pub fn session_handle(&self) -> Option<SessionHandle> {
        let st = self.inner.state();
        st.has_session().then(|| st.handle())
    }

    /// Barge-in: abandon the current session and clear the breaker.
    pub fn interrupt(&self) {
        self.inner.interrupt();
    }

    /// Drop the current session between responses of one turn. Keeps the breaker.
    pub fn reset(&self) {
        self.inner.reset();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.inner.signals.subscribe()
    }

    pub fn breaker_tripped(&self) -> bool {
        self.inner.breaker.load(Ordering::SeqCst)
    }

    /// No session owned and the loops are accepting work.
    pub fn is_idle(&self) -> bool {
        !self.inner.state().has_session() && !self.inner.stopping.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &NarratorConfig {
        &self.inner.cfg
    }
}

impl Drop for Narrator {
    fn drop(&mut self) {
        for handle in &self.loops {
            handle.abort();
        }
        self.inner.synth.abort_all();
        self.inner.player.stop();
        let mut st = self.inner.state();
        st.cancel.cancel();
        st.typewriter.clear();
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fresh_state(&self) -> SessionState {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        SessionState::new(id, &self.cfg.punctuation)
    }

    fn begin_locked(&self, st: &mut SessionState, streaming: bool) -> Option<Begun> {
        if st.active {
            return None;
        }
        let ended_previous = st.completing.then(|| std::mem::take(&mut st.full_text));
        *st = self.fresh_state();
        st.active = true;
        st.stream_open = streaming;
        Some(Begun {
            id: st.id,
            ended_previous,
        })
    }

    fn announce(&self, begun: Option<Begun>) {
        let Some(begun) = begun else {
            return;
        };
        if let Some(transcript) = begun.ended_previous {
            if !transcript.trim().is_empty() {
                self.sink.on_transcript(&transcript);
            }
            self.sink.on_session_end();
        }
        self.sink.on_session_start();
        let _ = self.signals.send(SessionSignal::Started {
            session: begun.id,
            at: Utc::now(),
        });
        info!(target = "narrator", session = begun.id, "Narration session started");
    }

    fn enqueue_locked(&self, st: &mut SessionState, segment: String) {
        if !st.push_segment(segment, self.cfg.max_pending_segments) {
            debug!(
                target = "narrator",
                session = st.id,
                "Segment queue full; coalesced into last pending segment"
            );
        }
    }

    fn feed(&self, chunk: &str) {
        let begun = {
            let mut st = self.state();
            let begun = self.begin_locked(&mut st, true);
            st.stream_open = true;
            st.full_text.push_str(chunk);
            for segment in st.segmenter.feed(chunk) {
                self.enqueue_locked(&mut st, segment);
            }
            begun
        };
        self.announce(begun);
    }

    fn finalize(self: &Arc<Self>) {
        let session = {
            let mut st = self.state();
            if !st.active {
                return;
            }
            st.stream_open = false;
            for segment in st.segmenter.finalize() {
                self.enqueue_locked(&mut st, segment);
            }
            st.id
        };
        self.check_completion(session);
    }

    fn narrate(self: &Arc<Self>, text: &str) -> SessionHandle {
        let (handle, begun) = {
            let mut st = self.state();
            let begun = self.begin_locked(&mut st, false);
            st.full_text.push_str(text);
            for segment in st.segmenter.segment_whole(text) {
                self.enqueue_locked(&mut st, segment);
            }
            (st.handle(), begun)
        };
        let session = handle.id();
        self.announce(begun);
        self.check_completion(session);
        handle
    }

    fn interrupt(self: &Arc<Self>) {
        let generation = self.stop_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.stopping.store(true, Ordering::SeqCst);
        if self.breaker.swap(false, Ordering::SeqCst) {
            info!(target = "narrator", "Breaker cleared by interrupt");
        }

        self.synth.abort_all();
        self.state().cancel.cancel();
        self.player.stop();

        let mut old = {
            let mut st = self.state();
            let fresh = self.fresh_state();
            std::mem::replace(&mut *st, fresh)
        };
        old.typewriter.clear();

        self.sink.on_amplitude(0.0);
        self.sink.on_caption_hidden();

        if old.has_session() {
            if !old.full_text.trim().is_empty() {
                self.sink.on_transcript(&old.full_text);
            }
            self.sink.on_session_end();
            if old.resolve(SessionOutcome::Interrupted) {
                let _ = self.signals.send(SessionSignal::Ended {
                    session: old.id,
                    outcome: SessionOutcome::Interrupted,
                    at: Utc::now(),
                });
            }
            info!(target = "narrator", session = old.id, "Narration interrupted");
        } else {
            debug!(target = "narrator", "Interrupt with no session in progress");
        }

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(inner.cfg.interrupt_cooldown()).await;
            if inner.stop_generation.load(Ordering::SeqCst) == generation {
                inner.stopping.store(false, Ordering::SeqCst);
                debug!(target = "narrator", "Loops re-armed after interrupt");
            }
        });
    }

    fn reset(&self) {
        self.synth.abort_all();
        self.state().cancel.cancel();
        self.player.stop();

        let mut old = {
            let mut st = self.state();
            let fresh = self.fresh_state();
            std::mem::replace(&mut *st, fresh)
        };
        old.typewriter.clear();

        if old.playing {
            self.sink.on_amplitude(0.0);
        }
        if old.has_session() && old.resolve(SessionOutcome::Superseded) {
            let _ = self.signals.send(SessionSignal::Ended {
                session: old.id,
                outcome: SessionOutcome::Superseded,
                at: Utc::now(),
            });
        }
        info!(
            target = "narrator",
            session = old.id,
            breaker = self.breaker.load(Ordering::SeqCst),
            "Narration state reset"
        );
    }

    async fn synthesis_loop(self: Arc<Self>) {
        loop {
            self.synthesis_step().await;
            tokio::time::sleep(self.cfg.poll_interval()).await;
        }
    }

    async fn synthesis_step(self: &Arc<Self>) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let (session, segment) = {
            let mut st = self.state();
            if st.synthesizing || st.audio.len() >= self.cfg.max_ready_audio {
                return;
            }
            let Some(segment) = st.segments.pop_front() else {
                return;
            };
            st.synthesizing = true;
            (st.id, segment)
        };

        if self.breaker.load(Ordering::SeqCst) {
            {
                let mut st = self.state();
                if st.id == session {
                    st.synthesizing = false;
                    self.type_out(&mut st, &segment);
                }
            }
            self.check_completion(session);
            return;
        }

        debug!(target = "narrator", session, text = %segment, "Synthesizing segment");
        let result = self.synth.synthesize(&segment).await;

        {
            let mut st = self.state();
            if st.id != session {
                debug!(
                    target = "narrator",
                    session, "Discarding synthesis result of an abandoned session"
                );
                return;
            }
            st.synthesizing = false;
            match result {
                Ok(Some(audio)) => st.audio.push_back(AudioPackage {
                    audio,
                    source_text: segment,
                }),
                Ok(None) => {
                    debug!(target = "narrator", session, "Segment has nothing to say; skipped")
                }
                Err(e) if e.is_cancelled() => {
                    debug!(target = "narrator", session, "Synthesis cancelled")
                }
                Err(e) => {
                    if !self.breaker.swap(true, Ordering::SeqCst) {
                        warn!(
                            target = "narrator",
                            session,
                            error = %e,
                            "Synthesis failed; typing out the rest of the session"
                        );
                    }
                    self.type_out(&mut st, &segment);
                }
            }
        }
        self.check_completion(session);
    }

    async fn playback_loop(self: Arc<Self>) {
        loop {
            self.playback_step().await;
            tokio::time::sleep(self.cfg.poll_interval()).await;
        }
    }

    async fn playback_step(self: &Arc<Self>) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let (session, package, prefix, cancel) = {
            let mut st = self.state();
            if st.playing {
                return;
            }
            let Some(package) = st.audio.pop_front() else {
                return;
            };
            st.playing = true;
            (st.id, package, st.displayed.clone(), st.cancel.clone())
        };

        let outcome = self
            .player
            .play(package, prefix, Arc::clone(&self.sink), cancel)
            .await;

        {
            let mut st = self.state();
            if st.id != session {
                return;
            }
            st.playing = false;
            st.displayed = outcome.displayed;
            if !outcome.completed {
                warn!(
                    target = "narrator",
                    session, "Segment playback did not complete; continuing"
                );
            }
        }
        self.check_completion(session);
    }

    /// Route a segment's display text to the typewriter, starting its timer if idle.
    fn type_out(self: &Arc<Self>, st: &mut SessionState, text: &str) {
        st.typewriter_used = true;
        if st.typewriter.push(&strip_markup(text)) {
            let inner = Arc::clone(self);
            let session = st.id;
            let task = self
                .runtime
                .spawn(async move { inner.typewriter_loop(session).await });
            st.typewriter.set_task(task.abort_handle());
        }
    }

    async fn typewriter_loop(self: Arc<Self>, session: u64) {
        let interval = self.cfg.fallback_char_interval();
        loop {
            tokio::time::sleep(interval).await;
            let revealed = {
                let mut st = self.state();
                if st.id != session {
                    return;
                }
                // Audio queued before the breaker tripped owns the caption first.
                if st.playing || !st.audio.is_empty() {
                    continue;
                }
                match st.typewriter.pop() {
                    Some(c) => {
                        st.displayed.push(c);
                        Some((st.displayed.clone(), st.typewriter.is_running()))
                    }
                    None => None,
                }
            };
            match revealed {
                Some((caption, more)) => {
                    self.sink.on_caption_update(&caption);
                    if !more {
                        break;
                    }
                }
                None => break,
            }
        }
        self.check_completion(session);
    }

    /// Declare the session complete once everything has drained.
    fn check_completion(self: &Arc<Self>, session: u64) {
        let (completion, hold) = {
            let mut st = self.state();
            if st.id != session || !st.active || !st.is_quiescent() {
                return;
            }
            st.active = false;
            st.completing = true;
            (
                Arc::clone(&st.completion),
                self.cfg.hold_for(st.typewriter_used),
            )
        };
        debug!(
            target = "narrator",
            session,
            hold_ms = hold.as_millis() as u64,
            "Narration drained; holding caption"
        );
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(hold).await;
            inner.finish_session(session, completion);
        });
    }

    fn finish_session(
        &self,
        session: u64,
        completion: Arc<watch::Sender<Option<SessionOutcome>>>,
    ) {
        let transcript = {
            let mut st = self.state();
            if st.id == session && st.completing {
                st.completing = false;
                Some(std::mem::take(&mut st.full_text))
            } else {
                None
            }
        };
        if let Some(text) = transcript {
            self.sink.on_caption_hidden();
            if !text.trim().is_empty() {
                self.sink.on_transcript(&text);
            }
            self.sink.on_session_end();
        }
        if resolve_once(&completion, SessionOutcome::Completed) {
            let _ = self.signals.send(SessionSignal::Ended {
                session,
                outcome: SessionOutcome::Completed,
                at: Utc::now(),
            });
            info!(target = "narrator", session, "Narration session complete");
        }
    }
}
