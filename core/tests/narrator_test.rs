use async_trait::async_trait;
use narrate_core::{
    strip_markup, AudioPackage, CancelFlag, NarrateError, NarrationSink, Narrator,
    NarratorConfig, PlaybackOutcome, Result, SegmentPlayer, SessionOutcome, SessionSignal,
    SpeechSynthesizer,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

// Synthesizer that takes `delay` per call and fails the calls listed in `fail_on`.
struct FakeSynth {
    delay: Duration,
    fail_on: Vec<usize>,
    calls: Mutex<Vec<(String, Instant)>>,
    aborts: AtomicUsize,
}

impl FakeSynth {
    fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            fail_on: vec![],
            calls: Mutex::new(vec![]),
            aborts: AtomicUsize::new(0),
        }
    }

    fn failing(delay_ms: u64, fail_on: Vec<usize>) -> Self {
        Self {
            fail_on,
            ..Self::new(delay_ms)
        }
    }

    fn texts(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynth {
    async fn synthesize(&self, segment: &str) -> Result<Option<Vec<u8>>> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((segment.to_string(), Instant::now()));
            calls.len()
        };
        sleep(self.delay).await;
        if self.fail_on.contains(&index) {
            return Err(NarrateError::Backend("service unavailable".into()));
        }
        Ok(Some(segment.as_bytes().to_vec()))
    }

    fn abort_all(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

// Player that "plays" each package for a fixed time.
struct FakePlayer {
    duration: Duration,
    plays: Mutex<Vec<(String, Instant, Instant)>>,
}

impl FakePlayer {
    fn new(duration_ms: u64) -> Self {
        Self {
            duration: Duration::from_millis(duration_ms),
            plays: Mutex::new(vec![]),
        }
    }

    fn texts(&self) -> Vec<String> {
        self.plays.lock().unwrap().iter().map(|(t, _, _)| t.clone()).collect()
    }
}

#[async_trait]
impl SegmentPlayer for FakePlayer {
    async fn play(
        &self,
        package: AudioPackage,
        caption_prefix: String,
        sink: Arc<dyn NarrationSink>,
        cancel: CancelFlag,
    ) -> PlaybackOutcome {
        let started = Instant::now();
        let display = strip_markup(&package.source_text);
        sink.on_playback_start(&display);
        sink.on_amplitude(0.5);
        let completed = tokio::select! {
            _ = sleep(self.duration) => true,
            _ = cancel.cancelled() => false,
        };
        self.plays
            .lock()
            .unwrap()
            .push((package.source_text, started, Instant::now()));
        if !completed {
            return PlaybackOutcome {
                completed,
                displayed: caption_prefix,
            };
        }
        sink.on_amplitude(0.0);
        let displayed = format!("{caption_prefix}{display}");
        sink.on_caption_update(&displayed);
        PlaybackOutcome {
            completed,
            displayed,
        }
    }

    fn stop(&self) {}
}

#[derive(Clone, Debug, PartialEq)]
enum Call {
    Amplitude(f32),
    Caption(String, Instant),
    Hidden,
    Start,
    End,
    Transcript(String),
}

#[derive(Default)]
struct RecordingSink {
    calls: Mutex<Vec<Call>>,
}

impl RecordingSink {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn captions(&self) -> Vec<(String, Instant)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Caption(text, at) => Some((text, at)),
                _ => None,
            })
            .collect()
    }

    fn count(&self, wanted: &Call) -> usize {
        self.calls().iter().filter(|c| *c == wanted).count()
    }
}

impl NarrationSink for RecordingSink {
    fn on_amplitude(&self, value: f32) {
        self.calls.lock().unwrap().push(Call::Amplitude(value));
    }
    fn on_caption_update(&self, text: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Caption(text.to_string(), Instant::now()));
    }
    fn on_caption_hidden(&self) {
        self.calls.lock().unwrap().push(Call::Hidden);
    }
    fn on_session_start(&self) {
        self.calls.lock().unwrap().push(Call::Start);
    }
    fn on_session_end(&self) {
        self.calls.lock().unwrap().push(Call::End);
    }
    fn on_transcript(&self, text: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Transcript(text.to_string()));
    }
}

async fn narrator(
    synth: &Arc<FakeSynth>,
    player: &Arc<FakePlayer>,
    sink: &Arc<RecordingSink>,
) -> Narrator {
    Narrator::start(
        NarratorConfig::default(),
        synth.clone(),
        player.clone(),
        sink.clone(),
    )
    .await
    .expect("default config is valid")
}

#[tokio::test(start_paused = true)]
async fn synthesis_overlaps_playback_and_keeps_order() {
    let synth = Arc::new(FakeSynth::new(100));
    let player = Arc::new(FakePlayer::new(400));
    let sink = Arc::new(RecordingSink::default());
    let narrator = narrator(&synth, &player, &sink).await;

    let handle = narrator.narrate_complete("第一句。第二句。第三句。");
    assert_eq!(handle.wait().await, SessionOutcome::Completed);

    assert_eq!(player.texts(), vec!["第一句。", "第二句。", "第三句。"]);
    assert_eq!(synth.texts(), player.texts());

    let calls = synth.calls.lock().unwrap().clone();
    let plays = player.plays.lock().unwrap().clone();
    let first_play_end = plays[0].2;
    assert!(
        calls[1].1 < first_play_end,
        "second segment should be synthesized while the first plays"
    );
    for pair in plays.windows(2) {
        assert!(pair[0].2 <= pair[1].1, "playbacks must not overlap");
    }

    let (last_caption, _) = sink.captions().pop().unwrap();
    assert_eq!(last_caption, "第一句。第二句。第三句。");
    assert_eq!(sink.count(&Call::Start), 1);
    assert_eq!(sink.count(&Call::End), 1);
    assert_eq!(sink.count(&Call::Hidden), 1);
    assert!(narrator.is_idle());
}

#[tokio::test(start_paused = true)]
async fn streamed_text_is_segmented_and_transcribed() {
    let synth = Arc::new(FakeSynth::new(10));
    let player = Arc::new(FakePlayer::new(50));
    let sink = Arc::new(RecordingSink::default());
    let narrator = narrator(&synth, &player, &sink).await;
    let mut signals = narrator.subscribe();

    narrator.feed_streaming_text("你好，今天");
    narrator.feed_streaming_text("天气不错。还");
    let handle = narrator.session_handle().expect("session started by feed");
    narrator.feed_streaming_text("有一句");
    narrator.finalize_stream();

    assert_eq!(handle.wait().await, SessionOutcome::Completed);
    assert_eq!(player.texts(), vec!["你好，", "今天天气不错。", "还有一句"]);
    assert!(sink
        .calls()
        .contains(&Call::Transcript("你好，今天天气不错。还有一句".into())));

    let started = signals.recv().await.unwrap();
    let ended = signals.recv().await.unwrap();
    let id = match started {
        SessionSignal::Started { session, .. } => session,
        other => panic!("unexpected signal {other:?}"),
    };
    match ended {
        SessionSignal::Ended {
            session, outcome, ..
        } => {
            assert_eq!(session, id);
            assert_eq!(outcome, SessionOutcome::Completed);
        }
        other => panic!("unexpected signal {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn new_session_during_caption_hold_keeps_previous_transcript() {
    let synth = Arc::new(FakeSynth::new(10));
    let player = Arc::new(FakePlayer::new(50));
    let sink = Arc::new(RecordingSink::default());
    let narrator = narrator(&synth, &player, &sink).await;

    let first = narrator.narrate_complete("你好。");
    // Drained by now, still inside the one-second display hold.
    sleep(Duration::from_millis(400)).await;
    assert!(first.outcome().is_none());

    let second = narrator.narrate_complete("再见。");
    assert_eq!(second.wait().await, SessionOutcome::Completed);
    assert_eq!(first.wait().await, SessionOutcome::Completed);

    let transcripts: Vec<Call> = sink
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Transcript(_)))
        .collect();
    assert_eq!(
        transcripts,
        vec![
            Call::Transcript("你好。".into()),
            Call::Transcript("再见。".into())
        ]
    );
    assert_eq!(sink.count(&Call::Start), 2);
    assert_eq!(sink.count(&Call::End), 2);
}

#[tokio::test(start_paused = true)]
async fn open_stream_does_not_complete() {
    let synth = Arc::new(FakeSynth::new(10));
    let player = Arc::new(FakePlayer::new(10));
    let sink = Arc::new(RecordingSink::default());
    let narrator = narrator(&synth, &player, &sink).await;

    narrator.feed_streaming_text("你好。");
    sleep(Duration::from_secs(5)).await;
    assert_eq!(player.texts(), vec!["你好。"]);
    let handle = narrator.session_handle().expect("still in progress");
    assert_eq!(handle.outcome(), None);

    narrator.finalize_stream();
    assert_eq!(handle.wait().await, SessionOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn failed_synthesis_falls_back_to_typewriter() {
    let synth = Arc::new(FakeSynth::failing(20, vec![1]));
    let player = Arc::new(FakePlayer::new(100));
    let sink = Arc::new(RecordingSink::default());
    let narrator = narrator(&synth, &player, &sink).await;

    let handle = narrator.narrate_complete("<开心>你好。再见。");
    assert_eq!(handle.wait().await, SessionOutcome::Completed);

    assert_eq!(synth.texts().len(), 1, "no calls after the breaker trips");
    assert!(narrator.breaker_tripped());
    assert!(player.texts().is_empty());

    let captions = sink.captions();
    assert_eq!(captions.len(), "你好。再见。".chars().count());
    assert_eq!(captions.last().unwrap().0, "你好。再见。");
    assert_eq!(captions[0].0, "你");
    for pair in captions.windows(2) {
        let gap = pair[1].1 - pair[0].1;
        assert!(
            gap >= Duration::from_millis(180) && gap < Duration::from_millis(240),
            "typewriter gap was {gap:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn breaker_survives_reset_until_interrupt() {
    let synth = Arc::new(FakeSynth::failing(20, vec![1]));
    let player = Arc::new(FakePlayer::new(50));
    let sink = Arc::new(RecordingSink::default());
    let narrator = narrator(&synth, &player, &sink).await;

    let handle = narrator.narrate_complete("第一轮。还有很多字要慢慢打出来。");
    sleep(Duration::from_millis(500)).await;
    assert!(narrator.breaker_tripped());

    narrator.reset();
    assert_eq!(handle.wait().await, SessionOutcome::Superseded);
    assert!(narrator.breaker_tripped(), "reset keeps the breaker");
    assert_eq!(sink.count(&Call::End), 0, "reset emits no session end");

    let handle = narrator.narrate_complete("第二轮。");
    assert_eq!(handle.wait().await, SessionOutcome::Completed);
    assert_eq!(synth.texts().len(), 1, "breaker still routes to the typewriter");

    narrator.interrupt();
    assert!(!narrator.breaker_tripped());
    sleep(Duration::from_millis(400)).await;

    let handle = narrator.narrate_complete("第三轮。");
    assert_eq!(handle.wait().await, SessionOutcome::Completed);
    assert_eq!(synth.texts().last().unwrap(), "第三轮。");
    assert_eq!(player.texts(), vec!["第三轮。"]);
}

#[tokio::test(start_paused = true)]
async fn interrupt_mid_playback_rearms() {
    let synth = Arc::new(FakeSynth::new(20));
    let player = Arc::new(FakePlayer::new(5_000));
    let sink = Arc::new(RecordingSink::default());
    let narrator = narrator(&synth, &player, &sink).await;

    let handle = narrator.narrate_complete("这是一段很长的话。后面还有。");
    sleep(Duration::from_millis(300)).await;
    narrator.interrupt();

    assert_eq!(handle.wait().await, SessionOutcome::Interrupted);
    let calls = sink.calls();
    let tail = &calls[calls.len() - 4..];
    assert_eq!(tail[0], Call::Amplitude(0.0));
    assert_eq!(tail[1], Call::Hidden);
    assert_eq!(
        tail[2],
        Call::Transcript("这是一段很长的话。后面还有。".into())
    );
    assert_eq!(tail[3], Call::End);
    assert!(synth.aborts.load(Ordering::SeqCst) >= 1);
    assert!(!narrator.is_idle(), "loops pause during the cool-down");

    sleep(Duration::from_millis(350)).await;
    assert!(narrator.is_idle());
    assert!(narrator.session_handle().is_none());

    let handle = narrator.narrate_complete("新的开始。");
    assert_eq!(handle.wait().await, SessionOutcome::Completed);
    assert_eq!(
        player.texts(),
        vec!["这是一段很长的话。", "新的开始。"],
        "audio queued before the interrupt is never played"
    );
    assert_eq!(synth.texts().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn markup_only_text_makes_no_synthesis_call() {
    let synth = Arc::new(FakeSynth::new(10));
    let player = Arc::new(FakePlayer::new(10));
    let sink = Arc::new(RecordingSink::default());
    let narrator = narrator(&synth, &player, &sink).await;

    let handle = narrator.narrate_complete("<开心>。");
    assert_eq!(handle.wait().await, SessionOutcome::Completed);
    assert!(synth.texts().is_empty());
    assert!(player.texts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalid_config_is_rejected() {
    let cfg = NarratorConfig {
        caption_reveal_min_ms: 500,
        caption_reveal_max_ms: 100,
        ..NarratorConfig::default()
    };
    let result = Narrator::start(
        cfg,
        Arc::new(FakeSynth::new(1)),
        Arc::new(FakePlayer::new(1)),
        Arc::new(RecordingSink::default()),
    )
    .await;
    assert!(matches!(result, Err(NarrateError::Config(_))));
}
