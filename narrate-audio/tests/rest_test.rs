use narrate_audio::{CloudRestBackend, LocalRestBackend, SpeechBackend, SynthesisAdapter};
use narrate_core::{
    BackendKind, CancelFlag, CloudRestConfig, LocalRestConfig, NarrateError, NarratorConfig,
    SpeechSynthesizer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const TIMEOUT: Duration = Duration::from_secs(5);

/// A captured HTTP request.
#[derive(Debug)]
struct Captured {
    head: String,
    body: serde_json::Value,
}

impl Captured {
    fn header(&self, name: &str) -> Option<String> {
        self.head.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }

    fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }
}

/// Serve exactly one request, answering with `status` and `body` (or never answering).
async fn stub_server(
    status: u16,
    body: Vec<u8>,
    hang: bool,
) -> (String, oneshot::Receiver<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let (head, body_start) = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break (String::from_utf8_lossy(&buf[..pos]).to_string(), pos + 4);
            }
        };
        let length = head
            .lines()
            .find_map(|l| {
                let (k, v) = l.split_once(':')?;
                k.trim()
                    .eq_ignore_ascii_case("content-length")
                    .then(|| v.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        while buf.len() < body_start + length {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
        let json = serde_json::from_slice(&buf[body_start..body_start + length])
            .unwrap_or(serde_json::Value::Null);
        let _ = tx.send(Captured { head, body: json });

        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return;
        }
        let reason = if status == 200 { "OK" } else { "Error" };
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: audio/wav\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.write_all(&body).await.unwrap();
        socket.shutdown().await.unwrap();
    });
    (format!("http://{addr}"), rx)
}

#[tokio::test]
async fn local_backend_posts_text_and_language() {
    let (base, captured) = stub_server(200, b"RIFFfake".to_vec(), false).await;
    let cfg = LocalRestConfig {
        url: format!("{base}/tts"),
        api_key: None,
    };
    let backend = LocalRestBackend::local(&cfg, "zh", TIMEOUT).unwrap();

    let audio = backend
        .synthesize("你好，", &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(audio, b"RIFFfake");

    let req = captured.await.unwrap();
    assert!(req.request_line().starts_with("POST /tts "));
    assert_eq!(req.body["text"], "你好，");
    assert_eq!(req.body["language"], "zh");
    assert_eq!(req.header("x-api-key"), None);
}

#[tokio::test]
async fn gateway_backend_sends_api_key() {
    let (base, captured) = stub_server(200, b"audio".to_vec(), false).await;
    let cfg = LocalRestConfig {
        url: format!("{base}/gateway/tts"),
        api_key: Some("secret-key".into()),
    };
    let backend = LocalRestBackend::gateway(&cfg, "ja", TIMEOUT).unwrap();
    assert_eq!(backend.name(), "gateway");

    backend.synthesize("こんにちは", &CancelFlag::new()).await.unwrap();
    let req = captured.await.unwrap();
    assert_eq!(req.header("x-api-key").as_deref(), Some("secret-key"));
    assert_eq!(req.body["language"], "ja");
}

#[test]
fn gateway_without_key_is_rejected() {
    let cfg = LocalRestConfig {
        url: "http://127.0.0.1:1/tts".into(),
        api_key: None,
    };
    assert!(matches!(
        LocalRestBackend::gateway(&cfg, "zh", TIMEOUT),
        Err(NarrateError::Config(_))
    ));
}

#[tokio::test]
async fn cloud_backend_uses_bearer_auth_and_speech_path() {
    let (base, captured) = stub_server(200, b"ID3mp3".to_vec(), false).await;
    let cfg = CloudRestConfig {
        base_url: format!("{base}/v1/"),
        api_key: Some("sk-test".into()),
        model: "tts-1".into(),
        voice: "alloy".into(),
        format: "mp3".into(),
        speed: 1.25,
    };
    let backend = CloudRestBackend::new(cfg, TIMEOUT).unwrap();

    backend.synthesize("Hello.", &CancelFlag::new()).await.unwrap();
    let req = captured.await.unwrap();
    assert!(req.request_line().starts_with("POST /v1/audio/speech "));
    assert_eq!(req.header("authorization").as_deref(), Some("Bearer sk-test"));
    assert_eq!(req.body["model"], "tts-1");
    assert_eq!(req.body["voice"], "alloy");
    assert_eq!(req.body["input"], "Hello.");
    assert_eq!(req.body["format"], "mp3");
    assert_eq!(req.body["speed"], 1.25);
}

#[tokio::test]
async fn error_status_is_a_backend_failure() {
    let (base, _captured) = stub_server(503, b"overloaded".to_vec(), false).await;
    let cfg = LocalRestConfig {
        url: format!("{base}/tts"),
        api_key: None,
    };
    let backend = LocalRestBackend::local(&cfg, "zh", TIMEOUT).unwrap();
    let err = backend
        .synthesize("你好。", &CancelFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(err, NarrateError::Backend(ref msg) if msg.contains("503")));
    assert!(!err.is_cancelled());
}

fn local_config(url: String) -> NarratorConfig {
    NarratorConfig {
        backend: BackendKind::Local,
        local: LocalRestConfig { url, api_key: None },
        ..NarratorConfig::default()
    }
}

#[tokio::test]
async fn empty_audio_body_is_a_failure() {
    let (base, _captured) = stub_server(200, Vec::new(), false).await;
    let adapter = SynthesisAdapter::from_config(&local_config(format!("{base}/tts"))).unwrap();
    let err = adapter.synthesize("你好。").await.unwrap_err();
    assert!(matches!(err, NarrateError::Backend(_)));
}

#[tokio::test]
async fn abort_all_cancels_in_flight_request() {
    let (base, captured) = stub_server(200, Vec::new(), true).await;
    let adapter = Arc::new(
        SynthesisAdapter::from_config(&local_config(format!("{base}/tts"))).unwrap(),
    );

    let call = {
        let adapter = adapter.clone();
        tokio::spawn(async move { adapter.synthesize("你好。").await })
    };
    captured.await.unwrap();
    assert_eq!(adapter.in_flight(), 1);

    adapter.abort_all();
    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(adapter.in_flight(), 0);
}

#[tokio::test]
async fn markup_only_segment_makes_no_request() {
    let adapter = SynthesisAdapter::from_config(&local_config(
        "http://127.0.0.1:9/unreachable".to_string(),
    ))
    .unwrap();
    assert_eq!(adapter.synthesize("<开心>。").await.unwrap(), None);
}
