//! Duplex streaming provider over a blocking websocket.
//!
//! Each segment opens its own socket on a blocking thread. The socket read timeout is
//! the poll interval at which an abort is noticed.

use super::frames::{ClientFrame, ServerEvent};
use super::SpeechBackend;
use crate::clip::pcm16_to_wav;
use crate::utils::gen_id;
use async_trait::async_trait;
use narrate_core::{CancelFlag, DuplexConfig, NarrateError, Result};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct DuplexBackend {
    cfg: DuplexConfig,
    timeout: Duration,
}

impl DuplexBackend {
    pub fn new(cfg: DuplexConfig, timeout: Duration) -> Self {
        Self { cfg, timeout }
    }
}

#[async_trait]
impl SpeechBackend for DuplexBackend {
    fn name(&self) -> &'static str {
        "streaming_provider"
    }

    async fn synthesize(&self, text: &str, cancel: &CancelFlag) -> Result<Vec<u8>> {
        let cfg = self.cfg.clone();
        let text = text.to_string();
        let timeout = self.timeout;
        let task_cancel = cancel.clone();
        let task =
            tokio::task::spawn_blocking(move || run_task(&cfg, &text, &task_cancel, timeout));
        // The blocking task notices the abort on its next read poll and closes the socket.
        tokio::select! {
            joined = task => joined
                .map_err(|e| NarrateError::Backend(format!("duplex task panicked: {e}")))?,
            _ = cancel.cancelled() => Err(NarrateError::Cancelled),
        }
    }
}

fn connect(cfg: &DuplexConfig) -> Result<Socket> {
    let url = url::Url::parse(&cfg.url)
        .map_err(|e| NarrateError::Config(format!("invalid duplex url '{}': {e}", cfg.url)))?;
    let host = url
        .host_str()
        .ok_or_else(|| NarrateError::Config(format!("no host in duplex url '{}'", cfg.url)))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| NarrateError::Config(format!("no port for duplex url '{}'", cfg.url)))?;
    let addr = (host.as_str(), port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| NarrateError::Backend(format!("Failed to resolve hostname: {host}")))?;

    let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    tcp.set_read_timeout(Some(CONNECT_TIMEOUT))?;
    tcp.set_write_timeout(Some(CONNECT_TIMEOUT))?;
    tcp.set_nodelay(true)?;
    let poll_handle = tcp.try_clone()?;

    let stream = match url.scheme() {
        "wss" => {
            let connector = native_tls::TlsConnector::new()
                .map_err(|e| NarrateError::Backend(format!("TLS setup failed: {e}")))?;
            let tls = connector
                .connect(&host, tcp)
                .map_err(|e| NarrateError::Backend(format!("TLS handshake failed: {e}")))?;
            MaybeTlsStream::NativeTls(tls)
        }
        "ws" => MaybeTlsStream::Plain(tcp),
        other => {
            return Err(NarrateError::Config(format!(
                "unsupported duplex scheme '{other}'"
            )))
        }
    };

    let mut request = cfg
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| NarrateError::Config(format!("invalid duplex request: {e}")))?;
    if let Some(key) = &cfg.api_key {
        let value = HeaderValue::from_str(&format!("bearer {key}"))
            .map_err(|e| NarrateError::Config(format!("invalid api key header: {e}")))?;
        request.headers_mut().insert("Authorization", value);
    }
    let (socket, _response) = tungstenite::client::client(request, stream)
        .map_err(|e| NarrateError::Backend(format!("websocket handshake failed: {e}")))?;

    // Handshake done; from here reads return every poll interval to observe aborts.
    poll_handle.set_read_timeout(Some(Duration::from_millis(cfg.read_poll_ms.max(1))))?;
    Ok(socket)
}

fn send(socket: &mut Socket, frame: &ClientFrame) -> Result<()> {
    debug!(target = "duplex", action = frame.action(), task_id = frame.task_id(), "Sending frame");
    socket
        .send(Message::Text(frame.encode().into()))
        .map_err(|e| NarrateError::Backend(format!("duplex send failed: {e}")))
}

fn run_task(
    cfg: &DuplexConfig,
    text: &str,
    cancel: &CancelFlag,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let started = Instant::now();
    let mut socket = connect(cfg)?;
    let task_id = gen_id();
    send(
        &mut socket,
        &ClientFrame::RunTask {
            task_id: task_id.clone(),
            model: cfg.model.clone(),
            voice: cfg.voice.clone(),
            format: cfg.format.clone(),
            sample_rate: cfg.sample_rate,
        },
    )?;

    let mut audio = Vec::new();
    let result = loop {
        if cancel.is_cancelled() {
            break Err(NarrateError::Cancelled);
        }
        if started.elapsed() > timeout {
            break Err(NarrateError::Backend(format!(
                "duplex task timed out after {}ms",
                timeout.as_millis()
            )));
        }
        match socket.read() {
            Ok(Message::Binary(data)) => audio.extend_from_slice(&data),
            Ok(Message::Text(raw)) => match ServerEvent::decode(raw.as_str()) {
                Ok(ServerEvent::TaskStarted { .. }) => {
                    send(
                        &mut socket,
                        &ClientFrame::ContinueTask {
                            task_id: task_id.clone(),
                            text: text.to_string(),
                        },
                    )?;
                    send(
                        &mut socket,
                        &ClientFrame::FinishTask {
                            task_id: task_id.clone(),
                        },
                    )?;
                }
                Ok(ServerEvent::ResultGenerated { .. }) => {}
                Ok(ServerEvent::TaskFinished { .. }) => break Ok(()),
                Ok(ServerEvent::TaskFailed { code, message, .. }) => {
                    break Err(NarrateError::Backend(format!(
                        "duplex task failed: {code} {message}"
                    )))
                }
                Err(e) => break Err(e),
            },
            Ok(Message::Close(_)) => {
                break Err(NarrateError::Protocol(
                    "socket closed before task-finished".into(),
                ))
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => break Err(NarrateError::Backend(format!("duplex socket error: {e}"))),
        }
    };
    let _ = socket.close(None);
    let _ = socket.flush();

    match result {
        Ok(()) => {
            info!(
                target = "duplex",
                task_id = %task_id,
                bytes = audio.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Duplex task finished"
            );
            if cfg.format.eq_ignore_ascii_case("pcm") && !audio.is_empty() {
                pcm16_to_wav(&audio, cfg.sample_rate, 1)
            } else {
                Ok(audio)
            }
        }
        Err(e) => {
            if !e.is_cancelled() {
                warn!(target = "duplex", task_id = %task_id, error = %e, "Duplex task failed");
            }
            Err(e)
        }
    }
}
