//! Wire frames of the duplex streaming provider.
//!
//! Every text frame is `{"header": {...}, "payload": {...}}`. The client sends
//! `run-task`, then `continue-task` with the text once the server reports
//! `task-started`, then `finish-task`. Audio arrives as binary frames until
//! `task-finished` (or `task-failed`).

use narrate_core::{NarrateError, Result};
use serde::Deserialize;
use serde_json::{json, Value};

/// Frames sent by the client.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientFrame {
    RunTask {
        task_id: String,
        model: String,
        voice: String,
        format: String,
        sample_rate: u32,
    },
    ContinueTask {
        task_id: String,
        text: String,
    },
    FinishTask {
        task_id: String,
    },
}

impl ClientFrame {
    pub fn action(&self) -> &'static str {
        match self {
            ClientFrame::RunTask { .. } => "run-task",
            ClientFrame::ContinueTask { .. } => "continue-task",
            ClientFrame::FinishTask { .. } => "finish-task",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            ClientFrame::RunTask { task_id, .. }
            | ClientFrame::ContinueTask { task_id, .. }
            | ClientFrame::FinishTask { task_id } => task_id,
        }
    }

    pub fn encode(&self) -> String {
        let payload = match self {
            ClientFrame::RunTask {
                model,
                voice,
                format,
                sample_rate,
                ..
            } => json!({
                "task_group": "audio",
                "task": "tts",
                "function": "SpeechSynthesizer",
                "model": model,
                "parameters": {
                    "text_type": "PlainText",
                    "voice": voice,
                    "format": format,
                    "sample_rate": sample_rate,
                },
                "input": {},
            }),
            ClientFrame::ContinueTask { text, .. } => json!({ "input": { "text": text } }),
            ClientFrame::FinishTask { .. } => json!({ "input": {} }),
        };
        json!({
            "header": {
                "action": self.action(),
                "task_id": self.task_id(),
                "streaming": "duplex",
            },
            "payload": payload,
        })
        .to_string()
    }

    /// Parse a client frame; used by provider stubs.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let header = &value["header"];
        let task_id = str_field(header, "task_id")?;
        let payload = &value["payload"];
        match header["action"].as_str() {
            Some("run-task") => {
                let params = &payload["parameters"];
                Ok(ClientFrame::RunTask {
                    task_id,
                    model: str_field(payload, "model")?,
                    voice: str_field(params, "voice")?,
                    format: str_field(params, "format")?,
                    sample_rate: params["sample_rate"].as_u64().unwrap_or_default() as u32,
                })
            }
            Some("continue-task") => Ok(ClientFrame::ContinueTask {
                task_id,
                text: str_field(&payload["input"], "text")?,
            }),
            Some("finish-task") => Ok(ClientFrame::FinishTask { task_id }),
            other => Err(NarrateError::Protocol(format!(
                "unknown client action {other:?}"
            ))),
        }
    }
}

/// Events reported by the provider.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    TaskStarted {
        task_id: String,
    },
    ResultGenerated {
        task_id: String,
    },
    TaskFinished {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        code: String,
        message: String,
    },
}

#[derive(Deserialize)]
struct EventEnvelope {
    header: EventHeader,
}

#[derive(Deserialize)]
struct EventHeader {
    event: String,
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl ServerEvent {
    pub fn task_id(&self) -> &str {
        match self {
            ServerEvent::TaskStarted { task_id }
            | ServerEvent::ResultGenerated { task_id }
            | ServerEvent::TaskFinished { task_id }
            | ServerEvent::TaskFailed { task_id, .. } => task_id,
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let EventEnvelope { header } = serde_json::from_str(text)?;
        let task_id = header.task_id;
        match header.event.as_str() {
            "task-started" => Ok(ServerEvent::TaskStarted { task_id }),
            "result-generated" => Ok(ServerEvent::ResultGenerated { task_id }),
            "task-finished" => Ok(ServerEvent::TaskFinished { task_id }),
            "task-failed" => Ok(ServerEvent::TaskFailed {
                task_id,
                code: header.error_code.unwrap_or_default(),
                message: header.error_message.unwrap_or_default(),
            }),
            other => Err(NarrateError::Protocol(format!("unknown event '{other}'"))),
        }
    }

    pub fn encode(&self) -> String {
        let mut header = json!({
            "event": match self {
                ServerEvent::TaskStarted { .. } => "task-started",
                ServerEvent::ResultGenerated { .. } => "result-generated",
                ServerEvent::TaskFinished { .. } => "task-finished",
                ServerEvent::TaskFailed { .. } => "task-failed",
            },
            "task_id": self.task_id(),
        });
        if let ServerEvent::TaskFailed { code, message, .. } = self {
            header["error_code"] = json!(code);
            header["error_message"] = json!(message);
        }
        json!({ "header": header, "payload": {} }).to_string()
    }
}

fn str_field(value: &Value, key: &str) -> Result<String> {
    value[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| NarrateError::Protocol(format!("missing field '{key}'")))
}
