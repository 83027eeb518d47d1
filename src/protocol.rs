//! JSON frames exchanged with the voice service.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::SessionError;

// Frames that never trigger a keep-alive ping
const CONTROL_TYPES: &[&str] = &["ping", "call_connect", "call_disconnect"];

/// Outbound frame. `content` is frame-type specific.
#[derive(Serialize, Debug, Clone)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub session_id: Option<String>,
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub content: Value,
}

// call_connect 的 content 部分
#[derive(Serialize, Debug, Clone)]
pub struct CallConnectContent {
    pub sample_rate: u32,
    pub audio_codec: String,
    pub reconnect: bool,
    pub is_private: bool,
    pub client_name: String,
    pub settings: CallSettings,
    pub client_metadata: ClientMetadata,
}

#[derive(Serialize, Debug, Clone)]
pub struct CallSettings {
    pub character: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct ClientMetadata {
    pub language: String,
    pub user_agent: String,
    pub mobile_browser: bool,
    pub media_devices: Vec<MediaDevice>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MediaDevice {
    pub device_id: String,
    pub kind: String,
    pub label: String,
    pub group_id: String,
}

impl MediaDevice {
    /// The default microphone and speaker pair announced on connect.
    pub fn defaults() -> Vec<MediaDevice> {
        [("audioinput", "Default - Microphone"), ("audiooutput", "Default - Speaker")]
            .into_iter()
            .map(|(kind, label)| MediaDevice {
                device_id: "default".to_string(),
                kind: kind.to_string(),
                label: label.to_string(),
                group_id: "default".to_string(),
            })
            .collect()
    }
}

fn request_id() -> Option<String> {
    Some(Uuid::new_v4().to_string())
}

impl ClientMessage {
    pub fn ping(session_id: &str, call_id: Option<&str>) -> Self {
        Self {
            msg_type: "ping",
            session_id: Some(session_id.to_string()),
            call_id: call_id.map(str::to_string),
            request_id: request_id(),
            content: json!("ping"),
        }
    }

    pub fn client_location_state(session_id: &str, timezone: &str) -> Self {
        Self {
            msg_type: "client_location_state",
            session_id: Some(session_id.to_string()),
            call_id: None,
            request_id: None,
            content: json!({
                "latitude": 0,
                "longitude": 0,
                "address": "",
                "timezone": timezone,
            }),
        }
    }

    pub fn call_connect(session_id: &str, content: &CallConnectContent) -> Self {
        Self {
            msg_type: "call_connect",
            session_id: Some(session_id.to_string()),
            call_id: None,
            request_id: request_id(),
            content: serde_json::to_value(content).unwrap_or(Value::Null),
        }
    }

    /// `audio_data` is already encoded by the negotiated codec.
    pub fn audio(session_id: &str, call_id: &str, audio_data: String) -> Self {
        Self {
            msg_type: "audio",
            session_id: Some(session_id.to_string()),
            call_id: Some(call_id.to_string()),
            request_id: None,
            content: json!({ "audio_data": audio_data }),
        }
    }

    pub fn call_disconnect(session_id: &str, call_id: &str) -> Self {
        Self {
            msg_type: "call_disconnect",
            session_id: Some(session_id.to_string()),
            call_id: Some(call_id.to_string()),
            request_id: request_id(),
            content: json!({ "reason": "user_request" }),
        }
    }

    pub fn is_control(&self) -> bool {
        CONTROL_TYPES.contains(&self.msg_type)
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self).map_err(|e| SessionError::Protocol(e.to_string()))
    }
}

#[derive(Deserialize, Debug)]
struct RawFrame {
    #[serde(rename = "type")]
    msg_type: String,
    session_id: Option<String>,
    call_id: Option<String>,
    #[serde(default)]
    content: Value,
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Initialize {
        session_id: Option<String>,
    },
    CallConnected {
        session_id: Option<String>,
        call_id: Option<String>,
        sample_rate: Option<u32>,
        audio_codec: Option<String>,
    },
    /// Encoded audio payload, still in the negotiated codec.
    Audio(String),
    VoiceActivity(bool),
    CallDisconnected,
    Error {
        code: i64,
        message: String,
    },
    PingResponse,
    /// chat, agent, webrtc_config and anything unknown
    Other(String),
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| SessionError::Protocol(e.to_string()))?;
        let content = &raw.content;

        let frame = match raw.msg_type.as_str() {
            "initialize" => InboundFrame::Initialize {
                session_id: raw.session_id,
            },
            "call_connect_response" => InboundFrame::CallConnected {
                session_id: raw.session_id,
                call_id: raw.call_id,
                sample_rate: content
                    .get("sample_rate")
                    .and_then(Value::as_u64)
                    .and_then(|r| u32::try_from(r).ok()),
                audio_codec: content
                    .get("audio_codec")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            "audio" => InboundFrame::Audio(
                content
                    .get("audio_data")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            "voice_activity" => InboundFrame::VoiceActivity(
                content
                    .get("active")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            ),
            "call_disconnect_response" => InboundFrame::CallDisconnected,
            "error" => {
                // content 可能是对象，也可能只是一段文字
                let code = content.get("code").and_then(Value::as_i64).unwrap_or(0);
                let message = match content {
                    Value::String(s) => s.clone(),
                    other => other
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| other.to_string()),
                };
                InboundFrame::Error { code, message }
            }
            "ping_response" => InboundFrame::PingResponse,
            other => InboundFrame::Other(other.to_string()),
        };
        Ok(frame)
    }
}
