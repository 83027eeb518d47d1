#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

use sesame_voice_rs::config::{AuthConfig, SessionConfig};

pub const MOCK_SESSION_ID: &str = "mock-session";
pub const MOCK_CALL_ID: &str = "mock-call";
pub const MOCK_SAMPLE_RATE: u32 = 16000;

/// How the mock voice service behaves after the client connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Acknowledge the call and echo every audio frame back.
    Echo,
    /// Answer call_connect with an error frame.
    ErrorFrame,
    /// Acknowledge the call, then drop the TCP connection without a close frame.
    DropAfterOpen,
    /// Send initialize but never acknowledge call_connect.
    NeverAck,
    /// Acknowledge the call, then report voice activity.
    VoiceActivity,
    /// Acknowledge the call, then hang up.
    HangUp,
    /// Acknowledge the call, then send a normal close frame.
    CloseAfterOpen,
    /// Accept TCP but never answer the WebSocket upgrade.
    StallUpgrade,
}

/// Loopback stand-in for the voice service.
pub struct MockVoiceServer {
    url: String,
    received: Arc<Mutex<Vec<Value>>>,
    request_uri: Arc<Mutex<Option<String>>>,
    task: JoinHandle<()>,
}

impl MockVoiceServer {
    pub async fn start(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let request_uri = Arc::new(Mutex::new(None));

        let task = {
            let received = received.clone();
            let request_uri = request_uri.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    if mode == Mode::StallUpgrade {
                        tokio::spawn(async move {
                            let _stream = stream;
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        });
                        continue;
                    }
                    serve_voice(stream, mode, received.clone(), request_uri.clone()).await;
                }
            })
        };

        Self {
            url: format!("ws://{}/agent-service-0/v1/connect", addr),
            received,
            request_uri,
            task,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ws_url: self.url.clone(),
            connect_timeout: Duration::from_secs(2),
            ..SessionConfig::default()
        }
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_types(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|v| v["type"].as_str().map(str::to_string))
            .collect()
    }

    pub fn request_uri(&self) -> Option<String> {
        self.request_uri.lock().unwrap().clone()
    }

    /// Poll until a frame of `frame_type` has arrived.
    pub async fn wait_for_frame(&self, frame_type: &str) -> bool {
        for _ in 0..100 {
            if self.received_types().iter().any(|t| t == frame_type) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

impl Drop for MockVoiceServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_voice(
    stream: TcpStream,
    mode: Mode,
    received: Arc<Mutex<Vec<Value>>>,
    request_uri: Arc<Mutex<Option<String>>>,
) {
    let record_uri = request_uri.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        *record_uri.lock().unwrap() = Some(req.uri().to_string());
        Ok(resp)
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    let initialize = json!({ "type": "initialize", "session_id": MOCK_SESSION_ID });
    if ws.send(Message::Text(initialize.to_string().into())).await.is_err() {
        return;
    }

    while let Some(Ok(msg)) = ws.next().await {
        let text = match msg {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        received.lock().unwrap().push(frame.clone());

        match frame["type"].as_str() {
            Some("call_connect") => {
                let reply = match mode {
                    Mode::NeverAck => continue,
                    Mode::ErrorFrame => json!({
                        "type": "error",
                        "session_id": MOCK_SESSION_ID,
                        "content": { "code": 401, "message": "invalid id_token" },
                    }),
                    _ => json!({
                        "type": "call_connect_response",
                        "session_id": MOCK_SESSION_ID,
                        "call_id": MOCK_CALL_ID,
                        "content": { "sample_rate": MOCK_SAMPLE_RATE, "audio_codec": "none" },
                    }),
                };
                if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                    return;
                }

                match mode {
                    Mode::DropAfterOpen => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        // 直接丢弃连接，不发送 close 帧
                        return;
                    }
                    Mode::VoiceActivity => {
                        let activity = json!({
                            "type": "voice_activity",
                            "session_id": MOCK_SESSION_ID,
                            "call_id": MOCK_CALL_ID,
                            "content": { "active": true },
                        });
                        let _ = ws.send(Message::Text(activity.to_string().into())).await;
                    }
                    Mode::HangUp => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        let hangup = json!({
                            "type": "call_disconnect_response",
                            "session_id": MOCK_SESSION_ID,
                            "call_id": MOCK_CALL_ID,
                        });
                        let _ = ws.send(Message::Text(hangup.to_string().into())).await;
                    }
                    Mode::CloseAfterOpen => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        let _ = ws
                            .close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "call ended".into(),
                            }))
                            .await;
                    }
                    _ => {}
                }
            }
            Some("audio") if mode == Mode::Echo => {
                let echo = json!({
                    "type": "audio",
                    "session_id": MOCK_SESSION_ID,
                    "call_id": MOCK_CALL_ID,
                    "content": { "audio_data": frame["content"]["audio_data"] },
                });
                if ws.send(Message::Text(echo.to_string().into())).await.is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}

/// A request captured by [`CannedHttpServer`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal HTTP/1.1 server answering each connection with the next canned
/// response; the last response repeats once the list runs out.
pub struct CannedHttpServer {
    base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl CannedHttpServer {
    pub async fn start(responses: Vec<(u16, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let requests = requests.clone();
            tokio::spawn(async move {
                let mut served = 0usize;
                while let Ok((mut stream, _)) = listener.accept().await {
                    let Some(request) = read_request(&mut stream).await else {
                        continue;
                    };
                    requests.lock().unwrap().push(request);

                    let (status, body) = responses
                        .get(served)
                        .or_else(|| responses.last())
                        .cloned()
                        .unwrap_or((404, String::new()));
                    served += 1;

                    let response = format!(
                        "HTTP/1.1 {} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
            })
        };

        Self {
            base_url: format!("http://{}", addr),
            requests,
            task,
        }
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            api_key: "test-key".to_string(),
            signup_url: format!("{}/v1/accounts:signUp", self.base_url),
            lookup_url: format!("{}/v1/accounts:lookup", self.base_url),
            refresh_url: format!("{}/v1/token", self.base_url),
            token_file: None,
            ..AuthConfig::default()
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for CannedHttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

    Some(RecordedRequest {
        request_line,
        headers,
        body,
    })
}
