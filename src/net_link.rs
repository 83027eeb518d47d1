use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::audio::{create_codec, AudioChunk, AudioCodec};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::protocol::{
    CallConnectContent, CallSettings, ClientMessage, ClientMetadata, InboundFrame, MediaDevice,
};
use crate::session::{Character, DisconnectReason, SessionInfo, SessionShared, SessionState};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

// 首次收到音频后发送的静音帧大小（字节）
const PRIMING_FRAME_BYTES: usize = 1280;
const PRIMING_FRAMES: usize = 2;

#[derive(Debug)]
pub(crate) enum NetCommand {
    SendAudio(Bytes),
    Close,
}

// 单次通话内的协议状态，只由读写循环访问
#[derive(Default)]
struct CallState {
    session_id: Option<String>,
    call_id: Option<String>,
    codec: Option<Box<dyn AudioCodec>>,
    sample_rate: u32,
    opened: bool,
    primed: bool,
    last_sent_type: Option<&'static str>,
}

/// Owns one WebSocket connection for the lifetime of a call.
///
/// Runs as a background task: reads and demultiplexes server frames,
/// writes caller commands, and reports the terminal state through
/// [`SessionShared`] when the connection ends.
pub(crate) struct NetLink {
    config: SessionConfig,
    id_token: String,
    character: Character,
    shared: Arc<SessionShared>,
    rx_cmd: mpsc::Receiver<NetCommand>,
}

impl NetLink {
    pub fn new(
        config: SessionConfig,
        id_token: String,
        character: Character,
        shared: Arc<SessionShared>,
        rx_cmd: mpsc::Receiver<NetCommand>,
    ) -> Self {
        Self {
            config,
            id_token,
            character,
            shared,
            rx_cmd,
        }
    }

    // 不自动重连，连接结束后由调用方决定是否重新 connect
    pub async fn run(mut self) {
        let mut call = CallState {
            sample_rate: self.config.default_server_sample_rate,
            ..CallState::default()
        };

        match self.connect_and_loop(&mut call).await {
            Ok(reason) => {
                log::info!("Session closed: {:?}", reason);
                self.shared.finish(SessionState::Disconnected, reason);
            }
            Err(err) if self.shared.is_closing() => {
                log::debug!("Connection ended while closing: {}", err);
                self.shared.finish(SessionState::Disconnected, DisconnectReason::Requested);
            }
            Err(err) => {
                log::error!("Session error: {}", err);
                self.shared.record_error(err.clone());
                let (state, reason) = match err {
                    SessionError::Service { code, message } => (
                        SessionState::Failed,
                        DisconnectReason::ServiceError { code, message },
                    ),
                    other if call.opened => (
                        SessionState::Disconnected,
                        DisconnectReason::Abnormal(other.to_string()),
                    ),
                    other => (
                        SessionState::Failed,
                        DisconnectReason::ConnectFailed(other.to_string()),
                    ),
                };
                self.shared.finish(state, reason);
            }
        }
    }

    fn build_url(&self) -> Result<Url, SessionError> {
        let usercontext = json!({ "timezone": self.config.timezone }).to_string();
        let character = self.character.to_string();
        Url::parse_with_params(
            &self.config.ws_url,
            &[
                ("id_token", self.id_token.as_str()),
                ("client_name", self.config.client_name.as_str()),
                ("usercontext", usercontext.as_str()),
                ("character", character.as_str()),
            ],
        )
        .map_err(|e| SessionError::Protocol(format!("invalid ws_url: {}", e)))
    }

    async fn connect_and_loop(
        &mut self,
        call: &mut CallState,
    ) -> Result<DisconnectReason, SessionError> {
        let url = self.build_url()?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(SessionError::Protocol("ws_url has no host".to_string())),
        };

        let request = Request::builder()
            .method("GET")
            .uri(url.as_str())
            .header("Host", &host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .header("Origin", &self.config.origin)
            .header("User-Agent", &self.config.user_agent)
            .body(())
            .map_err(|e| SessionError::Protocol(e.to_string()))?;

        // 握手（含 call_connect_response）必须在同一个期限内完成
        let deadline = Instant::now() + self.config.connect_timeout;
        log::info!("Connecting to {}{} as {}...", host, url.path(), self.character);
        let (ws_stream, _) = tokio::select! {
            result = tokio::time::timeout_at(deadline, connect_async(request)) => {
                result.map_err(|_| SessionError::Timeout)??
            }
            // 连接尚未建立时收到断开请求，直接放弃
            _ = self.rx_cmd.recv() => {
                log::debug!("Connect cancelled");
                return Ok(DisconnectReason::Requested);
            }
        };
        log::debug!("WebSocket established, waiting for initialize");
        self.shared.set_state(SessionState::Handshaking);

        let (mut write, mut read) = ws_stream.split();
        let handshake_deadline = tokio::time::sleep_until(deadline);
        tokio::pin!(handshake_deadline);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reason) = self.handle_text(&text, &mut write, call).await? {
                                let _ = write.close().await;
                                return Ok(reason);
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            // 二进制帧视为原始 PCM
                            self.on_audio(Bytes::copy_from_slice(&data), &mut write, call).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let orderly = frame
                                .as_ref()
                                .is_none_or(|f| matches!(f.code, CloseCode::Normal | CloseCode::Away));
                            if call.opened && orderly {
                                log::info!("Server closed the call: {:?}", frame);
                                return Ok(DisconnectReason::ServerHangup);
                            }
                            log::warn!("Server closed connection: {:?}", frame);
                            return Err(SessionError::Transport("Connection closed by server".to_string()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(SessionError::Transport("Connection closed".to_string())),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NetCommand::SendAudio(pcm)) => self.send_audio(&pcm, &mut write, call).await?,
                        Some(NetCommand::Close) | None => {
                            self.hang_up(&mut write, call).await;
                            return Ok(DisconnectReason::Requested);
                        }
                    }
                }
                _ = &mut handshake_deadline, if !call.opened => {
                    log::warn!("No call_connect_response within {:?}", self.config.connect_timeout);
                    return Err(SessionError::Timeout);
                }
            }
        }
    }

    async fn handle_text(
        &self,
        text: &str,
        write: &mut WsSink,
        call: &mut CallState,
    ) -> Result<Option<DisconnectReason>, SessionError> {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Ignoring malformed frame: {}", e);
                return Ok(None);
            }
        };

        match frame {
            InboundFrame::Initialize { session_id } => {
                let session_id = session_id.ok_or_else(|| {
                    SessionError::Protocol("initialize without session_id".to_string())
                })?;
                log::debug!("Session ID: {}", session_id);
                call.session_id = Some(session_id.clone());

                let location = ClientMessage::client_location_state(&session_id, &self.config.timezone);
                self.send_frame(location, write, call).await?;
                let connect = ClientMessage::call_connect(&session_id, &self.call_connect_content());
                self.send_frame(connect, write, call).await?;
            }
            InboundFrame::CallConnected {
                session_id,
                call_id,
                sample_rate,
                audio_codec,
            } => {
                if call.opened {
                    // 同一次通话内采样率固定
                    log::debug!("Ignoring repeated call_connect_response");
                    return Ok(None);
                }
                let codec = create_codec(audio_codec.as_deref().unwrap_or("none"))?;
                let session_id = session_id
                    .or_else(|| call.session_id.clone())
                    .ok_or_else(|| SessionError::Protocol("call_connect_response without session_id".to_string()))?;
                let call_id = call_id.ok_or_else(|| {
                    SessionError::Protocol("call_connect_response without call_id".to_string())
                })?;

                call.sample_rate = sample_rate.unwrap_or(self.config.default_server_sample_rate);
                let info = SessionInfo {
                    session_id: session_id.clone(),
                    call_id: call_id.clone(),
                    server_sample_rate: call.sample_rate,
                    audio_codec: codec.name().to_string(),
                };
                call.session_id = Some(session_id);
                call.call_id = Some(call_id);
                call.codec = Some(codec);
                call.opened = true;

                log::info!(
                    "Connected: session {}, call {}, {} Hz",
                    info.session_id,
                    info.call_id,
                    info.server_sample_rate
                );
                self.shared.opened(info);
            }
            InboundFrame::Audio(payload) => {
                if payload.is_empty() {
                    return Ok(None);
                }
                let Some(codec) = call.codec.as_ref() else {
                    log::debug!("Audio before call_connect_response, dropped");
                    return Ok(None);
                };
                match codec.decode(&payload) {
                    Ok(pcm) => self.on_audio(pcm, write, call).await?,
                    Err(e) => log::warn!("Dropping undecodable audio frame: {}", e),
                }
            }
            InboundFrame::VoiceActivity(active) => {
                log::debug!("Voice activity: {}", active);
                self.shared.set_voice_active(active);
            }
            InboundFrame::CallDisconnected => {
                log::info!("Call disconnected by server");
                return Ok(Some(DisconnectReason::ServerHangup));
            }
            InboundFrame::Error { code, message } => {
                return Err(SessionError::Service { code, message });
            }
            InboundFrame::PingResponse => {}
            InboundFrame::Other(kind) => log::debug!("Received {} frame", kind),
        }
        Ok(None)
    }

    async fn on_audio(
        &self,
        pcm: Bytes,
        write: &mut WsSink,
        call: &mut CallState,
    ) -> Result<(), SessionError> {
        if !call.opened {
            log::debug!("Audio before call_connect_response, dropped");
            return Ok(());
        }
        self.shared.push_audio(AudioChunk::new(pcm, call.sample_rate));

        if !call.primed {
            call.primed = true;
            log::debug!("First audio received, priming outbound stream");
            let silence = [0u8; PRIMING_FRAME_BYTES];
            for _ in 0..PRIMING_FRAMES {
                self.send_audio(&silence, write, call).await?;
            }
        }
        Ok(())
    }

    async fn send_audio(
        &self,
        pcm: &[u8],
        write: &mut WsSink,
        call: &mut CallState,
    ) -> Result<(), SessionError> {
        let (Some(session_id), Some(call_id), Some(codec)) =
            (call.session_id.as_ref(), call.call_id.as_ref(), call.codec.as_ref())
        else {
            log::debug!("Audio dropped, call not established");
            return Ok(());
        };
        let msg = ClientMessage::audio(session_id, call_id, codec.encode(pcm));
        self.send_frame(msg, write, call).await
    }

    // 非控制帧类型发生变化时，先发一个 ping
    async fn send_frame(
        &self,
        msg: ClientMessage,
        write: &mut WsSink,
        call: &mut CallState,
    ) -> Result<(), SessionError> {
        if !msg.is_control() && call.call_id.is_some() {
            if call.last_sent_type != Some(msg.msg_type) {
                if let Some(session_id) = call.session_id.as_deref() {
                    let ping = ClientMessage::ping(session_id, call.call_id.as_deref());
                    write.send(Message::Text(ping.to_json()?.into())).await?;
                }
            }
            call.last_sent_type = Some(msg.msg_type);
        }
        write.send(Message::Text(msg.to_json()?.into())).await?;
        Ok(())
    }

    async fn hang_up(&self, write: &mut WsSink, call: &mut CallState) {
        if let (Some(session_id), Some(call_id)) = (call.session_id.as_deref(), call.call_id.as_deref()) {
            log::debug!("Sending call_disconnect");
            let msg = ClientMessage::call_disconnect(session_id, call_id);
            if let Err(e) = self.send_frame(msg, write, call).await {
                log::warn!("Failed to send call_disconnect: {}", e);
            }
        }
        if let Err(e) = write.close().await {
            log::debug!("Close handshake failed: {}", e);
        }
    }

    fn call_connect_content(&self) -> CallConnectContent {
        CallConnectContent {
            sample_rate: self.config.client_sample_rate,
            audio_codec: "none".to_string(),
            reconnect: false,
            is_private: false,
            client_name: self.config.client_name.clone(),
            settings: CallSettings {
                character: self.character.to_string(),
            },
            client_metadata: ClientMetadata {
                language: self.config.language.clone(),
                user_agent: self.config.user_agent.clone(),
                mobile_browser: false,
                media_devices: MediaDevice::defaults(),
            },
        }
    }
}
