use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::{AudioBuffer, AudioChunk};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::net_link::{NetCommand, NetLink};

const COMMAND_QUEUE: usize = 64;
// 主动断开时等待读写任务退出的时间
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Open,
    Closing,
    Failed,
}

/// Why the last call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Requested,
    /// The service ended the call.
    ServerHangup,
    /// The transport dropped after the call was open.
    Abnormal(String),
    /// The service sent an error frame.
    ServiceError { code: i64, message: String },
    /// The call never opened.
    ConnectFailed(String),
}

/// Parameters negotiated in the handshake, fixed for one open call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub call_id: String,
    pub server_sample_rate: u32,
    pub audio_codec: String,
}

/// Voice persona requested at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Character {
    #[default]
    Miles,
    Maya,
    Custom(String),
}

impl FromStr for Character {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        if name.eq_ignore_ascii_case("miles") {
            Ok(Character::Miles)
        } else if name.eq_ignore_ascii_case("maya") {
            Ok(Character::Maya)
        } else {
            log::warn!("Unknown character '{}', passing it through as-is", name);
            Ok(Character::Custom(name.to_string()))
        }
    }
}

impl fmt::Display for Character {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Character::Miles => f.write_str("Miles"),
            Character::Maya => f.write_str("Maya"),
            Character::Custom(name) => f.write_str(name),
        }
    }
}

/// Notified on connection lifecycle events.
///
/// Methods run on the connection's read task and must return quickly; a
/// blocking observer stalls frame processing.
pub trait SessionObserver: Send + Sync {
    fn on_connect(&self, _info: &SessionInfo) {}
    fn on_disconnect(&self, _reason: &DisconnectReason) {}
    fn on_error(&self, _error: &SessionError) {}
}

// 会话对外可见的状态，由读写任务写入，调用方并发读取
pub(crate) struct SessionShared {
    state: watch::Sender<SessionState>,
    info: Mutex<Option<SessionInfo>>,
    voice_active: AtomicBool,
    // 本次连接尚未 finish，保证断开回调只触发一次
    active: AtomicBool,
    last_disconnect: Mutex<Option<DisconnectReason>>,
    last_error: Mutex<Option<SessionError>>,
    observer: RwLock<Option<Arc<dyn SessionObserver>>>,
    audio: AudioBuffer,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionShared {
    pub fn new(audio_queue_capacity: usize) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            state,
            info: Mutex::new(None),
            voice_active: AtomicBool::new(false),
            active: AtomicBool::new(false),
            last_disconnect: Mutex::new(None),
            last_error: Mutex::new(None),
            observer: RwLock::new(None),
            audio: AudioBuffer::new(audio_queue_capacity),
        }
    }

    fn observer(&self) -> Option<Arc<dyn SessionObserver>> {
        self.observer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: SessionState) {
        log::debug!("Session state -> {:?}", state);
        self.state.send_replace(state);
    }

    fn begin(&self) {
        self.audio.reopen();
        *lock(&self.info) = None;
        *lock(&self.last_disconnect) = None;
        *lock(&self.last_error) = None;
        self.voice_active.store(false, Ordering::Release);
        self.active.store(true, Ordering::Release);
        self.set_state(SessionState::Connecting);
    }

    fn begin_closing(&self) {
        let changed = self.state.send_if_modified(|state| {
            let closing = matches!(
                state,
                SessionState::Connecting | SessionState::Handshaking | SessionState::Open
            );
            if closing {
                *state = SessionState::Closing;
            }
            closing
        });
        if changed {
            log::debug!("Session state -> Closing");
        }
    }

    // 调用方已发起断开，连接任务的任何结局都按主动断开处理
    pub fn is_closing(&self) -> bool {
        self.state() == SessionState::Closing
    }

    pub fn opened(&self, info: SessionInfo) {
        *lock(&self.info) = Some(info.clone());
        self.set_state(SessionState::Open);
        if let Some(observer) = self.observer() {
            observer.on_connect(&info);
        }
    }

    pub fn push_audio(&self, chunk: AudioChunk) {
        self.audio.push(chunk);
    }

    pub fn set_voice_active(&self, active: bool) {
        self.voice_active.store(active, Ordering::Release);
    }

    pub fn record_error(&self, error: SessionError) {
        *lock(&self.last_error) = Some(error.clone());
        if let Some(observer) = self.observer() {
            observer.on_error(&error);
        }
    }

    /// Move to a terminal state. Only the first call per connection has effect.
    ///
    /// While closing, every outcome is reported as a requested disconnect.
    pub fn finish(&self, state: SessionState, reason: DisconnectReason) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let (state, reason) = if self.is_closing() {
            (SessionState::Disconnected, DisconnectReason::Requested)
        } else {
            (state, reason)
        };
        self.audio.close();
        self.voice_active.store(false, Ordering::Release);
        *lock(&self.last_disconnect) = Some(reason.clone());
        self.set_state(state);
        if let Some(observer) = self.observer() {
            observer.on_disconnect(&reason);
        }
    }
}

struct LinkHandle {
    tx_cmd: mpsc::Sender<NetCommand>,
    task: JoinHandle<()>,
}

/// Duplex voice connection for one identity token and character.
///
/// A background task owns the socket; this handle sends commands to it and
/// reads the state it publishes. The channel never reconnects on its own:
/// after a drop or failure the caller may call [`connect`](Self::connect) again.
pub struct SessionChannel {
    config: SessionConfig,
    id_token: String,
    character: Character,
    shared: Arc<SessionShared>,
    link: Mutex<Option<LinkHandle>>,
}

impl SessionChannel {
    pub fn new(id_token: impl Into<String>, character: Character, config: SessionConfig) -> Self {
        let shared = Arc::new(SessionShared::new(config.audio_queue_capacity));
        Self {
            config,
            id_token: id_token.into(),
            character,
            shared,
            link: Mutex::new(None),
        }
    }

    /// Register the lifecycle observer, replacing any previous one.
    pub fn set_observer(&self, observer: Arc<dyn SessionObserver>) {
        *self.shared.observer.write().unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }

    /// Open the connection and start the handshake.
    ///
    /// With `blocking`, waits until the call is open or has failed, and
    /// returns the failure. Without it, returns once the connection task is
    /// started; progress is visible through [`state`](Self::state).
    pub async fn connect(&self, blocking: bool) -> Result<(), SessionError> {
        {
            let mut link = lock(&self.link);
            let current = self.shared.state();
            if !matches!(current, SessionState::Disconnected | SessionState::Failed) {
                return Err(SessionError::AlreadyActive(current));
            }
            if let Some(old) = link.take() {
                old.task.abort();
            }

            self.shared.begin();
            let (tx_cmd, rx_cmd) = mpsc::channel(COMMAND_QUEUE);
            let net = NetLink::new(
                self.config.clone(),
                self.id_token.clone(),
                self.character.clone(),
                self.shared.clone(),
                rx_cmd,
            );
            let task = tokio::spawn(net.run());
            *link = Some(LinkHandle { tx_cmd, task });
        }

        if !blocking {
            return Ok(());
        }

        let mut rx = self.shared.state.subscribe();
        let state = rx
            .wait_for(|s| {
                matches!(
                    s,
                    SessionState::Open | SessionState::Failed | SessionState::Disconnected
                )
            })
            .await
            .map(|s| *s)
            .unwrap_or(SessionState::Disconnected);

        if state == SessionState::Open {
            Ok(())
        } else {
            Err(self.last_error().unwrap_or(SessionError::NotConnected))
        }
    }

    /// Send raw 16-bit PCM at the client sample rate.
    ///
    /// Fails with [`SessionError::NotConnected`] unless the call is open.
    /// Nothing is queued across a disconnected gap.
    pub async fn send_audio_data(&self, pcm: &[u8]) -> Result<(), SessionError> {
        if self.shared.state() != SessionState::Open {
            return Err(SessionError::NotConnected);
        }
        let tx = lock(&self.link)
            .as_ref()
            .map(|link| link.tx_cmd.clone())
            .ok_or(SessionError::NotConnected)?;
        tx.send(NetCommand::SendAudio(Bytes::copy_from_slice(pcm)))
            .await
            .map_err(|_| SessionError::NotConnected)
    }

    /// Next inbound chunk, in arrival order.
    ///
    /// `None` timeout blocks until a chunk arrives or the call ends; a zero
    /// timeout polls. Returns `None` on timeout and after disconnect.
    pub async fn get_next_audio_chunk(&self, timeout: Option<Duration>) -> Option<AudioChunk> {
        self.shared.audio.pop(timeout).await
    }

    /// End the call. Repeated calls are no-ops.
    ///
    /// Pending [`get_next_audio_chunk`](Self::get_next_audio_chunk) calls
    /// return `None`, queued chunks are discarded, and no frame is processed
    /// after this returns.
    pub async fn disconnect(&self) {
        let Some(handle) = lock(&self.link).take() else {
            return;
        };

        self.shared.begin_closing();
        self.shared.audio.close();
        self.shared.audio.clear();

        if tokio::time::timeout(CLOSE_GRACE, handle.tx_cmd.send(NetCommand::Close))
            .await
            .is_err()
        {
            log::warn!("Connection task not accepting commands");
        }
        let mut task = handle.task;
        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            log::warn!("Connection task did not stop in time, aborting");
            task.abort();
        }

        self.shared.audio.clear();
        self.shared.finish(SessionState::Disconnected, DisconnectReason::Requested);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == SessionState::Open
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn info(&self) -> Option<SessionInfo> {
        lock(&self.shared.info).clone()
    }

    /// Negotiated output rate, or the configured default before the first open.
    pub fn server_sample_rate(&self) -> u32 {
        self.info()
            .map(|info| info.server_sample_rate)
            .unwrap_or(self.config.default_server_sample_rate)
    }

    pub fn character(&self) -> &Character {
        &self.character
    }

    pub fn last_disconnect(&self) -> Option<DisconnectReason> {
        lock(&self.shared.last_disconnect).clone()
    }

    pub fn last_error(&self) -> Option<SessionError> {
        lock(&self.shared.last_error).clone()
    }

    pub fn is_voice_active(&self) -> bool {
        self.shared.voice_active.load(Ordering::Acquire)
    }

    pub fn dropped_audio_chunks(&self) -> u64 {
        self.shared.audio.dropped()
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.link).take() {
            handle.task.abort();
        }
    }
}
