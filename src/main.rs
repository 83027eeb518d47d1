use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sesame_voice_rs::audio::VoiceActivityGate;
use sesame_voice_rs::{
    AuthClient, Character, Config, CredentialStore, DisconnectReason, SessionChannel,
    SessionError, SessionInfo, SessionObserver, SessionState, TokenManager,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal;

// 日志观察者，把连接事件打印到日志
struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_connect(&self, info: &SessionInfo) {
        log::info!(
            "Call {} open, playback at {} Hz",
            info.call_id,
            info.server_sample_rate
        );
    }

    fn on_disconnect(&self, reason: &DisconnectReason) {
        log::info!("Call ended: {:?}", reason);
    }

    fn on_error(&self, error: &SessionError) {
        log::error!("Session error: {}", error);
    }
}

/// Pipe raw 16-bit mono PCM from stdin to the voice service and write the
/// reply audio to stdout.
///
/// Usage: `sesame-voice [character]`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().unwrap_or_default();
    log::info!("{} {}", config.app_name, config.app_version);

    let character: Character = match std::env::args().nth(1) {
        Some(name) => name.parse()?,
        None => config.session.character.parse()?,
    };

    let service = Arc::new(AuthClient::new(config.auth.clone())?);
    let tokens = TokenManager::new(service, CredentialStore::from_config(&config.auth), &config.auth);
    let id_token = tokens
        .get_valid_token(false)
        .await
        .context("Failed to obtain identity token")?;

    let mut session = SessionChannel::new(id_token, character.clone(), config.session.clone());
    session.set_observer(Arc::new(LogObserver));

    // 令牌被语音服务拒绝时，换一个新身份再试一次
    if let Err(SessionError::InvalidCredential) = session.connect(true).await {
        log::warn!("Voice service rejected the token, re-issuing identity");
        let id_token = tokens.get_valid_token(true).await?;
        session = SessionChannel::new(id_token, character, config.session.clone());
        session.set_observer(Arc::new(LogObserver));
        session.connect(true).await?;
    } else if !session.is_connected() {
        anyhow::bail!(
            "Could not open session: {}",
            session.last_error().unwrap_or(SessionError::NotConnected)
        );
    }

    let session = Arc::new(session);

    // 麦克风方向：stdin -> 静音门限 -> 服务端
    let uplink = {
        let session = session.clone();
        let frame_bytes = config.audio.frame_samples * 2;
        let mut gate = VoiceActivityGate::from_config(&config.audio);
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut frame = vec![0u8; frame_bytes];
            loop {
                if let Err(e) = stdin.read_exact(&mut frame).await {
                    log::info!("Input ended: {}", e);
                    break;
                }
                let gated = gate.process(&frame);
                if let Err(e) = session.send_audio_data(&gated).await {
                    log::warn!("Stopped sending audio: {}", e);
                    break;
                }
            }
        })
    };

    // 播放方向：服务端 -> stdout
    let downlink = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = session.get_next_audio_chunk(None).await {
                if stdout.write_all(&chunk.data).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        })
    };

    let mut state = session.subscribe_state();
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Interrupted, hanging up");
        }
        _ = state.wait_for(|s| *s != SessionState::Open) => {}
        _ = uplink => {
            // 输入结束后留一点时间播放剩余的回复
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    session.disconnect().await;
    let _ = tokio::time::timeout(Duration::from_secs(1), downlink).await;

    if session.dropped_audio_chunks() > 0 {
        log::warn!(
            "{} audio chunks were dropped by a slow consumer",
            session.dropped_audio_chunks()
        );
    }
    Ok(())
}
