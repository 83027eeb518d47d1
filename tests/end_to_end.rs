mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Mode, MockVoiceServer, MOCK_SAMPLE_RATE};
use sesame_voice_rs::auth::mock::{MockBehavior, MockIdentityService};
use sesame_voice_rs::config::AuthConfig;
use sesame_voice_rs::{
    Character, CredentialStore, DisconnectReason, SessionChannel, SessionState, TokenManager,
};

#[tokio::test]
async fn token_to_voice_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(dir.path().join("token.json"));
    let service = Arc::new(MockIdentityService::new(MockBehavior::Success));
    let tokens = TokenManager::new(service.clone(), store, &AuthConfig::default());

    let id_token = tokens.get_valid_token(false).await.unwrap();
    assert_eq!(service.create_calls(), 1);

    let server = MockVoiceServer::start(Mode::Echo).await;
    let session = SessionChannel::new(id_token.clone(), Character::Miles, server.session_config());

    session.connect(true).await.unwrap();
    assert_eq!(session.state(), SessionState::Open);
    assert!(session.is_connected());
    assert_eq!(session.server_sample_rate(), MOCK_SAMPLE_RATE);

    let uri = server.request_uri().unwrap();
    assert!(uri.contains(&format!("id_token={}", id_token)));
    assert!(uri.contains("character=Miles"));

    let pcm: Vec<u8> = [0u8, 1].repeat(512);
    session.send_audio_data(&pcm).await.unwrap();

    let chunk = session
        .get_next_audio_chunk(Some(Duration::from_secs(1)))
        .await
        .expect("echoed chunk");
    assert_eq!(chunk.data.as_ref(), pcm.as_slice());
    assert_eq!(chunk.sample_rate, MOCK_SAMPLE_RATE);

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!session.is_connected());
    assert_eq!(session.last_disconnect(), Some(DisconnectReason::Requested));
    assert_eq!(session.get_next_audio_chunk(Some(Duration::ZERO)).await, None);
    assert_eq!(
        session.get_next_audio_chunk(Some(Duration::from_millis(50))).await,
        None
    );

    // 第二次获取令牌不应再访问身份服务
    assert_eq!(tokens.get_valid_token(false).await.unwrap(), id_token);
    assert_eq!(service.create_calls(), 1);
}
