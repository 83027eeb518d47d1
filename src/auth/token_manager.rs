use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use tokio::sync::Mutex;

use super::client::IdentityService;
use super::models::Credential;
use super::store::CredentialStore;
use crate::config::AuthConfig;
use crate::error::AuthError;

/// Hands out identity tokens that are not about to expire.
///
/// Refresh and signup requests run under one lock. Callers that queue up
/// behind an in-flight request get that request's outcome (token or error)
/// instead of issuing their own, so a burst of callers costs one round trip.
pub struct TokenManager {
    service: Arc<dyn IdentityService>,
    store: CredentialStore,
    refresh_margin: Duration,
    verify_remote: bool,
    state: Mutex<TokenState>,
    // mirror of TokenState::settled, readable without the lock
    settled: AtomicU64,
}

struct TokenState {
    credential: Option<Credential>,
    // bumped every time a network request finishes
    settled: u64,
    last_failure: Option<AuthError>,
    last_created: bool,
}

impl TokenManager {
    pub fn new(
        service: Arc<dyn IdentityService>,
        store: CredentialStore,
        config: &AuthConfig,
    ) -> Self {
        let credential = store.load();
        if credential.is_some() {
            log::info!("Using persisted credential");
        }
        let refresh_margin = Duration::from_std(config.refresh_margin).unwrap_or(Duration::minutes(5));
        Self {
            service,
            store,
            refresh_margin,
            verify_remote: config.verify_remote,
            state: Mutex::new(TokenState {
                credential,
                settled: 0,
                last_failure: None,
                last_created: false,
            }),
            settled: AtomicU64::new(0),
        }
    }

    /// Return a usable identity token, refreshing or re-issuing as needed.
    ///
    /// `force_new` skips every validity check and creates a new anonymous
    /// identity. A refresh token the service rejects is replaced the same way.
    /// Network failures are returned as-is; retrying is up to the caller.
    pub async fn get_valid_token(&self, force_new: bool) -> Result<String, AuthError> {
        let ticket = self.settled.load(Ordering::Acquire);
        let mut state = self.state.lock().await;

        // 排队期间已有请求完成，直接共享它的结果
        if state.settled != ticket && (!force_new || state.last_created) {
            if let Some(err) = &state.last_failure {
                return Err(err.clone());
            }
            if let Some(credential) = &state.credential {
                return Ok(credential.id_token.clone());
            }
        }

        if force_new {
            log::debug!("Forcing creation of new account");
            let result = self.service.create_anonymous_account().await;
            return self.settle(&mut state, result, true);
        }

        let Some(current) = state.credential.clone() else {
            log::debug!("No existing credential, creating new account");
            let result = self.service.create_anonymous_account().await;
            return self.settle(&mut state, result, true);
        };

        if current.is_fresh(self.refresh_margin) && self.confirm(&current).await {
            log::debug!(
                "Using existing token ({} min left)",
                current.time_until_expiry().num_minutes()
            );
            return Ok(current.id_token);
        }

        log::info!("Refreshing stale identity token");
        let mut created = false;
        let result = match self
            .service
            .refresh_authentication_token(&current.refresh_token)
            .await
        {
            Err(e) if e.is_auth_rejection() => {
                log::warn!("Refresh token rejected, creating a fresh anonymous identity");
                created = true;
                self.service.create_anonymous_account().await
            }
            other => other,
        };
        self.settle(&mut state, result, created)
    }

    /// Forget the current credential, in memory and on disk.
    pub async fn clear_tokens(&self) -> anyhow::Result<()> {
        log::info!("Clearing stored tokens");
        let mut state = self.state.lock().await;
        state.credential = None;
        state.last_failure = None;
        self.store.clear()
    }

    pub async fn current_credential(&self) -> Option<Credential> {
        self.state.lock().await.credential.clone()
    }

    // 本地判断未过期时，按配置再向服务端确认一次
    async fn confirm(&self, credential: &Credential) -> bool {
        if !self.verify_remote {
            return true;
        }
        match self.service.get_account_info(&credential.id_token).await {
            Ok(_) => true,
            Err(AuthError::InvalidToken) => {
                log::info!("Identity token rejected by lookup");
                false
            }
            Err(e) => {
                // 无法确认时沿用本地判断
                log::warn!("Error checking token validity: {}", e);
                true
            }
        }
    }

    fn settle(
        &self,
        state: &mut TokenState,
        result: Result<Credential, AuthError>,
        created: bool,
    ) -> Result<String, AuthError> {
        state.settled += 1;
        state.last_created = created;
        self.settled.store(state.settled, Ordering::Release);

        match result {
            Ok(credential) => {
                if let Err(e) = self.store.save(&credential) {
                    log::warn!("Could not save credential: {:#}", e);
                }
                let token = credential.id_token.clone();
                state.credential = Some(credential);
                state.last_failure = None;
                Ok(token)
            }
            Err(e) => {
                log::error!("Token request failed: {}", e);
                state.last_failure = Some(e.clone());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::mock::{MockBehavior, MockIdentityService};
    use chrono::Utc;
    use futures_util::future::join_all;

    fn auth_config() -> AuthConfig {
        AuthConfig {
            token_file: None,
            refresh_margin: std::time::Duration::from_secs(300),
            verify_remote: false,
            ..AuthConfig::default()
        }
    }

    fn stale_credential() -> Credential {
        Credential {
            id_token: "old-id-token".to_string(),
            refresh_token: "old-refresh-token".to_string(),
            local_id: "local-0".to_string(),
            // inside the 5 minute margin
            expires_at: Utc::now() + Duration::minutes(2),
        }
    }

    fn manager(
        service: &Arc<MockIdentityService>,
        store: CredentialStore,
        config: &AuthConfig,
    ) -> TokenManager {
        TokenManager::new(service.clone(), store, config)
    }

    #[tokio::test]
    async fn empty_store_creates_exactly_once() {
        let service = Arc::new(MockIdentityService::new(MockBehavior::Success));
        let tokens = manager(&service, CredentialStore::ephemeral(), &auth_config());

        let first = tokens.get_valid_token(false).await.unwrap();
        for _ in 0..5 {
            assert_eq!(tokens.get_valid_token(false).await.unwrap(), first);
        }
        assert_eq!(service.create_calls(), 1);
        assert_eq!(service.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn short_lived_credential_is_refreshed_before_expiry() {
        // 有效期短于刷新余量，下一次获取就应刷新
        let service = Arc::new(
            MockIdentityService::new(MockBehavior::Success).with_lifetime(Duration::minutes(1)),
        );
        let tokens = manager(&service, CredentialStore::ephemeral(), &auth_config());

        assert_eq!(
            tokens.get_valid_token(false).await.unwrap(),
            "created-id-token-1"
        );
        assert_eq!(
            tokens.get_valid_token(false).await.unwrap(),
            "refreshed-id-token-1"
        );
        assert_eq!(service.create_calls(), 1);
        assert_eq!(service.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_creation() {
        let service = Arc::new(
            MockIdentityService::new(MockBehavior::Success)
                .with_latency(std::time::Duration::from_millis(50)),
        );
        let tokens = manager(&service, CredentialStore::ephemeral(), &auth_config());

        let results = join_all((0..8).map(|_| tokens.get_valid_token(false))).await;
        let first = results[0].clone().unwrap();
        assert!(results.iter().all(|r| r.as_ref().unwrap() == &first));
        assert_eq!(service.create_calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("token.json"));
        store.save(&stale_credential()).unwrap();

        let service = Arc::new(
            MockIdentityService::new(MockBehavior::Success)
                .with_latency(std::time::Duration::from_millis(50)),
        );
        let tokens = manager(&service, store, &auth_config());

        let results = join_all((0..6).map(|_| tokens.get_valid_token(false))).await;
        for result in &results {
            assert_eq!(result.as_ref().unwrap(), "refreshed-id-token-1");
        }
        assert_eq!(service.refresh_calls(), 1);
        assert_eq!(service.create_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failure() {
        let service = Arc::new(
            MockIdentityService::new(MockBehavior::NetworkDown)
                .with_latency(std::time::Duration::from_millis(50)),
        );
        let tokens = manager(&service, CredentialStore::ephemeral(), &auth_config());

        let results = join_all((0..4).map(|_| tokens.get_valid_token(false))).await;
        assert!(results.iter().all(|r| matches!(r, Err(AuthError::Network(_)))));
        assert_eq!(service.create_calls(), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_falls_back_to_new_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let store = CredentialStore::new(&path);
        store.save(&stale_credential()).unwrap();

        let service = Arc::new(MockIdentityService::new(MockBehavior::RefreshRejected));
        let tokens = manager(&service, store, &auth_config());

        let token = tokens.get_valid_token(false).await.unwrap();
        assert_eq!(token, "created-id-token-1");
        assert_eq!(service.refresh_calls(), 1);
        assert_eq!(service.create_calls(), 1);

        let persisted = CredentialStore::new(&path).load().unwrap();
        assert_eq!(persisted.id_token, "created-id-token-1");
    }

    #[tokio::test]
    async fn network_failure_surfaces_and_caller_can_retry() {
        let service = Arc::new(MockIdentityService::new(MockBehavior::NetworkDown));
        let tokens = manager(&service, CredentialStore::ephemeral(), &auth_config());

        let err = tokens.get_valid_token(false).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(tokens.current_credential().await.is_none());

        service.set_behavior(MockBehavior::Success);
        assert_eq!(
            tokens.get_valid_token(false).await.unwrap(),
            "created-id-token-2"
        );
    }

    #[tokio::test]
    async fn refresh_network_failure_is_not_masked() {
        let service = Arc::new(MockIdentityService::new(MockBehavior::Success));
        let tokens = TokenManager::new(service.clone(), CredentialStore::ephemeral(), &auth_config());
        tokens.state.lock().await.credential = Some(stale_credential());

        service.set_behavior(MockBehavior::NetworkDown);
        let err = tokens.get_valid_token(false).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(service.create_calls(), 0);
    }

    #[tokio::test]
    async fn force_new_always_reissues() {
        let service = Arc::new(MockIdentityService::new(MockBehavior::Success));
        let tokens = manager(&service, CredentialStore::ephemeral(), &auth_config());

        let first = tokens.get_valid_token(false).await.unwrap();
        let second = tokens.get_valid_token(true).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(service.create_calls(), 2);
        assert_eq!(tokens.get_valid_token(false).await.unwrap(), second);
    }

    #[tokio::test]
    async fn persisted_credential_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let service = Arc::new(MockIdentityService::new(MockBehavior::Success));

        let first = manager(&service, CredentialStore::new(&path), &auth_config())
            .get_valid_token(false)
            .await
            .unwrap();
        let restarted = manager(&service, CredentialStore::new(&path), &auth_config());
        assert_eq!(restarted.get_valid_token(false).await.unwrap(), first);
        assert_eq!(service.create_calls(), 1);
    }

    #[tokio::test]
    async fn corrupt_file_triggers_fresh_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, "\u{0}garbage").unwrap();

        let service = Arc::new(MockIdentityService::new(MockBehavior::Success));
        let tokens = manager(&service, CredentialStore::new(&path), &auth_config());
        assert_eq!(
            tokens.get_valid_token(false).await.unwrap(),
            "created-id-token-1"
        );
        assert!(CredentialStore::new(&path).load().is_some());
    }

    #[tokio::test]
    async fn clear_tokens_forgets_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let service = Arc::new(MockIdentityService::new(MockBehavior::Success));
        let tokens = manager(&service, CredentialStore::new(&path), &auth_config());

        tokens.get_valid_token(false).await.unwrap();
        tokens.clear_tokens().await.unwrap();
        assert!(!path.exists());
        assert!(tokens.current_credential().await.is_none());

        tokens.get_valid_token(false).await.unwrap();
        assert_eq!(service.create_calls(), 2);
    }

    #[tokio::test]
    async fn remote_verification_refreshes_rejected_token() {
        let service = Arc::new(MockIdentityService::new(MockBehavior::Success));
        let config = AuthConfig {
            verify_remote: true,
            ..auth_config()
        };
        let tokens = manager(&service, CredentialStore::ephemeral(), &config);

        let first = tokens.get_valid_token(false).await.unwrap();
        assert_eq!(tokens.get_valid_token(false).await.unwrap(), first);
        assert_eq!(service.lookup_calls(), 1);

        service.set_behavior(MockBehavior::LookupRejected);
        assert_eq!(
            tokens.get_valid_token(false).await.unwrap(),
            "refreshed-id-token-1"
        );
    }
}
