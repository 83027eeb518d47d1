//! In-process identity service with scripted behavior, for tests and offline runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::client::IdentityService;
use super::models::{AccountInfo, Credential};
use crate::error::AuthError;

/// Mock behavior for the mock identity service
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MockBehavior {
    /// Every call succeeds
    #[default]
    Success,
    /// Refresh is rejected as an invalid refresh token; signup still works
    RefreshRejected,
    /// Lookups report the identity token as invalid; everything else works
    LookupRejected,
    /// Every call fails with a network error
    NetworkDown,
    /// Every call fails with a service error payload
    ServiceError { code: i64, message: String },
}

pub struct MockIdentityService {
    behavior: Mutex<MockBehavior>,
    latency: Duration,
    lifetime: chrono::Duration,
    created: AtomicUsize,
    refreshed: AtomicUsize,
    lookups: AtomicUsize,
}

impl MockIdentityService {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            latency: Duration::ZERO,
            lifetime: chrono::Duration::hours(1),
            created: AtomicUsize::new(0),
            refreshed: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Delay every call, so concurrent callers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Lifetime of issued credentials.
    pub fn with_lifetime(mut self, lifetime: chrono::Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    pub fn create_calls(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refreshed.load(Ordering::SeqCst)
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn behavior(&self) -> MockBehavior {
        self.behavior.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn simulate(&self) -> Result<(), AuthError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.behavior() {
            MockBehavior::NetworkDown => Err(AuthError::Network("connection refused".to_string())),
            MockBehavior::ServiceError { code, message } => Err(AuthError::Api {
                code,
                message,
                errors: Vec::new(),
            }),
            _ => Ok(()),
        }
    }

    fn issue(&self, prefix: &str, n: usize) -> Credential {
        Credential {
            id_token: format!("{}-id-token-{}", prefix, n),
            refresh_token: format!("{}-refresh-token-{}", prefix, n),
            local_id: format!("local-{}", n),
            expires_at: Utc::now() + self.lifetime,
        }
    }
}

#[async_trait]
impl IdentityService for MockIdentityService {
    async fn create_anonymous_account(&self) -> Result<Credential, AuthError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        self.simulate().await?;
        Ok(self.issue("created", n))
    }

    async fn get_account_info(&self, id_token: &str) -> Result<AccountInfo, AuthError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        if self.behavior() == MockBehavior::LookupRejected || id_token.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        Ok(AccountInfo {
            local_id: Some("local-1".to_string()),
            created_at: None,
            last_login_at: None,
            last_refresh_at: None,
        })
    }

    async fn refresh_authentication_token(
        &self,
        _refresh_token: &str,
    ) -> Result<Credential, AuthError> {
        let n = self.refreshed.fetch_add(1, Ordering::SeqCst) + 1;
        self.simulate().await?;
        if self.behavior() == MockBehavior::RefreshRejected {
            return Err(AuthError::InvalidToken);
        }
        Ok(self.issue("refreshed", n))
    }
}
