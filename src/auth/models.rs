use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AuthError;

/// Lifetime assumed when the service omits `expiresIn`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// An identity token plus the refresh token that renews it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id_token: String,
    pub refresh_token: String,
    pub local_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Usable for at least `margin` longer.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        Utc::now() + margin < self.expires_at
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at - Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountInfo {
    pub local_id: Option<String>,
    pub created_at: Option<String>,
    pub last_login_at: Option<String>,
    pub last_refresh_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SignupResponse {
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<Value>,
    pub local_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RefreshTokenResponse {
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<Value>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LookupResponse {
    #[serde(default)]
    pub users: Vec<LookupUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LookupUser {
    pub local_id: Option<String>,
    pub created_at: Option<String>,
    pub last_login_at: Option<String>,
    pub last_refresh_at: Option<String>,
}

// expiresIn comes back as a string of seconds ("3600"), sometimes as a number.
fn expires_in_secs(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::String(s)) => s.parse().unwrap_or(DEFAULT_EXPIRES_IN_SECS),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(DEFAULT_EXPIRES_IN_SECS),
        _ => DEFAULT_EXPIRES_IN_SECS,
    }
}

fn required(field: Option<String>, name: &str) -> Result<String, AuthError> {
    field
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::InvalidResponse(format!("missing {}", name)))
}

impl SignupResponse {
    pub fn into_credential(self) -> Result<Credential, AuthError> {
        let expires_in = expires_in_secs(self.expires_in.as_ref());
        Ok(Credential {
            id_token: required(self.id_token, "idToken")?,
            refresh_token: required(self.refresh_token, "refreshToken")?,
            local_id: self.local_id.unwrap_or_default(),
            expires_at: Utc::now() + Duration::seconds(expires_in),
        })
    }
}

impl RefreshTokenResponse {
    pub fn into_credential(self) -> Result<Credential, AuthError> {
        let expires_in = expires_in_secs(self.expires_in.as_ref());
        Ok(Credential {
            id_token: required(self.id_token, "id_token")?,
            refresh_token: required(self.refresh_token, "refresh_token")?,
            local_id: self.user_id.unwrap_or_default(),
            expires_at: Utc::now() + Duration::seconds(expires_in),
        })
    }
}

impl LookupResponse {
    pub fn into_account_info(self) -> Result<AccountInfo, AuthError> {
        let user = self
            .users
            .into_iter()
            .next()
            .ok_or_else(|| AuthError::InvalidResponse("lookup returned no users".to_string()))?;
        Ok(AccountInfo {
            local_id: user.local_id,
            created_at: user.created_at,
            last_login_at: user.last_login_at,
            last_refresh_at: user.last_refresh_at,
        })
    }
}
