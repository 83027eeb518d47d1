use serde_json::Value;
use thiserror::Error;

use crate::session::SessionState;

/// Errors from the identity endpoint and the token lifecycle.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {code}: {message}")]
    Api {
        code: i64,
        message: String,
        errors: Vec<Value>,
    },

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

// Service messages that mean the presented token is no longer usable.
const TOKEN_REJECTIONS: &[&str] = &[
    "INVALID_ID_TOKEN",
    "INVALID_REFRESH_TOKEN",
    "TOKEN_EXPIRED",
    "USER_NOT_FOUND",
    "USER_DISABLED",
    "CREDENTIAL_TOO_OLD_LOGIN_AGAIN",
];

impl AuthError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Map a `{"code", "message", "errors"}` service payload.
    pub fn from_service_error(error: &Value) -> Self {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(400);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();

        // 服务端有时会附带说明，例如 "TOKEN_EXPIRED : ..."
        if TOKEN_REJECTIONS.iter().any(|r| message.starts_with(r)) {
            return AuthError::InvalidToken;
        }

        let errors = error
            .get("errors")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        AuthError::Api { code, message, errors }
    }

    /// Map a failed HTTP status whose body carried no service payload.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 | 403 => AuthError::InvalidToken,
            code => AuthError::Api {
                code: i64::from(code),
                message: Self::truncate_body(body),
                errors: Vec::new(),
            },
        }
    }

    /// Transport failures; the caller decides whether to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Network(_))
    }

    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, AuthError::InvalidToken)
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            AuthError::InvalidResponse(e.to_string())
        } else {
            AuthError::Network(e.to_string())
        }
    }
}

/// Errors raised by the voice session channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Not connected")]
    NotConnected,

    #[error("Session already active (state: {0:?})")]
    AlreadyActive(SessionState),

    #[error("Identity token rejected by the voice service")]
    InvalidCredential,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Service error {code}: {message}")]
    Service { code: i64, message: String },

    #[error("Timed out waiting for the session to open")]
    Timeout,

    #[error("Unsupported audio codec: {0}")]
    UnsupportedCodec(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
                SessionError::InvalidCredential
            }
            other => SessionError::Transport(other.to_string()),
        }
    }
}
