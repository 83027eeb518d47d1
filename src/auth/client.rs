use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::models::{
    AccountInfo, Credential, LookupResponse, RefreshTokenResponse, SignupResponse,
};
use crate::config::AuthConfig;
use crate::error::AuthError;

// Web SDK 身份标识，服务端据此识别客户端
const FIREBASE_AGENT: &str = "fire-core/0.11.1 fire-core-esm2017/0.11.1 fire-js/ fire-js-all-app/11.3.1 fire-auth/1.9.0 fire-auth-esm2017/1.9.0";
const CLIENT_VERSION: &str = "Chrome/JsCore/11.3.1/FirebaseCore-web";
const GMP_ID: &str = "1:1072000975600:web:75b0bf3a9bb8d92e767835";
const CLIENT_DATA: &str = "COKQywE=";

/// Request/response operations against the remote identity endpoint.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn create_anonymous_account(&self) -> Result<Credential, AuthError>;

    /// Fails with [`AuthError::InvalidToken`] when the token is malformed or expired.
    async fn get_account_info(&self, id_token: &str) -> Result<AccountInfo, AuthError>;

    async fn refresh_authentication_token(
        &self,
        refresh_token: &str,
    ) -> Result<Credential, AuthError>;
}

pub struct AuthClient {
    http: Client,
    config: AuthConfig,
}

impl AuthClient {
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { http, config })
    }

    fn post(&self, url: &str) -> RequestBuilder {
        self.http
            .post(url)
            .query(&[("key", self.config.api_key.as_str())])
            .headers(common_headers())
    }

    // 服务端错误即使带着 4xx 状态码也会在 body 里给出 {"error": {...}}，先解析 body
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, AuthError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        let parsed: Option<Value> = serde_json::from_str(&body).ok();
        if let Some(error) = parsed.as_ref().and_then(|v| v.get("error")) {
            log::debug!("Identity service error payload: {}", error);
            return Err(AuthError::from_service_error(error));
        }
        if !status.is_success() {
            return Err(AuthError::from_status(status, &body));
        }

        let value = parsed.ok_or_else(|| {
            AuthError::InvalidResponse(format!("non-JSON body ({} bytes)", body.len()))
        })?;
        serde_json::from_value(value).map_err(|e| AuthError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl IdentityService for AuthClient {
    async fn create_anonymous_account(&self) -> Result<Credential, AuthError> {
        log::debug!("Creating anonymous account via {}", self.config.signup_url);
        let request = self
            .post(&self.config.signup_url)
            .json(&json!({ "returnSecureToken": true }));
        let response: SignupResponse = self.send(request).await?;
        response.into_credential()
    }

    async fn get_account_info(&self, id_token: &str) -> Result<AccountInfo, AuthError> {
        let request = self
            .post(&self.config.lookup_url)
            .json(&json!({ "idToken": id_token }));
        let response: LookupResponse = self.send(request).await?;
        response.into_account_info()
    }

    async fn refresh_authentication_token(
        &self,
        refresh_token: &str,
    ) -> Result<Credential, AuthError> {
        log::debug!("Refreshing identity token via {}", self.config.refresh_url);
        // 刷新接口只接受表单格式
        let request = self.post(&self.config.refresh_url).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ]);
        let response: RefreshTokenResponse = self.send(request).await?;
        response.into_credential()
    }
}

/// `x-firebase-client`: base64 of the compact heartbeat JSON for today.
pub(crate) fn firebase_client_header() -> String {
    let heartbeat = json!({
        "version": 2,
        "heartbeats": [{
            "agent": FIREBASE_AGENT,
            "dates": [chrono::Utc::now().format("%Y-%m-%d").to_string()],
        }]
    });
    B64.encode(heartbeat.to_string())
}

fn common_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("accept", HeaderValue::from_static("*/*"));
    headers.insert("accept-language", HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert("x-client-version", HeaderValue::from_static(CLIENT_VERSION));
    headers.insert("x-firebase-gmpid", HeaderValue::from_static(GMP_ID));
    headers.insert("x-client-data", HeaderValue::from_static(CLIENT_DATA));
    // base64 输出只包含合法的 header 字符
    if let Ok(value) = HeaderValue::from_str(&firebase_client_header()) {
        headers.insert("x-firebase-client", value);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firebase_client_header_decodes_to_heartbeat() {
        let decoded = B64.decode(firebase_client_header()).unwrap();
        let value: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["heartbeats"][0]["agent"], FIREBASE_AGENT);
        let date = value["heartbeats"][0]["dates"][0].as_str().unwrap();
        assert_eq!(date.len(), "2024-01-01".len());
    }

    #[test]
    fn common_headers_carry_client_identity() {
        let headers = common_headers();
        assert_eq!(headers["x-client-version"], CLIENT_VERSION);
        assert!(headers.contains_key("x-firebase-client"));
    }
}
