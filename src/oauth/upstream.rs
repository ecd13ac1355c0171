use crate::error::{AuthError, Result};
use crate::types::{ExternalProfile, OauthStateId};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct UpstreamAccessToken(pub String);

/// The provider-C authorization server as seen by this service acting as an oauth client
#[async_trait]
pub trait UpstreamOauthClient: Send + Sync {
    /// Where the browser goes to authorize, carrying `state`
    fn authorization_uri(&self, state: &OauthStateId) -> Url;

    async fn exchange_code(&self, code: &str) -> Result<UpstreamAccessToken>;

    async fn get_profile(&self, token: &UpstreamAccessToken) -> Result<ExternalProfile>;
}

#[derive(Debug, Clone)]
pub struct HttpUpstreamConfig {
    pub authorize_uri: Url,
    pub token_uri: Url,
    pub profile_uri: Url,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: Url,
    pub scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

#[derive(Deserialize)]
struct ProfileResponse {
    id: RawId,
    username: String,
}

#[derive(Clone)]
pub struct HttpUpstreamOauthClient {
    client: Client,
    config: HttpUpstreamConfig,
    auth_header: String,
}

impl HttpUpstreamOauthClient {
    pub fn new(config: HttpUpstreamConfig) -> Self {
        let auth = format!("{}:{}", config.client_id, config.client_secret);
        let auth_header = format!("Basic {}", BASE64.encode(auth.as_bytes()));
        Self {
            client: Client::new(),
            config,
            auth_header,
        }
    }
}

fn unavailable(what: &str, e: reqwest::Error) -> AuthError {
    tracing::warn!("upstream {} failed: {}", what, e);
    AuthError::ExternalUnavailable(format!("upstream {} failed", what))
}

#[async_trait]
impl UpstreamOauthClient for HttpUpstreamOauthClient {
    fn authorization_uri(&self, state: &OauthStateId) -> Url {
        let mut url = self.config.authorize_uri.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", self.config.redirect_uri.as_str())
                .append_pair("state", &state.to_string());
            if let Some(scope) = &self.config.scope {
                query.append_pair("scope", scope);
            }
        }
        url
    }

    async fn exchange_code(&self, code: &str) -> Result<UpstreamAccessToken> {
        let body = serde_urlencoded::to_string([
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ])
        .map_err(|e| AuthError::Internal(e.to_string()))?;

        let response = self
            .client
            .post(self.config.token_uri.clone())
            .header("Authorization", &self.auth_header)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| unavailable("code exchange", e))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("upstream rejected authorization code: {} - {}", status, body);
            return Err(AuthError::InvalidState);
        }
        if !status.is_success() {
            tracing::warn!("upstream token endpoint answered {}", status);
            return Err(AuthError::ExternalUnavailable(format!(
                "upstream token endpoint answered {}",
                status
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| unavailable("token response decoding", e))?;
        Ok(UpstreamAccessToken(token.access_token))
    }

    async fn get_profile(&self, token: &UpstreamAccessToken) -> Result<ExternalProfile> {
        let response = self
            .client
            .get(self.config.profile_uri.clone())
            .header("Authorization", format!("Bearer {}", token.0))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| unavailable("profile fetch", e))?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::warn!("upstream profile endpoint answered {}", status);
            return Err(AuthError::ExternalUnavailable(format!(
                "upstream profile endpoint answered {}",
                status
            )));
        }

        let profile: ProfileResponse = response
            .json()
            .await
            .map_err(|e| unavailable("profile decoding", e))?;
        Ok(ExternalProfile {
            id: match profile.id {
                RawId::Number(n) => n.to_string(),
                RawId::Text(s) => s,
            },
            username: profile.username,
        })
    }
}

/// In-process stand-in for the upstream server, for development and tests
pub struct MemUpstreamOauthClient {
    authorize_uri: Url,
    codes: RwLock<HashMap<String, ExternalProfile>>,
    tokens: RwLock<HashMap<String, ExternalProfile>>,
    offline: AtomicBool,
}

impl MemUpstreamOauthClient {
    pub fn new(authorize_uri: Url) -> Self {
        Self {
            authorize_uri,
            codes: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulates the user approving upstream; returns the code the callback will carry
    pub async fn authorize(&self, profile: ExternalProfile) -> String {
        let code = Uuid::new_v4().simple().to_string();
        self.codes.write().await.insert(code.clone(), profile);
        code
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(AuthError::ExternalUnavailable(
                "upstream is offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl UpstreamOauthClient for MemUpstreamOauthClient {
    fn authorization_uri(&self, state: &OauthStateId) -> Url {
        let mut url = self.authorize_uri.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("state", &state.to_string());
        url
    }

    async fn exchange_code(&self, code: &str) -> Result<UpstreamAccessToken> {
        self.check_online()?;
        let profile = self
            .codes
            .write()
            .await
            .remove(code)
            .ok_or(AuthError::InvalidState)?;
        let token = Uuid::new_v4().simple().to_string();
        self.tokens.write().await.insert(token.clone(), profile);
        Ok(UpstreamAccessToken(token))
    }

    async fn get_profile(&self, token: &UpstreamAccessToken) -> Result<ExternalProfile> {
        self.check_online()?;
        self.tokens
            .read()
            .await
            .get(&token.0)
            .cloned()
            .ok_or_else(|| AuthError::ExternalUnavailable("upstream token unknown".to_string()))
    }
}
