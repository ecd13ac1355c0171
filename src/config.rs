use crate::error::{AuthError, Result};
use crate::oauth::NewClient;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Knobs of the core, independent of how they were read
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub session_ttl: Duration,
    pub code_ttl: Duration,
    pub state_ttl: Duration,
    /// None = access tokens live until revoked
    pub access_token_ttl: Option<Duration>,
    pub external_timeout: Duration,
    /// cap on pending consents, unexchanged codes and in-flight upstream flows, each
    pub max_pending_authorizations: usize,
    pub system_key: Option<String>,
    /// client id this service presents to provider C
    pub upstream_client_id: String,
    /// where provider C sends the browser back
    pub upstream_redirect_uri: Url,
}

impl CoreConfig {
    pub fn new(upstream_client_id: String, upstream_redirect_uri: Url) -> Self {
        Self {
            session_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            code_ttl: Duration::from_secs(10 * 60),
            state_ttl: Duration::from_secs(10 * 60),
            access_token_ttl: None,
            external_timeout: Duration::from_secs(10),
            max_pending_authorizations: 1000,
            system_key: None,
            upstream_client_id,
            upstream_redirect_uri,
        }
    }

    /// Defaults for a server reachable at `public_url`
    pub fn for_public_url(public_url: &Url) -> Result<Self> {
        let redirect = public_url
            .join("/oauth/upstream/callback")
            .map_err(|e| AuthError::invalid_request(format!("invalid public url: {}", e)))?;
        Ok(Self::new("twinlink".to_string(), redirect))
    }
}

/// A first-party oauth client from the command line: `key|callback_uri|secret`
#[derive(Clone)]
pub struct SystemClientConfig {
    pub key: String,
    pub callback_uri: Url,
    pub secret: String,
}

impl fmt::Debug for SystemClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemClientConfig")
            .field("key", &self.key)
            .field("callback_uri", &self.callback_uri.as_str())
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl FromStr for SystemClientConfig {
    type Err = AuthError;

    fn from_str(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(3, '|');
        let (Some(key), Some(callback), Some(secret)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::invalid_request(
                "expected key|callback_uri|secret",
            ));
        };
        if secret.is_empty() {
            return Err(AuthError::invalid_request("client secret must not be empty"));
        }
        let callback_uri = Url::parse(callback)
            .map_err(|e| AuthError::invalid_request(format!("invalid callback uri: {}", e)))?;
        Ok(Self {
            key: key.to_string(),
            callback_uri,
            secret: secret.to_string(),
        })
    }
}

impl SystemClientConfig {
    pub fn to_new_client(&self) -> NewClient {
        let mut app_uri = self.callback_uri.clone();
        app_uri.set_path("/");
        app_uri.set_query(None);
        NewClient {
            display_name: self.key.clone(),
            app_uri,
            callback_uri: self.callback_uri.clone(),
            key: Some(self.key.clone()),
        }
    }
}
