use crate::clock::Clock;
use crate::error::{AuthError, Result};
use crate::external::bounded;
use crate::id::IdGenerator;
use crate::password::PasswordService;
use crate::types::{AuthContext, OauthClient, OauthClientId, Permission};
use crate::user::validate_display_name;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

/// suffix accepted after a bare key, e.g. `forum@clients`
const CLIENT_KEY_SUFFIX: &str = "@clients";

pub struct NewClient {
    pub display_name: String,
    pub app_uri: Url,
    pub callback_uri: Url,
    /// only system contexts may register keyed clients
    pub key: Option<String>,
}

/// A freshly registered client with its clear secret, shown exactly once
pub struct RegisteredClient {
    pub client: OauthClient,
    pub secret: String,
}

#[derive(Default)]
struct ClientTables {
    by_id: HashMap<OauthClientId, OauthClient>,
    by_key: HashMap<String, OauthClientId>,
}

/// Registry of third-party applications allowed to request user authorization
#[derive(Clone)]
pub struct ClientRegistry {
    tables: Arc<RwLock<ClientTables>>,
    passwords: Arc<dyn PasswordService>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

fn validate_key(raw: &str) -> Result<String> {
    let valid = !raw.is_empty()
        && raw.len() <= 32
        && raw
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if valid {
        Ok(raw.to_string())
    } else {
        Err(AuthError::invalid_request(format!(
            "invalid client key: {:?}",
            raw
        )))
    }
}

/// Callback uris must be https, http on loopback, or a native app scheme.
pub fn validate_callback_uri(uri: &Url) -> Result<()> {
    match uri.scheme() {
        "https" => {}
        "http" => {
            let loopback = matches!(
                uri.host_str(),
                Some("localhost") | Some("127.0.0.1") | Some("[::1]")
            );
            if !loopback {
                return Err(AuthError::invalid_request(
                    "invalid callback uri: http only allowed for localhost",
                ));
            }
        }
        "javascript" | "data" | "vbscript" | "file" => {
            return Err(AuthError::invalid_request(format!(
                "invalid callback uri: {} scheme not allowed",
                uri.scheme()
            )));
        }
        _ => {}
    }
    if uri.fragment().is_some() {
        return Err(AuthError::invalid_request(
            "invalid callback uri: fragments are not allowed",
        ));
    }
    Ok(())
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl ClientRegistry {
    pub fn new(
        passwords: Arc<dyn PasswordService>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            tables: Arc::new(RwLock::new(ClientTables::default())),
            passwords,
            ids,
            clock,
            timeout,
        }
    }

    /// Self-service registration by a user, or keyed registration by the system
    pub async fn register(&self, acx: &AuthContext, new: NewClient) -> Result<RegisteredClient> {
        let owner = match (&new.key, acx) {
            (Some(_), _) => {
                acx.require_system()?;
                None
            }
            (None, AuthContext::System { .. }) => None,
            (None, _) => Some(acx.require_user(Permission::ManageOauthClients)?),
        };
        let secret = generate_secret();
        let client = self.insert(new, &secret, owner).await?;
        Ok(RegisteredClient { client, secret })
    }

    /// Installs or refreshes a client configured out of band; its id survives updates
    pub async fn upsert_system_client(&self, new: NewClient, secret: &str) -> Result<OauthClient> {
        if new.key.is_none() {
            return Err(AuthError::invalid_request("system clients need a key"));
        }
        self.insert(new, secret, None).await
    }

    async fn insert(
        &self,
        new: NewClient,
        secret: &str,
        owner: Option<crate::types::UserId>,
    ) -> Result<OauthClient> {
        let display_name = validate_display_name(&new.display_name)?;
        let key = new.key.as_deref().map(validate_key).transpose()?;
        validate_callback_uri(&new.callback_uri)?;

        let secret_hash = bounded(
            "client secret hashing",
            self.timeout,
            self.passwords.hash(secret),
        )
        .await?;

        let mut tables = self.tables.write().await;
        let existing = key.as_ref().and_then(|k| tables.by_key.get(k)).copied();
        let client = OauthClient {
            id: existing.unwrap_or_else(|| OauthClientId::from(self.ids.next())),
            key: key.clone(),
            display_name,
            app_uri: new.app_uri,
            callback_uri: new.callback_uri,
            secret_hash,
            owner,
            created_at: self.clock.now(),
        };
        if let Some(key) = key {
            tables.by_key.insert(key, client.id);
        }
        tables.by_id.insert(client.id, client.clone());
        tracing::info!(
            "registered oauth client {} ({})",
            client.id,
            client.display_name
        );
        Ok(client)
    }

    pub async fn get(&self, id: OauthClientId) -> Option<OauthClient> {
        self.tables.read().await.by_id.get(&id).cloned()
    }

    /// Accepts a client id, a bare key, or `key@clients`
    pub async fn resolve(&self, raw: &str) -> Option<OauthClient> {
        let tables = self.tables.read().await;
        if let Ok(id) = raw.parse::<OauthClientId>() {
            return tables.by_id.get(&id).cloned();
        }
        let bare = raw.strip_suffix(CLIENT_KEY_SUFFIX).unwrap_or(raw);
        tables
            .by_key
            .get(bare)
            .and_then(|id| tables.by_id.get(id))
            .cloned()
    }

    /// Client authentication for the token and revocation endpoints
    pub async fn authenticate(&self, raw_id: &str, secret: &str) -> Result<OauthClient> {
        let Some(client) = self.resolve(raw_id).await else {
            tracing::warn!("authentication attempt for unknown client {}", raw_id);
            return Err(AuthError::InvalidClient("unknown client".to_string()));
        };
        let matches = bounded(
            "client secret verification",
            self.timeout,
            self.passwords.verify(secret, &client.secret_hash),
        )
        .await?;
        if !matches {
            tracing::warn!("invalid secret for client {}", client.id);
            return Err(AuthError::InvalidClient(
                "client authentication failed".to_string(),
            ));
        }
        Ok(client)
    }
}
