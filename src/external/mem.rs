use super::ExternalClient;
use crate::error::{AuthError, Result};
use crate::types::{ExternalCredentials, ExternalId, ExternalProfile, ExternalSession, Provider};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone)]
struct MemAccount {
    id: String,
    username: String,
    password: String,
}

/// In-memory provider, for local development and tests
pub struct MemExternalClient {
    provider: Provider,
    accounts: RwLock<HashMap<String, MemAccount>>,
    sessions: RwLock<HashMap<String, String>>,
    offline: AtomicBool,
    latency: RwLock<Option<Duration>>,
}

impl MemExternalClient {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            accounts: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
            latency: RwLock::new(None),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub async fn create_user(&self, id: &str, username: &str, password: &str) {
        self.accounts.write().await.insert(
            id.to_string(),
            MemAccount {
                id: id.to_string(),
                username: username.to_string(),
                password: password.to_string(),
            },
        );
    }

    /// Opens a provider session for `id` directly, as if the user logged in there
    pub async fn create_session_key(&self, id: &str) -> Result<String> {
        if !self.accounts.read().await.contains_key(id) {
            return Err(AuthError::not_found(format!(
                "no {} account {}",
                self.provider, id
            )));
        }
        let key = Uuid::new_v4().simple().to_string();
        self.sessions
            .write()
            .await
            .insert(key.clone(), id.to_string());
        Ok(key)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().await = latency;
    }

    async fn simulate_network(&self) -> Result<()> {
        let latency = *self.latency.read().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuthError::ExternalUnavailable(format!(
                "{} is offline",
                self.provider
            )));
        }
        Ok(())
    }

    fn profile(account: &MemAccount) -> ExternalProfile {
        ExternalProfile {
            id: account.id.clone(),
            username: account.username.clone(),
        }
    }
}

#[async_trait]
impl ExternalClient for MemExternalClient {
    async fn create_session(&self, credentials: &ExternalCredentials) -> Result<ExternalSession> {
        self.simulate_network().await?;

        let account = {
            let accounts = self.accounts.read().await;
            accounts
                .values()
                .find(|a| a.username == credentials.login)
                .cloned()
        };
        let Some(account) = account else {
            return Err(AuthError::InvalidCredentials);
        };
        let password_matches: bool = credentials
            .password
            .as_bytes()
            .ct_eq(account.password.as_bytes())
            .into();
        if !password_matches {
            return Err(AuthError::InvalidCredentials);
        }

        let key = Uuid::new_v4().simple().to_string();
        self.sessions
            .write()
            .await
            .insert(key.clone(), account.id.clone());
        Ok(ExternalSession {
            key,
            user: Self::profile(&account),
        })
    }

    async fn test_session(&self, key: &str) -> Result<Option<ExternalSession>> {
        self.simulate_network().await?;

        let Some(id) = self.sessions.read().await.get(key).cloned() else {
            return Ok(None);
        };
        let accounts = self.accounts.read().await;
        Ok(accounts.get(&id).map(|account| ExternalSession {
            key: key.to_string(),
            user: Self::profile(account),
        }))
    }

    async fn get_short_user_by_id(&self, id: &ExternalId) -> Result<Option<ExternalProfile>> {
        self.simulate_network().await?;
        Ok(self
            .accounts
            .read()
            .await
            .get(id.as_str())
            .map(Self::profile))
    }
}
