use crate::error::Result;
use crate::types::{
    ExternalId, ExternalProfile, Provider, ShortExternalUser, validate_username,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cached short users of one provider. Entries are never deleted.
#[derive(Clone)]
pub struct ExternalAccountStore {
    provider: Provider,
    users: Arc<RwLock<HashMap<ExternalId, ShortExternalUser>>>,
}

impl ExternalAccountStore {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            users: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Validates a provider profile and records it as fetched at `fetched_at`.
    /// A snapshot older than the cached one is ignored.
    pub async fn touch(
        &self,
        profile: &ExternalProfile,
        fetched_at: DateTime<Utc>,
    ) -> Result<ShortExternalUser> {
        let id = ExternalId::parse(self.provider, &profile.id)?;
        let username = validate_username(&profile.username)?;

        let mut users = self.users.write().await;
        if let Some(existing) = users.get(&id)
            && existing.last_fetched_at > fetched_at
        {
            tracing::debug!(
                "ignoring stale {} profile snapshot for {}",
                self.provider,
                id
            );
            return Ok(existing.clone());
        }

        let short = ShortExternalUser {
            provider: self.provider,
            id: id.clone(),
            username,
            last_fetched_at: fetched_at,
        };
        users.insert(id, short.clone());
        Ok(short)
    }

    pub async fn get(&self, id: &ExternalId) -> Option<ShortExternalUser> {
        self.users.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }
}

/// One store per provider
#[derive(Clone)]
pub struct ExternalAccounts {
    a: ExternalAccountStore,
    b: ExternalAccountStore,
    c: ExternalAccountStore,
}

impl ExternalAccounts {
    pub fn new() -> Self {
        Self {
            a: ExternalAccountStore::new(Provider::A),
            b: ExternalAccountStore::new(Provider::B),
            c: ExternalAccountStore::new(Provider::C),
        }
    }

    pub fn for_provider(&self, provider: Provider) -> &ExternalAccountStore {
        match provider {
            Provider::A => &self.a,
            Provider::B => &self.b,
            Provider::C => &self.c,
        }
    }
}

impl Default for ExternalAccounts {
    fn default() -> Self {
        Self::new()
    }
}
