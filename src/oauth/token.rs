use crate::clock::{Clock, add_ttl};
use crate::id::IdGenerator;
use crate::types::{AccessTokenKey, AuthScope, OauthAccessToken, OauthClientId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Opaque bearer tokens minted for oauth clients. Revocation is permanent.
#[derive(Clone)]
pub struct AccessTokenStore {
    tokens: Arc<RwLock<HashMap<AccessTokenKey, OauthAccessToken>>>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    ttl: Option<Duration>,
}

impl AccessTokenStore {
    pub fn new(ids: Arc<dyn IdGenerator>, clock: Arc<dyn Clock>, ttl: Option<Duration>) -> Self {
        Self {
            tokens: Arc::new(RwLock::new(HashMap::new())),
            ids,
            clock,
            ttl,
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub async fn issue(
        &self,
        client_id: OauthClientId,
        user_id: UserId,
        scope: AuthScope,
    ) -> OauthAccessToken {
        let now = self.clock.now();
        let token = OauthAccessToken {
            key: AccessTokenKey::from(self.ids.next()),
            client_id,
            user_id,
            scope,
            issued_at: now,
            expires_at: self.ttl.map(|ttl| add_ttl(now, ttl)),
            revoked_at: None,
        };
        self.tokens.write().await.insert(token.key, token.clone());
        tracing::info!(
            "issued access token for user {} to client {}",
            user_id,
            client_id
        );
        token
    }

    pub async fn get_active(&self, key: AccessTokenKey) -> Option<OauthAccessToken> {
        let now = self.clock.now();
        self.tokens
            .read()
            .await
            .get(&key)
            .filter(|t| t.is_active_at(now))
            .cloned()
    }

    /// Revokes a token if it belongs to `client_id`; unknown tokens are ignored
    pub async fn revoke_for_client(&self, key: AccessTokenKey, client_id: OauthClientId) -> bool {
        let now = self.clock.now();
        let mut tokens = self.tokens.write().await;
        match tokens.get_mut(&key) {
            Some(token) if token.client_id == client_id && token.revoked_at.is_none() => {
                token.revoked_at = Some(now);
                tracing::info!("client {} revoked an access token", client_id);
                true
            }
            _ => false,
        }
    }

    pub async fn revoke_all_for_user(&self, user_id: UserId) -> usize {
        let now = self.clock.now();
        let mut tokens = self.tokens.write().await;
        let mut revoked = 0;
        for token in tokens.values_mut() {
            if token.user_id == user_id && token.revoked_at.is_none() {
                token.revoked_at = Some(now);
                revoked += 1;
            }
        }
        revoked
    }

    pub async fn cleanup_expired(&self) {
        let now = self.clock.now();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.is_active_at(now));
        let removed = before - tokens.len();
        if removed > 0 {
            tracing::debug!("cleaned up {} dead access tokens", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::id::SequentialIdGenerator;
    use uuid::Uuid;

    fn ids() -> (OauthClientId, UserId) {
        (
            OauthClientId::from(Uuid::from_u128(100)),
            UserId::from(Uuid::from_u128(200)),
        )
    }

    #[tokio::test]
    async fn test_tokens_expire_when_ttl_set() {
        let clock = Arc::new(VirtualClock::default());
        let store = AccessTokenStore::new(
            Arc::new(SequentialIdGenerator::new()),
            clock.clone(),
            Some(Duration::from_secs(3600)),
        );
        let (client, user) = ids();
        let token = store.issue(client, user, AuthScope::Base).await;

        assert!(store.get_active(token.key).await.is_some());
        clock.advance(Duration::from_secs(3600));
        assert!(store.get_active(token.key).await.is_none());
    }

    #[tokio::test]
    async fn test_revocation_is_permanent_and_client_bound() {
        let store = AccessTokenStore::new(
            Arc::new(SequentialIdGenerator::new()),
            Arc::new(VirtualClock::default()),
            None,
        );
        let (client, user) = ids();
        let other_client = OauthClientId::from(Uuid::from_u128(101));
        let token = store.issue(client, user, AuthScope::Base).await;

        assert!(!store.revoke_for_client(token.key, other_client).await);
        assert!(store.get_active(token.key).await.is_some());

        assert!(store.revoke_for_client(token.key, client).await);
        assert!(!store.revoke_for_client(token.key, client).await);
        assert!(store.get_active(token.key).await.is_none());
    }

    #[tokio::test]
    async fn test_revoke_all_for_user() {
        let store = AccessTokenStore::new(
            Arc::new(SequentialIdGenerator::new()),
            Arc::new(VirtualClock::default()),
            None,
        );
        let (client, user) = ids();
        store.issue(client, user, AuthScope::Base).await;
        store.issue(client, user, AuthScope::Base).await;
        assert_eq!(store.revoke_all_for_user(user).await, 2);
        store.cleanup_expired().await;
        assert_eq!(store.revoke_all_for_user(user).await, 0);
    }
}
