use crate::clock::{Clock, is_expired};
use crate::types::{AuthScope, OauthClientId, UserId};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

use super::provider::ResponseType;

pub trait Issued {
    fn issued_at(&self) -> DateTime<Utc>;
}

/// authorization request waiting for the user to approve or deny
#[derive(Clone, Debug)]
pub struct PendingAuthorization {
    pub client_id: OauthClientId,
    pub user_id: UserId,
    pub redirect_uri: Url,
    pub response_type: ResponseType,
    pub scope: AuthScope,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// what an authorization code stands for
#[derive(Clone, Debug)]
pub struct AuthorizationGrant {
    pub client_id: OauthClientId,
    pub user_id: UserId,
    pub redirect_uri: Url,
    pub scope: AuthScope,
    pub code_challenge: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Issued for PendingAuthorization {
    fn issued_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Issued for AuthorizationGrant {
    fn issued_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug)]
pub enum Taken<V> {
    Missing,
    /// removed, but past its ttl
    Expired(V),
    Valid(V),
}

struct Entries<K, V> {
    values: HashMap<K, V>,
    /// insertion order, oldest first, for eviction at capacity
    order: VecDeque<K>,
}

/// Short-lived entries that can be taken exactly once.
/// Lookup and removal share one write guard, so two concurrent takes
/// of the same key cannot both see it.
pub struct SingleUseStore<K, V> {
    entries: Arc<RwLock<Entries<K, V>>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    capacity: usize,
}

impl<K, V> Clone for SingleUseStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            clock: self.clock.clone(),
            ttl: self.ttl,
            capacity: self.capacity,
        }
    }
}

impl<K, V> SingleUseStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Issued + Clone,
{
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Entries {
                values: HashMap::new(),
                order: VecDeque::new(),
            })),
            clock,
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;

        while entries.values.len() >= self.capacity {
            let Some(oldest) = entries.order.pop_front() else {
                break;
            };
            if entries.values.remove(&oldest).is_some() {
                tracing::debug!("evicted oldest single-use entry at capacity limit");
            }
        }

        entries.values.insert(key.clone(), value);
        entries.order.push_back(key);
    }

    pub async fn take(&self, key: &K) -> Taken<V> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let Some(value) = entries.values.remove(key) else {
            return Taken::Missing;
        };
        entries.order.retain(|k| k != key);

        if is_expired(value.issued_at(), self.ttl, now) {
            Taken::Expired(value)
        } else {
            Taken::Valid(value)
        }
    }

    /// Reads a live entry without consuming it
    pub async fn peek(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .values
            .get(key)
            .filter(|v| !is_expired(v.issued_at(), self.ttl, now))
            .cloned()
    }

    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let entries = &mut *entries;

        let before = entries.values.len();
        entries
            .values
            .retain(|_, v| !is_expired(v.issued_at(), self.ttl, now));
        let values = &entries.values;
        entries.order.retain(|k| values.contains_key(k));

        let removed = before - entries.values.len();
        if removed > 0 {
            tracing::debug!("cleaned up {} expired single-use entries", removed);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.values.len()
    }
}
