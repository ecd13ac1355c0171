use crate::clock::Clock;
use crate::error::{AuthError, LinkConflictKind, Result};
use crate::id::IdGenerator;
use crate::password::PasswordHash;
use crate::types::{ExternalRef, Links, Provider, User, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const DISPLAY_NAME_MAX_CHARS: usize = 64;

pub struct NewUser {
    pub display_name: String,
    pub username: Option<String>,
    pub password_hash: Option<PasswordHash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Created,
    /// the same user already held this exact account
    AlreadyLinked,
}

#[derive(Default)]
struct UserTables {
    users: HashMap<UserId, User>,
    by_username: HashMap<String, UserId>,
    /// reverse index, at most one user per external account
    by_external: HashMap<ExternalRef, UserId>,
}

/// Canonical users and their link table. Every write that touches the
/// link table and its reverse index happens under a single guard.
#[derive(Clone)]
pub struct UserStore {
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    tables: Arc<RwLock<UserTables>>,
}

pub fn validate_display_name(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let count = trimmed.chars().count();
    if count == 0 || count > DISPLAY_NAME_MAX_CHARS || trimmed.chars().any(char::is_control) {
        return Err(AuthError::invalid_request(format!(
            "invalid display name: {:?}",
            raw
        )));
    }
    Ok(trimmed.to_string())
}

impl UserStore {
    pub fn new(ids: Arc<dyn IdGenerator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ids,
            clock,
            tables: Arc::new(RwLock::new(UserTables::default())),
        }
    }

    pub async fn create(&self, new: NewUser) -> Result<User> {
        let display_name = validate_display_name(&new.display_name)?;
        let user = User {
            id: UserId::from(self.ids.next()),
            display_name,
            username: new.username,
            password_hash: new.password_hash,
            created_at: self.clock.now(),
            links: Links::default(),
        };

        let mut tables = self.tables.write().await;
        if let Some(username) = &user.username {
            if tables.by_username.contains_key(username) {
                return Err(AuthError::invalid_request(format!(
                    "username already taken: {}",
                    username
                )));
            }
            tables.by_username.insert(username.clone(), user.id);
        }
        tables.users.insert(user.id, user.clone());
        tracing::info!("created user {}", user.id);
        Ok(user)
    }

    pub async fn get(&self, id: UserId) -> Option<User> {
        self.tables.read().await.users.get(&id).cloned()
    }

    pub async fn exists(&self, id: UserId) -> bool {
        self.tables.read().await.users.contains_key(&id)
    }

    pub async fn get_by_username(&self, username: &str) -> Option<User> {
        let tables = self.tables.read().await;
        tables
            .by_username
            .get(username)
            .and_then(|id| tables.users.get(id))
            .cloned()
    }

    pub async fn find_by_external(&self, external: &ExternalRef) -> Option<UserId> {
        self.tables.read().await.by_external.get(external).copied()
    }

    /// Check-and-write of one link slot
    pub async fn link(&self, user_id: UserId, external: ExternalRef) -> Result<LinkOutcome> {
        let mut tables = self.tables.write().await;
        let tables = &mut *tables;

        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| AuthError::not_found(format!("user {}", user_id)))?;

        match tables.by_external.get(&external) {
            Some(owner) if *owner == user_id => return Ok(LinkOutcome::AlreadyLinked),
            Some(_) => {
                return Err(AuthError::LinkConflict {
                    provider: external.provider,
                    external_id: external.external_id,
                    kind: LinkConflictKind::ExternalAlreadyLinked,
                });
            }
            None => {}
        }

        if user.links.get(external.provider).is_some() {
            return Err(AuthError::LinkConflict {
                provider: external.provider,
                external_id: external.external_id,
                kind: LinkConflictKind::UserAlreadyLinked,
            });
        }

        user.links
            .replace(external.provider, Some(external.clone()));
        tables.by_external.insert(external, user_id);
        Ok(LinkOutcome::Created)
    }

    /// Clears a slot; returns what was linked, if anything
    pub async fn unlink(&self, user_id: UserId, provider: Provider) -> Result<Option<ExternalRef>> {
        let mut tables = self.tables.write().await;
        let tables = &mut *tables;

        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| AuthError::not_found(format!("user {}", user_id)))?;
        let removed = user.links.replace(provider, None);
        if let Some(external) = &removed {
            tables.by_external.remove(external);
        }
        Ok(removed)
    }

    /// Removes the user and frees every external account it held
    pub async fn delete(&self, user_id: UserId) -> Result<User> {
        let mut tables = self.tables.write().await;
        let user = tables
            .users
            .remove(&user_id)
            .ok_or_else(|| AuthError::not_found(format!("user {}", user_id)))?;
        if let Some(username) = &user.username {
            tables.by_username.remove(username);
        }
        for external in user.links.iter() {
            tables.by_external.remove(external);
        }
        tracing::info!("deleted user {}", user_id);
        Ok(user)
    }
}
