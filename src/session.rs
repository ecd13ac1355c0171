use crate::clock::{Clock, add_ttl};
use crate::error::{AuthError, Result};
use crate::id::IdGenerator;
use crate::types::{Session, SessionId, UserId};
use crate::user::UserStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Login sessions. Each session is its own row, nothing coordinates across them.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
    users: UserStore,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(
        users: UserStore,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            users,
            ids,
            clock,
            ttl,
        }
    }

    pub async fn create_session(&self, user_id: UserId) -> Result<Session> {
        if !self.users.exists(user_id).await {
            return Err(AuthError::not_found(format!("user {}", user_id)));
        }
        let now = self.clock.now();
        let session = Session {
            id: SessionId::from(self.ids.next()),
            user_id,
            created_at: now,
            expires_at: add_ttl(now, self.ttl),
            revoked_at: None,
        };
        self.insert_live(session).await
    }

    /// Stores the session, then re-checks the user. A delete that ran its
    /// `revoke_all_for_user` before the insert is caught by the second check.
    async fn insert_live(&self, session: Session) -> Result<Session> {
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        if !self.users.exists(session.user_id).await {
            self.revoke(session.id).await;
            tracing::warn!("user {} was deleted while logging in", session.user_id);
            return Err(AuthError::not_found(format!("user {}", session.user_id)));
        }
        tracing::info!("issued session for user {}", session.user_id);
        Ok(session)
    }

    /// The session if it exists, is not revoked and has not expired
    pub async fn get_active(&self, id: SessionId) -> Option<Session> {
        let now = self.clock.now();
        self.sessions
            .read()
            .await
            .get(&id)
            .filter(|s| s.is_active_at(now))
            .cloned()
    }

    /// Idempotent; unknown ids are fine
    pub async fn revoke(&self, id: SessionId) {
        let now = self.clock.now();
        if let Some(session) = self.sessions.write().await.get_mut(&id)
            && session.revoked_at.is_none()
        {
            session.revoked_at = Some(now);
            tracing::info!("revoked session for user {}", session.user_id);
        }
    }

    pub async fn revoke_all_for_user(&self, user_id: UserId) -> usize {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        let mut revoked = 0;
        for session in sessions.values_mut() {
            if session.user_id == user_id && session.revoked_at.is_none() {
                session.revoked_at = Some(now);
                revoked += 1;
            }
        }
        if revoked > 0 {
            tracing::info!("revoked {} sessions of user {}", revoked, user_id);
        }
        revoked
    }

    pub async fn list_for_user(&self, user_id: UserId) -> Vec<Session> {
        let now = self.clock.now();
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id && s.is_active_at(now))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// drops expired and revoked rows
    pub async fn cleanup_expired(&self) {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.is_active_at(now));
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!("cleaned up {} dead sessions", removed);
        }
    }
}
