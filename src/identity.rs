use crate::error::{AuthError, Result};
use crate::external::bounded;
use crate::oauth::AccessTokenStore;
use crate::password::PasswordService;
use crate::session::SessionStore;
use crate::types::{AuthContext, Permission, Session, SessionId, User, UserId, validate_username};
use crate::user::{NewUser, UserStore};
use std::sync::Arc;
use std::time::Duration;

const MIN_PASSWORD_CHARS: usize = 8;
const MAX_PASSWORD_CHARS: usize = 256;

fn validate_password(password: &str) -> Result<()> {
    let count = password.chars().count();
    if !(MIN_PASSWORD_CHARS..=MAX_PASSWORD_CHARS).contains(&count) {
        return Err(AuthError::invalid_request(format!(
            "password must be {} to {} characters",
            MIN_PASSWORD_CHARS, MAX_PASSWORD_CHARS
        )));
    }
    Ok(())
}

/// Local accounts: registration, password login, logout, deletion
#[derive(Clone)]
pub struct IdentityService {
    users: UserStore,
    sessions: SessionStore,
    tokens: AccessTokenStore,
    passwords: Arc<dyn PasswordService>,
    timeout: Duration,
}

impl IdentityService {
    pub fn new(
        users: UserStore,
        sessions: SessionStore,
        tokens: AccessTokenStore,
        passwords: Arc<dyn PasswordService>,
        timeout: Duration,
    ) -> Self {
        Self {
            users,
            sessions,
            tokens,
            passwords,
            timeout,
        }
    }

    /// Creates a user and logs it in
    pub async fn register(
        &self,
        display_name: &str,
        username: &str,
        password: &str,
    ) -> Result<(User, Session)> {
        let username = validate_username(username)?;
        validate_password(password)?;
        if self.users.get_by_username(&username).await.is_some() {
            return Err(AuthError::invalid_request(format!(
                "username already taken: {}",
                username
            )));
        }

        let password_hash = bounded(
            "password hashing",
            self.timeout,
            self.passwords.hash(password),
        )
        .await?;
        // the store re-checks the username under its own guard
        let user = self
            .users
            .create(NewUser {
                display_name: display_name.to_string(),
                username: Some(username),
                password_hash: Some(password_hash),
            })
            .await?;
        let session = self.sessions.create_session(user.id).await?;
        Ok((user, session))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
        let Some(user) = self.users.get_by_username(username).await else {
            tracing::warn!("login attempt for unknown username");
            return Err(AuthError::InvalidCredentials);
        };
        let Some(hash) = &user.password_hash else {
            // linked-only accounts have no password
            return Err(AuthError::InvalidCredentials);
        };
        let matches = bounded(
            "password verification",
            self.timeout,
            self.passwords.verify(password, hash),
        )
        .await?;
        if !matches {
            tracing::warn!("wrong password for user {}", user.id);
            return Err(AuthError::InvalidCredentials);
        }
        self.sessions.create_session(user.id).await
    }

    pub async fn logout(&self, session_id: SessionId) {
        self.sessions.revoke(session_id).await;
    }

    pub async fn get_user(&self, acx: &AuthContext, user_id: UserId) -> Result<User> {
        acx.require_self_or_system(user_id, Permission::ReadSelf)?;
        self.users
            .get(user_id)
            .await
            .ok_or_else(|| AuthError::not_found(format!("user {}", user_id)))
    }

    /// Removes the user, revokes its sessions and tokens, frees its links
    pub async fn delete_user(&self, acx: &AuthContext, user_id: UserId) -> Result<User> {
        acx.require_self_or_system(user_id, Permission::Administrate)?;
        let user = self.users.delete(user_id).await?;
        let sessions = self.sessions.revoke_all_for_user(user_id).await;
        let tokens = self.tokens.revoke_all_for_user(user_id).await;
        tracing::info!(
            "deleted user {} ({} sessions, {} tokens revoked)",
            user_id,
            sessions,
            tokens
        );
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::id::{IdGenerator, SequentialIdGenerator};
    use crate::password::Argon2PasswordService;
    use crate::types::{AuthScope, OauthClientId};
    use uuid::Uuid;

    fn service() -> (IdentityService, SessionStore, AccessTokenStore) {
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::new());
        let clock = Arc::new(VirtualClock::default());
        let users = UserStore::new(ids.clone(), clock.clone());
        let sessions = SessionStore::new(
            users.clone(),
            ids.clone(),
            clock.clone(),
            Duration::from_secs(3600),
        );
        let tokens = AccessTokenStore::new(ids, clock, None);
        let identity = IdentityService::new(
            users,
            sessions.clone(),
            tokens.clone(),
            Arc::new(Argon2PasswordService::with_cost(8, 1, 1).unwrap()),
            Duration::from_secs(5),
        );
        (identity, sessions, tokens)
    }

    #[tokio::test]
    async fn test_register_login_logout() {
        let (identity, sessions, _) = service();
        let (user, first) = identity
            .register("Alice", "alice", "correct horse")
            .await
            .unwrap();
        assert_eq!(first.user_id, user.id);

        let second = identity.login("alice", "correct horse").await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(matches!(
            identity.login("alice", "wrong password").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            identity.login("nobody", "correct horse").await,
            Err(AuthError::InvalidCredentials)
        ));

        identity.logout(second.id).await;
        assert!(sessions.get_active(second.id).await.is_none());
        assert!(sessions.get_active(first.id).await.is_some());
    }

    #[tokio::test]
    async fn test_register_validation() {
        let (identity, _, _) = service();
        assert!(matches!(
            identity.register("Alice", "alice", "short").await,
            Err(AuthError::InvalidRequest(_))
        ));
        assert!(matches!(
            identity.register("Alice", "", "long enough").await,
            Err(AuthError::InvalidRequest(_))
        ));
        identity.register("Alice", "alice", "long enough").await.unwrap();
        assert!(matches!(
            identity.register("Other", "alice", "long enough").await,
            Err(AuthError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_revokes_sessions_and_tokens() {
        let (identity, sessions, tokens) = service();
        let (alice, session) = identity
            .register("Alice", "alice", "long enough")
            .await
            .unwrap();
        let (bob, _) = identity.register("Bob", "bob", "long enough").await.unwrap();
        let token = tokens
            .issue(OauthClientId::from(Uuid::from_u128(1)), alice.id, AuthScope::Base)
            .await;

        assert!(matches!(
            identity.delete_user(&AuthContext::user(bob.id), alice.id).await,
            Err(AuthError::Unauthorized)
        ));

        identity
            .delete_user(&AuthContext::user(alice.id), alice.id)
            .await
            .unwrap();
        assert!(sessions.get_active(session.id).await.is_none());
        assert!(tokens.get_active(token.key).await.is_none());
        assert!(matches!(
            identity.get_user(&AuthContext::system(), alice.id).await,
            Err(AuthError::NotFound(_))
        ));
        // the username is free again
        identity.register("Alice", "alice", "long enough").await.unwrap();
    }
}
