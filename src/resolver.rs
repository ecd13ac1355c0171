use crate::oauth::AccessTokenStore;
use crate::session::SessionStore;
use crate::types::{AccessTokenKey, AuthContext, AuthScope, SessionId};
use crate::user::UserStore;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// What a request presented, before anything is checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    None,
    /// the `sid` cookie
    SessionId(String),
    /// `Authorization: Bearer ...`, a session id, an oauth access token or the system key
    Bearer(String),
}

/// Turns a credential into an [`AuthContext`]. Never fails: anything that
/// does not check out is a guest.
#[derive(Clone)]
pub struct AuthResolver {
    sessions: SessionStore,
    users: UserStore,
    tokens: AccessTokenStore,
    system_key: Option<Arc<str>>,
}

impl AuthResolver {
    pub fn new(
        sessions: SessionStore,
        users: UserStore,
        tokens: AccessTokenStore,
        system_key: Option<String>,
    ) -> Self {
        Self {
            sessions,
            users,
            tokens,
            system_key: system_key.filter(|k| !k.is_empty()).map(Arc::from),
        }
    }

    pub async fn resolve(&self, credential: &Credential) -> AuthContext {
        match credential {
            Credential::None => AuthContext::guest(),
            Credential::SessionId(raw) => self.resolve_session(raw).await,
            Credential::Bearer(raw) => {
                if self.is_system_key(raw) {
                    return AuthContext::system();
                }
                let by_session = self.resolve_session(raw).await;
                if !by_session.is_guest() {
                    return by_session;
                }
                self.resolve_access_token(raw).await
            }
        }
    }

    fn is_system_key(&self, raw: &str) -> bool {
        self.system_key
            .as_deref()
            .is_some_and(|key| raw.as_bytes().ct_eq(key.as_bytes()).into())
    }

    async fn resolve_session(&self, raw: &str) -> AuthContext {
        let Ok(id) = raw.parse::<SessionId>() else {
            return AuthContext::guest();
        };
        match self.sessions.get_active(id).await {
            Some(session) if self.users.exists(session.user_id).await => {
                AuthContext::User {
                    user_id: session.user_id,
                    scope: AuthScope::Default,
                }
            }
            _ => AuthContext::guest(),
        }
    }

    async fn resolve_access_token(&self, raw: &str) -> AuthContext {
        let Ok(key) = raw.parse::<AccessTokenKey>() else {
            return AuthContext::guest();
        };
        match self.tokens.get_active(key).await {
            Some(token) if self.users.exists(token.user_id).await => AuthContext::User {
                user_id: token.user_id,
                scope: token.scope,
            },
            _ => AuthContext::guest(),
        }
    }
}
