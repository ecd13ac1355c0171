use crate::types::{ExternalId, Provider};
use thiserror::Error;

/// Which side of the link table already holds the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkConflictKind {
    /// the external account is linked to a different user
    ExternalAlreadyLinked,
    /// the user already holds a different account on this provider
    UserAlreadyLinked,
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Link conflict on {provider}:{external_id} ({kind:?})")]
    LinkConflict {
        provider: Provider,
        external_id: ExternalId,
        kind: LinkConflictKind,
    },

    #[error("No user is linked to this {0} account")]
    NotLinked(Provider),

    #[error("External service unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("Invalid or already consumed state")]
    InvalidState,

    #[error("State expired")]
    ExpiredState,

    #[error("Invalid client: {0}")]
    InvalidClient(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
