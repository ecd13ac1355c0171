mod mem;
mod store;

pub use mem::MemExternalClient;
pub use store::{ExternalAccountStore, ExternalAccounts};

use crate::error::{AuthError, Result};
use crate::types::{ExternalCredentials, ExternalId, ExternalProfile, ExternalSession, Provider};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Narrow view of a provider's client. Transport failures come back as
/// `ExternalUnavailable`, rejected credentials as `InvalidCredentials`.
#[async_trait]
pub trait ExternalClient: Send + Sync {
    async fn create_session(&self, credentials: &ExternalCredentials) -> Result<ExternalSession>;

    /// Checks a session key the user already holds on the provider
    async fn test_session(&self, _key: &str) -> Result<Option<ExternalSession>> {
        Ok(None)
    }

    async fn get_short_user_by_id(&self, id: &ExternalId) -> Result<Option<ExternalProfile>>;
}

/// One client per provider
#[derive(Clone)]
pub struct ExternalClients {
    a: Arc<dyn ExternalClient>,
    b: Arc<dyn ExternalClient>,
    c: Arc<dyn ExternalClient>,
}

impl ExternalClients {
    pub fn new(
        a: Arc<dyn ExternalClient>,
        b: Arc<dyn ExternalClient>,
        c: Arc<dyn ExternalClient>,
    ) -> Self {
        Self { a, b, c }
    }

    pub fn get(&self, provider: Provider) -> &Arc<dyn ExternalClient> {
        match provider {
            Provider::A => &self.a,
            Provider::B => &self.b,
            Provider::C => &self.c,
        }
    }
}

/// Runs a collaborator call with a deadline. Never retries.
pub(crate) async fn bounded<T, F>(what: &str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("{} timed out after {:?}", what, limit);
            Err(AuthError::ExternalUnavailable(format!(
                "{} timed out after {:?}",
                what, limit
            )))
        }
    }
}
