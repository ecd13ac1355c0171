use crate::clock::Clock;
use crate::config::{CoreConfig, SystemClientConfig};
use crate::error::Result;
use crate::external::{ExternalAccounts, ExternalClients};
use crate::id::IdGenerator;
use crate::identity::IdentityService;
use crate::link::LinkManager;
use crate::oauth::{
    AccessTokenStore, ClientRegistry, OauthConsumer, OauthConsumerParts, OauthProvider,
    UpstreamOauthClient,
};
use crate::password::PasswordService;
use crate::resolver::AuthResolver;
use crate::session::SessionStore;
use crate::user::UserStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Collaborators injected from outside the core
pub struct Dependencies {
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub passwords: Arc<dyn PasswordService>,
    pub external: ExternalClients,
    pub upstream: Arc<dyn UpstreamOauthClient>,
}

/// Every component, wired once with process lifetime. Cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub users: UserStore,
    pub accounts: ExternalAccounts,
    pub links: LinkManager,
    pub sessions: SessionStore,
    pub identity: IdentityService,
    pub resolver: AuthResolver,
    pub oauth: OauthProvider,
    pub upstream: OauthConsumer,
}

impl Services {
    pub fn new(config: &CoreConfig, deps: Dependencies) -> Self {
        let Dependencies {
            ids,
            clock,
            passwords,
            external,
            upstream,
        } = deps;

        let users = UserStore::new(ids.clone(), clock.clone());
        let accounts = ExternalAccounts::new();
        let sessions = SessionStore::new(
            users.clone(),
            ids.clone(),
            clock.clone(),
            config.session_ttl,
        );
        let tokens = AccessTokenStore::new(ids.clone(), clock.clone(), config.access_token_ttl);
        let links = LinkManager::new(
            users.clone(),
            accounts.clone(),
            external,
            clock.clone(),
            config.external_timeout,
        );
        let identity = IdentityService::new(
            users.clone(),
            sessions.clone(),
            tokens.clone(),
            passwords.clone(),
            config.external_timeout,
        );
        let resolver = AuthResolver::new(
            sessions.clone(),
            users.clone(),
            tokens.clone(),
            config.system_key.clone(),
        );
        let clients = ClientRegistry::new(
            passwords,
            ids.clone(),
            clock.clone(),
            config.external_timeout,
        );
        let oauth = OauthProvider::new(
            clients,
            tokens,
            ids.clone(),
            clock.clone(),
            config.code_ttl,
            config.max_pending_authorizations,
        );
        let consumer = OauthConsumer::new(OauthConsumerParts {
            upstream,
            links: links.clone(),
            users: users.clone(),
            sessions: sessions.clone(),
            accounts: accounts.clone(),
            ids,
            clock,
            client_id: config.upstream_client_id.clone(),
            redirect_uri: config.upstream_redirect_uri.clone(),
            state_ttl: config.state_ttl,
            max_pending: config.max_pending_authorizations,
            timeout: config.external_timeout,
        });

        Self {
            users,
            accounts,
            links,
            sessions,
            identity,
            resolver,
            oauth,
            upstream: consumer,
        }
    }

    pub async fn install_system_clients(&self, clients: &[SystemClientConfig]) -> Result<()> {
        for client in clients {
            let installed = self
                .oauth
                .clients()
                .upsert_system_client(client.to_new_client(), &client.secret)
                .await?;
            tracing::info!("system oauth client '{}' is {}", client.key, installed.id);
        }
        Ok(())
    }

    /// Purges everything past its ttl
    pub async fn sweep(&self) {
        self.sessions.cleanup_expired().await;
        self.oauth.cleanup_expired().await;
        self.upstream.states().cleanup_expired().await;
    }

    pub fn spawn_sweeper(&self, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let services = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => services.sweep().await,
                }
            }
        })
    }
}
