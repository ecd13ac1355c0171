use crate::clock::Clock;
use crate::error::{AuthError, Result};
use crate::external::{ExternalAccounts, ExternalClients, bounded};
use crate::types::{
    AuthContext, ExternalCredentials, ExternalId, ExternalProfile, ExternalRef, LinkMethod,
    LinkMethodKind, Permission, Provider, ShortExternalUser, UserId,
};
use crate::user::{LinkOutcome, UserStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// A link joined with the cached profile of the external account
#[derive(Debug, Clone, Serialize)]
pub struct LinkedAccount {
    #[serde(flatten)]
    pub link: ExternalRef,
    pub user: Option<ShortExternalUser>,
}

/// Owns the link/unlink transitions between users and external accounts.
///
/// Provider calls happen first; the uniqueness check and the write then run
/// as one step in [`UserStore::link`], so a failed link leaves nothing behind.
#[derive(Clone)]
pub struct LinkManager {
    users: UserStore,
    accounts: ExternalAccounts,
    clients: ExternalClients,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl LinkManager {
    pub fn new(
        users: UserStore,
        accounts: ExternalAccounts,
        clients: ExternalClients,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            users,
            accounts,
            clients,
            clock,
            timeout,
        }
    }

    /// Links an account to the acting user
    pub async fn link(
        &self,
        acx: &AuthContext,
        provider: Provider,
        method: LinkMethod,
    ) -> Result<ExternalRef> {
        let user_id = acx.require_user(Permission::ManageLinks)?;
        self.link_for(acx, user_id, provider, method).await
    }

    /// Links an account to `user_id`. Users may only link themselves and must
    /// prove ownership; trusted refs are reserved to the system.
    pub async fn link_for(
        &self,
        acx: &AuthContext,
        user_id: UserId,
        provider: Provider,
        method: LinkMethod,
    ) -> Result<ExternalRef> {
        acx.require_self_or_system(user_id, Permission::ManageLinks)?;
        if method.kind() == LinkMethodKind::Ref && !matches!(acx, AuthContext::System { .. }) {
            tracing::warn!("user {} attempted a trusted ref link on {}", user_id, provider);
            return Err(AuthError::Unauthorized);
        }
        if !provider.supports(method.kind()) {
            return Err(AuthError::invalid_request(format!(
                "{:?} linking is not available for provider {}",
                method.kind(),
                provider
            )));
        }

        let external_id = self.resolve_method(provider, method).await?;
        self.commit(
            user_id,
            ExternalRef {
                provider,
                external_id,
            },
        )
        .await
    }

    /// Links an identity already verified upstream (oauth consumer)
    pub(crate) async fn link_verified(
        &self,
        user_id: UserId,
        provider: Provider,
        profile: &ExternalProfile,
    ) -> Result<ExternalRef> {
        let short = self.touch(provider, profile).await?;
        self.commit(
            user_id,
            ExternalRef {
                provider,
                external_id: short.id,
            },
        )
        .await
    }

    async fn resolve_method(&self, provider: Provider, method: LinkMethod) -> Result<ExternalId> {
        let client = self.clients.get(provider);
        match method {
            LinkMethod::Credentials { login, password } => {
                let credentials = ExternalCredentials { login, password };
                let session = bounded(
                    &format!("{} create_session", provider),
                    self.timeout,
                    client.create_session(&credentials),
                )
                .await
                .inspect_err(|e| {
                    if matches!(e, AuthError::InvalidCredentials) {
                        tracing::warn!(
                            "{} rejected credentials for login {}",
                            provider,
                            credentials.login
                        );
                    }
                })?;
                Ok(self.touch(provider, &session.user).await?.id)
            }
            LinkMethod::SessionKey { key } => {
                let session = bounded(
                    &format!("{} test_session", provider),
                    self.timeout,
                    client.test_session(&key),
                )
                .await?
                .ok_or_else(|| {
                    tracing::warn!("{} session key is unknown or expired", provider);
                    AuthError::InvalidCredentials
                })?;
                Ok(self.touch(provider, &session.user).await?.id)
            }
            LinkMethod::Ref { external_id } => {
                let external_id = ExternalId::parse(provider, &external_id)?;
                // the id is trusted as given; the profile cache is best effort
                match self.refresh(provider, &external_id).await {
                    Ok(Some(_)) => {}
                    Ok(None) => tracing::debug!(
                        "{} has no profile for {}, linking without cache",
                        provider,
                        external_id
                    ),
                    Err(e) => tracing::warn!(
                        "could not refresh {}:{} before linking: {}",
                        provider,
                        external_id,
                        e
                    ),
                }
                Ok(external_id)
            }
        }
    }

    /// Re-fetches the short user from the provider and touches the cache.
    /// `None` when the provider does not know the account.
    pub async fn refresh(
        &self,
        provider: Provider,
        external_id: &ExternalId,
    ) -> Result<Option<ShortExternalUser>> {
        let profile = bounded(
            &format!("{} get_short_user_by_id", provider),
            self.timeout,
            self.clients.get(provider).get_short_user_by_id(external_id),
        )
        .await?;
        match profile {
            Some(profile) => Ok(Some(self.touch(provider, &profile).await?)),
            None => Ok(None),
        }
    }

    async fn touch(
        &self,
        provider: Provider,
        profile: &ExternalProfile,
    ) -> Result<ShortExternalUser> {
        self.accounts
            .for_provider(provider)
            .touch(profile, self.clock.now())
            .await
    }

    async fn commit(&self, user_id: UserId, external: ExternalRef) -> Result<ExternalRef> {
        match self.users.link(user_id, external.clone()).await {
            Ok(LinkOutcome::Created) => {
                tracing::info!(
                    "linked user {} to {}:{}",
                    user_id,
                    external.provider,
                    external.external_id
                );
                Ok(external)
            }
            Ok(LinkOutcome::AlreadyLinked) => {
                tracing::debug!(
                    "user {} already linked to {}:{}",
                    user_id,
                    external.provider,
                    external.external_id
                );
                Ok(external)
            }
            Err(e) => {
                if let AuthError::LinkConflict { kind, .. } = &e {
                    tracing::warn!(
                        "link conflict for user {} on {}:{} ({:?})",
                        user_id,
                        external.provider,
                        external.external_id,
                        kind
                    );
                }
                Err(e)
            }
        }
    }

    pub async fn unlink(&self, acx: &AuthContext, provider: Provider) -> Result<()> {
        let user_id = acx.require_user(Permission::ManageLinks)?;
        self.unlink_for(acx, user_id, provider).await
    }

    /// Unlinking an empty slot is a no-op
    pub async fn unlink_for(
        &self,
        acx: &AuthContext,
        user_id: UserId,
        provider: Provider,
    ) -> Result<()> {
        acx.require_self_or_system(user_id, Permission::ManageLinks)?;
        if let Some(external) = self.users.unlink(user_id, provider).await? {
            tracing::info!(
                "unlinked user {} from {}:{}",
                user_id,
                provider,
                external.external_id
            );
        }
        Ok(())
    }

    pub async fn linked_accounts(
        &self,
        acx: &AuthContext,
        user_id: UserId,
    ) -> Result<Vec<LinkedAccount>> {
        acx.require_self_or_system(user_id, Permission::ReadSelf)?;
        let user = self
            .users
            .get(user_id)
            .await
            .ok_or_else(|| AuthError::not_found(format!("user {}", user_id)))?;

        let mut linked = Vec::new();
        for link in user.links.iter() {
            let cached = self
                .accounts
                .for_provider(link.provider)
                .get(&link.external_id)
                .await;
            linked.push(LinkedAccount {
                link: link.clone(),
                user: cached,
            });
        }
        Ok(linked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::LinkConflictKind;
    use crate::external::MemExternalClient;
    use crate::id::SequentialIdGenerator;
    use crate::types::AuthScope;
    use crate::user::NewUser;

    struct Fixture {
        links: LinkManager,
        users: UserStore,
        a: Arc<MemExternalClient>,
        b: Arc<MemExternalClient>,
    }

    async fn fixture() -> Fixture {
        let users = UserStore::new(Arc::new(SequentialIdGenerator::new()), Arc::new(SystemClock));
        let a = Arc::new(MemExternalClient::new(Provider::A));
        let b = Arc::new(MemExternalClient::new(Provider::B));
        let c = Arc::new(MemExternalClient::new(Provider::C));
        a.create_user("42", "alice", "pw1").await;
        b.create_user("7", "alice_b", "pw2").await;
        let links = LinkManager::new(
            users.clone(),
            ExternalAccounts::new(),
            ExternalClients::new(a.clone(), b.clone(), c),
            Arc::new(SystemClock),
            Duration::from_millis(200),
        );
        Fixture { links, users, a, b }
    }

    async fn user(users: &UserStore, name: &str) -> UserId {
        users
            .create(NewUser {
                display_name: name.to_string(),
                username: None,
                password_hash: None,
            })
            .await
            .unwrap()
            .id
    }

    fn credentials(login: &str, password: &str) -> LinkMethod {
        LinkMethod::Credentials {
            login: login.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn test_link_by_credentials_caches_profile() {
        let f = fixture().await;
        let alice = user(&f.users, "Alice").await;
        let acx = AuthContext::user(alice);

        let linked = f
            .links
            .link(&acx, Provider::A, credentials("alice", "pw1"))
            .await
            .unwrap();
        assert_eq!(linked.external_id.as_str(), "42");

        let accounts = f.links.linked_accounts(&acx, alice).await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].user.as_ref().unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_rejected_credentials_leave_links_untouched() {
        let f = fixture().await;
        let alice = user(&f.users, "Alice").await;
        let result = f
            .links
            .link(&AuthContext::user(alice), Provider::A, credentials("alice", "nope"))
            .await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
        assert!(f.users.get(alice).await.unwrap().links.a.is_none());
    }

    #[tokio::test]
    async fn test_session_key_only_on_provider_b() {
        let f = fixture().await;
        let alice = user(&f.users, "Alice").await;
        let acx = AuthContext::user(alice);
        let key = f.b.create_session_key("7").await.unwrap();

        let linked = f
            .links
            .link(&acx, Provider::B, LinkMethod::SessionKey { key: key.clone() })
            .await
            .unwrap();
        assert_eq!(linked.external_id.as_str(), "7");

        assert!(matches!(
            f.links
                .link(&acx, Provider::A, LinkMethod::SessionKey { key })
                .await,
            Err(AuthError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.links
                .link(
                    &acx,
                    Provider::B,
                    LinkMethod::SessionKey {
                        key: "dead".to_string()
                    }
                )
                .await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_refs_are_system_only() {
        let f = fixture().await;
        let alice = user(&f.users, "Alice").await;
        let by_ref = || LinkMethod::Ref {
            external_id: "99".to_string(),
        };

        assert!(matches!(
            f.links
                .link(&AuthContext::user(alice), Provider::A, by_ref())
                .await,
            Err(AuthError::Unauthorized)
        ));
        let linked = f
            .links
            .link_for(&AuthContext::system(), alice, Provider::A, by_ref())
            .await
            .unwrap();
        assert_eq!(linked.external_id.as_str(), "99");

        assert!(matches!(
            f.links
                .link_for(
                    &AuthContext::system(),
                    alice,
                    Provider::B,
                    LinkMethod::Ref {
                        external_id: "0123".to_string()
                    }
                )
                .await,
            Err(AuthError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_ref_link_fills_the_profile_cache() {
        let f = fixture().await;
        let alice = user(&f.users, "Alice").await;
        let system = AuthContext::system();

        f.links
            .link_for(
                &system,
                alice,
                Provider::A,
                LinkMethod::Ref {
                    external_id: "42".to_string(),
                },
            )
            .await
            .unwrap();
        let accounts = f.links.linked_accounts(&system, alice).await.unwrap();
        assert_eq!(accounts[0].user.as_ref().unwrap().username, "alice");

        // unknown on the provider, or the provider is down: still linked, no profile
        f.links
            .link_for(
                &system,
                alice,
                Provider::B,
                LinkMethod::Ref {
                    external_id: "31337".to_string(),
                },
            )
            .await
            .unwrap();
        let bob = user(&f.users, "Bob").await;
        f.a.set_offline(true);
        assert!(matches!(
            f.links
                .refresh(Provider::A, &ExternalId::parse(Provider::A, "42").unwrap())
                .await,
            Err(AuthError::ExternalUnavailable(_))
        ));
        f.links
            .link_for(
                &system,
                bob,
                Provider::A,
                LinkMethod::Ref {
                    external_id: "43".to_string(),
                },
            )
            .await
            .unwrap();

        let accounts = f.links.linked_accounts(&system, alice).await.unwrap();
        let b = accounts.iter().find(|a| a.link.provider == Provider::B).unwrap();
        assert!(b.user.is_none());
        let accounts = f.links.linked_accounts(&system, bob).await.unwrap();
        assert!(accounts[0].user.is_none());
    }

    #[tokio::test]
    async fn test_refresh_updates_the_cached_username() {
        let f = fixture().await;
        let id = ExternalId::parse(Provider::A, "42").unwrap();
        assert_eq!(
            f.links.refresh(Provider::A, &id).await.unwrap().unwrap().username,
            "alice"
        );
        f.a.create_user("42", "alice_renamed", "pw1").await;
        assert_eq!(
            f.links.refresh(Provider::A, &id).await.unwrap().unwrap().username,
            "alice_renamed"
        );
        assert!(
            f.links
                .refresh(Provider::A, &ExternalId::parse(Provider::A, "7").unwrap())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_users_cannot_link_others_and_base_scope_cannot_link() {
        let f = fixture().await;
        let alice = user(&f.users, "Alice").await;
        let bob = user(&f.users, "Bob").await;

        assert!(matches!(
            f.links
                .link_for(
                    &AuthContext::user(alice),
                    bob,
                    Provider::A,
                    credentials("alice", "pw1")
                )
                .await,
            Err(AuthError::Unauthorized)
        ));

        let narrow = AuthContext::User {
            user_id: alice,
            scope: AuthScope::Base,
        };
        assert!(matches!(
            f.links
                .link(&narrow, Provider::A, credentials("alice", "pw1"))
                .await,
            Err(AuthError::Unauthorized)
        ));
        assert!(matches!(
            f.links.unlink(&AuthContext::guest(), Provider::A).await,
            Err(AuthError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_relink_is_idempotent_and_conflicts_are_reported() {
        let f = fixture().await;
        let alice = user(&f.users, "Alice").await;
        let bob = user(&f.users, "Bob").await;

        let first = f
            .links
            .link(&AuthContext::user(alice), Provider::A, credentials("alice", "pw1"))
            .await
            .unwrap();
        let second = f
            .links
            .link(&AuthContext::user(alice), Provider::A, credentials("alice", "pw1"))
            .await
            .unwrap();
        assert_eq!(first, second);

        let conflict = f
            .links
            .link(&AuthContext::user(bob), Provider::A, credentials("alice", "pw1"))
            .await;
        assert!(matches!(
            conflict,
            Err(AuthError::LinkConflict {
                kind: LinkConflictKind::ExternalAlreadyLinked,
                ..
            })
        ));
        assert!(f.users.get(bob).await.unwrap().links.a.is_none());
    }

    #[tokio::test]
    async fn test_unlink_of_empty_slot_is_noop() {
        let f = fixture().await;
        let alice = user(&f.users, "Alice").await;
        let acx = AuthContext::user(alice);
        f.links.unlink(&acx, Provider::C).await.unwrap();
        assert_eq!(f.users.get(alice).await.unwrap().links, Default::default());
    }

    #[tokio::test]
    async fn test_provider_outage_and_timeout_surface_as_unavailable() {
        let f = fixture().await;
        let alice = user(&f.users, "Alice").await;
        let acx = AuthContext::user(alice);

        f.a.set_offline(true);
        assert!(matches!(
            f.links
                .link(&acx, Provider::A, credentials("alice", "pw1"))
                .await,
            Err(AuthError::ExternalUnavailable(_))
        ));

        f.a.set_offline(false);
        f.a.set_latency(Some(Duration::from_secs(5))).await;
        assert!(matches!(
            f.links
                .link(&acx, Provider::A, credentials("alice", "pw1"))
                .await,
            Err(AuthError::ExternalUnavailable(_))
        ));
        assert!(f.users.get(alice).await.unwrap().links.a.is_none());
    }
}
