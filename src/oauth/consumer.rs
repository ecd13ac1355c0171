use super::upstream::UpstreamOauthClient;
use crate::clock::{Clock, is_expired};
use crate::error::{AuthError, Result};
use crate::external::{ExternalAccounts, bounded};
use crate::id::IdGenerator;
use crate::link::LinkManager;
use crate::session::SessionStore;
use crate::types::{
    AuthContext, ExternalRef, OauthActionType, OauthFlowStatus, OauthState, OauthStateId,
    Permission, Provider, Session, UserId,
};
use crate::user::UserStore;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use url::Url;

#[derive(Default)]
struct StateTable {
    states: HashMap<OauthStateId, OauthState>,
    /// insertion order, oldest first, for eviction at capacity
    order: VecDeque<OauthStateId>,
}

/// In-flight upstream flows keyed by nonce, at most `capacity` of them
#[derive(Clone)]
pub struct OauthStateStore {
    table: Arc<RwLock<StateTable>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    capacity: usize,
}

/// Hash of the per-browser secret; only the hash is stored
fn binding_hash(binding: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(binding.as_bytes()))
}

fn is_bound(state: &OauthState, binding: Option<&str>) -> bool {
    binding
        .map(binding_hash)
        .is_some_and(|hash| hash.as_bytes().ct_eq(state.binding_hash.as_bytes()).into())
}

fn new_binding() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl OauthStateStore {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration, capacity: usize) -> Self {
        Self {
            table: Arc::new(RwLock::new(StateTable::default())),
            clock,
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn insert(&self, state: OauthState) {
        let mut table = self.table.write().await;
        while table.states.len() >= self.capacity {
            let Some(oldest) = table.order.pop_front() else {
                break;
            };
            if table.states.remove(&oldest).is_some() {
                tracing::debug!("evicted oldest upstream oauth state at capacity limit");
            }
        }
        table.order.push_back(state.nonce);
        table.states.insert(state.nonce, state);
    }

    pub async fn get(&self, nonce: OauthStateId) -> Option<OauthState> {
        self.table.read().await.states.get(&nonce).cloned()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.states.len()
    }

    async fn transition(&self, nonce: OauthStateId, from: OauthFlowStatus, to: OauthFlowStatus) {
        if let Some(state) = self.table.write().await.states.get_mut(&nonce)
            && state.status == from
        {
            state.status = to;
        }
    }

    pub async fn mark_redirected(&self, nonce: OauthStateId) {
        self.transition(nonce, OauthFlowStatus::Created, OauthFlowStatus::Redirected)
            .await;
    }

    /// Redirected -> Exchanged, atomically, for the browser that started the
    /// flow. A foreign browser fails without burning the state; an expired
    /// state is burned on the way out.
    pub async fn consume(&self, nonce: OauthStateId, binding: Option<&str>) -> Result<OauthState> {
        let now = self.clock.now();
        let mut table = self.table.write().await;
        let table = &mut *table;
        let Some(state) = table.states.get_mut(&nonce) else {
            return Err(AuthError::InvalidState);
        };
        if !is_bound(state, binding) {
            tracing::warn!("oauth state {} presented by another browser", nonce);
            return Err(AuthError::InvalidState);
        }
        if state.status != OauthFlowStatus::Redirected {
            tracing::warn!(
                "replayed oauth state {} (status {:?})",
                nonce,
                state.status
            );
            return Err(AuthError::InvalidState);
        }
        if is_expired(state.created_at, self.ttl, now) {
            table.states.remove(&nonce);
            table.order.retain(|n| *n != nonce);
            return Err(AuthError::ExpiredState);
        }
        state.status = OauthFlowStatus::Exchanged;
        Ok(state.clone())
    }

    pub async fn mark_resolved(&self, nonce: OauthStateId) {
        self.transition(nonce, OauthFlowStatus::Exchanged, OauthFlowStatus::Resolved)
            .await;
    }

    /// Drops a flow its browser abandoned
    pub async fn remove(&self, nonce: OauthStateId, binding: Option<&str>) -> bool {
        let mut table = self.table.write().await;
        if !table.states.get(&nonce).is_some_and(|s| is_bound(s, binding)) {
            return false;
        }
        table.order.retain(|n| *n != nonce);
        table.states.remove(&nonce).is_some()
    }

    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut table = self.table.write().await;
        let table = &mut *table;
        let before = table.states.len();
        table
            .states
            .retain(|_, s| !is_expired(s.created_at, self.ttl, now));
        let states = &table.states;
        table.order.retain(|n| states.contains_key(n));
        let removed = before - table.states.len();
        if removed > 0 {
            tracing::debug!("cleaned up {} expired oauth states", removed);
        }
        removed
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRedirect {
    pub state: OauthStateId,
    pub authorization_uri: Url,
    /// secret the starting browser must present at the callback
    pub binding: String,
}

#[derive(Debug)]
pub enum UpstreamOutcome {
    LoggedIn { user_id: UserId, session: Session },
    Linked { user_id: UserId, link: ExternalRef },
}

/// Drives the authorization-code flow against provider C's oauth server
#[derive(Clone)]
pub struct OauthConsumer {
    upstream: Arc<dyn UpstreamOauthClient>,
    states: OauthStateStore,
    links: LinkManager,
    users: UserStore,
    sessions: SessionStore,
    accounts: ExternalAccounts,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    client_id: String,
    redirect_uri: Url,
    timeout: Duration,
}

pub struct OauthConsumerParts {
    pub upstream: Arc<dyn UpstreamOauthClient>,
    pub links: LinkManager,
    pub users: UserStore,
    pub sessions: SessionStore,
    pub accounts: ExternalAccounts,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub client_id: String,
    pub redirect_uri: Url,
    pub state_ttl: Duration,
    /// cap on in-flight flows; the oldest are evicted past it
    pub max_pending: usize,
    pub timeout: Duration,
}

impl OauthConsumer {
    pub fn new(parts: OauthConsumerParts) -> Self {
        Self {
            states: OauthStateStore::new(parts.clock.clone(), parts.state_ttl, parts.max_pending),
            upstream: parts.upstream,
            links: parts.links,
            users: parts.users,
            sessions: parts.sessions,
            accounts: parts.accounts,
            ids: parts.ids,
            clock: parts.clock,
            client_id: parts.client_id,
            redirect_uri: parts.redirect_uri,
            timeout: parts.timeout,
        }
    }

    pub fn states(&self) -> &OauthStateStore {
        &self.states
    }

    /// Opens a flow and returns where to send the browser.
    /// Login is open to guests; Link binds the flow to the acting user.
    pub async fn start(
        &self,
        acx: &AuthContext,
        action: OauthActionType,
    ) -> Result<UpstreamRedirect> {
        let user_id = match action {
            OauthActionType::Login => None,
            OauthActionType::Link => Some(acx.require_user(Permission::ManageLinks)?),
        };
        let nonce = OauthStateId::from(self.ids.next());
        let binding = new_binding();
        self.states
            .insert(OauthState {
                nonce,
                action,
                user_id,
                binding_hash: binding_hash(&binding),
                client_id: self.client_id.clone(),
                redirect_uri: self.redirect_uri.clone(),
                created_at: self.clock.now(),
                status: OauthFlowStatus::Created,
            })
            .await;

        let authorization_uri = self.upstream.authorization_uri(&nonce);
        self.states.mark_redirected(nonce).await;
        tracing::info!("started upstream {:?} flow {}", action, nonce);
        Ok(UpstreamRedirect {
            state: nonce,
            authorization_uri,
            binding,
        })
    }

    /// Handles the provider's redirect back. `binding` is the secret handed
    /// out by [`start`](Self::start) to the same browser. The state is consumed
    /// before any upstream call, so a failed callback cannot be replayed.
    pub async fn callback(
        &self,
        acx: &AuthContext,
        raw_state: &str,
        binding: Option<&str>,
        code: &str,
    ) -> Result<UpstreamOutcome> {
        let nonce: OauthStateId = raw_state.parse().map_err(|_| AuthError::InvalidState)?;
        let state = self.states.consume(nonce, binding).await?;

        if state.action == OauthActionType::Link {
            let bound = state.user_id.ok_or(AuthError::InvalidState)?;
            if acx.user_id() != Some(bound) {
                tracing::warn!("upstream link flow {} finished by another context", nonce);
                return Err(AuthError::Unauthorized);
            }
        }

        let token = bounded(
            "upstream code exchange",
            self.timeout,
            self.upstream.exchange_code(code),
        )
        .await?;
        let profile = bounded(
            "upstream profile fetch",
            self.timeout,
            self.upstream.get_profile(&token),
        )
        .await?;

        let outcome = match (state.action, state.user_id) {
            (OauthActionType::Link, Some(user_id)) => {
                let link = self
                    .links
                    .link_verified(user_id, Provider::C, &profile)
                    .await?;
                UpstreamOutcome::Linked { user_id, link }
            }
            (OauthActionType::Link, None) => return Err(AuthError::InvalidState),
            (OauthActionType::Login, _) => {
                let short = self
                    .accounts
                    .for_provider(Provider::C)
                    .touch(&profile, self.clock.now())
                    .await?;
                let external = ExternalRef {
                    provider: Provider::C,
                    external_id: short.id,
                };
                let Some(user_id) = self.users.find_by_external(&external).await else {
                    tracing::info!(
                        "upstream login for unlinked account {}",
                        external.external_id
                    );
                    return Err(AuthError::NotLinked(Provider::C));
                };
                let session = self.sessions.create_session(user_id).await?;
                UpstreamOutcome::LoggedIn { user_id, session }
            }
        };

        self.states.mark_resolved(nonce).await;
        Ok(outcome)
    }

    /// Abandons a flow; unknown or foreign states are ignored
    pub async fn cancel(&self, raw_state: &str, binding: Option<&str>) {
        if let Ok(nonce) = raw_state.parse::<OauthStateId>()
            && self.states.remove(nonce, binding).await
        {
            tracing::debug!("cancelled upstream flow {}", nonce);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::external::{ExternalClients, MemExternalClient};
    use crate::id::SequentialIdGenerator;
    use crate::oauth::upstream::MemUpstreamOauthClient;
    use crate::types::ExternalProfile;
    use crate::user::NewUser;

    struct Fixture {
        consumer: OauthConsumer,
        upstream: Arc<MemUpstreamOauthClient>,
        users: UserStore,
        clock: Arc<VirtualClock>,
    }

    fn fixture() -> Fixture {
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::new());
        let clock = Arc::new(VirtualClock::default());
        let users = UserStore::new(ids.clone(), clock.clone());
        let accounts = ExternalAccounts::new();
        let links = LinkManager::new(
            users.clone(),
            accounts.clone(),
            ExternalClients::new(
                Arc::new(MemExternalClient::new(Provider::A)),
                Arc::new(MemExternalClient::new(Provider::B)),
                Arc::new(MemExternalClient::new(Provider::C)),
            ),
            clock.clone(),
            Duration::from_secs(1),
        );
        let sessions = SessionStore::new(
            users.clone(),
            ids.clone(),
            clock.clone(),
            Duration::from_secs(3600),
        );
        let upstream = Arc::new(MemUpstreamOauthClient::new(
            Url::parse("https://c.example/authorize").unwrap(),
        ));
        let consumer = OauthConsumer::new(OauthConsumerParts {
            upstream: upstream.clone(),
            links,
            users: users.clone(),
            sessions,
            accounts,
            ids,
            clock: clock.clone(),
            client_id: "twinlink".to_string(),
            redirect_uri: Url::parse("https://id.example/oauth/upstream/callback").unwrap(),
            state_ttl: Duration::from_secs(600),
            max_pending: 100,
            timeout: Duration::from_secs(1),
        });
        Fixture {
            consumer,
            upstream,
            users,
            clock,
        }
    }

    async fn user(users: &UserStore) -> UserId {
        users
            .create(NewUser {
                display_name: "Carol".to_string(),
                username: None,
                password_hash: None,
            })
            .await
            .unwrap()
            .id
    }

    fn carol() -> ExternalProfile {
        ExternalProfile {
            id: "1234567890".to_string(),
            username: "carol".to_string(),
        }
    }

    #[tokio::test]
    async fn test_link_flow_then_login_flow() {
        let f = fixture();
        let id = user(&f.users).await;
        let acx = AuthContext::user(id);

        let redirect = f.consumer.start(&acx, OauthActionType::Link).await.unwrap();
        assert!(
            redirect
                .authorization_uri
                .query_pairs()
                .any(|(k, v)| k == "state" && v == redirect.state.to_string())
        );
        let code = f.upstream.authorize(carol()).await;
        let outcome = f
            .consumer
            .callback(
                &acx,
                &redirect.state.to_string(),
                Some(redirect.binding.as_str()),
                &code,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, UpstreamOutcome::Linked { user_id, .. } if user_id == id));
        assert_eq!(
            f.users.get(id).await.unwrap().links.c.unwrap().external_id.as_str(),
            "1234567890"
        );
        assert_eq!(
            f.consumer.states().get(redirect.state).await.unwrap().status,
            OauthFlowStatus::Resolved
        );

        let redirect = f
            .consumer
            .start(&AuthContext::guest(), OauthActionType::Login)
            .await
            .unwrap();
        let code = f.upstream.authorize(carol()).await;
        let outcome = f
            .consumer
            .callback(
                &AuthContext::guest(),
                &redirect.state.to_string(),
                Some(redirect.binding.as_str()),
                &code,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, UpstreamOutcome::LoggedIn { user_id, .. } if user_id == id));
    }

    #[tokio::test]
    async fn test_login_for_unlinked_account() {
        let f = fixture();
        let redirect = f
            .consumer
            .start(&AuthContext::guest(), OauthActionType::Login)
            .await
            .unwrap();
        let code = f.upstream.authorize(carol()).await;
        assert!(matches!(
            f.consumer
                .callback(
                &AuthContext::guest(),
                &redirect.state.to_string(),
                Some(redirect.binding.as_str()),
                &code,
            )
                .await,
            Err(AuthError::NotLinked(Provider::C))
        ));
    }

    #[tokio::test]
    async fn test_replay_and_unknown_state() {
        let f = fixture();
        let acx = AuthContext::user(user(&f.users).await);
        let redirect = f.consumer.start(&acx, OauthActionType::Link).await.unwrap();
        let code = f.upstream.authorize(carol()).await;
        let state = redirect.state.to_string();

        f.consumer.callback(&acx, &state, Some(redirect.binding.as_str()), &code).await.unwrap();
        assert!(matches!(
            f.consumer.callback(&acx, &state, Some(redirect.binding.as_str()), &code).await,
            Err(AuthError::InvalidState)
        ));
        assert!(matches!(
            f.consumer.callback(&acx, "not-a-state", Some(redirect.binding.as_str()), &code).await,
            Err(AuthError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn test_expired_state_is_distinct_and_burned() {
        let f = fixture();
        let redirect = f
            .consumer
            .start(&AuthContext::guest(), OauthActionType::Login)
            .await
            .unwrap();
        let state = redirect.state.to_string();
        let binding = Some(redirect.binding.as_str());
        f.clock.advance(Duration::from_secs(600));
        assert!(matches!(
            f.consumer.callback(&AuthContext::guest(), &state, binding, "x").await,
            Err(AuthError::ExpiredState)
        ));
        assert!(matches!(
            f.consumer.callback(&AuthContext::guest(), &state, binding, "x").await,
            Err(AuthError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn test_link_flow_bound_to_its_user() {
        let f = fixture();
        let alice = user(&f.users).await;
        let mallory = user(&f.users).await;
        let redirect = f
            .consumer
            .start(&AuthContext::user(alice), OauthActionType::Link)
            .await
            .unwrap();
        let code = f.upstream.authorize(carol()).await;
        assert!(matches!(
            f.consumer
                .callback(
                    &AuthContext::user(mallory),
                    &redirect.state.to_string(),
                    Some(redirect.binding.as_str()),
                    &code,
                )
                .await,
            Err(AuthError::Unauthorized)
        ));
        assert!(f.users.get(mallory).await.unwrap().links.c.is_none());
        assert!(matches!(
            f.consumer
                .start(&AuthContext::guest(), OauthActionType::Link)
                .await,
            Err(AuthError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_upstream_failure_still_consumes_state() {
        let f = fixture();
        let acx = AuthContext::user(user(&f.users).await);
        let redirect = f.consumer.start(&acx, OauthActionType::Link).await.unwrap();
        let code = f.upstream.authorize(carol()).await;
        let state = redirect.state.to_string();

        f.upstream.set_offline(true);
        assert!(matches!(
            f.consumer.callback(&acx, &state, Some(redirect.binding.as_str()), &code).await,
            Err(AuthError::ExternalUnavailable(_))
        ));
        f.upstream.set_offline(false);
        assert!(matches!(
            f.consumer.callback(&acx, &state, Some(redirect.binding.as_str()), &code).await,
            Err(AuthError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn test_login_flow_only_completes_in_the_starting_browser() {
        let f = fixture();
        let owner = user(&f.users).await;
        let acx = AuthContext::user(owner);
        let link = f.consumer.start(&acx, OauthActionType::Link).await.unwrap();
        let code = f.upstream.authorize(carol()).await;
        f.consumer
            .callback(&acx, &link.state.to_string(), Some(link.binding.as_str()), &code)
            .await
            .unwrap();

        // a login flow started in one browser, its callback replayed in another
        let redirect = f
            .consumer
            .start(&AuthContext::guest(), OauthActionType::Login)
            .await
            .unwrap();
        let code = f.upstream.authorize(carol()).await;
        let state = redirect.state.to_string();
        for foreign in [None, Some("forged"), Some(link.binding.as_str())] {
            assert!(matches!(
                f.consumer
                    .callback(&AuthContext::guest(), &state, foreign, &code)
                    .await,
                Err(AuthError::InvalidState)
            ));
        }

        // the foreign attempts did not burn the flow for its own browser
        let outcome = f
            .consumer
            .callback(&AuthContext::guest(), &state, Some(redirect.binding.as_str()), &code)
            .await
            .unwrap();
        assert!(matches!(outcome, UpstreamOutcome::LoggedIn { user_id, .. } if user_id == owner));
    }

    #[tokio::test]
    async fn test_in_flight_states_are_capped() {
        let f = fixture();
        let first = f
            .consumer
            .start(&AuthContext::guest(), OauthActionType::Login)
            .await
            .unwrap();
        for _ in 0..150 {
            f.consumer
                .start(&AuthContext::guest(), OauthActionType::Login)
                .await
                .unwrap();
        }
        assert_eq!(f.consumer.states().len().await, 100);
        assert!(f.consumer.states().get(first.state).await.is_none());
        assert!(matches!(
            f.consumer
                .callback(
                    &AuthContext::guest(),
                    &first.state.to_string(),
                    Some(first.binding.as_str()),
                    "x"
                )
                .await,
            Err(AuthError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn test_cleanup_and_cancel() {
        let f = fixture();
        let first = f
            .consumer
            .start(&AuthContext::guest(), OauthActionType::Login)
            .await
            .unwrap();
        let second = f
            .consumer
            .start(&AuthContext::guest(), OauthActionType::Login)
            .await
            .unwrap();
        let raw = second.state.to_string();
        f.consumer.cancel(&raw, None).await;
        f.consumer.cancel(&raw, Some(first.binding.as_str())).await;
        assert!(f.consumer.states().get(second.state).await.is_some());
        f.consumer.cancel(&raw, Some(second.binding.as_str())).await;
        assert!(f.consumer.states().get(second.state).await.is_none());

        f.clock.advance(Duration::from_secs(601));
        assert_eq!(f.consumer.states().cleanup_expired().await, 1);
        assert!(f.consumer.states().get(first.state).await.is_none());
    }
}
