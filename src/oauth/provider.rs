use super::authorization_code::{
    AuthorizationGrant, PendingAuthorization, SingleUseStore, Taken,
};
use super::client::ClientRegistry;
use super::token::AccessTokenStore;
use crate::clock::Clock;
use crate::error::{AuthError, Result};
use crate::id::IdGenerator;
use crate::types::{
    AccessTokenKey, AuthContext, AuthScope, AuthorizationCode, OauthAccessToken, OauthClient,
    OauthTokenType, PendingAuthorizationId, Permission,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use url::Url;
use url::form_urlencoded;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Code,
    Token,
}

impl ResponseType {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "code" => Ok(ResponseType::Code),
            "token" => Ok(ResponseType::Token),
            other => Err(AuthError::invalid_request(format!(
                "unsupported response_type: {:?}",
                other
            ))),
        }
    }
}

/// Query of `GET /oauth/authorize`, kept raw so validation errors are ours
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationRequest {
    pub response_type: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub state: Option<String>,
    pub scope: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

/// Shown to the user before anything is granted
#[derive(Debug, Clone, Serialize)]
pub struct ConsentPrompt {
    pub request_id: PendingAuthorizationId,
    pub client_display_name: String,
    pub client_app_uri: Url,
    pub scope: AuthScope,
}

#[derive(Debug)]
pub enum AuthorizeOutcome {
    /// a guest has to log in first, then retry the same request
    LoginRequired,
    ConsentRequired(ConsentPrompt),
}

/// Form of `POST /oauth/token`
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code_verifier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: OauthTokenType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    pub scope: AuthScope,
}

/// PKCE verification, S256 only
pub fn verify_pkce(code_verifier: &str, code_challenge: &str) -> bool {
    let digest = Sha256::digest(code_verifier.as_bytes());
    let computed = URL_SAFE_NO_PAD.encode(digest);
    computed.as_bytes().ct_eq(code_challenge.as_bytes()).into()
}

/// Local authorization server: third-party clients obtain tokens acting for a user
#[derive(Clone)]
pub struct OauthProvider {
    clients: ClientRegistry,
    pending: SingleUseStore<PendingAuthorizationId, PendingAuthorization>,
    codes: SingleUseStore<AuthorizationCode, AuthorizationGrant>,
    tokens: AccessTokenStore,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl OauthProvider {
    pub fn new(
        clients: ClientRegistry,
        tokens: AccessTokenStore,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        code_ttl: Duration,
        max_pending: usize,
    ) -> Self {
        Self {
            clients,
            pending: SingleUseStore::new(clock.clone(), code_ttl, max_pending),
            codes: SingleUseStore::new(clock.clone(), code_ttl, max_pending),
            tokens,
            ids,
            clock,
        }
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn tokens(&self) -> &AccessTokenStore {
        &self.tokens
    }

    /// Validates an authorization request and parks it until the user decides
    pub async fn authorize(
        &self,
        acx: &AuthContext,
        req: &AuthorizationRequest,
    ) -> Result<AuthorizeOutcome> {
        // client and redirect first: nothing may be redirected to an unchecked uri
        let client = self.validated_client(&req.client_id, &req.redirect_uri).await?;

        let user_id = match acx {
            AuthContext::Guest { .. } => return Ok(AuthorizeOutcome::LoginRequired),
            _ => acx.require_user(Permission::ManageOauthClients)?,
        };

        let response_type = ResponseType::parse(&req.response_type)?;
        let scope = AuthScope::parse_oauth(req.scope.as_deref())?;
        let code_challenge = match (req.code_challenge.as_deref(), req.code_challenge_method.as_deref()) {
            (None, None) => None,
            (Some(challenge), None | Some("S256")) if response_type == ResponseType::Code => {
                Some(challenge.to_string())
            }
            (Some(_), None | Some("S256")) => {
                return Err(AuthError::invalid_request(
                    "code_challenge only applies to response_type=code",
                ));
            }
            (None, Some(_)) => {
                return Err(AuthError::invalid_request(
                    "code_challenge_method without code_challenge",
                ));
            }
            (Some(_), Some(method)) => {
                return Err(AuthError::invalid_request(format!(
                    "unsupported code_challenge_method: {:?}",
                    method
                )));
            }
        };

        let request_id = PendingAuthorizationId::from(self.ids.next());
        self.pending
            .insert(
                request_id,
                PendingAuthorization {
                    client_id: client.id,
                    user_id,
                    redirect_uri: client.callback_uri.clone(),
                    response_type,
                    scope,
                    state: req.state.clone(),
                    code_challenge,
                    created_at: self.clock.now(),
                },
            )
            .await;

        tracing::info!(
            "authorization request from client {} for user {} awaiting consent",
            client.id,
            user_id
        );
        Ok(AuthorizeOutcome::ConsentRequired(ConsentPrompt {
            request_id,
            client_display_name: client.display_name,
            client_app_uri: client.app_uri,
            scope,
        }))
    }

    async fn validated_client(&self, raw_client_id: &str, redirect_uri: &str) -> Result<OauthClient> {
        let client = self
            .clients
            .resolve(raw_client_id)
            .await
            .ok_or_else(|| AuthError::InvalidClient("unknown client".to_string()))?;
        if !same_uri(&client.callback_uri, redirect_uri) {
            tracing::warn!(
                "rejected redirect_uri '{}' for client {}",
                redirect_uri,
                client.id
            );
            return Err(AuthError::InvalidClient("redirect_uri mismatch".to_string()));
        }
        Ok(client)
    }

    /// Applies the user's decision; returns where to send the browser.
    /// The pending request is consumed whatever the outcome.
    pub async fn approve(
        &self,
        acx: &AuthContext,
        request_id: PendingAuthorizationId,
        approved: bool,
    ) -> Result<Url> {
        let user_id = acx.require_user(Permission::ManageOauthClients)?;
        let pending = match self.pending.take(&request_id).await {
            Taken::Valid(p) => p,
            Taken::Expired(_) => return Err(AuthError::ExpiredState),
            Taken::Missing => return Err(AuthError::InvalidState),
        };
        if pending.user_id != user_id {
            tracing::warn!(
                "user {} tried to answer a consent prompt of user {}",
                user_id,
                pending.user_id
            );
            return Err(AuthError::Unauthorized);
        }

        if !approved {
            tracing::info!(
                "user {} denied authorization to client {}",
                user_id,
                pending.client_id
            );
            return Ok(error_redirect(
                &pending.redirect_uri,
                "access_denied",
                "The user denied the authorization request",
                pending.state.as_deref(),
            ));
        }

        match pending.response_type {
            ResponseType::Code => {
                let code = AuthorizationCode::from(self.ids.next());
                self.codes
                    .insert(
                        code,
                        AuthorizationGrant {
                            client_id: pending.client_id,
                            user_id,
                            redirect_uri: pending.redirect_uri.clone(),
                            scope: pending.scope,
                            code_challenge: pending.code_challenge,
                            created_at: self.clock.now(),
                        },
                    )
                    .await;
                let mut target = pending.redirect_uri;
                {
                    let mut query = target.query_pairs_mut();
                    query.append_pair("code", &code.to_string());
                    if let Some(state) = &pending.state {
                        query.append_pair("state", state);
                    }
                }
                tracing::info!(
                    "issued authorization code to client {} for user {}",
                    pending.client_id,
                    user_id
                );
                Ok(target)
            }
            ResponseType::Token => {
                let token = self
                    .tokens
                    .issue(pending.client_id, user_id, pending.scope)
                    .await;
                let response = self.token_response(&token);
                let mut fragment = form_urlencoded::Serializer::new(String::new());
                fragment
                    .append_pair("access_token", &response.access_token)
                    .append_pair("token_type", "bearer")
                    .append_pair("scope", response.scope.as_str());
                if let Some(expires_in) = response.expires_in {
                    fragment.append_pair("expires_in", &expires_in.to_string());
                }
                if let Some(state) = &pending.state {
                    fragment.append_pair("state", state);
                }
                let mut target = pending.redirect_uri;
                target.set_fragment(Some(&fragment.finish()));
                Ok(target)
            }
        }
    }

    /// Authorization code grant. The client is authenticated before the code is
    /// taken; once taken the code is gone even if a later check fails.
    pub async fn exchange(&self, req: &TokenRequest) -> Result<AccessTokenResponse> {
        if req.grant_type != "authorization_code" {
            return Err(AuthError::invalid_request(format!(
                "unsupported grant_type: {:?}",
                req.grant_type
            )));
        }
        let (Some(client_id), Some(client_secret)) = (&req.client_id, &req.client_secret) else {
            return Err(AuthError::InvalidClient(
                "missing client credentials".to_string(),
            ));
        };
        let raw_code = req
            .code
            .as_deref()
            .ok_or_else(|| AuthError::invalid_request("missing required parameter: code"))?;

        let client = self.clients.authenticate(client_id, client_secret).await?;

        let code: AuthorizationCode = raw_code.parse().map_err(|_| AuthError::InvalidState)?;
        let grant = match self.codes.take(&code).await {
            Taken::Valid(grant) => grant,
            Taken::Expired(_) => {
                tracing::warn!("expired authorization code presented by client {}", client.id);
                return Err(AuthError::ExpiredState);
            }
            Taken::Missing => {
                tracing::warn!(
                    "unknown or replayed authorization code presented by client {}",
                    client.id
                );
                return Err(AuthError::InvalidState);
            }
        };

        if grant.client_id != client.id {
            tracing::warn!(
                "client {} presented a code issued to client {}",
                client.id,
                grant.client_id
            );
            return Err(AuthError::InvalidState);
        }
        let redirect_matches = req
            .redirect_uri
            .as_deref()
            .is_none_or(|uri| same_uri(&grant.redirect_uri, uri));
        if !redirect_matches {
            tracing::warn!("redirect_uri mismatch at exchange for client {}", client.id);
            return Err(AuthError::InvalidState);
        }
        if let Some(challenge) = &grant.code_challenge {
            let verified = req
                .code_verifier
                .as_deref()
                .is_some_and(|verifier| verify_pkce(verifier, challenge));
            if !verified {
                tracing::warn!("PKCE verification failed for client {}", client.id);
                return Err(AuthError::InvalidState);
            }
        }

        let token = self
            .tokens
            .issue(client.id, grant.user_id, grant.scope)
            .await;
        Ok(self.token_response(&token))
    }

    fn token_response(&self, token: &OauthAccessToken) -> AccessTokenResponse {
        AccessTokenResponse {
            access_token: token.key.to_string(),
            token_type: OauthTokenType::Bearer,
            expires_in: self.tokens.ttl().map(|ttl| ttl.as_secs()),
            scope: token.scope,
        }
    }

    /// Token revocation by the client it was issued to. Unknown tokens are not an error.
    pub async fn revoke(&self, client_id: &str, client_secret: &str, token: &str) -> Result<()> {
        let client = self.clients.authenticate(client_id, client_secret).await?;
        if let Ok(key) = token.parse::<AccessTokenKey>() {
            self.tokens.revoke_for_client(key, client.id).await;
        }
        Ok(())
    }

    pub async fn resolve_token(&self, key: AccessTokenKey) -> Option<OauthAccessToken> {
        self.tokens.get_active(key).await
    }

    pub async fn cleanup_expired(&self) {
        self.pending.cleanup_expired().await;
        self.codes.cleanup_expired().await;
        self.tokens.cleanup_expired().await;
    }
}

/// Exact match after parsing, so `https://app.example` equals the stored
/// `https://app.example/` but no other path, query or host does
fn same_uri(registered: &Url, raw: &str) -> bool {
    Url::parse(raw).is_ok_and(|uri| &uri == registered)
}

/// Redirect carrying an RFC 6749 error back to a validated callback
pub fn error_redirect(
    redirect_uri: &Url,
    error: &str,
    description: &str,
    state: Option<&str>,
) -> Url {
    let mut url = redirect_uri.clone();
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("error", error)
            .append_pair("error_description", description);
        if let Some(state) = state {
            query.append_pair("state", state);
        }
    }
    url
}
