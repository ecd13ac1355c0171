use crate::error::{AuthError, Result};
use crate::password::PasswordHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

/// Parses the canonical lowercase hyphenated form, rejecting every other uuid spelling
fn parse_uuid_hex(raw: &str) -> Result<Uuid> {
    let shaped = raw.len() == 36
        && raw
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b) || b == b'-');
    if !shaped {
        return Err(AuthError::invalid_request(format!(
            "malformed identifier: {:?}",
            raw
        )));
    }
    Uuid::parse_str(raw)
        .map_err(|_| AuthError::invalid_request(format!("malformed identifier: {:?}", raw)))
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Uuid);

        impl $name {
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0.hyphenated(), f)
            }
        }

        impl FromStr for $name {
            type Err = AuthError;

            fn from_str(raw: &str) -> Result<Self> {
                parse_uuid_hex(raw).map(Self)
            }
        }

        impl TryFrom<String> for $name {
            type Error = AuthError;

            fn try_from(raw: String) -> Result<Self> {
                raw.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.to_string()
            }
        }
    };
}

uuid_id!(UserId);
uuid_id!(SessionId);
uuid_id!(OauthClientId);
uuid_id!(
    /// Nonce binding an upstream redirect to its callback
    OauthStateId
);
uuid_id!(AuthorizationCode);
uuid_id!(AccessTokenKey);
uuid_id!(
    /// Handle of an authorization request waiting for user consent
    PendingAuthorizationId
);

/// External game platforms a user can link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    A,
    B,
    C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMethodKind {
    Credentials,
    SessionKey,
    Ref,
}

/// Per-provider rules, the only place where providers differ
#[derive(Debug)]
pub struct ProviderProfile {
    pub max_id_digits: usize,
    pub link_methods: &'static [LinkMethodKind],
}

static PROVIDER_A: ProviderProfile = ProviderProfile {
    max_id_digits: 9,
    link_methods: &[LinkMethodKind::Credentials, LinkMethodKind::Ref],
};

static PROVIDER_B: ProviderProfile = ProviderProfile {
    max_id_digits: 9,
    link_methods: &[
        LinkMethodKind::Credentials,
        LinkMethodKind::SessionKey,
        LinkMethodKind::Ref,
    ],
};

// C only links through its oauth flow, which ends in a trusted ref
static PROVIDER_C: ProviderProfile = ProviderProfile {
    max_id_digits: 10,
    link_methods: &[LinkMethodKind::Ref],
};

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::A, Provider::B, Provider::C];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::A => "a",
            Provider::B => "b",
            Provider::C => "c",
        }
    }

    pub fn profile(self) -> &'static ProviderProfile {
        match self {
            Provider::A => &PROVIDER_A,
            Provider::B => &PROVIDER_B,
            Provider::C => &PROVIDER_C,
        }
    }

    pub fn supports(self, kind: LinkMethodKind) -> bool {
        self.profile().link_methods.contains(&kind)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = AuthError;

    fn from_str(raw: &str) -> Result<Self> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == raw)
            .ok_or_else(|| AuthError::invalid_request(format!("unknown provider: {:?}", raw)))
    }
}

/// Provider-side account id, validated against the provider's numeric pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    pub fn parse(provider: Provider, raw: &str) -> Result<Self> {
        let max = provider.profile().max_id_digits;
        let valid = !raw.is_empty()
            && raw.len() <= max
            && raw.bytes().all(|b| b.is_ascii_digit())
            && (raw == "0" || !raw.starts_with('0'));
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(AuthError::invalid_request(format!(
                "invalid {} account id: {:?}",
                provider, raw
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const USERNAME_MAX_CHARS: usize = 32;

/// Usernames (local or provider-side) are 1-32 chars, no control chars, no surrounding spaces
pub fn validate_username(raw: &str) -> Result<String> {
    let count = raw.chars().count();
    if count == 0
        || count > USERNAME_MAX_CHARS
        || raw.trim() != raw
        || raw.chars().any(char::is_control)
    {
        return Err(AuthError::invalid_request(format!(
            "invalid username: {:?}",
            raw
        )));
    }
    Ok(raw.to_string())
}

/// Foreign key into a provider's external account store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ExternalRef {
    pub provider: Provider,
    pub external_id: ExternalId,
}

/// Cached provider-side profile snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShortExternalUser {
    pub provider: Provider,
    pub id: ExternalId,
    pub username: String,
    pub last_fetched_at: DateTime<Utc>,
}

/// Profile as reported by a provider, not yet validated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalProfile {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct ExternalSession {
    pub key: String,
    pub user: ExternalProfile,
}

#[derive(Clone)]
pub struct ExternalCredentials {
    pub login: String,
    pub password: String,
}

impl fmt::Debug for ExternalCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalCredentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How a caller proves (or asserts) ownership of an external account
#[derive(Clone, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum LinkMethod {
    Credentials { login: String, password: String },
    SessionKey { key: String },
    Ref { external_id: String },
}

impl LinkMethod {
    pub fn kind(&self) -> LinkMethodKind {
        match self {
            LinkMethod::Credentials { .. } => LinkMethodKind::Credentials,
            LinkMethod::SessionKey { .. } => LinkMethodKind::SessionKey,
            LinkMethod::Ref { .. } => LinkMethodKind::Ref,
        }
    }
}

impl fmt::Debug for LinkMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkMethod::Credentials { login, .. } => f
                .debug_struct("Credentials")
                .field("login", login)
                .finish_non_exhaustive(),
            LinkMethod::SessionKey { .. } => f.write_str("SessionKey(<redacted>)"),
            LinkMethod::Ref { external_id } => {
                f.debug_struct("Ref").field("external_id", external_id).finish()
            }
        }
    }
}

/// One optional slot per provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Links {
    pub a: Option<ExternalRef>,
    pub b: Option<ExternalRef>,
    pub c: Option<ExternalRef>,
}

impl Links {
    pub fn get(&self, provider: Provider) -> Option<&ExternalRef> {
        match provider {
            Provider::A => self.a.as_ref(),
            Provider::B => self.b.as_ref(),
            Provider::C => self.c.as_ref(),
        }
    }

    /// replaces the slot, returning what was there
    pub(crate) fn replace(
        &mut self,
        provider: Provider,
        value: Option<ExternalRef>,
    ) -> Option<ExternalRef> {
        let slot = match provider {
            Provider::A => &mut self.a,
            Provider::B => &mut self.b,
            Provider::C => &mut self.c,
        };
        std::mem::replace(slot, value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExternalRef> {
        [&self.a, &self.b, &self.c].into_iter().flatten()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip)]
    pub password_hash: Option<PasswordHash>,
    pub created_at: DateTime<Utc>,
    pub links: Links,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    /// expiry is strict: at `expires_at` the session is already dead
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now < self.expires_at
    }
}

/// What a context is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReadSelf,
    ManageLinks,
    ManageSessions,
    ManageOauthClients,
    Administrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScope {
    /// the full account
    Default,
    /// identity only, what third-party tokens get
    Base,
}

impl AuthScope {
    pub fn allows(self, permission: Permission) -> bool {
        match self {
            AuthScope::Default => true,
            AuthScope::Base => permission == Permission::ReadSelf,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthScope::Default => "default",
            AuthScope::Base => "base",
        }
    }

    /// Scope requested by a third-party client; absent means `base`
    pub fn parse_oauth(raw: Option<&str>) -> Result<Self> {
        match raw.map(str::trim) {
            None | Some("") | Some("base") => Ok(AuthScope::Base),
            Some(other) => Err(AuthError::invalid_request(format!(
                "unsupported scope: {:?}",
                other
            ))),
        }
    }
}

/// Resolved identity of the current request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthContext {
    Guest { scope: AuthScope },
    User { user_id: UserId, scope: AuthScope },
    System { scope: AuthScope },
}

impl AuthContext {
    pub fn guest() -> Self {
        AuthContext::Guest {
            scope: AuthScope::Default,
        }
    }

    pub fn user(user_id: UserId) -> Self {
        AuthContext::User {
            user_id,
            scope: AuthScope::Default,
        }
    }

    pub fn system() -> Self {
        AuthContext::System {
            scope: AuthScope::Default,
        }
    }

    pub fn scope(&self) -> AuthScope {
        match self {
            AuthContext::Guest { scope }
            | AuthContext::User { scope, .. }
            | AuthContext::System { scope } => *scope,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            AuthContext::User { user_id, .. } => Some(*user_id),
            AuthContext::Guest { .. } | AuthContext::System { .. } => None,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, AuthContext::Guest { .. })
    }

    /// A user context whose scope grants `permission`
    pub fn require_user(&self, permission: Permission) -> Result<UserId> {
        match self {
            AuthContext::User { user_id, scope } if scope.allows(permission) => Ok(*user_id),
            _ => Err(AuthError::Unauthorized),
        }
    }

    pub fn require_system(&self) -> Result<()> {
        match self {
            AuthContext::System { scope } if scope.allows(Permission::Administrate) => Ok(()),
            _ => Err(AuthError::Unauthorized),
        }
    }

    /// The user acting on itself, or the system acting on anyone
    pub fn require_self_or_system(&self, target: UserId, permission: Permission) -> Result<()> {
        match self {
            AuthContext::System { scope } if scope.allows(permission) => Ok(()),
            AuthContext::User { user_id, scope }
                if *user_id == target && scope.allows(permission) =>
            {
                Ok(())
            }
            _ => Err(AuthError::Unauthorized),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OauthClient {
    pub id: OauthClientId,
    /// stable name for clients configured out of band
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub display_name: String,
    pub app_uri: Url,
    pub callback_uri: Url,
    #[serde(skip)]
    pub secret_hash: PasswordHash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OauthActionType {
    Login,
    Link,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OauthFlowStatus {
    Created,
    Redirected,
    Exchanged,
    Resolved,
}

/// Single-use continuation token of an upstream oauth flow
#[derive(Debug, Clone, Serialize)]
pub struct OauthState {
    pub nonce: OauthStateId,
    pub action: OauthActionType,
    /// the user a link flow is bound to
    pub user_id: Option<UserId>,
    /// hash of the secret held by the browser that started the flow
    #[serde(skip)]
    pub binding_hash: String,
    pub client_id: String,
    pub redirect_uri: Url,
    pub created_at: DateTime<Utc>,
    pub status: OauthFlowStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OauthAccessToken {
    pub key: AccessTokenKey,
    pub client_id: OauthClientId,
    pub user_id: UserId,
    pub scope: AuthScope,
    pub issued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl OauthAccessToken {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.is_none_or(|exp| now < exp)
    }
}

/// Token type tag, snake_case on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OauthTokenType {
    #[serde(alias = "Bearer")]
    Bearer,
}
