use super::AppState;
use crate::resolver::Credential;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};

pub const SESSION_COOKIE: &str = "sid";
/// Holds the secret binding an upstream oauth flow to the browser that started it
pub const UPSTREAM_FLOW_COOKIE: &str = "upstream_flow";

/// Bearer header first, then the session cookie
pub fn credential_from_headers(headers: &HeaderMap) -> Credential {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Credential::Bearer(token.to_string());
    }

    cookie_value(headers, SESSION_COOKIE)
        .map(Credential::SessionId)
        .unwrap_or(Credential::None)
}

/// First non-empty value of the named cookie
pub fn cookie_value(headers: &HeaderMap, cookie: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == cookie && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Resolves the request's [`AuthContext`](crate::types::AuthContext) and
/// stores it, with the raw credential, in the request extensions.
/// Never rejects: handlers decide what a guest may do.
pub async fn resolve_auth_context(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let credential = credential_from_headers(req.headers());
    let acx = state.services.resolver.resolve(&credential).await;
    tracing::debug!("{} {} as {:?}", req.method(), req.uri().path(), acx);
    req.extensions_mut().insert(acx);
    req.extensions_mut().insert(credential);
    next.run(req).await
}
