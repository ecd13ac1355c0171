//! HTTP surface: accounts, links and both oauth roles, over axum.

pub mod account;
pub mod error;
pub mod middleware;
pub mod oauth;

use crate::services::Services;
use crate::types::Session;
use axum::{
    Router,
    http::{HeaderValue, header},
    middleware::from_fn_with_state,
    response::Response,
    routing::{get, post, put},
};
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    /// public base url without trailing slash, e.g. `https://id.example`
    pub base_url: String,
    pub session_ttl: Duration,
}

impl AppState {
    pub fn new(services: Services, base_url: &str, session_ttl: Duration) -> Self {
        Self {
            services,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_ttl,
        }
    }

    fn secure_cookies(&self) -> bool {
        self.base_url.starts_with("https://")
    }

    /// Attaches the session cookie to a response
    pub(crate) fn set_session_cookie(&self, response: &mut Response, session: &Session) {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            middleware::SESSION_COOKIE,
            session.id,
            self.session_ttl.as_secs()
        );
        if self.secure_cookies() {
            cookie.push_str("; Secure");
        }
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }

    pub(crate) fn clear_session_cookie(&self, response: &mut Response) {
        let cookie = format!(
            "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
            middleware::SESSION_COOKIE
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }

    /// Lax so it survives the top-level redirect back from provider C
    pub(crate) fn set_upstream_flow_cookie(&self, response: &mut Response, binding: &str) {
        let mut cookie = format!(
            "{}={}; Path=/oauth/upstream; HttpOnly; SameSite=Lax; Max-Age={}",
            middleware::UPSTREAM_FLOW_COOKIE,
            binding,
            self.services.upstream.states().ttl().as_secs()
        );
        if self.secure_cookies() {
            cookie.push_str("; Secure");
        }
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }

    pub(crate) fn clear_upstream_flow_cookie(&self, response: &mut Response) {
        let cookie = format!(
            "{}=; Path=/oauth/upstream; HttpOnly; SameSite=Lax; Max-Age=0",
            middleware::UPSTREAM_FLOW_COOKIE
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
}

/// Builds the application. With `rate_limit` the credential endpoints get a
/// per-ip limiter, which needs connect info from `axum::serve`.
pub fn router(state: AppState, rate_limit: bool) -> anyhow::Result<Router> {
    // login, register and token exchange take secrets, and upstream start
    // allocates state for guests, so they get their own bucket
    let credential_routes = Router::new()
        .route(
            "/auth/login",
            get(account::login_page_handler).post(account::login_handler),
        )
        .route("/auth/register", post(account::register_handler))
        .route("/oauth/token", post(oauth::token_handler))
        .route("/oauth/upstream/start", get(oauth::upstream_start_handler));

    let credential_routes = if rate_limit {
        // 5 requests per second per ip, burst of 10
        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .key_extractor(SmartIpKeyExtractor)
                .per_second(5)
                .burst_size(10)
                .finish()
                .ok_or_else(|| anyhow::anyhow!("invalid rate limiter config"))?,
        );
        let limiter = governor_conf.limiter().clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                limiter.retain_recent();
            }
        });
        credential_routes.layer(GovernorLayer::new(governor_conf))
    } else {
        credential_routes
    };

    let routes = Router::new()
        .route("/auth/logout", post(account::logout_handler))
        .route("/users/me", get(account::me_handler))
        .route(
            "/users/{user_id}",
            get(account::get_user_handler).delete(account::delete_user_handler),
        )
        .route(
            "/users/{user_id}/links/{provider}",
            put(account::link_handler).delete(account::unlink_handler),
        )
        .route("/oauth/authorize", get(oauth::authorize_handler))
        .route("/oauth/authorize/consent", get(oauth::consent_handler))
        .route("/oauth/revoke", post(oauth::revoke_handler))
        .route("/oauth/clients", post(oauth::register_client_handler))
        .route(
            "/.well-known/oauth-authorization-server",
            get(oauth::metadata_handler),
        )
        .route(
            "/oauth/upstream/callback",
            get(oauth::upstream_callback_handler),
        );

    Ok(routes
        .merge(credential_routes)
        .layer(from_fn_with_state(
            state.clone(),
            middleware::resolve_auth_context,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Relative in-app path, safe to redirect to after login
pub(crate) fn safe_return_path(raw: Option<&str>) -> Option<&str> {
    raw.filter(|p| p.starts_with('/') && !p.starts_with("//") && !p.contains('\\'))
}
