use super::AppState;
use super::error::{ApiError, ApiResult, error_response};
use super::middleware::{UPSTREAM_FLOW_COOKIE, cookie_value};
use crate::error::AuthError;
use crate::oauth::{
    AuthorizationRequest, AuthorizeOutcome, ConsentPrompt, NewClient, TokenRequest,
    UpstreamOutcome,
};
use crate::types::{AuthContext, OauthActionType, OauthClient, PendingAuthorizationId};
use axum::{
    Extension, Form, Json,
    extract::{OriginalUri, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use url::Url;

pub(crate) fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Security headers for the html pages we serve
pub(crate) fn page_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'; style-src 'unsafe-inline'"),
    );
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers
}

fn consent_page(prompt: &ConsentPrompt) -> String {
    let request_id = prompt.request_id.to_string();
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorize Application</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            max-width: 400px;
            margin: 100px auto;
            padding: 20px;
            text-align: center;
        }}
        h1 {{ color: #333; }}
        .client {{
            background: #f5f5f5;
            padding: 10px;
            border-radius: 4px;
            word-break: break-all;
        }}
        .buttons {{ margin-top: 30px; }}
        button {{
            padding: 12px 24px;
            margin: 5px;
            border: none;
            border-radius: 4px;
            cursor: pointer;
            font-size: 16px;
        }}
        .approve {{
            background: #0066cc;
            color: white;
        }}
        .deny {{
            background: #666;
            color: white;
        }}
    </style>
</head>
<body>
    <h1>Authorize Application</h1>
    <p>The following application wants to act on your behalf:</p>
    <div class="client">{}<br><small>{}</small></div>
    <p>It will be able to see your profile (scope: {}).</p>
    <div class="buttons">
        <a href="/oauth/authorize/consent?request_id={}&approve=true">
            <button class="approve">Approve</button>
        </a>
        <a href="/oauth/authorize/consent?request_id={}&approve=false">
            <button class="deny">Deny</button>
        </a>
    </div>
</body>
</html>"#,
        html_escape(&prompt.client_display_name),
        html_escape(prompt.client_app_uri.as_str()),
        prompt.scope.as_str(),
        request_id,
        request_id
    )
}

/// GET /oauth/authorize: guests go to the login page and come back here
pub async fn authorize_handler(
    State(state): State<AppState>,
    Extension(acx): Extension<AuthContext>,
    OriginalUri(uri): OriginalUri,
    Query(req): Query<AuthorizationRequest>,
) -> ApiResult<Response> {
    tracing::info!(
        "authorization request from client_id={}, redirect_uri={}",
        req.client_id,
        req.redirect_uri
    );
    match state.services.oauth.authorize(&acx, &req).await? {
        AuthorizeOutcome::LoginRequired => {
            let return_to = uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/oauth/authorize".to_string());
            let login = format!("/auth/login?return_to={}", urlencoding::encode(&return_to));
            Ok(Redirect::to(&login).into_response())
        }
        AuthorizeOutcome::ConsentRequired(prompt) => {
            Ok((page_headers(), Html(consent_page(&prompt))).into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConsentDecision {
    pub request_id: String,
    pub approve: Option<String>,
}

/// Approve/deny click; redirects back to the client either way
pub async fn consent_handler(
    State(state): State<AppState>,
    Extension(acx): Extension<AuthContext>,
    Query(decision): Query<ConsentDecision>,
) -> ApiResult<Response> {
    let request_id: PendingAuthorizationId = decision
        .request_id
        .parse()
        .map_err(|_| AuthError::InvalidState)?;
    let approved = decision.approve.as_deref() == Some("true");
    let target = state
        .services
        .oauth
        .approve(&acx, request_id, approved)
        .await?;
    Ok(Redirect::to(target.as_str()).into_response())
}

/// client_secret_basic: `Authorization: Basic base64(urlencode(id):urlencode(secret))`
fn basic_client_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let encoded = headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Basic ")?;
    let decoded = String::from_utf8(BASE64.decode(encoded.trim()).ok()?).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    Some((
        urlencoding::decode(id).ok()?.into_owned(),
        urlencoding::decode(secret).ok()?.into_owned(),
    ))
}

fn no_store(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// POST /oauth/token
pub async fn token_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(mut req): Form<TokenRequest>,
) -> ApiResult<Response> {
    tracing::info!("token request: grant_type={}", req.grant_type);
    if let Some((id, secret)) = basic_client_credentials(&headers) {
        req.client_id = Some(id);
        req.client_secret = Some(secret);
    }
    let response = state.services.oauth.exchange(&req).await?;
    Ok(no_store(Json(response).into_response()))
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub token: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// POST /oauth/revoke (RFC 7009)
pub async fn revoke_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(req): Form<RevokeRequest>,
) -> ApiResult<StatusCode> {
    let (client_id, client_secret) = match basic_client_credentials(&headers) {
        Some(credentials) => credentials,
        None => match (req.client_id, req.client_secret) {
            (Some(id), Some(secret)) => (id, secret),
            _ => {
                return Err(ApiError(AuthError::InvalidClient(
                    "missing client credentials".to_string(),
                )));
            }
        },
    };
    state
        .services
        .oauth
        .revoke(&client_id, &client_secret, &req.token)
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct ClientRegistrationRequest {
    pub display_name: String,
    pub app_uri: Url,
    pub callback_uri: Url,
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClientRegistrationResponse {
    #[serde(flatten)]
    pub client: OauthClient,
    pub client_id: String,
    /// shown once, only its hash is kept
    pub client_secret: String,
}

/// POST /oauth/clients
pub async fn register_client_handler(
    State(state): State<AppState>,
    Extension(acx): Extension<AuthContext>,
    Json(req): Json<ClientRegistrationRequest>,
) -> ApiResult<Response> {
    let registered = state
        .services
        .oauth
        .clients()
        .register(
            &acx,
            NewClient {
                display_name: req.display_name,
                app_uri: req.app_uri,
                callback_uri: req.callback_uri,
                key: req.key,
            },
        )
        .await?;
    let response = ClientRegistrationResponse {
        client_id: registered.client.id.to_string(),
        client: registered.client,
        client_secret: registered.secret,
    };
    Ok(no_store(
        (StatusCode::CREATED, Json(response)).into_response(),
    ))
}

/// Auth server metadata (RFC 8414)
#[derive(Debug, Serialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub revocation_endpoint: String,
    pub registration_endpoint: String,
    pub grant_types_supported: Vec<&'static str>,
    pub response_types_supported: Vec<&'static str>,
    pub token_endpoint_auth_methods_supported: Vec<&'static str>,
    pub code_challenge_methods_supported: Vec<&'static str>,
    pub scopes_supported: Vec<&'static str>,
}

pub async fn metadata_handler(State(state): State<AppState>) -> Json<AuthorizationServerMetadata> {
    let base_url = &state.base_url;
    Json(AuthorizationServerMetadata {
        issuer: base_url.clone(),
        authorization_endpoint: format!("{}/oauth/authorize", base_url),
        token_endpoint: format!("{}/oauth/token", base_url),
        revocation_endpoint: format!("{}/oauth/revoke", base_url),
        registration_endpoint: format!("{}/oauth/clients", base_url),
        grant_types_supported: vec!["authorization_code", "implicit"],
        response_types_supported: vec!["code", "token"],
        token_endpoint_auth_methods_supported: vec!["client_secret_post", "client_secret_basic"],
        code_challenge_methods_supported: vec!["S256"],
        scopes_supported: vec!["base"],
    })
}

#[derive(Debug, Deserialize)]
pub struct UpstreamStartQuery {
    pub action: OauthActionType,
}

/// GET /oauth/upstream/start?action=login|link
pub async fn upstream_start_handler(
    State(state): State<AppState>,
    Extension(acx): Extension<AuthContext>,
    Query(query): Query<UpstreamStartQuery>,
) -> ApiResult<Response> {
    let redirect = state.services.upstream.start(&acx, query.action).await?;
    let mut response = Redirect::to(redirect.authorization_uri.as_str()).into_response();
    state.set_upstream_flow_cookie(&mut response, &redirect.binding);
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct UpstreamCallbackQuery {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
}

/// GET /oauth/upstream/callback, where provider C sends the browser back.
/// Only the browser holding the flow cookie from the start step gets through.
pub async fn upstream_callback_handler(
    State(state): State<AppState>,
    Extension(acx): Extension<AuthContext>,
    headers: HeaderMap,
    Query(query): Query<UpstreamCallbackQuery>,
) -> ApiResult<Response> {
    let Some(raw_state) = query.state else {
        return Err(ApiError(AuthError::InvalidState));
    };
    let binding = cookie_value(&headers, UPSTREAM_FLOW_COOKIE);
    if let Some(error) = query.error {
        tracing::info!("upstream flow ended with error: {}", error);
        state
            .services
            .upstream
            .cancel(&raw_state, binding.as_deref())
            .await;
        let mut response = error_response(
            StatusCode::BAD_REQUEST,
            "access_denied",
            Some("The provider did not authorize the request"),
        );
        state.clear_upstream_flow_cookie(&mut response);
        return Ok(response);
    }
    let code = query
        .code
        .ok_or_else(|| AuthError::invalid_request("missing required parameter: code"))?;

    let outcome = state
        .services
        .upstream
        .callback(&acx, &raw_state, binding.as_deref(), &code)
        .await?;
    let mut response = Redirect::to("/users/me").into_response();
    state.clear_upstream_flow_cookie(&mut response);
    if let UpstreamOutcome::LoggedIn { session, .. } = outcome {
        state.set_session_cookie(&mut response, &session);
    }
    Ok(response)
}
