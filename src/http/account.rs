use super::error::{ApiError, ApiResult};
use super::{AppState, safe_return_path};
use crate::error::AuthError;
use crate::link::LinkedAccount;
use crate::resolver::Credential;
use crate::types::{AuthContext, LinkMethod, Provider, Session, SessionId, User, UserId};
use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub display_name: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user: User,
    pub session: Session,
}

pub async fn register_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Response> {
    let (user, session) = state
        .services
        .identity
        .register(&req.display_name, &req.username, &req.password)
        .await?;
    let mut response = (
        StatusCode::CREATED,
        Json(RegisterResponse {
            user,
            session: session.clone(),
        }),
    )
        .into_response();
    state.set_session_cookie(&mut response, &session);
    Ok(response)
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    /// where a browser goes after logging in
    pub return_to: Option<String>,
}

/// Accepts JSON from api clients and form posts from the login page
fn parse_login(headers: &HeaderMap, body: &[u8]) -> Result<LoginRequest, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let parsed = if content_type.starts_with("application/x-www-form-urlencoded") {
        serde_urlencoded::from_bytes(body).map_err(|e| e.to_string())
    } else {
        serde_json::from_slice(body).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| ApiError(AuthError::invalid_request(format!("malformed login: {}", e))))
}

pub async fn login_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let req = parse_login(&headers, &body)?;
    let session = state
        .services
        .identity
        .login(&req.username, &req.password)
        .await?;

    let mut response = match safe_return_path(req.return_to.as_deref()) {
        Some(path) => Redirect::to(path).into_response(),
        None => Json(&session).into_response(),
    };
    state.set_session_cookie(&mut response, &session);
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct LoginPageQuery {
    pub return_to: Option<String>,
}

/// Bare-bones form for browsers bounced here by `/oauth/authorize`
pub async fn login_page_handler(Query(query): Query<LoginPageQuery>) -> Response {
    let return_to = safe_return_path(query.return_to.as_deref()).unwrap_or("/users/me");
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Sign in</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            max-width: 400px;
            margin: 100px auto;
            padding: 20px;
        }}
        input {{ display: block; width: 100%; margin: 8px 0 16px; padding: 8px; }}
        button {{ padding: 12px 24px; border: none; border-radius: 4px; background: #0066cc; color: white; }}
    </style>
</head>
<body>
    <h1>Sign in</h1>
    <form method="post" action="/auth/login">
        <input type="hidden" name="return_to" value="{}">
        <label>Username <input name="username" autocomplete="username"></label>
        <label>Password <input name="password" type="password" autocomplete="current-password"></label>
        <button type="submit">Sign in</button>
    </form>
</body>
</html>"#,
        super::oauth::html_escape(return_to)
    );
    (super::oauth::page_headers(), Html(html)).into_response()
}

pub async fn logout_handler(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
) -> Response {
    let raw = match &credential {
        Credential::SessionId(raw) | Credential::Bearer(raw) => Some(raw.as_str()),
        Credential::None => None,
    };
    if let Some(id) = raw.and_then(|r| r.parse::<SessionId>().ok()) {
        state.services.identity.logout(id).await;
    }
    let mut response = StatusCode::NO_CONTENT.into_response();
    state.clear_session_cookie(&mut response);
    response
}

#[derive(Debug, Serialize)]
pub struct UserView {
    #[serde(flatten)]
    pub user: User,
    pub linked_accounts: Vec<LinkedAccount>,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub context: AuthContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserView>,
}

async fn user_view(state: &AppState, acx: &AuthContext, user_id: UserId) -> ApiResult<UserView> {
    let user = state.services.identity.get_user(acx, user_id).await?;
    let linked_accounts = state.services.links.linked_accounts(acx, user_id).await?;
    Ok(UserView {
        user,
        linked_accounts,
    })
}

pub async fn me_handler(
    State(state): State<AppState>,
    Extension(acx): Extension<AuthContext>,
) -> ApiResult<Json<MeResponse>> {
    let user = match acx.user_id() {
        Some(user_id) => Some(user_view(&state, &acx, user_id).await?),
        None => None,
    };
    Ok(Json(MeResponse { context: acx, user }))
}

pub async fn get_user_handler(
    State(state): State<AppState>,
    Extension(acx): Extension<AuthContext>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<UserView>> {
    let user_id: UserId = user_id.parse()?;
    Ok(Json(user_view(&state, &acx, user_id).await?))
}

pub async fn delete_user_handler(
    State(state): State<AppState>,
    Extension(acx): Extension<AuthContext>,
    Path(user_id): Path<String>,
) -> ApiResult<StatusCode> {
    let user_id: UserId = user_id.parse()?;
    state.services.identity.delete_user(&acx, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn link_handler(
    State(state): State<AppState>,
    Extension(acx): Extension<AuthContext>,
    Path((user_id, provider)): Path<(String, String)>,
    Json(method): Json<LinkMethod>,
) -> ApiResult<Response> {
    let user_id: UserId = user_id.parse()?;
    let provider: Provider = provider.parse()?;
    let link = state
        .services
        .links
        .link_for(&acx, user_id, provider, method)
        .await?;
    Ok(Json(link).into_response())
}

pub async fn unlink_handler(
    State(state): State<AppState>,
    Extension(acx): Extension<AuthContext>,
    Path((user_id, provider)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let user_id: UserId = user_id.parse()?;
    let provider: Provider = provider.parse()?;
    state
        .services
        .links
        .unlink_for(&acx, user_id, provider)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{SYSTEM_KEY, app, session_cookie};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    fn put_link(user_id: &str, provider: &str, bearer: &str, body: serde_json::Value) -> Request<Body> {
        Request::put(format!("/users/{}/links/{}", user_id, provider))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", bearer))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_sets_cookie_and_me_resolves_it() {
        let app = app().await;
        let (user_id, session_id) = app.register("alice").await;

        let (status, _, me) = app
            .json(
                Request::get("/users/me")
                    .header("cookie", format!("sid={}", session_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["context"]["type"], "user");
        assert_eq!(me["user"]["id"], user_id.as_str());

        let (_, _, guest) = app
            .json(Request::get("/users/me").body(Body::empty()).unwrap())
            .await;
        assert_eq!(guest["context"]["type"], "guest");
        assert!(guest.get("user").is_none());
    }

    #[tokio::test]
    async fn test_form_login_redirects_and_logout_revokes() {
        let app = app().await;
        app.register("alice").await;

        let (status, headers, _) = app
            .send(
                Request::post("/auth/login")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from(
                        "username=alice&password=long+enough&return_to=%2Fusers%2Fme",
                    ))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::SEE_OTHER);
        assert_eq!(headers["location"], "/users/me");
        let session = session_cookie(&headers).unwrap();

        let (status, _, _) = app
            .send(
                Request::post("/auth/logout")
                    .header("authorization", format!("Bearer {}", session))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, _, me) = app
            .json(
                Request::get("/users/me")
                    .header("authorization", format!("Bearer {}", session))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(me["context"]["type"], "guest");
    }

    #[tokio::test]
    async fn test_wrong_password_is_401() {
        let app = app().await;
        app.register("alice").await;
        let (status, _, body) = app
            .json(
                Request::post("/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"username": "alice", "password": "nope nope"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_credentials");
    }

    #[tokio::test]
    async fn test_link_conflict_over_http() {
        let app = app().await;
        let (alice, alice_session) = app.register("alice").await;
        let (bob, bob_session) = app.register("bob").await;
        let credentials = json!({"method": "credentials", "login": "alice", "password": "pw1"});

        let (status, _, link) = app
            .json(put_link(&alice, "a", &alice_session, credentials.clone()))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(link["external_id"], "42");

        let (status, _, body) = app
            .json(put_link(&bob, "a", &bob_session, credentials))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "link_conflict");

        let (_, _, me) = app
            .json(
                Request::get(format!("/users/{}", alice))
                    .header("authorization", format!("Bearer {}", alice_session))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(me["linked_accounts"][0]["user"]["username"], "alice");
    }

    #[tokio::test]
    async fn test_ref_links_need_the_system_key() {
        let app = app().await;
        let (alice, alice_session) = app.register("alice").await;
        let by_ref = json!({"method": "ref", "external_id": "1234567890"});

        let (status, _, _) = app
            .json(put_link(&alice, "c", &alice_session, by_ref.clone()))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = app.json(put_link(&alice, "c", SYSTEM_KEY, by_ref)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = app
            .send(
                Request::delete(format!("/users/{}/links/c", alice))
                    .header("authorization", format!("Bearer {}", alice_session))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_provider_outage_is_503() {
        let app = app().await;
        let (alice, session) = app.register("alice").await;
        app.provider_a.set_offline(true);
        let (status, _, body) = app
            .json(put_link(
                &alice,
                "a",
                &session,
                json!({"method": "credentials", "login": "alice", "password": "pw1"}),
            ))
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "temporarily_unavailable");
    }

    #[tokio::test]
    async fn test_malformed_ids_and_deletion() {
        let app = app().await;
        let (alice, session) = app.register("alice").await;

        let (status, _, _) = app
            .send(
                Request::get("/users/NOT-A-UUID")
                    .header("authorization", format!("Bearer {}", session))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = app
            .send(
                Request::delete(format!("/users/{}", alice))
                    .header("authorization", format!("Bearer {}", session))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        // the session died with the user
        let (_, _, me) = app
            .json(
                Request::get("/users/me")
                    .header("authorization", format!("Bearer {}", session))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(me["context"]["type"], "guest");
    }
}
