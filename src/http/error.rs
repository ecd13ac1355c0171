use crate::error::AuthError;
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

/// OAuth 2.0 style error body, used for every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

pub fn error_response(status: StatusCode, error: &str, description: Option<&str>) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
        error_description: description.map(|s| s.to_string()),
    };
    (status, Json(body)).into_response()
}

/// Wraps [`AuthError`] so handlers can `?` straight into a response
#[derive(Debug)]
pub struct ApiError(pub AuthError);

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            AuthError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "invalid_credentials"),
            AuthError::LinkConflict { .. } => (StatusCode::CONFLICT, "link_conflict"),
            AuthError::NotLinked(_) => (StatusCode::NOT_FOUND, "not_linked"),
            AuthError::ExternalUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "temporarily_unavailable")
            }
            AuthError::InvalidState | AuthError::ExpiredState => {
                (StatusCode::BAD_REQUEST, "invalid_grant")
            }
            AuthError::InvalidClient(_) => (StatusCode::UNAUTHORIZED, "invalid_client"),
            AuthError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AuthError::Unauthorized => (StatusCode::UNAUTHORIZED, "access_denied"),
            AuthError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            AuthError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.parts();
        // internals and upstream details stay in the logs
        let description = match &self.0 {
            AuthError::Internal(detail) => {
                tracing::error!("internal error: {}", detail);
                "Internal server error".to_string()
            }
            AuthError::ExternalUnavailable(_) => "An external service is unavailable".to_string(),
            other => other.to_string(),
        };
        let mut response = error_response(status, error, Some(&description));
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer realm=\"twinlink\""),
            );
        }
        response
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provider;

    #[test]
    fn test_status_mapping() {
        let status = |e: AuthError| ApiError(e).into_response().status();
        assert_eq!(status(AuthError::InvalidState), StatusCode::BAD_REQUEST);
        assert_eq!(status(AuthError::ExpiredState), StatusCode::BAD_REQUEST);
        assert_eq!(status(AuthError::NotLinked(Provider::C)), StatusCode::NOT_FOUND);
        assert_eq!(
            status(AuthError::ExternalUnavailable("a timed out".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(AuthError::Internal("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_unauthorized_carries_challenge() {
        let response = ApiError(AuthError::Unauthorized).into_response();
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }
}
