//! Authentication Middleware

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::api::AppState;

use super::error::AuthError;
use super::jwt::validate_access_token;

/// Authenticated caller injected into request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
}

impl AuthUser {
    /// Validate a bearer token and extract the caller.
    pub fn from_token(token: &str, secret: &str) -> Result<Self, AuthError> {
        let claims = validate_access_token(token, secret)?;
        Ok(Self {
            user_id: claims.user_id()?,
            tenant_id: claims.tenant_id,
        })
    }
}

/// Extract the bearer token from the `Authorization` header.
///
/// Returns `Ok(None)` when the header is absent.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, AuthError> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
    value
        .strip_prefix("Bearer ")
        .map(|t| Some(t.trim()))
        .ok_or(AuthError::InvalidAuthHeader)
}

/// Middleware to require authentication.
///
/// Extracts the Bearer token from the Authorization header, validates the JWT
/// and injects `AuthUser` into request extensions.
///
/// # Usage
///
/// ```ignore
/// Router::new()
///     .route("/protected", get(handler))
///     .layer(axum::middleware::from_fn_with_state(state, require_auth))
/// ```
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = bearer_token(request.headers())?.ok_or(AuthError::MissingAuthHeader)?;
    let auth_user = AuthUser::from_token(token, &state.config.jwt_secret)?;
    tracing::Span::current()
        .record("tenant_id", tracing::field::display(auth_user.tenant_id))
        .record("user_id", tracing::field::display(auth_user.user_id));

    request.extensions_mut().insert(auth_user);
    Ok(next.run(request).await)
}

/// Extractor for authenticated user in handlers.
///
/// ```ignore
/// async fn protected_handler(auth_user: AuthUser) -> impl IntoResponse {
///     format!("Hello, {}!", auth_user.user_id)
/// }
/// ```
impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .copied()
            .ok_or(AuthError::MissingAuthHeader)
    }
}
