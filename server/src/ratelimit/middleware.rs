//! Axum middleware for rate limiting.
//!
//! Authenticated routes are limited per user and per tenant; both levels are
//! evaluated and a denial at either one rejects the request.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::ratelimit::{RateLimitCategory, RateLimitError};

/// Middleware to rate limit publish calls by user and tenant.
///
/// Requires `AuthUser` in request extensions, so it must run after
/// `require_auth`. Requests without one pass through untouched.
///
/// # Usage
///
/// ```ignore
/// Router::new()
///     .route("/api/events", post(publish_event))
///     .layer(from_fn_with_state(state.clone(), rate_limit_publish))
///     .layer(from_fn_with_state(state.clone(), require_auth))
/// ```
#[tracing::instrument(skip(state, request, next))]
pub async fn rate_limit_publish(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, RateLimitError> {
    let Some(user) = request.extensions().get::<AuthUser>().cloned() else {
        return Ok(next.run(request).await);
    };

    let user_id = user.user_id.to_string();
    let tenant_id = user.tenant_id.to_string();
    debug!(user_id = %user_id, tenant_id = %tenant_id, "Checking publish rate limits");

    state
        .rate_limiter
        .admit_all(&[
            (RateLimitCategory::PublishUser, user_id.as_str()),
            (RateLimitCategory::PublishTenant, tenant_id.as_str()),
        ])
        .await?;

    Ok(next.run(request).await)
}
