//! Request middlewares.

use axum::extract::{Extension, Request};
use axum::http::header::AUTHORIZATION;
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::{ServerError, ServerResult};
use crate::State;

/// Marker attached to requests arriving through the upload prefix.
///
/// The engine short-circuits upstream fetches for marked requests, so
/// a client pushing artifacts cannot accidentally pull them.
#[derive(Debug, Clone, Copy)]
pub struct UploadScope;

/// Tags a request as upload-only.
///
/// Layered onto the routes nested under the upload path prefix.
pub async fn mark_upload_scope(mut req: Request, next: Next) -> Response {
    req.extensions_mut().insert(UploadScope);
    next.run(req).await
}

/// Enforces bearer authentication on mutating methods.
///
/// A no-op unless an authenticator is configured.
pub async fn apply_auth(
    Extension(state): Extension<State>,
    req: Request,
    next: Next,
) -> ServerResult<Response> {
    if req.method() == Method::PUT || req.method() == Method::DELETE {
        if let Some(authenticator) = &state.authenticator {
            let authorized = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(|token| authenticator.validate(token))
                .unwrap_or(false);

            if !authorized {
                return Err(ServerError::Unauthorized);
            }
        }
    }

    Ok(next.run(req).await)
}
