//! HTTP API.

mod binary_cache;

use axum::middleware::from_fn;
use axum::Router;

use crate::middleware::mark_upload_scope;

/// Assembles the API router.
///
/// The full binary-cache surface is additionally mounted under the
/// upload path prefix, where requests are tagged upload-only.
pub fn get_router(upload_prefix: &str) -> Router {
    Router::new()
        .merge(binary_cache::get_router())
        .nest(
            upload_prefix,
            binary_cache::get_router().layer(from_fn(mark_upload_scope)),
        )
}
