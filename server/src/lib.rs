#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod access;
mod api;
pub mod cache;
pub mod cache_info;
pub mod config;
pub mod database;
pub mod error;
mod middleware;
pub mod narinfo;
pub mod storage;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use anyhow::Result;
use axum::extract::Extension;
use axum::http::Uri;
use axum::Router;
use sea_orm::Database;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use access::{Authenticator, Permissions, TokenFileAuthenticator};
use cache::lock::{CacheLock, InProcessLocker};
use cache::{Cache, CacheOptions};
use config::Config;
use database::migration::{Migrator, MigratorTrait};
use error::{ServerError, ServerResult};
use magpie::signing::PublicKey;
use storage::{ConfigStore, LocalStore, NarInfoStore, NarStore};
use upstream::health::HealthMonitor;
use upstream::{Upstream, UpstreamOptions};

type State = Arc<StateInner>;

/// Global server state.
pub struct StateInner {
    /// The cache engine.
    cache: Cache,

    /// Which mutating methods are permitted.
    permissions: Permissions,

    /// Bearer token validation, when configured.
    authenticator: Option<Arc<dyn Authenticator>>,
}

/// The fallback route.
async fn fallback(_: Uri) -> ServerResult<()> {
    Err(ServerError::NotFound)
}

/// Runs the proxy server until interrupted.
pub async fn run_server(config: Config) -> Result<()> {
    config.validate()?;

    let store = Arc::new(LocalStore::new(config.data_path.clone()).await?);

    let database = Database::connect(config.database_url()).await?;
    Migrator::up(&database, None).await?;

    let public_keys = config
        .upstream_public_keys
        .iter()
        .map(|key| PublicKey::from_str(key))
        .collect::<Result<Vec<_>, _>>()?;

    let mut upstreams = Vec::new();
    for url in &config.upstreams {
        let options = UpstreamOptions {
            public_keys: public_keys.clone(),
            dial_timeout: config.dial_timeout,
            response_header_timeout: config.response_header_timeout,
            index: None,
        };

        upstreams.push(Arc::new(Upstream::new(url, options).await?));
    }

    let shutdown = CancellationToken::new();

    let monitor = Arc::new(HealthMonitor::new(
        upstreams.clone(),
        config.health_check_interval,
    ));
    let monitor_task = monitor.clone().run(shutdown.clone());

    // settle on a stable health snapshot before accepting requests
    let _ = monitor.trigger().await;

    let cache = Cache::new(
        database,
        store.clone() as Arc<dyn ConfigStore>,
        store.clone() as Arc<dyn NarInfoStore>,
        store as Arc<dyn NarStore>,
        upstreams,
        Arc::new(InProcessLocker::new()),
        CacheLock::new(),
        CacheOptions {
            hostname: config.hostname.clone(),
            download_lock_ttl: config.download_lock_ttl,
            cache_lock_ttl: config.cache_lock_ttl,
            upstream_timeout: config.upstream_timeout,
            ignore_touch: config.ignore_touch,
        },
    )
    .await?;

    let authenticator = match &config.auth_token_file {
        Some(path) => {
            Some(Arc::new(TokenFileAuthenticator::load(path).await?) as Arc<dyn Authenticator>)
        }
        None => None,
    };

    let state = Arc::new(StateInner {
        cache,
        permissions: Permissions {
            allow_put: config.allow_put,
            allow_delete: config.allow_delete,
        },
        authenticator,
    });

    let app: Router = api::get_router(&config.upload_prefix)
        .fallback(fallback)
        // middlewares
        .layer(axum::middleware::from_fn(middleware::apply_auth))
        .layer(Extension(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new());

    let listener = TcpListener::bind(&config.listen).await?;
    tracing::info!("Listening on {}...", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down, draining detached work...");
    shutdown.cancel();
    state.cache.close().await;
    let _ = monitor_task.await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
