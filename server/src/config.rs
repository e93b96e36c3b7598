//! Server configuration.
//!
//! The `serve` flag set is the configuration surface; every flag has
//! an equivalent environment variable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;

/// Configuration for the proxy server.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Hostname narinfo signatures are issued under.
    ///
    /// The signing key generated on first boot is named after it.
    #[clap(long, env = "MAGPIE_HOSTNAME")]
    pub hostname: String,

    /// Directory artifacts are stored under.
    #[clap(long, env = "MAGPIE_DATA_PATH")]
    pub data_path: PathBuf,

    /// Socket address to listen on.
    #[clap(long, env = "MAGPIE_LISTEN", default_value = "[::]:8501")]
    pub listen: SocketAddr,

    /// Upstream cache URL, in ascending order of preference unless the
    /// upstream advertises otherwise. Can be passed multiple times.
    ///
    /// A `priority` query parameter overrides the advertised priority;
    /// `priority=0` keeps the advertised one.
    #[clap(long = "upstream", env = "MAGPIE_UPSTREAMS", value_delimiter = ',')]
    pub upstreams: Vec<String>,

    /// Public key upstreams sign narinfo with, in canonical
    /// `name:base64` form. Can be passed multiple times. When any are
    /// configured, unverifiable upstream signatures are dropped.
    #[clap(
        long = "upstream-public-key",
        env = "MAGPIE_UPSTREAM_PUBLIC_KEYS",
        value_delimiter = ','
    )]
    pub upstream_public_keys: Vec<String>,

    /// Permits PUT of narinfo and NAR files.
    #[clap(long, env = "MAGPIE_ALLOW_PUT")]
    pub allow_put: bool,

    /// Permits DELETE of narinfo and NAR files.
    #[clap(long, env = "MAGPIE_ALLOW_DELETE")]
    pub allow_delete: bool,

    /// File listing accepted bearer tokens, one per line.
    ///
    /// When configured, mutating methods require a valid token.
    #[clap(long, env = "MAGPIE_AUTH_TOKEN_FILE")]
    pub auth_token_file: Option<PathBuf>,

    /// Path prefix whose requests never fall through to upstreams.
    #[clap(long, env = "MAGPIE_UPLOAD_PREFIX", default_value = "/upload")]
    pub upload_prefix: String,

    /// Database URL.
    ///
    /// Defaults to a SQLite database under the data path.
    #[clap(long, env = "MAGPIE_DATABASE_URL")]
    pub database_url: Option<String>,

    /// TTL of a per-artifact download lease.
    #[clap(
        long,
        env = "MAGPIE_DOWNLOAD_LOCK_TTL",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    pub download_lock_ttl: Duration,

    /// TTL of the cache-wide lock.
    #[clap(
        long,
        env = "MAGPIE_CACHE_LOCK_TTL",
        default_value = "1m",
        value_parser = humantime::parse_duration
    )]
    pub cache_lock_ttl: Duration,

    /// Budget for a detached ingest.
    #[clap(
        long,
        env = "MAGPIE_UPSTREAM_TIMEOUT",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    pub upstream_timeout: Duration,

    /// Floor below which reads do not re-touch a metadata record.
    #[clap(
        long,
        env = "MAGPIE_IGNORE_TOUCH",
        default_value = "1h",
        value_parser = humantime::parse_duration
    )]
    pub ignore_touch: Duration,

    /// Interval between upstream health check passes.
    #[clap(
        long,
        env = "MAGPIE_HEALTH_CHECK_INTERVAL",
        default_value = "1m",
        value_parser = humantime::parse_duration
    )]
    pub health_check_interval: Duration,

    /// Timeout for establishing an upstream connection.
    #[clap(
        long,
        env = "MAGPIE_DIAL_TIMEOUT",
        default_value = "3s",
        value_parser = humantime::parse_duration
    )]
    pub dial_timeout: Duration,

    /// Timeout for receiving upstream response headers.
    #[clap(
        long,
        env = "MAGPIE_RESPONSE_HEADER_TIMEOUT",
        default_value = "3s",
        value_parser = humantime::parse_duration
    )]
    pub response_header_timeout: Duration,
}

impl Config {
    /// Validates constraints clap cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() || self.hostname.contains(':') {
            bail!("hostname must be non-empty and must not contain colons");
        }

        if !self.upload_prefix.starts_with('/') || self.upload_prefix == "/" {
            bail!("upload prefix must be a non-root path starting with a slash");
        }

        Ok(())
    }

    /// Returns the effective database URL.
    pub fn database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!(
                "sqlite://{}?mode=rwc",
                self.data_path.join("magpie.db").display()
            ),
        }
    }
}
