//! The cache engine.
//!
//! The engine owns the storage facade, the metadata index, the ranked
//! upstreams, and the download coordinator, and implements the
//! operations behind the binary-cache HTTP surface. It is reentrant:
//! there is no global lock on the hot path, and serialization happens
//! per artifact fingerprint.
//!
//! A fetch of an artifact that is missing locally walks the healthy
//! upstreams in ascending priority order under the artifact's download
//! lease, and (for NARs) streams the upstream body to the requesting
//! client and into local storage simultaneously through the tee
//! pipeline in [`tee`].
//!
//! Detached work (ingest persistence after a client disconnect, the
//! stale-narinfo guard) runs on a supervised task tracker that
//! [`Cache::close`] drains on shutdown so no write is orphaned.

pub mod lock;
pub mod tee;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use sea_orm::DatabaseConnection;
use tokio::io::AsyncRead;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use crate::database::MetadataIndex;
use crate::error::{ServerError, ServerResult};
use crate::narinfo::NarInfo;
use crate::storage::{ConfigStore, NarInfoStore, NarStore};
use crate::upstream::Upstream;
use lock::{nar_fingerprint, nar_info_fingerprint, CacheLock, DownloadLocker};
use magpie::hash::validate_narinfo_hash;
use magpie::nar_url::NarUrl;
use magpie::signing::{verifies_against, Keypair};

/// Default TTL of a per-fingerprint download lease.
pub const DEFAULT_DOWNLOAD_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

/// Default TTL of the process-wide cache lock.
pub const DEFAULT_CACHE_LOCK_TTL: Duration = Duration::from_secs(60);

/// Default budget for a detached ingest.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Engine construction options.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Hostname this cache signs narinfo under.
    pub hostname: String,

    /// TTL of a per-fingerprint download lease.
    pub download_lock_ttl: Duration,

    /// TTL of the cache lock, for implementations that lease it.
    pub cache_lock_ttl: Duration,

    /// Budget for a detached ingest, derived timeouts included.
    pub upstream_timeout: Duration,

    /// Floor below which metadata reads do not re-touch a record.
    pub ignore_touch: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            download_lock_ttl: DEFAULT_DOWNLOAD_LOCK_TTL,
            cache_lock_ttl: DEFAULT_CACHE_LOCK_TTL,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            ignore_touch: Duration::from_secs(60 * 60),
        }
    }
}

/// A NAR ready to be served.
pub struct NarStream {
    /// Size in bytes when known. `None` means the NAR is being
    /// streamed from an upstream as we serve it and the final size is
    /// only known once the reader is drained.
    pub size: Option<u64>,

    /// The (possibly compressed) NAR bytes.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

/// The cache engine.
pub struct Cache {
    keypair: Keypair,
    database: DatabaseConnection,
    nar_info_store: Arc<dyn NarInfoStore>,
    nar_store: Arc<dyn NarStore>,
    upstreams: Vec<Arc<Upstream>>,
    download_locker: Arc<dyn DownloadLocker>,
    cache_lock: CacheLock,
    options: CacheOptions,
    tasks: TaskTracker,
}

impl Cache {
    /// Constructs the engine, loading or generating the signing key.
    ///
    /// The key is generated on the very first boot, persisted once and
    /// never overwritten; losing a persist race against another
    /// process means adopting the winner's key. A key that can neither
    /// be loaded nor generated aborts startup.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        database: DatabaseConnection,
        config_store: Arc<dyn ConfigStore>,
        nar_info_store: Arc<dyn NarInfoStore>,
        nar_store: Arc<dyn NarStore>,
        upstreams: Vec<Arc<Upstream>>,
        download_locker: Arc<dyn DownloadLocker>,
        cache_lock: CacheLock,
        options: CacheOptions,
    ) -> ServerResult<Self> {
        let keypair = match config_store.get_secret_key().await {
            Ok(keypair) => keypair,
            Err(ServerError::NotFound) => {
                tracing::info!("Generating signing key for {}", options.hostname);
                let keypair = Keypair::generate(&options.hostname)?;

                match config_store.put_secret_key(&keypair).await {
                    Ok(()) => keypair,
                    Err(ServerError::AlreadyExists) => {
                        // another instance won the race; adopt its key
                        config_store.get_secret_key().await?
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            keypair,
            database,
            nar_info_store,
            nar_store,
            upstreams,
            download_locker,
            cache_lock,
            options,
            tasks: TaskTracker::new(),
        })
    }

    /// Returns the public key of this cache in canonical form.
    pub fn public_key(&self) -> String {
        self.keypair.export_public_key()
    }

    /// Waits for all detached work to finish.
    pub async fn close(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Retrieves a narinfo, pulling it from an upstream on a local miss.
    #[instrument(skip_all, fields(hash))]
    pub async fn get_nar_info(&self, hash: &str, upload_only: bool) -> ServerResult<NarInfo> {
        validate_narinfo_hash(hash)?;

        let _cache_read = self.cache_lock.read().await;

        if let Some(nar_info) = self.local_nar_info(hash).await? {
            return Ok(nar_info);
        }

        if upload_only {
            return Err(ServerError::NotFound);
        }

        let _lease = self
            .download_locker
            .lock(&nar_info_fingerprint(hash), self.options.download_lock_ttl)
            .await;

        // double-checked: the previous lease holder may have ingested it
        if let Some(nar_info) = self.local_nar_info(hash).await? {
            return Ok(nar_info);
        }

        for upstream in self.healthy_upstreams() {
            match upstream.get_nar_info(hash).await {
                Ok(nar_info) => {
                    return self.ingest_nar_info(hash, nar_info, &upstream).await;
                }
                Err(ServerError::NotFound) => {
                    tracing::debug!("{} does not have {}.narinfo", upstream.get_hostname(), hash);
                }
                Err(e) => {
                    tracing::warn!(
                        "Fetching {}.narinfo from {} failed: {}",
                        hash,
                        upstream.get_hostname(),
                        e
                    );
                }
            }
        }

        Err(ServerError::NotFound)
    }

    /// Stores an uploaded narinfo.
    ///
    /// The referenced NAR is only stat-probed; an upload must never
    /// start a streaming pipeline. A narinfo whose NAR is not stored
    /// yet is accepted, and the retrievability guard is left to clean
    /// up should the NAR never arrive.
    #[instrument(skip_all, fields(hash))]
    pub async fn put_nar_info(&self, hash: &str, body: &str) -> ServerResult<()> {
        validate_narinfo_hash(hash)?;

        let _cache_read = self.cache_lock.read().await;

        let mut nar_info = NarInfo::from_str(body)?;
        nar_info.check()?;
        nar_info.url = nar_info.url.normalize()?;

        let nar_present = self.nar_store.has_nar(&nar_info.url).await?;

        nar_info.sign(&self.keypair);

        match self.nar_info_store.put_nar_info(hash, &nar_info).await {
            Ok(()) => {}
            Err(ServerError::AlreadyExists) => {
                // re-upload replaces the stored document
                self.nar_info_store.delete_nar_info(hash).await?;
                self.nar_info_store.put_nar_info(hash, &nar_info).await?;
            }
            Err(e) => return Err(e),
        }

        self.database.upsert_nar_info(hash, &nar_info).await?;

        if !nar_present {
            tracing::warn!(
                "narinfo {} references nar/{} which is not stored yet",
                hash,
                nar_info.url.hash
            );
            self.spawn_check_and_fix(hash, nar_info.url.clone());
        }

        Ok(())
    }

    /// Deletes a narinfo and its metadata record.
    #[instrument(skip_all, fields(hash))]
    pub async fn delete_nar_info(&self, hash: &str) -> ServerResult<()> {
        validate_narinfo_hash(hash)?;

        let _cache_read = self.cache_lock.read().await;

        self.nar_info_store.delete_nar_info(hash).await?;
        self.database.delete_nar_info_by_hash(hash).await?;

        Ok(())
    }

    /// Retrieves a NAR, streaming it from an upstream on a local miss.
    #[instrument(skip_all, fields(hash = %nar_url.hash))]
    pub async fn get_nar(&self, nar_url: &NarUrl, upload_only: bool) -> ServerResult<NarStream> {
        let url = nar_url.normalize()?;

        let _cache_read = self.cache_lock.read().await;

        match self.nar_store.get_nar(&url).await {
            Ok((size, reader)) => {
                self.touch_by_nar_hash(&url.hash);
                return Ok(NarStream {
                    size: Some(size),
                    reader,
                });
            }
            Err(ServerError::NotFound) => {}
            Err(e) => return Err(e),
        }

        if upload_only {
            return Err(ServerError::NotFound);
        }

        let lease = self
            .download_locker
            .lock(&nar_fingerprint(&url.hash), self.options.download_lock_ttl)
            .await;

        // double-checked: the previous lease holder may have ingested it
        match self.nar_store.get_nar(&url).await {
            Ok((size, reader)) => {
                return Ok(NarStream {
                    size: Some(size),
                    reader,
                });
            }
            Err(ServerError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let mut download = None;
        for upstream in self.healthy_upstreams() {
            match upstream.get_nar(&url, HeaderMap::new()).await {
                Ok(d) => {
                    tracing::info!(
                        "Streaming nar/{} from {}",
                        url.hash,
                        upstream.get_hostname()
                    );
                    download = Some(d);
                    break;
                }
                Err(ServerError::NotFound) => {
                    tracing::debug!("{} does not have nar/{}", upstream.get_hostname(), url.hash);
                }
                Err(e) => {
                    tracing::warn!(
                        "Fetching nar/{} from {} failed: {}",
                        url.hash,
                        upstream.get_hostname(),
                        e
                    );
                }
            }
        }

        let Some(download) = download else {
            return Err(ServerError::NotFound);
        };

        let (store_tx, store_rx) = tee::channel();
        let (client_tx, client_rx) = tee::channel();

        // The ingest owns the lease and runs detached from the request:
        // a client hanging up must not abort persistence. The fresh
        // deadline bounds stuck transfers; the lease TTL would reclaim
        // the fingerprint anyway.
        let nar_store = self.nar_store.clone();
        let deadline = self.options.upstream_timeout;
        let ingest_url = url.clone();
        self.tasks.spawn(async move {
            let _lease = lease;

            let ingest = async {
                let mut store_reader = tee::reader(store_rx);

                let (put, pumped) = tokio::join!(
                    nar_store.put_nar(&ingest_url, &mut store_reader),
                    tee::pump(download.stream, store_tx, client_tx),
                );

                match (put, pumped) {
                    (Ok(written), Ok(_)) => {
                        tracing::info!("Ingested nar/{} ({} bytes)", ingest_url.hash, written);
                    }
                    (Err(ServerError::AlreadyExists), _) => {
                        tracing::debug!("nar/{} was ingested concurrently", ingest_url.hash);
                    }
                    (put, pumped) => {
                        tracing::warn!(
                            "Ingest of nar/{} failed: put: {:?}, pump: {:?}",
                            ingest_url.hash,
                            put.err(),
                            pumped.err()
                        );
                    }
                }
            };

            if tokio::time::timeout(deadline, ingest).await.is_err() {
                tracing::warn!("Ingest of nar/{} timed out", ingest_url.hash);
            }
        });

        Ok(NarStream {
            size: download.size,
            reader: Box::new(tee::reader(client_rx)),
        })
    }

    /// Stores an uploaded NAR.
    ///
    /// Holding the download lease coalesces the upload with any
    /// concurrent ingest of the same artifact.
    #[instrument(skip_all, fields(hash = %nar_url.hash))]
    pub async fn put_nar(
        &self,
        nar_url: &NarUrl,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<()> {
        let url = nar_url.normalize()?;

        let _cache_read = self.cache_lock.read().await;

        let _lease = self
            .download_locker
            .lock(&nar_fingerprint(&url.hash), self.options.download_lock_ttl)
            .await;

        if self.nar_store.has_nar(&url).await? {
            return Ok(());
        }

        match self.nar_store.put_nar(&url, body).await {
            Ok(written) => {
                tracing::info!("Stored uploaded nar/{} ({} bytes)", url.hash, written);
                Ok(())
            }
            Err(ServerError::AlreadyExists) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Deletes a NAR.
    #[instrument(skip_all, fields(hash = %nar_url.hash))]
    pub async fn delete_nar(&self, nar_url: &NarUrl) -> ServerResult<()> {
        let url = nar_url.normalize()?;

        let _cache_read = self.cache_lock.read().await;

        self.nar_store.delete_nar(&url).await
    }

    /// Answers a HEAD request from the metadata index alone.
    ///
    /// A miss is `NotFound`; the caller may fall back to
    /// [`Cache::get_nar`] and drain the reader.
    #[instrument(skip_all, fields(hash = %nar_url.hash))]
    pub async fn get_nar_file_size(&self, nar_url: &NarUrl) -> ServerResult<u64> {
        let url = nar_url.normalize()?;

        match self
            .database
            .find_file_size_and_hash_by_nar_hash(&url.hash)
            .await?
        {
            Some((size, _)) => Ok(size),
            None => Err(ServerError::NotFound),
        }
    }

    /// Retrieves a locally stored narinfo.
    ///
    /// A hit bumps the metadata record and schedules the
    /// retrievability guard; the `URL` field is normalized before the
    /// document leaves the engine.
    async fn local_nar_info(&self, hash: &str) -> ServerResult<Option<NarInfo>> {
        match self.nar_info_store.get_nar_info(hash).await {
            Ok(mut nar_info) => {
                nar_info.url = nar_info.url.normalize()?;

                self.touch(hash);
                self.spawn_check_and_fix(hash, nar_info.url.clone());

                Ok(Some(nar_info))
            }
            Err(ServerError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persists a narinfo fetched from an upstream.
    ///
    /// Signatures that do not verify against the upstream's configured
    /// keys are dropped; the surviving ones are preserved and our own
    /// signature is appended.
    async fn ingest_nar_info(
        &self,
        hash: &str,
        mut nar_info: NarInfo,
        upstream: &Arc<Upstream>,
    ) -> ServerResult<NarInfo> {
        if !upstream.public_keys().is_empty() {
            let fingerprint = nar_info.fingerprint();
            nar_info
                .signatures
                .retain(|sig| verifies_against(sig, &fingerprint, upstream.public_keys()));
        }

        nar_info.url = nar_info.url.normalize()?;
        nar_info.sign(&self.keypair);

        match self.nar_info_store.put_nar_info(hash, &nar_info).await {
            Ok(()) => {}
            Err(ServerError::AlreadyExists) => {
                tracing::debug!("narinfo {} was ingested concurrently", hash);
            }
            Err(e) => return Err(e),
        }

        self.database.upsert_nar_info(hash, &nar_info).await?;

        tracing::info!(
            "Ingested {}.narinfo from {}",
            hash,
            upstream.get_hostname()
        );

        Ok(nar_info)
    }

    /// Returns the healthy upstreams in ascending priority order.
    fn healthy_upstreams(&self) -> Vec<Arc<Upstream>> {
        let mut healthy: Vec<_> = self
            .upstreams
            .iter()
            .filter(|u| u.is_healthy())
            .cloned()
            .collect();

        healthy.sort_by_key(|u| u.get_priority());
        healthy
    }

    fn touch(&self, hash: &str) {
        let database = self.database.clone();
        let ignore_touch = self.options.ignore_touch;
        let hash = hash.to_string();

        self.tasks.spawn(async move {
            if let Err(e) = database.touch_last_accessed(&hash, ignore_touch).await {
                tracing::warn!("Failed to touch metadata for {}: {}", hash, e);
            }
        });
    }

    fn touch_by_nar_hash(&self, nar_hash: &str) {
        let database = self.database.clone();
        let ignore_touch = self.options.ignore_touch;
        let nar_hash = nar_hash.to_string();

        self.tasks.spawn(async move {
            if let Err(e) = database
                .touch_last_accessed_by_nar_hash(&nar_hash, ignore_touch)
                .await
            {
                tracing::warn!("Failed to touch metadata for nar/{}: {}", nar_hash, e);
            }
        });
    }

    /// Schedules the retrievability guard for a narinfo.
    ///
    /// Invariant: a narinfo is only kept if its NAR is retrievable
    /// locally or from at least one healthy upstream. The check runs
    /// detached so it survives the request that scheduled it.
    fn spawn_check_and_fix(&self, hash: &str, url: NarUrl) {
        let nar_store = self.nar_store.clone();
        let nar_info_store = self.nar_info_store.clone();
        let database = self.database.clone();
        let upstreams = self.upstreams.clone();
        let hash = hash.to_string();

        self.tasks.spawn(async move {
            if let Err(e) =
                check_and_fix_nar_info(nar_store, nar_info_store, database, upstreams, &hash, &url)
                    .await
            {
                tracing::warn!("Retrievability check for {} failed: {}", hash, e);
            }
        });
    }
}

/// Deletes a narinfo whose NAR is neither stored locally nor held by
/// any healthy upstream.
async fn check_and_fix_nar_info(
    nar_store: Arc<dyn NarStore>,
    nar_info_store: Arc<dyn NarInfoStore>,
    database: DatabaseConnection,
    upstreams: Vec<Arc<Upstream>>,
    hash: &str,
    url: &NarUrl,
) -> ServerResult<()> {
    if nar_store.has_nar(url).await? {
        return Ok(());
    }

    for upstream in upstreams.iter().filter(|u| u.is_healthy()) {
        match upstream.has_nar(url).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(
                    "Probing nar/{} on {} failed: {}",
                    url.hash,
                    upstream.get_hostname(),
                    e
                );
            }
        }
    }

    tracing::warn!(
        "Purging {}.narinfo: nar/{} is not retrievable anywhere",
        hash,
        url.hash
    );

    match nar_info_store.delete_nar_info(hash).await {
        Ok(()) | Err(ServerError::NotFound) => {}
        Err(e) => return Err(e),
    }
    database.delete_nar_info_by_hash(hash).await?;

    Ok(())
}
