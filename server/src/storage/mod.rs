//! Artifact storage.
//!
//! The engine consumes three narrow capabilities: the signing key
//! (config), narinfo documents keyed by hash, and NAR archives keyed
//! by their relative URL. Implementations are interchangeable; the
//! local filesystem backend ships here, an S3 backend plugs in behind
//! the same traits.
//!
//! Contracts every implementation must honor:
//!
//! - `put` is atomic: bytes are written under a temporary name and
//!   renamed into place, so partial writes are never observable.
//! - `put` of an existing artifact returns [`ServerError::AlreadyExists`].
//! - `delete` is idempotent; [`ServerError::NotFound`] is the only
//!   non-success outcome.
//! - Temporary write areas are purged on start.

mod local;

use std::fmt;

use tokio::io::AsyncRead;

use crate::error::ServerResult;
use crate::narinfo::NarInfo;
use magpie::nar_url::NarUrl;
use magpie::signing::Keypair;

pub use self::local::LocalStore;

/// Store for server-global configuration, holding the signing key.
#[async_trait::async_trait]
pub trait ConfigStore: Send + Sync + fmt::Debug {
    /// Retrieves the signing keypair.
    async fn get_secret_key(&self) -> ServerResult<Keypair>;

    /// Persists the signing keypair.
    ///
    /// Fails with `AlreadyExists` when a key is already present; an
    /// existing key is never overwritten.
    async fn put_secret_key(&self, keypair: &Keypair) -> ServerResult<()>;

    /// Removes the signing keypair.
    async fn delete_secret_key(&self) -> ServerResult<()>;
}

/// Store for narinfo documents, keyed by the narinfo hash.
#[async_trait::async_trait]
pub trait NarInfoStore: Send + Sync + fmt::Debug {
    /// Tests whether a narinfo exists.
    async fn has_nar_info(&self, hash: &str) -> ServerResult<bool>;

    /// Retrieves a narinfo.
    async fn get_nar_info(&self, hash: &str) -> ServerResult<NarInfo>;

    /// Stores a narinfo.
    async fn put_nar_info(&self, hash: &str, nar_info: &NarInfo) -> ServerResult<()>;

    /// Deletes a narinfo.
    async fn delete_nar_info(&self, hash: &str) -> ServerResult<()>;

    /// Invokes the callback once for every stored narinfo hash.
    ///
    /// Order is unspecified.
    async fn walk_nar_infos(&self, f: &mut (dyn FnMut(String) + Send)) -> ServerResult<()>;
}

/// Store for NAR archives, keyed by their relative URL.
#[async_trait::async_trait]
pub trait NarStore: Send + Sync + fmt::Debug {
    /// Tests whether a NAR exists.
    ///
    /// This is a stat-style probe; no bytes are read.
    async fn has_nar(&self, url: &NarUrl) -> ServerResult<bool>;

    /// Retrieves a NAR, returning its size and a reader over its bytes.
    async fn get_nar(
        &self,
        url: &NarUrl,
    ) -> ServerResult<(u64, Box<dyn AsyncRead + Unpin + Send>)>;

    /// Stores a NAR from a stream, returning the number of bytes written.
    async fn put_nar(
        &self,
        url: &NarUrl,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<u64>;

    /// Deletes a NAR.
    async fn delete_nar(&self, url: &NarUrl) -> ServerResult<()>;
}
