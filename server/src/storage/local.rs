//! Local file storage.
//!
//! Layout under the data path:
//!
//! ```text
//! config/cache.key
//! narinfo/{h[0]}/{h[0..2]}/{hash}.narinfo
//! nar/{h[0]}/{h[0..2]}/{hash}.nar[.{ext}]
//! tmp/
//! ```
//!
//! All writes go through `tmp/` and are renamed into place, which is
//! atomic since `tmp/` lives on the same filesystem. `tmp/` is purged
//! when the store is opened.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{self, AsyncRead, AsyncWriteExt};

use super::{ConfigStore, NarInfoStore, NarStore};
use crate::error::{ServerError, ServerResult};
use crate::narinfo::NarInfo;
use magpie::hash::validate_narinfo_hash;
use magpie::nar_url::NarUrl;
use magpie::signing::Keypair;

const CONFIG_DIR: &str = "config";
const NARINFO_DIR: &str = "narinfo";
const NAR_DIR: &str = "nar";
const TMP_DIR: &str = "tmp";

const SECRET_KEY_FILE: &str = "cache.key";

/// Local filesystem store.
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Opens (and if needed initializes) a store at the given path.
    pub async fn new(root: PathBuf) -> ServerResult<Self> {
        for dir in [CONFIG_DIR, NARINFO_DIR, NAR_DIR, TMP_DIR] {
            fs::create_dir_all(root.join(dir)).await.map_err(|e| {
                ServerError::StorageError(anyhow::anyhow!(
                    "Failed to create {} under {}: {}",
                    dir,
                    root.display(),
                    e
                ))
            })?;
        }

        let store = Self { root };
        store.purge_tmp().await?;

        Ok(store)
    }

    /// Removes stale temporary files left behind by a previous run.
    async fn purge_tmp(&self) -> ServerResult<()> {
        let tmp = self.root.join(TMP_DIR);
        let mut entries = fs::read_dir(&tmp)
            .await
            .map_err(ServerError::storage_error)?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(ServerError::storage_error)?
        {
            if let Err(e) = fs::remove_file(entry.path()).await {
                tracing::warn!(
                    "Failed to remove stale temporary file {}: {}",
                    entry.path().display(),
                    e
                );
            }
        }

        Ok(())
    }

    fn secret_key_path(&self) -> PathBuf {
        self.root.join(CONFIG_DIR).join(SECRET_KEY_FILE)
    }

    fn nar_info_path(&self, hash: &str) -> ServerResult<PathBuf> {
        validate_narinfo_hash(hash)?;

        Ok(self
            .root
            .join(NARINFO_DIR)
            .join(&hash[0..1])
            .join(&hash[0..2])
            .join(format!("{}.narinfo", hash)))
    }

    fn nar_path(&self, url: &NarUrl) -> ServerResult<PathBuf> {
        Ok(self.root.join(NAR_DIR).join(url.file_path()?))
    }

    fn tmp_path(&self) -> PathBuf {
        let name = hex::encode(rand::random::<[u8; 16]>());
        self.root.join(TMP_DIR).join(name)
    }

    /// Moves a fully written temporary file into place.
    ///
    /// Fails with `AlreadyExists` when the destination is present. The
    /// engine serializes writers per fingerprint, so the check-then-
    /// rename window is not raced in practice.
    async fn commit(&self, tmp: &Path, dest: &Path) -> ServerResult<()> {
        if path_exists(dest).await? {
            let _ = fs::remove_file(tmp).await;
            return Err(ServerError::AlreadyExists);
        }

        fs::create_dir_all(dest.parent().unwrap())
            .await
            .map_err(ServerError::storage_error)?;

        fs::rename(tmp, dest)
            .await
            .map_err(ServerError::storage_error)?;

        Ok(())
    }
}

async fn path_exists(path: &Path) -> ServerResult<bool> {
    match fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
        Err(e) => Err(ServerError::storage_error(e)),
    }
}

async fn remove_file_idempotent(path: &Path) -> ServerResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Err(ServerError::NotFound),
        Err(e) => Err(ServerError::storage_error(e)),
    }
}

#[async_trait]
impl ConfigStore for LocalStore {
    async fn get_secret_key(&self) -> ServerResult<Keypair> {
        let path = self.secret_key_path();
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Err(ServerError::NotFound),
            Err(e) => return Err(ServerError::storage_error(e)),
        };

        Ok(Keypair::from_str(contents.trim())?)
    }

    async fn put_secret_key(&self, keypair: &Keypair) -> ServerResult<()> {
        let tmp = self.tmp_path();
        fs::write(&tmp, keypair.export_keypair())
            .await
            .map_err(ServerError::storage_error)?;

        self.commit(&tmp, &self.secret_key_path()).await
    }

    async fn delete_secret_key(&self) -> ServerResult<()> {
        remove_file_idempotent(&self.secret_key_path()).await
    }
}

#[async_trait]
impl NarInfoStore for LocalStore {
    async fn has_nar_info(&self, hash: &str) -> ServerResult<bool> {
        path_exists(&self.nar_info_path(hash)?).await
    }

    async fn get_nar_info(&self, hash: &str) -> ServerResult<NarInfo> {
        let path = self.nar_info_path(hash)?;
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Err(ServerError::NotFound),
            Err(e) => return Err(ServerError::storage_error(e)),
        };

        NarInfo::from_str(&contents)
    }

    async fn put_nar_info(&self, hash: &str, nar_info: &NarInfo) -> ServerResult<()> {
        let dest = self.nar_info_path(hash)?;

        let tmp = self.tmp_path();
        fs::write(&tmp, nar_info.to_string())
            .await
            .map_err(ServerError::storage_error)?;

        self.commit(&tmp, &dest).await
    }

    async fn delete_nar_info(&self, hash: &str) -> ServerResult<()> {
        remove_file_idempotent(&self.nar_info_path(hash)?).await
    }

    async fn walk_nar_infos(&self, f: &mut (dyn FnMut(String) + Send)) -> ServerResult<()> {
        // fixed two-level sharding, no recursion needed
        let root = self.root.join(NARINFO_DIR);

        let mut level1 = fs::read_dir(&root)
            .await
            .map_err(ServerError::storage_error)?;
        while let Some(shard1) = level1
            .next_entry()
            .await
            .map_err(ServerError::storage_error)?
        {
            let mut level2 = match fs::read_dir(shard1.path()).await {
                Ok(dir) => dir,
                Err(_) => continue,
            };

            while let Some(shard2) = level2
                .next_entry()
                .await
                .map_err(ServerError::storage_error)?
            {
                let mut files = match fs::read_dir(shard2.path()).await {
                    Ok(dir) => dir,
                    Err(_) => continue,
                };

                while let Some(file) = files
                    .next_entry()
                    .await
                    .map_err(ServerError::storage_error)?
                {
                    let name = file.file_name();
                    let name = name.to_string_lossy();
                    if let Some(hash) = name.strip_suffix(".narinfo") {
                        f(hash.to_string());
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl NarStore for LocalStore {
    async fn has_nar(&self, url: &NarUrl) -> ServerResult<bool> {
        path_exists(&self.nar_path(url)?).await
    }

    async fn get_nar(
        &self,
        url: &NarUrl,
    ) -> ServerResult<(u64, Box<dyn AsyncRead + Unpin + Send>)> {
        let path = self.nar_path(url)?;

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Err(ServerError::NotFound),
            Err(e) => return Err(ServerError::storage_error(e)),
        };

        let size = file
            .metadata()
            .await
            .map_err(ServerError::storage_error)?
            .len();

        Ok((size, Box::new(file)))
    }

    async fn put_nar(
        &self,
        url: &NarUrl,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<u64> {
        let dest = self.nar_path(url)?;
        let tmp = self.tmp_path();

        let mut file = File::create(&tmp)
            .await
            .map_err(ServerError::storage_error)?;

        let written = match io::copy(stream, &mut file).await {
            Ok(written) => written,
            Err(e) => {
                // roll back the partial write
                drop(file);
                let _ = fs::remove_file(&tmp).await;
                return Err(ServerError::storage_error(e));
            }
        };

        if let Err(e) = file.flush().await {
            let _ = fs::remove_file(&tmp).await;
            return Err(ServerError::storage_error(e));
        }
        drop(file);

        self.commit(&tmp, &dest).await?;

        Ok(written)
    }

    async fn delete_nar(&self, url: &NarUrl) -> ServerResult<()> {
        remove_file_idempotent(&self.nar_path(url)?).await
    }
}
