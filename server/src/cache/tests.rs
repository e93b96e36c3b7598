use super::*;

use sea_orm::Database;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use crate::database::migration::{Migrator, MigratorTrait};
use crate::storage::{ConfigStore, LocalStore, NarInfoStore as _, NarStore as _};
use crate::testing::MockUpstream;
use crate::upstream::UpstreamOptions;
use lock::InProcessLocker;
use magpie::signing::{verify_first, PublicKey};

const NARINFO_HASH: &str = "p4pclmv1gyja5kzc26npqpia1qqxrf0l";
const NAR_HASH: &str = "1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3";
const OTHER_NARINFO_HASH: &str = "0d71ygfwbmy1xjlbj1v027dfmy9cqav1";
const OTHER_NAR_HASH: &str = "2w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3";

struct Harness {
    cache: Cache,
    store: Arc<LocalStore>,
    _dir: TempDir,
}

// a file-backed database: in-memory SQLite does not survive the
// connection pool
async fn connect_db(dir: &TempDir) -> sea_orm::DatabaseConnection {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());

    let database = Database::connect(&url).await.unwrap();
    Migrator::up(&database, None).await.unwrap();

    database
}

async fn harness(upstreams: Vec<Arc<Upstream>>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::new(dir.path().to_path_buf()).await.unwrap());

    let database = connect_db(&dir).await;

    let cache = Cache::new(
        database,
        store.clone() as Arc<dyn ConfigStore>,
        store.clone() as Arc<dyn crate::storage::NarInfoStore>,
        store.clone() as Arc<dyn crate::storage::NarStore>,
        upstreams,
        Arc::new(InProcessLocker::new()),
        lock::CacheLock::new(),
        CacheOptions {
            hostname: "proxy.test".to_string(),
            ignore_touch: Duration::ZERO,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    Harness {
        cache,
        store,
        _dir: dir,
    }
}

async fn upstream_for(mock: &MockUpstream, public_keys: Vec<PublicKey>) -> Arc<Upstream> {
    let options = UpstreamOptions {
        public_keys,
        ..Default::default()
    };

    Arc::new(Upstream::new(mock.url(), options).await.unwrap())
}

fn nar_info_document(url: &str, signer: Option<&Keypair>) -> String {
    let mut nar_info = NarInfo::from_str(&format!(
        "StorePath: /nix/store/{NARINFO_HASH}-sample-1.0\n\
         URL: {url}\n\
         FileHash: sha256:{NAR_HASH}\n\
         FileSize: 4029176\n\
         NarHash: sha256:1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h\n\
         NarSize: 18735072\n\
         References: \n"
    ))
    .unwrap();

    if let Some(keypair) = signer {
        nar_info.sign(keypair);
    }

    nar_info.to_string()
}

async fn read_all(mut reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>) -> Vec<u8> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await.unwrap();
    bytes
}

#[tokio::test]
async fn test_signing_key_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let key_a = {
        let store = Arc::new(LocalStore::new(dir.path().to_path_buf()).await.unwrap());
        let database = connect_db(&dir).await;

        let cache = Cache::new(
            database,
            store.clone() as Arc<dyn ConfigStore>,
            store.clone() as Arc<dyn crate::storage::NarInfoStore>,
            store.clone() as Arc<dyn crate::storage::NarStore>,
            Vec::new(),
            Arc::new(InProcessLocker::new()),
            lock::CacheLock::new(),
            CacheOptions {
                hostname: "proxy.test".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        cache.public_key()
    };

    // a second boot over the same data path loads the persisted key
    let store = Arc::new(LocalStore::new(dir.path().to_path_buf()).await.unwrap());
    let database = connect_db(&dir).await;

    let cache = Cache::new(
        database,
        store.clone() as Arc<dyn ConfigStore>,
        store.clone() as Arc<dyn crate::storage::NarInfoStore>,
        store.clone() as Arc<dyn crate::storage::NarStore>,
        Vec::new(),
        Arc::new(InProcessLocker::new()),
        lock::CacheLock::new(),
        CacheOptions {
            hostname: "proxy.test".to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(key_a, cache.public_key());
}

#[tokio::test]
async fn test_upstream_hit_is_resigned_and_persisted() {
    let upstream_key = Keypair::generate("upstream.test").unwrap();

    let mock = MockUpstream::start(40).await;
    mock.add_nar_info(
        NARINFO_HASH,
        &nar_info_document(&format!("nar/{NAR_HASH}.nar.xz"), Some(&upstream_key)),
    );

    let upstream = upstream_for(&mock, vec![upstream_key.to_public_key()]).await;
    let harness = harness(vec![upstream]).await;

    let nar_info = harness.cache.get_nar_info(NARINFO_HASH, false).await.unwrap();

    // the upstream signature is preserved and ours is appended
    assert_eq!(2, nar_info.signatures.len());
    let fingerprint = nar_info.fingerprint();
    assert!(verify_first(
        &nar_info.signatures,
        &fingerprint,
        &[upstream_key.to_public_key()],
    ));
    let own_key = PublicKey::from_str(&harness.cache.public_key()).unwrap();
    assert!(verify_first(&nar_info.signatures, &fingerprint, &[own_key]));

    // served again from local storage without touching the upstream
    assert_eq!(1, mock.narinfo_requests());
    let again = harness.cache.get_nar_info(NARINFO_HASH, false).await.unwrap();
    assert_eq!(1, mock.narinfo_requests());
    assert_eq!(nar_info.to_string(), again.to_string());

    harness.cache.close().await;
}

#[tokio::test]
async fn test_unverifiable_signatures_are_dropped() {
    let upstream_key = Keypair::generate("upstream.test").unwrap();
    let rogue_key = Keypair::generate("rogue.test").unwrap();

    let mock = MockUpstream::start(40).await;
    let mut nar_info = NarInfo::from_str(&nar_info_document(
        &format!("nar/{NAR_HASH}.nar.xz"),
        Some(&rogue_key),
    ))
    .unwrap();
    nar_info.sign(&upstream_key);
    mock.add_nar_info(NARINFO_HASH, &nar_info.to_string());

    let upstream = upstream_for(&mock, vec![upstream_key.to_public_key()]).await;
    let harness = harness(vec![upstream]).await;

    let served = harness.cache.get_nar_info(NARINFO_HASH, false).await.unwrap();

    // the rogue signature is gone; the upstream's and ours remain
    assert_eq!(2, served.signatures.len());
    assert!(served
        .signatures
        .iter()
        .all(|sig| !sig.starts_with("rogue.test:")));

    harness.cache.close().await;
}

#[tokio::test]
async fn test_miss_everywhere_is_not_found() {
    let mock = MockUpstream::start(40).await;
    let upstream = upstream_for(&mock, Vec::new()).await;
    let harness = harness(vec![upstream]).await;

    assert!(matches!(
        harness.cache.get_nar_info(NARINFO_HASH, false).await,
        Err(ServerError::NotFound)
    ));

    // invalid hash shapes are rejected before any lookup
    harness
        .cache
        .get_nar_info("tooshort", false)
        .await
        .unwrap_err();
    harness
        .cache
        .get_nar_info(&format!("{NARINFO_HASH}x"), false)
        .await
        .unwrap_err();

    harness.cache.close().await;
}

#[tokio::test]
async fn test_concurrent_nar_fetches_deduplicate() {
    let body: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();

    let mock = MockUpstream::start(40).await;
    mock.add_nar(&format!("{NAR_HASH}.nar.xz"), &body);

    let upstream = upstream_for(&mock, Vec::new()).await;
    let harness = Arc::new(harness(vec![upstream]).await);

    let url = NarUrl::parse(&format!("nar/{NAR_HASH}.nar.xz")).unwrap();

    let clients: Vec<_> = (0..100)
        .map(|_| {
            let harness = harness.clone();
            let url = url.clone();

            tokio::spawn(async move {
                let nar = harness.cache.get_nar(&url, false).await.unwrap();
                read_all(nar.reader).await
            })
        })
        .collect();

    for client in clients {
        assert_eq!(body, client.await.unwrap());
    }

    // the upstream saw exactly one request
    assert_eq!(1, mock.nar_requests());

    harness.cache.close().await;
}

#[tokio::test]
async fn test_upload_only_scope_never_contacts_upstream() {
    let mock = MockUpstream::start(40).await;
    mock.add_nar_info(
        OTHER_NARINFO_HASH,
        &nar_info_document(&format!("nar/{NAR_HASH}.nar.xz"), None),
    );

    let upstream = upstream_for(&mock, Vec::new()).await;
    let harness = harness(vec![upstream]).await;

    // seed a NAR and its narinfo through the upload path
    let url = NarUrl::parse(&format!("nar/{NAR_HASH}.nar.xz")).unwrap();
    harness
        .cache
        .put_nar(&url, &mut b"uploaded".as_slice())
        .await
        .unwrap();
    harness
        .cache
        .put_nar_info(
            NARINFO_HASH,
            &nar_info_document(&format!("nar/{NAR_HASH}.nar.xz"), None),
        )
        .await
        .unwrap();

    // locally stored: served under the upload-only scope
    harness
        .cache
        .get_nar_info(NARINFO_HASH, true)
        .await
        .unwrap();

    // not local, although the upstream has it: 404 without contact
    assert!(matches!(
        harness.cache.get_nar_info(OTHER_NARINFO_HASH, true).await,
        Err(ServerError::NotFound)
    ));
    assert_eq!(0, mock.narinfo_requests());

    // NARs behave the same
    let missing = NarUrl::parse(&format!("nar/{OTHER_NAR_HASH}.nar.xz")).unwrap();
    assert!(matches!(
        harness.cache.get_nar(&missing, true).await,
        Err(ServerError::NotFound)
    ));
    assert_eq!(0, mock.nar_requests());

    harness.cache.close().await;
}

#[tokio::test]
async fn test_prefixed_nar_url_is_normalized() {
    let mock = MockUpstream::start(40).await;
    mock.add_nar_info(
        NARINFO_HASH,
        &nar_info_document(&format!("nar/{NARINFO_HASH}-{NAR_HASH}.nar.xz"), None),
    );
    mock.add_nar(&format!("{NAR_HASH}.nar.xz"), b"prefixed nar bytes");

    let upstream = upstream_for(&mock, Vec::new()).await;
    let harness = harness(vec![upstream]).await;

    let nar_info = harness.cache.get_nar_info(NARINFO_HASH, false).await.unwrap();
    assert_eq!(NAR_HASH, nar_info.url.hash);
    assert_eq!(format!("nar/{NAR_HASH}.nar.xz"), nar_info.url.to_string());

    // the normalized URL resolves to a NAR
    let nar = harness.cache.get_nar(&nar_info.url, false).await.unwrap();
    assert_eq!(b"prefixed nar bytes", read_all(nar.reader).await.as_slice());

    harness.cache.close().await;
}

#[tokio::test]
async fn test_unhealthy_upstream_is_bypassed() {
    let mock = MockUpstream::start(40).await;
    mock.add_nar_info(
        NARINFO_HASH,
        &nar_info_document(&format!("nar/{NAR_HASH}.nar.xz"), None),
    );

    let upstream = upstream_for(&mock, Vec::new()).await;
    let harness = harness(vec![upstream.clone()]).await;

    harness.cache.get_nar_info(NARINFO_HASH, false).await.unwrap();
    assert_eq!(1, mock.narinfo_requests());

    // the ranker marked it unhealthy; the engine skips it entirely
    upstream.set_healthy(false);

    assert!(matches!(
        harness.cache.get_nar_info(OTHER_NARINFO_HASH, false).await,
        Err(ServerError::NotFound)
    ));
    assert_eq!(1, mock.narinfo_requests());

    harness.cache.close().await;
}

#[tokio::test]
async fn test_priority_order_is_respected() {
    let preferred_body = b"from the preferred upstream";

    let preferred = MockUpstream::start(10).await;
    preferred.add_nar(&format!("{NAR_HASH}.nar.xz"), preferred_body);

    let fallback = MockUpstream::start(40).await;
    fallback.add_nar(&format!("{NAR_HASH}.nar.xz"), b"from the fallback");

    // construction order deliberately lists the fallback first
    let upstreams = vec![
        upstream_for(&fallback, Vec::new()).await,
        upstream_for(&preferred, Vec::new()).await,
    ];
    let harness = harness(upstreams).await;

    let url = NarUrl::parse(&format!("nar/{NAR_HASH}.nar.xz")).unwrap();
    let nar = harness.cache.get_nar(&url, false).await.unwrap();

    assert_eq!(preferred_body, read_all(nar.reader).await.as_slice());
    assert_eq!(1, preferred.nar_requests());
    assert_eq!(0, fallback.nar_requests());

    harness.cache.close().await;
}

#[tokio::test]
async fn test_put_nar_info_never_streams() {
    let mock = MockUpstream::start(40).await;
    mock.add_nar(&format!("{NAR_HASH}.nar.xz"), b"upstream copy");

    let upstream = upstream_for(&mock, Vec::new()).await;
    let harness = harness(vec![upstream]).await;

    // the referenced NAR is already stored locally
    let url = NarUrl::parse(&format!("nar/{NAR_HASH}.nar.xz")).unwrap();
    harness
        .cache
        .put_nar(&url, &mut b"local copy".as_slice())
        .await
        .unwrap();

    harness
        .cache
        .put_nar_info(
            NARINFO_HASH,
            &nar_info_document(&format!("nar/{NAR_HASH}.nar.xz"), None),
        )
        .await
        .unwrap();

    // wait out all detached work before asserting
    harness.cache.close().await;

    assert_eq!(0, mock.nar_requests());

    let stored = harness.store.get_nar_info(NARINFO_HASH).await.unwrap();
    assert!(stored
        .signatures
        .iter()
        .any(|sig| sig.starts_with("proxy.test:")));
}

#[tokio::test]
async fn test_put_then_get_round_trip() {
    let harness = harness(Vec::new()).await;

    let url = NarUrl::parse(&format!("nar/{NAR_HASH}.nar.xz")).unwrap();
    let body = b"uploaded nar bytes";

    harness
        .cache
        .put_nar(&url, &mut body.as_slice())
        .await
        .unwrap();

    let nar = harness.cache.get_nar(&url, false).await.unwrap();
    assert_eq!(Some(body.len() as u64), nar.size);
    assert_eq!(body, read_all(nar.reader).await.as_slice());

    // uploading the same NAR again coalesces into a no-op
    harness
        .cache
        .put_nar(&url, &mut b"different".as_slice())
        .await
        .unwrap();
    let nar = harness.cache.get_nar(&url, false).await.unwrap();
    assert_eq!(body, read_all(nar.reader).await.as_slice());

    harness.cache.close().await;
}

#[tokio::test]
async fn test_get_nar_file_size_from_metadata() {
    let harness = harness(Vec::new()).await;

    let stored = NarUrl::parse(&format!("nar/{NAR_HASH}.nar.xz")).unwrap();
    harness
        .cache
        .put_nar(&stored, &mut b"bytes".as_slice())
        .await
        .unwrap();

    harness
        .cache
        .put_nar_info(
            NARINFO_HASH,
            &nar_info_document(&format!("nar/{NAR_HASH}.nar.xz"), None),
        )
        .await
        .unwrap();

    let url = NarUrl::parse(&format!("nar/{NAR_HASH}.nar.xz")).unwrap();
    assert_eq!(
        4029176,
        harness.cache.get_nar_file_size(&url).await.unwrap()
    );

    let missing = NarUrl::parse(&format!("nar/{OTHER_NARINFO_HASH}.nar")).unwrap();
    assert!(matches!(
        harness.cache.get_nar_file_size(&missing).await,
        Err(ServerError::NotFound)
    ));

    harness.cache.close().await;
}

#[tokio::test]
async fn test_disconnected_client_detaches_persistence() {
    let body: Vec<u8> = (0..512 * 1024).map(|i| (i % 241) as u8).collect();

    let mock = MockUpstream::start(40).await;
    mock.add_nar(&format!("{NAR_HASH}.nar.xz"), &body);

    let upstream = upstream_for(&mock, Vec::new()).await;
    let harness = harness(vec![upstream]).await;

    let url = NarUrl::parse(&format!("nar/{NAR_HASH}.nar.xz")).unwrap();
    let nar = harness.cache.get_nar(&url, false).await.unwrap();

    // the client hangs up immediately
    drop(nar.reader);

    // persistence runs to completion regardless
    harness.cache.close().await;

    let (size, reader) = harness.store.get_nar(&url).await.unwrap();
    assert_eq!(body.len() as u64, size);
    assert_eq!(body, read_all(reader).await);
}

#[tokio::test]
async fn test_stale_nar_info_is_purged() {
    let mock = MockUpstream::start(40).await;
    let upstream = upstream_for(&mock, Vec::new()).await;
    let harness = harness(vec![upstream]).await;

    // a narinfo whose NAR exists nowhere: accepted, then purged by the
    // retrievability guard
    harness
        .cache
        .put_nar_info(
            NARINFO_HASH,
            &nar_info_document(&format!("nar/{NAR_HASH}.nar.xz"), None),
        )
        .await
        .unwrap();

    harness.cache.close().await;

    assert!(!harness.store.has_nar_info(NARINFO_HASH).await.unwrap());
}

#[tokio::test]
async fn test_delete_operations() {
    let harness = harness(Vec::new()).await;

    let url = NarUrl::parse(&format!("nar/{NAR_HASH}.nar.xz")).unwrap();
    harness
        .cache
        .put_nar(&url, &mut b"bytes".as_slice())
        .await
        .unwrap();
    harness
        .cache
        .put_nar_info(
            NARINFO_HASH,
            &nar_info_document(&format!("nar/{NAR_HASH}.nar.xz"), None),
        )
        .await
        .unwrap();

    harness.cache.delete_nar_info(NARINFO_HASH).await.unwrap();
    assert!(matches!(
        harness.cache.get_nar_info(NARINFO_HASH, true).await,
        Err(ServerError::NotFound)
    ));
    assert!(matches!(
        harness.cache.get_nar_file_size(&url).await,
        Err(ServerError::NotFound)
    ));

    harness.cache.delete_nar(&url).await.unwrap();
    assert!(matches!(
        harness.cache.delete_nar(&url).await,
        Err(ServerError::NotFound)
    ));

    harness.cache.close().await;
}
