//! Download coordination locks.
//!
//! Two primitives serialize cache mutations:
//!
//! - [`DownloadLocker`]: per-fingerprint exclusive locks with a TTL,
//!   so at most one ingest runs for a given artifact. A holder that
//!   gets stuck past the TTL is reclaimed by the next waiter. The
//!   in-process implementation lives here; a distributed lock with the
//!   same TTL semantics can stand in behind the same trait.
//! - [`CacheLock`]: a process-wide reader-writer lock. Request-scoped
//!   operations take the read side; bulk mutations take the write side
//!   and exclude all readers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;

/// Returns the lock fingerprint for a narinfo.
pub fn nar_info_fingerprint(hash: &str) -> String {
    format!("narinfo:{}", hash)
}

/// Returns the lock fingerprint for a NAR.
pub fn nar_fingerprint(hash: &str) -> String {
    format!("nar:{}", hash)
}

/// An exclusive, TTL-bounded claim over a fingerprint.
///
/// The claim is released on drop. Explicit release is idempotent.
pub struct DownloadLease {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DownloadLease {
    fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Releases the lease.
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for DownloadLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for DownloadLease {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DownloadLease")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Grants exclusive, TTL-bounded leases over fingerprints.
#[async_trait]
pub trait DownloadLocker: Send + Sync + fmt::Debug {
    /// Acquires the lease for a fingerprint, waiting for the current
    /// holder to release or exceed its TTL.
    async fn lock(&self, fingerprint: &str, ttl: Duration) -> DownloadLease;
}

/// The holder of a fingerprint at a point in time.
struct Holder {
    generation: u64,
    deadline: Instant,
}

#[derive(Default)]
struct Shared {
    holders: StdMutex<HashMap<String, Holder>>,
    released: Notify,
}

/// In-process download locker.
#[derive(Clone, Default)]
pub struct InProcessLocker {
    shared: Arc<Shared>,
    generations: Arc<AtomicU64>,
}

impl InProcessLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for InProcessLocker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let holders = self.shared.holders.lock().unwrap();
        f.debug_struct("InProcessLocker")
            .field("held", &holders.len())
            .finish()
    }
}

#[async_trait]
impl DownloadLocker for InProcessLocker {
    async fn lock(&self, fingerprint: &str, ttl: Duration) -> DownloadLease {
        loop {
            // register for wakeups before inspecting the state, so a
            // release between the check and the await is not lost
            let released = self.shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let current_deadline = {
                let mut holders = self.shared.holders.lock().unwrap();
                let now = Instant::now();

                let held_until = holders.get(fingerprint).map(|holder| holder.deadline);
                match held_until {
                    Some(deadline) if deadline > now => Some(deadline),
                    expired => {
                        if expired.is_some() {
                            tracing::warn!(
                                "Reclaiming expired download lock for {}",
                                fingerprint
                            );
                        }

                        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                        holders.insert(
                            fingerprint.to_string(),
                            Holder {
                                generation,
                                deadline: now + ttl,
                            },
                        );

                        let shared = self.shared.clone();
                        let fingerprint = fingerprint.to_string();
                        return DownloadLease::new(move || {
                            let mut holders = shared.holders.lock().unwrap();
                            // only remove our own generation; an expired
                            // lease must not release its reclaimer
                            if let Some(holder) = holders.get(&fingerprint) {
                                if holder.generation == generation {
                                    holders.remove(&fingerprint);
                                }
                            }
                            drop(holders);
                            shared.released.notify_waiters();
                        });
                    }
                }
            };

            if let Some(deadline) = current_deadline {
                tokio::select! {
                    _ = &mut released => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
        }
    }
}

/// Process-wide reader-writer lock over the cache.
#[derive(Debug, Clone, Default)]
pub struct CacheLock {
    inner: Arc<RwLock<()>>,
}

impl CacheLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the read side, shared with other readers.
    pub async fn read(&self) -> OwnedRwLockReadGuard<()> {
        self.inner.clone().read_owned().await
    }

    /// Acquires the write side, excluding all readers.
    pub async fn write(&self) -> OwnedRwLockWriteGuard<()> {
        self.inner.clone().write_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let locker = InProcessLocker::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let locker = locker.clone();
                let concurrent = concurrent.clone();
                let peak = peak.clone();

                tokio::spawn(async move {
                    let lease = locker.lock("nar:abc", Duration::from_secs(5)).await;

                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);

                    lease.release();
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(1, peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fingerprints_are_independent() {
        let locker = InProcessLocker::new();

        let _a = locker.lock("nar:abc", Duration::from_secs(5)).await;

        // a different fingerprint does not wait
        tokio::time::timeout(
            Duration::from_millis(100),
            locker.lock("narinfo:abc", Duration::from_secs(5)),
        )
        .await
        .expect("unrelated fingerprint should not block");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_reclaim() {
        let locker = InProcessLocker::new();

        let stuck = locker.lock("nar:abc", Duration::from_millis(50)).await;

        // the holder never releases; the TTL lets us through
        let reclaimed = locker.lock("nar:abc", Duration::from_secs(5)).await;

        // the stale lease must not release the reclaimer's hold
        drop(stuck);
        tokio::time::timeout(
            Duration::from_millis(20),
            locker.lock("nar:abc", Duration::from_secs(5)),
        )
        .await
        .expect_err("reclaimed lock should still be held");

        drop(reclaimed);
        tokio::time::timeout(
            Duration::from_millis(20),
            locker.lock("nar:abc", Duration::from_secs(5)),
        )
        .await
        .expect("released lock should be acquirable");
    }

    #[tokio::test]
    async fn test_release_then_drop_is_safe() {
        let locker = InProcessLocker::new();

        let lease = locker.lock("nar:abc", Duration::from_secs(5)).await;
        lease.release();
        // drop after release must not double-release (releasing an
        // entry now owned by someone else)

        let _held = locker.lock("nar:abc", Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_cache_lock_writer_excludes_readers() {
        let lock = CacheLock::new();

        let write = lock.write().await;

        let read_attempt =
            tokio::time::timeout(Duration::from_millis(50), lock.read()).await;
        assert!(read_attempt.is_err());

        drop(write);
        let _read_a = lock.read().await;
        let _read_b = lock.read().await;
    }
}
