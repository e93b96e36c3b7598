//! Upstream health monitoring.
//!
//! The monitor owns the set of upstreams and probes every one of them
//! on a fixed interval, refreshing health and priority in place.
//! Probing can also be forced with [`HealthMonitor::trigger`], which
//! hands back a receiver resolved when the forced pass completes;
//! startup and tests use it to wait for a stable health snapshot.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::Upstream;

/// Default interval between health check passes.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// A health state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    /// Hostname of the upstream that changed state.
    pub upstream: String,

    /// The new state.
    pub healthy: bool,
}

/// Periodically probes upstream health and priority.
#[derive(Debug)]
pub struct HealthMonitor {
    upstreams: Vec<Arc<Upstream>>,

    interval: Duration,

    /// Best-effort transition events; sends are dropped when nobody
    /// is keeping up with the receiver.
    events: Option<mpsc::Sender<HealthEvent>>,

    trigger_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    trigger_rx: StdMutex<Option<mpsc::UnboundedReceiver<oneshot::Sender<()>>>>,
}

impl HealthMonitor {
    pub fn new(upstreams: Vec<Arc<Upstream>>, interval: Duration) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();

        Self {
            upstreams,
            interval,
            events: None,
            trigger_tx,
            trigger_rx: StdMutex::new(Some(trigger_rx)),
        }
    }

    /// Attaches a transition event channel.
    pub fn with_events(mut self, events: mpsc::Sender<HealthEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Forces a check pass.
    ///
    /// The returned receiver resolves when the forced pass has probed
    /// every upstream. It errors out immediately when the monitor is
    /// not running.
    pub fn trigger(&self) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let _ = self.trigger_tx.send(done_tx);
        done_rx
    }

    /// Runs the monitor until the token is cancelled.
    ///
    /// The first pass starts immediately, so upstream state settles
    /// shortly after startup.
    pub fn run(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut trigger_rx = self
            .trigger_rx
            .lock()
            .unwrap()
            .take()
            .expect("health monitor is already running");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check_all().await;
                    }
                    Some(done) = trigger_rx.recv() => {
                        self.check_all().await;
                        let _ = done.send(());
                    }
                }
            }

            tracing::debug!("Health monitor stopped");
        })
    }

    /// Probes every upstream once.
    pub async fn check_all(&self) {
        let checks = self.upstreams.iter().map(|upstream| self.check(upstream));
        futures::future::join_all(checks).await;
    }

    async fn check(&self, upstream: &Arc<Upstream>) {
        let was_healthy = upstream.is_healthy();

        match upstream.parse_priority().await {
            Ok(priority) => {
                upstream.set_priority(priority);
                upstream.set_healthy(true);

                if !was_healthy {
                    tracing::info!(
                        "Upstream {} is healthy again (priority {})",
                        upstream.get_hostname(),
                        priority
                    );
                    self.emit(upstream, true);
                }
            }
            Err(e) => {
                upstream.set_healthy(false);

                if was_healthy {
                    tracing::warn!(
                        "Upstream {} became unhealthy: {}",
                        upstream.get_hostname(),
                        e
                    );
                    self.emit(upstream, false);
                }
            }
        }
    }

    fn emit(&self, upstream: &Arc<Upstream>, healthy: bool) {
        if let Some(events) = &self.events {
            let _ = events.try_send(HealthEvent {
                upstream: upstream.get_hostname().to_string(),
                healthy,
            });
        }
    }
}
