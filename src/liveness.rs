//! Worker liveness: heartbeat receipt and the timeout sweep.
//!
//! The sweep runs on every heartbeat receipt and on its own timer. The
//! timeout is held behind an atomic so operators can retune it at runtime
//! without a restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::Result;
use crate::storage::Storage;

pub struct LivenessMonitor {
    storage: Arc<Mutex<Storage>>,
    timeout_ms: AtomicU64,
    shutdown: Notify,
}

impl LivenessMonitor {
    pub fn new(storage: Arc<Mutex<Storage>>, timeout: Duration) -> Self {
        Self {
            storage,
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
            shutdown: Notify::new(),
        }
    }

    fn storage(&self) -> MutexGuard<'_, Storage> {
        self.storage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current timeout after which a silent worker is considered dead.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// Retune the timeout. Takes effect on the next sweep.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
        info!(timeout_ms = timeout.as_millis() as u64, "liveness timeout retuned");
    }

    /// Record a heartbeat: bump last_ping and revive the worker to alive
    /// unless it is mid-evaluation. A dead worker pinging again is revived
    /// by this same unconditional overwrite.
    pub fn heartbeat(&self, worker_id: i64, owner: &str) -> Result<()> {
        self.storage()
            .with_transaction(|ctx| ctx.touch_worker(worker_id, owner, Utc::now()))
    }

    /// Demote every worker whose last heartbeat is older than the timeout
    /// to dead. Scan and updates commit in one transaction. Returns the
    /// ids demoted this pass.
    pub fn sweep(&self) -> Result<Vec<i64>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.timeout())
                .unwrap_or_else(|_| chrono::Duration::seconds(10));

        let demoted = self.storage().with_transaction(|ctx| {
            let stale = ctx.stale_workers(cutoff)?;
            let mut ids = Vec::with_capacity(stale.len());
            for worker in stale {
                ctx.mark_worker_dead(worker.id)?;
                ids.push(worker.id);
            }
            Ok(ids)
        })?;

        for id in &demoted {
            info!(worker_id = id, "worker marked dead by sweep");
        }
        Ok(demoted)
    }

    /// Signal the sweep loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Periodic sweep loop, independent of heartbeat traffic, so workers
    /// that stop pinging still get demoted when no one else pings either.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("liveness sweep loop shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep() {
                        warn!(error = %e, "liveness sweep failed");
                    }
                }
            }
        }
    }
}
