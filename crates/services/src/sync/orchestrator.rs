use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::SyncQueueError;
use crate::host::{HostPlatform, StorageQuota};
use crate::sync::queue::{FlushReport, SyncQueueService};

/// Wait after connectivity returns before flushing; radios and VPNs often
/// report online a moment before routes actually work.
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Snapshot for the sync status UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDiagnostics {
    pub pending: u32,
    pub dead_letter: u32,
    pub quota: Option<StorageQuota>,
}

/// Decides when the queue flushes: connectivity regained, periodic timer,
/// or manual request. One flush runs at a time; a request arriving while
/// one is in flight is dropped rather than racing the same queue contents.
pub struct SyncOrchestrator {
    queue: Arc<SyncQueueService>,
    host: Arc<dyn HostPlatform>,
    flushing: AtomicBool,
    settle_delay: Duration,
    interval: Duration,
}

impl SyncOrchestrator {
    #[must_use]
    pub fn new(queue: Arc<SyncQueueService>, host: Arc<dyn HostPlatform>) -> Self {
        Self {
            queue,
            host,
            flushing: AtomicBool::new(false),
            settle_delay: DEFAULT_SETTLE_DELAY,
            interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Manual "sync now". Returns `None` if a flush was already running.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError` only for catastrophic store failures.
    pub async fn sync_now(&self) -> Result<Option<FlushReport>, SyncQueueError> {
        self.try_flush().await
    }

    /// Check-and-set on the flushing flag; the compare-exchange is what
    /// keeps a timer flush and a manual flush from interleaving.
    async fn try_flush(&self) -> Result<Option<FlushReport>, SyncQueueError> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("flush already running, request dropped");
            return Ok(None);
        }

        let result = self.queue.flush().await;
        self.flushing.store(false, Ordering::SeqCst);
        let report = result?;

        // anything still pending (offline, failures) needs another chance
        // even if the app is backgrounded before the next timer tick
        if self.queue.pending_count().await? > 0 {
            self.host.request_wakeup(self.interval);
        }
        Ok(Some(report))
    }

    /// Cooperative loop: reacts to connectivity transitions (after a settle
    /// delay) and fires the periodic flush. Runs until the host's
    /// connectivity channel closes.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError` only for catastrophic store failures.
    pub async fn run(&self) -> Result<(), SyncQueueError> {
        let mut changes = self.host.connectivity_changes();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        info!("connectivity channel closed, sync loop stopping");
                        return Ok(());
                    }
                    let online = *changes.borrow_and_update();
                    if online {
                        debug!("connectivity regained, flushing after settle delay");
                        tokio::time::sleep(self.settle_delay).await;
                        self.try_flush().await?;
                    }
                }
                _ = ticker.tick() => {
                    self.try_flush().await?;
                }
            }
        }
    }

    /// Pending/dead-letter counts plus the host's storage quota, for the
    /// sync status screen.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError::Storage` on repository failure.
    pub async fn diagnostics(&self) -> Result<SyncDiagnostics, SyncQueueError> {
        Ok(SyncDiagnostics {
            pending: self.queue.pending_count().await?,
            dead_letter: self.queue.dead_letter_count().await?,
            quota: self.host.storage_quota().await,
        })
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
