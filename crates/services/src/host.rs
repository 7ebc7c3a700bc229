//! Host-capability seam.
//!
//! Connectivity notifications, background wake-ups, and storage-quota queries
//! are platform concerns; the sync engine consumes them through
//! [`HostPlatform`] so mobile background tasks, desktop timers, and tests can
//! all supply an implementation.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

/// Storage usage snapshot, for sync diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageQuota {
    pub used_bytes: u64,
    pub quota_bytes: u64,
}

#[async_trait]
pub trait HostPlatform: Send + Sync {
    /// Current connectivity snapshot.
    fn is_online(&self) -> bool;

    /// Watch channel delivering connectivity transitions. The receiver's
    /// value is `true` while online.
    fn connectivity_changes(&self) -> watch::Receiver<bool>;

    /// Ask the platform to wake the app after roughly `after`, so pending
    /// mutations can flush while not foregrounded. Best effort; hosts
    /// without background execution may ignore it.
    fn request_wakeup(&self, after: Duration);

    /// Storage usage for diagnostics, if the host can report it.
    async fn storage_quota(&self) -> Option<StorageQuota>;
}

/// Host driven by explicit notifications.
///
/// Desktop shells call `set_online` from their own network monitoring; tests
/// use it to simulate going offline and back.
pub struct ManualHost {
    sender: watch::Sender<bool>,
    quota: Mutex<Option<StorageQuota>>,
    wakeups: Mutex<Vec<Duration>>,
}

impl ManualHost {
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender,
            quota: Mutex::new(None),
            wakeups: Mutex::new(Vec::new()),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.sender.send_replace(online);
    }

    pub fn set_quota(&self, quota: StorageQuota) {
        if let Ok(mut guard) = self.quota.lock() {
            *guard = Some(quota);
        }
    }

    /// Wake-ups requested so far, oldest first.
    #[must_use]
    pub fn requested_wakeups(&self) -> Vec<Duration> {
        self.wakeups
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HostPlatform for ManualHost {
    fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    fn connectivity_changes(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    fn request_wakeup(&self, after: Duration) {
        if let Ok(mut guard) = self.wakeups.lock() {
            guard.push(after);
        }
    }

    async fn storage_quota(&self) -> Option<StorageQuota> {
        self.quota.lock().ok().and_then(|guard| *guard)
    }
}
