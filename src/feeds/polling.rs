//! Polling fallback for chat surfaces without a socket (support chat).
//!
//! Fetches the full message list on a fixed interval and replaces the view
//! with each successful result. A failed fetch keeps the previous view and
//! surfaces [`FeedStatus::Failed`] until the next success.
//!
//! # Design
//!
//! Same read surface as the socket-backed feeds ([`Feed`], [`ChatFeed`]), so
//! UI code does not care which transport is behind a chat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{ChatFeed, Feed, FeedError, FeedStatus, ViewCell};
use crate::channel::{Envelope, SendStatus};
use crate::rest::MessageSource;

/// Default interval between fetches.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3000);

/// Shortest accepted interval.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct PollView {
    messages: Vec<Envelope>,
    status: FeedStatus,
}

impl Default for PollView {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            status: FeedStatus::Idle,
        }
    }
}

struct PollShared {
    source: Arc<dyn MessageSource>,
    view: ViewCell<PollView>,
    stopped: AtomicBool,
}

impl PollShared {
    async fn refresh(&self) -> Result<usize> {
        let fetched = self.source.fetch().await;
        self.apply(fetched)
    }

    /// Fold a fetch result into the view. `stopped` is read under the view
    /// lock, so nothing lands after `stop` has cleared the view.
    fn apply(&self, fetched: Result<Vec<Envelope>>) -> Result<usize> {
        let mut applied = false;
        let outcome = match fetched {
            Ok(messages) => {
                let count = messages.len();
                self.view.update(|v| {
                    if self.stopped.load(Ordering::Acquire) {
                        return false;
                    }
                    applied = true;
                    let changed = v.messages != messages || v.status != FeedStatus::Live;
                    v.messages = messages;
                    v.status = FeedStatus::Live;
                    changed
                });
                Ok(count)
            }
            Err(e) => {
                let status = FeedStatus::Failed(format!("{e:#}"));
                self.view.update(|v| {
                    if self.stopped.load(Ordering::Acquire) {
                        return false;
                    }
                    applied = true;
                    let changed = v.status != status;
                    v.status = status;
                    changed
                });
                if applied {
                    log::warn!("[Polling] Fetch failed: {:#}", e);
                }
                Err(e)
            }
        };

        if applied {
            outcome
        } else {
            log::debug!("[Polling] Discarding fetch result after stop");
            Ok(0)
        }
    }
}

enum PollTask {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Chat view kept fresh by periodic REST fetches.
pub struct PollingFeed {
    shared: Arc<PollShared>,
    interval: Duration,
    task: Mutex<PollTask>,
}

impl std::fmt::Debug for PollingFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingFeed")
            .field("interval", &self.interval)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl PollingFeed {
    /// Create a stopped feed polling `source` every `interval`.
    #[must_use]
    pub fn new(source: Arc<dyn MessageSource>, interval: Duration) -> Self {
        Self {
            shared: Arc::new(PollShared {
                source,
                view: ViewCell::default(),
                stopped: AtomicBool::new(false),
            }),
            interval: interval.max(MIN_POLL_INTERVAL),
            task: Mutex::new(PollTask::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PollTask> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Interval between fetches.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.interval
    }

    /// Start polling; the first fetch happens immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), FeedError> {
        let mut task = self.lock();
        match &*task {
            PollTask::Running(_) => return Err(FeedError::AlreadySubscribed),
            PollTask::Stopped => return Err(FeedError::Unsubscribed),
            PollTask::Idle => {}
        }

        let shared = Arc::clone(&self.shared);
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shared.stopped.load(Ordering::Acquire) {
                    break;
                }
                // Failures are already surfaced through the status.
                let _ = shared.refresh().await;
            }
        });

        log::info!("[Polling] Started (every {:?})", period);
        *task = PollTask::Running(handle);
        Ok(())
    }

    /// Fetch now and replace the view. Returns the number of messages.
    pub async fn refresh(&self) -> Result<usize> {
        self.shared.refresh().await
    }

    /// Stop polling and clear the view. Terminal and idempotent.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock(), PollTask::Stopped);
        if matches!(previous, PollTask::Stopped) {
            return;
        }
        self.shared.stopped.store(true, Ordering::Release);
        if let PollTask::Running(handle) = previous {
            handle.abort();
            log::info!("[Polling] Stopped");
        }
        self.shared.view.update(|v| {
            v.messages.clear();
            v.status = FeedStatus::Unsubscribed;
            true
        });
    }

    /// Whether the poll loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(&*self.lock(), PollTask::Running(_))
    }
}

impl Feed for PollingFeed {
    type Item = Envelope;

    fn items(&self) -> Vec<Envelope> {
        self.shared.view.read(|v| v.messages.clone())
    }

    fn status(&self) -> FeedStatus {
        self.shared.view.read(|v| v.status.clone())
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.shared.view.subscribe()
    }

    fn len(&self) -> usize {
        self.shared.view.read(|v| v.messages.len())
    }
}

#[async_trait]
impl ChatFeed for PollingFeed {
    /// Post, then refresh so the new message shows up without waiting a tick.
    async fn send_text(&self, text: &str) -> Result<SendStatus> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Ok(SendStatus::Closed);
        }
        self.shared.source.post(text).await?;
        if let Err(e) = self.refresh().await {
            log::debug!("[Polling] Refresh after send failed: {:#}", e);
        }
        Ok(SendStatus::Sent)
    }
}

impl Drop for PollingFeed {
    fn drop(&mut self) {
        self.stop();
    }
}
