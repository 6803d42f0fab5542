//! Rate-limited "user is active" notifications.
//!
//! Every inbound keystroke batch calls [`ActivityTracker::notify_activity`].
//! The first call in a quiet period reaches the workspace API immediately;
//! calls inside the threshold only raise the `active` flag, which the
//! periodic [`FlushTask`] turns into one deferred notification.
//!
//! Notification failures are logged and dropped. They never reach a
//! terminal session.

use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(30);
pub const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Where and how often activity is reported.
#[derive(Debug, Clone)]
pub struct ActivityConfig {
    /// Base URL of the workspace API.
    pub endpoint: String,
    /// Workspace the terminal belongs to.
    pub workspace_id: String,
    /// Minimum spacing between immediate notifications.
    pub threshold: Duration,
    /// Period of the background flush.
    pub flush_period: Duration,
    /// Timeout for one notification request.
    pub request_timeout: Duration,
}

impl ActivityConfig {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            workspace_id: workspace_id.into(),
            threshold: DEFAULT_THRESHOLD,
            flush_period: DEFAULT_FLUSH_PERIOD,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub fn flush_period(mut self, period: Duration) -> Self {
        self.flush_period = period;
        self
    }

    /// `<endpoint>/activity/<workspace-id>`
    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "{}/activity/{}",
            self.endpoint.trim_end_matches('/'),
            self.workspace_id
        )
    }
}

/// The external "user is active" call.
pub trait Notifier: Send + Sync {
    /// # Errors
    ///
    /// Returns [`BridgeError::Notification`] if the endpoint could not be reached.
    fn notify(&self) -> Result<()>;
}

/// `PUT <endpoint>/activity/<workspace-id>` with an empty body.
#[derive(Debug)]
pub struct HttpNotifier {
    client: Client,
    url: String,
}

impl HttpNotifier {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ActivityConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            url: config.url(),
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Notifier for HttpNotifier {
    fn notify(&self) -> Result<()> {
        self.client.put(&self.url).send()?.error_for_status()?;
        Ok(())
    }
}

/// Used when no workspace API is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledNotifier;

impl Notifier for DisabledNotifier {
    fn notify(&self) -> Result<()> {
        debug!("activity notification skipped: no workspace API configured");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ActivityState {
    /// A notification is owed since `last_notified_at`.
    active: bool,
    last_notified_at: Option<Instant>,
}

/// Shared by every connection's dispatcher and the flush task.
pub struct ActivityTracker {
    state: Mutex<ActivityState>,
    threshold: Duration,
    notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for ActivityTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityTracker")
            .field("state", &*self.lock())
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl ActivityTracker {
    #[must_use]
    pub fn new(threshold: Duration, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            state: Mutex::new(ActivityState::default()),
            threshold,
            notifier,
        }
    }

    /// Tracker that never calls out. Handy for sessions without a workspace.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(DEFAULT_THRESHOLD, Arc::new(DisabledNotifier))
    }

    // Every critical section leaves the state consistent, so a poisoned
    // lock still holds usable data.
    fn lock(&self) -> MutexGuard<'_, ActivityState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record user activity; notify now unless the last notification is
    /// more recent than the threshold.
    pub fn notify_activity(&self) {
        self.notify_activity_at(Instant::now());
    }

    /// [`Self::notify_activity`] with an explicit clock reading.
    pub fn notify_activity_at(&self, now: Instant) {
        {
            let mut state = self.lock();
            let suppressed = state
                .last_notified_at
                .is_some_and(|last| now.saturating_duration_since(last) < self.threshold);
            if suppressed {
                state.active = true;
                return;
            }
            state.active = false;
            state.last_notified_at = Some(now);
        }
        debug!("activity notification: immediate");
        self.call_notifier();
    }

    /// Send the deferred notification if activity was suppressed since the
    /// last one. Returns whether a notification was attempted.
    ///
    /// The threshold window is left alone: only an immediate notification
    /// restarts it.
    pub fn flush(&self) -> bool {
        {
            let mut state = self.lock();
            if !state.active {
                return false;
            }
            state.active = false;
        }
        debug!("activity notification: scheduled");
        self.call_notifier();
        true
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    #[must_use]
    pub fn last_notified_at(&self) -> Option<Instant> {
        self.lock().last_notified_at
    }

    fn call_notifier(&self) {
        if let Err(error) = self.notifier.notify() {
            warn!(%error, "failed to notify user activity in terminal");
        }
    }

    /// Start the periodic flush on its own thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn_flush_task(self: &Arc<Self>, period: Duration) -> std::io::Result<FlushTask> {
        let tracker = Arc::clone(self);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("wsterm-activity-flush".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            tracker.flush();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("activity flush task stopped");
            })?;
        Ok(FlushTask {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

/// Handle to the periodic flush thread. Stops the thread when dropped.
#[derive(Debug)]
pub struct FlushTask {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FlushTask {
    /// Stop the flush thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlushTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}
