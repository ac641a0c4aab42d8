//! Adaptive background polling of notification state
//!
//! The poller runs one self-rescheduling task per polling session. Each
//! iteration picks its delay from the current visibility, the time since the
//! last user activity and the consecutive failure count, so the cadence
//! degrades as engagement drops and recovers as soon as the user is back.
//! The last successful [`NotificationUpdate`] outlives `stop()` and is
//! replayed to subscribers when polling restarts for the same subject.

mod config;
mod subscription;

pub use config::PollingConfig;
pub use subscription::Subscription;

use crate::error::FetchError;
use crate::notification::{Notification, NotificationUpdate};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use strum_macros::Display;
use subscription::SubscriberList;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Where the poller gets notifications from
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn fetch_notifications(&self, subject: &str) -> Result<Vec<Notification>, FetchError>;
}

/// Interaction signals that count as user activity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ActivitySignal {
    PointerDown,
    PointerMove,
    KeyDown,
    Scroll,
    TouchStart,
}

struct PollerState {
    polling: bool,
    subject: Option<String>,
    /// Bumped by every start/stop; fetches from an older session are discarded
    session: u64,
    hidden: bool,
    last_activity: Instant,
    last_poll: Option<Instant>,
    consecutive_failures: u32,
    fetching: bool,
    catch_up: bool,
    snapshot: Option<Arc<NotificationUpdate>>,
    snapshot_subject: Option<String>,
    loop_handle: Option<JoinHandle<()>>,
}

struct PollerInner {
    config: PollingConfig,
    source: Arc<dyn NotificationSource>,
    state: Mutex<PollerState>,
    updates: SubscriberList<Arc<NotificationUpdate>>,
    errors: SubscriberList<FetchError>,
    reschedule: Notify,
}

impl PollerInner {
    fn state(&self) -> MutexGuard<'_, PollerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn current_interval(&self) -> Duration {
        let state = self.state();
        self.config
            .base_interval(state.hidden, state.last_activity.elapsed())
    }

    fn next_delay(&self) -> Duration {
        let interval = self.current_interval();
        let failures = self.state().consecutive_failures;
        self.config.backoff_interval(interval, failures)
    }

    fn is_session(&self, session: u64) -> bool {
        let state = self.state();
        state.polling && state.session == session
    }

    fn take_catch_up(&self) -> bool {
        std::mem::take(&mut self.state().catch_up)
    }

    async fn run(self: Arc<Self>, session: u64) {
        self.fetch_notifications().await;

        while self.is_session(session) {
            if self.take_catch_up() {
                log::debug!("Catching up after the page became visible");
                self.fetch_notifications().await;
            }

            let delay = self.next_delay();
            log::debug!("Next notification poll in {:?}", delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => self.fetch_notifications().await,
                _ = self.reschedule.notified() => log::debug!("Notification poll rescheduled"),
            }
        }
    }

    async fn fetch_notifications(&self) {
        let (subject, session) = {
            let mut state = self.state();
            let subject = match (&state.subject, state.polling) {
                (Some(subject), true) => subject.clone(),
                _ => return,
            };
            if state.fetching {
                log::debug!("Notification fetch already in flight, skipping");
                return;
            }

            let now = Instant::now();
            if let Some(last_poll) = state.last_poll {
                let since = now.duration_since(last_poll);
                if since < self.config.min_fetch_gap {
                    log::debug!("Last notification fetch was {:?} ago, skipping", since);
                    return;
                }
            }

            state.last_poll = Some(now);
            state.fetching = true;
            (subject, state.session)
        };

        // Clears `fetching` if this future is dropped mid-fetch, e.g. a manual
        // poll under a timeout
        let mut in_flight = InFlight {
            inner: self,
            session,
            armed: true,
        };
        let result = self.source.fetch_notifications(&subject).await;

        let outcome = {
            let mut state = self.state();
            in_flight.armed = false;
            if state.session != session {
                log::debug!("Discarding notification fetch from a previous session");
                return;
            }
            state.fetching = false;

            match result {
                Ok(notifications) => {
                    let update = Arc::new(NotificationUpdate::new(notifications, Utc::now()));
                    state.snapshot = Some(Arc::clone(&update));
                    state.snapshot_subject = Some(subject.clone());
                    state.consecutive_failures = 0;
                    Ok(update)
                }
                Err(error) => {
                    state.consecutive_failures =
                        (state.consecutive_failures + 1).min(self.config.max_retries);
                    Err((error, state.consecutive_failures))
                }
            }
        };

        // Subscribers run without the state lock held
        match outcome {
            Ok(update) => {
                log::debug!(
                    "Fetched {} notifications ({} unread) for {}",
                    update.notifications().len(),
                    update.unread_count(),
                    subject
                );
                self.updates.notify(&update);
            }
            Err((error, failures)) => {
                log::warn!(
                    "Notification fetch for {} failed ({} consecutive): {}",
                    subject,
                    failures,
                    error
                );
                self.errors.notify(&error);
            }
        }
    }
}

struct InFlight<'a> {
    inner: &'a PollerInner,
    session: u64,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state();
        if state.session == self.session {
            log::debug!("Notification fetch abandoned before completion");
            state.fetching = false;
        }
    }
}

/// Background notification poller whose cadence follows user engagement.
///
/// `start` spawns onto the ambient Tokio runtime. Dropping the poller stops it.
pub struct SmartNotificationPoller {
    inner: Arc<PollerInner>,
}

impl SmartNotificationPoller {
    pub fn new(config: PollingConfig, source: Arc<dyn NotificationSource>) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                config,
                source,
                state: Mutex::new(PollerState {
                    polling: false,
                    subject: None,
                    session: 0,
                    hidden: false,
                    last_activity: Instant::now(),
                    last_poll: None,
                    consecutive_failures: 0,
                    fetching: false,
                    catch_up: false,
                    snapshot: None,
                    snapshot_subject: None,
                    loop_handle: None,
                }),
                updates: SubscriberList::new("update"),
                errors: SubscriberList::new("error"),
                reschedule: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.inner.config
    }

    /// Start polling for `subject`, restarting if already polling.
    ///
    /// A snapshot cached for the same subject is delivered to the current
    /// update subscribers before this returns, ahead of the first fetch.
    pub fn start(&self, subject: impl Into<String>) {
        let subject = subject.into();
        if self.is_polling() {
            self.stop();
        }

        let (session, replay) = {
            let mut state = self.inner.state();
            state.session += 1;
            state.polling = true;
            state.subject = Some(subject.clone());
            state.consecutive_failures = 0;
            state.last_activity = Instant::now();
            state.last_poll = None;
            state.fetching = false;
            state.catch_up = false;

            let replay = match &state.snapshot_subject {
                Some(cached_for) if *cached_for == subject => state.snapshot.clone(),
                _ => None,
            };
            (state.session, replay)
        };

        log::info!("Started notification polling for {}", subject);

        if let Some(snapshot) = replay {
            log::debug!(
                "Replaying cached notifications ({} unread) for {}",
                snapshot.unread_count(),
                subject
            );
            self.inner.updates.notify(&snapshot);
        }

        let handle = tokio::spawn(Arc::clone(&self.inner).run(session));
        self.inner.state().loop_handle = Some(handle);
    }

    /// Stop scheduling. Subscribers and the cached snapshot are kept.
    pub fn stop(&self) {
        let handle = {
            let mut state = self.inner.state();
            if state.polling {
                log::info!(
                    "Stopped notification polling for {}",
                    state.subject.as_deref().unwrap_or_default()
                );
            }
            state.polling = false;
            state.session += 1;
            state.fetching = false;
            state.loop_handle.take()
        };

        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Fetch now, outside the schedule. Subject to the minimum fetch gap.
    pub async fn poll(&self) {
        self.inner.fetch_notifications().await;
    }

    pub fn record_activity(&self, signal: ActivitySignal) {
        log::trace!("User activity: {}", signal);
        self.inner.state().last_activity = Instant::now();
    }

    /// Visibility change notification from the hosting page
    pub fn set_hidden(&self, hidden: bool) {
        {
            let mut state = self.inner.state();
            if state.hidden == hidden {
                return;
            }
            state.hidden = hidden;

            if !hidden {
                let now = Instant::now();
                state.last_activity = now;
                let stale = state.last_poll.map_or(true, |last_poll| {
                    now.duration_since(last_poll) > self.inner.config.active_interval
                });
                state.catch_up = state.polling && stale;
            }
        }

        log::debug!("Page visibility changed, hidden: {}", hidden);
        self.inner.reschedule.notify_one();
    }

    /// Base interval for the current visibility and activity, before backoff
    pub fn current_interval(&self) -> Duration {
        self.inner.current_interval()
    }

    /// Delay the scheduler would wait right now, including failure backoff
    pub fn next_poll_delay(&self) -> Duration {
        self.inner.next_delay()
    }

    pub fn on_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Arc<NotificationUpdate>) + Send + Sync + 'static,
    {
        self.inner.updates.subscribe(callback)
    }

    pub fn on_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(FetchError) + Send + Sync + 'static,
    {
        self.inner.errors.subscribe(callback)
    }

    pub fn is_polling(&self) -> bool {
        self.inner.state().polling
    }

    pub fn subject(&self) -> Option<String> {
        self.inner.state().subject.clone()
    }

    pub fn snapshot(&self) -> Option<Arc<NotificationUpdate>> {
        self.inner.state().snapshot.clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.state().consecutive_failures
    }

    pub fn stats(&self) -> PollerStats {
        let current_interval = self.current_interval();
        let next_delay = self.next_poll_delay();
        let state = self.inner.state();

        PollerStats {
            polling: state.polling,
            subject: state.subject.clone(),
            hidden: state.hidden,
            consecutive_failures: state.consecutive_failures,
            current_interval_ms: current_interval.as_millis() as u64,
            next_delay_ms: next_delay.as_millis() as u64,
            update_subscribers: self.inner.updates.len(),
            error_subscribers: self.inner.errors.len(),
            cached_unread: state.snapshot.as_ref().map(|s| s.unread_count()),
        }
    }
}

impl Drop for SmartNotificationPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Diagnostics snapshot of the poller
#[derive(Debug, Clone, Serialize)]
pub struct PollerStats {
    pub polling: bool,
    pub subject: Option<String>,
    pub hidden: bool,
    pub consecutive_failures: u32,
    pub current_interval_ms: u64,
    pub next_delay_ms: u64,
    pub update_subscribers: usize,
    pub error_subscribers: usize,
    pub cached_unread: Option<usize>,
}
