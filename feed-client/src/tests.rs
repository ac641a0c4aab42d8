use crate::deduplication::{CancellationToken, DeduplicationConfig, RequestDeduplicator};
use crate::error::{FetchError, TransportError};
use crate::notification::Notification;
use crate::poller::{NotificationSource, PollingConfig, SmartNotificationPoller};
use crate::request_key::RequestDescriptor;
use crate::{client::Transport, NotificationClient};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

type FetchResult = Result<Vec<Notification>, FetchError>;

/// Notification source that replays a script, then repeats a fallback
pub(crate) struct ScriptedSource {
    script: Mutex<VecDeque<FetchResult>>,
    fallback: FetchResult,
    latency: Duration,
    calls: Mutex<Vec<(Instant, String)>>,
}

impl ScriptedSource {
    pub(crate) fn new(script: Vec<FetchResult>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Ok(vec![]),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn always(result: FetchResult) -> Self {
        Self {
            fallback: result,
            ..Self::new(vec![])
        }
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub(crate) fn subjects(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, subject)| subject.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationSource for ScriptedSource {
    async fn fetch_notifications(&self, subject: &str) -> FetchResult {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), subject.to_string()));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Error,
    Update { notifications: usize, unread: usize },
}

fn record_events(poller: &SmartNotificationPoller) -> Arc<Mutex<Vec<Event>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        let _updates = poller.on_update(move |update| {
            events.lock().unwrap().push(Event::Update {
                notifications: update.notifications().len(),
                unread: update.unread_count(),
            })
        });
    }
    {
        let events = events.clone();
        let _errors = poller.on_error(move |_| events.lock().unwrap().push(Event::Error));
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_poller_recovers_after_two_failures() {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = PollingConfig {
        active_interval: Duration::from_millis(30_000),
        idle_interval: Duration::from_millis(120_000),
        hidden_interval: Duration::from_millis(300_000),
        idle_threshold: Duration::from_millis(120_000),
        ..PollingConfig::default()
    };
    let source = Arc::new(ScriptedSource::new(vec![
        Err(FetchError::Transport("connection reset".to_string())),
        Err(FetchError::Transport("connection reset".to_string())),
        Ok(vec![Notification::new("n1", false), Notification::new("n2", true)]),
    ]));
    let poller = SmartNotificationPoller::new(config, source.clone());
    let events = record_events(&poller);

    poller.start("alice");
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(poller.consecutive_failures(), 1);

    // Backoff doubles: 60s, then 120s
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(poller.consecutive_failures(), 2);
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            Event::Error,
            Event::Error,
            Event::Update {
                notifications: 2,
                unread: 1
            },
        ]
    );
    assert_eq!(poller.consecutive_failures(), 0);
    // No activity since start, so the idle cadence applies without backoff
    assert_eq!(poller.next_poll_delay(), Duration::from_secs(120));
    assert_eq!(source.calls(), 3);

    let snapshot = poller.snapshot().unwrap();
    assert_eq!(snapshot.unread_count(), 1);
    assert_eq!(snapshot.notifications()[0].id, "n1");
}

/// Counts transport calls; each one takes a second
struct SlowTransport {
    calls: AtomicUsize,
}

#[async_trait]
impl Transport for SlowTransport {
    async fn send(
        &self,
        _request: &RequestDescriptor,
        token: CancellationToken,
    ) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = token.cancelled() => Err(TransportError::Connection("aborted".to_string())),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                Ok(r#"[{"id":"n1","read":false}]"#.to_string())
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_pollers_share_requests_through_the_deduplicator() {
    let transport = Arc::new(SlowTransport {
        calls: AtomicUsize::new(0),
    });
    let deduplicator = Arc::new(RequestDeduplicator::new(DeduplicationConfig::default()));
    let client = NotificationClient::new("/api", transport.clone(), deduplicator.clone());

    // Two independently mounted consumers polling the same subject
    let first = SmartNotificationPoller::new(PollingConfig::default(), Arc::new(client.clone()));
    let second = SmartNotificationPoller::new(PollingConfig::default(), Arc::new(client.clone()));
    let first_events = record_events(&first);
    let second_events = record_events(&second);

    first.start("alice");
    second.start("alice");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(deduplicator.is_pending(&client.notifications_request("alice")));

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    let expected = vec![Event::Update {
        notifications: 1,
        unread: 1,
    }];
    assert_eq!(*first_events.lock().unwrap(), expected);
    assert_eq!(*second_events.lock().unwrap(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_logout_cancels_in_flight_poll() {
    let transport = Arc::new(SlowTransport {
        calls: AtomicUsize::new(0),
    });
    let deduplicator = Arc::new(RequestDeduplicator::new(DeduplicationConfig::default()));
    let client = NotificationClient::new("/api", transport, deduplicator.clone());
    let poller = SmartNotificationPoller::new(PollingConfig::default(), Arc::new(client));
    let events = record_events(&poller);

    poller.start("alice");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(deduplicator.cancel_all(), 1);
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(*events.lock().unwrap(), vec![Event::Error]);
    assert_eq!(poller.consecutive_failures(), 1);
    assert!(poller.is_polling());
}
