use async_trait::async_trait;
use feed_client::{
    CancellationToken, DeduplicationConfig, FetchError, Notification, NotificationSource,
    PollingConfig, RequestDeduplicator, RequestDescriptor, SmartNotificationPoller,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct InMemorySource {
    calls: AtomicUsize,
}

#[async_trait]
impl NotificationSource for InMemorySource {
    async fn fetch_notifications(&self, _subject: &str) -> Result<Vec<Notification>, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((0..=n)
            .map(|i| Notification::new(format!("n{}", i), i % 2 == 1))
            .collect())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("=== Request deduplication ===");
    let deduplicator = Arc::new(RequestDeduplicator::<String>::new(DeduplicationConfig::default()));
    let executions = Arc::new(AtomicUsize::new(0));
    let request = RequestDescriptor::get("/api/feed").header("Accept", "application/json");

    let mut handles = vec![];
    for i in 0..5 {
        let deduplicator = deduplicator.clone();
        let executions = executions.clone();
        let request = request.clone().header("X-Request-Id", format!("req-{}", i));
        handles.push(tokio::spawn(async move {
            deduplicator
                .dedupe(
                    &request,
                    move |_token: CancellationToken| {
                        let executions = executions.clone();
                        async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Ok::<_, std::io::Error>("feed page".to_string())
                        }
                    },
                    None,
                )
                .await
        }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("While pending: {:?}", deduplicator.stats());

    for handle in handles {
        println!("Caller got: {:?}", handle.await?);
    }
    println!("Network calls made: {}", executions.load(Ordering::SeqCst));
    println!("After settling: {:?}", deduplicator.stats());

    println!("\n=== Notification polling ===");
    let config = PollingConfig {
        active_interval: Duration::from_secs(2),
        min_fetch_gap: Duration::from_secs(1),
        ..PollingConfig::default()
    };
    let poller = SmartNotificationPoller::new(
        config,
        Arc::new(InMemorySource {
            calls: AtomicUsize::new(0),
        }),
    );
    let subscription = poller.on_update(|update| {
        println!(
            "{} notifications, {} unread at {}",
            update.notifications().len(),
            update.unread_count(),
            update.timestamp()
        )
    });

    poller.start("alice");
    tokio::time::sleep(Duration::from_secs(5)).await;
    poller.stop();
    println!("Stats: {:?}", poller.stats());

    subscription.unsubscribe();
    Ok(())
}
