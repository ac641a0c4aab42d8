// Client-side network efficiency: request deduplication and adaptive notification polling

pub mod client;
pub mod config;
pub mod deduplication;
pub mod error;
pub mod notification;
pub mod poller;
pub mod request_key;

#[cfg(test)]
mod tests;

// Re-export for convenience
pub use client::{NotificationClient, Transport};
pub use config::Settings;
pub use deduplication::{
    CancellationToken, DeduplicationConfig, DeduplicationError, DeduplicationStats,
    RequestDeduplicator, RequestOptions, SharedRequestDeduplicator,
};
pub use error::{ConfigError, FetchError, TransportError};
pub use notification::{Notification, NotificationUpdate};
pub use poller::{
    ActivitySignal, NotificationSource, PollerStats, PollingConfig, SmartNotificationPoller,
    Subscription,
};
pub use request_key::{KeyPattern, Method, RequestDescriptor, RequestKey};
