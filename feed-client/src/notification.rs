use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

/// A single notification record as delivered by the backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    /// What triggered the notification, e.g. "like", "reply", "mention"
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub author: Option<String>,
    pub read: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Reason-specific payload, passed through untouched
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(id: impl Into<String>, read: bool) -> Self {
        Self {
            id: id.into(),
            reason: String::new(),
            author: None,
            read,
            created_at: None,
            payload: serde_json::Value::Null,
        }
    }
}

/// Immutable result of one successful poll.
///
/// Every poll builds a fresh value; subscribers receive it behind an `Arc`.
#[derive(Clone, Debug, PartialEq, Getters, CopyGetters, Serialize)]
pub struct NotificationUpdate {
    #[getset(get = "pub")]
    notifications: Vec<Notification>,
    #[getset(get_copy = "pub")]
    unread_count: usize,
    #[getset(get_copy = "pub")]
    timestamp: DateTime<Utc>,
}

impl NotificationUpdate {
    pub fn new(notifications: Vec<Notification>, timestamp: DateTime<Utc>) -> Self {
        let unread_count = notifications.iter().filter(|n| !n.read).count();
        Self {
            notifications,
            unread_count,
            timestamp,
        }
    }
}
