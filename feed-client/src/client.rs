use crate::deduplication::{CancellationToken, RequestOptions, SharedRequestDeduplicator};
use crate::error::{FetchError, TransportError};
use crate::notification::Notification;
use crate::poller::NotificationSource;
use crate::request_key::RequestDescriptor;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

/// Performs a request and returns the response body.
///
/// Implementations should stop promptly once `token` is cancelled.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &RequestDescriptor,
        token: CancellationToken,
    ) -> Result<String, TransportError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NotificationsBody {
    List(Vec<Notification>),
    Envelope { notifications: Vec<Notification> },
}

/// Notification API client. Every request goes through the shared
/// deduplicator, so concurrent fetches for the same subject collapse into one
/// call even across client instances.
#[derive(Clone)]
pub struct NotificationClient {
    base_url: String,
    auth_token: Option<String>,
    transport: Arc<dyn Transport>,
    deduplicator: SharedRequestDeduplicator<String>,
    options: Option<RequestOptions>,
}

impl NotificationClient {
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        deduplicator: SharedRequestDeduplicator<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            transport,
            deduplicator,
            options: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_request_options(mut self, options: RequestOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn deduplicator(&self) -> &SharedRequestDeduplicator<String> {
        &self.deduplicator
    }

    pub fn notifications_request(&self, subject: &str) -> RequestDescriptor {
        let url = format!(
            "{}/notifications?subject={}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(subject)
        );
        let request = RequestDescriptor::get(url).header("Accept", "application/json");
        match &self.auth_token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }
}

#[async_trait]
impl NotificationSource for NotificationClient {
    async fn fetch_notifications(&self, subject: &str) -> Result<Vec<Notification>, FetchError> {
        let request = self.notifications_request(subject);
        let transport = Arc::clone(&self.transport);
        let call_request = request.clone();

        let body = self
            .deduplicator
            .dedupe(
                &request,
                move |token| {
                    let transport = Arc::clone(&transport);
                    let request = call_request.clone();
                    async move { transport.send(&request, token).await }
                },
                self.options.clone(),
            )
            .await?;

        match serde_json::from_str(&body) {
            Ok(NotificationsBody::List(notifications))
            | Ok(NotificationsBody::Envelope { notifications }) => Ok(notifications),
            Err(error) => Err(FetchError::Decode(error.to_string())),
        }
    }
}
