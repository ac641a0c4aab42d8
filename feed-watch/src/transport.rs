use async_trait::async_trait;
use feed_client::{CancellationToken, Method, RequestDescriptor, Transport, TransportError};
use std::time::Instant;
use surf::middleware::{Middleware, Next};
use surf::{Client, Request, RequestBuilder, Response, Url};

/// Logs every outgoing request with its status and latency
pub struct SurfLogging;

#[surf::utils::async_trait]
impl Middleware for SurfLogging {
    async fn handle(&self, req: Request, client: Client, next: Next<'_>) -> surf::Result<Response> {
        let method = req.method();
        let url = req.url().clone();
        let started = Instant::now();
        log::debug!("{} {}", method, url);

        let response = next.run(req, client).await;
        match &response {
            Ok(response) => log::debug!(
                "{} {} -> {} in {:?}",
                method,
                url,
                response.status(),
                started.elapsed()
            ),
            Err(error) => log::warn!("{} {} failed: {}", method, url, error),
        }
        response
    }
}

/// [`Transport`] over a surf HTTP client
#[derive(Clone)]
pub struct SurfTransport {
    http: Client,
}

impl Default for SurfTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfTransport {
    pub fn new() -> Self {
        Self {
            http: Client::new().with(SurfLogging),
        }
    }

    async fn execute(&self, request: &RequestDescriptor) -> Result<String, TransportError> {
        let url = Url::parse(request.url()).map_err(|error| {
            TransportError::Connection(format!("invalid url {}: {}", request.url(), error))
        })?;
        let mut builder = RequestBuilder::new(http_method(*request.method()), url);
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body() {
            builder = builder.body_string(body.clone());
        }

        let mut response = self
            .http
            .send(builder.build())
            .await
            .map_err(|error| TransportError::Connection(error.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                status: response.status().into(),
                message: response.status().canonical_reason().to_string(),
            });
        }

        response
            .body_string()
            .await
            .map_err(|error| TransportError::Connection(error.to_string()))
    }
}

fn http_method(method: Method) -> surf::http::Method {
    match method {
        Method::Get => surf::http::Method::Get,
        Method::Post => surf::http::Method::Post,
        Method::Put => surf::http::Method::Put,
        Method::Patch => surf::http::Method::Patch,
        Method::Delete => surf::http::Method::Delete,
        Method::Head => surf::http::Method::Head,
    }
}

#[async_trait]
impl Transport for SurfTransport {
    async fn send(
        &self,
        request: &RequestDescriptor,
        token: CancellationToken,
    ) -> Result<String, TransportError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                Err(TransportError::Connection("request cancelled".to_string()))
            }
            result = self.execute(request) => result,
        }
    }
}
