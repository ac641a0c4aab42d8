use getset::Getters;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use strum_macros::{Display, EnumString};

lazy_static! {
    /// Headers that change per call without changing what the server answers
    static ref VOLATILE_HEADERS: HashSet<&'static str> = [
        "authorization",
        "cookie",
        "x-request-id",
        "x-correlation-id",
        "x-client-id",
        "x-trace-id",
        "traceparent",
        "x-amzn-trace-id",
    ]
    .into_iter()
    .collect();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

/// Statically typed description of an outgoing request.
///
/// Header names are stored lowercased in a sorted map, so the order in which
/// headers were added never influences the derived [`RequestKey`].
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[get = "pub"]
pub struct RequestDescriptor {
    method: Method,
    url: String,
    headers: BTreeMap<String, String>,
    body: Option<String>,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().trim().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Headers that take part in key derivation
    pub fn stable_headers(&self) -> impl Iterator<Item = (&String, &String)> {
        self.headers
            .iter()
            .filter(|(name, _)| !VOLATILE_HEADERS.contains(name.as_str()))
    }

    pub fn key(&self) -> RequestKey {
        RequestKey::from_descriptor(self)
    }
}

/// Deterministic identity of a logical request.
///
/// Rendered as `"{METHOD} {url}#{digest}"` where the digest covers the stable
/// headers and the body. Keeping method and URL readable lets callers cancel
/// by pattern.
#[derive(Hash, Eq, PartialEq, Clone, Debug, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn from_descriptor(descriptor: &RequestDescriptor) -> Self {
        let mut hasher = Sha256::new();
        for (name, value) in descriptor.stable_headers() {
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(value.trim().as_bytes());
            hasher.update(b"\n");
        }
        // Separates the header block from the body so the two can't alias
        hasher.update(b"\n");
        if let Some(body) = descriptor.body() {
            hasher.update(body.as_bytes());
        }

        let digest = hex::encode(hasher.finalize());
        RequestKey(format!(
            "{} {}#{}",
            descriptor.method(),
            descriptor.url(),
            digest
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Selects pending requests for targeted cancellation
#[derive(Clone, Debug)]
pub enum KeyPattern {
    Substring(String),
    Regex(Regex),
}

impl KeyPattern {
    pub fn matches(&self, key: &RequestKey) -> bool {
        match self {
            KeyPattern::Substring(needle) => key.as_str().contains(needle.as_str()),
            KeyPattern::Regex(regex) => regex.is_match(key.as_str()),
        }
    }
}

impl From<&str> for KeyPattern {
    fn from(value: &str) -> Self {
        KeyPattern::Substring(value.to_string())
    }
}

impl From<String> for KeyPattern {
    fn from(value: String) -> Self {
        KeyPattern::Substring(value)
    }
}

impl From<Regex> for KeyPattern {
    fn from(value: Regex) -> Self {
        KeyPattern::Regex(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_key_ignores_header_order_and_case() {
        let a = RequestDescriptor::get("/api/feed")
            .header("Accept", "application/json")
            .header("X-Feed-Cursor", "abc");
        let b = RequestDescriptor::get("/api/feed")
            .header("x-feed-cursor", "abc")
            .header("accept", "application/json");

        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_key_ignores_volatile_headers() {
        let a = RequestDescriptor::get("/api/notifications")
            .header("Authorization", "Bearer one")
            .header("X-Request-Id", "1111");
        let b = RequestDescriptor::get("/api/notifications")
            .header("Authorization", "Bearer two")
            .header("X-Correlation-Id", "2222")
            .header("traceparent", "00-abc-def-01");

        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_key_distinguishes_semantic_fields() {
        let base = RequestDescriptor::post("/api/posts").with_body("{\"text\":\"hi\"}");

        assert_ne!(
            base.key(),
            RequestDescriptor::post("/api/posts").with_body("{}").key()
        );
        assert_ne!(
            base.key(),
            RequestDescriptor::post("/api/other")
                .with_body("{\"text\":\"hi\"}")
                .key()
        );
        assert_ne!(
            base.key(),
            RequestDescriptor::new(Method::Put, "/api/posts")
                .with_body("{\"text\":\"hi\"}")
                .key()
        );
        assert_ne!(
            base.key(),
            base.clone().header("Accept-Language", "de").key()
        );
    }

    #[test]
    fn test_builder_and_getters() {
        let request = RequestDescriptor::post("/api/posts")
            .header(" Content-Type ", "application/json")
            .with_body("{}");

        assert_eq!(*request.method(), Method::Post);
        assert_eq!(request.url(), "/api/posts");
        assert_eq!(request.body().as_deref(), Some("{}"));
        assert_eq!(
            request.headers().get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(RequestDescriptor::get("/api/feed").body(), &None);
    }

    #[test]
    fn test_key_is_readable() {
        let key = RequestDescriptor::get("/api/notifications?subject=alice").key();
        assert!(key.as_str().starts_with("GET /api/notifications?subject=alice#"));
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(Method::from_str("get").unwrap(), Method::Get);
        assert_eq!(Method::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_key_pattern_matching() {
        let key = RequestDescriptor::get("/api/notifications?subject=alice").key();

        assert!(KeyPattern::from("/api/notifications").matches(&key));
        assert!(!KeyPattern::from("/api/posts").matches(&key));
        assert!(KeyPattern::from(Regex::new(r"^GET /api/notif").unwrap()).matches(&key));
        assert!(!KeyPattern::from(Regex::new(r"^POST ").unwrap()).matches(&key));
    }
}
