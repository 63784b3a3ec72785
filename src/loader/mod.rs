//! Data loading: the transport contract and its supporting pieces.

pub mod http;
pub mod rate_limit;
pub mod resumable;

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::LoadError;

/// How a fetch may interact with transport-level caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CachePolicy {
    #[default]
    UseProtocolCachePolicy,
    /// Ignore cached data everywhere and always hit the network.
    ReloadIgnoringCachedData,
    ReturnCacheDataElseLoad,
}

/// HTTP request envelope. A plain URL request uses the defaults.
#[derive(Debug, Clone)]
pub struct UrlRequest {
    pub url: Url,
    pub cache_policy: CachePolicy,
    pub allows_cellular_access: bool,
    pub timeout: Option<Duration>,
    pub headers: Vec<(String, String)>,
}

impl UrlRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            cache_policy: CachePolicy::default(),
            allows_cellular_access: true,
            timeout: None,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Response metadata delivered alongside data chunks.
#[derive(Debug, Clone)]
pub struct UrlResponse {
    pub url: String,
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
}

impl UrlResponse {
    pub fn new(url: impl Into<String>, status_code: u16) -> Self {
        Self {
            url: url.into(),
            status_code,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn expected_content_length(&self) -> Option<u64> {
        self.header("Content-Length")?.trim().parse().ok()
    }
}

/// Handle to in-flight transport work. `cancel` must be idempotent.
pub trait Cancellable: Send {
    fn cancel(&self);
}

/// Receives transport events for one fetch.
///
/// `on_data` is invoked at least once per received chunk, on any thread.
/// `on_finish` is invoked exactly once, after the last `on_data`.
pub struct DataSink {
    pub on_data: Box<dyn FnMut(Bytes, &UrlResponse) + Send>,
    pub on_finish: Box<dyn FnOnce(Option<LoadError>) + Send>,
}

/// The transport contract. The pipeline core never talks HTTP directly; it
/// hands a [`UrlRequest`] and a [`DataSink`] to the configured loader.
pub trait DataLoader: Send + Sync {
    fn load_data(&self, request: &UrlRequest, sink: DataSink) -> Box<dyn Cancellable>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let response =
            UrlResponse::new("https://example.com", 200).with_header("Content-Length", "42");
        assert_eq!(response.header("content-length"), Some("42"));
        assert_eq!(response.expected_content_length(), Some(42));
        assert_eq!(response.header("ETag"), None);
    }
}
