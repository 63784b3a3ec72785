//! Request model: what to fetch, how to transform it, and how urgently.

pub mod keys;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::image::process::ImageProcessor;
use crate::loader::{CachePolicy, UrlRequest};

/// Relative urgency of a request.
///
/// Aggregated across subscribers of a shared task: the effective priority is
/// always the maximum over the live subscribers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Priority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl Priority {
    pub(crate) fn bucket(self) -> usize {
        match self {
            Priority::VeryLow => 0,
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::VeryHigh => 4,
        }
    }
}

/// The resource a request points at: a plain URL or a full HTTP envelope.
#[derive(Debug, Clone)]
pub enum Resource {
    Url(Url),
    Request(UrlRequest),
}

impl Resource {
    pub fn url(&self) -> &Url {
        match self {
            Resource::Url(url) => url,
            Resource::Request(request) => &request.url,
        }
    }

    pub(crate) fn cache_policy(&self) -> CachePolicy {
        match self {
            Resource::Url(_) => CachePolicy::default(),
            Resource::Request(request) => request.cache_policy,
        }
    }

    pub(crate) fn allows_cellular_access(&self) -> bool {
        match self {
            Resource::Url(_) => true,
            Resource::Request(request) => request.allows_cellular_access,
        }
    }

    pub(crate) fn as_url_request(&self) -> UrlRequest {
        match self {
            Resource::Url(url) => UrlRequest::new(url.clone()),
            Resource::Request(request) => request.clone(),
        }
    }
}

/// Per-request options controlling cache interaction and key derivation.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Allow reading the final image from the memory cache.
    pub is_memory_cache_read_allowed: bool,
    /// Allow writing the final image into the memory cache.
    pub is_memory_cache_write_allowed: bool,
    /// Canonical URL used for cache keys instead of the resource URL, e.g.
    /// to strip volatile query parameters.
    pub filtered_url: Option<String>,
    /// Overrides the derived memory-cache key for the final image.
    pub cache_key: Option<String>,
    /// Overrides the derived load key for the original data fetch.
    pub load_key: Option<String>,
    /// Opaque caller payload, carried through untouched.
    pub user_info: HashMap<String, serde_json::Value>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self {
            is_memory_cache_read_allowed: true,
            is_memory_cache_write_allowed: true,
            filtered_url: None,
            cache_key: None,
            load_key: None,
            user_info: HashMap::new(),
        }
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("read", &self.is_memory_cache_read_allowed)
            .field("write", &self.is_memory_cache_write_allowed)
            .field("filtered_url", &self.filtered_url)
            .field("cache_key", &self.cache_key)
            .field("load_key", &self.load_key)
            .finish()
    }
}

struct RequestPayload {
    resource: Resource,
    processors: Vec<Arc<dyn ImageProcessor>>,
    priority: Priority,
    options: RequestOptions,
}

/// An immutable request for an image.
///
/// Cloning is cheap; the payload is shared and copied on first mutation.
#[derive(Clone)]
pub struct ImageRequest {
    payload: Arc<RequestPayload>,
}

impl ImageRequest {
    pub fn new(url: Url) -> Self {
        Self::with_resource(Resource::Url(url))
    }

    pub fn with_url_request(request: UrlRequest) -> Self {
        Self::with_resource(Resource::Request(request))
    }

    pub fn with_resource(resource: Resource) -> Self {
        Self {
            payload: Arc::new(RequestPayload {
                resource,
                processors: Vec::new(),
                priority: Priority::default(),
                options: RequestOptions::new(),
            }),
        }
    }

    pub fn resource(&self) -> &Resource {
        &self.payload.resource
    }

    pub fn url(&self) -> &Url {
        self.payload.resource.url()
    }

    pub fn processors(&self) -> &[Arc<dyn ImageProcessor>] {
        &self.payload.processors
    }

    pub fn priority(&self) -> Priority {
        self.payload.priority
    }

    pub fn options(&self) -> &RequestOptions {
        &self.payload.options
    }

    pub fn with_processors(mut self, processors: Vec<Arc<dyn ImageProcessor>>) -> Self {
        self.make_mut().processors = processors;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.make_mut().priority = priority;
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.make_mut().options = options;
        self
    }

    /// Same request with the last processor removed. Used to share work
    /// between requests that differ only in a processor suffix.
    pub(crate) fn dropping_last_processor(&self) -> (Self, Arc<dyn ImageProcessor>) {
        let mut copy = self.clone();
        let popped = copy
            .make_mut()
            .processors
            .pop()
            .expect("dropping_last_processor on empty processor list");
        (copy, popped)
    }

    fn make_mut(&mut self) -> &mut RequestPayload {
        Arc::make_mut(&mut self.payload)
    }
}

impl Clone for RequestPayload {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
            processors: self.processors.clone(),
            priority: self.priority,
            options: self.options.clone(),
        }
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("url", &self.url().as_str())
            .field("processors", &self.payload.processors.len())
            .field("priority", &self.payload.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::process::tests_support::NamedProcessor;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::VeryHigh > Priority::High);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn clone_is_copy_on_write() {
        let a = ImageRequest::new(url("https://example.com/a.png"));
        let b = a.clone().with_priority(Priority::High);
        assert_eq!(a.priority(), Priority::Normal);
        assert_eq!(b.priority(), Priority::High);
        assert_eq!(a.url(), b.url());
    }

    #[test]
    fn dropping_last_processor_pops_in_order() {
        let request = ImageRequest::new(url("https://example.com/a.png")).with_processors(vec![
            Arc::new(NamedProcessor::new("a")),
            Arc::new(NamedProcessor::new("b")),
        ]);
        let (rest, popped) = request.dropping_last_processor();
        assert_eq!(popped.identifier(), "b");
        assert_eq!(rest.processors().len(), 1);
        assert_eq!(rest.processors()[0].identifier(), "a");
        assert_eq!(request.processors().len(), 2);
    }
}
