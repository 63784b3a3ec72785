//! Partial-download resumption.
//!
//! When a download fails or is cancelled midway and the server advertised
//! byte-range support with a validator, the received prefix is parked in a
//! bounded in-memory store. The next attempt for the same URL asks for the
//! remainder with `Range`/`If-Range`; a `206 Partial Content` answer lets
//! the prefix be stitched back in front of the new bytes.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;

use crate::loader::{UrlRequest, UrlResponse};

pub const HTTP_PARTIAL_CONTENT: u16 = 206;

/// A resumable prefix: the bytes received so far plus the validator that
/// guards them.
#[derive(Debug, Clone)]
pub struct ResumableData {
    pub data: Bytes,
    pub validator: String,
}

impl ResumableData {
    /// Builds resumable data from an interrupted response, or `None` when
    /// the server did not promise byte-range resumption.
    pub fn new(response: &UrlResponse, data: Bytes) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        let accept_ranges = response
            .header("Accept-Ranges")
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
        if !accept_ranges {
            return None;
        }
        let validator = response
            .header("ETag")
            .or_else(|| response.header("Last-Modified"))?;
        Some(Self {
            data,
            validator: validator.to_string(),
        })
    }

    /// Adds `Range` and `If-Range` headers asking for the remainder.
    pub fn resuming_request(&self, request: UrlRequest) -> UrlRequest {
        request
            .with_header("Range", format!("bytes={}-", self.data.len()))
            .with_header("If-Range", self.validator.clone())
    }

    /// The server honors resumption only with `206 Partial Content`;
    /// anything else means the stored prefix must be discarded.
    pub fn is_resumed_response(response: &UrlResponse) -> bool {
        response.status_code == HTTP_PARTIAL_CONTENT
    }
}

/// Bounded LRU store of resumable prefixes keyed by URL. Shared across the
/// pipeline; all access goes through one lock.
pub struct ResumableDataStorage {
    state: Mutex<StorageState>,
    size_limit: u64,
    count_limit: usize,
}

struct StorageState {
    entries: HashMap<String, ResumableData>,
    order: VecDeque<String>,
    total_size: u64,
}

impl ResumableDataStorage {
    pub fn new() -> Self {
        // 32 MiB of parked prefixes is plenty for a handful of large images.
        Self::with_limits(32 * 1024 * 1024, 32)
    }

    pub fn with_limits(size_limit: u64, count_limit: usize) -> Self {
        Self {
            state: Mutex::new(StorageState {
                entries: HashMap::new(),
                order: VecDeque::new(),
                total_size: 0,
            }),
            size_limit,
            count_limit,
        }
    }

    pub fn store(&self, url: &str, resumable: ResumableData) {
        let mut state = self.state.lock().unwrap();
        if let Some(old) = state.entries.remove(url) {
            state.total_size -= old.data.len() as u64;
            state.order.retain(|key| key != url);
        }
        state.total_size += resumable.data.len() as u64;
        state.entries.insert(url.to_string(), resumable);
        state.order.push_back(url.to_string());

        while state.total_size > self.size_limit || state.entries.len() > self.count_limit {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            if let Some(evicted) = state.entries.remove(&oldest) {
                state.total_size -= evicted.data.len() as u64;
            }
        }
    }

    /// Removes and returns the entry; resumption is single-shot.
    pub fn take(&self, url: &str) -> Option<ResumableData> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entries.remove(url)?;
        state.order.retain(|key| key != url);
        state.total_size -= entry.data.len() as u64;
        Some(entry)
    }

    pub fn count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }
}

impl Default for ResumableDataStorage {
    fn default() -> Self {
        Self::new()
    }
}
