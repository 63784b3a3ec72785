//! Cache-key and load-key derivation.
//!
//! Two families of keys exist. *Cache keys* identify artifacts (memory and
//! disk entries). *Load keys* identify in-flight work and drive
//! deduplication across the pipeline stages.

use crate::loader::CachePolicy;
use crate::request::ImageRequest;

/// The URL string all keys derive from: the caller-provided canonical form
/// when present, the absolute resource URL otherwise.
pub(crate) fn preferred_url(request: &ImageRequest) -> &str {
    match &request.options().filtered_url {
        Some(filtered) => filtered.as_str(),
        None => request.url().as_str(),
    }
}

/// Memory-cache key for the final (processed) image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageCacheKey {
    Custom(String),
    Derived {
        url: String,
        processors: Vec<String>,
    },
}

impl ImageCacheKey {
    pub fn for_request(request: &ImageRequest) -> Self {
        if let Some(custom) = &request.options().cache_key {
            return ImageCacheKey::Custom(custom.clone());
        }
        ImageCacheKey::Derived {
            url: preferred_url(request).to_string(),
            processors: request
                .processors()
                .iter()
                .map(|p| p.identifier())
                .collect(),
        }
    }
}

/// Disk-cache key for the final (processed) image: URL plus the composed
/// processor identifier.
pub(crate) fn final_image_disk_key(request: &ImageRequest) -> String {
    let mut key = preferred_url(request).to_string();
    for processor in request.processors() {
        key.push_str(&processor.identifier());
    }
    key
}

/// Disk-cache key for the original image data.
///
/// Derived from the URL alone so that deduplicated fetches share one disk
/// entry across requests that differ only in processors.
pub(crate) fn original_image_disk_key(request: &ImageRequest) -> String {
    preferred_url(request).to_string()
}

/// Load key for the original-data fetch and the original decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataLoadKey {
    Custom(String),
    Derived {
        url: String,
        cache_policy: CachePolicy,
        allows_cellular_access: bool,
    },
}

impl DataLoadKey {
    pub fn for_request(request: &ImageRequest) -> Self {
        if let Some(custom) = &request.options().load_key {
            return DataLoadKey::Custom(custom.clone());
        }
        DataLoadKey::Derived {
            url: request.url().as_str().to_string(),
            cache_policy: request.resource().cache_policy(),
            allows_cellular_access: request.resource().allows_cellular_access(),
        }
    }
}

/// Load key for the processed and decompressed stages: the final-image
/// identity plus the original-data identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageLoadKey {
    pub cache_key: ImageCacheKey,
    pub data_key: DataLoadKey,
}

impl ImageLoadKey {
    pub fn for_request(request: &ImageRequest) -> Self {
        Self {
            cache_key: ImageCacheKey::for_request(request),
            data_key: DataLoadKey::for_request(request),
        }
    }
}
