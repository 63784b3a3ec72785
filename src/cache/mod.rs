//! Layered caching: an in-memory LRU for decoded images and a disk-backed
//! blob store with asynchronous write-back.

pub mod disk;
pub(crate) mod lru;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

/// Key→blob storage consulted by the pipeline for original data and
/// processed images. Implemented by [`disk::DiskCache`]; embedders may
/// substitute their own store.
#[async_trait]
pub trait DataCaching: Send + Sync {
    /// Reads must observe writes registered before them, even when the
    /// write has not reached the backing store yet.
    async fn cached_data(&self, key: &str) -> Option<Bytes>;

    fn store_data(&self, key: &str, data: Bytes);

    fn remove_data(&self, key: &str);
}
