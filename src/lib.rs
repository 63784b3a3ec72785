//! image-pipeline
//!
//! A deduplicating, multi-stage, priority-scheduled image loading pipeline.
//! A request for an image (by URL, plus optional transformations) flows
//! through four cooperating stages — fetch data, decode, process,
//! decompress — with concurrent callers coalesced at every stage and the
//! results layered into memory and disk caches.
//!
//! ## Main Modules
//! - [`pipeline`] - The pipeline facade, configuration and per-caller task handles.
//! - [`request`] - The request model and cache/load key derivation.
//! - [`image`] - Image containers and the decode/encode/process contracts.
//! - [`cache`] - The in-memory LRU cache and the disk-backed blob store.
//! - [`loader`] - The transport contract, range resumption and rate limiting.
//! - [`prefetch`] - Low-priority bulk cache warm-up.
//! - [`error`] - Error types.
//!
//! ## Example
//!
//! ```no_run
//! use image_pipeline::{ImageRequest, Pipeline, PipelineConfig};
//! use url::Url;
//!
//! # async fn run() {
//! let pipeline = Pipeline::new(PipelineConfig::new());
//! let request = ImageRequest::new(Url::parse("https://example.com/a.png").unwrap());
//! let task = pipeline.load_image(
//!     request,
//!     None,
//!     Box::new(|result| match result {
//!         Ok(response) => println!("{}x{}", response.image().width, response.image().height),
//!         Err(err) => eprintln!("{err}"),
//!     }),
//! );
//! # let _ = task;
//! # }
//! ```

pub mod cache;
pub mod error;
mod exec;
pub mod image;
pub mod loader;
pub mod pipeline;
pub mod prefetch;
pub mod request;
mod task;

pub use cache::disk::{DiskCache, DiskCacheConfig};
pub use cache::memory::MemoryCache;
pub use cache::DataCaching;
pub use error::{PipelineError, Result};
pub use image::{DecodedImage, ImageContainer, ImageResponse, ImageType};
pub use pipeline::{CallbackQueue, DataCacheItems, ImageTask, Pipeline, PipelineConfig};
pub use prefetch::{PrefetchDestination, Prefetcher};
pub use request::{ImageRequest, Priority, RequestOptions, Resource};
