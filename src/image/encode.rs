//! Encoder contract for writing processed images to the disk cache.

use bytes::Bytes;

use crate::image::decode::encode_raw_bitmap;
use crate::image::ImageContainer;
use crate::request::ImageRequest;

pub struct EncodingContext<'a> {
    pub request: &'a ImageRequest,
}

/// Serializes a processed container for disk storage. `None` opts the
/// container out of disk caching (e.g. formats the encoder cannot express).
pub trait ImageEncoder: Send + Sync {
    fn encode(&self, container: &ImageContainer, context: &EncodingContext<'_>) -> Option<Bytes>;
}

/// Built-in encoder producing the raw RGBA8 envelope.
pub struct RawBitmapEncoder;

impl ImageEncoder for RawBitmapEncoder {
    fn encode(&self, container: &ImageContainer, _context: &EncodingContext<'_>) -> Option<Bytes> {
        // Animated payloads round-trip through their original data.
        if let Some(data) = &container.data {
            return Some(data.clone());
        }
        let image = &container.image;
        Some(encode_raw_bitmap(image.width, image.height, &image.pixels))
    }
}
