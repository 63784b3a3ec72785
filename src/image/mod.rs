//! Image containers and the decode/encode/process contracts.

pub mod decode;
pub mod encode;
pub mod process;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::loader::UrlResponse;

/// Known payload formats, detected from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Png,
    Jpeg,
    Gif,
    /// The built-in uncompressed RGBA8 envelope.
    Raw,
}

impl ImageType {
    pub fn detect(data: &[u8]) -> Option<ImageType> {
        if data.starts_with(&[0x89, b'P', b'N', b'G']) {
            Some(ImageType::Png)
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageType::Jpeg)
        } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            Some(ImageType::Gif)
        } else if data.starts_with(decode::RAW_MAGIC) {
            Some(ImageType::Raw)
        } else {
            None
        }
    }
}

/// A decoded bitmap.
///
/// `needs_decompression` marks bitmaps whose backing storage has not been
/// materialized yet; the decompression stage clears it. Animated images keep
/// their encoded payload in [`ImageContainer::data`] and skip decompression.
#[derive(Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: usize,
    pub pixels: Bytes,
    pub needs_decompression: bool,
    pub is_animated: bool,
}

impl DecodedImage {
    /// Memory-cache cost of this bitmap.
    pub fn cost(&self) -> u64 {
        self.bytes_per_row as u64 * self.height as u64
    }

    /// Materialized copy with the decompression flag cleared.
    pub fn decompressed(&self) -> DecodedImage {
        let mut copy = self.clone();
        copy.pixels = Bytes::copy_from_slice(&self.pixels);
        copy.needs_decompression = false;
        copy
    }
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes_per_row", &self.bytes_per_row)
            .field("needs_decompression", &self.needs_decompression)
            .field("is_animated", &self.is_animated)
            .finish()
    }
}

/// A decoded image plus everything the pipeline knows about it.
#[derive(Clone)]
pub struct ImageContainer {
    pub image: Arc<DecodedImage>,
    pub image_type: Option<ImageType>,
    /// Marks intermediate progressive frames.
    pub is_preview: bool,
    /// Original encoded payload, kept for animated images.
    pub data: Option<Bytes>,
    pub user_info: HashMap<String, serde_json::Value>,
}

impl ImageContainer {
    pub fn new(image: DecodedImage) -> Self {
        Self {
            image: Arc::new(image),
            image_type: None,
            is_preview: false,
            data: None,
            user_info: HashMap::new(),
        }
    }

    pub fn cost(&self) -> u64 {
        self.image.cost()
    }

    pub(crate) fn needs_decompression(&self) -> bool {
        self.image.needs_decompression && !self.image.is_animated
    }
}

impl fmt::Debug for ImageContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageContainer")
            .field("image", &self.image)
            .field("image_type", &self.image_type)
            .field("is_preview", &self.is_preview)
            .finish()
    }
}

/// The final product of a load: a container plus the transport response
/// (absent when served from a cache).
#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub container: ImageContainer,
    pub url_response: Option<UrlResponse>,
}

impl ImageResponse {
    pub fn new(container: ImageContainer, url_response: Option<UrlResponse>) -> Self {
        Self {
            container,
            url_response,
        }
    }

    pub fn image(&self) -> &DecodedImage {
        &self.container.image
    }
}
