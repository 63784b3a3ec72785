//! Decoder contract and registry.
//!
//! Decoders are external collaborators; the pipeline only specifies the
//! contract and ships one built-in codec for the uncompressed raw envelope
//! so the crate works end-to-end without platform primitives.

use std::sync::Arc;

use bytes::Bytes;

use crate::image::{DecodedImage, ImageContainer, ImageType};
use crate::loader::UrlResponse;
use crate::request::ImageRequest;

/// Everything a factory can inspect when deciding whether it can decode.
pub struct DecodingContext<'a> {
    pub request: &'a ImageRequest,
    pub data: &'a [u8],
    pub url_response: Option<&'a UrlResponse>,
    pub is_completed: bool,
}

/// A stateful decoder bound to one data stream.
///
/// `decode` may be called repeatedly with growing data when progressive
/// decoding is enabled; `None` means "not decodable yet" for partial data
/// and "decoding failed" for completed data.
pub trait ImageDecoder: Send {
    fn decode(&mut self, data: &Bytes, is_completed: bool) -> Option<ImageContainer>;
}

/// Creates decoders for streams it recognizes.
pub trait ImageDecoderFactory: Send + Sync {
    fn make_decoder(&self, context: &DecodingContext<'_>) -> Option<Box<dyn ImageDecoder>>;
}

/// Ordered collection of decoder factories; first match wins.
pub struct DecoderRegistry {
    factories: Vec<Arc<dyn ImageDecoderFactory>>,
}

impl DecoderRegistry {
    /// Registry with the built-in raw-bitmap decoder.
    pub fn new() -> Self {
        Self {
            factories: vec![Arc::new(RawBitmapDecoderFactory)],
        }
    }

    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// New factories take precedence over previously registered ones.
    pub fn register(&mut self, factory: Arc<dyn ImageDecoderFactory>) {
        self.factories.insert(0, factory);
    }

    pub fn decoder(&self, context: &DecodingContext<'_>) -> Option<Box<dyn ImageDecoder>> {
        self.factories
            .iter()
            .find_map(|factory| factory.make_decoder(context))
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw envelope: magic, u32 LE width, u32 LE height, RGBA8 rows.
pub(crate) const RAW_MAGIC: &[u8] = b"rawb";
pub(crate) const RAW_HEADER_LEN: usize = 12;
const RAW_BYTES_PER_PIXEL: usize = 4;

struct RawBitmapDecoderFactory;

impl ImageDecoderFactory for RawBitmapDecoderFactory {
    fn make_decoder(&self, context: &DecodingContext<'_>) -> Option<Box<dyn ImageDecoder>> {
        if context.data.len() >= RAW_MAGIC.len() && context.data.starts_with(RAW_MAGIC) {
            Some(Box::new(RawBitmapDecoder))
        } else {
            None
        }
    }
}

/// Decoder for the raw envelope. Partial data decodes to a preview holding
/// the fully received rows.
pub struct RawBitmapDecoder;

impl ImageDecoder for RawBitmapDecoder {
    fn decode(&mut self, data: &Bytes, is_completed: bool) -> Option<ImageContainer> {
        let (width, height) = parse_raw_header(data)?;
        let bytes_per_row = width as usize * RAW_BYTES_PER_PIXEL;
        let body = &data[RAW_HEADER_LEN..];

        let rows_available = if bytes_per_row == 0 {
            height as usize
        } else {
            (body.len() / bytes_per_row).min(height as usize)
        };

        if is_completed {
            if rows_available < height as usize {
                return None; // truncated payload
            }
            let image = DecodedImage {
                width,
                height,
                bytes_per_row,
                pixels: data.slice(RAW_HEADER_LEN..RAW_HEADER_LEN + bytes_per_row * height as usize),
                needs_decompression: true,
                is_animated: false,
            };
            let mut container = ImageContainer::new(image);
            container.image_type = Some(ImageType::Raw);
            return Some(container);
        }

        if rows_available == 0 {
            return None;
        }
        let image = DecodedImage {
            width,
            height: rows_available as u32,
            bytes_per_row,
            pixels: data.slice(RAW_HEADER_LEN..RAW_HEADER_LEN + bytes_per_row * rows_available),
            needs_decompression: true,
            is_animated: false,
        };
        let mut container = ImageContainer::new(image);
        container.image_type = Some(ImageType::Raw);
        container.is_preview = true;
        Some(container)
    }
}

fn parse_raw_header(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < RAW_HEADER_LEN || !data.starts_with(RAW_MAGIC) {
        return None;
    }
    let width = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let height = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    Some((width, height))
}

/// Builds a raw envelope; shared by the built-in encoder and tests.
pub fn encode_raw_bitmap(width: u32, height: u32, pixels: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(RAW_HEADER_LEN + pixels.len());
    out.extend_from_slice(RAW_MAGIC);
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(pixels);
    Bytes::from(out)
}
