//! Processor contract and composition.

use std::fmt;
use std::sync::Arc;

use crate::image::ImageContainer;
use crate::request::ImageRequest;

pub struct ProcessingContext<'a> {
    pub request: &'a ImageRequest,
    /// False while processing progressive previews.
    pub is_completed: bool,
}

/// A named image transformation.
///
/// The identifier uniquely names the transformation for cache keying: two
/// processors with equal identifiers must produce equal outputs for equal
/// inputs. `process` returns `None` on failure; for final images that
/// surfaces as a processing error, for previews it is dropped.
pub trait ImageProcessor: Send + Sync {
    fn identifier(&self) -> String;

    fn process(
        &self,
        container: ImageContainer,
        context: &ProcessingContext<'_>,
    ) -> Option<ImageContainer>;
}

impl fmt::Debug for dyn ImageProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageProcessor({})", self.identifier())
    }
}

/// Applies processors left to right in a single pass. Used when
/// deduplication is off and intermediate results cannot be shared.
pub struct CompositeProcessor {
    processors: Vec<Arc<dyn ImageProcessor>>,
}

impl CompositeProcessor {
    pub fn new(processors: Vec<Arc<dyn ImageProcessor>>) -> Self {
        Self { processors }
    }
}

impl ImageProcessor for CompositeProcessor {
    fn identifier(&self) -> String {
        let mut id = String::new();
        for processor in &self.processors {
            id.push_str(&processor.identifier());
        }
        id
    }

    fn process(
        &self,
        container: ImageContainer,
        context: &ProcessingContext<'_>,
    ) -> Option<ImageContainer> {
        let mut current = container;
        for processor in &self.processors {
            current = processor.process(current, context)?;
        }
        Some(current)
    }
}

#[cfg(test)]
pub mod tests_support {
    //! Minimal processors for exercising the pipeline in tests.

    use super::*;

    /// Identity transformation with a configurable identifier.
    pub struct NamedProcessor {
        name: String,
    }

    impl NamedProcessor {
        pub fn new(name: impl Into<String>) -> Self {
            Self { name: name.into() }
        }
    }

    impl ImageProcessor for NamedProcessor {
        fn identifier(&self) -> String {
            self.name.clone()
        }

        fn process(
            &self,
            mut container: ImageContainer,
            _context: &ProcessingContext<'_>,
        ) -> Option<ImageContainer> {
            container
                .user_info
                .insert(self.name.clone(), serde_json::Value::Bool(true));
            Some(container)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::NamedProcessor;
    use super::*;
    use crate::image::DecodedImage;
    use bytes::Bytes;
    use url::Url;

    fn container() -> ImageContainer {
        ImageContainer::new(DecodedImage {
            width: 1,
            height: 1,
            bytes_per_row: 4,
            pixels: Bytes::from(vec![0u8; 4]),
            needs_decompression: false,
            is_animated: false,
        })
    }

    #[test]
    fn composite_identifier_concatenates() {
        let composite = CompositeProcessor::new(vec![
            Arc::new(NamedProcessor::new("a")),
            Arc::new(NamedProcessor::new("b")),
        ]);
        assert_eq!(composite.identifier(), "ab");
    }

    #[test]
    fn composite_applies_in_order() {
        let composite = CompositeProcessor::new(vec![
            Arc::new(NamedProcessor::new("first")),
            Arc::new(NamedProcessor::new("second")),
        ]);
        let request = ImageRequest::new(Url::parse("https://example.com/i").unwrap());
        let out = composite
            .process(
                container(),
                &ProcessingContext {
                    request: &request,
                    is_completed: true,
                },
            )
            .unwrap();
        assert!(out.user_info.contains_key("first"));
        assert!(out.user_info.contains_key("second"));
    }
}
