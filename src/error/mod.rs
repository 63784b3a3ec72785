//! Error types for pipeline operations

use std::fmt;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Terminal failures surfaced to image task subscribers.
///
/// Errors are cloneable so a single failure on a deduplicated task can be
/// delivered to every subscriber. Underlying transport errors are carried as
/// strings for the same reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// The transport layer failed before the full payload arrived.
    #[error("data loading failed: {0}")]
    DataLoadingFailed(String),

    /// No decoder produced an image for the completed data.
    #[error("decoding failed for {url}")]
    DecodingFailed { url: String },

    /// A processor returned nothing for a final image.
    #[error("processor '{processor}' failed for {url}")]
    ProcessingFailed { url: String, processor: String },

    /// No registered decoder matched the request and data.
    #[error("no decoder registered for {url} ({data_len} bytes)")]
    DecoderNotRegistered { url: String, data_len: usize },
}

impl PipelineError {
    pub(crate) fn data_loading(err: impl fmt::Display) -> Self {
        PipelineError::DataLoadingFailed(err.to_string())
    }
}

/// Transport-level failure reported by a [`DataLoader`](crate::loader::DataLoader).
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for LoadError {
    fn from(err: reqwest::Error) -> Self {
        LoadError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = PipelineError::ProcessingFailed {
            url: "https://example.com/a.png".into(),
            processor: "resize(8x8)".into(),
        };
        let text = err.to_string();
        assert!(text.contains("resize(8x8)"));
        assert!(text.contains("a.png"));
    }

    #[test]
    fn errors_are_cloneable() {
        let err = PipelineError::DataLoadingFailed("timed out".into());
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
