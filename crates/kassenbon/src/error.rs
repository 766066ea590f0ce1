//! Error types for Kassenbon.
//!
//! All fallible operations in the library return [`Result`]. The error
//! taxonomy follows one rule: system errors (`Io`) bubble up unchanged so
//! real filesystem/permission problems surface in bug reports, while
//! application errors are wrapped with context.
//!
//! Extraction misses are deliberately *not* errors anywhere in this crate:
//! a regex family that finds nothing leaves the field unset, which feeds
//! into confidence scoring instead of aborting the pipeline.

use thiserror::Error;

/// Result type alias using `KassenbonError`.
pub type Result<T> = std::result::Result<T, KassenbonError>;

/// Main error type for all Kassenbon operations.
#[derive(Debug, Error)]
pub enum KassenbonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OCR error: {message}")]
    Ocr {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Image processing error: {message}")]
    ImageProcessing {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl KassenbonError {
    pub fn ocr(message: impl Into<String>) -> Self {
        KassenbonError::Ocr {
            message: message.into(),
            source: None,
        }
    }

    pub fn image(message: impl Into<String>) -> Self {
        KassenbonError::ImageProcessing {
            message: message.into(),
            source: None,
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        KassenbonError::Cache {
            message: message.into(),
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        KassenbonError::Validation {
            message: message.into(),
            source: None,
        }
    }
}

impl From<serde_json::Error> for KassenbonError {
    fn from(err: serde_json::Error) -> Self {
        KassenbonError::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<image::ImageError> for KassenbonError {
    fn from(err: image::ImageError) -> Self {
        KassenbonError::ImageProcessing {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}
