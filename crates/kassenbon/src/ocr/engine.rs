//! OCR engine trait.
//!
//! Engines are external collaborators: remote vision APIs, local binaries,
//! anything that can turn image bytes into text with a confidence value.
//! The orchestrator is agnostic to the implementation as long as the
//! contract holds; in particular, "no text found" is a successful result
//! with empty text and confidence 0.0, never an error.

use crate::error::Result;
use crate::types::OcrMethod;
use async_trait::async_trait;

/// Text and confidence reported by a single engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineText {
    pub text: String,
    /// Recognition confidence in `[0, 1]`.
    pub confidence: f64,
}

impl EngineText {
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
        }
    }
}

/// A pluggable text-recognition engine.
///
/// Engines must be `Send + Sync`; one instance serves concurrent pipeline
/// workers.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Unique engine name for logs and status reporting.
    fn name(&self) -> &str;

    /// Where this engine sits in the fallback chain.
    fn kind(&self) -> OcrMethod;

    /// Whether the engine can currently run (binary installed, endpoint
    /// configured). Resolved once at orchestrator construction and carried
    /// as a capability flag, not re-queried per image.
    async fn is_available(&self) -> bool {
        true
    }

    /// Recognize text in raw image bytes.
    ///
    /// # Errors
    ///
    /// Transient provider problems (timeout, quota, malformed image) are
    /// errors; an image that simply contains no text is not.
    async fn recognize(&self, image_bytes: &[u8]) -> Result<EngineText>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::KassenbonError;

    /// Deterministic engine for orchestrator tests.
    pub struct StaticEngine {
        pub engine_name: String,
        pub method: OcrMethod,
        pub response: std::result::Result<EngineText, String>,
        pub available: bool,
    }

    impl StaticEngine {
        pub fn ok(name: &str, method: OcrMethod, text: &str, confidence: f64) -> Self {
            Self {
                engine_name: name.to_string(),
                method,
                response: Ok(EngineText {
                    text: text.to_string(),
                    confidence,
                }),
                available: true,
            }
        }

        pub fn failing(name: &str, method: OcrMethod, message: &str) -> Self {
            Self {
                engine_name: name.to_string(),
                method,
                response: Err(message.to_string()),
                available: true,
            }
        }

        pub fn unavailable(mut self) -> Self {
            self.available = false;
            self
        }
    }

    #[async_trait]
    impl OcrEngine for StaticEngine {
        fn name(&self) -> &str {
            &self.engine_name
        }

        fn kind(&self) -> OcrMethod {
            self.method
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        async fn recognize(&self, _image_bytes: &[u8]) -> Result<EngineText> {
            match &self.response {
                Ok(text) => Ok(text.clone()),
                Err(message) => Err(KassenbonError::ocr(message.clone())),
            }
        }
    }
}
