//! Pipeline orchestration, configuration, and cancellation.

pub mod cancel;
pub mod config;
pub mod pipeline;

pub use cancel::CancelToken;
pub use config::{CacheConfig, Config, DedupConfig, OcrConfig, ValidationConfig};
pub use pipeline::ReceiptPipeline;
