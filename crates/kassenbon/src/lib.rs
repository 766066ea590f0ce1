//! Kassenbon - Receipt Intelligence Library
//!
//! Kassenbon turns photographs of paper receipts into structured, validated
//! financial records. It orchestrates unreliable OCR engines behind a
//! fallback chain, extracts fields with ordered pattern families, enhances
//! known-merchant receipts with dedicated templates, scores every record
//! with a deterministic weighted confidence, and detects duplicates both
//! exactly (content-addressed cache) and perceptually (image fingerprints).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use kassenbon::{CancelToken, Config, ReceiptPipeline, TesseractCliEngine};
//! use std::sync::Arc;
//!
//! # async fn example() -> kassenbon::Result<()> {
//! let config = Config::default();
//! let engines: Vec<Arc<dyn kassenbon::OcrEngine>> = vec![Arc::new(TesseractCliEngine::default())];
//! let pipeline = Arc::new(ReceiptPipeline::new(config, engines).await?);
//!
//! let bytes = std::fs::read("receipt.jpg")?;
//! let result = pipeline.process_bytes("receipt.jpg", &bytes, &CancelToken::new()).await;
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Core** (`core`): pipeline orchestration, configuration, cancellation
//! - **OCR** (`ocr`): engine trait, built-in engines, fallback orchestrator
//! - **Extraction** (`extract`): regex pattern families over OCR text
//! - **Merchant** (`merchant`): template registry and enhancement pass
//! - **Validation** (`validate`): sub-checks, issues, weighted confidence
//! - **Images** (`image`): perceptual hashing and duplicate grouping
//! - **Cache** (`cache`): content-addressed store with LRU eviction

#![deny(unsafe_code)]

pub mod cache;
pub mod core;
pub mod error;
pub mod extract;
pub mod image;
pub mod merchant;
pub mod ocr;
pub mod source;
pub mod types;
pub mod validate;

pub use error::{KassenbonError, Result};
pub use types::{LineItem, OcrMethod, OcrOutcome, ProcessedReceipt, ReceiptRecord};

pub use core::cancel::CancelToken;
pub use core::config::{CacheConfig, Config, DedupConfig, OcrConfig, ValidationConfig};
pub use core::pipeline::ReceiptPipeline;

pub use cache::{CacheEntry, CacheStats, ContentCache, EvictionStats};
pub use extract::FieldExtractor;
pub use image::{
    group_duplicates, BatchImage, DuplicateDetector, DuplicateGroup, DuplicateMatch, Fingerprint, HashMethod,
};
pub use merchant::{MerchantEnhancer, MerchantKind, MerchantRegistry};
pub use ocr::{EngineText, HttpVisionEngine, OcrEngine, OcrOrchestrator, TesseractCliEngine, VisionMode};
pub use source::{SourceItem, SourceProvider};
pub use validate::{ReceiptValidator, Severity, ValidationIssue, ValidationResult};
