//! Configuration loading and startup validation.
//!
//! Configuration can be loaded from a TOML file or built programmatically.
//! [`Config::validate`] runs once at startup: a threshold outside `[0, 1]`
//! or a non-positive size limit is a fatal configuration error and the
//! pipeline refuses to run rather than silently clamp.

use crate::error::{KassenbonError, Result};
use crate::image::HashMethod;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for the receipt pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ocr: OcrConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    /// Maximum concurrent items in batch processing (None = num_cpus * 2).
    #[serde(default)]
    pub max_concurrent_items: Option<usize>,
}

/// OCR orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Minimum engine confidence accepted without falling through to the
    /// next method in the chain.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Try the local fallback engine when no cloud method clears the bar.
    #[serde(default = "default_true")]
    pub enable_local_fallback: bool,

    /// Per-attempt timeout in seconds. A timed-out attempt is treated the
    /// same as an engine error: the next method is tried.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            enable_local_fallback: true,
            attempt_timeout_secs: default_attempt_timeout(),
        }
    }
}

/// Validation / scoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Minimum overall confidence for a record to be considered valid.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
        }
    }
}

/// Content cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache root directory; blobs and the index file live under it.
    #[serde(default = "default_cache_directory")]
    pub directory: String,

    /// Size budget in megabytes for `enforce_size_limit`.
    #[serde(default = "default_max_cache_size_mb")]
    pub max_size_mb: u64,

    /// Age cutoff in days for `evict_older_than`.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            max_size_mb: default_max_cache_size_mb(),
            max_age_days: default_max_age_days(),
        }
    }
}

/// Duplicate detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Similarity at or above which a pair is considered a duplicate.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Perceptual hash algorithm used for fingerprints.
    #[serde(default)]
    pub hash_method: HashMethod,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            hash_method: HashMethod::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_confidence_threshold() -> f64 {
    0.8
}

fn default_attempt_timeout() -> u64 {
    30
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_cache_directory() -> String {
    ".kassenbon/cache".to_string()
}

fn default_max_cache_size_mb() -> u64 {
    1000
}

fn default_max_age_days() -> u32 {
    30
}

fn default_similarity_threshold() -> f64 {
    0.95
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content).map_err(|e| KassenbonError::Serialization {
            message: format!("failed to parse config file {}: {}", path.as_ref().display(), e),
            source: Some(Box::new(e)),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject fatal configuration errors before anything runs.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.ocr.confidence_threshold) {
            return Err(KassenbonError::validation(format!(
                "ocr.confidence_threshold must be in [0, 1], got {}",
                self.ocr.confidence_threshold
            )));
        }
        if self.ocr.attempt_timeout_secs == 0 {
            return Err(KassenbonError::validation(
                "ocr.attempt_timeout_secs must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.validation.min_confidence) {
            return Err(KassenbonError::validation(format!(
                "validation.min_confidence must be in [0, 1], got {}",
                self.validation.min_confidence
            )));
        }
        if self.cache.max_size_mb == 0 {
            return Err(KassenbonError::validation("cache.max_size_mb must be positive"));
        }
        if !(0.0..=1.0).contains(&self.dedup.similarity_threshold) {
            return Err(KassenbonError::validation(format!(
                "dedup.similarity_threshold must be in [0, 1], got {}",
                self.dedup.similarity_threshold
            )));
        }
        if let Some(0) = self.max_concurrent_items {
            return Err(KassenbonError::validation("max_concurrent_items must be positive"));
        }
        Ok(())
    }
}
