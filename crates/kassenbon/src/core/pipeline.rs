//! The receipt processing pipeline.
//!
//! Per image: content-cache ingestion, OCR orchestration, field extraction,
//! merchant enhancement, validation. Batches fan out over a bounded worker
//! pool; a single item's failure yields a failed [`ProcessedReceipt`] and
//! never aborts the batch. Duplicate detection is a separate synchronous
//! step over a batch's images, run when the caller wants it.

use crate::cache::{CacheStats, ContentCache, EvictionStats};
use crate::core::cancel::CancelToken;
use crate::core::config::Config;
use crate::error::{KassenbonError, Result};
use crate::extract::FieldExtractor;
use crate::image::{group_duplicates, BatchImage, DuplicateDetector, DuplicateGroup, DuplicateMatch};
use crate::merchant::MerchantEnhancer;
use crate::ocr::{OcrEngine, OcrOrchestrator, OrchestratorStatus};
use crate::types::{OcrOutcome, ProcessedReceipt};
use crate::validate::ReceiptValidator;
use std::sync::Arc;
use std::time::Duration;

/// End-to-end receipt pipeline.
///
/// Construction validates configuration once; a pipeline that would run
/// with fatal settings refuses to exist instead.
pub struct ReceiptPipeline {
    config: Config,
    orchestrator: OcrOrchestrator,
    extractor: FieldExtractor,
    enhancer: MerchantEnhancer,
    validator: ReceiptValidator,
    detector: DuplicateDetector,
    cache: ContentCache,
}

impl ReceiptPipeline {
    /// Build a pipeline from configuration and OCR engines in priority
    /// order.
    pub async fn new(config: Config, engines: Vec<Arc<dyn OcrEngine>>) -> Result<Self> {
        config.validate()?;

        let cache = ContentCache::open(&config.cache.directory)?;
        let orchestrator = OcrOrchestrator::new(&config.ocr, engines).await;
        let validator = ReceiptValidator::new(config.validation.min_confidence);
        let detector = DuplicateDetector::new(config.dedup.similarity_threshold, config.dedup.hash_method);

        Ok(Self {
            config,
            orchestrator,
            extractor: FieldExtractor::new(),
            enhancer: MerchantEnhancer::new(),
            validator,
            detector,
            cache,
        })
    }

    /// Process one receipt image.
    ///
    /// Never returns an error: failures are captured in the result so batch
    /// callers always get one entry per input.
    pub async fn process_bytes(&self, logical_id: &str, bytes: &[u8], cancel: &CancelToken) -> ProcessedReceipt {
        if cancel.is_cancelled() {
            return not_processed(logical_id);
        }

        // Cache ingestion is best-effort for the pipeline: a cache failure
        // degrades re-runs, not this item's extraction.
        if let Err(e) = self.cache.put(logical_id, bytes) {
            tracing::warn!(%logical_id, "cache ingestion failed: {}", e);
        }

        let ocr = match self.orchestrator.recognize(bytes, cancel).await {
            Ok(outcome) => outcome,
            Err(KassenbonError::Cancelled) => return not_processed(logical_id),
            Err(e) => OcrOutcome::failed(e.to_string(), Duration::ZERO),
        };

        if !ocr.success {
            let error = ocr.error.clone();
            return ProcessedReceipt {
                logical_id: logical_id.to_string(),
                success: false,
                ocr,
                record: None,
                validation: None,
                error,
            };
        }

        if ocr.text.trim().is_empty() {
            // Recognized nothing: a valid OCR outcome, but there is no
            // record to build.
            return ProcessedReceipt {
                logical_id: logical_id.to_string(),
                success: true,
                ocr,
                record: None,
                validation: None,
                error: None,
            };
        }

        if cancel.is_cancelled() {
            return not_processed(logical_id);
        }

        let mut record = self.extractor.extract(&ocr.text, ocr.confidence);
        self.enhancer.enhance(&ocr.text, &mut record);

        let validation = self.validator.validate(&record);
        record.confidence_score = validation.confidence_score;

        tracing::info!(
            %logical_id,
            method = ocr.method.as_str(),
            confidence = validation.confidence_score,
            valid = validation.is_valid,
            "receipt processed"
        );

        ProcessedReceipt {
            logical_id: logical_id.to_string(),
            success: true,
            ocr,
            record: Some(record),
            validation: Some(validation),
            error: None,
        }
    }

    /// Process a batch concurrently, preserving input order.
    ///
    /// Concurrency is capped by `max_concurrent_items` (default
    /// `num_cpus * 2`). The batch always completes with one result per
    /// item; panicked or cancelled items are marked not processed.
    pub async fn process_batch(
        self: Arc<Self>,
        items: Vec<(String, Vec<u8>)>,
        cancel: &CancelToken,
    ) -> Vec<ProcessedReceipt> {
        use tokio::sync::Semaphore;
        use tokio::task::JoinSet;

        if items.is_empty() {
            return vec![];
        }

        let max_concurrent = self
            .config
            .max_concurrent_items
            .unwrap_or_else(|| num_cpus::get() * 2);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let ids: Vec<String> = items.iter().map(|(id, _)| id.clone()).collect();

        let mut tasks = JoinSet::new();
        for (index, (logical_id, bytes)) in items.into_iter().enumerate() {
            let pipeline = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let result = pipeline.process_bytes(&logical_id, &bytes, &cancel).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<ProcessedReceipt>> = (0..ids.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(join_error) => {
                    tracing::error!("batch worker panicked: {}", join_error);
                }
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(index, result)| result.unwrap_or_else(|| not_processed(&ids[index])))
            .collect()
    }

    /// Perceptual duplicate detection over a batch of images.
    pub fn find_duplicates(&self, images: &[BatchImage]) -> Result<(Vec<DuplicateMatch>, Vec<DuplicateGroup>)> {
        let matches = self.detector.find_duplicates(images)?;
        let groups = group_duplicates(&matches);
        Ok((matches, groups))
    }

    /// Run both cache maintenance passes from configuration: age eviction,
    /// then size enforcement.
    pub fn maintain_cache(&self) -> Result<EvictionStats> {
        let aged = self.cache.evict_older_than(self.config.cache.max_age_days)?;
        let sized = self
            .cache
            .enforce_size_limit(self.config.cache.max_size_mb * 1024 * 1024)?;
        Ok(EvictionStats {
            entries_removed: aged.entries_removed + sized.entries_removed,
            bytes_freed: aged.bytes_freed + sized.bytes_freed,
        })
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn ocr_status(&self) -> OrchestratorStatus {
        self.orchestrator.status()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn not_processed(logical_id: &str) -> ProcessedReceipt {
    ProcessedReceipt {
        logical_id: logical_id.to_string(),
        success: false,
        ocr: OcrOutcome::failed("cancelled before processing", Duration::ZERO),
        record: None,
        validation: None,
        error: Some("cancelled before processing".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::engine::testing::StaticEngine;
    use crate::types::OcrMethod;
    use tempfile::tempdir;

    const RECEIPT_TEXT: &str = "Corner Market\n123 Main Street\nMILK 2% GAL 3.49\nSubtotal: 3.49\nTax: 0.28\nTotal: 3.77\n01/15/2024";

    fn test_config(cache_dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.cache.directory = cache_dir.to_string_lossy().into_owned();
        config
    }

    async fn pipeline_with(engines: Vec<StaticEngine>, config: Config) -> Arc<ReceiptPipeline> {
        let engines: Vec<Arc<dyn OcrEngine>> = engines.into_iter().map(|e| Arc::new(e) as _).collect();
        Arc::new(ReceiptPipeline::new(config, engines).await.unwrap())
    }

    #[tokio::test]
    async fn test_single_item_end_to_end() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline_with(
            vec![StaticEngine::ok("cloud-text", OcrMethod::CloudText, RECEIPT_TEXT, 0.92)],
            test_config(dir.path()),
        )
        .await;

        let result = pipeline.process_bytes("r1", b"fake image", &CancelToken::new()).await;
        assert!(result.success);

        let record = result.record.unwrap();
        assert_eq!(record.merchant_name.as_deref(), Some("Corner Market"));
        let validation = result.validation.unwrap();
        assert!(validation.confidence_score > 0.0);
        // The validator's confidence is final on the record.
        assert_eq!(record.confidence_score.to_bits(), validation.confidence_score.to_bits());

        // The image landed in the content cache.
        assert!(pipeline.cache().get("r1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_ocr_yields_failed_item() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.ocr.enable_local_fallback = false;

        let pipeline = pipeline_with(
            vec![StaticEngine::failing("cloud-text", OcrMethod::CloudText, "quota exhausted")],
            config,
        )
        .await;

        let result = pipeline.process_bytes("r1", b"fake image", &CancelToken::new()).await;
        assert!(!result.success);
        assert!(result.record.is_none());
        assert!(result.error.unwrap().contains("quota exhausted"));
    }

    #[tokio::test]
    async fn test_empty_text_is_success_without_record() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline_with(
            vec![StaticEngine::ok("cloud-text", OcrMethod::CloudText, "", 0.9)],
            test_config(dir.path()),
        )
        .await;

        let result = pipeline.process_bytes("blank", b"blank page", &CancelToken::new()).await;
        assert!(result.success);
        assert!(result.record.is_none());
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_batch_completes_with_partial_results() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline_with(
            vec![StaticEngine::ok("cloud-text", OcrMethod::CloudText, RECEIPT_TEXT, 0.92)],
            test_config(dir.path()),
        )
        .await;

        let items = vec![
            ("a".to_string(), b"one".to_vec()),
            ("b".to_string(), b"two".to_vec()),
            ("c".to_string(), b"three".to_vec()),
        ];
        let results = pipeline.process_batch(items, &CancelToken::new()).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].logical_id, "a");
        assert_eq!(results[1].logical_id, "b");
        assert_eq!(results[2].logical_id, "c");
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_cancelled_batch_marks_items_not_processed() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline_with(
            vec![StaticEngine::ok("cloud-text", OcrMethod::CloudText, RECEIPT_TEXT, 0.92)],
            test_config(dir.path()),
        )
        .await;

        let cancel = CancelToken::new();
        cancel.cancel();

        let results = pipeline
            .process_batch(vec![("a".to_string(), b"one".to_vec())], &cancel)
            .await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_invalid_config_refused_at_construction() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.ocr.confidence_threshold = 7.0;

        let result = ReceiptPipeline::new(config, vec![]).await;
        assert!(matches!(result, Err(KassenbonError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_identical_images_share_cache_blob() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline_with(
            vec![StaticEngine::ok("cloud-text", OcrMethod::CloudText, RECEIPT_TEXT, 0.92)],
            test_config(dir.path()),
        )
        .await;

        let cancel = CancelToken::new();
        pipeline.process_bytes("first", b"same shot", &cancel).await;
        pipeline.process_bytes("second", b"same shot", &cancel).await;

        let stats = pipeline.cache_stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.alias_entries, 1);
    }
}
