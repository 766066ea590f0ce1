//! OCR orchestration with engine fallback.
//!
//! Engines are tried in fixed priority order: cloud text detection, cloud
//! document detection, then the local fallback. Each attempt carries an
//! independent timeout; an error or timeout is logged and the next method
//! is tried. The first result clearing the confidence threshold is accepted
//! immediately. If no cloud method clears the bar, the local fallback (when
//! enabled and available) is accepted regardless of confidence; otherwise
//! the best attempt so far is returned with `success = false` and an
//! aggregated error.
//!
//! This is the central failure-isolation policy of the pipeline: OCR
//! providers are unreliable and must never be single points of failure for
//! an item.

use crate::core::cancel::CancelToken;
use crate::core::config::OcrConfig;
use crate::error::Result;
use crate::ocr::engine::{EngineText, OcrEngine};
use crate::types::{OcrMethod, OcrOutcome};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct EngineSlot {
    engine: Arc<dyn OcrEngine>,
    available: bool,
}

/// Availability snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub name: String,
    pub method: OcrMethod,
    pub available: bool,
}

/// Orchestrator status and capabilities.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub engines: Vec<EngineStatus>,
    pub confidence_threshold: f64,
    pub local_fallback_enabled: bool,
}

/// Runs the engine fallback chain for one image at a time.
pub struct OcrOrchestrator {
    chain: Vec<EngineSlot>,
    fallback: Option<EngineSlot>,
    confidence_threshold: f64,
    attempt_timeout: Duration,
    local_fallback_enabled: bool,
}

impl OcrOrchestrator {
    /// Build an orchestrator from engines in priority order.
    ///
    /// Engines whose [`OcrEngine::kind`] is [`OcrMethod::LocalFallback`] are
    /// held back for the fallback position; all others form the chain in
    /// the order given. Availability is probed here, once.
    pub async fn new(config: &OcrConfig, engines: Vec<Arc<dyn OcrEngine>>) -> Self {
        let mut chain = Vec::new();
        let mut fallback = None;

        for engine in engines {
            let available = engine.is_available().await;
            if !available {
                tracing::warn!(engine = engine.name(), "OCR engine unavailable, will be skipped");
            }
            let slot = EngineSlot { engine, available };
            if slot.engine.kind() == OcrMethod::LocalFallback {
                fallback = Some(slot);
            } else {
                chain.push(slot);
            }
        }

        Self {
            chain,
            fallback,
            confidence_threshold: config.confidence_threshold,
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
            local_fallback_enabled: config.enable_local_fallback,
        }
    }

    /// Run the fallback chain on one image.
    ///
    /// # Errors
    ///
    /// Only [`KassenbonError::Cancelled`]. Engine failures never surface as
    /// errors; they degrade into the outcome's `error` field.
    pub async fn recognize(&self, image_bytes: &[u8], cancel: &CancelToken) -> Result<OcrOutcome> {
        let started = Instant::now();
        let mut best: Option<(OcrMethod, EngineText)> = None;
        let mut failures: Vec<String> = Vec::new();

        for slot in self.chain.iter().filter(|s| s.available) {
            cancel.check()?;

            match self.attempt(slot, image_bytes).await {
                Ok(result) => {
                    if result.confidence >= self.confidence_threshold {
                        tracing::debug!(
                            engine = slot.engine.name(),
                            confidence = result.confidence,
                            "OCR accepted"
                        );
                        return Ok(self.accepted(slot.engine.kind(), result, started));
                    }
                    tracing::debug!(
                        engine = slot.engine.name(),
                        confidence = result.confidence,
                        threshold = self.confidence_threshold,
                        "OCR confidence below threshold, trying next method"
                    );
                    if best
                        .as_ref()
                        .is_none_or(|(_, b)| result.confidence > b.confidence)
                    {
                        best = Some((slot.engine.kind(), result));
                    }
                }
                Err(message) => failures.push(message),
            }
        }

        if self.local_fallback_enabled {
            if let Some(slot) = self.fallback.as_ref().filter(|s| s.available) {
                cancel.check()?;
                match self.attempt(slot, image_bytes).await {
                    // The local engine is the end of the chain: accept its
                    // result even below the threshold.
                    Ok(result) => return Ok(self.accepted(slot.engine.kind(), result, started)),
                    Err(message) => failures.push(message),
                }
            }
        }

        let (method, text, confidence) = match best {
            Some((method, result)) => (method, result.text, result.confidence),
            None => (OcrMethod::None, String::new(), 0.0),
        };
        let error = if failures.is_empty() {
            "no OCR method cleared the confidence threshold".to_string()
        } else {
            failures.join("; ")
        };

        tracing::warn!(%error, "all OCR methods exhausted");
        Ok(OcrOutcome {
            success: false,
            method,
            text,
            confidence,
            processing_time: started.elapsed(),
            error: Some(error),
        })
    }

    /// One wrapped engine attempt: timeout and errors are reported as a
    /// failure message, never propagated.
    async fn attempt(&self, slot: &EngineSlot, image_bytes: &[u8]) -> std::result::Result<EngineText, String> {
        let attempt_started = Instant::now();
        let outcome = tokio::time::timeout(self.attempt_timeout, slot.engine.recognize(image_bytes)).await;
        let elapsed = attempt_started.elapsed();

        match outcome {
            Ok(Ok(result)) => {
                tracing::debug!(
                    engine = slot.engine.name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "OCR attempt finished"
                );
                Ok(result)
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    engine = slot.engine.name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "OCR attempt failed: {}",
                    e
                );
                Err(format!("{}: {}", slot.engine.name(), e))
            }
            Err(_) => {
                tracing::warn!(
                    engine = slot.engine.name(),
                    timeout_ms = self.attempt_timeout.as_millis() as u64,
                    "OCR attempt timed out"
                );
                Err(format!(
                    "{}: timed out after {}s",
                    slot.engine.name(),
                    self.attempt_timeout.as_secs()
                ))
            }
        }
    }

    fn accepted(&self, method: OcrMethod, result: EngineText, started: Instant) -> OcrOutcome {
        OcrOutcome {
            success: true,
            method,
            text: result.text,
            confidence: result.confidence,
            processing_time: started.elapsed(),
            error: None,
        }
    }

    pub fn status(&self) -> OrchestratorStatus {
        let engines = self
            .chain
            .iter()
            .chain(self.fallback.iter())
            .map(|slot| EngineStatus {
                name: slot.engine.name().to_string(),
                method: slot.engine.kind(),
                available: slot.available,
            })
            .collect();

        OrchestratorStatus {
            engines,
            confidence_threshold: self.confidence_threshold,
            local_fallback_enabled: self.local_fallback_enabled,
        }
    }
}
