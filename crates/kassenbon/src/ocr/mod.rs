//! OCR subsystem: engine trait, built-in engines, and the fallback-chain
//! orchestrator.

pub mod engine;
pub mod engines;
pub mod orchestrator;

pub use engine::{EngineText, OcrEngine};
pub use engines::{HttpVisionEngine, TesseractCliEngine, VisionMode};
pub use orchestrator::{EngineStatus, OcrOrchestrator, OrchestratorStatus};
