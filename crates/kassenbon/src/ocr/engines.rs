//! Built-in engine implementations.
//!
//! Both are thin wrappers at the collaborator boundary: an HTTP client for
//! a vision-API-style endpoint and a subprocess wrapper around a local
//! `tesseract` binary. Neither contains extraction logic; they exist to
//! satisfy the [`OcrEngine`] contract, including returning empty text with
//! confidence 0.0 when an image simply contains no text.

use crate::error::{KassenbonError, Result};
use crate::ocr::engine::{EngineText, OcrEngine};
use crate::types::OcrMethod;
use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Detection mode for the HTTP vision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionMode {
    /// Plain text detection, tuned for sparse text.
    Text,
    /// Dense-document detection, better for full receipt pages.
    Document,
}

impl VisionMode {
    fn as_str(&self) -> &'static str {
        match self {
            VisionMode::Text => "text",
            VisionMode::Document => "document",
        }
    }
}

#[derive(Debug, Deserialize)]
struct VisionResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: f64,
}

/// Cloud OCR over a vision-API-compatible HTTP endpoint.
///
/// Request: `POST <endpoint>` with `{"image": "<base64>", "mode": "..."}`;
/// response: `{"text": "...", "confidence": 0.0..1.0}`. Credentials travel
/// as a bearer token; acquiring them is out of scope here.
pub struct HttpVisionEngine {
    name: String,
    endpoint: String,
    api_token: Option<String>,
    mode: VisionMode,
    client: reqwest::Client,
}

impl HttpVisionEngine {
    pub fn new(endpoint: impl Into<String>, api_token: Option<String>, mode: VisionMode) -> Self {
        let name = match mode {
            VisionMode::Text => "http-vision-text",
            VisionMode::Document => "http-vision-document",
        };
        Self {
            name: name.to_string(),
            endpoint: endpoint.into(),
            api_token,
            mode,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl OcrEngine for HttpVisionEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OcrMethod {
        match self.mode {
            VisionMode::Text => OcrMethod::CloudText,
            VisionMode::Document => OcrMethod::CloudDocument,
        }
    }

    async fn is_available(&self) -> bool {
        !self.endpoint.is_empty()
    }

    async fn recognize(&self, image_bytes: &[u8]) -> Result<EngineText> {
        let body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image_bytes),
            "mode": self.mode.as_str(),
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| KassenbonError::Ocr {
            message: format!("vision request failed: {}", e),
            source: Some(Box::new(e)),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(KassenbonError::ocr(format!(
                "vision endpoint returned {}",
                status
            )));
        }

        let parsed: VisionResponse = response.json().await.map_err(|e| KassenbonError::Ocr {
            message: format!("malformed vision response: {}", e),
            source: Some(Box::new(e)),
        })?;

        Ok(EngineText {
            text: parsed.text,
            confidence: parsed.confidence.clamp(0.0, 1.0),
        })
    }
}

/// Local fallback engine shelling out to the `tesseract` binary.
///
/// Text and per-word confidences come from a single TSV invocation; the
/// reported confidence is the mean word confidence scaled to `[0, 1]`. No
/// confident words means empty text with confidence 0.0, not an error.
pub struct TesseractCliEngine {
    binary: String,
    language: String,
}

impl Default for TesseractCliEngine {
    fn default() -> Self {
        Self::new("tesseract", "eng")
    }
}

impl TesseractCliEngine {
    pub fn new(binary: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            language: language.into(),
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractCliEngine {
    fn name(&self) -> &str {
        "tesseract-cli"
    }

    fn kind(&self) -> OcrMethod {
        OcrMethod::LocalFallback
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn recognize(&self, image_bytes: &[u8]) -> Result<EngineText> {
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", &self.language, "--psm", "6", "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| KassenbonError::Ocr {
                message: format!("failed to spawn {}: {}", self.binary, e),
                source: Some(Box::new(e)),
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| KassenbonError::ocr("tesseract stdin unavailable"))?;
        stdin.write_all(image_bytes).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(KassenbonError::ocr(format!(
                "tesseract exited with {}",
                output.status
            )));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        Ok(parse_tsv_output(&tsv))
    }
}

/// Reconstruct text and mean confidence from tesseract TSV output.
///
/// TSV columns: level, page, block, par, line, word, left, top, width,
/// height, conf, text. Word rows have level 5 and a non-negative conf.
fn parse_tsv_output(tsv: &str) -> EngineText {
    let mut lines: Vec<String> = Vec::new();
    let mut current_key = (0u32, 0u32, 0u32);
    let mut current_words: Vec<String> = Vec::new();
    let mut confidences: Vec<f64> = Vec::new();

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }

        let key = (
            cols[2].parse().unwrap_or(0),
            cols[3].parse().unwrap_or(0),
            cols[4].parse().unwrap_or(0),
        );
        let conf: f64 = cols[10].parse().unwrap_or(-1.0);
        let word = cols[11].trim();

        if conf < 0.0 || word.is_empty() {
            continue;
        }

        if key != current_key && !current_words.is_empty() {
            lines.push(current_words.join(" "));
            current_words.clear();
        }
        current_key = key;
        current_words.push(word.to_string());
        confidences.push(conf);
    }
    if !current_words.is_empty() {
        lines.push(current_words.join(" "));
    }

    if confidences.is_empty() {
        return EngineText::empty();
    }

    let mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
    EngineText {
        text: lines.join("\n"),
        confidence: (mean / 100.0).clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn word_row(block: u32, par: u32, line: u32, word: u32, conf: &str, text: &str) -> String {
        format!("5\t1\t{}\t{}\t{}\t{}\t0\t0\t10\t10\t{}\t{}", block, par, line, word, conf, text)
    }

    #[test]
    fn test_parse_tsv_reconstructs_lines() {
        let tsv = [
            HEADER.to_string(),
            word_row(1, 1, 1, 1, "96", "CORNER"),
            word_row(1, 1, 1, 2, "94", "MARKET"),
            word_row(1, 1, 2, 1, "90", "Total:"),
            word_row(1, 1, 2, 2, "88", "4.85"),
        ]
        .join("\n");

        let result = parse_tsv_output(&tsv);
        assert_eq!(result.text, "CORNER MARKET\nTotal: 4.85");
        assert!((result.confidence - 0.92).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tsv_skips_non_word_rows() {
        let tsv = [
            HEADER.to_string(),
            "1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t".to_string(),
            word_row(1, 1, 1, 1, "80", "HELLO"),
            word_row(1, 1, 1, 2, "-1", "ignored"),
        ]
        .join("\n");

        let result = parse_tsv_output(&tsv);
        assert_eq!(result.text, "HELLO");
        assert!((result.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tsv_no_words_is_empty_not_error() {
        let result = parse_tsv_output(HEADER);
        assert_eq!(result.text, "");
        assert!((result.confidence - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_vision_mode_names() {
        let text = HttpVisionEngine::new("http://localhost:9000/ocr", None, VisionMode::Text);
        assert_eq!(text.kind(), OcrMethod::CloudText);
        assert_eq!(text.name(), "http-vision-text");

        let doc = HttpVisionEngine::new("http://localhost:9000/ocr", None, VisionMode::Document);
        assert_eq!(doc.kind(), OcrMethod::CloudDocument);
    }

    #[tokio::test]
    async fn test_vision_engine_unavailable_without_endpoint() {
        let engine = HttpVisionEngine::new("", None, VisionMode::Text);
        assert!(!engine.is_available().await);
    }
}
