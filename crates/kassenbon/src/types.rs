//! Core result types shared across the pipeline.
//!
//! The field names on [`ReceiptRecord`], [`LineItem`], and the validation
//! types in [`crate::validate`] are a stable contract consumed by external
//! exporters; renaming any of them is a breaking change.
//!
//! Currency amounts are `BigDecimal`, never floats: receipt arithmetic is
//! checked to two-cent tolerances and must not accumulate binary rounding
//! drift.

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single line item on a receipt.
///
/// Owned exclusively by its [`ReceiptRecord`]; items carry no back-reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<BigDecimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_price: Option<BigDecimal>,
    pub confidence: f64,
}

impl LineItem {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            quantity: None,
            unit_price: None,
            total_price: None,
            confidence: 0.0,
        }
    }
}

/// Structured receipt data extracted from OCR text.
///
/// Created once per image by the field extractor, mutated in place by the
/// merchant enhancer, and finalized by the validator. Absent fields mean
/// "the pattern families found nothing"; absence is scored, not raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_phone: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_number: Option<String>,

    pub items: Vec<LineItem>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<BigDecimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_amount: Option<BigDecimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tip_amount: Option<BigDecimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<BigDecimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_last_four: Option<String>,

    pub confidence_score: f64,
    pub raw_text: String,
}

impl ReceiptRecord {
    /// New record carrying only the raw OCR text and its confidence.
    pub fn from_text(raw_text: impl Into<String>, confidence: f64) -> Self {
        Self {
            raw_text: raw_text.into(),
            confidence_score: confidence,
            ..Default::default()
        }
    }

    /// Sum of `total_price` over items that have one.
    pub fn items_total(&self) -> Option<BigDecimal> {
        let mut sum: Option<BigDecimal> = None;
        for price in self.items.iter().filter_map(|i| i.total_price.as_ref()) {
            sum = Some(sum.map_or_else(|| price.clone(), |acc| acc + price));
        }
        sum
    }
}

/// Which recognition method produced an [`OcrOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrMethod {
    CloudText,
    CloudDocument,
    LocalFallback,
    None,
}

impl OcrMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrMethod::CloudText => "cloud_text",
            OcrMethod::CloudDocument => "cloud_document",
            OcrMethod::LocalFallback => "local_fallback",
            OcrMethod::None => "none",
        }
    }
}

/// Result of running the OCR fallback chain on one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrOutcome {
    pub success: bool,
    pub method: OcrMethod,
    pub text: String,
    /// Recognition confidence in `[0, 1]` as reported by the engine.
    pub confidence: f64,
    /// Wall time across all attempts, including failed ones.
    #[serde(with = "duration_secs")]
    pub processing_time: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OcrOutcome {
    pub fn failed(error: impl Into<String>, processing_time: Duration) -> Self {
        Self {
            success: false,
            method: OcrMethod::None,
            text: String::new(),
            confidence: 0.0,
            processing_time,
            error: Some(error.into()),
        }
    }
}

/// Final per-image pipeline result.
///
/// Batch operations always complete with one of these per input: a failed
/// item carries `success = false` and an `error` instead of aborting the
/// batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedReceipt {
    pub logical_id: String,
    pub success: bool,
    pub ocr: OcrOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ReceiptRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<crate::validate::ValidationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_items_total_sums_priced_items() {
        let mut record = ReceiptRecord::default();
        record.items.push(LineItem {
            total_price: Some(BigDecimal::from_str("3.50").unwrap()),
            ..LineItem::new("MILK")
        });
        record.items.push(LineItem::new("UNPRICED"));
        record.items.push(LineItem {
            total_price: Some(BigDecimal::from_str("1.25").unwrap()),
            ..LineItem::new("BREAD")
        });

        assert_eq!(record.items_total(), Some(BigDecimal::from_str("4.75").unwrap()));
    }

    #[test]
    fn test_items_total_none_when_no_prices() {
        let mut record = ReceiptRecord::default();
        record.items.push(LineItem::new("UNPRICED"));
        assert_eq!(record.items_total(), None);
    }

    #[test]
    fn test_record_serializes_decimals_as_strings() {
        let record = ReceiptRecord {
            total_amount: Some(BigDecimal::from_str("10.80").unwrap()),
            ..Default::default()
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["total_amount"], serde_json::json!("10.80"));
    }

    #[test]
    fn test_record_omits_unset_fields() {
        let json = serde_json::to_value(ReceiptRecord::default()).unwrap();
        assert!(json.get("total_amount").is_none());
        assert!(json.get("merchant_name").is_none());
    }
}
