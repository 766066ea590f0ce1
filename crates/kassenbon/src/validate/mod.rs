//! Receipt validation and confidence scoring.
//!
//! Six independent sub-checks, each a pure function of the record returning
//! a score in `[0, 1]`, combined into a weighted overall confidence. The
//! only condition that forces `is_valid = false` on its own is a missing
//! total amount, the single critical issue. Everything else degrades the
//! score and emits warnings instead of rejecting.
//!
//! Scoring is deterministic: same record, same reference date, same result.
//! The reference date is injected at construction so "date not in the
//! future" does not make scores drift with the wall clock.

use crate::types::ReceiptRecord;
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Issue severity. Only `Critical` can force a record invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
    Minor,
}

/// One problem found while validating a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Stable machine-readable tag, e.g. `"missing_total"`.
    pub kind: String,
    pub severity: Severity,
    pub message: String,
}

impl ValidationIssue {
    fn new(kind: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            severity,
            message: message.into(),
        }
    }
}

/// Per-category sub-scores, each in `[0, 1]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryScores {
    pub merchant: f64,
    pub date_time: f64,
    pub amounts: f64,
    pub items: f64,
    pub calculations: f64,
    pub data_quality: f64,
}

/// Outcome of validating one receipt record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Weighted overall confidence in `[0, 1]`.
    pub confidence_score: f64,
    pub scores: CategoryScores,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn critical_issues(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Critical)
    }
}

/// Overall weights per category. Amounts and calculations dominate because
/// they are what downstream accounting consumes.
const WEIGHTS: &[(&str, f64)] = &[
    ("amounts", 0.30),
    ("calculations", 0.25),
    ("merchant", 0.15),
    ("items", 0.15),
    ("date_time", 0.10),
    ("data_quality", 0.05),
];

static INVALID_MERCHANT_NAME: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^[0-9*\-+=]+$",
        r"^[a-z]{1,2}$",
        r"^(total|subtotal|tax|cash)$",
        r"^\*+$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("merchant filter pattern must compile"))
    .collect()
});

static PHONE_SHAPES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^\d{3}-\d{3}-\d{4}$",
        r"^\(\d{3}\)\s*\d{3}-\d{4}$",
        r"^\d{3}\.\d{3}\.\d{4}$",
        r"^\d{10}$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("phone shape pattern must compile"))
    .collect()
});

static TIME_SHAPES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^\d{1,2}:\d{2}$",
        r"^\d{1,2}:\d{2}:\d{2}$",
        r"^\d{1,2}:\d{2}\s*(am|pm)$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("time shape pattern must compile"))
    .collect()
});

fn decimal(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).expect("constant decimal parses")
}

/// Validates receipt records and assigns weighted confidence scores.
#[derive(Debug, Clone)]
pub struct ReceiptValidator {
    min_confidence: f64,
    reference_date: NaiveDate,
}

impl Default for ReceiptValidator {
    fn default() -> Self {
        Self::new(0.6)
    }
}

impl ReceiptValidator {
    pub fn new(min_confidence: f64) -> Self {
        Self {
            min_confidence,
            reference_date: Utc::now().date_naive(),
        }
    }

    /// Pin the reference date used for date plausibility checks.
    pub fn with_reference_date(mut self, reference_date: NaiveDate) -> Self {
        self.reference_date = reference_date;
        self
    }

    /// Validate a record and compute its overall confidence.
    pub fn validate(&self, record: &ReceiptRecord) -> ValidationResult {
        let mut issues = Vec::new();

        let scores = CategoryScores {
            merchant: self.check_merchant(record, &mut issues),
            date_time: self.check_date_time(record, &mut issues),
            amounts: self.check_amounts(record, &mut issues),
            items: self.check_items(record, &mut issues),
            calculations: self.check_calculations(record, &mut issues),
            data_quality: self.check_data_quality(record),
        };

        let confidence_score = overall_confidence(&scores);
        let has_critical = issues.iter().any(|i| i.severity == Severity::Critical);
        let is_valid = confidence_score >= self.min_confidence && !has_critical;

        tracing::debug!(
            confidence = confidence_score,
            valid = is_valid,
            issues = issues.len(),
            "receipt validated"
        );

        ValidationResult {
            is_valid,
            confidence_score,
            scores,
            issues,
        }
    }

    fn check_merchant(&self, record: &ReceiptRecord, issues: &mut Vec<ValidationIssue>) -> f64 {
        let mut score: f64 = 0.0;

        match record.merchant_name.as_deref().map(str::trim) {
            Some(name) if name.len() >= 3 => {
                score += 0.5;
                if is_reasonable_merchant_name(name) {
                    score += 0.3;
                }
            }
            Some(_) => {
                issues.push(ValidationIssue::new(
                    "merchant_name_too_short",
                    Severity::Warning,
                    "Merchant name is too short",
                ));
            }
            None => {
                issues.push(ValidationIssue::new(
                    "missing_merchant_name",
                    Severity::Minor,
                    "Merchant name not found",
                ));
            }
        }

        if record
            .merchant_address
            .as_deref()
            .is_some_and(|a| a.trim().len() >= 10)
        {
            score += 0.1;
        }

        if record
            .merchant_phone
            .as_deref()
            .is_some_and(|p| PHONE_SHAPES.iter().any(|re| re.is_match(p)))
        {
            score += 0.1;
        }

        score.min(1.0)
    }

    fn check_date_time(&self, record: &ReceiptRecord, issues: &mut Vec<ValidationIssue>) -> f64 {
        let mut score: f64 = 0.0;

        match record.date {
            Some(date) if self.is_reasonable_date(date) => score += 0.7,
            Some(date) => {
                issues.push(ValidationIssue::new(
                    "unreasonable_date",
                    Severity::Warning,
                    format!("Date seems unreasonable: {}", date),
                ));
                score += 0.3;
            }
            None => {
                issues.push(ValidationIssue::new(
                    "missing_date",
                    Severity::Minor,
                    "Receipt date not found",
                ));
            }
        }

        if let Some(time) = record.time.as_deref() {
            if TIME_SHAPES.iter().any(|re| re.is_match(&time.to_lowercase())) {
                score += 0.3;
            } else {
                issues.push(ValidationIssue::new(
                    "invalid_time_format",
                    Severity::Warning,
                    format!("Time format seems invalid: {}", time),
                ));
            }
        }

        score.min(1.0)
    }

    fn check_amounts(&self, record: &ReceiptRecord, issues: &mut Vec<ValidationIssue>) -> f64 {
        let mut score: f64 = 0.0;

        match &record.total_amount {
            Some(total) if is_reasonable_amount(total) => score += 0.5,
            Some(total) => {
                issues.push(ValidationIssue::new(
                    "unreasonable_total",
                    Severity::Warning,
                    format!("Total amount seems unreasonable: {}", total),
                ));
            }
            None => {
                issues.push(ValidationIssue::new(
                    "missing_total",
                    Severity::Critical,
                    "Total amount not found",
                ));
            }
        }

        if record.subtotal.as_ref().is_some_and(is_reasonable_amount) {
            score += 0.2;
        }

        if let Some(tax) = record.tax_amount.as_ref().filter(|t| is_reasonable_amount(t)) {
            score += 0.1;
            if let Some(subtotal) = record.subtotal.as_ref() {
                if let Some(rate) = (tax / subtotal).to_f64() {
                    if (0.01..=0.20).contains(&rate) {
                        score += 0.1;
                    } else {
                        issues.push(ValidationIssue::new(
                            "unusual_tax_rate",
                            Severity::Warning,
                            format!("Tax rate seems unusual: {:.1}%", rate * 100.0),
                        ));
                    }
                }
            }
        }

        if record.tip_amount.as_ref().is_some_and(is_reasonable_amount) {
            score += 0.1;
        }

        score.min(1.0)
    }

    fn check_items(&self, record: &ReceiptRecord, issues: &mut Vec<ValidationIssue>) -> f64 {
        if record.items.is_empty() {
            issues.push(ValidationIssue::new("no_items", Severity::Minor, "No line items found"));
            return 0.0;
        }

        let tolerance = decimal("0.02");
        let mut valid_items = 0usize;

        for item in &record.items {
            let mut item_score = 0.0;

            if item.description.trim().len() >= 3 {
                item_score += 0.5;
            }
            if item.total_price.as_ref().is_some_and(is_reasonable_amount) {
                item_score += 0.3;
            }

            if let (Some(quantity), Some(unit_price), Some(total_price)) =
                (item.quantity, &item.unit_price, &item.total_price)
            {
                // Mirrors how quantities are parsed from text: exact decimal
                // rendering, not a binary float conversion.
                let quantity = BigDecimal::from_str(&format!("{}", quantity)).unwrap_or_default();
                if (unit_price * quantity - total_price).abs() < tolerance {
                    item_score += 0.2;
                } else {
                    issues.push(ValidationIssue::new(
                        "item_calculation_mismatch",
                        Severity::Warning,
                        format!("Item calculation mismatch: {}", item.description),
                    ));
                }
            }

            if item_score >= 0.5 {
                valid_items += 1;
            }
        }

        valid_items as f64 / record.items.len() as f64
    }

    fn check_calculations(&self, record: &ReceiptRecord, issues: &mut Vec<ValidationIssue>) -> f64 {
        let mut score: f64 = 0.5;

        if let (Some(subtotal), Some(tax), Some(total)) = (&record.subtotal, &record.tax_amount, &record.total_amount)
        {
            let mut calculated = subtotal + tax;
            if let Some(tip) = &record.tip_amount {
                calculated = calculated + tip;
            }

            if (&calculated - total).abs() < decimal("0.02") {
                score += 0.3;
            } else {
                issues.push(ValidationIssue::new(
                    "total_calculation_error",
                    Severity::Warning,
                    format!("Total calculation mismatch: {} vs {}", calculated, total),
                ));
            }
        }

        if let (Some(items_total), Some(subtotal)) = (record.items_total(), &record.subtotal) {
            // Items often lose a line to OCR; allow a little more slack
            // than the subtotal/tax/total identity.
            if (&items_total - subtotal).abs() < decimal("0.05") {
                score += 0.2;
            } else {
                issues.push(ValidationIssue::new(
                    "items_subtotal_mismatch",
                    Severity::Warning,
                    format!("Items total ({}) != subtotal ({})", items_total, subtotal),
                ));
            }
        }

        score.min(1.0)
    }

    fn check_data_quality(&self, record: &ReceiptRecord) -> f64 {
        let mut score = record.confidence_score * 0.4;

        let present = [
            record.merchant_name.is_some(),
            record.date.is_some(),
            record.total_amount.is_some(),
            record.subtotal.is_some(),
            record.tax_amount.is_some(),
            !record.items.is_empty(),
            record.payment_method.is_some(),
        ];
        let completeness = present.iter().filter(|&&p| p).count() as f64 / present.len() as f64;
        score += completeness * 0.3;

        score += text_quality(&record.raw_text) * 0.3;
        score.min(1.0)
    }

    fn is_reasonable_date(&self, date: NaiveDate) -> bool {
        if date > self.reference_date {
            return false;
        }
        (self.reference_date - date).num_days() <= 3650
    }
}

fn is_reasonable_merchant_name(name: &str) -> bool {
    let lowered = name.trim().to_lowercase();
    if INVALID_MERCHANT_NAME.iter().any(|re| re.is_match(&lowered)) {
        return false;
    }
    (3..=50).contains(&lowered.len())
}

/// Positive, at most 10,000 currency units, at most two decimal places.
fn is_reasonable_amount(amount: &BigDecimal) -> bool {
    use bigdecimal::Zero;
    if amount <= &BigDecimal::zero() {
        return false;
    }
    if amount > &BigDecimal::from(10_000) {
        return false;
    }
    amount.fractional_digit_count() <= 2
}

/// Raw-text shape heuristic: enough length, and a mix of letters, digits,
/// and punctuation, is what real receipt OCR output looks like.
fn text_quality(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }

    let mut score: f64 = 0.0;
    if text.len() > 50 {
        score += 0.3;
    } else if text.len() > 20 {
        score += 0.2;
    }

    if text.chars().any(|c| c.is_alphabetic()) {
        score += 0.3;
    }
    if text.chars().any(|c| c.is_ascii_digit()) {
        score += 0.2;
    }
    if text.chars().any(|c| ".,;:!?$()[]{}".contains(c)) {
        score += 0.2;
    }

    score.min(1.0)
}

/// Weighted sum over sub-scores, normalized by the total weight present.
fn overall_confidence(scores: &CategoryScores) -> f64 {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;

    for (category, weight) in WEIGHTS {
        let score = match *category {
            "amounts" => scores.amounts,
            "calculations" => scores.calculations,
            "merchant" => scores.merchant,
            "items" => scores.items,
            "date_time" => scores.date_time,
            "data_quality" => scores.data_quality,
            _ => continue,
        };
        weighted += score * weight;
        total_weight += weight;
    }

    if total_weight > 0.0 {
        weighted / total_weight
    } else {
        0.0
    }
}
