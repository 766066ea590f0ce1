//! Structured field extraction from raw OCR text.
//!
//! Ordered regex families populate a [`ReceiptRecord`] first-match-wins per
//! field. A family that matches nothing leaves the field unset; absence is
//! meaningful input to scoring, never an error.

pub mod patterns;

use crate::types::{LineItem, ReceiptRecord};
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use regex::Regex;
use std::str::FromStr;

/// Tolerance for arithmetic consistency checks, two cents.
pub(crate) fn cent_tolerance() -> BigDecimal {
    BigDecimal::from_str("0.02").expect("constant tolerance parses")
}

/// Extracts structured receipt data from OCR text.
#[derive(Debug, Clone, Default)]
pub struct FieldExtractor;

impl FieldExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Populate a [`ReceiptRecord`] from raw OCR text.
    ///
    /// `ocr_confidence` seeds the baseline confidence score; the returned
    /// record's `confidence_score` is the weighted baseline described in
    /// the module docs.
    pub fn extract(&self, text: &str, ocr_confidence: f64) -> ReceiptRecord {
        let mut record = ReceiptRecord::from_text(text, ocr_confidence);

        let lines = clean_lines(text);

        record.merchant_name = extract_merchant_name(&lines[..lines.len().min(5)]);
        record.merchant_address = extract_merchant_address(&lines[..lines.len().min(10)]);
        record.merchant_phone = extract_phone(text);

        record.date = extract_date(text);
        record.time = patterns::first_capture(&patterns::TIME, text).map(|s| s.trim().to_string());

        record.total_amount = extract_amount(&patterns::TOTAL, text);
        record.subtotal = extract_amount(&patterns::SUBTOTAL, text);
        record.tax_amount = extract_amount(&patterns::TAX, text);
        record.tip_amount = extract_amount(&patterns::TIP, text);

        let (payment_method, card_last_four) = extract_payment(text);
        record.payment_method = payment_method;
        record.card_last_four = card_last_four;
        record.receipt_number = patterns::first_capture(&patterns::RECEIPT_NUMBER, text).map(|s| s.trim().to_string());

        record.items = extract_items(&lines);

        record.confidence_score = baseline_confidence(&record, ocr_confidence);
        tracing::debug!(confidence = record.confidence_score, "extracted receipt fields");
        record
    }
}

/// Split into lines, collapse runs of spaces/tabs, and drop non-printable
/// characters OCR tends to emit.
fn clean_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| {
            let printable: String = line.chars().filter(|c| (' '..='~').contains(c)).collect();
            printable.split_whitespace().collect::<Vec<_>>().join(" ")
        })
        .collect()
}

fn is_address_line(line: &str) -> bool {
    patterns::ADDRESS_INDICATORS.iter().any(|re| re.is_match(line))
}

fn is_phone_line(line: &str) -> bool {
    patterns::PHONE.iter().any(|re| re.is_match(line))
}

/// The merchant name is usually the first top line that is neither an
/// address nor a phone number. Short all-caps lines are rejected as likely
/// headers ("WELCOME", store codes).
fn extract_merchant_name(top_lines: &[String]) -> Option<String> {
    for line in top_lines {
        let line = line.trim();
        if line.len() > 3 && !is_address_line(line) && !is_phone_line(line) {
            let is_upper = line.chars().any(|c| c.is_alphabetic())
                && line.chars().filter(|c| c.is_alphabetic()).all(|c| c.is_uppercase());
            if line.len() > 8 || !is_upper {
                return Some(line.to_string());
            }
        }
    }
    None
}

fn extract_merchant_address(top_lines: &[String]) -> Option<String> {
    let parts: Vec<&str> = top_lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| is_address_line(l))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn extract_phone(text: &str) -> Option<String> {
    patterns::PHONE
        .iter()
        .find_map(|re| re.find(text))
        .map(|m| m.as_str().trim().to_string())
}

fn extract_date(text: &str) -> Option<NaiveDate> {
    let date_str = patterns::first_capture(&patterns::DATE, text)?;
    patterns::DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_str, fmt).ok())
}

/// First parsable amount across a keyword-anchored family. Commas are
/// stripped before parsing; an unparsable capture falls through to the next
/// pattern.
fn extract_amount(family: &[Regex], text: &str) -> Option<BigDecimal> {
    family.iter().find_map(|re| {
        re.captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| BigDecimal::from_str(&m.as_str().replace(',', "")).ok())
    })
}

fn extract_payment(text: &str) -> (Option<String>, Option<String>) {
    for re in patterns::PAYMENT.iter() {
        if let Some(caps) = re.captures(text) {
            let method = caps
                .get(0)
                .and_then(|m| m.as_str().split_whitespace().next())
                .map(|s| s.to_string());
            let last_four = caps.get(1).map(|m| m.as_str().to_string());
            return (method, last_four);
        }
    }
    (None, None)
}

fn extract_items(lines: &[String]) -> Vec<LineItem> {
    let mut items = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.len() < 5 {
            continue;
        }
        for re in patterns::ITEM.iter() {
            if let Some(caps) = re.captures(line) {
                if let Some(item) = parse_item_captures(&caps) {
                    items.push(item);
                }
                break;
            }
        }
    }
    items
}

fn parse_item_captures(caps: &regex::Captures<'_>) -> Option<LineItem> {
    match caps.len() {
        // caps.len() counts the implicit whole-match group.
        3 => {
            let description = caps.get(1)?.as_str().trim().to_string();
            let total_price = BigDecimal::from_str(caps.get(2)?.as_str()).ok()?;
            Some(LineItem {
                description,
                quantity: None,
                unit_price: None,
                total_price: Some(total_price),
                confidence: 0.8,
            })
        }
        5 => {
            let first = caps.get(1)?.as_str();
            let (quantity, description) = if first.chars().all(|c| c.is_ascii_digit()) {
                (first.parse::<f64>().ok()?, caps.get(2)?.as_str())
            } else {
                (caps.get(2)?.as_str().parse::<f64>().ok()?, first)
            };
            let unit_price = BigDecimal::from_str(caps.get(3)?.as_str()).ok()?;
            let total_price = BigDecimal::from_str(caps.get(4)?.as_str()).ok()?;
            Some(LineItem {
                description: description.trim().to_string(),
                quantity: Some(quantity),
                unit_price: Some(unit_price),
                total_price: Some(total_price),
                confidence: 0.9,
            })
        }
        _ => None,
    }
}

/// Baseline confidence: OCR confidence 40%, field completeness 30%,
/// arithmetic consistency 20%, pattern-match richness 10%.
fn baseline_confidence(record: &ReceiptRecord, ocr_confidence: f64) -> f64 {
    let mut score = ocr_confidence * 0.4;

    // Completeness over an 8-point census; the total counts double because
    // a receipt without a total is barely a receipt.
    let mut completeness = 0.0;
    if record.merchant_name.is_some() {
        completeness += 1.0;
    }
    if record.date.is_some() {
        completeness += 1.0;
    }
    if record.total_amount.is_some() {
        completeness += 2.0;
    }
    if record.subtotal.is_some() {
        completeness += 1.0;
    }
    if record.tax_amount.is_some() {
        completeness += 1.0;
    }
    if !record.items.is_empty() {
        completeness += 1.0;
    }
    if record.payment_method.is_some() {
        completeness += 1.0;
    }
    score += (completeness / 8.0) * 0.3;

    score += consistency_score(record) * 0.2;

    let mut pattern_score: f64 = 0.5;
    if record.merchant_name.as_deref().is_some_and(|n| n.len() > 3) {
        pattern_score += 0.2;
    }
    if record.date.is_some() {
        pattern_score += 0.2;
    }
    if record.total_amount.is_some() {
        pattern_score += 0.1;
    }
    score += pattern_score.min(1.0) * 0.1;

    score
}

fn consistency_score(record: &ReceiptRecord) -> f64 {
    let tolerance = cent_tolerance();
    let mut score: f64 = 0.5;

    if let (Some(subtotal), Some(tax), Some(total)) = (&record.subtotal, &record.tax_amount, &record.total_amount) {
        if (subtotal + tax - total).abs() < tolerance {
            score += 0.3;
        }
    }

    if let (Some(items_total), Some(subtotal)) = (record.items_total(), &record.subtotal) {
        if (items_total - subtotal).abs() < tolerance {
            score += 0.2;
        }
    }

    score.min(1.0)
}
