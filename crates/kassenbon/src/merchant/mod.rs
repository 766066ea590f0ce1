//! Merchant-aware extraction enhancement.
//!
//! Known retailers print items and totals in house formats that the generic
//! patterns read poorly. Each merchant is modeled as tagged data (a
//! signature plus a dedicated pattern set) held in an ordered registry,
//! not a type hierarchy.
//!
//! Enhancement never degrades a record: merchant-specific results replace
//! the generic extraction only when non-empty, and the loose-pattern pass
//! only adds lines not already represented by a captured item.

use crate::extract::cent_tolerance;
use crate::types::{LineItem, ReceiptRecord};
use bigdecimal::{BigDecimal, RoundingMode};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::str::FromStr;

/// Tags for the built-in merchant templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MerchantKind {
    Walmart,
    Target,
    Costco,
    Grocery,
    Restaurant,
}

impl MerchantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MerchantKind::Walmart => "walmart",
            MerchantKind::Target => "target",
            MerchantKind::Costco => "costco",
            MerchantKind::Grocery => "grocery",
            MerchantKind::Restaurant => "restaurant",
        }
    }
}

/// Pattern set for one merchant family.
#[derive(Debug)]
pub struct MerchantTemplate {
    pub kind: MerchantKind,
    name_patterns: Vec<Regex>,
    item_patterns: Vec<Regex>,
    total_pattern: Option<Regex>,
    tax_pattern: Option<Regex>,
    tip_pattern: Option<Regex>,
}

impl MerchantTemplate {
    fn matches_name(&self, lowered_text: &str) -> bool {
        self.name_patterns.iter().any(|re| re.is_match(lowered_text))
    }
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("merchant pattern must compile")
}

/// Ordered registry of merchant templates; first signature match wins.
#[derive(Debug)]
pub struct MerchantRegistry {
    templates: Vec<MerchantTemplate>,
}

impl Default for MerchantRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl MerchantRegistry {
    /// The built-in template set.
    pub fn builtin() -> Self {
        let templates = vec![
            MerchantTemplate {
                kind: MerchantKind::Walmart,
                name_patterns: vec![re(r"walmart.*supercenter"), re(r"walmart.*store")],
                item_patterns: vec![
                    re(r"(?m)^([A-Z0-9\s]+?)\s+(\d{12})\s*([TNX])\s*(\d+\.\d{2})$"),
                    re(r"(?m)^([A-Z0-9\s]+?)\s+(\d+\.\d{2})\s*([TNX])$"),
                ],
                total_pattern: Some(re(r"(?i)\btotal\s*:?\s*(\d+\.\d{2})")),
                tax_pattern: Some(re(r"(?i)\btax\s*:?\s*(\d+\.\d{2})")),
                tip_pattern: None,
            },
            MerchantTemplate {
                kind: MerchantKind::Target,
                name_patterns: vec![re(r"target")],
                item_patterns: vec![re(r"(?m)^(.+?)\s+(\d{3}-\d{2}-\d{4})\s*(\d+\.\d{2})\s*([TNX])$")],
                total_pattern: Some(re(r"(?i)\btotal\s*:?\s*(\d+\.\d{2})")),
                tax_pattern: None,
                tip_pattern: None,
            },
            MerchantTemplate {
                kind: MerchantKind::Costco,
                name_patterns: vec![re(r"costco.*wholesale")],
                item_patterns: vec![re(r"(?m)^(\d+)\s+(.+?)\s+(\d+\.\d{2})$")],
                total_pattern: Some(re(r"(?i)\btotal\s*:?\s*(\d+\.\d{2})")),
                tax_pattern: None,
                tip_pattern: None,
            },
            MerchantTemplate {
                kind: MerchantKind::Grocery,
                name_patterns: vec![
                    re(r"kroger"),
                    re(r"safeway"),
                    re(r"publix"),
                    re(r"whole foods"),
                    re(r"trader.*joe"),
                ],
                item_patterns: vec![
                    re(r"(?m)^(.+?)\s+(\d+\.\d{2})\s*([FT])$"),
                    re(r"(?m)^(.+?)\s+(\d+\.\d{2})$"),
                ],
                total_pattern: Some(re(r"(?i)\btotal\s*:?\s*(\d+\.\d{2})")),
                tax_pattern: None,
                tip_pattern: None,
            },
            MerchantTemplate {
                kind: MerchantKind::Restaurant,
                name_patterns: vec![
                    re(r"mcdonald"),
                    re(r"burger.*king"),
                    re(r"subway"),
                    re(r"starbucks"),
                    re(r"pizza"),
                ],
                item_patterns: vec![
                    re(r"(?m)^(\d+)\s*x\s*(.+?)\s+(\d+\.\d{2})$"),
                    re(r"(?m)^(.+?)\s+(\d+\.\d{2})$"),
                ],
                total_pattern: Some(re(r"(?i)\btotal\s*:?\s*(\d+\.\d{2})")),
                tax_pattern: None,
                tip_pattern: Some(re(r"(?i)\btip\s*:?\s*(\d+\.\d{2})")),
            },
        ];
        Self { templates }
    }

    /// First template whose signature matches the (lowercased) text.
    pub fn identify(&self, text: &str) -> Option<&MerchantTemplate> {
        let lowered = text.to_lowercase();
        self.templates.iter().find(|t| t.matches_name(&lowered))
    }
}

/// Loose item patterns for the generic second pass.
static LOOSE_ITEM: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        re(r"^([A-Z][A-Z\s&]+?)\s+\$(\d+\.\d{2})$"),
        re(r"^([A-Za-z][A-Za-z\s\-&'.]+?)\s+\$?(\d+\.\d{2})$"),
        re(r"^(\d+)\s*@\s*\$?(\d+\.\d{2})\s*=\s*\$?(\d+\.\d{2})$"),
    ]
});

/// Descriptions that are receipt furniture, not purchasable items.
static INVALID_DESCRIPTION: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        re(r"^\d+$"),
        re(r"^[a-z]{1,2}$"),
        re(r"total"),
        re(r"subtotal"),
        re(r"tax"),
        re(r"cash"),
        re(r"change"),
        re(r"visa"),
        re(r"mastercard"),
        re(r"thank you"),
        re(r"receipt"),
        re(r"store.*\d+"),
        re(r"^\*+$"),
        re(r"^-+$"),
    ]
});

/// Applies merchant templates and the loose-pattern pass to a record.
#[derive(Debug, Default)]
pub struct MerchantEnhancer {
    registry: MerchantRegistry,
}

impl MerchantEnhancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: MerchantRegistry) -> Self {
        Self { registry }
    }

    /// Re-parse `text` with merchant awareness, mutating `record` in place.
    ///
    /// Returns the identified merchant kind, if any.
    pub fn enhance(&self, text: &str, record: &mut ReceiptRecord) -> Option<MerchantKind> {
        let identified = self.registry.identify(text).map(|template| {
            tracing::debug!(merchant = template.kind.as_str(), "merchant signature matched");
            self.apply_template(template, text, record);
            template.kind
        });

        self.loose_item_pass(text, record);
        record.items = dedupe_items(std::mem::take(&mut record.items));

        record.confidence_score = enhanced_confidence(record);
        identified
    }

    /// Merchant-specific re-extraction. Replaces generic output only with
    /// non-empty results.
    fn apply_template(&self, template: &MerchantTemplate, text: &str, record: &mut ReceiptRecord) {
        let mut items = Vec::new();
        for pattern in &template.item_patterns {
            for caps in pattern.captures_iter(text) {
                if let Some(item) = parse_template_item(template.kind, &caps) {
                    items.push(item);
                }
            }
        }
        if !items.is_empty() {
            record.items = items;
        }

        if let Some(amount) = template.total_pattern.as_ref().and_then(|re| capture_amount(re, text)) {
            record.total_amount = Some(amount);
        }
        if let Some(amount) = template.tax_pattern.as_ref().and_then(|re| capture_amount(re, text)) {
            record.tax_amount = Some(amount);
        }
        if let Some(amount) = template.tip_pattern.as_ref().and_then(|re| capture_amount(re, text)) {
            record.tip_amount = Some(amount);
        }
    }

    /// Scan lines not already represented by a captured item and try the
    /// loose patterns on them.
    fn loose_item_pass(&self, text: &str, record: &mut ReceiptRecord) {
        for line in text.lines() {
            let line = line.trim();
            if line.len() < 5 {
                continue;
            }
            let lowered = line.to_lowercase();
            if record
                .items
                .iter()
                .any(|item| lowered.contains(&item.description.to_lowercase()))
            {
                continue;
            }
            if let Some(item) = try_loose_patterns(line) {
                record.items.push(item);
            }
        }
    }
}

fn capture_amount(re: &Regex, text: &str) -> Option<BigDecimal> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| BigDecimal::from_str(m.as_str()).ok())
}

fn parse_template_item(kind: MerchantKind, caps: &regex::Captures<'_>) -> Option<LineItem> {
    match kind {
        MerchantKind::Walmart => {
            // (description, upc, tax code, price) or (description, price, tax code)
            let description = caps.get(1)?.as_str().trim().to_string();
            let price_group = if caps.len() == 5 { 4 } else { 2 };
            let price = BigDecimal::from_str(caps.get(price_group)?.as_str()).ok()?;
            Some(LineItem {
                description,
                quantity: None,
                unit_price: None,
                total_price: Some(price),
                confidence: 0.9,
            })
        }
        MerchantKind::Target => {
            // (description, dpci, price, tax code)
            let description = caps.get(1)?.as_str().trim().to_string();
            let price = BigDecimal::from_str(caps.get(3)?.as_str()).ok()?;
            Some(LineItem {
                description,
                quantity: None,
                unit_price: None,
                total_price: Some(price),
                confidence: 0.9,
            })
        }
        MerchantKind::Costco => {
            // (quantity, description, price)
            let quantity: u64 = caps.get(1)?.as_str().parse().ok()?;
            let description = caps.get(2)?.as_str().trim().to_string();
            let total_price = BigDecimal::from_str(caps.get(3)?.as_str()).ok()?;
            let unit_price = if quantity > 0 {
                (&total_price / BigDecimal::from(quantity)).with_scale_round(2, RoundingMode::HalfUp)
            } else {
                total_price.clone()
            };
            Some(LineItem {
                description,
                quantity: Some(quantity as f64),
                unit_price: Some(unit_price),
                total_price: Some(total_price),
                confidence: 0.9,
            })
        }
        MerchantKind::Grocery | MerchantKind::Restaurant => {
            let first = caps.get(1)?.as_str();
            if first.chars().all(|c| c.is_ascii_digit()) && caps.len() >= 4 {
                // (quantity, description, price)
                let quantity: u64 = first.parse().ok()?;
                let description = caps.get(2)?.as_str().trim().to_string();
                let total_price = BigDecimal::from_str(caps.get(3)?.as_str()).ok()?;
                let unit_price = if quantity > 0 {
                    (&total_price / BigDecimal::from(quantity)).with_scale_round(2, RoundingMode::HalfUp)
                } else {
                    total_price.clone()
                };
                Some(LineItem {
                    description,
                    quantity: Some(quantity as f64),
                    unit_price: Some(unit_price),
                    total_price: Some(total_price),
                    confidence: 0.9,
                })
            } else {
                // (description, price[, tax flag])
                let description = first.trim().to_string();
                let price = BigDecimal::from_str(caps.get(2)?.as_str()).ok()?;
                Some(LineItem {
                    description,
                    quantity: None,
                    unit_price: None,
                    total_price: Some(price),
                    confidence: 0.8,
                })
            }
        }
    }
}

fn try_loose_patterns(line: &str) -> Option<LineItem> {
    for (idx, pattern) in LOOSE_ITEM.iter().enumerate() {
        let Some(caps) = pattern.captures(line) else { continue };

        if idx < 2 {
            // description + price
            let description = caps.get(1)?.as_str().trim().to_string();
            if description.len() <= 2 || !is_valid_item_description(&description) {
                continue;
            }
            let price = BigDecimal::from_str(caps.get(2)?.as_str()).ok()?;
            return Some(LineItem {
                description,
                quantity: None,
                unit_price: None,
                total_price: Some(price),
                confidence: 0.7,
            });
        }

        // qty @ unit = total, accepted only when the arithmetic holds
        let quantity: u64 = caps.get(1)?.as_str().parse().ok()?;
        let unit_price = BigDecimal::from_str(caps.get(2)?.as_str()).ok()?;
        let total_price = BigDecimal::from_str(caps.get(3)?.as_str()).ok()?;
        if (&unit_price * BigDecimal::from(quantity) - &total_price).abs() < cent_tolerance() {
            return Some(LineItem {
                description: format!("Item (qty: {})", quantity),
                quantity: Some(quantity as f64),
                unit_price: Some(unit_price),
                total_price: Some(total_price),
                confidence: 0.8,
            });
        }
    }
    None
}

/// Reject descriptions that are receipt furniture rather than items.
fn is_valid_item_description(description: &str) -> bool {
    let lowered = description.to_lowercase();
    if INVALID_DESCRIPTION.iter().any(|re| re.is_match(&lowered)) {
        return false;
    }
    if description.len() < 3 || description.len() > 50 {
        return false;
    }
    description.chars().any(|c| c.is_alphabetic())
}

/// Drop later items whose description case-insensitively repeats an
/// earlier one.
fn dedupe_items(items: Vec<LineItem>) -> Vec<LineItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.description.trim().to_lowercase()))
        .collect()
}

/// Enhanced weighting: base extractor score 40%, merchant-identified bonus
/// 20%, field completeness 30%, arithmetic consistency 10%, capped at 1.0.
fn enhanced_confidence(record: &ReceiptRecord) -> f64 {
    let mut score = record.confidence_score * 0.4;

    if record.merchant_name.is_some() {
        score += 0.2;
    }

    let mut completeness = 0.0;
    if record.date.is_some() {
        completeness += 0.2;
    }
    if record.total_amount.is_some() {
        completeness += 0.3;
    }
    if !record.items.is_empty() {
        completeness += 0.3;
    }
    if record.tax_amount.is_some() {
        completeness += 0.1;
    }
    if record.merchant_name.is_some() {
        completeness += 0.1;
    }
    score += completeness * 0.3;

    let tolerance = cent_tolerance();
    let mut consistency: f64 = 0.5;
    if let (Some(subtotal), Some(tax), Some(total)) = (&record.subtotal, &record.tax_amount, &record.total_amount) {
        if (subtotal + tax - total).abs() < tolerance {
            consistency += 0.3;
        }
    }
    if let (Some(items_total), Some(subtotal)) = (record.items_total(), &record.subtotal) {
        if (items_total - subtotal).abs() < tolerance {
            consistency += 0.2;
        }
    }
    score += consistency.min(1.0) * 0.1;

    score.min(1.0)
}
