//! Compiled pattern families for receipt field extraction.
//!
//! Each family is an ordered slice tried first-match-wins. Families are
//! compiled once; `Lazy` keeps construction off every extraction call.

use once_cell::sync::Lazy;
use regex::Regex;

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("pattern table entry must compile"))
        .collect()
}

/// Date formats seen on receipts: numeric US, numeric ISO, and the two
/// month-name orders.
pub static DATE: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})",
        r"(\d{4}[/-]\d{1,2}[/-]\d{1,2})",
        r"(?i)((?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2},?\s+\d{2,4})",
        r"(?i)(\d{1,2}\s+(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{2,4})",
    ])
});

/// `chrono` format strings tried against a captured date string.
pub const DATE_FORMATS: &[&str] = &[
    "%m/%d/%Y", "%m-%d-%Y", "%Y/%m/%d", "%Y-%m-%d", "%m/%d/%y", "%m-%d-%y", "%B %d, %Y", "%b %d, %Y", "%d %B %Y",
    "%d %b %Y",
];

pub static TIME: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)(\d{1,2}:\d{2}(?::\d{2})?\s*(?:am|pm)?)",
        r"(?i)((?:1[0-2]|0?[1-9]):\d{2}\s*(?:am|pm))",
    ])
});

// The leading word boundary keeps the bare "total" alternatives from
// matching inside "Subtotal".
pub static TOTAL: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)\b(?:total|amount due|balance due|grand total)[:\s]*\$?(\d+\.\d{2})",
        r"(?i)\btotal[:\s]*(\d+\.\d{2})",
    ])
});

pub static SUBTOTAL: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)\b(?:subtotal|sub total|sub-total)[:\s]*\$?(\d+\.\d{2})",
        r"(?i)\bsubtotal[:\s]*(\d+\.\d{2})",
    ])
});

pub static TAX: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)\b(?:tax|sales tax|vat)[:\s]*\$?(\d+\.\d{2})",
        r"(?i)\btax[:\s]*(\d+\.\d{2})",
    ])
});

pub static TIP: Lazy<Vec<Regex>> = Lazy::new(|| compile(&[r"(?i)\b(?:tip|gratuity)[:\s]*\$?(\d+\.\d{2})"]));

pub static PHONE: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?:\+?1[-.\s]?)?\(?([0-9]{3})\)?[-.\s]?([0-9]{3})[-.\s]?([0-9]{4})",
        r"(\d{3}[-.\s]\d{3}[-.\s]\d{4})",
    ])
});

pub static RECEIPT_NUMBER: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)(?:receipt|ref|reference|order)[#\s:]*([a-z0-9]+)",
        r"(?i)#([a-z0-9]{4,})",
    ])
});

/// Payment method keyword plus optional trailing card digits.
pub static PAYMENT: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)(?:visa|mastercard|amex|american express|discover|cash|credit|debit)(?:\s+ending\s+in\s+(\d{4}))?",
    ])
});

/// Structural line-item patterns, matched against whole trimmed lines:
/// `description price`, `qty description unit_price total_price`,
/// `description qty x unit_price total_price`.
pub static ITEM: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"^(.+?)\s+\$?(\d+\.\d{2})$",
        r"^(\d+)\s+(.+?)\s+\$?(\d+\.\d{2})\s+\$?(\d+\.\d{2})$",
        r"^(.+?)\s+(\d+)\s*x\s*\$?(\d+\.\d{2})\s+\$?(\d+\.\d{2})$",
    ])
});

/// Street-suffix / city-state-zip / bare street-number shapes used to tell
/// address lines apart from the merchant name block.
pub static ADDRESS_INDICATORS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)\d+\s+\w+\s+(st|street|ave|avenue|rd|road|blvd|boulevard|dr|drive|ln|lane|ct|court)",
        r"\w+,\s*[A-Z]{2}\s*\d{5}",
        r"\d{3,5}\s+\w+",
    ])
});

/// First match of a pattern family against `text`, returning capture 1.
pub fn first_capture<'t>(family: &[Regex], text: &'t str) -> Option<&'t str> {
    family.iter().find_map(|re| {
        re.captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_family_keyword_anchored() {
        assert_eq!(first_capture(&TOTAL, "Grand Total: $42.13"), Some("42.13"));
        assert_eq!(first_capture(&TOTAL, "TOTAL 9.99"), Some("9.99"));
        assert_eq!(first_capture(&TOTAL, "no amounts here"), None);
    }

    #[test]
    fn test_subtotal_does_not_shadow_total() {
        assert_eq!(first_capture(&SUBTOTAL, "Subtotal: 10.00"), Some("10.00"));
        // The total family must skip the "total" inside "Subtotal" and take
        // the real total line.
        assert_eq!(
            first_capture(&TOTAL, "Subtotal: 10.00\nTax: 0.80\nTotal: 10.80"),
            Some("10.80")
        );
        assert_eq!(first_capture(&TOTAL, "Subtotal: 10.00"), None);
    }

    #[test]
    fn test_date_families_cover_four_shapes() {
        assert_eq!(first_capture(&DATE, "on 12/31/2023 at noon"), Some("12/31/2023"));
        assert!(DATE[1].is_match("2023-12-31"));
        assert_eq!(first_capture(&DATE[2..3], "Jan 5, 2024"), Some("Jan 5, 2024"));
        assert_eq!(first_capture(&DATE[3..4], "5 Jan 2024"), Some("5 Jan 2024"));
    }

    #[test]
    fn test_item_patterns_capture_structures() {
        let caps = ITEM[0].captures("MILK 2% GAL 3.49").unwrap();
        assert_eq!(&caps[1], "MILK 2% GAL");
        assert_eq!(&caps[2], "3.49");

        let caps = ITEM[1].captures("2 APPLES 0.50 1.00").unwrap();
        assert_eq!(&caps[1], "2");
        assert_eq!(&caps[2], "APPLES");

        let caps = ITEM[2].captures("BANANAS 3 x 0.25 0.75").unwrap();
        assert_eq!(&caps[1], "BANANAS");
        assert_eq!(&caps[4], "0.75");
    }

    #[test]
    fn test_address_indicators() {
        assert!(ADDRESS_INDICATORS.iter().any(|re| re.is_match("123 Main Street")));
        assert!(ADDRESS_INDICATORS.iter().any(|re| re.is_match("Springfield, IL 62704")));
        assert!(!ADDRESS_INDICATORS[0].is_match("WALMART SUPERCENTER"));
    }

    #[test]
    fn test_payment_with_card_digits() {
        let caps = PAYMENT[0].captures("VISA ending in 4242").unwrap();
        assert_eq!(caps.get(1).map(|m| m.as_str()), Some("4242"));
        assert!(PAYMENT[0].is_match("paid cash"));
    }
}
