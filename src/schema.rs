// 📋 Canonical Schema - One normalized shape for every source
// All text/date/amount normalization happens here, once, so the
// resolver always compares already-normalized values.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

// ============================================================================
// FUNDING TYPE
// ============================================================================

/// Coarse funding classification shared by every source.
/// The fine-grained source label (US_GRANT, SBIR_PHASE_2, SEC_FORM_D, ...)
/// is preserved separately on the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingType {
    /// Assistance awards (grants, SBIR/STTR phases)
    Grant,

    /// Procurement contracts
    Contract,

    /// Awards we cannot classify more precisely
    Award,

    /// Equity raises (SEC Form D exempt offerings)
    Equity,
}

impl FundingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundingType::Grant => "grant",
            FundingType::Contract => "contract",
            FundingType::Award => "award",
            FundingType::Equity => "equity",
        }
    }

    pub fn parse(s: &str) -> Option<FundingType> {
        match s {
            "grant" => Some(FundingType::Grant),
            "contract" => Some(FundingType::Contract),
            "award" => Some(FundingType::Award),
            "equity" => Some(FundingType::Equity),
            _ => None,
        }
    }
}

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Public company identifier kinds with cross-source meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IdentifierKind {
    /// SAM.gov Unique Entity Identifier
    Uei,

    /// Dun & Bradstreet number (legacy, still present on older awards)
    Duns,

    /// SEC Central Index Key
    Cik,

    /// Company web domain
    Domain,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::Uei => "uei",
            IdentifierKind::Duns => "duns",
            IdentifierKind::Cik => "cik",
            IdentifierKind::Domain => "domain",
        }
    }

    pub fn parse(s: &str) -> Option<IdentifierKind> {
        match s {
            "uei" => Some(IdentifierKind::Uei),
            "duns" => Some(IdentifierKind::Duns),
            "cik" => Some(IdentifierKind::Cik),
            "domain" => Some(IdentifierKind::Domain),
            _ => None,
        }
    }
}

/// One (kind, value) identifier. Ordered so identifier sets iterate
/// deterministically (UEI before DUNS before CIK before domain).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub kind: IdentifierKind,
    pub value: String,
}

impl Identifier {
    pub fn new(kind: IdentifierKind, value: impl Into<String>) -> Self {
        Identifier {
            kind,
            value: value.into(),
        }
    }
}

// ============================================================================
// CANONICAL FUNDING EVENT
// ============================================================================

/// One normalized funding disclosure.
///
/// Invariants enforced by the mapper (consumers can rely on them):
/// - `amount_usd >= 0`
/// - `event_date` parsed to a real calendar date (unparseable dates are
///   mapping failures, never silently substituted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalFundingEvent {
    /// Company name exactly as the source reported it
    pub company_name: String,

    /// Name after case folding and punctuation/suffix stripping - the
    /// resolver compares this form
    pub normalized_name: String,

    pub funding_type: FundingType,

    /// Fine-grained source label (US_GRANT, SBIR_PHASE_2, SEC_FORM_D, ...)
    pub source_label: String,

    /// Amount in the single reporting currency (USD)
    pub amount_usd: f64,

    /// Amount exactly as the source reported it
    pub original_amount: f64,

    /// ISO currency code of the original amount
    pub original_currency: String,

    pub event_date: NaiveDate,

    /// Which connector produced this event
    pub source: crate::sources::SourceId,

    /// Source-native record id - natural key for upsert together with `source`
    pub source_record_id: String,

    /// Public identifiers present on the source record
    pub identifiers: Vec<Identifier>,

    pub industry: Option<String>,

    pub country: Option<String>,
}

// ============================================================================
// DATE WINDOW
// ============================================================================

/// Inclusive date range one run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        DateWindow { start, end }
    }

    /// Window ending today, reaching back `years` years (default lookback: 3).
    pub fn last_years(years: i32) -> Self {
        let end = chrono::Utc::now().date_naive();
        // Feb 29 has no same-day counterpart in non-leap years
        let start = end
            .with_year(end.year() - years)
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(end.year() - years, 3, 1).unwrap());
        DateWindow { start, end }
    }
}

// ============================================================================
// NORMALIZATION HELPERS
// ============================================================================

/// Trim and collapse to None when empty.
pub fn normalize_text(value: &str) -> Option<String> {
    let text = value.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Corporate suffixes stripped before name comparison.
const NAME_SUFFIXES: &[&str] = &[
    "corp",
    "corporation",
    "incorporated",
    "inc",
    "llc",
    "limited",
    "ltd",
    "co",
    "company",
];

/// Filler words that carry no identity signal.
const NAME_STOP_WORDS: &[&str] = &[
    "the",
    "and",
    "of",
    "group",
    "holdings",
    "enterprises",
    "solutions",
    "systems",
    "technologies",
    "international",
    "global",
    "usa",
    "us",
    "america",
];

/// Normalize a company name for comparison: lowercase, strip punctuation,
/// collapse whitespace, drop corporate suffixes and stop words.
///
/// "Acme Robotics, Inc." and "ACME ROBOTICS INC" both normalize to
/// "acme robotics".
pub fn normalize_company_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|w| !NAME_SUFFIXES.contains(w) && !NAME_STOP_WORDS.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Date formats sources actually emit (ISO first, US-style second).
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

/// Parse a source date string to a calendar date.
/// Accepts plain dates and ISO datetimes (the time part is dropped).
pub fn parse_event_date(value: &str) -> Option<NaiveDate> {
    let s = value.trim();
    if s.is_empty() {
        return None;
    }

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Some(date);
        }
    }

    // Datetime variants: take the date prefix of "2024-01-15T10:30:00" etc.
    // get() rather than indexing: byte 10 may not be a char boundary
    if let Some(prefix) = s.get(..10) {
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Some(date);
        }
    }

    None
}

/// Parse an amount that may arrive as "$1,250,000.00" or "1250000".
pub fn parse_amount(value: &str) -> Option<f64> {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text_trims_and_empties() {
        assert_eq!(normalize_text("  Acme  "), Some("Acme".to_string()));
        assert_eq!(normalize_text("   "), None);
        assert_eq!(normalize_text(""), None);
    }

    #[test]
    fn test_normalize_company_name_strips_suffixes() {
        assert_eq!(normalize_company_name("Acme Robotics, Inc."), "acme robotics");
        assert_eq!(normalize_company_name("ACME ROBOTICS INC"), "acme robotics");
        assert_eq!(normalize_company_name("Nova Bio Labs LLC"), "nova bio labs");
    }

    #[test]
    fn test_normalize_company_name_drops_stop_words() {
        assert_eq!(normalize_company_name("Global Acme Holdings Corp"), "acme");
    }

    #[test]
    fn test_parse_event_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(parse_event_date("2024-01-15"), Some(expected));
        assert_eq!(parse_event_date("01/15/2024"), Some(expected));
        assert_eq!(parse_event_date("2024/01/15"), Some(expected));
        assert_eq!(parse_event_date("2024-01-15T10:30:00"), Some(expected));
    }

    #[test]
    fn test_parse_event_date_rejects_garbage() {
        assert_eq!(parse_event_date("not-a-date"), None);
        assert_eq!(parse_event_date(""), None);
        assert_eq!(parse_event_date("2024-13-45"), None);
    }

    #[test]
    fn test_parse_event_date_rejects_multibyte_separators() {
        // En-dashes put a multibyte char across the 10-byte date prefix;
        // must return None, never panic on a char boundary
        assert_eq!(parse_event_date("2024\u{2013}01\u{2013}15"), None);
        assert_eq!(parse_event_date("2024年01月15日"), None);
    }

    #[test]
    fn test_parse_amount_handles_currency_strings() {
        assert_eq!(parse_amount("$1,250,000.00"), Some(1_250_000.0));
        assert_eq!(parse_amount("150000"), Some(150_000.0));
        assert_eq!(parse_amount("$ 500"), Some(500.0));
        assert_eq!(parse_amount("n/a"), None);
        assert_eq!(parse_amount(""), None);
    }

    #[test]
    fn test_identifier_ordering_is_deterministic() {
        let mut ids = vec![
            Identifier::new(IdentifierKind::Domain, "acme.com"),
            Identifier::new(IdentifierKind::Uei, "UEI-XYZ"),
            Identifier::new(IdentifierKind::Duns, "123456789"),
        ];
        ids.sort();
        assert_eq!(ids[0].kind, IdentifierKind::Uei);
        assert_eq!(ids[1].kind, IdentifierKind::Duns);
        assert_eq!(ids[2].kind, IdentifierKind::Domain);
    }

    #[test]
    fn test_date_window_last_years() {
        let window = DateWindow::last_years(3);
        assert!(window.start < window.end);
        assert_eq!(window.end.year() - window.start.year(), 3);
    }
}
