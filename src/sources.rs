// 🔌 Source Connectors - Typed raw records per data source
// Each connector gets its own strongly-typed record variant instead of
// duck-typed field maps; the mapper matches on the variant tag.

use serde::{Deserialize, Serialize};

use crate::fetcher::FetchConfig;

// ============================================================================
// SOURCE ID
// ============================================================================

/// Tag for each configured connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    /// USAspending.gov award search API
    UsaSpending,

    /// SEC EDGAR Form D filings
    Sec,

    /// SBIR.gov / STTR award API
    Sbir,
}

impl SourceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::UsaSpending => "usaspending",
            SourceId::Sec => "sec",
            SourceId::Sbir => "sbir",
        }
    }

    pub fn parse(s: &str) -> Option<SourceId> {
        match s {
            "usaspending" => Some(SourceId::UsaSpending),
            "sec" => Some(SourceId::Sec),
            "sbir" => Some(SourceId::Sbir),
            _ => None,
        }
    }

    pub fn all() -> &'static [SourceId] {
        &[SourceId::UsaSpending, SourceId::Sec, SourceId::Sbir]
    }
}

// ============================================================================
// SOURCE CONFIG
// ============================================================================

/// Per-source connector configuration.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub id: SourceId,

    /// API endpoint the transport hits
    pub endpoint: String,

    pub fetch: FetchConfig,
}

impl SourceConfig {
    /// Built-in endpoint and default fetch settings for a source.
    pub fn defaults(id: SourceId) -> Self {
        let endpoint = match id {
            SourceId::UsaSpending => {
                "https://api.usaspending.gov/api/v2/search/spending_by_award/".to_string()
            }
            SourceId::Sec => "https://www.sec.gov/cgi-bin/browse-edgar".to_string(),
            SourceId::Sbir => "https://api.www.sbir.gov/public/api/awards".to_string(),
        };
        SourceConfig {
            id,
            endpoint,
            fetch: FetchConfig::default(),
        }
    }
}

// ============================================================================
// RAW FIELD
// ============================================================================

/// A JSON field that sources emit inconsistently as a number or a string
/// ("150000" vs 150000, CIK with or without quotes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawField {
    Number(f64),
    Text(String),
}

impl RawField {
    /// Numeric reading; text goes through amount cleanup ("$1,250,000").
    pub fn as_amount(&self) -> Option<f64> {
        match self {
            RawField::Number(n) if n.is_finite() => Some(*n),
            RawField::Number(_) => None,
            RawField::Text(s) => crate::schema::parse_amount(s),
        }
    }

    /// Text reading; whole numbers render without a decimal point.
    pub fn as_text(&self) -> Option<String> {
        match self {
            RawField::Number(n) if n.fract() == 0.0 => Some(format!("{}", *n as i64)),
            RawField::Number(n) => Some(format!("{n}")),
            RawField::Text(s) => crate::schema::normalize_text(s),
        }
    }
}

// ============================================================================
// SOURCE RECORDS
// ============================================================================

/// One result row from the USAspending award search.
/// The API mixes snake_case and title-cased keys across endpoints, so most
/// fields carry aliases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsaSpendingRecord {
    #[serde(alias = "Recipient Name")]
    pub recipient_name: Option<String>,

    #[serde(alias = "Award Amount", alias = "total_obligation", alias = "obligation")]
    pub award_amount: Option<f64>,

    #[serde(alias = "Action Date")]
    pub action_date: Option<String>,

    /// Award type code: A/B/C/D are contracts, 02-05 are assistance
    #[serde(
        rename = "award_type",
        alias = "Award Type",
        alias = "type",
        alias = "prime_award_type"
    )]
    pub award_type_code: Option<String>,

    #[serde(alias = "Recipient UEI")]
    pub recipient_uei: Option<String>,

    #[serde(alias = "Recipient DUNS")]
    pub recipient_duns: Option<String>,

    #[serde(
        rename = "award_id",
        alias = "Award ID",
        alias = "piid",
        alias = "fain",
        alias = "uri",
        alias = "generated_unique_award_id"
    )]
    pub award_id: Option<String>,

    #[serde(alias = "NAICS Code")]
    pub naics_code: Option<RawField>,

    #[serde(alias = "Recipient Country")]
    pub recipient_country: Option<String>,
}

/// One SEC Form D filing from the EDGAR index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecFormDRecord {
    pub cik: Option<RawField>,

    pub company_name: Option<String>,

    #[serde(alias = "filing_date")]
    pub date_filed: Option<String>,

    /// Amount raised; Form D reports several amount fields, first present wins
    #[serde(alias = "amount_sold", alias = "offering_amount", alias = "amount")]
    pub total_offering_amount: Option<RawField>,

    #[serde(alias = "industry_group_type")]
    pub sic_code: Option<RawField>,

    pub accession_number: Option<String>,
}

/// One SBIR/STTR award from the SBIR.gov API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SbirRecord {
    #[serde(alias = "company_name", alias = "awardee_name", alias = "firm")]
    pub firm_name: Option<String>,

    /// "SBIR" or "STTR"
    pub program: Option<String>,

    /// Phase: "1"/"2"/"3" or roman "I"/"II"/"III"
    pub phase: Option<RawField>,

    #[serde(alias = "amount", alias = "total_award_amount")]
    pub award_amount: Option<RawField>,

    #[serde(
        alias = "proposal_award_date",
        alias = "start_date",
        alias = "date_awarded"
    )]
    pub award_date: Option<String>,

    #[serde(alias = "uei_number")]
    pub uei: Option<String>,

    #[serde(alias = "duns_number")]
    pub duns: Option<RawField>,

    #[serde(alias = "naics")]
    pub naics_code: Option<RawField>,

    #[serde(alias = "contract_number", alias = "award_id")]
    pub award_number: Option<String>,

    pub agency: Option<String>,
}

/// Tagged raw record - one case per connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SourceRecord {
    UsaSpending(UsaSpendingRecord),
    SecFormD(SecFormDRecord),
    Sbir(SbirRecord),
}

impl SourceRecord {
    pub fn source_id(&self) -> SourceId {
        match self {
            SourceRecord::UsaSpending(_) => SourceId::UsaSpending,
            SourceRecord::SecFormD(_) => SourceId::Sec,
            SourceRecord::Sbir(_) => SourceId::Sbir,
        }
    }
}

// ============================================================================
// PAGE PARSING
// ============================================================================

/// One fetched page decoded into typed records plus the pagination signal.
#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub records: Vec<SourceRecord>,

    /// Explicit end-of-results signal when the source provides one
    /// (USAspending `page_metadata.hasNext`); None means "go by emptiness"
    pub has_next: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct UsaSpendingPage {
    #[serde(default)]
    results: Vec<UsaSpendingRecord>,
    #[serde(default)]
    page_metadata: Option<UsaSpendingPageMetadata>,
}

#[derive(Debug, Deserialize)]
struct UsaSpendingPageMetadata {
    #[serde(rename = "hasNext")]
    has_next: bool,
}

#[derive(Debug, Deserialize)]
struct SecPage {
    #[serde(default, alias = "results")]
    filings: Vec<SecFormDRecord>,
}

#[derive(Debug, Deserialize)]
struct SbirPage {
    #[serde(default)]
    results: Vec<SbirRecord>,
}

/// Decode a raw page body into typed records for the given source.
pub fn parse_page(source: SourceId, body: &str) -> Result<ParsedPage, serde_json::Error> {
    match source {
        SourceId::UsaSpending => {
            let page: UsaSpendingPage = serde_json::from_str(body)?;
            Ok(ParsedPage {
                has_next: page.page_metadata.map(|m| m.has_next),
                records: page
                    .results
                    .into_iter()
                    .map(SourceRecord::UsaSpending)
                    .collect(),
            })
        }
        SourceId::Sec => {
            let page: SecPage = serde_json::from_str(body)?;
            Ok(ParsedPage {
                has_next: None,
                records: page.filings.into_iter().map(SourceRecord::SecFormD).collect(),
            })
        }
        SourceId::Sbir => {
            let page: SbirPage = serde_json::from_str(body)?;
            Ok(ParsedPage {
                has_next: None,
                records: page.results.into_iter().map(SourceRecord::Sbir).collect(),
            })
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_usaspending_page_title_cased_keys() {
        let body = r#"{
            "results": [
                {
                    "Recipient Name": "Nova Bio Labs",
                    "Award Amount": 150000,
                    "Action Date": "2024-01-15",
                    "Award Type": "02",
                    "Recipient UEI": "UEI-ABC",
                    "Award ID": "GRANT-1"
                }
            ],
            "page_metadata": {"hasNext": true}
        }"#;

        let page = parse_page(SourceId::UsaSpending, body).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.has_next, Some(true));

        match &page.records[0] {
            SourceRecord::UsaSpending(rec) => {
                assert_eq!(rec.recipient_name.as_deref(), Some("Nova Bio Labs"));
                assert_eq!(rec.award_amount, Some(150000.0));
                assert_eq!(rec.award_type_code.as_deref(), Some("02"));
                assert_eq!(rec.award_id.as_deref(), Some("GRANT-1"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_parse_usaspending_page_snake_case_keys() {
        let body = r#"{
            "results": [
                {
                    "recipient_name": "Acme Robotics",
                    "award_amount": 250000.5,
                    "action_date": "2024-02-01",
                    "award_type": "A",
                    "recipient_duns": "987654321"
                }
            ],
            "page_metadata": {"hasNext": false}
        }"#;

        let page = parse_page(SourceId::UsaSpending, body).unwrap();
        assert_eq!(page.has_next, Some(false));
        match &page.records[0] {
            SourceRecord::UsaSpending(rec) => {
                assert_eq!(rec.recipient_name.as_deref(), Some("Acme Robotics"));
                assert_eq!(rec.recipient_duns.as_deref(), Some("987654321"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_parse_sbir_page_mixed_field_types() {
        let body = r#"{
            "results": [
                {
                    "firm_name": "Nova Bio Labs",
                    "program": "SBIR",
                    "phase": 2,
                    "award_amount": "750,000",
                    "proposal_award_date": "2024-03-10",
                    "duns": 123456789
                }
            ]
        }"#;

        let page = parse_page(SourceId::Sbir, body).unwrap();
        match &page.records[0] {
            SourceRecord::Sbir(rec) => {
                assert_eq!(rec.phase.as_ref().unwrap().as_text().as_deref(), Some("2"));
                assert_eq!(rec.award_amount.as_ref().unwrap().as_amount(), Some(750_000.0));
                assert_eq!(
                    rec.duns.as_ref().unwrap().as_text().as_deref(),
                    Some("123456789")
                );
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_parse_page_rejects_malformed_body() {
        assert!(parse_page(SourceId::UsaSpending, "not json").is_err());
        assert!(parse_page(SourceId::Sbir, "<html>rate limited</html>").is_err());
    }

    #[test]
    fn test_parse_empty_page() {
        let page = parse_page(SourceId::Sec, r#"{"filings": []}"#).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.has_next, None);
    }

    #[test]
    fn test_source_id_round_trip() {
        for id in SourceId::all() {
            assert_eq!(SourceId::parse(id.as_str()), Some(*id));
        }
        assert_eq!(SourceId::parse("crunchbase"), None);
    }

    #[test]
    fn test_raw_field_text_of_whole_number() {
        assert_eq!(RawField::Number(334111.0).as_text().as_deref(), Some("334111"));
        assert_eq!(RawField::Text("  42 ".into()).as_text().as_deref(), Some("42"));
        assert_eq!(RawField::Text("   ".into()).as_text(), None);
    }
}
