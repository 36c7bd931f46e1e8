// 🗺️ Mapper - Source record → canonical funding event
// Pure and deterministic: no I/O, no clock, no registry access.
// A record that fails validation becomes a MappingError (counted by the
// run, never stored, never aborts the run).

use thiserror::Error;

use crate::schema::{
    normalize_company_name, normalize_text, parse_event_date, CanonicalFundingEvent, FundingType,
    Identifier, IdentifierKind,
};
use crate::sources::{SbirRecord, SecFormDRecord, SourceId, SourceRecord, UsaSpendingRecord};

/// All current sources report USD; a non-USD source would convert here.
const REPORTING_CURRENCY: &str = "USD";

// ============================================================================
// MAPPING ERROR
// ============================================================================

/// One malformed source record. Carries the raw record for replay/debugging.
#[derive(Debug, Error)]
#[error("{src} record {id}: {reason}", src = .record.source_id().as_str(), id = .source_record_id.as_deref().unwrap_or("<no id>"))]
pub struct MappingError {
    pub record: Box<SourceRecord>,
    pub source_record_id: Option<String>,
    pub reason: String,
}

fn reject(record: SourceRecord, id: Option<String>, reason: impl Into<String>) -> MappingError {
    MappingError {
        record: Box::new(record),
        source_record_id: id,
        reason: reason.into(),
    }
}

// ============================================================================
// ENTRY POINT
// ============================================================================

/// Map one raw record to a canonical event, or explain why it cannot be.
///
/// Required fields: company name, a non-negative parseable amount, and a
/// parseable calendar date. Everything else degrades to None.
pub fn map_record(record: SourceRecord) -> Result<CanonicalFundingEvent, MappingError> {
    match record {
        SourceRecord::UsaSpending(rec) => map_usaspending(rec),
        SourceRecord::SecFormD(rec) => map_sec_form_d(rec),
        SourceRecord::Sbir(rec) => map_sbir(rec),
    }
}

// ============================================================================
// USASPENDING
// ============================================================================

/// Award-type code → coarse funding type + source label.
/// Contracts (A/B/C/D) and assistance (02-05) per the USAspending data model;
/// anything else is a generic award.
pub fn classify_award_type(code: Option<&str>) -> (FundingType, &'static str) {
    match code.map(str::trim) {
        Some("A") | Some("B") | Some("C") | Some("D") => (FundingType::Contract, "US_CONTRACT"),
        Some("02") | Some("03") | Some("04") | Some("05") => (FundingType::Grant, "US_GRANT"),
        _ => (FundingType::Award, "US_AWARD"),
    }
}

fn map_usaspending(rec: UsaSpendingRecord) -> Result<CanonicalFundingEvent, MappingError> {
    let record_id = rec.award_id.as_deref().and_then(normalize_text);

    let name = match rec.recipient_name.as_deref().and_then(normalize_text) {
        Some(n) => n,
        None => {
            return Err(reject(
                SourceRecord::UsaSpending(rec),
                record_id,
                "missing company name",
            ))
        }
    };

    let amount = match rec.award_amount {
        Some(a) if a >= 0.0 => a,
        Some(_) => {
            return Err(reject(
                SourceRecord::UsaSpending(rec),
                record_id,
                "negative award amount",
            ))
        }
        None => {
            return Err(reject(
                SourceRecord::UsaSpending(rec),
                record_id,
                "missing award amount",
            ))
        }
    };

    let date = match rec.action_date.as_deref().and_then(parse_event_date) {
        Some(d) => d,
        None => {
            return Err(reject(
                SourceRecord::UsaSpending(rec),
                record_id,
                "missing or unparseable action date",
            ))
        }
    };

    let (funding_type, label) = classify_award_type(rec.award_type_code.as_deref());

    let mut identifiers = Vec::new();
    if let Some(uei) = rec.recipient_uei.as_deref().and_then(normalize_text) {
        identifiers.push(Identifier::new(IdentifierKind::Uei, uei));
    }
    if let Some(duns) = rec.recipient_duns.as_deref().and_then(normalize_text) {
        identifiers.push(Identifier::new(IdentifierKind::Duns, duns));
    }

    let source_record_id = record_id.unwrap_or_else(|| {
        // No official award id; synthesize a stable one from name + date
        format!("USASP-{}-{}", normalize_company_name(&name).replace(' ', ""), date)
    });

    Ok(CanonicalFundingEvent {
        normalized_name: normalize_company_name(&name),
        company_name: name,
        funding_type,
        source_label: label.to_string(),
        amount_usd: amount,
        original_amount: amount,
        original_currency: REPORTING_CURRENCY.to_string(),
        event_date: date,
        source: SourceId::UsaSpending,
        source_record_id,
        identifiers,
        industry: rec.naics_code.as_ref().and_then(|n| n.as_text()),
        country: rec.recipient_country.as_deref().and_then(normalize_text),
    })
}

// ============================================================================
// SEC FORM D
// ============================================================================

/// SIC code ranges → coarse industry names (simplified EDGAR table).
const SIC_RANGES: &[(u32, u32, &str)] = &[
    (100, 999, "Agriculture"),
    (1000, 1499, "Mining"),
    (1500, 1799, "Construction"),
    (2000, 3999, "Manufacturing"),
    (4000, 4799, "Transportation"),
    (4800, 4899, "Communications"),
    (4900, 4999, "Utilities"),
    (5000, 5199, "Wholesale Trade"),
    (5200, 5999, "Retail Trade"),
    (6000, 6799, "Finance"),
    (7000, 8999, "Services"),
    (9000, 9999, "Public Administration"),
];

/// Map a SIC code to an industry bucket.
pub fn sic_to_industry(sic: &str) -> Option<&'static str> {
    let code: u32 = sic.trim().parse().ok()?;
    SIC_RANGES
        .iter()
        .find(|(lo, hi, _)| code >= *lo && code <= *hi)
        .map(|(_, _, name)| *name)
        .or(Some("Other"))
}

fn map_sec_form_d(rec: SecFormDRecord) -> Result<CanonicalFundingEvent, MappingError> {
    let cik = rec.cik.as_ref().and_then(|c| c.as_text());
    let record_id = rec
        .accession_number
        .as_deref()
        .and_then(normalize_text)
        .or_else(|| {
            match (&cik, rec.date_filed.as_deref()) {
                (Some(cik), Some(date)) => Some(format!("CIK-{cik}-{date}")),
                _ => None,
            }
        });

    let name = match rec.company_name.as_deref().and_then(normalize_text) {
        Some(n) => n,
        None => {
            return Err(reject(
                SourceRecord::SecFormD(rec),
                record_id,
                "missing company name",
            ))
        }
    };

    let amount = match rec.total_offering_amount.as_ref().and_then(|a| a.as_amount()) {
        Some(a) if a >= 0.0 => a,
        Some(_) => {
            return Err(reject(
                SourceRecord::SecFormD(rec),
                record_id,
                "negative offering amount",
            ))
        }
        None => {
            return Err(reject(
                SourceRecord::SecFormD(rec),
                record_id,
                "missing or unparseable offering amount",
            ))
        }
    };

    let date = match rec.date_filed.as_deref().and_then(parse_event_date) {
        Some(d) => d,
        None => {
            return Err(reject(
                SourceRecord::SecFormD(rec),
                record_id,
                "missing or unparseable filing date",
            ))
        }
    };

    let mut identifiers = Vec::new();
    if let Some(cik) = &cik {
        identifiers.push(Identifier::new(IdentifierKind::Cik, cik.clone()));
    }

    let source_record_id =
        record_id.unwrap_or_else(|| format!("SEC-{date}"));

    Ok(CanonicalFundingEvent {
        normalized_name: normalize_company_name(&name),
        company_name: name,
        funding_type: FundingType::Equity,
        source_label: "SEC_FORM_D".to_string(),
        amount_usd: amount,
        original_amount: amount,
        original_currency: REPORTING_CURRENCY.to_string(),
        event_date: date,
        source: SourceId::Sec,
        source_record_id,
        identifiers,
        industry: rec
            .sic_code
            .as_ref()
            .and_then(|s| s.as_text())
            .and_then(|s| sic_to_industry(&s))
            .map(str::to_string),
        // SEC filings are US issuers by default
        country: Some("US".to_string()),
    })
}

// ============================================================================
// SBIR / STTR
// ============================================================================

/// NAICS two-digit sector → industry name (subset that actually shows up
/// in SBIR awards).
const NAICS_SECTORS: &[(u32, &str)] = &[
    (11, "Agriculture"),
    (21, "Mining"),
    (22, "Utilities"),
    (23, "Construction"),
    (31, "Manufacturing"),
    (32, "Manufacturing"),
    (33, "Manufacturing"),
    (42, "Wholesale Trade"),
    (48, "Transportation"),
    (51, "Information"),
    (52, "Finance"),
    (54, "Professional Services"),
    (56, "Administrative Services"),
    (61, "Educational Services"),
    (62, "Healthcare"),
    (81, "Other Services"),
];

/// Map a NAICS code to an industry bucket via its two-digit sector.
pub fn naics_to_industry(naics: &str) -> Option<&'static str> {
    let digits = naics.trim();
    if digits.len() < 2 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let sector: u32 = digits[..2].parse().ok()?;
    NAICS_SECTORS
        .iter()
        .find(|(s, _)| *s == sector)
        .map(|(_, name)| *name)
}

/// Program + phase → source label ("SBIR_PHASE_2", "STTR_PHASE_1", ...).
pub fn classify_sbir_label(program: Option<&str>, phase: Option<&str>) -> String {
    let base = match program {
        Some(p) if p.to_uppercase().contains("STTR") => "STTR",
        _ => "SBIR",
    };
    let suffix = match phase.map(str::trim) {
        Some("2") | Some("II") => "_PHASE_2",
        Some("3") | Some("III") => "_PHASE_3",
        _ => "_PHASE_1",
    };
    format!("{base}{suffix}")
}

fn map_sbir(rec: SbirRecord) -> Result<CanonicalFundingEvent, MappingError> {
    let record_id = rec
        .award_number
        .as_deref()
        .and_then(normalize_text)
        .map(|n| format!("SBIR-{n}"));

    let name = match rec.firm_name.as_deref().and_then(normalize_text) {
        Some(n) => n,
        None => {
            return Err(reject(
                SourceRecord::Sbir(rec),
                record_id,
                "missing company name",
            ))
        }
    };

    let amount = match rec.award_amount.as_ref().and_then(|a| a.as_amount()) {
        Some(a) if a >= 0.0 => a,
        Some(_) => {
            return Err(reject(
                SourceRecord::Sbir(rec),
                record_id,
                "negative award amount",
            ))
        }
        None => {
            return Err(reject(
                SourceRecord::Sbir(rec),
                record_id,
                "missing or unparseable award amount",
            ))
        }
    };

    let date = match rec.award_date.as_deref().and_then(parse_event_date) {
        Some(d) => d,
        None => {
            return Err(reject(
                SourceRecord::Sbir(rec),
                record_id,
                "missing or unparseable award date",
            ))
        }
    };

    let phase = rec.phase.as_ref().and_then(|p| p.as_text());
    let label = classify_sbir_label(rec.program.as_deref(), phase.as_deref());

    let mut identifiers = Vec::new();
    if let Some(uei) = rec.uei.as_deref().and_then(normalize_text) {
        identifiers.push(Identifier::new(IdentifierKind::Uei, uei));
    }
    if let Some(duns) = rec.duns.as_ref().and_then(|d| d.as_text()) {
        identifiers.push(Identifier::new(IdentifierKind::Duns, duns));
    }

    let source_record_id = record_id.unwrap_or_else(|| {
        // No official award number; synthesize from agency + phase + date + name
        format!(
            "SBIR-{}-{}-{}-{}",
            rec.agency.as_deref().unwrap_or("UNK"),
            phase.as_deref().unwrap_or("1"),
            date,
            normalize_company_name(&name).replace(' ', "")
        )
    });

    Ok(CanonicalFundingEvent {
        normalized_name: normalize_company_name(&name),
        company_name: name,
        funding_type: FundingType::Grant,
        source_label: label,
        amount_usd: amount,
        original_amount: amount,
        original_currency: REPORTING_CURRENCY.to_string(),
        event_date: date,
        source: SourceId::Sbir,
        source_record_id,
        identifiers,
        industry: rec
            .naics_code
            .as_ref()
            .and_then(|n| n.as_text())
            .and_then(|n| naics_to_industry(&n))
            .map(str::to_string),
        // SBIR awards go to US small businesses by definition
        country: Some("US".to_string()),
    })
}

// ============================================================================
// TESTS
// ============================================================================
