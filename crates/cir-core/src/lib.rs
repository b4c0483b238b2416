//! Core domain model and matching primitives for CIR.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cir-core";

/// Postal address as exported by the source system. All fields optional-as-empty;
/// equality for linking purposes goes through [`Address::normalized_key`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub line1: String,
    pub line2: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
}

impl Address {
    /// Single-line comparison key: lowercased, punctuation-stripped, whitespace
    /// collapsed. Empty when `line1` is blank so that two unknown addresses never
    /// compare equal.
    pub fn normalized_key(&self) -> Option<String> {
        if self.line1.trim().is_empty() {
            return None;
        }
        let joined = format!(
            "{} {} {} {}",
            self.line1, self.city, self.state, self.postal_code
        );
        Some(normalize_text(&joined))
    }

    pub fn is_empty(&self) -> bool {
        self.line1.trim().is_empty()
            && self.line2.trim().is_empty()
            && self.city.trim().is_empty()
            && self.state.trim().is_empty()
            && self.postal_code.trim().is_empty()
    }
}

/// Account record keyed by the source system's stable external id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub external_id: String,
    pub name: String,
    pub account_type: String,
    pub tags: BTreeSet<String>,
    pub archived: bool,
    pub address: Address,
}

/// Contact record. `external_id` is optional: leads without a contact id are
/// synthesized with `new_from_leads = true` and no id is ever fabricated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub external_id: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub account_ref: Option<String>,
    pub do_not_email: bool,
    pub do_not_mail: bool,
    pub do_not_call: bool,
    pub new_from_leads: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EstimateStatus {
    Won,
    Lost,
    Pending,
    Draft,
    Other(String),
}

impl EstimateStatus {
    pub fn from_sheet(raw: &str) -> Self {
        match normalize_text(raw).as_str() {
            "" | "pending" | "awaiting response" | "open" => EstimateStatus::Pending,
            "won" | "approved" | "accepted" => EstimateStatus::Won,
            "lost" | "declined" | "rejected" => EstimateStatus::Lost,
            "draft" => EstimateStatus::Draft,
            other => EstimateStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EstimateStatus::Won => "won",
            EstimateStatus::Lost => "lost",
            EstimateStatus::Pending => "pending",
            EstimateStatus::Draft => "draft",
            EstimateStatus::Other(s) => s,
        }
    }
}

impl Default for EstimateStatus {
    fn default() -> Self {
        EstimateStatus::Pending
    }
}

impl From<String> for EstimateStatus {
    fn from(value: String) -> Self {
        EstimateStatus::from_sheet(&value)
    }
}

impl From<EstimateStatus> for String {
    fn from(value: EstimateStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Estimate record. Estimates are never dropped for failing to link: their
/// monetary and date data still matters for reporting, so `account_ref` stays
/// `None` and the record is counted as orphaned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub external_id: String,
    pub client_name: String,
    pub status: EstimateStatus,
    pub estimate_date: Option<NaiveDate>,
    pub contract_start: Option<NaiveDate>,
    pub contract_end: Option<NaiveDate>,
    pub total: Option<f64>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tags: BTreeSet<String>,
    pub address: Address,
    pub contact_ref: Option<String>,
    pub account_ref: Option<String>,
    pub linked_by: Option<LinkStrategy>,
}

/// Jobsite record. The only record type with a human-in-the-loop resolution
/// step: `manually_linked` marks an operator override of the automatic cascade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Jobsite {
    pub external_id: String,
    pub name: String,
    pub address: Address,
    pub contact_ref: Option<String>,
    pub account_ref: Option<String>,
    pub linked_by: Option<LinkStrategy>,
    pub manually_linked: bool,
}

/// How a record was associated with an account. Cascade order is fixed per
/// record type; `Manual` only ever results from an operator override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStrategy {
    ContactId,
    Email,
    Phone,
    TagOverlap,
    Address,
    Name,
    FuzzyName,
    Manual,
}

/// Outcome of one pass through a linking cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    NoMatch,
    MatchedBy {
        strategy: LinkStrategy,
        account_id: String,
    },
}

impl MatchOutcome {
    pub fn matched(&self) -> bool {
        matches!(self, MatchOutcome::MatchedBy { .. })
    }
}

// --- raw sheet rows -----------------------------------------------------------
//
// Handoff contract between the sheet parsers and the merge engine. One struct
// per fixed export layout, already trimmed and coerced but not yet linked.

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactRow {
    pub contact_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub account_id: Option<String>,
    pub account_name: String,
    pub account_type: String,
    pub tags: BTreeSet<String>,
    pub archived: bool,
    pub address: Address,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadRow {
    pub contact_id: Option<String>,
    pub name: String,
    pub company: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub do_not_email: bool,
    pub do_not_mail: bool,
    pub do_not_call: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimateRow {
    pub estimate_id: String,
    pub client_name: String,
    pub status: EstimateStatus,
    pub estimate_date: Option<NaiveDate>,
    pub contract_start: Option<NaiveDate>,
    pub contract_end: Option<NaiveDate>,
    pub total: Option<f64>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tags: BTreeSet<String>,
    pub address: Address,
    pub contact_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobsiteRow {
    pub jobsite_id: String,
    pub name: String,
    pub address: Address,
    pub contact_id: Option<String>,
}

// --- normalization ------------------------------------------------------------

/// Lowercase, map every non-alphanumeric to a space, collapse runs. The shared
/// normalization under every matching strategy.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn normalize_email(input: &str) -> Option<String> {
    let trimmed = input.trim().to_lowercase();
    if trimmed.is_empty() || !trimmed.contains('@') {
        None
    } else {
        Some(trimmed)
    }
}

/// Digits-only phone key. 11-digit numbers with a leading country `1` compare
/// equal to their 10-digit form; anything under 7 digits never matches.
pub fn normalize_phone(input: &str) -> Option<String> {
    let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = if digits.len() == 11 && digits.starts_with('1') {
        digits[1..].to_string()
    } else {
        digits
    };
    if digits.len() < 7 {
        None
    } else {
        Some(digits)
    }
}

pub fn normalize_tag(input: &str) -> Option<String> {
    let tag = normalize_text(input);
    if tag.is_empty() {
        None
    } else {
        Some(tag)
    }
}

const FUZZY_JARO_WINKLER_THRESHOLD: f64 = 0.92;

/// Deterministic name comparison: after [`normalize_text`] on both sides, two
/// names match iff one contains the other (both at least 4 chars), the shorter
/// token set is a subset of the longer, or the Jaro-Winkler similarity of the
/// normalized strings is at least 0.92. Identical inputs always produce the
/// same verdict.
pub fn fuzzy_name_match(a: &str, b: &str) -> bool {
    let na = normalize_text(a);
    let nb = normalize_text(b);
    if na.is_empty() || nb.is_empty() {
        return false;
    }
    if na == nb {
        return true;
    }
    if na.len() >= 4 && nb.len() >= 4 && (na.contains(&nb) || nb.contains(&na)) {
        return true;
    }
    if token_subset(&na, &nb) {
        return true;
    }
    strsim::jaro_winkler(&na, &nb) >= FUZZY_JARO_WINKLER_THRESHOLD
}

/// True when the token set of the shorter normalized name is a subset of the
/// longer's.
fn token_subset(na: &str, nb: &str) -> bool {
    let ta: BTreeSet<&str> = na.split(' ').collect();
    let tb: BTreeSet<&str> = nb.split(' ').collect();
    if ta.is_empty() || tb.is_empty() {
        return false;
    }
    if ta.len() <= tb.len() {
        ta.is_subset(&tb)
    } else {
        tb.is_subset(&ta)
    }
}

/// Well-formed source-system id: 1-64 chars of `[A-Za-z0-9_-]` with at least
/// one digit. Anything else is treated as malformed when validating references.
pub fn is_well_formed_external_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && id.chars().any(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_normalization_strips_country_code() {
        assert_eq!(
            normalize_phone("+1 (555) 867-5309"),
            Some("5558675309".to_string())
        );
        assert_eq!(
            normalize_phone("555-867-5309"),
            Some("5558675309".to_string())
        );
        assert_eq!(normalize_phone("867-53"), None);
    }

    #[test]
    fn fuzzy_match_token_subset() {
        assert!(fuzzy_name_match("Acme Plumbing", "ACME Plumbing LLC"));
        assert!(fuzzy_name_match("acme-plumbing", "Acme Plumbing"));
    }

    #[test]
    fn fuzzy_match_near_spelling() {
        assert!(fuzzy_name_match("Acme Plumbng", "Acme Plumbing"));
    }

    #[test]
    fn fuzzy_match_rejects_unrelated_names() {
        assert!(!fuzzy_name_match("Acme Plumbing", "Zenith Roofing"));
        assert!(!fuzzy_name_match("", "Acme Plumbing"));
    }

    #[test]
    fn address_key_requires_line1() {
        let addr = Address {
            line1: "12 Oak St.".into(),
            city: "Springfield".into(),
            state: "IL".into(),
            postal_code: "62704".into(),
            ..Default::default()
        };
        assert_eq!(
            addr.normalized_key(),
            Some("12 oak st springfield il 62704".to_string())
        );
        assert_eq!(Address::default().normalized_key(), None);
    }

    #[test]
    fn estimate_status_maps_sheet_values() {
        assert_eq!(EstimateStatus::from_sheet("Won"), EstimateStatus::Won);
        assert_eq!(EstimateStatus::from_sheet(" declined "), EstimateStatus::Lost);
        assert_eq!(EstimateStatus::from_sheet(""), EstimateStatus::Pending);
        assert_eq!(
            EstimateStatus::from_sheet("changes requested"),
            EstimateStatus::Other("changes requested".into())
        );
    }

    #[test]
    fn external_id_format() {
        assert!(is_well_formed_external_id("acct-10442"));
        assert!(is_well_formed_external_id("10442"));
        assert!(!is_well_formed_external_id("mock account"));
        assert!(!is_well_formed_external_id("sample"));
        assert!(!is_well_formed_external_id(""));
    }
}
