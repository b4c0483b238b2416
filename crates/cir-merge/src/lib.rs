//! Reconciliation core: valid-id extraction, the merge engine with its
//! linkage cascades, the existing-data comparator, reference validation, and
//! per-run reports/snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use cir_backend::{push_import, BackendApi, Entity, ImportOutcome, SheetVault};
use cir_core::{
    fuzzy_name_match, is_well_formed_external_id, normalize_email, normalize_phone,
    normalize_tag, normalize_text, Account, Contact, ContactRow, Estimate, EstimateRow, Jobsite,
    JobsiteRow, LeadRow, LinkStrategy, MatchOutcome,
};
use cir_sheets::{
    parse_contacts, parse_estimates, parse_jobsites, parse_leads, ParseStats, RawSheet,
    SheetConfig, SheetKind,
};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cir-merge";

// --- valid ids ----------------------------------------------------------------

/// The authoritative universe of external ids present in the current import
/// sheets. Pure function of the four parsed sheets; drives the pre-upload
/// filter, orphan detection, and reference validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidIds {
    pub account_ids: BTreeSet<String>,
    pub contact_ids: BTreeSet<String>,
    pub estimate_ids: BTreeSet<String>,
    pub jobsite_ids: BTreeSet<String>,
}

pub fn extract_valid_ids(
    contacts: &[ContactRow],
    leads: &[LeadRow],
    estimates: &[EstimateRow],
    jobsites: &[JobsiteRow],
) -> ValidIds {
    let mut ids = ValidIds::default();
    for row in contacts {
        if !row.contact_id.trim().is_empty() {
            ids.contact_ids.insert(row.contact_id.trim().to_string());
        }
        if let Some(account_id) = row.account_id.as_deref() {
            if !account_id.trim().is_empty() {
                ids.account_ids.insert(account_id.trim().to_string());
            }
        }
    }
    for lead in leads {
        if let Some(contact_id) = lead.contact_id.as_deref() {
            if !contact_id.trim().is_empty() {
                ids.contact_ids.insert(contact_id.trim().to_string());
            }
        }
    }
    for row in estimates {
        if !row.estimate_id.trim().is_empty() {
            ids.estimate_ids.insert(row.estimate_id.trim().to_string());
        }
    }
    for row in jobsites {
        if !row.jobsite_id.trim().is_empty() {
            ids.jobsite_ids.insert(row.jobsite_id.trim().to_string());
        }
    }
    ids
}

// --- manual link overrides ----------------------------------------------------

/// Operator overrides for jobsite-account assignment, applied as a final pass
/// after the automatic cascade. `Some(account_id)` forces a link, `None`
/// forces unlinked; jobsites without an entry keep their automatic result.
/// Kept as an explicit patch structure so the audit trail of automatic vs
/// manual decisions survives re-merges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOverrides {
    entries: BTreeMap<String, Option<String>>,
}

impl LinkOverrides {
    pub fn set(&mut self, jobsite_id: impl Into<String>, account_id: Option<String>) {
        self.entries.insert(jobsite_id.into(), account_id);
    }

    /// Drop the override entirely, restoring the automatic cascade result.
    pub fn reset(&mut self, jobsite_id: &str) {
        self.entries.remove(jobsite_id);
    }

    pub fn get(&self, jobsite_id: &str) -> Option<&Option<String>> {
        self.entries.get(jobsite_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// --- statistics ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkingStats {
    pub total: usize,
    pub linked: usize,
    pub orphaned: usize,
    pub link_rate: f64,
    pub linked_by_contact_id: usize,
    pub linked_by_email: usize,
    pub linked_by_phone: usize,
    pub linked_by_tags: usize,
    pub linked_by_address: usize,
    pub linked_by_name: usize,
    pub linked_by_fuzzy_name: usize,
    pub linked_manually: usize,
}

impl LinkingStats {
    fn bump(&mut self, strategy: LinkStrategy) {
        match strategy {
            LinkStrategy::ContactId => self.linked_by_contact_id += 1,
            LinkStrategy::Email => self.linked_by_email += 1,
            LinkStrategy::Phone => self.linked_by_phone += 1,
            LinkStrategy::TagOverlap => self.linked_by_tags += 1,
            LinkStrategy::Address => self.linked_by_address += 1,
            LinkStrategy::Name => self.linked_by_name += 1,
            LinkStrategy::FuzzyName => self.linked_by_fuzzy_name += 1,
            LinkStrategy::Manual => self.linked_manually += 1,
        }
    }

    fn finalize(&mut self, total: usize) {
        self.total = total;
        self.linked = self.linked_by_contact_id
            + self.linked_by_email
            + self.linked_by_phone
            + self.linked_by_tags
            + self.linked_by_address
            + self.linked_by_name
            + self.linked_by_fuzzy_name
            + self.linked_manually;
        self.orphaned = total.saturating_sub(self.linked);
        self.link_rate = if total == 0 {
            0.0
        } else {
            (self.linked as f64 / total as f64) * 100.0
        };
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeStats {
    pub total_accounts: usize,
    pub total_contacts: usize,
    pub matched_contacts: usize,
    pub unmatched_contacts: usize,
    pub match_rate: f64,
    pub new_contacts_from_leads: usize,
    pub estimates_missing_id: usize,
    pub estimate_linking: LinkingStats,
    pub jobsite_linking: LinkingStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedData {
    pub accounts: Vec<Account>,
    pub contacts: Vec<Contact>,
    pub estimates: Vec<Estimate>,
    pub jobsites: Vec<Jobsite>,
    pub orphaned_jobsites: Vec<String>,
    pub warnings: Vec<String>,
    pub stats: MergeStats,
}

// --- merge engine -------------------------------------------------------------

#[derive(Debug, Default)]
struct MergeIndex {
    contact_account: BTreeMap<String, String>,
    email_to_contact: BTreeMap<String, String>,
    phone_to_contact: BTreeMap<String, String>,
    tag_to_account: BTreeMap<String, String>,
    address_to_account: BTreeMap<String, String>,
    /// (normalized account name, account id), in id order.
    account_names: Vec<(String, String)>,
}

type CascadeStep<R> = (LinkStrategy, fn(&R, &MergeIndex) -> Option<String>);

/// Estimate link cascade, highest priority first. A matching strategy wins
/// outright; nothing below it is consulted.
const ESTIMATE_CASCADE: &[CascadeStep<EstimateRow>] = &[
    (LinkStrategy::ContactId, estimate_by_contact_id),
    (LinkStrategy::Email, estimate_by_email),
    (LinkStrategy::Phone, estimate_by_phone),
    (LinkStrategy::TagOverlap, estimate_by_tags),
    (LinkStrategy::Address, estimate_by_address),
    (LinkStrategy::FuzzyName, estimate_by_fuzzy_name),
];

const JOBSITE_CASCADE: &[CascadeStep<JobsiteRow>] = &[
    (LinkStrategy::ContactId, jobsite_by_contact_id),
    (LinkStrategy::Address, jobsite_by_address),
    (LinkStrategy::Name, jobsite_by_exact_name),
    (LinkStrategy::FuzzyName, jobsite_by_fuzzy_name),
];

fn resolve_cascade<R>(row: &R, index: &MergeIndex, cascade: &[CascadeStep<R>]) -> MatchOutcome {
    for (strategy, resolver) in cascade {
        if let Some(account_id) = resolver(row, index) {
            return MatchOutcome::MatchedBy {
                strategy: *strategy,
                account_id,
            };
        }
    }
    MatchOutcome::NoMatch
}

fn estimate_by_contact_id(row: &EstimateRow, index: &MergeIndex) -> Option<String> {
    let contact_id = row.contact_id.as_deref()?.trim();
    if contact_id.is_empty() {
        return None;
    }
    index.contact_account.get(contact_id).cloned()
}

fn estimate_by_email(row: &EstimateRow, index: &MergeIndex) -> Option<String> {
    let email = row.email.as_deref().and_then(normalize_email)?;
    let contact_id = index.email_to_contact.get(&email)?;
    index.contact_account.get(contact_id).cloned()
}

fn estimate_by_phone(row: &EstimateRow, index: &MergeIndex) -> Option<String> {
    let phone = row.phone.as_deref().and_then(normalize_phone)?;
    let contact_id = index.phone_to_contact.get(&phone)?;
    index.contact_account.get(contact_id).cloned()
}

fn estimate_by_tags(row: &EstimateRow, index: &MergeIndex) -> Option<String> {
    for tag in &row.tags {
        if let Some(tag) = normalize_tag(tag) {
            if let Some(account_id) = index.tag_to_account.get(&tag) {
                return Some(account_id.clone());
            }
        }
    }
    None
}

fn estimate_by_address(row: &EstimateRow, index: &MergeIndex) -> Option<String> {
    let key = row.address.normalized_key()?;
    index.address_to_account.get(&key).cloned()
}

fn estimate_by_fuzzy_name(row: &EstimateRow, index: &MergeIndex) -> Option<String> {
    if row.client_name.trim().is_empty() {
        return None;
    }
    index
        .account_names
        .iter()
        .find(|(name, _)| fuzzy_name_match(&row.client_name, name))
        .map(|(_, id)| id.clone())
}

fn jobsite_by_contact_id(row: &JobsiteRow, index: &MergeIndex) -> Option<String> {
    let contact_id = row.contact_id.as_deref()?.trim();
    if contact_id.is_empty() {
        return None;
    }
    index.contact_account.get(contact_id).cloned()
}

fn jobsite_by_address(row: &JobsiteRow, index: &MergeIndex) -> Option<String> {
    let key = row.address.normalized_key()?;
    index.address_to_account.get(&key).cloned()
}

fn jobsite_by_exact_name(row: &JobsiteRow, index: &MergeIndex) -> Option<String> {
    let name = normalize_text(&row.name);
    if name.is_empty() {
        return None;
    }
    index
        .account_names
        .iter()
        .find(|(candidate, _)| candidate == &name)
        .map(|(_, id)| id.clone())
}

fn jobsite_by_fuzzy_name(row: &JobsiteRow, index: &MergeIndex) -> Option<String> {
    if row.name.trim().is_empty() {
        return None;
    }
    index
        .account_names
        .iter()
        .find(|(name, _)| fuzzy_name_match(&row.name, name))
        .map(|(_, id)| id.clone())
}

fn attribute_company(company: &str, account_names: &[(String, String)]) -> Option<String> {
    if company.trim().is_empty() {
        return None;
    }
    account_names
        .iter()
        .find(|(name, _)| fuzzy_name_match(company, name))
        .map(|(_, id)| id.clone())
}

/// Merge the four parsed sheets into unified records.
///
/// Identity is always the external id from the source sheet; statistics are
/// accumulated in a value local to this call, so repeated merges over the
/// same input produce identical output.
pub fn merge_sheets(
    contacts: &[ContactRow],
    leads: &[LeadRow],
    estimates: &[EstimateRow],
    jobsites: &[JobsiteRow],
    overrides: &LinkOverrides,
) -> MergedData {
    let mut warnings = Vec::new();
    let mut stats = MergeStats::default();

    // Accounts: one per unique account id seen in the contacts export. Leads
    // never create accounts.
    let mut accounts: BTreeMap<String, Account> = BTreeMap::new();
    for row in contacts {
        let Some(account_id) = row.account_id.as_deref().map(str::trim) else {
            continue;
        };
        if account_id.is_empty() {
            continue;
        }
        let entry = accounts
            .entry(account_id.to_string())
            .or_insert_with(|| Account {
                external_id: account_id.to_string(),
                ..Default::default()
            });
        if entry.name.is_empty() {
            entry.name = row.account_name.clone();
        }
        if entry.account_type.is_empty() {
            entry.account_type = row.account_type.clone();
        }
        entry.tags.extend(row.tags.iter().cloned());
        entry.archived |= row.archived;
        if entry.address.is_empty() && !row.address.is_empty() {
            entry.address = row.address.clone();
        }
    }

    // Contacts from the export, identity = contact external id, first row wins.
    let mut contact_map: BTreeMap<String, Contact> = BTreeMap::new();
    let mut contact_order: Vec<String> = Vec::new();
    for row in contacts {
        let contact_id = row.contact_id.trim().to_string();
        if contact_id.is_empty() {
            continue;
        }
        if contact_map.contains_key(&contact_id) {
            warnings.push(format!(
                "duplicate contact id {contact_id} in contacts export; first row kept"
            ));
            continue;
        }
        contact_order.push(contact_id.clone());
        contact_map.insert(
            contact_id.clone(),
            Contact {
                external_id: Some(contact_id),
                name: row.name.clone(),
                email: row.email.as_deref().and_then(normalize_email),
                phone: row.phone.clone(),
                account_ref: row
                    .account_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string),
                ..Default::default()
            },
        );
    }

    let mut index = MergeIndex::default();
    for contact_id in &contact_order {
        let contact = &contact_map[contact_id];
        if let Some(account_id) = &contact.account_ref {
            index
                .contact_account
                .insert(contact_id.clone(), account_id.clone());
        }
        if let Some(email) = contact.email.as_deref().and_then(normalize_email) {
            index
                .email_to_contact
                .entry(email)
                .or_insert_with(|| contact_id.clone());
        }
        if let Some(phone) = contact.phone.as_deref().and_then(normalize_phone) {
            index
                .phone_to_contact
                .entry(phone)
                .or_insert_with(|| contact_id.clone());
        }
    }
    for (account_id, account) in &accounts {
        for tag in &account.tags {
            if let Some(tag) = normalize_tag(tag) {
                index
                    .tag_to_account
                    .entry(tag)
                    .or_insert_with(|| account_id.clone());
            }
        }
        if let Some(key) = account.address.normalized_key() {
            index
                .address_to_account
                .entry(key)
                .or_insert_with(|| account_id.clone());
        }
        index
            .account_names
            .push((normalize_text(&account.name), account_id.clone()));
    }

    // Leads enrich contacts: contact id, then email, then phone, first match
    // wins. No match synthesizes a flagged contact attributed by company name.
    let mut lead_contacts: Vec<Contact> = Vec::new();
    for lead in leads {
        let by_id = lead
            .contact_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty() && contact_map.contains_key(*id))
            .map(str::to_string);
        let target = by_id
            .or_else(|| {
                lead.email
                    .as_deref()
                    .and_then(normalize_email)
                    .and_then(|email| index.email_to_contact.get(&email).cloned())
            })
            .or_else(|| {
                lead.phone
                    .as_deref()
                    .and_then(normalize_phone)
                    .and_then(|phone| index.phone_to_contact.get(&phone).cloned())
            });

        match target.and_then(|id| contact_map.get_mut(&id)) {
            Some(contact) => {
                contact.do_not_email |= lead.do_not_email;
                contact.do_not_mail |= lead.do_not_mail;
                contact.do_not_call |= lead.do_not_call;
                if contact.email.is_none() {
                    contact.email = lead.email.as_deref().and_then(normalize_email);
                }
                if contact.phone.is_none() {
                    contact.phone = lead.phone.clone();
                }
                if contact.name.is_empty() {
                    contact.name = lead.name.clone();
                }
                stats.matched_contacts += 1;
            }
            None => {
                stats.unmatched_contacts += 1;
                stats.new_contacts_from_leads += 1;
                lead_contacts.push(Contact {
                    external_id: lead
                        .contact_id
                        .as_deref()
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string),
                    name: lead.name.clone(),
                    email: lead.email.as_deref().and_then(normalize_email),
                    phone: lead.phone.clone(),
                    account_ref: attribute_company(&lead.company, &index.account_names),
                    do_not_email: lead.do_not_email,
                    do_not_mail: lead.do_not_mail,
                    do_not_call: lead.do_not_call,
                    new_from_leads: true,
                });
            }
        }
    }
    stats.match_rate = if leads.is_empty() {
        0.0
    } else {
        (stats.matched_contacts as f64 / leads.len() as f64) * 100.0
    };

    // Estimates: identity required; link failure never drops a record.
    let mut estimate_out: Vec<Estimate> = Vec::new();
    let mut seen_estimates: BTreeSet<String> = BTreeSet::new();
    for row in estimates {
        let estimate_id = row.estimate_id.trim().to_string();
        if estimate_id.is_empty() {
            stats.estimates_missing_id += 1;
            warnings.push(format!(
                "estimates list row for \"{}\" has no estimate id and was dropped",
                row.client_name
            ));
            continue;
        }
        if !seen_estimates.insert(estimate_id.clone()) {
            warnings.push(format!(
                "duplicate estimate id {estimate_id}; first row kept"
            ));
            continue;
        }

        let mut estimate = Estimate {
            external_id: estimate_id,
            client_name: row.client_name.clone(),
            status: row.status.clone(),
            estimate_date: row.estimate_date,
            contract_start: row.contract_start,
            contract_end: row.contract_end,
            total: row.total,
            email: row.email.as_deref().and_then(normalize_email),
            phone: row.phone.clone(),
            tags: row.tags.clone(),
            address: row.address.clone(),
            contact_ref: row
                .contact_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            account_ref: None,
            linked_by: None,
        };
        if let MatchOutcome::MatchedBy {
            strategy,
            account_id,
        } = resolve_cascade(row, &index, ESTIMATE_CASCADE)
        {
            stats.estimate_linking.bump(strategy);
            estimate.account_ref = Some(account_id);
            estimate.linked_by = Some(strategy);
        }
        estimate_out.push(estimate);
    }
    stats.estimate_linking.finalize(estimate_out.len());

    // Jobsites: automatic cascade, then the operator override pass.
    let mut jobsite_out: Vec<Jobsite> = Vec::new();
    let mut orphaned_jobsites: Vec<String> = Vec::new();
    let mut seen_jobsites: BTreeSet<String> = BTreeSet::new();
    for row in jobsites {
        let jobsite_id = row.jobsite_id.trim().to_string();
        if jobsite_id.is_empty() {
            continue;
        }
        if !seen_jobsites.insert(jobsite_id.clone()) {
            warnings.push(format!("duplicate jobsite id {jobsite_id}; first row kept"));
            continue;
        }

        let mut site = Jobsite {
            external_id: jobsite_id.clone(),
            name: row.name.clone(),
            address: row.address.clone(),
            contact_ref: row
                .contact_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            account_ref: None,
            linked_by: None,
            manually_linked: false,
        };
        if let MatchOutcome::MatchedBy {
            strategy,
            account_id,
        } = resolve_cascade(row, &index, JOBSITE_CASCADE)
        {
            site.account_ref = Some(account_id);
            site.linked_by = Some(strategy);
        }
        if let Some(forced) = overrides.get(&jobsite_id) {
            site.manually_linked = true;
            match forced {
                Some(account_id) => {
                    site.account_ref = Some(account_id.clone());
                    site.linked_by = Some(LinkStrategy::Manual);
                }
                None => {
                    site.account_ref = None;
                    site.linked_by = None;
                }
            }
        }
        if let Some(strategy) = site.linked_by {
            stats.jobsite_linking.bump(strategy);
        }
        if site.account_ref.is_none() {
            orphaned_jobsites.push(site.external_id.clone());
        }
        jobsite_out.push(site);
    }
    stats.jobsite_linking.finalize(jobsite_out.len());

    stats.total_accounts = accounts.len();
    let mut contact_out: Vec<Contact> = contact_order
        .iter()
        .filter_map(|id| contact_map.get(id).cloned())
        .collect();
    contact_out.extend(lead_contacts);
    stats.total_contacts = contact_out.len();

    MergedData {
        accounts: accounts.into_values().collect(),
        contacts: contact_out,
        estimates: estimate_out,
        jobsites: jobsite_out,
        orphaned_jobsites,
        warnings,
        stats,
    }
}

// --- existing-data comparator -------------------------------------------------

/// Advisory guess at where an orphaned stored record came from. Deletion is
/// always an explicit operator decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanSource {
    PreviousImport,
    PossiblyMock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub existing: Value,
    pub imported: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedRecord {
    pub external_id: String,
    pub differences: Vec<FieldDiff>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanedRecord {
    pub external_id: String,
    pub source_guess: OrphanSource,
    pub record: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityComparison {
    pub new: Vec<Value>,
    pub updated: Vec<UpdatedRecord>,
    pub orphaned: Vec<OrphanedRecord>,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub accounts: EntityComparison,
    pub contacts: EntityComparison,
    pub estimates: EntityComparison,
    pub jobsites: EntityComparison,
}

/// Fields derived during the merge; they never exist in stored records and are
/// excluded from field-level diffs.
const DIFF_SKIP_FIELDS: &[&str] = &["linked_by", "manually_linked", "new_from_leads"];

pub fn compare_with_existing(
    merged: &MergedData,
    existing_accounts: &[Value],
    existing_contacts: &[Value],
    existing_estimates: &[Value],
    existing_jobsites: &[Value],
    valid_ids: &ValidIds,
) -> ComparisonResult {
    ComparisonResult {
        accounts: compare_entity(
            to_values(&merged.accounts),
            existing_accounts,
            &valid_ids.account_ids,
        ),
        contacts: compare_entity(
            to_values(&merged.contacts),
            existing_contacts,
            &valid_ids.contact_ids,
        ),
        estimates: compare_entity(
            to_values(&merged.estimates),
            existing_estimates,
            &valid_ids.estimate_ids,
        ),
        jobsites: compare_entity(
            to_values(&merged.jobsites),
            existing_jobsites,
            &valid_ids.jobsite_ids,
        ),
    }
}

fn to_values<T: Serialize>(items: &[T]) -> Vec<Value> {
    items
        .iter()
        .filter_map(|item| serde_json::to_value(item).ok())
        .collect()
}

fn record_id(record: &Value) -> Option<String> {
    record
        .get("external_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn compare_entity(
    imported: Vec<Value>,
    existing: &[Value],
    valid: &BTreeSet<String>,
) -> EntityComparison {
    let existing_by_id: BTreeMap<String, &Value> = existing
        .iter()
        .filter_map(|record| record_id(record).map(|id| (id, record)))
        .collect();

    let mut comparison = EntityComparison::default();
    for record in imported {
        let Some(id) = record_id(&record) else {
            // Synthesized contacts have no stored counterpart yet.
            comparison.new.push(record);
            continue;
        };
        match existing_by_id.get(&id) {
            None => comparison.new.push(record),
            Some(existing_record) => {
                let differences = diff_fields(existing_record, &record);
                if differences.is_empty() {
                    comparison.unchanged += 1;
                } else {
                    comparison.updated.push(UpdatedRecord {
                        external_id: id,
                        differences,
                    });
                }
            }
        }
    }

    for record in existing {
        let Some(id) = record_id(record) else {
            continue;
        };
        if !valid.contains(&id) {
            comparison.orphaned.push(OrphanedRecord {
                source_guess: guess_orphan_source(&id),
                external_id: id,
                record: record.clone(),
            });
        }
    }

    comparison
}

fn diff_fields(existing: &Value, imported: &Value) -> Vec<FieldDiff> {
    let Some(fields) = imported.as_object() else {
        return Vec::new();
    };
    let mut differences = Vec::new();
    for (field, imported_value) in fields {
        if field == "external_id" || DIFF_SKIP_FIELDS.contains(&field.as_str()) {
            continue;
        }
        let existing_value = existing.get(field).cloned().unwrap_or(Value::Null);
        if !values_equal(&existing_value, imported_value) {
            differences.push(FieldDiff {
                field: field.clone(),
                existing: existing_value,
                imported: imported_value.clone(),
            });
        }
    }
    differences
}

/// Literal comparison with only trivial normalization: whitespace trimming,
/// number formatting, and null/empty-string equivalence.
fn values_equal(existing: &Value, imported: &Value) -> bool {
    if existing == imported {
        return true;
    }
    if let (Some(a), Some(b)) = (canonical_number(existing), canonical_number(imported)) {
        return a == b;
    }
    canonical_text(existing) == canonical_text(imported)
}

fn canonical_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse().ok()
            }
        }
        _ => None,
    }
}

fn canonical_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn guess_orphan_source(id: &str) -> OrphanSource {
    let lower = id.to_ascii_lowercase();
    let placeholder = ["mock", "test", "demo", "sample"]
        .iter()
        .any(|prefix| lower.starts_with(prefix));
    if placeholder || !id.chars().any(|c| c.is_ascii_digit()) {
        OrphanSource::PossiblyMock
    } else {
        OrphanSource::PreviousImport
    }
}

// --- reference validator ------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceIssue {
    pub record_type: String,
    pub record_id: String,
    pub field: String,
    pub value: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceReport {
    pub errors: Vec<ReferenceIssue>,
    pub warnings: Vec<ReferenceIssue>,
}

impl ReferenceReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// Confirm every estimate/jobsite account and contact reference resolves
/// within the valid-id sets. A dangling but well-formed id is a warning (the
/// record still imports with the reference nulled downstream); a malformed id
/// is an error.
pub fn validate_references(merged: &MergedData, valid_ids: &ValidIds) -> ReferenceReport {
    let mut report = ReferenceReport::default();
    for estimate in &merged.estimates {
        check_reference(
            &mut report,
            "estimate",
            &estimate.external_id,
            "account_id",
            estimate.account_ref.as_deref(),
            &valid_ids.account_ids,
        );
        check_reference(
            &mut report,
            "estimate",
            &estimate.external_id,
            "contact_id",
            estimate.contact_ref.as_deref(),
            &valid_ids.contact_ids,
        );
    }
    for jobsite in &merged.jobsites {
        check_reference(
            &mut report,
            "jobsite",
            &jobsite.external_id,
            "account_id",
            jobsite.account_ref.as_deref(),
            &valid_ids.account_ids,
        );
        check_reference(
            &mut report,
            "jobsite",
            &jobsite.external_id,
            "contact_id",
            jobsite.contact_ref.as_deref(),
            &valid_ids.contact_ids,
        );
    }
    report
}

fn check_reference(
    report: &mut ReferenceReport,
    record_type: &str,
    record_id: &str,
    field: &str,
    value: Option<&str>,
    valid: &BTreeSet<String>,
) {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return;
    };
    if valid.contains(value) {
        return;
    }
    if is_well_formed_external_id(value) {
        report.warnings.push(ReferenceIssue {
            record_type: record_type.to_string(),
            record_id: record_id.to_string(),
            field: field.to_string(),
            value: value.to_string(),
            message: format!(
                "{field} {value} does not resolve to a record in the current sheets; the reference will be cleared"
            ),
        });
    } else {
        report.errors.push(ReferenceIssue {
            record_type: record_type.to_string(),
            record_id: record_id.to_string(),
            field: field.to_string(),
            value: value.to_string(),
            message: format!("{field} {value} is not a recognizable source-system id"),
        });
    }
}

// --- pipeline, reports and snapshots ------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub out_root: PathBuf,
    pub vault_dir: PathBuf,
    pub batch_size: usize,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            out_root: std::env::var("CIR_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            vault_dir: std::env::var("CIR_VAULT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./vault")),
            batch_size: std::env::var("CIR_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(cir_backend::DEFAULT_BATCH_SIZE),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SheetPaths {
    pub contacts: PathBuf,
    pub leads: PathBuf,
    pub estimates: PathBuf,
    pub jobsites: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeRunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub parse: BTreeMap<String, ParseStats>,
    pub merged: MergedData,
    pub valid_ids: ValidIds,
    pub reference_report: ReferenceReport,
    pub reports_dir: String,
    pub snapshot_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct ImportPipeline {
    config: PipelineConfig,
    vault: SheetVault,
}

impl ImportPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let vault = SheetVault::new(config.vault_dir.clone());
        Self { config, vault }
    }

    /// Parse all four sheets, merge, validate references, and write the run
    /// report + snapshots. A layout-level parse failure on any sheet blocks
    /// the whole merge.
    pub async fn merge_once(
        &self,
        paths: &SheetPaths,
        sheet_config: &SheetConfig,
        overrides: &LinkOverrides,
    ) -> Result<MergeRunReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let contacts_sheet = self.load(&paths.contacts, SheetKind::Contacts).await?;
        let leads_sheet = self.load(&paths.leads, SheetKind::Leads).await?;
        let estimates_sheet = self.load(&paths.estimates, SheetKind::Estimates).await?;
        let jobsites_sheet = self.load(&paths.jobsites, SheetKind::Jobsites).await?;

        let contacts = parse_contacts(&contacts_sheet, sheet_config.map_for(SheetKind::Contacts));
        let leads = parse_leads(&leads_sheet, sheet_config.map_for(SheetKind::Leads));
        let estimates =
            parse_estimates(&estimates_sheet, sheet_config.map_for(SheetKind::Estimates));
        let jobsites = parse_jobsites(&jobsites_sheet, sheet_config.map_for(SheetKind::Jobsites));

        for (kind, error) in [
            (SheetKind::Contacts, &contacts.stats.error),
            (SheetKind::Leads, &leads.stats.error),
            (SheetKind::Estimates, &estimates.stats.error),
            (SheetKind::Jobsites, &jobsites.stats.error),
        ] {
            if let Some(error) = error {
                bail!("{} sheet blocked the merge: {error}", kind.as_str());
            }
        }

        let valid_ids = extract_valid_ids(
            &contacts.records,
            &leads.records,
            &estimates.records,
            &jobsites.records,
        );
        let merged = merge_sheets(
            &contacts.records,
            &leads.records,
            &estimates.records,
            &jobsites.records,
            overrides,
        );
        let reference_report = validate_references(&merged, &valid_ids);

        let finished_at = Utc::now();
        let reports_dir = self
            .write_reports(run_id, started_at, finished_at, &merged, &reference_report)
            .await?;
        let manifest_path = export_snapshots(&reports_dir, &merged).await?;

        info!(
            %run_id,
            accounts = merged.stats.total_accounts,
            contacts = merged.stats.total_contacts,
            estimates = merged.estimates.len(),
            jobsites = merged.jobsites.len(),
            "merge complete"
        );

        let mut parse = BTreeMap::new();
        parse.insert(SheetKind::Contacts.as_str().to_string(), contacts.stats);
        parse.insert(SheetKind::Leads.as_str().to_string(), leads.stats);
        parse.insert(SheetKind::Estimates.as_str().to_string(), estimates.stats);
        parse.insert(SheetKind::Jobsites.as_str().to_string(), jobsites.stats);

        Ok(MergeRunReport {
            run_id,
            started_at,
            finished_at,
            parse,
            merged,
            valid_ids,
            reference_report,
            reports_dir: reports_dir.display().to_string(),
            snapshot_manifest: manifest_path.display().to_string(),
        })
    }

    pub async fn compare(
        &self,
        api: &dyn BackendApi,
        merged: &MergedData,
        valid_ids: &ValidIds,
    ) -> Result<ComparisonResult> {
        let existing_accounts = api.fetch_existing(Entity::Accounts).await?;
        let existing_contacts = api.fetch_existing(Entity::Contacts).await?;
        let existing_estimates = api.fetch_existing(Entity::Estimates).await?;
        let existing_jobsites = api.fetch_existing(Entity::Jobsites).await?;
        Ok(compare_with_existing(
            merged,
            &existing_accounts,
            &existing_contacts,
            &existing_estimates,
            &existing_jobsites,
            valid_ids,
        ))
    }

    /// Per-entity upload payloads. Estimates and jobsites are filtered to ids
    /// present in the current sheets before upload.
    pub fn upload_batches(merged: &MergedData, valid_ids: &ValidIds) -> Vec<(Entity, Vec<Value>)> {
        let estimates: Vec<Value> = merged
            .estimates
            .iter()
            .filter(|e| valid_ids.estimate_ids.contains(&e.external_id))
            .filter_map(|e| serde_json::to_value(e).ok())
            .collect();
        let jobsites: Vec<Value> = merged
            .jobsites
            .iter()
            .filter(|j| valid_ids.jobsite_ids.contains(&j.external_id))
            .filter_map(|j| serde_json::to_value(j).ok())
            .collect();
        vec![
            (Entity::Accounts, to_values(&merged.accounts)),
            (Entity::Contacts, to_values(&merged.contacts)),
            (Entity::Estimates, estimates),
            (Entity::Jobsites, jobsites),
        ]
    }

    pub async fn commit(
        &self,
        api: &dyn BackendApi,
        merged: &MergedData,
        valid_ids: &ValidIds,
    ) -> ImportOutcome {
        let batches = Self::upload_batches(merged, valid_ids);
        push_import(api, &batches, self.config.batch_size).await
    }

    async fn load(&self, path: &Path, kind: SheetKind) -> Result<RawSheet> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("csv");
        self.vault
            .store(kind.as_str(), Utc::now(), extension, &bytes)
            .await
            .with_context(|| format!("archiving {}", path.display()))?;
        RawSheet::from_bytes(&bytes).with_context(|| format!("decoding {}", path.display()))
    }

    async fn write_reports(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        merged: &MergedData,
        reference_report: &ReferenceReport,
    ) -> Result<PathBuf> {
        let reports_dir = self.config.out_root.join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let summary = render_summary(run_id, started_at, finished_at, merged, reference_report);
        fs::write(reports_dir.join("import_summary.md"), summary)
            .await
            .context("writing import_summary.md")?;

        let payload = serde_json::json!({
            "run_id": run_id,
            "started_at": started_at,
            "finished_at": finished_at,
            "merged": merged,
            "reference_report": reference_report,
        });
        let bytes = serde_json::to_vec_pretty(&payload).context("serializing merge result")?;
        fs::write(reports_dir.join("merge_result.json"), bytes)
            .await
            .context("writing merge_result.json")?;

        Ok(reports_dir)
    }
}

fn strategy_label(strategy: LinkStrategy) -> &'static str {
    match strategy {
        LinkStrategy::ContactId => "contact_id",
        LinkStrategy::Email => "email",
        LinkStrategy::Phone => "phone",
        LinkStrategy::TagOverlap => "tag_overlap",
        LinkStrategy::Address => "address",
        LinkStrategy::Name => "name",
        LinkStrategy::FuzzyName => "fuzzy_name",
        LinkStrategy::Manual => "manual",
    }
}

fn render_summary(
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    merged: &MergedData,
    reference_report: &ReferenceReport,
) -> String {
    let stats = &merged.stats;
    let mut lines = vec![
        "# Import Merge Summary".to_string(),
        String::new(),
        format!("- Run ID: `{run_id}`"),
        format!("- Started: {started_at}"),
        format!("- Finished: {finished_at}"),
        format!("- Accounts: {}", stats.total_accounts),
        format!(
            "- Contacts: {} ({} enriched from leads, {} new from leads)",
            stats.total_contacts, stats.matched_contacts, stats.new_contacts_from_leads
        ),
        format!(
            "- Estimates: {} ({} linked, {} orphaned, {:.1}% link rate)",
            stats.estimate_linking.total,
            stats.estimate_linking.linked,
            stats.estimate_linking.orphaned,
            stats.estimate_linking.link_rate
        ),
        format!(
            "- Jobsites: {} ({} linked, {} orphaned, {:.1}% link rate)",
            stats.jobsite_linking.total,
            stats.jobsite_linking.linked,
            stats.jobsite_linking.orphaned,
            stats.jobsite_linking.link_rate
        ),
        String::new(),
        "## Estimate Linking".to_string(),
        format!("- contact id: {}", stats.estimate_linking.linked_by_contact_id),
        format!("- email: {}", stats.estimate_linking.linked_by_email),
        format!("- phone: {}", stats.estimate_linking.linked_by_phone),
        format!("- tag overlap: {}", stats.estimate_linking.linked_by_tags),
        format!("- address: {}", stats.estimate_linking.linked_by_address),
        format!("- fuzzy name: {}", stats.estimate_linking.linked_by_fuzzy_name),
        String::new(),
        "## Jobsite Linking".to_string(),
        format!("- contact id: {}", stats.jobsite_linking.linked_by_contact_id),
        format!("- address: {}", stats.jobsite_linking.linked_by_address),
        format!("- name: {}", stats.jobsite_linking.linked_by_name),
        format!("- fuzzy name: {}", stats.jobsite_linking.linked_by_fuzzy_name),
        format!("- manual: {}", stats.jobsite_linking.linked_manually),
    ];

    if !reference_report.is_clean() {
        lines.push(String::new());
        lines.push("## Reference Issues".to_string());
        for issue in &reference_report.errors {
            lines.push(format!(
                "- ERROR {} {}: {}",
                issue.record_type, issue.record_id, issue.message
            ));
        }
        for issue in &reference_report.warnings {
            lines.push(format!(
                "- WARN {} {}: {}",
                issue.record_type, issue.record_id, issue.message
            ));
        }
    }

    if !merged.warnings.is_empty() {
        lines.push(String::new());
        lines.push("## Merge Warnings".to_string());
        for warning in &merged.warnings {
            lines.push(format!("- {warning}"));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

async fn export_snapshots(reports_dir: &Path, merged: &MergedData) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let accounts_path = snapshot_dir.join("accounts.parquet");
    let contacts_path = snapshot_dir.join("contacts.parquet");
    let estimates_path = snapshot_dir.join("estimates.parquet");
    let jobsites_path = snapshot_dir.join("jobsites.parquet");

    write_accounts_parquet(&accounts_path, &merged.accounts)?;
    write_contacts_parquet(&contacts_path, &merged.contacts)?;
    write_estimates_parquet(&estimates_path, &merged.estimates)?;
    write_jobsites_parquet(&jobsites_path, &merged.jobsites)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("accounts", reports_dir, &accounts_path)?,
            manifest_entry("contacts", reports_dir, &contacts_path)?,
            manifest_entry("estimates", reports_dir, &estimates_path)?,
            manifest_entry("jobsites", reports_dir, &jobsites_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_accounts_parquet(path: &Path, accounts: &[Account]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("external_id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, true),
        ArrowField::new("account_type", DataType::Utf8, true),
        ArrowField::new("archived", DataType::Boolean, false),
        ArrowField::new("tags", DataType::Utf8, true),
        ArrowField::new("city", DataType::Utf8, true),
    ]));

    let external_ids = StringArray::from(
        accounts
            .iter()
            .map(|a| Some(a.external_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let names = StringArray::from(
        accounts
            .iter()
            .map(|a| Some(a.name.as_str()))
            .collect::<Vec<_>>(),
    );
    let types = StringArray::from(
        accounts
            .iter()
            .map(|a| Some(a.account_type.as_str()))
            .collect::<Vec<_>>(),
    );
    let archived = BooleanArray::from(accounts.iter().map(|a| a.archived).collect::<Vec<_>>());
    let tags = StringArray::from(
        accounts
            .iter()
            .map(|a| Some(a.tags.iter().cloned().collect::<Vec<_>>().join(", ")))
            .collect::<Vec<_>>(),
    );
    let cities = StringArray::from(
        accounts
            .iter()
            .map(|a| Some(a.address.city.as_str()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(external_ids),
            Arc::new(names),
            Arc::new(types),
            Arc::new(archived),
            Arc::new(tags),
            Arc::new(cities),
        ],
    )
    .context("building accounts record batch")?;
    write_parquet(path, batch)
}

fn write_contacts_parquet(path: &Path, contacts: &[Contact]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("external_id", DataType::Utf8, true),
        ArrowField::new("name", DataType::Utf8, true),
        ArrowField::new("email", DataType::Utf8, true),
        ArrowField::new("account_ref", DataType::Utf8, true),
        ArrowField::new("new_from_leads", DataType::Boolean, false),
        ArrowField::new("do_not_email", DataType::Boolean, false),
    ]));

    let external_ids = StringArray::from(
        contacts
            .iter()
            .map(|c| c.external_id.as_deref())
            .collect::<Vec<_>>(),
    );
    let names = StringArray::from(
        contacts
            .iter()
            .map(|c| Some(c.name.as_str()))
            .collect::<Vec<_>>(),
    );
    let emails = StringArray::from(contacts.iter().map(|c| c.email.as_deref()).collect::<Vec<_>>());
    let account_refs = StringArray::from(
        contacts
            .iter()
            .map(|c| c.account_ref.as_deref())
            .collect::<Vec<_>>(),
    );
    let new_from_leads =
        BooleanArray::from(contacts.iter().map(|c| c.new_from_leads).collect::<Vec<_>>());
    let do_not_email =
        BooleanArray::from(contacts.iter().map(|c| c.do_not_email).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(external_ids),
            Arc::new(names),
            Arc::new(emails),
            Arc::new(account_refs),
            Arc::new(new_from_leads),
            Arc::new(do_not_email),
        ],
    )
    .context("building contacts record batch")?;
    write_parquet(path, batch)
}

fn write_estimates_parquet(path: &Path, estimates: &[Estimate]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("external_id", DataType::Utf8, false),
        ArrowField::new("client_name", DataType::Utf8, true),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("total", DataType::Float64, true),
        ArrowField::new("account_ref", DataType::Utf8, true),
        ArrowField::new("linked_by", DataType::Utf8, true),
    ]));

    let external_ids = StringArray::from(
        estimates
            .iter()
            .map(|e| Some(e.external_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let client_names = StringArray::from(
        estimates
            .iter()
            .map(|e| Some(e.client_name.as_str()))
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        estimates
            .iter()
            .map(|e| Some(e.status.as_str()))
            .collect::<Vec<_>>(),
    );
    let totals = Float64Array::from(estimates.iter().map(|e| e.total).collect::<Vec<_>>());
    let account_refs = StringArray::from(
        estimates
            .iter()
            .map(|e| e.account_ref.as_deref())
            .collect::<Vec<_>>(),
    );
    let linked_by = StringArray::from(
        estimates
            .iter()
            .map(|e| e.linked_by.map(strategy_label))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(external_ids),
            Arc::new(client_names),
            Arc::new(statuses),
            Arc::new(totals),
            Arc::new(account_refs),
            Arc::new(linked_by),
        ],
    )
    .context("building estimates record batch")?;
    write_parquet(path, batch)
}

fn write_jobsites_parquet(path: &Path, jobsites: &[Jobsite]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("external_id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, true),
        ArrowField::new("account_ref", DataType::Utf8, true),
        ArrowField::new("linked_by", DataType::Utf8, true),
        ArrowField::new("manually_linked", DataType::Boolean, false),
    ]));

    let external_ids = StringArray::from(
        jobsites
            .iter()
            .map(|j| Some(j.external_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let names = StringArray::from(
        jobsites
            .iter()
            .map(|j| Some(j.name.as_str()))
            .collect::<Vec<_>>(),
    );
    let account_refs = StringArray::from(
        jobsites
            .iter()
            .map(|j| j.account_ref.as_deref())
            .collect::<Vec<_>>(),
    );
    let linked_by = StringArray::from(
        jobsites
            .iter()
            .map(|j| j.linked_by.map(strategy_label))
            .collect::<Vec<_>>(),
    );
    let manually_linked =
        BooleanArray::from(jobsites.iter().map(|j| j.manually_linked).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(external_ids),
            Arc::new(names),
            Arc::new(account_refs),
            Arc::new(linked_by),
            Arc::new(manually_linked),
        ],
    )
    .context("building jobsites record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let relative = path
        .strip_prefix(base_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: relative,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cir_core::Address;

    fn contact_row(
        contact_id: &str,
        name: &str,
        email: Option<&str>,
        phone: Option<&str>,
        account_id: &str,
        account_name: &str,
    ) -> ContactRow {
        ContactRow {
            contact_id: contact_id.to_string(),
            name: name.to_string(),
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            account_id: Some(account_id.to_string()),
            account_name: account_name.to_string(),
            ..Default::default()
        }
    }

    fn estimate_row(id: &str, client: &str) -> EstimateRow {
        EstimateRow {
            estimate_id: id.to_string(),
            client_name: client.to_string(),
            ..Default::default()
        }
    }

    fn jobsite_row(id: &str, name: &str, line1: &str) -> JobsiteRow {
        JobsiteRow {
            jobsite_id: id.to_string(),
            name: name.to_string(),
            address: Address {
                line1: line1.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn base_contacts() -> Vec<ContactRow> {
        vec![
            contact_row(
                "C1",
                "Jane Doe",
                Some("jane@acme.com"),
                Some("555-867-5309"),
                "A1",
                "Acme Plumbing",
            ),
            contact_row(
                "C2",
                "Sam Roe",
                Some("sam@beta.com"),
                Some("555-222-3333"),
                "A2",
                "Beta Heating",
            ),
        ]
    }

    #[test]
    fn valid_account_ids_round_trip_with_merged_accounts() {
        let contacts = base_contacts();
        let ids = extract_valid_ids(&contacts, &[], &[], &[]);
        let merged = merge_sheets(&contacts, &[], &[], &[], &LinkOverrides::default());

        let merged_ids: BTreeSet<String> = merged
            .accounts
            .iter()
            .map(|a| a.external_id.clone())
            .collect();
        assert_eq!(merged_ids, ids.account_ids);
        assert_eq!(merged.accounts.len(), ids.account_ids.len());
    }

    #[test]
    fn estimate_with_id_appears_exactly_once_linked_or_not() {
        let contacts = base_contacts();
        let estimates = vec![
            EstimateRow {
                contact_id: Some("C1".to_string()),
                ..estimate_row("E1", "Acme Plumbing")
            },
            estimate_row("E2", "Totally Unknown Client"),
            estimate_row("", "No Id Client"),
        ];
        let merged = merge_sheets(&contacts, &[], &estimates, &[], &LinkOverrides::default());

        let e1_count = merged.estimates.iter().filter(|e| e.external_id == "E1").count();
        let e2_count = merged.estimates.iter().filter(|e| e.external_id == "E2").count();
        assert_eq!(e1_count, 1);
        assert_eq!(e2_count, 1);
        assert_eq!(merged.estimates.len(), 2);
        assert_eq!(merged.stats.estimates_missing_id, 1);
        assert!(merged.estimates.iter().any(|e| e.account_ref.is_none()));
        assert_eq!(merged.stats.estimate_linking.orphaned, 1);
    }

    #[test]
    fn cascade_priority_contact_id_beats_email() {
        let contacts = base_contacts();
        // Would match A1 via contact id and A2 via email; only the contact-id
        // counter may move.
        let estimates = vec![EstimateRow {
            contact_id: Some("C1".to_string()),
            email: Some("sam@beta.com".to_string()),
            ..estimate_row("E1", "")
        }];
        let merged = merge_sheets(&contacts, &[], &estimates, &[], &LinkOverrides::default());

        assert_eq!(merged.estimates[0].account_ref.as_deref(), Some("A1"));
        assert_eq!(merged.estimates[0].linked_by, Some(LinkStrategy::ContactId));
        assert_eq!(merged.stats.estimate_linking.linked_by_contact_id, 1);
        assert_eq!(merged.stats.estimate_linking.linked_by_email, 0);
    }

    #[test]
    fn estimate_falls_back_to_email_when_contact_id_unknown() {
        let contacts = base_contacts();
        let estimates = vec![EstimateRow {
            contact_id: Some("C9".to_string()),
            email: Some("sam@beta.com".to_string()),
            ..estimate_row("E1", "")
        }];
        let merged = merge_sheets(&contacts, &[], &estimates, &[], &LinkOverrides::default());

        assert_eq!(merged.estimates[0].account_ref.as_deref(), Some("A2"));
        assert_eq!(merged.estimates[0].linked_by, Some(LinkStrategy::Email));
        assert_eq!(merged.stats.estimate_linking.linked_by_email, 1);
        assert_eq!(merged.stats.estimate_linking.linked_by_contact_id, 0);
    }

    #[test]
    fn lead_with_matching_id_enriches_without_fallback() {
        let contacts = base_contacts();
        let leads = vec![LeadRow {
            contact_id: Some("C1".to_string()),
            name: "Jane Doe".to_string(),
            company: "Acme Plumbing".to_string(),
            email: Some("different@elsewhere.com".to_string()),
            phone: None,
            do_not_email: true,
            do_not_mail: false,
            do_not_call: false,
        }];
        let merged = merge_sheets(&contacts, &leads, &[], &[], &LinkOverrides::default());

        let jane = merged
            .contacts
            .iter()
            .find(|c| c.external_id.as_deref() == Some("C1"))
            .expect("C1 present");
        assert!(jane.do_not_email);
        // the export email survives; the lead only fills blanks
        assert_eq!(jane.email.as_deref(), Some("jane@acme.com"));
        assert_eq!(merged.stats.matched_contacts, 1);
        assert_eq!(merged.stats.new_contacts_from_leads, 0);
    }

    #[test]
    fn unmatched_lead_synthesizes_flagged_contact_with_company_attribution() {
        let contacts = base_contacts();
        let leads = vec![LeadRow {
            contact_id: None,
            name: "Pat Lee".to_string(),
            company: "Acme Plumbing LLC".to_string(),
            email: Some("pat@nowhere.com".to_string()),
            phone: None,
            do_not_email: false,
            do_not_mail: true,
            do_not_call: false,
        }];
        let merged = merge_sheets(&contacts, &leads, &[], &[], &LinkOverrides::default());

        assert_eq!(merged.stats.new_contacts_from_leads, 1);
        let pat = merged
            .contacts
            .iter()
            .find(|c| c.name == "Pat Lee")
            .expect("synthesized contact present");
        assert!(pat.new_from_leads);
        assert!(pat.external_id.is_none());
        assert_eq!(pat.account_ref.as_deref(), Some("A1"));
        assert!(pat.do_not_mail);
    }

    #[test]
    fn merge_is_idempotent_over_identical_input() {
        let contacts = base_contacts();
        let leads = vec![LeadRow {
            contact_id: None,
            name: "Pat Lee".to_string(),
            company: "Beta Heating".to_string(),
            email: None,
            phone: None,
            do_not_email: false,
            do_not_mail: false,
            do_not_call: true,
        }];
        let estimates = vec![
            EstimateRow {
                email: Some("jane@acme.com".to_string()),
                ..estimate_row("E1", "")
            },
            estimate_row("E2", "Beta Heating"),
        ];
        let jobsites = vec![jobsite_row("J1", "Acme Plumbing", "99 Elm St")];

        let first = merge_sheets(&contacts, &leads, &estimates, &jobsites, &LinkOverrides::default());
        let second = merge_sheets(&contacts, &leads, &estimates, &jobsites, &LinkOverrides::default());
        assert_eq!(first, second);
    }

    #[test]
    fn jobsite_links_by_address_then_name() {
        let mut contacts = base_contacts();
        contacts[0].address = Address {
            line1: "12 Oak St".to_string(),
            city: "Springfield".to_string(),
            state: "IL".to_string(),
            postal_code: "62704".to_string(),
            ..Default::default()
        };
        let jobsites = vec![
            JobsiteRow {
                jobsite_id: "J1".to_string(),
                name: "Warehouse".to_string(),
                address: Address {
                    line1: "12 Oak St.".to_string(),
                    city: "Springfield".to_string(),
                    state: "IL".to_string(),
                    postal_code: "62704".to_string(),
                    ..Default::default()
                },
                contact_id: None,
            },
            jobsite_row("J2", "Beta Heating", "1 Unknown Rd"),
        ];
        let merged = merge_sheets(&contacts, &[], &[], &jobsites, &LinkOverrides::default());

        assert_eq!(merged.jobsites[0].account_ref.as_deref(), Some("A1"));
        assert_eq!(merged.jobsites[0].linked_by, Some(LinkStrategy::Address));
        assert_eq!(merged.jobsites[1].account_ref.as_deref(), Some("A2"));
        assert_eq!(merged.jobsites[1].linked_by, Some(LinkStrategy::Name));
        assert_eq!(merged.stats.jobsite_linking.linked, 2);
    }

    #[test]
    fn orphan_jobsite_manual_link_keeps_counts_consistent() {
        let contacts = base_contacts();
        let jobsites = vec![jobsite_row("J1", "Mystery Site", "1 Nowhere Ln")];

        let merged = merge_sheets(&contacts, &[], &[], &jobsites, &LinkOverrides::default());
        assert_eq!(merged.orphaned_jobsites, vec!["J1".to_string()]);
        assert_eq!(merged.stats.jobsite_linking.orphaned, 1);

        let mut overrides = LinkOverrides::default();
        overrides.set("J1", Some("A1".to_string()));
        let relinked = merge_sheets(&contacts, &[], &[], &jobsites, &overrides);
        assert!(relinked.orphaned_jobsites.is_empty());
        assert_eq!(relinked.stats.jobsite_linking.linked_manually, 1);
        assert_eq!(
            relinked.stats.jobsite_linking.linked + relinked.stats.jobsite_linking.orphaned,
            relinked.stats.jobsite_linking.total
        );
        let site = &relinked.jobsites[0];
        assert!(site.manually_linked);
        assert_eq!(site.linked_by, Some(LinkStrategy::Manual));

        // explicit unlink beats an automatic match
        let mut unlink = LinkOverrides::default();
        unlink.set("J1", None);
        let auto_linked_sites = vec![jobsite_row("J1", "Acme Plumbing", "1 Nowhere Ln")];
        let unlinked = merge_sheets(&contacts, &[], &[], &auto_linked_sites, &unlink);
        assert_eq!(unlinked.jobsites[0].account_ref, None);
        assert!(unlinked.jobsites[0].manually_linked);
        assert_eq!(unlinked.stats.jobsite_linking.orphaned, 1);
    }

    #[test]
    fn comparator_partitions_new_updated_orphaned() {
        let contacts = base_contacts();
        let estimates = vec![estimate_row("E1", "Acme Plumbing")];
        let merged = merge_sheets(&contacts, &[], &estimates, &[], &LinkOverrides::default());
        let valid_ids = extract_valid_ids(&contacts, &[], &estimates, &[]);

        let existing_estimates = vec![
            serde_json::json!({ "external_id": "E1", "client_name": "Acme Plumbing" }),
            serde_json::json!({ "external_id": "E9", "client_name": "Gone Client" }),
            serde_json::json!({ "external_id": "mock-estimate", "client_name": "Seeded" }),
        ];
        let comparison = compare_with_existing(
            &merged,
            &[],
            &[],
            &existing_estimates,
            &[],
            &valid_ids,
        );

        let estimates_cmp = &comparison.estimates;
        let orphan_ids: Vec<&str> = estimates_cmp
            .orphaned
            .iter()
            .map(|o| o.external_id.as_str())
            .collect();
        assert!(orphan_ids.contains(&"E9"));
        assert!(orphan_ids.contains(&"mock-estimate"));
        assert!(!orphan_ids.contains(&"E1"));
        assert!(estimates_cmp.new.is_empty() || record_id(&estimates_cmp.new[0]).as_deref() != Some("E9"));

        let e9 = estimates_cmp
            .orphaned
            .iter()
            .find(|o| o.external_id == "E9")
            .expect("E9 orphan");
        assert_eq!(e9.source_guess, OrphanSource::PreviousImport);
        let mock = estimates_cmp
            .orphaned
            .iter()
            .find(|o| o.external_id == "mock-estimate")
            .expect("mock orphan");
        assert_eq!(mock.source_guess, OrphanSource::PossiblyMock);

        // E1 exists in both with differing status → updated, not new
        assert!(estimates_cmp
            .updated
            .iter()
            .any(|u| u.external_id == "E1"));
    }

    #[test]
    fn comparator_normalizes_number_formatting() {
        let contacts = base_contacts();
        let estimates = vec![EstimateRow {
            total: Some(1200.0),
            status: cir_core::EstimateStatus::Won,
            ..estimate_row("E1", "Acme")
        }];
        let merged = merge_sheets(&contacts, &[], &estimates, &[], &LinkOverrides::default());
        let valid_ids = extract_valid_ids(&contacts, &[], &estimates, &[]);

        let mut existing = serde_json::to_value(&merged.estimates[0]).unwrap();
        existing["total"] = Value::String("1200".to_string());
        let comparison =
            compare_with_existing(&merged, &[], &[], &[existing], &[], &valid_ids);

        assert!(comparison
            .estimates
            .updated
            .iter()
            .all(|u| u.differences.iter().all(|d| d.field != "total")));
    }

    #[test]
    fn validator_warns_on_dangling_and_errors_on_malformed() {
        let contacts = base_contacts();
        let estimates = vec![
            EstimateRow {
                contact_id: Some("C9".to_string()),
                ..estimate_row("E1", "")
            },
            EstimateRow {
                contact_id: Some("not a real id!".to_string()),
                ..estimate_row("E2", "")
            },
        ];
        let merged = merge_sheets(&contacts, &[], &estimates, &[], &LinkOverrides::default());
        let valid_ids = extract_valid_ids(&contacts, &[], &estimates, &[]);
        let report = validate_references(&merged, &valid_ids);

        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].value, "C9");
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].record_id, "E2");
    }

    #[test]
    fn upload_batches_filter_to_valid_ids() {
        let contacts = base_contacts();
        let estimates = vec![estimate_row("E1", "Acme Plumbing")];
        let merged = merge_sheets(&contacts, &[], &estimates, &[], &LinkOverrides::default());
        let mut valid_ids = extract_valid_ids(&contacts, &[], &estimates, &[]);
        // simulate a sheet re-upload that no longer contains E1
        valid_ids.estimate_ids.clear();

        let batches = ImportPipeline::upload_batches(&merged, &valid_ids);
        let estimates_batch = batches
            .iter()
            .find(|(entity, _)| *entity == Entity::Estimates)
            .map(|(_, records)| records)
            .expect("estimates batch");
        assert!(estimates_batch.is_empty());
    }
}
