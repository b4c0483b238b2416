//! Sheet loading and the four fixed-layout row parsers.
//!
//! Column names are an external contract owned by the upstream exporting
//! system, so the header-to-field mapping lives in configuration
//! ([`SheetConfig`], optionally overlaid from `sheets.yaml`) rather than in
//! hard-coded positions.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::Path;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::NaiveDate;
use cir_core::{
    normalize_email, normalize_tag, normalize_text, Address, ContactRow, EstimateRow,
    EstimateStatus, JobsiteRow, LeadRow,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cir-sheets";

const XLSX_MAGIC: &[u8] = b"PK\x03\x04";

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("reading sheet file: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoding delimited text: {0}")]
    Csv(#[from] csv::Error),
    #[error("decoding workbook: {0}")]
    Workbook(String),
    #[error("sheet has no header row")]
    MissingHeader,
}

/// One of the four fixed export layouts accepted by the import workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetKind {
    Contacts,
    Leads,
    Estimates,
    Jobsites,
}

impl SheetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SheetKind::Contacts => "contacts",
            SheetKind::Leads => "leads",
            SheetKind::Estimates => "estimates",
            SheetKind::Jobsites => "jobsites",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "contacts" => Some(SheetKind::Contacts),
            "leads" => Some(SheetKind::Leads),
            "estimates" => Some(SheetKind::Estimates),
            "jobsites" => Some(SheetKind::Jobsites),
            _ => None,
        }
    }
}

// --- raw sheet ----------------------------------------------------------------

/// Header-indexed tabular data, decoded from CSV/TSV or XLSX but not yet
/// interpreted. `unreadable_rows` counts records the decoder could not read at
/// all; parsers fold it into their skip counter.
#[derive(Debug, Clone, Default)]
pub struct RawSheet {
    pub headers: Vec<String>,
    index: HashMap<String, usize>,
    pub rows: Vec<Vec<String>>,
    pub unreadable_rows: usize,
}

impl RawSheet {
    /// Decode sheet bytes, auto-detecting XLSX (zip magic) vs delimited text.
    /// Text input sniffs a tab delimiter when the header line has tabs and no
    /// commas.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SheetError> {
        if bytes.starts_with(XLSX_MAGIC) {
            return Self::from_workbook_bytes(bytes);
        }
        let delimiter = sniff_delimiter(bytes);
        Self::from_delimited(bytes, delimiter)
    }

    pub fn from_delimited(bytes: &[u8], delimiter: u8) -> Result<Self, SheetError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(bytes);

        let headers = reader
            .headers()
            .map_err(|_| SheetError::MissingHeader)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(SheetError::MissingHeader);
        }

        let mut rows = Vec::new();
        let mut unreadable_rows = 0usize;
        for record in reader.records() {
            match record {
                Ok(record) => rows.push(record.iter().map(|c| c.to_string()).collect()),
                Err(_) => unreadable_rows += 1,
            }
        }

        Ok(Self::build(headers, rows, unreadable_rows))
    }

    pub fn from_workbook_bytes(bytes: &[u8]) -> Result<Self, SheetError> {
        let cursor = Cursor::new(bytes.to_vec());
        let mut workbook =
            open_workbook_auto_from_rs(cursor).map_err(|e| SheetError::Workbook(e.to_string()))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or(SheetError::MissingHeader)?
            .map_err(|e| SheetError::Workbook(e.to_string()))?;

        let mut iter = range.rows();
        let headers = iter
            .next()
            .ok_or(SheetError::MissingHeader)?
            .iter()
            .map(cell_to_string)
            .collect::<Vec<_>>();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(SheetError::MissingHeader);
        }
        let rows = iter
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect();

        Ok(Self::build(headers, rows, 0))
    }

    fn build(headers: Vec<String>, rows: Vec<Vec<String>>, unreadable_rows: usize) -> Self {
        let mut index = HashMap::new();
        for (i, header) in headers.iter().enumerate() {
            let key = normalize_text(header);
            if !key.is_empty() {
                index.entry(key).or_insert(i);
            }
        }
        Self {
            headers,
            index,
            rows,
            unreadable_rows,
        }
    }

    pub fn has_column(&self, header_alias: &str) -> bool {
        self.index.contains_key(&normalize_text(header_alias))
    }

    /// First non-empty cell among the aliases' columns, trimmed.
    pub fn cell<'a>(&self, row: &'a [String], aliases: &[String]) -> Option<&'a str> {
        for alias in aliases {
            if let Some(&col) = self.index.get(&normalize_text(alias)) {
                if let Some(value) = row.get(col) {
                    let trimmed = value.trim();
                    if !trimmed.is_empty() {
                        return Some(trimmed);
                    }
                }
            }
        }
        None
    }
}

/// Read a sheet file from disk. Extension is ignored; content decides the
/// decoder.
pub fn load_sheet(path: impl AsRef<Path>) -> Result<RawSheet, SheetError> {
    let bytes = std::fs::read(path.as_ref())?;
    RawSheet::from_bytes(&bytes)
}

fn sniff_delimiter(bytes: &[u8]) -> u8 {
    let first_line = bytes.split(|b| *b == b'\n').next().unwrap_or(b"");
    if first_line.contains(&b'\t') && !first_line.contains(&b',') {
        b'\t'
    } else {
        b','
    }
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                format!("{f}")
            }
        }
        Data::Int(i) => format!("{i}"),
        Data::Bool(b) => format!("{b}"),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.trim().to_string(),
        Data::Error(_) => String::new(),
    }
}

// --- column map configuration -------------------------------------------------

/// Logical field name -> acceptable header aliases for one sheet layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMap {
    #[serde(flatten)]
    fields: BTreeMap<String, Vec<String>>,
}

impl ColumnMap {
    pub fn aliases(&self, field: &str) -> &[String] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set(&mut self, field: &str, aliases: Vec<String>) {
        self.fields.insert(field.to_string(), aliases);
    }

    fn from_pairs(pairs: &[(&str, &[&str])]) -> Self {
        let fields = pairs
            .iter()
            .map(|(field, aliases)| {
                (
                    field.to_string(),
                    aliases.iter().map(|a| a.to_string()).collect(),
                )
            })
            .collect();
        Self { fields }
    }

    pub fn default_for(kind: SheetKind) -> Self {
        match kind {
            SheetKind::Contacts => Self::from_pairs(&[
                ("contact_id", &["Contact ID", "ID"]),
                ("name", &["Contact Name", "Name", "Full Name"]),
                ("email", &["Email", "Email Address"]),
                ("phone", &["Phone", "Phone Number", "Main Phone"]),
                ("account_id", &["Account ID", "Company ID"]),
                ("account_name", &["Account Name", "Company", "Company Name"]),
                ("account_type", &["Account Type", "Type"]),
                ("tags", &["Tags", "CRM Tags"]),
                ("archived", &["Archived", "Is Archived"]),
                (
                    "address_line1",
                    &["Street", "Address", "Address Line 1", "Billing Street"],
                ),
                ("address_line2", &["Street 2", "Address Line 2"]),
                ("city", &["City", "Billing City"]),
                ("state", &["State", "Province", "Billing State"]),
                ("postal_code", &["Zip", "Postal Code", "Billing Zip"]),
            ]),
            SheetKind::Leads => Self::from_pairs(&[
                ("contact_id", &["Contact ID", "ID"]),
                ("name", &["Name", "Lead Name", "Full Name"]),
                ("company", &["Company", "Company Name", "Organization"]),
                ("email", &["Email", "Email Address"]),
                ("phone", &["Phone", "Phone Number"]),
                ("do_not_email", &["Do Not Email", "Email Opt Out"]),
                ("do_not_mail", &["Do Not Mail", "Mail Opt Out"]),
                ("do_not_call", &["Do Not Call", "Call Opt Out"]),
            ]),
            SheetKind::Estimates => Self::from_pairs(&[
                ("estimate_id", &["Estimate ID", "ID", "Estimate #"]),
                ("client_name", &["Client", "Client Name", "Customer"]),
                ("status", &["Status", "Estimate Status"]),
                ("estimate_date", &["Estimate Date", "Date"]),
                ("contract_start", &["Contract Start", "Start Date"]),
                ("contract_end", &["Contract End", "End Date"]),
                ("total", &["Total", "Estimate Total", "Amount"]),
                ("email", &["Email", "Client Email"]),
                ("phone", &["Phone", "Client Phone"]),
                ("tags", &["Tags", "CRM Tags"]),
                ("contact_id", &["Contact ID"]),
                ("address_line1", &["Street", "Address", "Service Street"]),
                ("address_line2", &["Street 2", "Address Line 2"]),
                ("city", &["City", "Service City"]),
                ("state", &["State", "Service State"]),
                ("postal_code", &["Zip", "Postal Code", "Service Zip"]),
            ]),
            SheetKind::Jobsites => Self::from_pairs(&[
                ("jobsite_id", &["Jobsite ID", "ID", "Site ID"]),
                ("name", &["Jobsite Name", "Name", "Site Name"]),
                ("contact_id", &["Contact ID"]),
                ("address_line1", &["Street", "Address", "Address Line 1"]),
                ("address_line2", &["Street 2", "Address Line 2"]),
                ("city", &["City"]),
                ("state", &["State", "Province"]),
                ("postal_code", &["Zip", "Postal Code"]),
            ]),
        }
    }
}

/// Column maps for all four layouts. `from_yaml_*` overlays per-field entries
/// onto the built-in defaults, so a config file only lists what differs.
#[derive(Debug, Clone, Serialize)]
pub struct SheetConfig {
    pub contacts: ColumnMap,
    pub leads: ColumnMap,
    pub estimates: ColumnMap,
    pub jobsites: ColumnMap,
}

impl Default for SheetConfig {
    fn default() -> Self {
        Self {
            contacts: ColumnMap::default_for(SheetKind::Contacts),
            leads: ColumnMap::default_for(SheetKind::Leads),
            estimates: ColumnMap::default_for(SheetKind::Estimates),
            jobsites: ColumnMap::default_for(SheetKind::Jobsites),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum AliasSpec {
    One(String),
    Many(Vec<String>),
}

impl AliasSpec {
    fn into_vec(self) -> Vec<String> {
        match self {
            AliasSpec::One(s) => vec![s],
            AliasSpec::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SheetConfigFile {
    contacts: BTreeMap<String, AliasSpec>,
    leads: BTreeMap<String, AliasSpec>,
    estimates: BTreeMap<String, AliasSpec>,
    jobsites: BTreeMap<String, AliasSpec>,
}

impl SheetConfig {
    pub fn map_for(&self, kind: SheetKind) -> &ColumnMap {
        match kind {
            SheetKind::Contacts => &self.contacts,
            SheetKind::Leads => &self.leads,
            SheetKind::Estimates => &self.estimates,
            SheetKind::Jobsites => &self.jobsites,
        }
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let file: SheetConfigFile = serde_yaml::from_str(yaml)?;
        let mut config = Self::default();
        overlay(&mut config.contacts, file.contacts);
        overlay(&mut config.leads, file.leads);
        overlay(&mut config.estimates, file.estimates);
        overlay(&mut config.jobsites, file.jobsites);
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        Self::from_yaml_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
    }
}

fn overlay(map: &mut ColumnMap, overrides: BTreeMap<String, AliasSpec>) {
    for (field, spec) in overrides {
        map.set(&field, spec.into_vec());
    }
}

// --- parse contract -----------------------------------------------------------

/// Per-file parse summary. `error` is only set for layout-level failures
/// (header row missing expected columns); those block the merge. Individual
/// malformed rows are skipped and counted, never fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseStats {
    pub count: usize,
    pub skipped: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParseOutcome<T> {
    pub records: Vec<T>,
    pub stats: ParseStats,
}

impl<T> ParseOutcome<T> {
    fn layout_error(message: String) -> Self {
        Self {
            records: Vec::new(),
            stats: ParseStats {
                count: 0,
                skipped: 0,
                error: Some(message),
            },
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.stats.error.is_some()
    }
}

const REQUIRED_CONTACT_FIELDS: &[&str] = &["contact_id", "name", "email"];
const REQUIRED_LEAD_FIELDS: &[&str] = &["name", "company"];
const REQUIRED_ESTIMATE_FIELDS: &[&str] = &["estimate_id", "client_name", "status"];
const REQUIRED_JOBSITE_FIELDS: &[&str] = &["jobsite_id", "address_line1"];

/// Logical fields whose alias columns must all be present for the sheet to be
/// recognized as the expected layout.
fn missing_required(sheet: &RawSheet, map: &ColumnMap, required: &[&str]) -> Option<String> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|field| {
            !map.aliases(field)
                .iter()
                .any(|alias| sheet.has_column(alias))
        })
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(missing.join(", "))
    }
}

fn row_is_blank(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}

fn read_address(sheet: &RawSheet, row: &[String], map: &ColumnMap) -> Address {
    Address {
        line1: sheet.cell(row, map.aliases("address_line1")).unwrap_or("").to_string(),
        line2: sheet.cell(row, map.aliases("address_line2")).unwrap_or("").to_string(),
        city: sheet.cell(row, map.aliases("city")).unwrap_or("").to_string(),
        state: sheet.cell(row, map.aliases("state")).unwrap_or("").to_string(),
        postal_code: sheet.cell(row, map.aliases("postal_code")).unwrap_or("").to_string(),
    }
}

fn parse_bool_cell(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("true") | Some("yes") | Some("y") | Some("1") | Some("x") | Some("checked")
    )
}

fn parse_date_cell(value: Option<&str>) -> Option<NaiveDate> {
    let value = value?.trim();
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }
    None
}

fn parse_money_cell(value: Option<&str>) -> Option<f64> {
    let cleaned: String = value?
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse::<f64>().ok()
}

fn parse_tags_cell(value: Option<&str>) -> std::collections::BTreeSet<String> {
    value
        .unwrap_or("")
        .split([',', ';'])
        .filter_map(normalize_tag)
        .collect()
}

// --- parsers ------------------------------------------------------------------

pub fn parse_contacts(sheet: &RawSheet, map: &ColumnMap) -> ParseOutcome<ContactRow> {
    if let Some(missing) = missing_required(sheet, map, REQUIRED_CONTACT_FIELDS) {
        return ParseOutcome::layout_error(format!(
            "contacts export header is missing expected column(s): {missing}"
        ));
    }

    let mut records = Vec::new();
    let mut skipped = sheet.unreadable_rows;
    for row in &sheet.rows {
        if row_is_blank(row) {
            continue;
        }
        let Some(contact_id) = sheet.cell(row, map.aliases("contact_id")) else {
            skipped += 1;
            continue;
        };
        records.push(ContactRow {
            contact_id: contact_id.to_string(),
            name: sheet.cell(row, map.aliases("name")).unwrap_or("").to_string(),
            email: sheet
                .cell(row, map.aliases("email"))
                .and_then(normalize_email),
            phone: sheet.cell(row, map.aliases("phone")).map(str::to_string),
            account_id: sheet
                .cell(row, map.aliases("account_id"))
                .map(str::to_string),
            account_name: sheet
                .cell(row, map.aliases("account_name"))
                .unwrap_or("")
                .to_string(),
            account_type: sheet
                .cell(row, map.aliases("account_type"))
                .unwrap_or("")
                .to_string(),
            tags: parse_tags_cell(sheet.cell(row, map.aliases("tags"))),
            archived: parse_bool_cell(sheet.cell(row, map.aliases("archived"))),
            address: read_address(sheet, row, map),
        });
    }

    let count = records.len();
    ParseOutcome {
        records,
        stats: ParseStats {
            count,
            skipped,
            error: None,
        },
    }
}

pub fn parse_leads(sheet: &RawSheet, map: &ColumnMap) -> ParseOutcome<LeadRow> {
    if let Some(missing) = missing_required(sheet, map, REQUIRED_LEAD_FIELDS) {
        return ParseOutcome::layout_error(format!(
            "leads list header is missing expected column(s): {missing}"
        ));
    }

    let mut records = Vec::new();
    let mut skipped = sheet.unreadable_rows;
    for row in &sheet.rows {
        if row_is_blank(row) {
            continue;
        }
        let contact_id = sheet
            .cell(row, map.aliases("contact_id"))
            .map(str::to_string);
        let name = sheet.cell(row, map.aliases("name")).unwrap_or("");
        let email = sheet
            .cell(row, map.aliases("email"))
            .and_then(normalize_email);
        let phone = sheet.cell(row, map.aliases("phone")).map(str::to_string);
        if contact_id.is_none() && name.is_empty() && email.is_none() && phone.is_none() {
            skipped += 1;
            continue;
        }
        records.push(LeadRow {
            contact_id,
            name: name.to_string(),
            company: sheet
                .cell(row, map.aliases("company"))
                .unwrap_or("")
                .to_string(),
            email,
            phone,
            do_not_email: parse_bool_cell(sheet.cell(row, map.aliases("do_not_email"))),
            do_not_mail: parse_bool_cell(sheet.cell(row, map.aliases("do_not_mail"))),
            do_not_call: parse_bool_cell(sheet.cell(row, map.aliases("do_not_call"))),
        });
    }

    let count = records.len();
    ParseOutcome {
        records,
        stats: ParseStats {
            count,
            skipped,
            error: None,
        },
    }
}

pub fn parse_estimates(sheet: &RawSheet, map: &ColumnMap) -> ParseOutcome<EstimateRow> {
    if let Some(missing) = missing_required(sheet, map, REQUIRED_ESTIMATE_FIELDS) {
        return ParseOutcome::layout_error(format!(
            "estimates list header is missing expected column(s): {missing}"
        ));
    }

    let mut records = Vec::new();
    let skipped = sheet.unreadable_rows;
    for row in &sheet.rows {
        if row_is_blank(row) {
            continue;
        }
        // Rows without an estimate id are kept here; the merge drops them with
        // a warning so the operator sees the count.
        records.push(EstimateRow {
            estimate_id: sheet
                .cell(row, map.aliases("estimate_id"))
                .unwrap_or("")
                .to_string(),
            client_name: sheet
                .cell(row, map.aliases("client_name"))
                .unwrap_or("")
                .to_string(),
            status: EstimateStatus::from_sheet(sheet.cell(row, map.aliases("status")).unwrap_or("")),
            estimate_date: parse_date_cell(sheet.cell(row, map.aliases("estimate_date"))),
            contract_start: parse_date_cell(sheet.cell(row, map.aliases("contract_start"))),
            contract_end: parse_date_cell(sheet.cell(row, map.aliases("contract_end"))),
            total: parse_money_cell(sheet.cell(row, map.aliases("total"))),
            email: sheet
                .cell(row, map.aliases("email"))
                .and_then(normalize_email),
            phone: sheet.cell(row, map.aliases("phone")).map(str::to_string),
            tags: parse_tags_cell(sheet.cell(row, map.aliases("tags"))),
            address: read_address(sheet, row, map),
            contact_id: sheet
                .cell(row, map.aliases("contact_id"))
                .map(str::to_string),
        });
    }

    let count = records.len();
    ParseOutcome {
        records,
        stats: ParseStats {
            count,
            skipped,
            error: None,
        },
    }
}

pub fn parse_jobsites(sheet: &RawSheet, map: &ColumnMap) -> ParseOutcome<JobsiteRow> {
    if let Some(missing) = missing_required(sheet, map, REQUIRED_JOBSITE_FIELDS) {
        return ParseOutcome::layout_error(format!(
            "jobsite export header is missing expected column(s): {missing}"
        ));
    }

    let mut records = Vec::new();
    let mut skipped = sheet.unreadable_rows;
    for row in &sheet.rows {
        if row_is_blank(row) {
            continue;
        }
        let Some(jobsite_id) = sheet.cell(row, map.aliases("jobsite_id")) else {
            skipped += 1;
            continue;
        };
        records.push(JobsiteRow {
            jobsite_id: jobsite_id.to_string(),
            name: sheet.cell(row, map.aliases("name")).unwrap_or("").to_string(),
            address: read_address(sheet, row, map),
            contact_id: sheet
                .cell(row, map.aliases("contact_id"))
                .map(str::to_string),
        });
    }

    let count = records.len();
    ParseOutcome {
        records,
        stats: ParseStats {
            count,
            skipped,
            error: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contacts_map() -> ColumnMap {
        ColumnMap::default_for(SheetKind::Contacts)
    }

    #[test]
    fn contacts_parse_with_alias_headers() {
        let csv = "\
Contact ID,Full Name,Email Address,Main Phone,Account ID,Company Name,Tags,Street,City,State,Zip
C1,Jane Doe,JANE@Example.com,555-867-5309,A1,Acme Plumbing,\"vip, commercial\",12 Oak St,Springfield,IL,62704
,No Id,missing@example.com,,,,,,,,
C2,Sam Roe,,,A1,Acme Plumbing,,,,,
";
        let sheet = RawSheet::from_bytes(csv.as_bytes()).unwrap();
        let outcome = parse_contacts(&sheet, &contacts_map());
        assert!(outcome.stats.error.is_none());
        assert_eq!(outcome.stats.count, 2);
        assert_eq!(outcome.stats.skipped, 1);
        let first = &outcome.records[0];
        assert_eq!(first.contact_id, "C1");
        assert_eq!(first.email.as_deref(), Some("jane@example.com"));
        assert_eq!(first.account_id.as_deref(), Some("A1"));
        assert!(first.tags.contains("vip"));
        assert_eq!(first.address.city, "Springfield");
    }

    #[test]
    fn unrecognized_layout_blocks_with_error() {
        let csv = "Foo,Bar\n1,2\n";
        let sheet = RawSheet::from_bytes(csv.as_bytes()).unwrap();
        let outcome = parse_contacts(&sheet, &contacts_map());
        assert!(outcome.is_blocked());
        assert!(outcome
            .stats
            .error
            .as_deref()
            .unwrap()
            .contains("contact_id"));
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn blank_rows_are_ignored_silently() {
        let csv = "Contact ID,Name,Email\nC1,Jane,j@x.com\n,,\n,,\n";
        let sheet = RawSheet::from_bytes(csv.as_bytes()).unwrap();
        let outcome = parse_contacts(&sheet, &contacts_map());
        assert_eq!(outcome.stats.count, 1);
        assert_eq!(outcome.stats.skipped, 0);
    }

    #[test]
    fn tab_delimited_input_is_sniffed() {
        let tsv = "Contact ID\tName\tEmail\nC1\tJane\tj@x.com\n";
        let sheet = RawSheet::from_bytes(tsv.as_bytes()).unwrap();
        let outcome = parse_contacts(&sheet, &contacts_map());
        assert_eq!(outcome.stats.count, 1);
        assert_eq!(outcome.records[0].name, "Jane");
    }

    #[test]
    fn estimates_coerce_money_dates_and_status() {
        let csv = "\
Estimate ID,Client,Status,Estimate Date,Total,Email
E1,Acme Plumbing,Won,03/15/2025,\"$1,200.50\",owner@acme.com
E2,Beta LLC,Strange Status,not-a-date,n/a,
,Missing Id,Pending,,,
";
        let sheet = RawSheet::from_bytes(csv.as_bytes()).unwrap();
        let outcome = parse_estimates(&sheet, &ColumnMap::default_for(SheetKind::Estimates));
        assert!(outcome.stats.error.is_none());
        assert_eq!(outcome.stats.count, 3);
        let first = &outcome.records[0];
        assert_eq!(first.status, cir_core::EstimateStatus::Won);
        assert_eq!(first.total, Some(1200.50));
        assert_eq!(
            first.estimate_date,
            chrono::NaiveDate::from_ymd_opt(2025, 3, 15)
        );
        assert_eq!(outcome.records[1].total, None);
        assert_eq!(outcome.records[2].estimate_id, "");
    }

    #[test]
    fn leads_parse_preference_flags() {
        let csv = "Name,Company,Do Not Email,Do Not Call\nPat Lee,Acme,yes,\n";
        let sheet = RawSheet::from_bytes(csv.as_bytes()).unwrap();
        let outcome = parse_leads(&sheet, &ColumnMap::default_for(SheetKind::Leads));
        assert_eq!(outcome.stats.count, 1);
        assert!(outcome.records[0].do_not_email);
        assert!(!outcome.records[0].do_not_call);
    }

    #[test]
    fn yaml_overlay_replaces_only_listed_fields() {
        let config = SheetConfig::from_yaml_str(
            "contacts:\n  contact_id: [\"Kundennummer\"]\n",
        )
        .unwrap();
        assert_eq!(config.contacts.aliases("contact_id").len(), 1);
        assert_eq!(config.contacts.aliases("contact_id")[0], "Kundennummer");
        // untouched fields keep their defaults
        assert!(config
            .contacts
            .aliases("email")
            .iter()
            .any(|a| a == "Email"));
        assert!(config
            .estimates
            .aliases("estimate_id")
            .iter()
            .any(|a| a == "Estimate ID"));
    }

    #[test]
    fn truncated_workbook_bytes_error_out() {
        let bytes = b"PK\x03\x04not actually a workbook";
        assert!(RawSheet::from_bytes(bytes).is_err());
    }

    #[test]
    fn load_sheet_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobsites.csv");
        std::fs::write(&path, "Jobsite ID,Name,Street\nJ1,Depot,5 Main St\n").unwrap();
        let sheet = load_sheet(&path).unwrap();
        let outcome = parse_jobsites(&sheet, &ColumnMap::default_for(SheetKind::Jobsites));
        assert_eq!(outcome.stats.count, 1);
        assert_eq!(outcome.records[0].address.line1, "5 Main St");
    }
}
