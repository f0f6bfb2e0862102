//! Spreadsheet exports (NIH Guide, NSF funding search, Grants.gov) read as
//! header-keyed records for the canonicalizer.

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use rfam_core::{normalize_key, parse_date};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{AdapterError, SourceAdapter};

pub const GRANTS_GOV_DETAIL_URL: &str = "https://www.grants.gov/search-results-detail/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsvExportKind {
    NihExport,
    NsfExport,
    GrantsExport,
}

impl CsvExportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NihExport => "nih_export",
            Self::NsfExport => "nsf_export",
            Self::GrantsExport => "grants_export",
        }
    }
}

impl FromStr for CsvExportKind {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "nih_export" => Ok(Self::NihExport),
            "nsf_export" => Ok(Self::NsfExport),
            "grants_export" => Ok(Self::GrantsExport),
            other => Err(AdapterError::Message(format!(
                "unknown export kind {other:?}; expected nih_export, nsf_export or grants_export"
            ))),
        }
    }
}

/// Parsed export: the header row as written, and one JSON object per data row.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvExport {
    pub columns: Vec<String>,
    pub records: Vec<JsonValue>,
}

/// Read an export. Blank cells are dropped; blank rows are skipped.
pub fn records_from_csv(kind: CsvExportKind, bytes: &[u8]) -> Result<CsvExport, AdapterError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| AdapterError::Parse(format!("csv headers: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(|e| AdapterError::Parse(format!("csv row {}: {e}", line + 1)))?;
        let mut record = Map::new();
        for (column, value) in columns.iter().zip(row.iter()) {
            if !value.is_empty() {
                record.insert(column.clone(), JsonValue::String(value.to_string()));
            }
        }
        if record.is_empty() {
            continue;
        }
        fill_export_fields(kind, &mut record);
        records.push(JsonValue::Object(record));
    }
    Ok(CsvExport { columns, records })
}

/// Export-specific columns the canonical alias table does not cover.
fn fill_export_fields(kind: CsvExportKind, record: &mut Map<String, JsonValue>) {
    match kind {
        CsvExportKind::NihExport => {
            set_if_missing(record, &["agency", "agency_name"], "agency", "NIH".to_string());
            if let Some(url) = cell(record, &["url"]) {
                set_if_missing(record, &["details", "details_url"], "details", url);
            }
        }
        CsvExportKind::NsfExport => {
            set_if_missing(record, &["agency", "agency_name"], "agency", "NSF".to_string());
            if let Some(posted) = cell_containing(record, "posted_date") {
                set_if_missing(record, &["posted_date"], "posted_date", posted);
            }
            let due = cell_containing(record, "next_due_date").and_then(|t| first_date_in(&t));
            if let Some(due) = due {
                set_if_missing(record, &["close_date"], "close_date", due.to_string());
            }
            if let Some(kind) = cell(record, &["type"]) {
                set_if_missing(record, &["mechanism", "award_type"], "mechanism", kind);
            }
        }
        CsvExportKind::GrantsExport => {
            if let Some(agency) = cell(record, &["top_level_agency_name"]) {
                set_if_missing(record, &["agency", "agency_name"], "agency", agency);
            }
            if let Some(category) = cell(record, &["category_explanation"]) {
                set_if_missing(record, &["category"], "category", category);
            }
            if let Some(close) = cell(record, &["close_date_description"]) {
                set_if_missing(record, &["close_date"], "close_date", close);
            }
            let details = cell(record, &["additional_info_url"]).or_else(|| {
                cell(record, &["opportunity_id"]).map(|id| format!("{GRANTS_GOV_DETAIL_URL}{id}"))
            });
            if let Some(details) = details {
                set_if_missing(record, &["details", "details_url"], "details", details.clone());
                set_if_missing(record, &["landing", "url"], "landing", details);
            }
        }
    }
}

fn cell(record: &Map<String, JsonValue>, aliases: &[&str]) -> Option<String> {
    record.iter().find_map(|(key, value)| {
        let key = normalize_key(key);
        aliases
            .contains(&key.as_str())
            .then(|| value.as_str().map(str::to_string))
            .flatten()
    })
}

fn cell_containing(record: &Map<String, JsonValue>, fragment: &str) -> Option<String> {
    record
        .iter()
        .find(|(key, _)| normalize_key(key).contains(fragment))
        .and_then(|(_, value)| value.as_str().map(str::to_string))
}

fn set_if_missing(
    record: &mut Map<String, JsonValue>,
    aliases: &[&str],
    key: &str,
    value: String,
) {
    if cell(record, aliases).is_none() {
        record.insert(key.to_string(), JsonValue::String(value));
    }
}

/// First date mentioned in free text such as "Full proposal: March 5, 2025".
pub fn first_date_in(text: &str) -> Option<NaiveDate> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    (0..tokens.len()).find_map(|i| {
        let token = tokens[i].trim_matches(|c: char| !c.is_ascii_alphanumeric());
        parse_date(token).or_else(|| {
            let phrase = tokens.get(i..i + 3)?.join(" ");
            parse_date(phrase.trim_end_matches(|c: char| !c.is_ascii_digit()))
        })
    })
}

/// A local export file re-read on every fetch.
#[derive(Debug, Clone)]
pub struct CsvFileAdapter {
    source_name: String,
    kind: CsvExportKind,
    path: PathBuf,
}

impl CsvFileAdapter {
    pub fn new(source_name: &str, kind: CsvExportKind, path: impl Into<PathBuf>) -> Self {
        Self {
            source_name: source_name.to_string(),
            kind,
            path: path.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for CsvFileAdapter {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    async fn fetch(&self) -> Result<Vec<JsonValue>, AdapterError> {
        let bytes = tokio::fs::read(&self.path).await?;
        Ok(records_from_csv(self.kind, &bytes)?.records)
    }
}

#[cfg(test)]
mod tests {
    use rfam_core::canonicalize;

    use super::*;

    #[test]
    fn nih_export_rows_canonicalize_with_agency_and_urls() {
        let csv = "Title,Release_Date,Expired_Date,Activity Code,Document_Number,Document_Type,URL\n\
                   Pediatric Brain Tumor Consortium,03/01/2025,2025-07-15,U01,RFA-CA-25-020,RFA,https://grants.nih.gov/rfa-ca-25-020\n\
                   ,,,,,,\n";
        let export = records_from_csv(CsvExportKind::NihExport, csv.as_bytes()).unwrap();
        assert_eq!(export.columns.len(), 7);
        assert_eq!(export.records.len(), 1);

        let c = canonicalize("nih_export", &export.records[0]).unwrap();
        assert_eq!(c.fields.title, "Pediatric Brain Tumor Consortium");
        assert_eq!(c.fields.agency.as_deref(), Some("NIH"));
        assert_eq!(c.fields.mechanism.as_deref(), Some("U01"));
        assert_eq!(c.fields.category.as_deref(), Some("RFA"));
        assert_eq!(c.fields.source_native_id.as_deref(), Some("RFA-CA-25-020"));
        assert_eq!(c.fields.posted_date, NaiveDate::from_ymd_opt(2025, 3, 1));
        assert_eq!(c.fields.close_date, NaiveDate::from_ymd_opt(2025, 7, 15));
        assert_eq!(
            c.fields.urls.details.as_deref(),
            Some("https://grants.nih.gov/rfa-ca-25-020")
        );
    }

    #[test]
    fn nsf_export_reads_due_date_text_and_award_type() {
        let csv = "Title,Synopsis,Next due date (Y-m-d),Posted date (Y-m-d),URL,Type,Solicitation URL\n\
                   Smart Health,\"Advances in health computing\",\"Full Proposal: March 5, 2026\",2025-01-10,https://nsf.gov/sh,Standard Grant,https://nsf.gov/sh/sol\n";
        let export = records_from_csv(CsvExportKind::NsfExport, csv.as_bytes()).unwrap();
        let c = canonicalize("nsf_export", &export.records[0]).unwrap();
        assert_eq!(c.fields.agency.as_deref(), Some("NSF"));
        assert_eq!(c.fields.mechanism.as_deref(), Some("Standard Grant"));
        assert_eq!(c.fields.summary.as_deref(), Some("Advances in health computing"));
        assert_eq!(c.fields.posted_date, NaiveDate::from_ymd_opt(2025, 1, 10));
        assert_eq!(c.fields.close_date, NaiveDate::from_ymd_opt(2026, 3, 5));
        assert_eq!(c.fields.urls.details.as_deref(), Some("https://nsf.gov/sh/sol"));
    }

    #[test]
    fn grants_export_builds_detail_url_from_opportunity_id() {
        let csv = "opportunity_id,opportunity_number,opportunity_title,post_date,close_date,top_level_agency_name,summary_description,award_ceiling\n\
                   356001,RFA-CA-25-012,Pediatric Oncology Research,2025-01-15,2025-05-01,Department of Health and Human Services,Childhood cancer studies,500000\n";
        let export = records_from_csv(CsvExportKind::GrantsExport, csv.as_bytes()).unwrap();
        let c = canonicalize("grants_export", &export.records[0]).unwrap();
        assert_eq!(c.fields.source_native_id.as_deref(), Some("RFA-CA-25-012"));
        assert_eq!(
            c.fields.agency.as_deref(),
            Some("Department of Health and Human Services")
        );
        assert_eq!(
            c.fields.urls.details.as_deref(),
            Some("https://www.grants.gov/search-results-detail/356001")
        );
        assert_eq!(c.fields.raw["award_ceiling"], "500000");
    }

    #[test]
    fn export_kind_names_round_trip_and_reject_unknown() {
        for kind in [
            CsvExportKind::NihExport,
            CsvExportKind::NsfExport,
            CsvExportKind::GrantsExport,
        ] {
            assert_eq!(kind.as_str().parse::<CsvExportKind>().unwrap(), kind);
        }
        assert!("excel".parse::<CsvExportKind>().is_err());
    }

    #[test]
    fn first_date_in_finds_iso_and_long_forms() {
        assert_eq!(
            first_date_in("Preliminary: 2025-09-30; full: later"),
            NaiveDate::from_ymd_opt(2025, 9, 30)
        );
        assert_eq!(
            first_date_in("Full Proposal Target Date: October 1, 2025."),
            NaiveDate::from_ymd_opt(2025, 10, 1)
        );
        assert_eq!(first_date_in("Accepted anytime"), None);
    }

    #[tokio::test]
    async fn csv_file_adapter_reads_the_export_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nih.csv");
        tokio::fs::write(&path, "Title,URL\nRare Disease Networks,https://grants.nih.gov/rdn\n")
            .await
            .unwrap();

        let adapter = CsvFileAdapter::new("nih_export", CsvExportKind::NihExport, &path);
        let records = adapter.fetch().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["agency"], "NIH");
    }
}
