//! Core domain model and canonicalization for RFA Matcher.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rfam-core";

/// Version tag mixed into every fingerprint. Bumping it re-keys the whole store.
pub const FINGERPRINT_VERSION: &str = "rfam-fp-v1";

/// Opaque key-value record as produced by a source adapter.
pub type RawRecord = Map<String, JsonValue>;

pub type OpportunityId = Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityUrls {
    pub landing: Option<String>,
    pub details: Option<String>,
    pub pdf: Option<String>,
}

impl OpportunityUrls {
    pub fn is_empty(&self) -> bool {
        self.landing.is_none() && self.details.is_none() && self.pdf.is_none()
    }
}

/// Source-independent opportunity content produced by [`canonicalize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalFields {
    pub source_name: String,
    pub source_native_id: Option<String>,
    pub title: String,
    pub agency: Option<String>,
    pub mechanism: Option<String>,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub eligibility: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub posted_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDate>,
    #[serde(default)]
    pub urls: OpportunityUrls,
    #[serde(default)]
    pub raw: JsonValue,
}

/// Stable content hash over the normalized identity fields of an opportunity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic internal id derived from the fingerprint.
    pub fn opportunity_id(&self) -> OpportunityId {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, self.0.as_bytes())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical persisted opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: OpportunityId,
    pub fingerprint: Fingerprint,
    #[serde(flatten)]
    pub fields: CanonicalFields,
    pub stale: bool,
    pub embedding_pending: bool,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn is_live(&self) -> bool {
        !self.stale
    }

    /// Text submitted to the embedder for this opportunity.
    pub fn embedding_text(&self) -> String {
        let f = &self.fields;
        [
            Some(f.title.as_str()),
            f.summary.as_deref(),
            f.eligibility.as_deref(),
            f.mechanism.as_deref(),
            f.agency.as_deref(),
            f.category.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
    }
}

/// Conjunctive filter for `list_live`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveFilter {
    pub agency: Option<String>,
    pub mechanism: Option<String>,
    /// Keep records still open on or after this date (null close date counts as open).
    pub open_after: Option<NaiveDate>,
    /// Keep records posted on or before this date (null posted date counts as posted).
    pub open_before: Option<NaiveDate>,
}

impl LiveFilter {
    pub fn matches(&self, opportunity: &Opportunity) -> bool {
        let f = &opportunity.fields;
        if let Some(agency) = &self.agency {
            if !eq_ignore_case(f.agency.as_deref(), agency) {
                return false;
            }
        }
        if let Some(mechanism) = &self.mechanism {
            if !eq_ignore_case(f.mechanism.as_deref(), mechanism) {
                return false;
            }
        }
        if let (Some(after), Some(close)) = (self.open_after, f.close_date) {
            if close < after {
                return false;
            }
        }
        if let (Some(before), Some(posted)) = (self.open_before, f.posted_date) {
            if posted > before {
                return false;
            }
        }
        true
    }
}

fn eq_ignore_case(value: Option<&str>, wanted: &str) -> bool {
    value
        .map(|v| v.trim().to_lowercase() == wanted.trim().to_lowercase())
        .unwrap_or(false)
}

/// Identifies the embedding space a vector belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingSpace {
    pub backend: String,
    pub model: String,
    pub dimensions: usize,
}

impl std::fmt::Display for EmbeddingSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} (d={})", self.backend, self.model, self.dimensions)
    }
}

/// Current embedding of one live opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub opportunity_id: OpportunityId,
    pub space: EmbeddingSpace,
    pub values: Vec<f32>,
    pub generated_at: DateTime<Utc>,
}

/// What happened to the secondary re-rank signal for one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankStatus {
    NotRequested,
    Scored,
    /// The scorer ran but produced nothing usable for this candidate.
    Failed,
    /// The scorer was absent or failed for the whole call.
    Unavailable,
}

/// One ranked opportunity. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub rank: usize,
    pub opportunity: Opportunity,
    pub vector_score: f32,
    pub rerank_score: Option<u8>,
    pub rationale: Option<String>,
    pub rerank_status: RerankStatus,
    pub final_score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecordError {
    #[error("record has no source name")]
    MissingSourceName,
    #[error("record from {source_name} has no title-like field")]
    MissingTitle { source_name: String },
    #[error("record from {source_name} is not a key-value object")]
    NotAnObject { source_name: String },
}

/// Output of [`canonicalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Canonicalized {
    pub fields: CanonicalFields,
    pub fingerprint: Fingerprint,
}

const TITLE_KEYS: &[&str] = &["title", "opportunity_title", "name", "headline"];
const SUMMARY_KEYS: &[&str] = &[
    "summary",
    "summary_description",
    "synopsis",
    "description",
    "abstract",
];
const AGENCY_KEYS: &[&str] = &["agency", "agency_name", "funder", "sponsor", "organization"];
const MECHANISM_KEYS: &[&str] = &[
    "mechanism",
    "funding_instrument",
    "activity_code",
    "activity",
    "award_type",
];
const CATEGORY_KEYS: &[&str] = &["category", "opportunity_category", "document_type"];
const ELIGIBILITY_KEYS: &[&str] = &[
    "eligibility",
    "eligible_applicants",
    "applicant_types",
];
const KEYWORD_KEYS: &[&str] = &["keywords", "tags"];
const POSTED_KEYS: &[&str] = &["posted_date", "post_date", "release_date", "open_date", "published"];
const CLOSE_KEYS: &[&str] = &[
    "close_date",
    "application_deadline",
    "deadline",
    "expired_date",
    "due_date",
];
const NATIVE_ID_KEYS: &[&str] = &[
    "opportunity_number",
    "opportunity_id",
    "document_number",
    "native_id",
    "id",
];
const LANDING_KEYS: &[&str] = &["landing", "url", "link", "landing_url"];
const DETAILS_KEYS: &[&str] = &["details", "details_url", "solicitation_url", "detail_url"];
const PDF_KEYS: &[&str] = &["pdf", "pdf_url"];

/// Map one raw source record onto the canonical schema and fingerprint it.
///
/// Missing optional fields become `None`. Only a missing source name or a
/// missing title rejects the record.
pub fn canonicalize(source_name: &str, raw: &JsonValue) -> Result<Canonicalized, MalformedRecordError> {
    let source_name = source_name.trim();
    if source_name.is_empty() {
        return Err(MalformedRecordError::MissingSourceName);
    }
    let Some(object) = raw.as_object() else {
        return Err(MalformedRecordError::NotAnObject {
            source_name: source_name.to_string(),
        });
    };
    let lookup = KeyLookup::new(object);

    let title = lookup
        .text(TITLE_KEYS)
        .ok_or_else(|| MalformedRecordError::MissingTitle {
            source_name: source_name.to_string(),
        })?;

    let urls = OpportunityUrls {
        landing: lookup.text(LANDING_KEYS),
        details: lookup.text(DETAILS_KEYS),
        pdf: lookup.text(PDF_KEYS),
    };
    let urls = match lookup.get(&["urls"]).and_then(JsonValue::as_object) {
        Some(nested) if urls.is_empty() => {
            let nested = KeyLookup::new(nested);
            OpportunityUrls {
                landing: nested.text(LANDING_KEYS),
                details: nested.text(DETAILS_KEYS),
                pdf: nested.text(PDF_KEYS),
            }
        }
        _ => urls,
    };

    let fields = CanonicalFields {
        source_name: source_name.to_string(),
        source_native_id: lookup.text(NATIVE_ID_KEYS),
        title,
        agency: lookup.text(AGENCY_KEYS),
        mechanism: lookup.text(MECHANISM_KEYS),
        category: lookup.text(CATEGORY_KEYS),
        summary: lookup.text(SUMMARY_KEYS),
        eligibility: lookup.text(ELIGIBILITY_KEYS),
        keywords: lookup.list(KEYWORD_KEYS),
        posted_date: lookup.text(POSTED_KEYS).and_then(|s| parse_date(&s)),
        close_date: lookup.text(CLOSE_KEYS).and_then(|s| parse_date(&s)),
        urls,
        raw: raw.clone(),
    };
    let fingerprint = fingerprint(&fields);
    Ok(Canonicalized { fields, fingerprint })
}

/// Lower-case and collapse all whitespace runs to one space.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 over the ordered, normalized identity fields.
///
/// Source name, source-native id, urls and the raw payload never participate,
/// so identical content from any source yields the same fingerprint.
pub fn fingerprint(fields: &CanonicalFields) -> Fingerprint {
    let posted = fields
        .posted_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let parts = [
        normalize_text(&fields.title),
        normalize_text(fields.summary.as_deref().unwrap_or_default()),
        normalize_text(fields.agency.as_deref().unwrap_or_default()),
        normalize_text(fields.mechanism.as_deref().unwrap_or_default()),
        posted,
    ];

    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_VERSION.as_bytes());
    for part in &parts {
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Parse the date shapes sources actually emit; anything else is `None`.
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%b %d, %Y", "%B %d, %Y", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Some(date);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.date_naive());
    }
    // Timestamps like "2024-01-10 00:00:00" or "2024-01-10T00:00:00".
    s.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// Case- and punctuation-insensitive key access over a raw record.
struct KeyLookup<'a> {
    entries: Vec<(String, &'a JsonValue)>,
}

impl<'a> KeyLookup<'a> {
    fn new(object: &'a Map<String, JsonValue>) -> Self {
        Self {
            entries: object
                .iter()
                .map(|(k, v)| (normalize_key(k), v))
                .collect(),
        }
    }

    fn get(&self, aliases: &[&str]) -> Option<&'a JsonValue> {
        aliases.iter().find_map(|alias| {
            self.entries
                .iter()
                .find(|(key, value)| key == alias && !value.is_null())
                .map(|(_, value)| *value)
        })
    }

    fn text(&self, aliases: &[&str]) -> Option<String> {
        aliases.iter().find_map(|alias| {
            self.entries
                .iter()
                .filter(|(key, _)| key == alias)
                .find_map(|(_, value)| json_text(value))
        })
    }

    fn list(&self, aliases: &[&str]) -> Vec<String> {
        match self.get(aliases) {
            Some(JsonValue::Array(items)) => items.iter().filter_map(json_text).collect(),
            Some(JsonValue::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Field-name form used for alias matching: lower-case words joined by `_`.
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn json_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.split_whitespace().collect::<Vec<_>>().join(" "),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(json_text)
            .collect::<Vec<_>>()
            .join(", "),
        JsonValue::Object(map) => map
            .values()
            .filter_map(json_text)
            .collect::<Vec<_>>()
            .join(" "),
        JsonValue::Null => String::new(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
