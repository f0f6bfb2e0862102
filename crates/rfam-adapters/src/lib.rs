//! Source adapters: each one fetches raw opportunity records from a single
//! external source. Mapping onto the canonical schema happens downstream.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rfam_core::parse_date;
use rfam_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

mod csv_export;

pub use csv_export::{
    first_date_in, records_from_csv, CsvExport, CsvExportKind, CsvFileAdapter,
    GRANTS_GOV_DETAIL_URL,
};

pub const CRATE_NAME: &str = "rfam-adapters";

pub const GRANTS_GOV_SEARCH_URL: &str = "https://api.simpler.grants.gov/v1/opportunities/search";
pub const RWJF_BASE_URL: &str = "https://www.rwjf.org";
pub const RWJF_LISTING_PATH: &str = "/en/grants/active-funding-opportunities.html";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not parse source payload: {0}")]
    Parse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The single capability every source exposes.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &str;

    /// All raw records currently published by the source.
    async fn fetch(&self) -> Result<Vec<JsonValue>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Fixture,
    CsvExport,
    GrantsGov,
    Rwjf,
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub kind: AdapterKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Fixture or export file, relative to the workspace root.
    #[serde(default)]
    pub path: Option<String>,
    /// Column layout of a `csv_export` source.
    #[serde(default)]
    pub export: Option<CsvExportKind>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub max_details: Option<usize>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistryFile {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistryFile {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, AdapterError> {
        serde_yaml::from_str(yaml).map_err(|e| AdapterError::Parse(format!("sources registry: {e}")))
    }

    pub async fn load(path: &Path) -> Result<Self, AdapterError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_yaml_str(&text)
    }
}

/// Name to adapter mapping built once at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn SourceAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.adapters.keys()).finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every enabled source. Unknown or incomplete entries
    /// are configuration errors.
    pub fn from_sources(
        sources: &[SourceConfig],
        http: Arc<HttpFetcher>,
        workspace_root: &Path,
    ) -> Result<Self, AdapterError> {
        let mut registry = Self::new();
        for source in sources.iter().filter(|s| s.enabled) {
            let adapter: Arc<dyn SourceAdapter> = match source.kind {
                AdapterKind::Fixture => {
                    let path = source.path.as_deref().ok_or_else(|| {
                        AdapterError::Message(format!("source {} needs a fixture path", source.name))
                    })?;
                    Arc::new(FixtureAdapter::new(&source.name, workspace_root.join(path)))
                }
                AdapterKind::CsvExport => {
                    let (Some(path), Some(export)) = (source.path.as_deref(), source.export) else {
                        return Err(AdapterError::Message(format!(
                            "source {} needs both a path and an export kind",
                            source.name
                        )));
                    };
                    Arc::new(CsvFileAdapter::new(&source.name, export, workspace_root.join(path)))
                }
                AdapterKind::GrantsGov => {
                    let mut adapter = GrantsGovAdapter::new(
                        &source.name,
                        Arc::clone(&http),
                        source.url.as_deref().unwrap_or(GRANTS_GOV_SEARCH_URL),
                    );
                    if let Some(page_size) = source.page_size {
                        adapter.page_size = page_size.max(1);
                    }
                    if let Some(max_pages) = source.max_pages {
                        adapter.max_pages = max_pages.max(1);
                    }
                    Arc::new(adapter)
                }
                AdapterKind::Rwjf => {
                    let base = source.url.as_deref().unwrap_or(RWJF_BASE_URL);
                    let mut adapter = RwjfAdapter::new(&source.name, Arc::clone(&http), base);
                    if let Some(max_details) = source.max_details {
                        adapter.max_details = max_details;
                    }
                    Arc::new(adapter)
                }
            };
            registry.register(adapter)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> Result<(), AdapterError> {
        let name = adapter.source_name().to_string();
        if self.adapters.contains_key(&name) {
            return Err(AdapterError::Message(format!("duplicate source name {name}")));
        }
        self.adapters.insert(name, adapter);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn SourceAdapter>> {
        self.adapters.values()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Records read from a local JSON file: either an array or `{"records": [...]}`.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source_name: String,
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(source_name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            source_name: source_name.to_string(),
            path: path.into(),
        }
    }
}

pub fn records_from_json(value: JsonValue) -> Result<Vec<JsonValue>, AdapterError> {
    match value {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(mut map) => match map.remove("records") {
            Some(JsonValue::Array(items)) => Ok(items),
            _ => Err(AdapterError::Parse("expected an array or a `records` array".to_string())),
        },
        _ => Err(AdapterError::Parse("expected an array or a `records` array".to_string())),
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    async fn fetch(&self) -> Result<Vec<JsonValue>, AdapterError> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let value: JsonValue = serde_json::from_str(&text)
            .map_err(|e| AdapterError::Parse(format!("{}: {e}", self.path.display())))?;
        records_from_json(value)
    }
}

/// Fixed in-memory records.
#[derive(Debug, Clone)]
pub struct StaticAdapter {
    source_name: String,
    records: Vec<JsonValue>,
}

impl StaticAdapter {
    pub fn new(source_name: &str, records: Vec<JsonValue>) -> Self {
        Self {
            source_name: source_name.to_string(),
            records,
        }
    }
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    async fn fetch(&self) -> Result<Vec<JsonValue>, AdapterError> {
        Ok(self.records.clone())
    }
}

/// Federal opportunities from the Simpler Grants.gov search API, paged.
#[derive(Debug, Clone)]
pub struct GrantsGovAdapter {
    source_name: String,
    http: Arc<HttpFetcher>,
    search_url: String,
    pub page_size: usize,
    pub max_pages: usize,
}

impl GrantsGovAdapter {
    pub fn new(source_name: &str, http: Arc<HttpFetcher>, search_url: &str) -> Self {
        Self {
            source_name: source_name.to_string(),
            http,
            search_url: search_url.to_string(),
            page_size: 50,
            max_pages: 40,
        }
    }

    fn search_body(&self, page: usize) -> JsonValue {
        json!({
            "pagination": {
                "page_offset": page,
                "page_size": self.page_size,
                "sort_order": [{ "order_by": "opportunity_id", "sort_direction": "descending" }],
            },
            "filters": {
                "opportunity_status": { "one_of": ["forecasted", "posted"] }
            }
        })
    }
}

#[async_trait]
impl SourceAdapter for GrantsGovAdapter {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    async fn fetch(&self) -> Result<Vec<JsonValue>, AdapterError> {
        let mut records = Vec::new();
        let mut page = 1;
        loop {
            let resp = self
                .http
                .post_json(&self.source_name, &self.search_url, &self.search_body(page))
                .await?;
            let (batch, total_pages) = parse_grants_gov_page(&resp.json()?)?;
            let done = batch.is_empty() || page >= total_pages || page >= self.max_pages;
            info!(source = %self.source_name, page, count = batch.len(), "grants.gov page fetched");
            records.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        Ok(records)
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn json_scalar(value: &JsonValue, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    match cur {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Labels from an array of strings or of objects carrying `label_key`.
fn json_labels(value: &JsonValue, path: &[&str], label_key: &str) -> Vec<String> {
    let mut cur = value;
    for segment in path {
        match cur.get(*segment) {
            Some(next) => cur = next,
            None => return Vec::new(),
        }
    }
    cur.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    JsonValue::String(s) => Some(s.trim().to_string()),
                    JsonValue::Object(_) => json_str(item, &[label_key]).map(ToString::to_string),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Map one search response page to raw records plus the reported page count.
pub fn parse_grants_gov_page(body: &JsonValue) -> Result<(Vec<JsonValue>, usize), AdapterError> {
    let data = body
        .get("data")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::Parse("grants.gov response has no data array".to_string()))?;
    let total_pages = body
        .get("pagination_info")
        .and_then(|p| p.get("total_pages"))
        .and_then(JsonValue::as_u64)
        .unwrap_or(1) as usize;

    let records = data.iter().map(grants_gov_record).collect();
    Ok((records, total_pages))
}

fn grants_gov_record(opp: &JsonValue) -> JsonValue {
    let opportunity_id = json_scalar(opp, &["opportunity_id"]);
    let summary = json_str(opp, &["summary", "summary_description"])
        .or_else(|| json_str(opp, &["summary"]));
    let posted = json_str(opp, &["summary", "post_date"]).or_else(|| json_str(opp, &["post_date"]));
    let close = json_str(opp, &["summary", "close_date"])
        .or_else(|| json_str(opp, &["close_date"]))
        .or_else(|| json_str(opp, &["application_deadline"]));

    let mut applicants = json_labels(opp, &["summary", "applicant_types"], "applicant_type");
    if applicants.is_empty() {
        applicants = json_labels(opp, &["applicant_types"], "applicant_type");
    }
    let mut instruments = json_labels(opp, &["summary", "funding_instruments"], "funding_instrument");
    if instruments.is_empty() {
        instruments = json_labels(opp, &["funding_instruments"], "funding_instrument");
    }
    let details_url = opportunity_id
        .as_ref()
        .map(|id| format!("https://www.grants.gov/search-results-detail/{id}"));

    json!({
        "opportunity_number": json_scalar(opp, &["opportunity_number"]).or(opportunity_id),
        "title": json_str(opp, &["opportunity_title"]),
        "agency": json_str(opp, &["agency_name"]).or_else(|| json_str(opp, &["agency"])),
        "category": json_str(opp, &["category"]).or_else(|| json_str(opp, &["opportunity_category"])),
        "mechanism": (!instruments.is_empty()).then(|| instruments.join(", ")),
        "summary": summary,
        "eligibility": (!applicants.is_empty()).then(|| applicants.join(", ")),
        "posted_date": posted,
        "close_date": close,
        "urls": { "landing": details_url, "details": details_url },
        "source_payload": opp,
    })
}

/// Active funding opportunities scraped from RWJF listing and detail pages.
#[derive(Debug, Clone)]
pub struct RwjfAdapter {
    source_name: String,
    http: Arc<HttpFetcher>,
    base_url: String,
    pub max_details: usize,
}

impl RwjfAdapter {
    pub fn new(source_name: &str, http: Arc<HttpFetcher>, base_url: &str) -> Self {
        Self {
            source_name: source_name.to_string(),
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_details: 50,
        }
    }

    pub fn listing_url(&self) -> String {
        format!("{}{RWJF_LISTING_PATH}", self.base_url)
    }
}

#[async_trait]
impl SourceAdapter for RwjfAdapter {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    async fn fetch(&self) -> Result<Vec<JsonValue>, AdapterError> {
        let listing_url = self.listing_url();
        let listing = self.http.fetch_bytes(&self.source_name, &listing_url).await?;
        let details = parse_rwjf_listing(&listing.text(), &self.base_url, &listing_url)?;
        info!(source = %self.source_name, links = details.len(), "rwjf listing parsed");

        let mut records = Vec::new();
        for link in details.into_iter().take(self.max_details) {
            let page = match self.http.fetch_bytes(&self.source_name, &link.url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(source = %self.source_name, url = %link.url, error = %err, "skipping detail page");
                    continue;
                }
            };
            if let Some(record) = parse_rwjf_detail(&page.text(), &link.url, &link.text)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailLink {
    pub url: String,
    pub text: String,
}

const RWJF_DETAIL_MARKER: &str = "/active-funding-opportunities/";
const RWJF_NAV_TEXT: &[&str] = &[
    "active funding opportunities",
    "grants",
    "find a grant",
    "back",
    "home",
];

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(e.to_string()))
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<Vec<_>>().join(" "))))
}

/// Unique detail-page links from the listing, in page order.
pub fn parse_rwjf_listing(
    html: &str,
    base_url: &str,
    listing_url: &str,
) -> Result<Vec<DetailLink>, AdapterError> {
    let document = Html::parse_document(html);
    let candidates = [
        "a[href*='/en/grants/active-funding-opportunities/']",
        "div[class*='opportunity'] a",
        "article a",
        "div[class*='card'] a",
        "a[href*='/grants/']",
    ];

    for css in candidates {
        let sel = selector(css)?;
        let mut seen = HashSet::new();
        let links: Vec<DetailLink> = document
            .select(&sel)
            .filter_map(|a| {
                let href = a.value().attr("href")?.trim();
                if !href.contains(RWJF_DETAIL_MARKER) {
                    return None;
                }
                let text = text_or_none(a.text().collect::<Vec<_>>().join(" ")).unwrap_or_default();
                if RWJF_NAV_TEXT.contains(&text.to_lowercase().as_str()) {
                    return None;
                }
                let url = if href.starts_with('/') {
                    format!("{base_url}{href}")
                } else {
                    href.to_string()
                };
                (url != listing_url && seen.insert(url.clone())).then_some(DetailLink { url, text })
            })
            .collect();
        if !links.is_empty() {
            return Ok(links);
        }
    }
    Ok(Vec::new())
}

/// One raw record from a detail page, or `None` for generic pages.
pub fn parse_rwjf_detail(
    html: &str,
    url: &str,
    fallback_title: &str,
) -> Result<Option<JsonValue>, AdapterError> {
    let document = Html::parse_document(html);
    let title = select_first_text(&document, "h1")?
        .or_else(|| text_or_none(fallback_title.to_string()));
    let Some(title) = title else {
        return Ok(None);
    };
    if RWJF_NAV_TEXT.contains(&title.to_lowercase().as_str()) {
        return Ok(None);
    }

    let summary = select_first_text(&document, "article p")?
        .or(select_first_text(&document, ".content p")?)
        .or(select_first_text(&document, "main p")?);
    let body_text = select_first_text(&document, "body")?.unwrap_or_default();
    let close_date = find_deadline(&body_text);

    Ok(Some(json!({
        "native_id": url,
        "title": title,
        "agency": "RWJF",
        "summary": summary,
        "close_date": close_date.map(|d| d.to_string()),
        "urls": { "landing": url, "details": url },
    })))
}

/// First "<keyword> Month D, YYYY" date after a deadline-like keyword.
pub fn find_deadline(text: &str) -> Option<NaiveDate> {
    let words: Vec<&str> = text.split_whitespace().collect();
    for keyword in ["deadline", "closes", "due"] {
        for (i, word) in words.iter().enumerate() {
            let bare = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if bare != keyword {
                continue;
            }
            let rest = &words[i + 1..];
            // Allow one filler word such as "on" or "by".
            for skip in 0..=1 {
                if rest.len() < skip + 3 {
                    break;
                }
                let candidate = rest[skip..skip + 3]
                    .join(" ")
                    .trim_end_matches(|c: char| c == '.' || c == ';' || c == ')')
                    .to_string();
                if let Some(date) = parse_date(&candidate) {
                    return Some(date);
                }
            }
        }
    }
    None
}
