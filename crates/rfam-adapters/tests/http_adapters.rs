use std::sync::Arc;
use std::time::Duration;

use rfam_adapters::{
    AdapterError, AdapterRegistry, CsvExportKind, CsvFileAdapter, GrantsGovAdapter, RwjfAdapter,
    SourceAdapter, SourceConfig, SourceRegistryFile, RWJF_LISTING_PATH,
};
use rfam_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher() -> Arc<HttpFetcher> {
    let config = HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        ..HttpClientConfig::default()
    };
    Arc::new(HttpFetcher::new(config).expect("client"))
}

fn page(ids: &[u64], total_pages: u64) -> serde_json::Value {
    let data: Vec<_> = ids
        .iter()
        .map(|id| {
            json!({
                "opportunity_id": id,
                "opportunity_number": format!("NUM-{id}"),
                "opportunity_title": format!("Opportunity {id}"),
                "agency_name": "National Science Foundation",
                "summary": { "summary_description": "Research support.", "post_date": "2025-01-02" }
            })
        })
        .collect();
    json!({ "data": data, "pagination_info": { "total_pages": total_pages } })
}

#[tokio::test]
async fn grants_gov_follows_pagination_until_last_page() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/opportunities/search"))
        .and(body_partial_json(json!({ "pagination": { "page_offset": 1 } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&[3, 2], 2)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/opportunities/search"))
        .and(body_partial_json(json!({ "pagination": { "page_offset": 2 } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(&[1], 2)))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = GrantsGovAdapter::new(
        "grants-gov",
        fetcher(),
        &format!("{}/v1/opportunities/search", server.uri()),
    );
    let records = adapter.fetch().await.expect("fetch");
    let numbers: Vec<_> = records
        .iter()
        .map(|r| r["opportunity_number"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(numbers, vec!["NUM-3", "NUM-2", "NUM-1"]);
}

#[tokio::test]
async fn grants_gov_outage_surfaces_as_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let adapter = GrantsGovAdapter::new("grants-gov", fetcher(), &server.uri());
    let err = adapter.fetch().await.expect_err("outage");
    assert!(matches!(err, AdapterError::Fetch(_)));
}

#[tokio::test]
async fn rwjf_skips_broken_detail_pages() {
    let server = MockServer::start().await;
    let listing = r#"<html><body><main>
        <a href="/en/grants/active-funding-opportunities/2025/a.html">Opportunity A</a>
        <a href="/en/grants/active-funding-opportunities/2025/b.html">Opportunity B</a>
    </main></body></html>"#;
    Mock::given(method("GET"))
        .and(path(RWJF_LISTING_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/en/grants/active-funding-opportunities/2025/a.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<html><body><h1>Opportunity A</h1><main><p>Funds rural clinics.</p>\
             <p>Applications due June 3, 2025.</p></main></body></html>",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/en/grants/active-funding-opportunities/2025/b.html"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let adapter = RwjfAdapter::new("rwjf", fetcher(), &server.uri());
    let records = adapter.fetch().await.expect("fetch");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["title"], "Opportunity A");
    assert_eq!(records[0]["summary"], "Funds rural clinics.");
    assert_eq!(records[0]["close_date"], "2025-06-03");
}

#[test]
fn registry_builds_only_enabled_sources() {
    let yaml = r#"
sources:
  - name: demo
    kind: fixture
    path: fixtures/demo/opportunities.json
  - name: grants-gov
    kind: grants_gov
    enabled: false
  - name: rwjf
    kind: rwjf
"#;
    let file = SourceRegistryFile::from_yaml_str(yaml).expect("yaml");
    let registry = AdapterRegistry::from_sources(&file.sources, fetcher(), std::path::Path::new("."))
        .expect("registry");
    assert_eq!(registry.names(), vec!["demo", "rwjf"]);
}

#[test]
fn fixture_source_without_path_is_rejected() {
    let source = SourceConfig {
        name: "broken".to_string(),
        display_name: None,
        kind: rfam_adapters::AdapterKind::Fixture,
        enabled: true,
        path: None,
        export: None,
        url: None,
        page_size: None,
        max_pages: None,
        max_details: None,
        notes: None,
    };
    let err = AdapterRegistry::from_sources(&[source], fetcher(), std::path::Path::new("."))
        .expect_err("missing path");
    assert!(err.to_string().contains("fixture path"));
}

#[test]
fn csv_export_source_needs_an_export_kind() {
    let yaml = r#"
sources:
  - name: nih-export
    kind: csv_export
    path: fixtures/nih-export/guide.csv
"#;
    let file = SourceRegistryFile::from_yaml_str(yaml).expect("yaml");
    let err = AdapterRegistry::from_sources(&file.sources, fetcher(), std::path::Path::new("."))
        .expect_err("missing export kind");
    assert!(err.to_string().contains("export kind"));

    let yaml = r#"
sources:
  - name: nih-export
    kind: csv_export
    export: nih_export
    path: fixtures/nih-export/guide.csv
"#;
    let file = SourceRegistryFile::from_yaml_str(yaml).expect("yaml");
    let registry = AdapterRegistry::from_sources(&file.sources, fetcher(), std::path::Path::new("."))
        .expect("registry");
    assert_eq!(registry.names(), vec!["nih-export"]);
}

#[tokio::test]
async fn nih_export_fixture_yields_canonical_records() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/nih-export/guide.csv");
    let adapter = CsvFileAdapter::new("nih-export", CsvExportKind::NihExport, path);
    let records = adapter.fetch().await.expect("fetch");
    assert_eq!(records.len(), 2);
    for record in &records {
        let c = rfam_core::canonicalize("nih-export", record).expect("canonical");
        assert_eq!(c.fields.agency.as_deref(), Some("NIH"));
        assert!(c.fields.close_date.is_some());
    }
}
