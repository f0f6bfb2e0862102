use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rfam_adapters::{AdapterError, AdapterRegistry, SourceAdapter, StaticAdapter};
use rfam_core::{
    CanonicalFields, EmbeddingSpace, Fingerprint, LiveFilter, Opportunity, OpportunityId,
};
use rfam_match::{
    Embedder, EmbeddingError, HashEmbedder, IndexError, MatchConfig, RankError, RankerConfig,
    Ranker, VectorIndex,
};
use rfam_storage::{MemoryOpportunityStore, OpportunityStore, StoreError, UpsertOutcome};
use rfam_sync::{
    AppContext, CoordinatorOptions, IndexMode, IngestionCoordinator, ParquetManifest,
    SourceStatus, SyncConfig, SyncError,
};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Notify;

struct ScriptedAdapter {
    name: String,
    records: Mutex<Vec<JsonValue>>,
}

impl ScriptedAdapter {
    fn new(name: &str, records: Vec<JsonValue>) -> Self {
        Self {
            name: name.to_string(),
            records: Mutex::new(records),
        }
    }

    fn replace(&self, records: Vec<JsonValue>) {
        *self.records.lock().unwrap() = records;
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<JsonValue>, AdapterError> {
        Ok(self.records.lock().unwrap().clone())
    }
}

struct FailingAdapter;

#[async_trait]
impl SourceAdapter for FailingAdapter {
    fn source_name(&self) -> &str {
        "broken"
    }

    async fn fetch(&self) -> Result<Vec<JsonValue>, AdapterError> {
        Err(AdapterError::Message("source unreachable".to_string()))
    }
}

/// Signals when fetching starts and waits for permission to return.
struct GatedAdapter {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl SourceAdapter for GatedAdapter {
    fn source_name(&self) -> &str {
        "gated"
    }

    async fn fetch(&self) -> Result<Vec<JsonValue>, AdapterError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(vec![health_equity("G-1")])
    }
}

/// Local embedder that refuses texts mentioning "flaky" while `failing` is set.
struct FlakyEmbedder {
    inner: HashEmbedder,
    failing: AtomicBool,
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn space(&self) -> &EmbeddingSpace {
        self.inner.space()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.failing.load(Ordering::SeqCst) && text.to_lowercase().contains("flaky") {
            return Err(EmbeddingError::Unavailable("rate limited".to_string()));
        }
        self.inner.embed(text).await
    }
}

/// Memory store that reports itself as durable, standing in for Postgres.
struct DurableStore(Arc<MemoryOpportunityStore>);

#[async_trait]
impl OpportunityStore for DurableStore {
    fn is_durable(&self) -> bool {
        true
    }

    async fn upsert(
        &self,
        fields: CanonicalFields,
        fingerprint: Fingerprint,
    ) -> Result<UpsertOutcome, StoreError> {
        self.0.upsert(fields, fingerprint).await
    }

    async fn list_live(&self, filter: &LiveFilter) -> Result<Vec<Opportunity>, StoreError> {
        self.0.list_live(filter).await
    }

    async fn get_many(&self, ids: &[OpportunityId]) -> Result<Vec<Opportunity>, StoreError> {
        self.0.get_many(ids).await
    }

    async fn set_embedding_pending(
        &self,
        id: OpportunityId,
        pending: bool,
    ) -> Result<(), StoreError> {
        self.0.set_embedding_pending(id, pending).await
    }

    async fn list_embedding_pending(&self) -> Result<Vec<Opportunity>, StoreError> {
        self.0.list_embedding_pending().await
    }
}

fn health_equity(native_id: &str) -> JsonValue {
    json!({
        "id": native_id,
        "title": "Health Equity Grant",
        "agency": "RWJF",
        "summary": "funds community health research",
        "posted_date": "2024-01-10"
    })
}

fn pediatric() -> JsonValue {
    json!({
        "opportunity_number": "NCI-1",
        "title": "Pediatric Oncology Research Funding",
        "agency": "National Cancer Institute",
        "summary": "pediatric oncology research funding for childhood cancer studies"
    })
}

fn highway() -> JsonValue {
    json!({
        "opportunity_number": "DOT-1",
        "title": "Highway Infrastructure Grants",
        "agency": "Department of Transportation",
        "summary": "highway infrastructure grants for bridges and roads"
    })
}

fn embedder(model: &str, dimensions: usize) -> Arc<HashEmbedder> {
    Arc::new(HashEmbedder::new(model, dimensions, 4000))
}

struct Harness {
    store: Arc<MemoryOpportunityStore>,
    index: Arc<VectorIndex>,
    coordinator: Arc<IngestionCoordinator>,
}

fn harness(adapters: Vec<Arc<dyn SourceAdapter>>, embedder: Arc<dyn Embedder>) -> Harness {
    harness_with(adapters, embedder, CoordinatorOptions {
        full_rebuild_every: 0,
        ..CoordinatorOptions::default()
    })
}

fn harness_with(
    adapters: Vec<Arc<dyn SourceAdapter>>,
    embedder: Arc<dyn Embedder>,
    options: CoordinatorOptions,
) -> Harness {
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter).unwrap();
    }
    let store = Arc::new(MemoryOpportunityStore::new());
    let index = Arc::new(VectorIndex::new(embedder.space().clone()));
    let coordinator = Arc::new(IngestionCoordinator::new(
        registry,
        store.clone(),
        index.clone(),
        embedder,
        options,
    ));
    Harness {
        store,
        index,
        coordinator,
    }
}

#[tokio::test]
async fn identical_content_from_two_sources_is_stored_once() {
    let h = harness(
        vec![
            Arc::new(StaticAdapter::new("source-a", vec![health_equity("A-1")])),
            Arc::new(StaticAdapter::new("source-b", vec![health_equity("B-77")])),
        ],
        embedder("hash-test", 128),
    );

    let first = h.coordinator.run_all().await.unwrap();
    assert_eq!(h.store.len().await, 1);
    assert_eq!(first.total_new(), 1);
    let unchanged: usize = first.sources.iter().map(|s| s.unchanged).sum();
    assert_eq!(unchanged, 1);
    assert_eq!(h.index.len(), 1);

    let second = h.coordinator.run_all().await.unwrap();
    assert_eq!(second.total_new(), 0);
    assert!(second.sources.iter().all(|s| s.unchanged == 1));
    assert_eq!(second.index.mode, IndexMode::Incremental);
    assert_eq!(second.index.embedded, 0);
    assert_eq!(h.store.len().await, 1);
}

#[tokio::test]
async fn pediatric_profile_ranks_oncology_above_highways() {
    let embedder = embedder("hash-test", 384);
    let h = harness(
        vec![Arc::new(StaticAdapter::new("demo", vec![highway(), pediatric()]))],
        embedder.clone(),
    );
    h.coordinator.run_all().await.unwrap();

    let ranker = Ranker::new(
        h.store.clone(),
        h.index.clone(),
        embedder,
        None,
        RankerConfig::default(),
    );
    let top = ranker
        .rank("I study pediatric cancer genomics", 1, false)
        .await
        .unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].opportunity.fields.title, "Pediatric Oncology Research Funding");
    assert_eq!(top[0].rank, 1);

    let both = ranker
        .rank("I study pediatric cancer genomics", 2, false)
        .await
        .unwrap();
    assert_eq!(both[1].opportunity.fields.title, "Highway Infrastructure Grants");
    assert!(both[0].vector_score > both[1].vector_score);
    assert!(both.iter().all(|r| (0.0..=1.0).contains(&r.vector_score)));
    assert!(both.iter().all(|r| r.final_score == r.vector_score));
}

#[tokio::test]
async fn failing_adapter_does_not_block_other_sources() {
    let h = harness(
        vec![
            Arc::new(FailingAdapter),
            Arc::new(StaticAdapter::new("good", vec![pediatric(), highway()])),
        ],
        embedder("hash-test", 128),
    );

    let summary = h.coordinator.run_all().await.unwrap();
    assert_eq!(summary.failed_sources(), vec!["broken"]);
    let broken = summary.source("broken").unwrap();
    assert!(broken.error.as_deref().unwrap().contains("source unreachable"));
    assert_eq!(summary.source("good").unwrap().new, 2);
    assert_eq!(h.index.len(), 2);
}

#[tokio::test]
async fn malformed_records_are_skipped() {
    let h = harness(
        vec![Arc::new(StaticAdapter::new(
            "mixed",
            vec![json!({ "summary": "no title here" }), json!("not a record"), pediatric()],
        ))],
        embedder("hash-test", 64),
    );

    let summary = h.coordinator.run_all().await.unwrap();
    let mixed = summary.source("mixed").unwrap();
    assert_eq!(mixed.fetched, 3);
    assert_eq!(mixed.malformed, 2);
    assert_eq!(mixed.new, 1);
    assert_eq!(summary.total_failed_records(), 2);
    assert_eq!(h.store.len().await, 1);
}

#[tokio::test]
async fn overlapping_runs_are_refused() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness(
        vec![Arc::new(GatedAdapter {
            started: started.clone(),
            release: release.clone(),
        })],
        embedder("hash-test", 64),
    );

    let coordinator = h.coordinator.clone();
    let first = tokio::spawn(async move { coordinator.run_all().await });
    started.notified().await;

    assert!(h.coordinator.is_running());
    assert!(matches!(h.coordinator.run_all().await, Err(SyncError::AlreadyRunning)));
    assert!(matches!(h.coordinator.reindex().await, Err(SyncError::AlreadyRunning)));

    release.notify_one();
    let summary = first.await.unwrap().unwrap();
    assert_eq!(summary.total_new(), 1);
    assert!(!h.coordinator.is_running());
}

#[tokio::test]
async fn cancellation_stops_at_record_boundary_and_keeps_the_index() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness(
        vec![Arc::new(GatedAdapter {
            started: started.clone(),
            release: release.clone(),
        })],
        embedder("hash-test", 64),
    );

    let coordinator = h.coordinator.clone();
    let run = tokio::spawn(async move { coordinator.run_all().await });
    started.notified().await;
    h.coordinator.cancel();
    release.notify_one();

    let summary = run.await.unwrap().unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.index.mode, IndexMode::Skipped);
    assert_eq!(summary.source("gated").unwrap().status, SourceStatus::Cancelled);
    assert!(h.index.is_empty());
}

#[tokio::test]
async fn switching_embedding_backend_rebuilds_in_the_new_space() {
    let store = Arc::new(MemoryOpportunityStore::new());
    let old = embedder("hash-a", 64);
    let index = Arc::new(VectorIndex::new(old.space().clone()));
    let registry = || {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Arc::new(StaticAdapter::new("demo", vec![pediatric(), highway()])))
            .unwrap();
        registry
    };

    IngestionCoordinator::new(registry(), store.clone(), index.clone(), old, CoordinatorOptions::default())
        .run_all()
        .await
        .unwrap();
    assert_eq!(index.space().dimensions, 64);

    let new = embedder("hash-b", 32);
    let query = new.embed("pediatric oncology").await.unwrap();
    let summary = IngestionCoordinator::new(
        registry(),
        store.clone(),
        index.clone(),
        new.clone(),
        CoordinatorOptions::default(),
    )
    .run_all()
    .await
    .unwrap();

    assert_eq!(summary.index.mode, IndexMode::Full);
    assert_eq!(index.space(), *new.space());
    assert_eq!(index.len(), 2);
    assert_eq!(index.query(&query, 2, None).unwrap().len(), 2);
    assert!(matches!(
        index.query(&vec![0.5; 64], 2, None),
        Err(IndexError::DimensionMismatch { .. })
    ));
}

#[tokio::test]
async fn failed_embeddings_are_retried_on_the_next_run() {
    let flaky = Arc::new(FlakyEmbedder {
        inner: HashEmbedder::new("hash-test", 64, 4000),
        failing: AtomicBool::new(true),
    });
    let flaky_record = json!({ "id": "F-1", "title": "Flaky Upstream Grant", "summary": "x" });
    let h = harness(
        vec![Arc::new(StaticAdapter::new("demo", vec![pediatric(), flaky_record]))],
        flaky.clone(),
    );

    let first = h.coordinator.run_all().await.unwrap();
    assert_eq!(first.index.pending, 1);
    assert_eq!(h.index.len(), 1);
    assert_eq!(h.store.list_embedding_pending().await.unwrap().len(), 1);

    flaky.failing.store(false, Ordering::SeqCst);
    let second = h.coordinator.run_all().await.unwrap();
    assert_eq!(second.index.mode, IndexMode::Incremental);
    assert_eq!(second.index.embedded, 1);
    assert_eq!(second.index.pending, 0);
    assert_eq!(h.index.len(), 2);
    assert!(h.store.list_embedding_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn content_update_replaces_the_indexed_vector() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "nih",
        vec![json!({ "opportunity_number": "R-1", "title": "Original Title", "summary": "first" })],
    ));
    let h = harness(vec![adapter.clone()], embedder("hash-test", 64));

    h.coordinator.run_all().await.unwrap();
    let old_id = h.index.ids()[0];

    adapter.replace(vec![
        json!({ "opportunity_number": "R-1", "title": "Revised Title", "summary": "second" }),
    ]);
    let summary = h.coordinator.run_all().await.unwrap();
    assert_eq!(summary.source("nih").unwrap().updated, 1);
    assert_eq!(summary.index.removed, 1);
    assert!(!h.index.contains(&old_id));
    assert_eq!(h.index.len(), 1);

    let live = h.store.list_live(&LiveFilter::default()).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].fields.title, "Revised Title");
    assert!(h.index.contains(&live[0].id));
}

#[tokio::test]
async fn run_writes_reports_index_and_raw_payloads() {
    let tmp = tempfile::tempdir().unwrap();
    let options = CoordinatorOptions {
        data_dir: Some(tmp.path().join("data")),
        reports_dir: Some(tmp.path().join("reports")),
        artifacts_dir: Some(tmp.path().join("artifacts")),
        ..CoordinatorOptions::default()
    };
    let h = harness_with(
        vec![Arc::new(StaticAdapter::new("demo", vec![pediatric(), highway()]))],
        embedder("hash-test", 64),
        options,
    );

    let summary = h.coordinator.run_all().await.unwrap();
    assert!(summary.index.persisted);

    let reports = std::path::PathBuf::from(summary.reports_dir.clone().unwrap());
    assert!(reports.join("run_summary.json").exists());
    let brief = std::fs::read_to_string(reports.join("run_brief.md")).unwrap();
    assert!(brief.starts_with("# RFA Matcher Run Brief"));
    assert!(brief.contains("- demo: fetched 2, new 2"));
    assert!(reports.join("snapshots/opportunities.parquet").exists());
    let manifest: ParquetManifest = serde_json::from_str(
        &std::fs::read_to_string(reports.join("snapshots/manifest.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest.files[0].path, "snapshots/opportunities.parquet");
    assert_eq!(manifest.files[0].sha256.len(), 64);

    let (index_manifest, loaded) = VectorIndex::load(&tmp.path().join("data"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(index_manifest.count, 2);
    assert_eq!(loaded.ids(), h.index.ids());

    let day_dirs: Vec<_> = std::fs::read_dir(tmp.path().join("artifacts")).unwrap().collect();
    assert_eq!(day_dirs.len(), 1);
}

#[tokio::test]
async fn reindex_rebuilds_from_live_records() {
    let h = harness(
        vec![Arc::new(StaticAdapter::new("demo", vec![pediatric(), highway()]))],
        embedder("hash-test", 64),
    );
    h.coordinator.run_all().await.unwrap();
    h.index.remove(&h.index.ids()[0]);
    assert_eq!(h.index.len(), 1);

    let report = h.coordinator.reindex().await.unwrap();
    assert_eq!(report.mode, IndexMode::Full);
    assert_eq!(report.embedded, 2);
    assert_eq!(report.size, 2);
    assert!(!report.persisted);
}

#[tokio::test]
async fn record_superseded_later_in_the_same_run_is_not_indexed() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "nih",
        vec![
            json!({ "opportunity_number": "R-1", "title": "Draft Notice", "summary": "first cut" }),
            json!({ "opportunity_number": "R-1", "title": "Final Notice", "summary": "second cut" }),
        ],
    ));
    let h = harness(vec![adapter.clone()], embedder("hash-test", 64));

    for _ in 0..3 {
        h.coordinator.run_all().await.unwrap();
        let live = h.store.list_live(&LiveFilter::default()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].fields.title, "Final Notice");
        assert_eq!(h.index.ids(), vec![live[0].id]);
    }

    let summary = h.coordinator.last_run().await.unwrap();
    assert_eq!(summary.index.mode, IndexMode::Incremental);
    assert_eq!(summary.index.embedded, 1);
    assert_eq!(summary.index.size, 1);
}

#[tokio::test]
async fn periodic_full_rebuild_follows_the_configured_cadence() {
    let h = harness_with(
        vec![Arc::new(StaticAdapter::new("demo", vec![pediatric(), highway()]))],
        embedder("hash-test", 64),
        CoordinatorOptions {
            full_rebuild_every: 3,
            ..CoordinatorOptions::default()
        },
    );

    let mut modes = Vec::new();
    for _ in 0..6 {
        let summary = h.coordinator.run_all().await.unwrap();
        assert_eq!(summary.index.size, 2);
        modes.push(summary.index.mode);
    }
    assert_eq!(
        modes,
        vec![
            IndexMode::Full,
            IndexMode::Incremental,
            IndexMode::Full,
            IndexMode::Incremental,
            IndexMode::Incremental,
            IndexMode::Full,
        ]
    );
}

#[tokio::test]
async fn single_adapter_run_is_recorded_as_last_run() {
    let h = harness(
        vec![Arc::new(StaticAdapter::new("demo", vec![pediatric()]))],
        embedder("hash-test", 64),
    );
    assert!(h.coordinator.last_run().await.is_none());

    let upload = Arc::new(StaticAdapter::new("upload", vec![highway()]));
    let summary = h.coordinator.run_adapter(upload).await.unwrap();
    assert_eq!(summary.sources.len(), 1);
    assert_eq!(summary.source("upload").unwrap().new, 1);
    assert_eq!(h.index.len(), 1);
    assert_eq!(h.coordinator.last_run().await.unwrap().run_id, summary.run_id);
}

#[tokio::test]
async fn persisted_index_is_only_reused_next_to_a_durable_store() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().to_string_lossy().to_string();
    let data_dir = tmp.path().join("data").to_string_lossy().to_string();
    let config = || {
        SyncConfig::from_lookup(|name| match name {
            "RFAM_WORKSPACE_ROOT" => Some(root.clone()),
            "RFAM_DATA_DIR" => Some(data_dir.clone()),
            _ => None,
        })
        .unwrap()
    };
    let registry = || {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Arc::new(StaticAdapter::new("demo", vec![pediatric(), highway()])))
            .unwrap();
        registry
    };

    let records = Arc::new(MemoryOpportunityStore::new());
    let durable: Arc<dyn OpportunityStore> = Arc::new(DurableStore(records.clone()));
    let first = AppContext::build(config(), MatchConfig::default(), durable, registry())
        .await
        .unwrap();
    let summary = first.coordinator.run_all().await.unwrap();
    assert!(summary.index.persisted);

    // A fresh in-memory store has no records, so the saved vectors are not loaded.
    let fresh = AppContext::build(
        config(),
        MatchConfig::default(),
        Arc::new(MemoryOpportunityStore::new()),
        registry(),
    )
    .await
    .unwrap();
    assert!(fresh.index.is_empty());
    let err = fresh.ranker.rank("pediatric oncology", 5, false).await.unwrap_err();
    assert!(matches!(err, RankError::EmptyIndex));

    let reopened = AppContext::build(
        config(),
        MatchConfig::default(),
        Arc::new(DurableStore(records)),
        registry(),
    )
    .await
    .unwrap();
    assert_eq!(reopened.index.len(), 2);
    let results = reopened.ranker.rank("pediatric oncology", 1, false).await.unwrap();
    assert_eq!(results[0].opportunity.fields.title, "Pediatric Oncology Research Funding");

    // A durable store that lost its rows must not answer with an empty list.
    let emptied = AppContext::build(
        config(),
        MatchConfig::default(),
        Arc::new(DurableStore(Arc::new(MemoryOpportunityStore::new()))),
        registry(),
    )
    .await
    .unwrap();
    assert_eq!(emptied.index.len(), 2);
    let err = emptied.ranker.rank("pediatric oncology", 5, false).await.unwrap_err();
    assert!(matches!(err, RankError::IndexOutOfSync { recalled: 2 }));
}
