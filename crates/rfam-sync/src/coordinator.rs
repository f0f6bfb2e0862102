use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rfam_adapters::{AdapterRegistry, SourceAdapter};
use rfam_core::{
    canonicalize, EmbeddingSpace, EmbeddingVector, LiveFilter, Opportunity, OpportunityId,
};
use rfam_match::{Embedder, IndexBuilder, VectorIndex};
use rfam_storage::{ArtifactStore, OpportunityStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reports::write_run_reports;
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Adapters fetching at the same time.
    pub concurrency: usize,
    /// Full rebuild every N runs; 0 disables the periodic rebuild.
    pub full_rebuild_every: usize,
    pub data_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            full_rebuild_every: 12,
            data_dir: None,
            reports_dir: None,
            artifacts_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Per-source counts for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source_name: String,
    pub status: SourceStatus,
    pub fetched: usize,
    /// Fingerprints seen for the first time.
    pub new: usize,
    /// New fingerprints that replaced an earlier version from the same source record.
    pub updated: usize,
    pub unchanged: usize,
    pub reactivated: usize,
    pub malformed: usize,
    pub failed: usize,
    pub error: Option<String>,
}

impl SourceSummary {
    fn new(source_name: &str) -> Self {
        Self {
            source_name: source_name.to_string(),
            status: SourceStatus::Completed,
            fetched: 0,
            new: 0,
            updated: 0,
            unchanged: 0,
            reactivated: 0,
            malformed: 0,
            failed: 0,
            error: None,
        }
    }

    fn failed(source_name: &str, error: String) -> Self {
        Self {
            status: SourceStatus::Failed,
            error: Some(error),
            ..Self::new(source_name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    Full,
    Incremental,
    /// Cancelled before the index was touched.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexReport {
    pub mode: IndexMode,
    pub space: EmbeddingSpace,
    pub embedded: usize,
    pub removed: usize,
    /// Records whose embedding failed and will be retried next run.
    pub pending: usize,
    pub size: usize,
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceSummary>,
    pub index: IndexReport,
    pub cancelled: bool,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    pub fn total_new(&self) -> usize {
        self.sources.iter().map(|s| s.new).sum()
    }

    pub fn total_updated(&self) -> usize {
        self.sources.iter().map(|s| s.updated).sum()
    }

    pub fn total_failed_records(&self) -> usize {
        self.sources.iter().map(|s| s.failed + s.malformed).sum()
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| s.status == SourceStatus::Failed)
            .map(|s| s.source_name.as_str())
            .collect()
    }

    pub fn source(&self, name: &str) -> Option<&SourceSummary> {
        self.sources.iter().find(|s| s.source_name == name)
    }
}

/// Changes one source produced that the index must follow.
#[derive(Debug, Default)]
struct SourceChanges {
    to_embed: Vec<Opportunity>,
    superseded: Vec<OpportunityId>,
}

#[derive(Debug, Default)]
struct RunState {
    runs_completed: usize,
}

/// Drives all registered adapters through canonicalization, the store and the
/// vector index. At most one run or reindex is active at a time.
pub struct IngestionCoordinator {
    registry: AdapterRegistry,
    store: Arc<dyn OpportunityStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    artifacts: Option<Arc<ArtifactStore>>,
    options: CoordinatorOptions,
    state: Mutex<RunState>,
    last_run: RwLock<Option<RunSummary>>,
    cancel: Arc<AtomicBool>,
}

impl IngestionCoordinator {
    pub fn new(
        registry: AdapterRegistry,
        store: Arc<dyn OpportunityStore>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        options: CoordinatorOptions,
    ) -> Self {
        let artifacts = options
            .artifacts_dir
            .clone()
            .map(|dir| Arc::new(ArtifactStore::new(dir)));
        Self {
            registry,
            store,
            index,
            embedder,
            artifacts,
            options,
            state: Mutex::new(RunState::default()),
            last_run: RwLock::new(None),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn index(&self) -> Arc<VectorIndex> {
        Arc::clone(&self.index)
    }

    pub fn is_running(&self) -> bool {
        self.state.try_lock().is_err()
    }

    /// Ask the active run to stop at the next record boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Summary of the most recent completed run, if any.
    pub async fn last_run(&self) -> Option<RunSummary> {
        self.last_run.read().await.clone()
    }

    /// One ingestion pass over every adapter. Adapter failures are reported in
    /// the summary; storage outages and index inconsistencies abort the run.
    pub async fn run_all(&self) -> Result<RunSummary, SyncError> {
        let adapters: Vec<_> = self.registry.adapters().cloned().collect();
        self.run_guarded(adapters).await
    }

    /// The same pass over a single ad-hoc adapter, such as an uploaded export.
    /// It shares the run guard and index maintenance with `run_all`.
    pub async fn run_adapter(
        &self,
        adapter: Arc<dyn SourceAdapter>,
    ) -> Result<RunSummary, SyncError> {
        self.run_guarded(vec![adapter]).await
    }

    async fn run_guarded(
        &self,
        adapters: Vec<Arc<dyn SourceAdapter>>,
    ) -> Result<RunSummary, SyncError> {
        let mut state = self.state.try_lock().map_err(|_| SyncError::AlreadyRunning)?;
        self.cancel.store(false, Ordering::SeqCst);

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("ingestion_run", %run_id);
        let result = self
            .run_locked(adapters, run_id, started_at, state.runs_completed)
            .instrument(span)
            .await;
        if let Ok(summary) = &result {
            state.runs_completed += 1;
            *self.last_run.write().await = Some(summary.clone());
        }
        result
    }

    /// Full re-embed of every live record into a fresh snapshot.
    pub async fn reindex(&self) -> Result<IndexReport, SyncError> {
        let _state = self.state.try_lock().map_err(|_| SyncError::AlreadyRunning)?;
        self.cancel.store(false, Ordering::SeqCst);
        let mut report = self.full_rebuild().instrument(info_span!("reindex")).await?;
        report.persisted = self.persist_index().await;
        Ok(report)
    }

    async fn run_locked(
        &self,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        runs_completed: usize,
    ) -> Result<RunSummary, SyncError> {
        info!(sources = adapters.len(), "ingestion run started");
        let (sources, changes) = self.ingest_sources(adapters).await?;
        let cancelled = self.cancel.load(Ordering::SeqCst);

        let full = runs_completed == 0
            || self.index.space() != *self.embedder.space()
            || (self.options.full_rebuild_every > 0
                && (runs_completed + 1) % self.options.full_rebuild_every == 0);

        let mut index = if cancelled {
            self.skipped_report()
        } else if full {
            self.full_rebuild().await?
        } else {
            self.apply_incremental(changes).await?
        };
        if index.mode != IndexMode::Skipped {
            index.persisted = self.persist_index().await;
        }

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources,
            index,
            cancelled: cancelled || self.cancel.load(Ordering::SeqCst),
            reports_dir: None,
        };

        if let Some(root) = &self.options.reports_dir {
            let live = self.store.list_live(&LiveFilter::default()).await?;
            match write_run_reports(root, &summary, &live).await {
                Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
                Err(err) => warn!(error = %err, "writing run reports failed"),
            }
        }

        info!(
            new = summary.total_new(),
            updated = summary.total_updated(),
            failed_sources = summary.failed_sources().len(),
            index_mode = ?summary.index.mode,
            index_size = summary.index.size,
            "ingestion run finished"
        );
        Ok(summary)
    }

    async fn ingest_sources(
        &self,
        adapters: Vec<Arc<dyn SourceAdapter>>,
    ) -> Result<(Vec<SourceSummary>, SourceChanges), SyncError> {
        let limit = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();

        for adapter in adapters {
            let name = adapter.source_name().to_string();
            let store = Arc::clone(&self.store);
            let artifacts = self.artifacts.clone();
            let cancel = Arc::clone(&self.cancel);
            let limit = Arc::clone(&limit);
            let span = info_span!("ingest_source", source = %name);
            let handle = tasks.spawn(
                async move {
                    let _permit = limit.acquire_owned().await.ok();
                    ingest_source(adapter, store, artifacts, cancel).await
                }
                .instrument(span),
            );
            names.insert(handle.id(), name);
        }

        let mut summaries = Vec::new();
        let mut changes = SourceChanges::default();
        let mut fatal = None;
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok((summary, source_changes)))) => {
                    summaries.push(summary);
                    changes.to_embed.extend(source_changes.to_embed);
                    changes.superseded.extend(source_changes.superseded);
                }
                Ok((id, Err(err))) => {
                    let name = names.get(&id).cloned().unwrap_or_default();
                    error!(source = %name, error = %err, "store unavailable during ingestion");
                    summaries.push(SourceSummary::failed(&name, err.to_string()));
                    if fatal.is_none() {
                        fatal = Some(err);
                        self.cancel();
                    }
                }
                Err(join_err) => {
                    let name = names.get(&join_err.id()).cloned().unwrap_or_default();
                    warn!(source = %name, error = %join_err, "source task aborted");
                    summaries.push(SourceSummary::failed(&name, join_err.to_string()));
                }
            }
        }
        if let Some(err) = fatal {
            return Err(err.into());
        }
        summaries.sort_by(|a, b| a.source_name.cmp(&b.source_name));
        Ok((summaries, changes))
    }

    fn skipped_report(&self) -> IndexReport {
        IndexReport {
            mode: IndexMode::Skipped,
            space: self.index.space(),
            embedded: 0,
            removed: 0,
            pending: 0,
            size: self.index.len(),
            persisted: false,
        }
    }

    async fn full_rebuild(&self) -> Result<IndexReport, SyncError> {
        let space = self.embedder.space().clone();
        let live = self.store.list_live(&LiveFilter::default()).await?;
        info!(records = live.len(), %space, "full index rebuild started");

        let mut builder = IndexBuilder::new(space.clone());
        let mut pending = 0;
        for chunk in live.chunks(EMBED_CHUNK) {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("full rebuild cancelled; keeping the previous snapshot");
                return Ok(self.skipped_report());
            }
            let (vectors, failed) = self.embed_opportunities(chunk).await;
            for vector in vectors {
                builder.push(vector.opportunity_id, vector.values)?;
            }
            pending += self.record_embedding_outcomes(chunk, &failed).await?;
        }

        let live_ids: HashSet<OpportunityId> = live.iter().map(|o| o.id).collect();
        let removed = self
            .index
            .ids()
            .iter()
            .filter(|id| !live_ids.contains(*id))
            .count();
        let embedded = builder.len();
        let size = self.index.install(builder)?;
        Ok(IndexReport {
            mode: IndexMode::Full,
            space,
            embedded,
            removed,
            pending,
            size,
            persisted: false,
        })
    }

    async fn apply_incremental(&self, changes: SourceChanges) -> Result<IndexReport, SyncError> {
        let mut seen = HashSet::new();
        let mut candidates: Vec<OpportunityId> = changes
            .to_embed
            .iter()
            .map(|o| o.id)
            .filter(|id| seen.insert(*id))
            .collect();
        for retry in self.store.list_embedding_pending().await? {
            if seen.insert(retry.id) {
                candidates.push(retry.id);
            }
        }

        // Upsert outcomes are snapshots; a later record in the same run may have
        // re-pointed a source link and staled them, so read current state.
        let mut lookup = candidates.clone();
        lookup.extend(changes.superseded.iter().filter(|id| !seen.contains(*id)));
        let current = self.store.get_many(&lookup).await?;
        let live_now: HashSet<OpportunityId> =
            current.iter().filter(|o| o.is_live()).map(|o| o.id).collect();
        let to_embed: Vec<Opportunity> = current
            .into_iter()
            .filter(|o| o.is_live() && seen.contains(&o.id))
            .collect();

        let mut embedded = 0;
        let mut pending = 0;
        for chunk in to_embed.chunks(EMBED_CHUNK) {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("incremental index update cancelled");
                break;
            }
            let (vectors, failed) = self.embed_opportunities(chunk).await;
            for vector in vectors {
                self.index.upsert_one(vector.opportunity_id, vector.values)?;
                embedded += 1;
            }
            pending += self.record_embedding_outcomes(chunk, &failed).await?;
        }

        let mut removed = 0;
        for id in &changes.superseded {
            if !live_now.contains(id) && self.index.remove(id) {
                removed += 1;
            }
        }

        Ok(IndexReport {
            mode: IndexMode::Incremental,
            space: self.index.space(),
            embedded,
            removed,
            pending,
            size: self.index.len(),
            persisted: false,
        })
    }

    /// Embed a batch; on a batch failure fall back to one call per record so a
    /// single bad text does not hold back the rest.
    async fn embed_opportunities(
        &self,
        chunk: &[Opportunity],
    ) -> (Vec<EmbeddingVector>, HashSet<OpportunityId>) {
        let space = self.embedder.space().clone();
        let texts: Vec<String> = chunk.iter().map(Opportunity::embedding_text).collect();
        let generated_at = Utc::now();
        let wrap = |opportunity: &Opportunity, values: Vec<f32>| EmbeddingVector {
            opportunity_id: opportunity.id,
            space: space.clone(),
            values,
            generated_at,
        };

        match self.embedder.embed_batch(&texts).await {
            Ok(vectors) if vectors.len() == chunk.len() => {
                let vectors = chunk.iter().zip(vectors).map(|(o, v)| wrap(o, v)).collect();
                return (vectors, HashSet::new());
            }
            Ok(vectors) => warn!(
                expected = chunk.len(),
                actual = vectors.len(),
                "embedding batch returned the wrong number of vectors"
            ),
            Err(err) => warn!(error = %err, "embedding batch failed; retrying per record"),
        }

        let mut vectors = Vec::new();
        let mut failed = HashSet::new();
        for (opportunity, text) in chunk.iter().zip(&texts) {
            match self.embedder.embed(text).await {
                Ok(values) => vectors.push(wrap(opportunity, values)),
                Err(err) => {
                    warn!(id = %opportunity.id, error = %err, "embedding marked pending-retry");
                    failed.insert(opportunity.id);
                }
            }
        }
        (vectors, failed)
    }

    /// Sync the store's pending flags with this batch. Returns how many failed.
    async fn record_embedding_outcomes(
        &self,
        chunk: &[Opportunity],
        failed: &HashSet<OpportunityId>,
    ) -> Result<usize, StoreError> {
        for opportunity in chunk {
            let is_failed = failed.contains(&opportunity.id);
            if is_failed != opportunity.embedding_pending {
                self.store
                    .set_embedding_pending(opportunity.id, is_failed)
                    .await?;
            }
        }
        Ok(failed.len())
    }

    async fn persist_index(&self) -> bool {
        let Some(dir) = &self.options.data_dir else {
            return false;
        };
        match self.index.save(dir).await {
            Ok(manifest) => {
                info!(count = manifest.count, dir = %dir.display(), "vector index saved");
                true
            }
            Err(err) => {
                warn!(error = %err, "saving vector index failed");
                false
            }
        }
    }
}

const EMBED_CHUNK: usize = 64;

async fn ingest_source(
    adapter: Arc<dyn SourceAdapter>,
    store: Arc<dyn OpportunityStore>,
    artifacts: Option<Arc<ArtifactStore>>,
    cancel: Arc<AtomicBool>,
) -> Result<(SourceSummary, SourceChanges), StoreError> {
    let name = adapter.source_name().to_string();
    let mut summary = SourceSummary::new(&name);
    let mut changes = SourceChanges::default();

    let records = match adapter.fetch().await {
        Ok(records) => records,
        Err(err) => {
            warn!(source = %name, error = %err, "source adapter failed");
            return Ok((SourceSummary::failed(&name, err.to_string()), changes));
        }
    };
    summary.fetched = records.len();
    archive_payload(artifacts.as_deref(), &name, &records).await;

    for record in &records {
        if cancel.load(Ordering::SeqCst) {
            summary.status = SourceStatus::Cancelled;
            break;
        }
        let canonical = match canonicalize(&name, record) {
            Ok(canonical) => canonical,
            Err(err) => {
                warn!(source = %name, error = %err, "skipping malformed record");
                summary.malformed += 1;
                continue;
            }
        };
        let outcome = match store.upsert(canonical.fields, canonical.fingerprint).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_unavailable() => return Err(err),
            Err(err) => {
                warn!(source = %name, error = %err, "record upsert failed");
                summary.failed += 1;
                continue;
            }
        };

        if let Some(prior) = outcome.superseded {
            changes.superseded.push(prior);
        }
        match (outcome.is_new, outcome.superseded.is_some()) {
            (true, true) => summary.updated += 1,
            (true, false) => summary.new += 1,
            (false, _) if outcome.reactivated => summary.reactivated += 1,
            (false, _) => summary.unchanged += 1,
        }
        if outcome.needs_embedding() {
            changes.to_embed.push(outcome.opportunity);
        }
    }

    info!(
        source = %name,
        fetched = summary.fetched,
        new = summary.new,
        updated = summary.updated,
        malformed = summary.malformed,
        "source ingested"
    );
    Ok((summary, changes))
}

async fn archive_payload(artifacts: Option<&ArtifactStore>, source_name: &str, records: &[JsonValue]) {
    let Some(artifacts) = artifacts else {
        return;
    };
    let bytes = match serde_json::to_vec(records) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(source = %source_name, error = %err, "serializing raw payload failed");
            return;
        }
    };
    if let Err(err) = artifacts.store_bytes(Utc::now(), source_name, "json", &bytes).await {
        warn!(source = %source_name, error = %err, "archiving raw payload failed");
    }
}
