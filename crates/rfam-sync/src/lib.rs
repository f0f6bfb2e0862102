//! Ingestion orchestration: adapters through the store into the vector index,
//! plus process wiring shared by the CLI and the API server.

mod coordinator;
mod reports;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rfam_adapters::{AdapterRegistry, SourceRegistryFile};
use rfam_match::config::parse_flag;
use rfam_match::{
    build_embedder, Embedder, IndexError, LlmScorer, MatchConfig, Ranker, SecondaryScorer,
    VectorIndex,
};
use rfam_storage::{
    run_migrations, HttpClientConfig, HttpFetcher, MemoryOpportunityStore, OpportunityStore,
    PgOpportunityStore, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use coordinator::{
    CoordinatorOptions, IndexMode, IndexReport, IngestionCoordinator, RunSummary, SourceStatus,
    SourceSummary,
};
pub use reports::{run_brief, write_run_reports, ParquetManifest, ParquetManifestFile};

pub const CRATE_NAME: &str = "rfam-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("an ingestion run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("invalid sync configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub ingest_concurrency: usize,
    pub full_rebuild_every: usize,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let number = |name: &str, default: u64| -> Result<u64, SyncError> {
            match get(name) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| SyncError::Config(format!("{name}={raw} is not a number"))),
                None => Ok(default),
            }
        };

        let workspace_root = get("RFAM_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let ingest_concurrency = number("RFAM_INGEST_CONCURRENCY", 4)? as usize;
        if ingest_concurrency == 0 {
            return Err(SyncError::Config(
                "RFAM_INGEST_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            data_dir: get("RFAM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("data")),
            reports_dir: get("RFAM_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("reports")),
            artifacts_dir: get("RFAM_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("artifacts")),
            ingest_concurrency,
            full_rebuild_every: number("RFAM_FULL_REBUILD_EVERY", 12)? as usize,
            scheduler_enabled: parse_flag(get("RFAM_SCHEDULER_ENABLED")),
            sync_cron_1: get("RFAM_SYNC_CRON_1").unwrap_or_else(|| "0 0 12 * * *".to_string()),
            sync_cron_2: get("RFAM_SYNC_CRON_2").unwrap_or_else(|| "0 0 20 * * *".to_string()),
            user_agent: get("RFAM_USER_AGENT").unwrap_or_else(|| "rfam-bot/0.1".to_string()),
            http_timeout_secs: number("RFAM_HTTP_TIMEOUT_SECS", 30)?,
            workspace_root,
        })
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            concurrency: self.ingest_concurrency,
            full_rebuild_every: self.full_rebuild_every,
            data_dir: Some(self.data_dir.clone()),
            reports_dir: Some(self.reports_dir.clone()),
            artifacts_dir: Some(self.artifacts_dir.clone()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }
}

/// Everything a process needs to ingest and answer match queries.
pub struct AppContext {
    pub config: SyncConfig,
    pub match_config: MatchConfig,
    pub store: Arc<dyn OpportunityStore>,
    pub index: Arc<VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub ranker: Arc<Ranker>,
    pub coordinator: Arc<IngestionCoordinator>,
}

impl AppContext {
    pub async fn from_env() -> Result<Self> {
        let config = SyncConfig::from_env()?;
        let match_config = MatchConfig::from_env()?;
        let store = open_store(config.database_url.as_deref()).await?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let sources = SourceRegistryFile::load(&config.sources_path())
            .await
            .with_context(|| format!("loading {}", config.sources_path().display()))?;
        let registry = AdapterRegistry::from_sources(&sources.sources, http, &config.workspace_root)?;
        Self::build(config, match_config, store, registry).await
    }

    /// Wire components from explicit parts. A persisted index is reused only
    /// next to a durable store and when it was built in the configured
    /// embedding space; an in-memory store starts with an empty index.
    pub async fn build(
        config: SyncConfig,
        match_config: MatchConfig,
        store: Arc<dyn OpportunityStore>,
        registry: AdapterRegistry,
    ) -> Result<Self> {
        let embedder = build_embedder(&match_config.embedder)?;
        let scorer: Option<Arc<dyn SecondaryScorer>> = LlmScorer::from_config(&match_config.rerank)?
            .map(|scorer| Arc::new(scorer) as Arc<dyn SecondaryScorer>);
        if match_config.rerank.enabled && scorer.is_none() {
            warn!("re-ranking enabled without an API key; ranking by vector similarity only");
        }

        let index = if store.is_durable() {
            load_index(&config.data_dir, embedder.as_ref()).await
        } else {
            info!("in-memory store; ignoring any persisted vector index");
            VectorIndex::new(embedder.space().clone())
        };
        let index = Arc::new(index);
        let ranker = Arc::new(Ranker::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&embedder),
            scorer,
            match_config.ranker.clone(),
        ));
        let coordinator = Arc::new(IngestionCoordinator::new(
            registry,
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&embedder),
            config.coordinator_options(),
        ));
        info!(
            embedding_space = %embedder.space(),
            rerank = ranker.rerank_available(),
            sources = ?coordinator.registry().names(),
            "application context ready"
        );

        Ok(Self {
            config,
            match_config,
            store,
            index,
            embedder,
            ranker,
            coordinator,
        })
    }
}

/// Postgres when a URL is configured (migrations applied), otherwise in-memory.
pub async fn open_store(database_url: Option<&str>) -> Result<Arc<dyn OpportunityStore>> {
    match database_url {
        Some(url) => {
            let store = PgOpportunityStore::connect(url)
                .await
                .context("connecting to postgres")?;
            run_migrations(store.pool())
                .await
                .context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory opportunity store");
            Ok(Arc::new(MemoryOpportunityStore::new()))
        }
    }
}

async fn load_index(data_dir: &Path, embedder: &dyn Embedder) -> VectorIndex {
    let space = embedder.space().clone();
    match VectorIndex::load(data_dir).await {
        Ok(Some((manifest, index))) if manifest.space() == space => {
            info!(count = manifest.count, %space, "loaded persisted vector index");
            index
        }
        Ok(Some((manifest, _))) => {
            warn!(
                persisted = %manifest.space(),
                configured = %space,
                "persisted index belongs to another embedding space; ignoring it"
            );
            VectorIndex::new(space)
        }
        Ok(None) => VectorIndex::new(space),
        Err(err) => {
            warn!(error = %err, "persisted vector index is unusable; starting empty");
            VectorIndex::new(space)
        }
    }
}

/// Cron-driven `run_all` trigger together with the jobs it registered.
#[derive(Clone)]
pub struct IngestScheduler {
    scheduler: JobScheduler,
    jobs: Vec<(Uuid, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJobStatus {
    pub id: Uuid,
    pub cron: String,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub jobs: Vec<ScheduledJobStatus>,
    pub last_run: Option<RunSummary>,
}

impl SchedulerStatus {
    pub fn disabled(last_run: Option<RunSummary>) -> Self {
        Self {
            enabled: false,
            jobs: Vec::new(),
            last_run,
        }
    }
}

impl IngestScheduler {
    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await.context("starting scheduler")
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.scheduler.shutdown().await.context("stopping scheduler")
    }

    pub fn crons(&self) -> Vec<&str> {
        self.jobs.iter().map(|(_, cron)| cron.as_str()).collect()
    }

    /// Registered jobs with their next fire time; a lookup failure leaves
    /// `next_run` empty.
    pub async fn status(&self, last_run: Option<RunSummary>) -> SchedulerStatus {
        let mut scheduler = self.scheduler.clone();
        let mut jobs = Vec::with_capacity(self.jobs.len());
        for (id, cron) in &self.jobs {
            let next_run = match scheduler.next_tick_for_job(*id).await {
                Ok(next) => next,
                Err(err) => {
                    warn!(job = %id, error = ?err, "reading next scheduler tick failed");
                    None
                }
            };
            jobs.push(ScheduledJobStatus {
                id: *id,
                cron: cron.clone(),
                next_run,
            });
        }
        SchedulerStatus {
            enabled: true,
            jobs,
            last_run,
        }
    }
}

/// Build the cron trigger. `None` when the scheduler is disabled.
pub async fn build_scheduler(
    config: &SyncConfig,
    coordinator: Arc<IngestionCoordinator>,
) -> Result<Option<IngestScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let mut jobs = Vec::new();
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let coordinator = Arc::clone(&coordinator);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let coordinator = Arc::clone(&coordinator);
            Box::pin(async move {
                match coordinator.run_all().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled ingestion finished"),
                    Err(SyncError::AlreadyRunning) => {
                        warn!("scheduled ingestion skipped; a run is already in progress")
                    }
                    Err(err) => error!(error = %err, "scheduled ingestion failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        let id = scheduler.add(job).await.context("adding scheduler job")?;
        jobs.push((id, cron.clone()));
    }
    Ok(Some(IngestScheduler { scheduler, jobs }))
}
