//! JSON API over ranking, the live opportunity set and ingestion runs.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use rfam_adapters::{records_from_csv, CsvExportKind, StaticAdapter};
use rfam_core::{LiveFilter, MatchResult, Opportunity, RerankStatus};
use rfam_match::{RankError, RankRequest, Ranker, VectorIndex};
use rfam_storage::OpportunityStore;
use rfam_sync::{
    build_scheduler, AppContext, IngestScheduler, IngestionCoordinator, RunSummary,
    SchedulerStatus, SyncError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rfam-web";

const DEFAULT_K: usize = 10;
const MAX_K: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OpportunityStore>,
    pub index: Arc<VectorIndex>,
    pub ranker: Arc<Ranker>,
    pub coordinator: Arc<IngestionCoordinator>,
    pub scheduler: Option<IngestScheduler>,
}

impl AppState {
    pub fn from_context(ctx: &AppContext) -> Self {
        Self {
            store: Arc::clone(&ctx.store),
            index: Arc::clone(&ctx.index),
            ranker: Arc::clone(&ctx.ranker),
            coordinator: Arc::clone(&ctx.coordinator),
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Option<IngestScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/opportunities", get(opportunities_handler))
        .route("/match", post(match_handler))
        .route("/match/text", post(match_text_handler))
        .route("/match/reindex", post(reindex_handler))
        .route("/ingest/run", post(ingest_run_handler))
        .route("/ingest/csv", post(ingest_csv_handler))
        .route("/ingest/grants_csv", post(ingest_grants_csv_handler))
        .route("/scheduler/status", get(scheduler_status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(ctx: &AppContext, port: u16) -> anyhow::Result<()> {
    let scheduler = build_scheduler(&ctx.config, Arc::clone(&ctx.coordinator)).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
        info!("ingestion scheduler started");
    }

    let state = AppState::from_context(ctx).with_scheduler(scheduler.clone());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "rfam api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(mut scheduler) = scheduler {
        scheduler.shutdown().await?;
    }
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("RFAM_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let ctx = AppContext::from_env().await?;
    serve(&ctx, port).await
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<RankError> for ApiError {
    fn from(err: RankError) -> Self {
        let status = match &err {
            RankError::EmptyProfile => StatusCode::BAD_REQUEST,
            RankError::EmptyIndex
            | RankError::SpaceMismatch { .. }
            | RankError::IndexOutOfSync { .. } => StatusCode::CONFLICT,
            RankError::Embedding(_) => StatusCode::SERVICE_UNAVAILABLE,
            RankError::Storage(e) if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            RankError::Index(_) | RankError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::AlreadyRunning => StatusCode::CONFLICT,
            SyncError::Storage(e) if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "ingestion request failed");
        }
        Self::new(status, err.to_string())
    }
}

/// Plain view of an opportunity; raw payloads and store flags stay internal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpportunityView {
    pub id: Uuid,
    pub title: String,
    pub agency: Option<String>,
    pub mechanism: Option<String>,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub eligibility: Option<String>,
    pub keywords: Vec<String>,
    pub posted_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDate>,
    pub url: Option<String>,
    pub source_name: String,
}

impl From<&Opportunity> for OpportunityView {
    fn from(o: &Opportunity) -> Self {
        let f = &o.fields;
        Self {
            id: o.id,
            title: f.title.clone(),
            agency: f.agency.clone(),
            mechanism: f.mechanism.clone(),
            category: f.category.clone(),
            summary: f.summary.clone(),
            eligibility: f.eligibility.clone(),
            keywords: f.keywords.clone(),
            posted_date: f.posted_date,
            close_date: f.close_date,
            url: f.urls.landing.clone().or_else(|| f.urls.details.clone()),
            source_name: f.source_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchView {
    pub rank: usize,
    pub opportunity: OpportunityView,
    pub vector_score: f32,
    pub rerank_score: Option<u8>,
    pub rationale: Option<String>,
    pub rerank_status: RerankStatus,
    pub final_score: f32,
}

impl From<&MatchResult> for MatchView {
    fn from(r: &MatchResult) -> Self {
        Self {
            rank: r.rank,
            opportunity: OpportunityView::from(&r.opportunity),
            vector_score: r.vector_score,
            rerank_score: r.rerank_score,
            rationale: r.rationale.clone(),
            rerank_status: r.rerank_status,
            final_score: r.final_score,
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "index_size": state.index.len(),
        "embedding_space": state.index.space().to_string(),
        "rerank_available": state.ranker.rerank_available(),
        "ingestion_running": state.coordinator.is_running(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize, Default)]
struct OpportunitiesQuery {
    agency: Option<String>,
    mechanism: Option<String>,
    open_after: Option<NaiveDate>,
    open_before: Option<NaiveDate>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpportunitiesPage {
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
    pub opportunities: Vec<OpportunityView>,
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpportunitiesQuery>,
) -> Result<Json<OpportunitiesPage>, ApiError> {
    let filter = LiveFilter {
        agency: query.agency.clone(),
        mechanism: query.mechanism.clone(),
        open_after: query.open_after,
        open_before: query.open_before,
    };
    let live = state.store.list_live(&filter).await.map_err(|err| {
        let status = if err.is_unavailable() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        ApiError::new(status, err.to_string())
    })?;
    Ok(Json(paginate(&live, &query)))
}

fn paginate(all: &[Opportunity], query: &OpportunitiesQuery) -> OpportunitiesPage {
    let per_page = query.per_page.unwrap_or(20).clamp(1, 200);
    let total_pages = all.len().max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    OpportunitiesPage {
        total: all.len(),
        page,
        per_page,
        total_pages,
        opportunities: all
            .iter()
            .skip(start)
            .take(per_page)
            .map(OpportunityView::from)
            .collect(),
    }
}

#[derive(Debug, Deserialize)]
struct MatchBody {
    #[serde(alias = "profile")]
    profile_text: String,
    k: Option<usize>,
    #[serde(default)]
    use_rerank: bool,
    #[serde(default)]
    filter: LiveFilter,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MatchResponse {
    pub rerank_available: bool,
    pub results: Vec<MatchView>,
}

async fn match_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MatchBody>,
) -> Result<Json<MatchResponse>, ApiError> {
    let request = RankRequest {
        profile_text: body.profile_text,
        k: body.k.unwrap_or(DEFAULT_K).clamp(1, MAX_K),
        use_rerank: body.use_rerank,
        filter: body.filter,
    };
    run_match(&state, request).await
}

#[derive(Debug, Deserialize, Default)]
struct MatchTextQuery {
    k: Option<usize>,
    #[serde(default)]
    use_rerank: bool,
}

/// Profile uploaded as a plain-text document body.
async fn match_text_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MatchTextQuery>,
    profile_text: String,
) -> Result<Json<MatchResponse>, ApiError> {
    let request = RankRequest {
        profile_text,
        k: query.k.unwrap_or(DEFAULT_K).clamp(1, MAX_K),
        use_rerank: query.use_rerank,
        filter: LiveFilter::default(),
    };
    run_match(&state, request).await
}

async fn run_match(
    state: &AppState,
    request: RankRequest,
) -> Result<Json<MatchResponse>, ApiError> {
    let results = state.ranker.rank_with(&request).await.map_err(|err| {
        warn!(error = %err, "match request failed");
        ApiError::from(err)
    })?;
    Ok(Json(MatchResponse {
        rerank_available: state.ranker.rerank_available(),
        results: results.iter().map(MatchView::from).collect(),
    }))
}

async fn ingest_run_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let summary = state.coordinator.run_all().await?;
    Ok(Json(summary).into_response())
}

async fn reindex_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let report = state.coordinator.reindex().await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Deserialize, Default)]
struct CsvUploadQuery {
    source_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CsvUploadResponse {
    pub source: String,
    pub columns_seen: Vec<String>,
    pub summary: RunSummary,
}

/// NIH Guide or NSF export posted as the raw CSV body.
async fn ingest_csv_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CsvUploadQuery>,
    body: Bytes,
) -> Result<Json<CsvUploadResponse>, ApiError> {
    let kind = query
        .source_name
        .as_deref()
        .and_then(|name| name.parse::<CsvExportKind>().ok())
        .filter(|kind| *kind != CsvExportKind::GrantsExport)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "source_name must be one of: nih_export, nsf_export",
            )
        })?;
    ingest_export(&state, kind.as_str(), kind, &body).await
}

/// Grants.gov search export posted as the raw CSV body.
async fn ingest_grants_csv_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CsvUploadQuery>,
    body: Bytes,
) -> Result<Json<CsvUploadResponse>, ApiError> {
    let source_name = query
        .source_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| CsvExportKind::GrantsExport.as_str().to_string());
    ingest_export(&state, &source_name, CsvExportKind::GrantsExport, &body).await
}

async fn ingest_export(
    state: &AppState,
    source_name: &str,
    kind: CsvExportKind,
    body: &[u8],
) -> Result<Json<CsvUploadResponse>, ApiError> {
    let export = records_from_csv(kind, body)
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
    info!(source = source_name, rows = export.records.len(), "csv export received");
    let adapter = Arc::new(StaticAdapter::new(source_name, export.records));
    let summary = state.coordinator.run_adapter(adapter).await?;
    Ok(Json(CsvUploadResponse {
        source: source_name.to_string(),
        columns_seen: export.columns,
        summary,
    }))
}

async fn scheduler_status_handler(State(state): State<Arc<AppState>>) -> Json<SchedulerStatus> {
    let last_run = state.coordinator.last_run().await;
    let status = match &state.scheduler {
        Some(scheduler) => scheduler.status(last_run).await,
        None => SchedulerStatus::disabled(last_run),
    };
    Json(status)
}
