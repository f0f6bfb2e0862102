use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rfam_adapters::{CsvExportKind, CsvFileAdapter};
use rfam_core::LiveFilter;
use rfam_match::RankRequest;
use rfam_storage::{run_migrations, PgOpportunityStore};
use rfam_sync::{AppContext, RunSummary, SourceStatus, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rfam")]
#[command(about = "RFA Matcher: ingest funding opportunities and match them to research profiles")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over every enabled source.
    Sync,
    /// Ingest one downloaded export (nih_export, nsf_export or grants_export).
    IngestCsv {
        #[arg(long)]
        kind: CsvExportKind,
        /// Source name recorded on the links; defaults to the export kind.
        #[arg(long)]
        source: Option<String>,
        path: PathBuf,
    },
    /// Re-embed every live opportunity into a fresh index.
    Reindex,
    /// Rank live opportunities against a profile.
    Match {
        #[arg(long, conflicts_with = "profile_file")]
        profile: Option<String>,
        #[arg(long)]
        profile_file: Option<PathBuf>,
        #[arg(short, long, default_value_t = 10)]
        k: usize,
        #[arg(long)]
        rerank: bool,
        #[arg(long)]
        agency: Option<String>,
        #[arg(long)]
        mechanism: Option<String>,
        /// Only opportunities still open on this date (YYYY-MM-DD).
        #[arg(long)]
        open_after: Option<NaiveDate>,
        #[arg(long)]
        json: bool,
    },
    /// Serve the JSON API.
    Serve {
        #[arg(long, env = "RFAM_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let ctx = AppContext::from_env().await?;
            let summary = ctx.coordinator.run_all().await?;
            print_summary(&summary);
        }
        Commands::IngestCsv { kind, source, path } => {
            let ctx = AppContext::from_env().await?;
            let source = source.unwrap_or_else(|| kind.as_str().to_string());
            let adapter = Arc::new(CsvFileAdapter::new(&source, kind, path));
            let summary = ctx.coordinator.run_adapter(adapter).await?;
            print_summary(&summary);
        }
        Commands::Reindex => {
            let ctx = AppContext::from_env().await?;
            let report = ctx.coordinator.reindex().await?;
            println!(
                "reindex complete: {} vectors in {} ({} pending, persisted={})",
                report.size, report.space, report.pending, report.persisted
            );
        }
        Commands::Match {
            profile,
            profile_file,
            k,
            rerank,
            agency,
            mechanism,
            open_after,
            json,
        } => {
            let profile_text = match (profile, profile_file) {
                (Some(text), _) => text,
                (None, Some(path)) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => bail!("pass --profile TEXT or --profile-file PATH"),
            };

            let ctx = AppContext::from_env().await?;
            if ctx.config.database_url.is_none() && ctx.index.is_empty() {
                info!("in-memory store is empty; running ingestion before matching");
                ctx.coordinator.run_all().await?;
            }

            let request = RankRequest {
                profile_text,
                k,
                use_rerank: rerank,
                filter: LiveFilter {
                    agency,
                    mechanism,
                    open_after,
                    open_before: None,
                },
            };
            let results = ctx.ranker.rank_with(&request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                for r in &results {
                    let f = &r.opportunity.fields;
                    println!(
                        "{:>2}. [{:.3}] {} ({})",
                        r.rank,
                        r.final_score,
                        f.title,
                        f.agency.as_deref().unwrap_or("unknown agency")
                    );
                    if let Some(close) = f.close_date {
                        println!("    closes {close}");
                    }
                    if let Some(rationale) = &r.rationale {
                        println!("    {rationale}");
                    }
                }
            }
        }
        Commands::Serve { port } => {
            let ctx = AppContext::from_env().await?;
            rfam_web::serve(&ctx, port).await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let Some(url) = config.database_url else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgOpportunityStore::connect(&url).await?;
            run_migrations(store.pool()).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "sync complete: run_id={} new={} updated={} index={:?} size={} pending={}",
        summary.run_id,
        summary.total_new(),
        summary.total_updated(),
        summary.index.mode,
        summary.index.size,
        summary.index.pending
    );
    for source in &summary.sources {
        match source.status {
            SourceStatus::Failed => println!(
                "  {}: failed: {}",
                source.source_name,
                source.error.as_deref().unwrap_or("unknown error")
            ),
            _ => println!(
                "  {}: fetched={} new={} updated={} unchanged={} malformed={}",
                source.source_name,
                source.fetched,
                source.new,
                source.updated,
                source.unchanged,
                source.malformed
            ),
        }
    }
    if let Some(dir) = &summary.reports_dir {
        println!("  reports: {dir}");
    }
}
