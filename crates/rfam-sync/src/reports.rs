use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use rfam_core::Opportunity;
use rfam_storage::sha256_hex;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::coordinator::{RunSummary, SourceStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `run_summary.json`, `run_brief.md` and the live-store Parquet
/// snapshot under `<root>/<run_id>/`. Returns the run's report directory.
pub async fn write_run_reports(
    root: &Path,
    summary: &RunSummary,
    live: &[Opportunity],
) -> Result<PathBuf> {
    let reports_dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    fs::write(reports_dir.join("run_brief.md"), run_brief(summary, live))
        .await
        .context("writing run_brief.md")?;

    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;
    let opportunities_path = snapshot_dir.join("opportunities.parquet");
    write_opportunities_parquet(&opportunities_path, live)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("opportunities", &reports_dir, &opportunities_path)?],
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(snapshot_dir.join("manifest.json"), bytes)
        .await
        .context("writing parquet manifest")?;

    Ok(reports_dir)
}

pub fn run_brief(summary: &RunSummary, live: &[Opportunity]) -> String {
    let mut by_agency: BTreeMap<&str, usize> = BTreeMap::new();
    for opportunity in live {
        let agency = opportunity.fields.agency.as_deref().unwrap_or("(unknown agency)");
        *by_agency.entry(agency).or_default() += 1;
    }

    let mut lines = vec![
        "# RFA Matcher Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Live opportunities: {}", live.len()),
        format!(
            "- Index: {:?} rebuild, {} embedded, {} pending, {} vectors in {}",
            summary.index.mode,
            summary.index.embedded,
            summary.index.pending,
            summary.index.size,
            summary.index.space
        ),
    ];
    if summary.cancelled {
        lines.push("- Run was cancelled before completion".to_string());
    }

    lines.push(String::new());
    lines.push("## Sources".to_string());
    for source in &summary.sources {
        let line = match source.status {
            SourceStatus::Failed => format!(
                "- {}: FAILED ({})",
                source.source_name,
                source.error.as_deref().unwrap_or("unknown error")
            ),
            _ => format!(
                "- {}: fetched {}, new {}, updated {}, unchanged {}, reactivated {}, malformed {}, failed {}",
                source.source_name,
                source.fetched,
                source.new,
                source.updated,
                source.unchanged,
                source.reactivated,
                source.malformed,
                source.failed
            ),
        };
        lines.push(line);
    }

    lines.push(String::new());
    lines.push("## Live Opportunities by Agency".to_string());
    lines.extend(by_agency.iter().map(|(agency, n)| format!("- {agency}: {n}")));
    lines.push(String::new());
    lines.join("\n")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_opportunities_parquet(path: &Path, live: &[Opportunity]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("fingerprint", DataType::Utf8, false),
        ArrowField::new("source_name", DataType::Utf8, false),
        ArrowField::new("source_native_id", DataType::Utf8, true),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("agency", DataType::Utf8, true),
        ArrowField::new("mechanism", DataType::Utf8, true),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("posted_date", DataType::Utf8, true),
        ArrowField::new("close_date", DataType::Utf8, true),
        ArrowField::new("landing_url", DataType::Utf8, true),
        ArrowField::new("embedding_pending", DataType::Boolean, false),
        ArrowField::new("last_seen_at", DataType::Utf8, false),
    ]));

    let text = |f: fn(&Opportunity) -> Option<String>| {
        StringArray::from(live.iter().map(f).collect::<Vec<_>>())
    };
    let ids = text(|o| Some(o.id.to_string()));
    let fingerprints = text(|o| Some(o.fingerprint.to_string()));
    let sources = text(|o| Some(o.fields.source_name.clone()));
    let native_ids = text(|o| o.fields.source_native_id.clone());
    let titles = text(|o| Some(o.fields.title.clone()));
    let agencies = text(|o| o.fields.agency.clone());
    let mechanisms = text(|o| o.fields.mechanism.clone());
    let categories = text(|o| o.fields.category.clone());
    let posted = text(|o| o.fields.posted_date.map(|d| d.to_string()));
    let closes = text(|o| o.fields.close_date.map(|d| d.to_string()));
    let landing = text(|o| o.fields.urls.landing.clone());
    let pending = BooleanArray::from(live.iter().map(|o| o.embedding_pending).collect::<Vec<_>>());
    let seen = text(|o| Some(o.last_seen_at.to_rfc3339()));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(fingerprints),
            Arc::new(sources),
            Arc::new(native_ids),
            Arc::new(titles),
            Arc::new(agencies),
            Arc::new(mechanisms),
            Arc::new(categories),
            Arc::new(posted),
            Arc::new(closes),
            Arc::new(landing),
            Arc::new(pending),
            Arc::new(seen),
        ],
    )
    .context("building opportunities record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = sha256_hex(&bytes);
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
