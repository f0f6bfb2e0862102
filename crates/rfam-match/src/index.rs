//! Exact cosine k-NN over L2-normalized vectors.
//!
//! The live state is an `Arc<Snapshot>` behind a lock. Queries clone the `Arc`
//! and scan without holding the lock; rebuilds assemble a complete snapshot
//! off to the side and swap it in with one pointer write.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rfam_core::{EmbeddingSpace, OpportunityId};
use rfam_storage::{sha256_hex, write_atomic};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::embedder::l2_normalize;

pub const VECTORS_FILE: &str = "vectors.f32";
pub const IDS_FILE: &str = "ids.json";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndexError {
    #[error("index inconsistency: {ids} ids but {values} values at {dimensions} dimensions")]
    Inconsistency {
        ids: usize,
        values: usize,
        dimensions: usize,
    },
    #[error("vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("cannot index a zero or non-finite vector for {0}")]
    DegenerateVector(String),
    #[error("index persistence failed: {0}")]
    Persistence(String),
}

#[derive(Debug, Clone)]
struct Snapshot {
    space: EmbeddingSpace,
    ids: Vec<OpportunityId>,
    positions: HashMap<OpportunityId, usize>,
    values: Vec<f32>,
}

impl Snapshot {
    fn empty(space: EmbeddingSpace) -> Self {
        Self {
            space,
            ids: Vec::new(),
            positions: HashMap::new(),
            values: Vec::new(),
        }
    }

    fn row(&self, position: usize) -> &[f32] {
        let d = self.space.dimensions;
        &self.values[position * d..(position + 1) * d]
    }

    fn check_consistent(&self) -> Result<(), IndexError> {
        let d = self.space.dimensions;
        if d == 0 || self.ids.len() * d != self.values.len() || self.positions.len() != self.ids.len()
        {
            return Err(IndexError::Inconsistency {
                ids: self.ids.len(),
                values: self.values.len(),
                dimensions: d,
            });
        }
        Ok(())
    }
}

fn normalized(
    space: &EmbeddingSpace,
    id: &OpportunityId,
    mut vector: Vec<f32>,
) -> Result<Vec<f32>, IndexError> {
    if vector.len() != space.dimensions {
        return Err(IndexError::DimensionMismatch {
            expected: space.dimensions,
            actual: vector.len(),
        });
    }
    if !l2_normalize(&mut vector) {
        return Err(IndexError::DegenerateVector(id.to_string()));
    }
    Ok(vector)
}

/// Accumulates a complete replacement snapshot. Nothing is visible to readers
/// until [`VectorIndex::install`].
#[derive(Debug)]
pub struct IndexBuilder {
    snapshot: Snapshot,
}

impl IndexBuilder {
    pub fn new(space: EmbeddingSpace) -> Self {
        Self {
            snapshot: Snapshot::empty(space),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.ids.is_empty()
    }

    /// Add one entry; a repeated id replaces its earlier vector.
    pub fn push(&mut self, id: OpportunityId, vector: Vec<f32>) -> Result<(), IndexError> {
        let vector = normalized(&self.snapshot.space, &id, vector)?;
        let snap = &mut self.snapshot;
        match snap.positions.get(&id).copied() {
            Some(position) => {
                let d = snap.space.dimensions;
                snap.values[position * d..(position + 1) * d].copy_from_slice(&vector);
            }
            None => {
                snap.positions.insert(id, snap.ids.len());
                snap.ids.push(id);
                snap.values.extend_from_slice(&vector);
            }
        }
        Ok(())
    }

    /// Assemble from a parallel id list and flat row-major value array.
    pub fn from_parts(
        space: EmbeddingSpace,
        ids: Vec<OpportunityId>,
        values: Vec<f32>,
    ) -> Result<Self, IndexError> {
        let d = space.dimensions;
        if d == 0 || ids.len() * d != values.len() {
            return Err(IndexError::Inconsistency {
                ids: ids.len(),
                values: values.len(),
                dimensions: d,
            });
        }
        let mut builder = Self::new(space);
        for (id, row) in ids.into_iter().zip(values.chunks(d)) {
            builder.push(id, row.to_vec())?;
        }
        Ok(builder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub backend: String,
    pub model: String,
    pub dimensions: usize,
    pub count: usize,
    pub vectors_sha256: String,
    pub ids_sha256: String,
    pub written_at: DateTime<Utc>,
}

impl IndexManifest {
    pub fn space(&self) -> EmbeddingSpace {
        EmbeddingSpace {
            backend: self.backend.clone(),
            model: self.model.clone(),
            dimensions: self.dimensions,
        }
    }
}

#[derive(Debug)]
pub struct VectorIndex {
    current: RwLock<Arc<Snapshot>>,
}

impl VectorIndex {
    pub fn new(space: EmbeddingSpace) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::empty(space))),
        }
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn space(&self) -> EmbeddingSpace {
        self.snapshot().space.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &OpportunityId) -> bool {
        self.snapshot().positions.contains_key(id)
    }

    pub fn ids(&self) -> Vec<OpportunityId> {
        self.snapshot().ids.clone()
    }

    /// Replace the whole snapshot with `entries`. On any error the current
    /// snapshot stays in place.
    pub fn rebuild<I>(&self, space: EmbeddingSpace, entries: I) -> Result<usize, IndexError>
    where
        I: IntoIterator<Item = (OpportunityId, Vec<f32>)>,
    {
        let mut builder = IndexBuilder::new(space);
        for (id, vector) in entries {
            builder.push(id, vector)?;
        }
        self.install(builder)
    }

    /// Validate and atomically swap in a finished builder.
    pub fn install(&self, builder: IndexBuilder) -> Result<usize, IndexError> {
        let snapshot = builder.snapshot;
        snapshot.check_consistent()?;
        let count = snapshot.ids.len();
        let space = snapshot.space.clone();
        {
            let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
            *guard = Arc::new(snapshot);
        }
        info!(count, %space, "vector index snapshot installed");
        Ok(count)
    }

    pub fn upsert_one(&self, id: OpportunityId, vector: Vec<f32>) -> Result<(), IndexError> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let vector = normalized(&guard.space, &id, vector)?;
        // Copy-on-write: readers holding the old Arc keep their view.
        let snap = Arc::make_mut(&mut *guard);
        match snap.positions.get(&id).copied() {
            Some(position) => {
                let d = snap.space.dimensions;
                snap.values[position * d..(position + 1) * d].copy_from_slice(&vector);
            }
            None => {
                snap.positions.insert(id, snap.ids.len());
                snap.ids.push(id);
                snap.values.extend_from_slice(&vector);
            }
        }
        Ok(())
    }

    /// Drop `id` if present. Returns whether anything was removed.
    pub fn remove(&self, id: &OpportunityId) -> bool {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.positions.contains_key(id) {
            return false;
        }
        let snap = Arc::make_mut(&mut *guard);
        let Some(position) = snap.positions.remove(id) else {
            return false;
        };
        let d = snap.space.dimensions;
        let last = snap.ids.len() - 1;
        if position != last {
            let moved = snap.ids[last];
            snap.ids.swap(position, last);
            let (head, tail) = snap.values.split_at_mut(last * d);
            head[position * d..(position + 1) * d].copy_from_slice(&tail[..d]);
            snap.positions.insert(moved, position);
        }
        snap.ids.pop();
        snap.values.truncate(last * d);
        true
    }

    /// Up to `k` ids by descending cosine similarity, ties by ascending id.
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<(OpportunityId, f32)>, IndexError> {
        let snap = self.snapshot();
        if snap.ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query = normalized(&snap.space, &OpportunityId::nil(), vector.to_vec())
            .map_err(|err| match err {
                IndexError::DegenerateVector(_) => IndexError::DegenerateVector("query".to_string()),
                other => other,
            })?;

        let mut scored: Vec<(OpportunityId, f32)> = snap
            .ids
            .iter()
            .enumerate()
            .map(|(position, id)| {
                let dot: f32 = snap.row(position).iter().zip(&query).map(|(a, b)| a * b).sum();
                (*id, dot.clamp(-1.0, 1.0))
            })
            .filter(|(_, score)| min_score.map_or(true, |floor| *score >= floor))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    /// Persist as `vectors.f32`, `ids.json`, then `manifest.json`.
    pub async fn save(&self, dir: &Path) -> Result<IndexManifest, IndexError> {
        let snap = self.snapshot();
        let vector_bytes: Vec<u8> = snap.values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let id_bytes = serde_json::to_vec(&snap.ids)
            .map_err(|err| IndexError::Persistence(err.to_string()))?;

        let manifest = IndexManifest {
            backend: snap.space.backend.clone(),
            model: snap.space.model.clone(),
            dimensions: snap.space.dimensions,
            count: snap.ids.len(),
            vectors_sha256: sha256_hex(&vector_bytes),
            ids_sha256: sha256_hex(&id_bytes),
            written_at: Utc::now(),
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| IndexError::Persistence(err.to_string()))?;

        for (name, bytes) in [
            (VECTORS_FILE, &vector_bytes),
            (IDS_FILE, &id_bytes),
            (MANIFEST_FILE, &manifest_bytes),
        ] {
            write_atomic(&dir.join(name), bytes)
                .await
                .map_err(|err| IndexError::Persistence(format!("{name}: {err}")))?;
        }
        Ok(manifest)
    }

    /// Load a persisted index. `Ok(None)` when nothing has been saved yet.
    pub async fn load(dir: &Path) -> Result<Option<(IndexManifest, Self)>, IndexError> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest_bytes = match tokio::fs::read(&manifest_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(IndexError::Persistence(err.to_string())),
        };
        let manifest: IndexManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|err| IndexError::Persistence(format!("{MANIFEST_FILE}: {err}")))?;

        let read = |name: &'static str| async move {
            tokio::fs::read(dir.join(name))
                .await
                .map_err(|err| IndexError::Persistence(format!("{name}: {err}")))
        };
        let vector_bytes = read(VECTORS_FILE).await?;
        let id_bytes = read(IDS_FILE).await?;

        if sha256_hex(&vector_bytes) != manifest.vectors_sha256
            || sha256_hex(&id_bytes) != manifest.ids_sha256
        {
            return Err(IndexError::Persistence(
                "artifact hashes do not match manifest".to_string(),
            ));
        }

        let ids: Vec<OpportunityId> = serde_json::from_slice(&id_bytes)
            .map_err(|err| IndexError::Persistence(format!("{IDS_FILE}: {err}")))?;
        if vector_bytes.len() % 4 != 0 || ids.len() != manifest.count {
            return Err(IndexError::Inconsistency {
                ids: ids.len(),
                values: vector_bytes.len() / 4,
                dimensions: manifest.dimensions,
            });
        }
        let values: Vec<f32> = vector_bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let builder = IndexBuilder::from_parts(manifest.space(), ids, values)?;
        let index = Self::new(manifest.space());
        index.install(builder)?;
        Ok(Some((manifest, index)))
    }
}
