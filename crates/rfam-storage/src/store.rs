use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rfam_core::{CanonicalFields, Fingerprint, LiveFilter, Opportunity, OpportunityId};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opportunity store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("could not decode stored opportunity: {0}")]
    Decode(String),
    /// Lost a concurrent insert on the same fingerprint; resolved internally.
    #[error("concurrent insert raced on fingerprint {0}")]
    DuplicateKeyRace(String),
    #[error("schema migration failed: {0}")]
    Migration(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result of one `upsert`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub opportunity: Opportunity,
    /// True only when this call created the fingerprint's record.
    pub is_new: bool,
    /// The fingerprint existed but was stale and is live again.
    pub reactivated: bool,
    /// A previously linked record this source no longer points at, now stale.
    pub superseded: Option<OpportunityId>,
}

impl UpsertOutcome {
    /// Whether the record's vector must be (re)computed.
    pub fn needs_embedding(&self) -> bool {
        self.is_new || self.reactivated || self.opportunity.embedding_pending
    }
}

/// Canonical opportunities keyed by fingerprint, with at most one live record
/// per fingerprint under concurrent writers.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Whether records outlive the process. A persisted vector index is only
    /// meaningful next to a durable store.
    fn is_durable(&self) -> bool {
        false
    }

    async fn upsert(
        &self,
        fields: CanonicalFields,
        fingerprint: Fingerprint,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Live records matching every supplied filter, ordered by creation then id.
    async fn list_live(&self, filter: &LiveFilter) -> Result<Vec<Opportunity>, StoreError>;

    /// Records for the given ids in any state; unknown ids are skipped.
    async fn get_many(&self, ids: &[OpportunityId]) -> Result<Vec<Opportunity>, StoreError>;

    async fn set_embedding_pending(
        &self,
        id: OpportunityId,
        pending: bool,
    ) -> Result<(), StoreError>;

    /// Live records whose last embedding attempt failed.
    async fn list_embedding_pending(&self) -> Result<Vec<Opportunity>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<OpportunityId, Opportunity>,
    by_fingerprint: HashMap<Fingerprint, OpportunityId>,
    links: HashMap<(String, String), OpportunityId>,
    clock: Option<DateTime<Utc>>,
}

impl MemoryState {
    /// Strictly increasing timestamps so creation order is total.
    fn tick(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.clock {
            if now <= last {
                now = last + chrono::Duration::microseconds(1);
            }
        }
        self.clock = Some(now);
        now
    }

    fn link_count(&self, id: OpportunityId) -> usize {
        self.links.values().filter(|linked| **linked == id).count()
    }
}

/// Process-local store used when no database is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryOpportunityStore {
    state: RwLock<MemoryState>,
}

impl MemoryOpportunityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn new_record(fields: CanonicalFields, fingerprint: Fingerprint, now: DateTime<Utc>) -> Opportunity {
    Opportunity {
        id: fingerprint.opportunity_id(),
        fingerprint,
        fields,
        stale: false,
        embedding_pending: false,
        last_seen_at: now,
        created_at: now,
        updated_at: now,
    }
}

fn sorted_by_creation(mut records: Vec<Opportunity>) -> Vec<Opportunity> {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    records
}

#[async_trait]
impl OpportunityStore for MemoryOpportunityStore {
    async fn upsert(
        &self,
        fields: CanonicalFields,
        fingerprint: Fingerprint,
    ) -> Result<UpsertOutcome, StoreError> {
        let link_key = fields
            .source_native_id
            .clone()
            .map(|native| (fields.source_name.clone(), native));

        // One write lock per upsert is the uniqueness guard here.
        let mut state = self.state.write().await;
        let now = state.tick();

        let existing = state.by_fingerprint.get(&fingerprint).copied();
        let (id, is_new, reactivated) = match existing {
            Some(id) => {
                let record = state
                    .records
                    .get_mut(&id)
                    .ok_or_else(|| StoreError::Decode(format!("dangling fingerprint {fingerprint}")))?;
                let reactivated = record.stale;
                record.stale = false;
                record.last_seen_at = now;
                if reactivated {
                    record.updated_at = now;
                }
                (id, false, reactivated)
            }
            None => {
                let record = new_record(fields, fingerprint.clone(), now);
                let id = record.id;
                state.by_fingerprint.insert(fingerprint, id);
                state.records.insert(id, record);
                (id, true, false)
            }
        };

        let mut superseded = None;
        if let Some(key) = link_key {
            let previous = state.links.insert(key, id);
            if let Some(previous) = previous.filter(|prev| *prev != id) {
                if state.link_count(previous) == 0 {
                    if let Some(old) = state.records.get_mut(&previous) {
                        if !old.stale {
                            old.stale = true;
                            old.updated_at = now;
                            superseded = Some(previous);
                        }
                    }
                }
            }
        }

        let opportunity = state
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::Decode(format!("missing record {id}")))?;

        Ok(UpsertOutcome {
            opportunity,
            is_new,
            reactivated,
            superseded,
        })
    }

    async fn list_live(&self, filter: &LiveFilter) -> Result<Vec<Opportunity>, StoreError> {
        let state = self.state.read().await;
        let live = state
            .records
            .values()
            .filter(|r| r.is_live() && filter.matches(r))
            .cloned()
            .collect();
        Ok(sorted_by_creation(live))
    }

    async fn get_many(&self, ids: &[OpportunityId]) -> Result<Vec<Opportunity>, StoreError> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect())
    }

    async fn set_embedding_pending(
        &self,
        id: OpportunityId,
        pending: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(record) = state.records.get_mut(&id) {
            record.embedding_pending = pending;
        }
        Ok(())
    }

    async fn list_embedding_pending(&self) -> Result<Vec<Opportunity>, StoreError> {
        let state = self.state.read().await;
        let pending = state
            .records
            .values()
            .filter(|r| r.is_live() && r.embedding_pending)
            .cloned()
            .collect();
        Ok(sorted_by_creation(pending))
    }
}
