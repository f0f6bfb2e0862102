//! Profile-to-opportunity ranking: vector recall, optional secondary scoring,
//! fixed blend.
//!
//! `final = w * rerank / 100 + (1 - w) * vector` for scored candidates, and
//! `final = vector` for everything else. Ties fall back to vector score, then id.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use rfam_core::{LiveFilter, MatchResult, Opportunity, RerankStatus};
use rfam_storage::{OpportunityStore, StoreError};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

use crate::config::RankerConfig;
use crate::embedder::{Embedder, EmbeddingError};
use crate::index::{IndexError, VectorIndex};
use crate::rerank::{RerankCandidate, SecondaryScorer};

const RERANK_MISSING_NOTE: &str =
    "Secondary score unavailable for this opportunity; ranked by vector similarity only.";

#[derive(Debug, Error)]
pub enum RankError {
    #[error("cannot rank: profile text is empty")]
    EmptyProfile,
    #[error("cannot rank: the vector index is empty")]
    EmptyIndex,
    #[error("cannot rank: index holds {index} vectors but the embedder produces {embedder}")]
    SpaceMismatch { index: String, embedder: String },
    #[error(
        "cannot rank: none of the {recalled} indexed candidates exist in the store; \
         reindex first"
    )]
    IndexOutOfSync { recalled: usize },
    #[error("cannot rank: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("cannot rank: {0}")]
    Index(#[from] IndexError),
    #[error("cannot rank: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankRequest {
    pub profile_text: String,
    pub k: usize,
    pub use_rerank: bool,
    /// Extra constraint applied to the recalled candidates.
    pub filter: LiveFilter,
}

pub struct Ranker {
    store: Arc<dyn OpportunityStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    scorer: Option<Arc<dyn SecondaryScorer>>,
    config: RankerConfig,
}

impl Ranker {
    pub fn new(
        store: Arc<dyn OpportunityStore>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        scorer: Option<Arc<dyn SecondaryScorer>>,
        config: RankerConfig,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            scorer,
            config,
        }
    }

    pub fn rerank_available(&self) -> bool {
        self.scorer.is_some()
    }

    pub async fn rank(
        &self,
        profile_text: &str,
        k: usize,
        use_rerank: bool,
    ) -> Result<Vec<MatchResult>, RankError> {
        self.rank_with(&RankRequest {
            profile_text: profile_text.to_string(),
            k,
            use_rerank,
            filter: LiveFilter::default(),
        })
        .await
    }

    pub async fn rank_with(&self, request: &RankRequest) -> Result<Vec<MatchResult>, RankError> {
        let span = info_span!("rank", k = request.k, use_rerank = request.use_rerank);
        self.rank_inner(request).instrument(span).await
    }

    async fn rank_inner(&self, request: &RankRequest) -> Result<Vec<MatchResult>, RankError> {
        let profile = request.profile_text.trim();
        if profile.is_empty() {
            return Err(RankError::EmptyProfile);
        }
        if self.index.is_empty() {
            return Err(RankError::EmptyIndex);
        }
        let index_space = self.index.space();
        if &index_space != self.embedder.space() {
            return Err(RankError::SpaceMismatch {
                index: index_space.to_string(),
                embedder: self.embedder.space().to_string(),
            });
        }
        if request.k == 0 {
            return Ok(Vec::new());
        }

        let query = self.embedder.embed(profile).await?;
        let m = self.config.candidate_count(request.k);
        let hits = self.index.query(&query, m, self.config.min_score)?;

        let ids: Vec<_> = hits.iter().map(|(id, _)| *id).collect();
        let mut records: HashMap<_, Opportunity> = self
            .store
            .get_many(&ids)
            .await?
            .into_iter()
            .map(|o| (o.id, o))
            .collect();
        if !hits.is_empty() && records.is_empty() {
            return Err(RankError::IndexOutOfSync {
                recalled: hits.len(),
            });
        }
        let candidates: Vec<(Opportunity, f32)> = hits
            .into_iter()
            .filter_map(|(id, score)| records.remove(&id).map(|o| (o, score)))
            .filter(|(o, _)| o.is_live() && request.filter.matches(o))
            .collect();

        let mut results = if request.use_rerank {
            self.score_with_rerank(profile, candidates).await
        } else {
            candidates
                .into_iter()
                .map(|(o, score)| vector_only(o, score, RerankStatus::NotRequested))
                .collect()
        };

        results.sort_by(compare_results);
        results.truncate(request.k);
        for (position, result) in results.iter_mut().enumerate() {
            result.rank = position + 1;
        }
        Ok(results)
    }

    async fn score_with_rerank(
        &self,
        profile: &str,
        candidates: Vec<(Opportunity, f32)>,
    ) -> Vec<MatchResult> {
        let Some(scorer) = &self.scorer else {
            return candidates
                .into_iter()
                .map(|(o, score)| vector_only(o, score, RerankStatus::Unavailable))
                .collect();
        };

        let shortlist: Vec<RerankCandidate> =
            candidates.iter().map(|(o, _)| RerankCandidate::from(o)).collect();
        let verdicts = match scorer.score(profile, &shortlist).await {
            Ok(verdicts) => verdicts,
            Err(err) => {
                warn!(scorer = scorer.name(), error = %err, "secondary scorer failed, using vector scores");
                return candidates
                    .into_iter()
                    .map(|(o, score)| vector_only(o, score, RerankStatus::Unavailable))
                    .collect();
            }
        };

        let mut by_id: HashMap<_, _> = verdicts.into_iter().map(|v| (v.id, v)).collect();
        let w = self.config.rerank_weight;
        candidates
            .into_iter()
            .map(|(opportunity, vector_score)| match by_id.remove(&opportunity.id) {
                Some(verdict) => {
                    let fit = verdict.fit.min(100);
                    MatchResult {
                        rank: 0,
                        opportunity,
                        vector_score,
                        rerank_score: Some(fit),
                        rationale: Some(verdict.rationale),
                        rerank_status: RerankStatus::Scored,
                        final_score: w * (f32::from(fit) / 100.0) + (1.0 - w) * vector_score,
                    }
                }
                None => vector_only(opportunity, vector_score, RerankStatus::Failed),
            })
            .collect()
    }
}

fn vector_only(opportunity: Opportunity, vector_score: f32, status: RerankStatus) -> MatchResult {
    let rationale = match status {
        RerankStatus::Failed | RerankStatus::Unavailable => Some(RERANK_MISSING_NOTE.to_string()),
        RerankStatus::NotRequested | RerankStatus::Scored => None,
    };
    MatchResult {
        rank: 0,
        opportunity,
        vector_score,
        rerank_score: None,
        rationale,
        rerank_status: status,
        final_score: vector_score,
    }
}

fn compare_results(a: &MatchResult, b: &MatchResult) -> Ordering {
    b.final_score
        .total_cmp(&a.final_score)
        .then_with(|| b.vector_score.total_cmp(&a.vector_score))
        .then_with(|| a.opportunity.id.cmp(&b.opportunity.id))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rfam_core::canonicalize;
    use rfam_storage::MemoryOpportunityStore;
    use serde_json::json;

    use super::*;
    use crate::embedder::HashEmbedder;
    use crate::rerank::{RerankError, RerankVerdict};

    struct FixedScorer {
        fits: HashMap<String, u8>,
    }

    #[async_trait]
    impl SecondaryScorer for FixedScorer {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn score(
            &self,
            _profile: &str,
            candidates: &[RerankCandidate],
        ) -> Result<Vec<RerankVerdict>, RerankError> {
            Ok(candidates
                .iter()
                .filter_map(|c| {
                    self.fits.get(&c.title).map(|fit| RerankVerdict {
                        id: c.id,
                        fit: *fit,
                        rationale: format!("fit {fit}"),
                    })
                })
                .collect())
        }
    }

    struct BrokenScorer;

    #[async_trait]
    impl SecondaryScorer for BrokenScorer {
        fn name(&self) -> &str {
            "broken"
        }

        async fn score(
            &self,
            _profile: &str,
            _candidates: &[RerankCandidate],
        ) -> Result<Vec<RerankVerdict>, RerankError> {
            Err(RerankError::Unavailable("timeout".to_string()))
        }
    }

    const TITLES: [(&str, &str); 3] = [
        ("Pediatric Oncology", "pediatric oncology research funding"),
        ("Highway Infrastructure", "highway infrastructure grants"),
        ("Cancer Genomics Data", "cancer genomics data sharing awards"),
    ];

    async fn fixture(scorer: Option<Arc<dyn SecondaryScorer>>) -> (Ranker, Arc<MemoryOpportunityStore>) {
        let store = Arc::new(MemoryOpportunityStore::new());
        let embedder = Arc::new(HashEmbedder::new("hash-ngram-v1", 384, 8_000));
        let index = Arc::new(VectorIndex::new(embedder.space().clone()));

        for (title, summary) in TITLES {
            let c = canonicalize("test", &json!({ "title": title, "summary": summary })).unwrap();
            let outcome = store.upsert(c.fields, c.fingerprint).await.unwrap();
            let vector = embedder.embed(&outcome.opportunity.embedding_text()).await.unwrap();
            index.upsert_one(outcome.opportunity.id, vector).unwrap();
        }

        let ranker = Ranker::new(
            store.clone(),
            index,
            embedder,
            scorer,
            RankerConfig::default(),
        );
        (ranker, store)
    }

    #[tokio::test]
    async fn vector_only_ranking_is_sorted_and_unblended() {
        let (ranker, _) = fixture(None).await;
        let results = ranker
            .rank("I study pediatric cancer genomics", 3, false)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        for (n, r) in results.iter().enumerate() {
            assert_eq!(r.rank, n + 1);
            assert_eq!(r.final_score, r.vector_score);
            assert_eq!(r.rerank_status, RerankStatus::NotRequested);
            assert!((0.0..=1.0).contains(&r.vector_score));
        }
        assert!(results.windows(2).all(|w| w[0].final_score >= w[1].final_score));
        assert_eq!(results[2].opportunity.fields.title, "Highway Infrastructure");
    }

    #[tokio::test]
    async fn rerank_blend_can_reorder_results() {
        let fits = HashMap::from([
            ("Highway Infrastructure".to_string(), 100),
            ("Pediatric Oncology".to_string(), 0),
            ("Cancer Genomics Data".to_string(), 0),
        ]);
        let (ranker, _) = fixture(Some(Arc::new(FixedScorer { fits }))).await;
        let results = ranker.rank("I study pediatric cancer genomics", 3, true).await.unwrap();

        assert_eq!(results[0].opportunity.fields.title, "Highway Infrastructure");
        let top = &results[0];
        let expected = 0.7 * 1.0 + 0.3 * top.vector_score;
        assert!((top.final_score - expected).abs() < 1e-6);
        assert_eq!(top.rerank_score, Some(100));
        assert_eq!(top.rerank_status, RerankStatus::Scored);
    }

    #[tokio::test]
    async fn missing_verdicts_fall_back_per_candidate() {
        let fits = HashMap::from([("Pediatric Oncology".to_string(), 90)]);
        let (ranker, _) = fixture(Some(Arc::new(FixedScorer { fits }))).await;
        let results = ranker.rank("pediatric cancer", 3, true).await.unwrap();

        let failed: Vec<_> = results
            .iter()
            .filter(|r| r.rerank_status == RerankStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 2);
        for r in failed {
            assert_eq!(r.final_score, r.vector_score);
            assert!(r.rerank_score.is_none());
            assert!(r.rationale.as_deref().unwrap_or_default().contains("vector similarity"));
        }
    }

    #[tokio::test]
    async fn scorer_outage_degrades_to_vector_ranking() {
        let (ranker, _) = fixture(Some(Arc::new(BrokenScorer))).await;
        let degraded = ranker.rank("pediatric cancer genomics", 2, true).await.unwrap();
        let plain = ranker.rank("pediatric cancer genomics", 2, false).await.unwrap();

        assert_eq!(degraded.len(), 2);
        assert!(degraded
            .iter()
            .all(|r| r.rerank_status == RerankStatus::Unavailable && r.final_score == r.vector_score));
        let degraded_ids: Vec<_> = degraded.iter().map(|r| r.opportunity.id).collect();
        let plain_ids: Vec<_> = plain.iter().map(|r| r.opportunity.id).collect();
        assert_eq!(degraded_ids, plain_ids);
    }

    #[tokio::test]
    async fn absent_scorer_marks_results_unavailable() {
        let (ranker, _) = fixture(None).await;
        assert!(!ranker.rerank_available());
        let results = ranker.rank("pediatric cancer", 1, true).await.unwrap();
        assert_eq!(results[0].rerank_status, RerankStatus::Unavailable);
    }

    #[tokio::test]
    async fn empty_profile_and_empty_index_fail_with_reason() {
        let (ranker, _) = fixture(None).await;
        let err = ranker.rank("   ", 3, false).await.unwrap_err();
        assert_eq!(err.to_string(), "cannot rank: profile text is empty");

        let embedder = Arc::new(HashEmbedder::new("hash-ngram-v1", 384, 8_000));
        let empty = Ranker::new(
            Arc::new(MemoryOpportunityStore::new()),
            Arc::new(VectorIndex::new(embedder.space().clone())),
            embedder,
            None,
            RankerConfig::default(),
        );
        let err = empty.rank("pediatric", 3, false).await.unwrap_err();
        assert!(matches!(err, RankError::EmptyIndex));
        assert!(err.to_string().starts_with("cannot rank:"));
    }

    #[tokio::test]
    async fn vectors_without_stored_records_fail_instead_of_returning_nothing() {
        let embedder = Arc::new(HashEmbedder::new("hash-ngram-v1", 384, 8_000));
        let index = Arc::new(VectorIndex::new(embedder.space().clone()));
        let orphan = canonicalize("t", &json!({ "title": "Pediatric Oncology" })).unwrap();
        index
            .upsert_one(
                orphan.fingerprint.opportunity_id(),
                embedder.embed("Pediatric Oncology").await.unwrap(),
            )
            .unwrap();

        let ranker = Ranker::new(
            Arc::new(MemoryOpportunityStore::new()),
            index,
            embedder,
            None,
            RankerConfig::default(),
        );
        let err = ranker.rank("pediatric oncology", 3, false).await.unwrap_err();
        assert!(matches!(err, RankError::IndexOutOfSync { recalled: 1 }));
        assert!(err.to_string().starts_with("cannot rank:"));
    }

    #[tokio::test]
    async fn index_from_other_embedding_space_is_refused() {
        let store = Arc::new(MemoryOpportunityStore::new());
        let old = HashEmbedder::new("hash-ngram-v1", 64, 8_000);
        let index = Arc::new(VectorIndex::new(old.space().clone()));
        let c = canonicalize("t", &json!({ "title": "Pediatric Oncology" })).unwrap();
        let outcome = store.upsert(c.fields, c.fingerprint).await.unwrap();
        index
            .upsert_one(outcome.opportunity.id, old.embed("Pediatric Oncology").await.unwrap())
            .unwrap();

        let ranker = Ranker::new(
            store,
            index,
            Arc::new(HashEmbedder::new("hash-ngram-v1", 384, 8_000)),
            None,
            RankerConfig::default(),
        );
        assert!(matches!(
            ranker.rank("pediatric", 1, false).await,
            Err(RankError::SpaceMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn filters_restrict_recalled_candidates() {
        let (ranker, _) = fixture(None).await;
        let request = RankRequest {
            profile_text: "pediatric cancer".to_string(),
            k: 5,
            use_rerank: false,
            filter: LiveFilter {
                agency: Some("NSF".to_string()),
                ..LiveFilter::default()
            },
        };
        assert!(ranker.rank_with(&request).await.unwrap().is_empty());
    }
}
