//! Embedding, vector index, secondary scoring and ranking for RFA Matcher.

pub mod config;
pub mod embedder;
pub mod index;
pub mod ranker;
pub mod rerank;

pub use config::{
    ConfigError, EmbedderConfig, EmbeddingBackendKind, MatchConfig, RankerConfig, RerankConfig,
};
pub use embedder::{build_embedder, Embedder, EmbeddingError, HashEmbedder, RemoteEmbedder};
pub use index::{IndexBuilder, IndexError, IndexManifest, VectorIndex};
pub use ranker::{RankError, RankRequest, Ranker};
pub use rerank::{LlmScorer, RerankCandidate, RerankError, RerankVerdict, SecondaryScorer};

pub const CRATE_NAME: &str = "rfam-match";
