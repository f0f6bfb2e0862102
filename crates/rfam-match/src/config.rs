//! Matching configuration read from the process environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} requires OPENAI_API_KEY to be set")]
    MissingApiKey(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackendKind {
    Local,
    Remote,
}

impl EmbeddingBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl FromStr for EmbeddingBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "hash" => Ok(Self::Local),
            "remote" | "openai" => Ok(Self::Remote),
            other => Err(format!("unknown embeddings backend `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedderConfig {
    pub backend: EmbeddingBackendKind,
    pub local_model: String,
    pub local_dimensions: usize,
    pub remote_model: String,
    pub remote_api_base: String,
    pub remote_api_key: Option<String>,
    pub remote_dimensions: usize,
    pub timeout: Duration,
    pub max_retries: usize,
    pub max_chars: usize,
    pub batch_size: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackendKind::Local,
            local_model: "hash-ngram-v1".to_string(),
            local_dimensions: 384,
            remote_model: "text-embedding-3-small".to_string(),
            remote_api_base: "https://api.openai.com/v1".to_string(),
            remote_api_key: None,
            remote_dimensions: 1536,
            timeout: Duration::from_millis(20_000),
            max_retries: 2,
            max_chars: 8_000,
            batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RerankConfig {
    pub enabled: bool,
    pub model: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub summary_chars: usize,
    pub eligibility_chars: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: "gpt-4o-mini".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            timeout: Duration::from_millis(30_000),
            summary_chars: 700,
            eligibility_chars: 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankerConfig {
    pub overfetch_factor: usize,
    pub min_candidates: usize,
    /// Weight `w` of the re-rank score in `w * rerank/100 + (1 - w) * vector`.
    pub rerank_weight: f32,
    pub min_score: Option<f32>,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            overfetch_factor: 3,
            min_candidates: 20,
            rerank_weight: 0.7,
            min_score: None,
        }
    }
}

impl RankerConfig {
    /// Number of candidates fetched from the index for a request of `k`.
    pub fn candidate_count(&self, k: usize) -> usize {
        k.saturating_mul(self.overfetch_factor.max(1))
            .max(self.min_candidates)
            .max(k)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchConfig {
    pub embedder: EmbedderConfig,
    pub rerank: RerankConfig,
    pub ranker: RankerConfig,
}

impl MatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset or blank values take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let MatchConfig {
            embedder: base,
            rerank: base_rerank,
            ranker: base_ranker,
        } = MatchConfig::default();
        let api_key = var("OPENAI_API_KEY");

        let embedder = EmbedderConfig {
            backend: parse_or(&var, "RFAM_EMBEDDINGS_BACKEND", base.backend)?,
            local_model: var("RFAM_LOCAL_MODEL").unwrap_or(base.local_model),
            local_dimensions: parse_or(&var, "RFAM_LOCAL_DIMENSIONS", base.local_dimensions)?,
            remote_model: var("RFAM_REMOTE_MODEL").unwrap_or(base.remote_model),
            remote_api_base: var("RFAM_REMOTE_API_BASE").unwrap_or(base.remote_api_base),
            remote_api_key: api_key.clone(),
            remote_dimensions: parse_or(&var, "RFAM_REMOTE_DIMENSIONS", base.remote_dimensions)?,
            timeout: Duration::from_millis(parse_or(&var, "RFAM_EMBED_TIMEOUT_MS", 20_000u64)?),
            max_retries: parse_or(&var, "RFAM_EMBED_MAX_RETRIES", base.max_retries)?,
            max_chars: parse_or(&var, "RFAM_EMBED_MAX_CHARS", base.max_chars)?,
            batch_size: parse_or(&var, "RFAM_EMBED_BATCH_SIZE", base.batch_size)?,
        };
        if embedder.backend == EmbeddingBackendKind::Remote && embedder.remote_api_key.is_none() {
            return Err(ConfigError::MissingApiKey("RFAM_EMBEDDINGS_BACKEND=remote"));
        }
        for (name, value) in [
            ("RFAM_LOCAL_DIMENSIONS", embedder.local_dimensions),
            ("RFAM_REMOTE_DIMENSIONS", embedder.remote_dimensions),
            ("RFAM_EMBED_BATCH_SIZE", embedder.batch_size),
            ("RFAM_EMBED_MAX_CHARS", embedder.max_chars),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }

        let rerank = RerankConfig {
            enabled: parse_flag(var("RFAM_RERANK_ENABLED")),
            model: var("RFAM_RERANK_MODEL").unwrap_or(base_rerank.model.clone()),
            api_base: var("RFAM_RERANK_API_BASE").unwrap_or(base_rerank.api_base.clone()),
            api_key,
            timeout: Duration::from_millis(parse_or(&var, "RFAM_RERANK_TIMEOUT_MS", 30_000u64)?),
            ..base_rerank
        };

        let ranker = RankerConfig {
            overfetch_factor: parse_or(
                &var,
                "RFAM_OVERFETCH_FACTOR",
                base_ranker.overfetch_factor,
            )?,
            min_candidates: parse_or(&var, "RFAM_MIN_CANDIDATES", base_ranker.min_candidates)?,
            rerank_weight: parse_or(&var, "RFAM_RERANK_WEIGHT", base_ranker.rerank_weight)?,
            min_score: var("RFAM_MIN_SCORE")
                .map(|v| parse_value("RFAM_MIN_SCORE", &v))
                .transpose()?,
        };
        if !(0.0..=1.0).contains(&ranker.rerank_weight) {
            return Err(ConfigError::Invalid {
                name: "RFAM_RERANK_WEIGHT",
                value: ranker.rerank_weight.to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        if let Some(min_score) = ranker.min_score {
            if !(-1.0..=1.0).contains(&min_score) {
                return Err(ConfigError::Invalid {
                    name: "RFAM_MIN_SCORE",
                    value: min_score.to_string(),
                    reason: "must be within [-1, 1]".to_string(),
                });
            }
        }
        if ranker.overfetch_factor == 0 {
            return Err(ConfigError::Invalid {
                name: "RFAM_OVERFETCH_FACTOR",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            embedder,
            rerank,
            ranker,
        })
    }
}

pub fn parse_flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn parse_value<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|err| ConfigError::Invalid {
        name,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

fn parse_or<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => parse_value(name, &raw),
        None => Ok(default),
    }
}
