//! Text to dense vector. One backend is chosen per process.

use std::sync::Arc;

use async_trait::async_trait;
use rfam_core::EmbeddingSpace;
use rfam_storage::{classify_reqwest_error, classify_status, BackoffPolicy, RetryDisposition};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{EmbedderConfig, EmbeddingBackendKind};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbeddingError {
    /// Backend unreachable, timed out or throttled after bounded retries.
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),
    #[error("nothing to embed after normalization")]
    EmptyInput,
    #[error("embedding backend returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("expected {expected}-dimensional embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn space(&self) -> &EmbeddingSpace;

    /// Deterministic for a fixed backend, model and input.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Collapse whitespace and cut to `max_chars` characters.
pub fn prepare_text(text: &str, max_chars: usize) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(match collapsed.char_indices().nth(max_chars) {
        Some((cut, _)) => collapsed[..cut].trim_end().to_string(),
        None => collapsed,
    })
}

pub fn l2_normalize(vector: &mut [f32]) -> bool {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for x in vector.iter_mut() {
        *x /= norm;
    }
    true
}

pub fn build_embedder(config: &EmbedderConfig) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    match config.backend {
        EmbeddingBackendKind::Local => Ok(Arc::new(HashEmbedder::new(
            config.local_model.clone(),
            config.local_dimensions,
            config.max_chars,
        ))),
        EmbeddingBackendKind::Remote => Ok(Arc::new(RemoteEmbedder::new(config)?)),
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Offline backend: hashed word unigrams plus character trigrams, L2-normalized.
///
/// Weights are non-negative, so cosine scores between its vectors lie in [0, 1].
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    space: EmbeddingSpace,
    max_chars: usize,
}

impl HashEmbedder {
    const WORD_WEIGHT: f32 = 1.0;
    const TRIGRAM_WEIGHT: f32 = 0.5;

    pub fn new(model: impl Into<String>, dimensions: usize, max_chars: usize) -> Self {
        Self {
            space: EmbeddingSpace {
                backend: EmbeddingBackendKind::Local.as_str().to_string(),
                model: model.into(),
                dimensions: dimensions.max(1),
            },
            max_chars,
        }
    }

    fn bucket(&self, feature: &str) -> usize {
        let seeded = format!("{}\u{1f}{feature}", self.space.model);
        (fnv1a(seeded.as_bytes()) % self.space.dimensions as u64) as usize
    }

    fn vectorize(&self, text: &str) -> Option<Vec<f32>> {
        let mut vector = vec![0.0f32; self.space.dimensions];
        let lowered = text.to_lowercase();
        let tokens = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= 2);

        for token in tokens {
            vector[self.bucket(token)] += Self::WORD_WEIGHT;
            let padded: Vec<char> = format!("^{token}$").chars().collect();
            for window in padded.windows(3) {
                let gram: String = window.iter().collect();
                vector[self.bucket(&gram)] += Self::TRIGRAM_WEIGHT;
            }
        }

        l2_normalize(&mut vector).then_some(vector)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn space(&self) -> &EmbeddingSpace {
        &self.space
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let prepared = prepare_text(text, self.max_chars).ok_or(EmbeddingError::EmptyInput)?;
        self.vectorize(&prepared).ok_or(EmbeddingError::EmptyInput)
    }
}

/// OpenAI-compatible `/embeddings` backend.
#[derive(Debug, Clone)]
pub struct RemoteEmbedder {
    client: reqwest::Client,
    space: EmbeddingSpace,
    url: String,
    api_key: String,
    max_chars: usize,
    batch_size: usize,
    backoff: BackoffPolicy,
}

impl RemoteEmbedder {
    pub fn new(config: &EmbedderConfig) -> Result<Self, EmbeddingError> {
        let api_key = config
            .remote_api_key
            .clone()
            .ok_or_else(|| EmbeddingError::Unavailable("no API key configured".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| EmbeddingError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            space: EmbeddingSpace {
                backend: EmbeddingBackendKind::Remote.as_str().to_string(),
                model: config.remote_model.clone(),
                dimensions: config.remote_dimensions,
            },
            url: format!("{}/embeddings", config.remote_api_base.trim_end_matches('/')),
            api_key,
            max_chars: config.max_chars,
            batch_size: config.batch_size.max(1),
            backoff: BackoffPolicy {
                max_retries: config.max_retries,
                ..BackoffPolicy::default()
            },
        })
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.space.model,
            "input": inputs,
            "dimensions": self.space.dimensions,
        });

        let mut attempt = 0;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            let sent = self
                .client
                .post(&self.url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            let failure = match sent {
                Ok(resp) if resp.status().is_success() => {
                    let json: Value = resp
                        .json()
                        .await
                        .map_err(|err| EmbeddingError::InvalidResponse(err.to_string()))?;
                    return parse_embedding_response(json, inputs.len());
                }
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(EmbeddingError::Unavailable(format!("http status {status}")));
                    }
                    format!("http status {status}")
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(EmbeddingError::Unavailable(err.to_string()));
                    }
                    err.to_string()
                }
            };

            if !can_retry {
                return Err(EmbeddingError::Unavailable(failure));
            }
            warn!(attempt, %failure, "embedding request failed, backing off");
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    fn finish(&self, mut vector: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
        if vector.len() != self.space.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.space.dimensions,
                actual: vector.len(),
            });
        }
        if !l2_normalize(&mut vector) {
            return Err(EmbeddingError::InvalidResponse("zero vector".to_string()));
        }
        Ok(vector)
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn space(&self) -> &EmbeddingSpace {
        &self.space
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let prepared = prepare_text(text, self.max_chars).ok_or(EmbeddingError::EmptyInput)?;
        let mut vectors = self.request(&[prepared]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty data array".to_string()))?;
        self.finish(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let prepared = texts
            .iter()
            .map(|t| prepare_text(t, self.max_chars).ok_or(EmbeddingError::EmptyInput))
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(prepared.len());
        for chunk in prepared.chunks(self.batch_size) {
            debug!(batch = chunk.len(), "requesting remote embeddings");
            for vector in self.request(chunk).await? {
                out.push(self.finish(vector)?);
            }
        }
        Ok(out)
    }
}

fn parse_embedding_response(json: Value, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing data array".to_string()))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback_index, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(fallback_index);
        let embedding = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| EmbeddingError::InvalidResponse("item missing embedding".to_string()))?;
        let vector = embedding
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|n| n as f32)
                    .ok_or_else(|| EmbeddingError::InvalidResponse("non-numeric value".to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        indexed.push((index, vector));
    }

    if indexed.len() != expected {
        return Err(EmbeddingError::InvalidResponse(format!(
            "expected {expected} embeddings, got {}",
            indexed.len()
        )));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>().clamp(-1.0, 1.0)
}
