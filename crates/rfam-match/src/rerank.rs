//! Optional secondary relevance signal: a 0-100 fit score with a short rationale.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use rfam_core::{Opportunity, OpportunityId};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::RerankConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RerankError {
    #[error("secondary scorer unavailable: {0}")]
    Unavailable(String),
    #[error("secondary scorer returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// What the scorer sees of one shortlisted opportunity.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankCandidate {
    pub id: OpportunityId,
    pub title: String,
    pub agency: Option<String>,
    pub mechanism: Option<String>,
    pub source: String,
    pub close_date: Option<NaiveDate>,
    pub summary: Option<String>,
    pub eligibility: Option<String>,
}

impl From<&Opportunity> for RerankCandidate {
    fn from(opp: &Opportunity) -> Self {
        let f = &opp.fields;
        Self {
            id: opp.id,
            title: f.title.clone(),
            agency: f.agency.clone(),
            mechanism: f.mechanism.clone(),
            source: f.source_name.clone(),
            close_date: f.close_date,
            summary: f.summary.clone(),
            eligibility: f.eligibility.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RerankVerdict {
    pub id: OpportunityId,
    /// 0..=100
    pub fit: u8,
    pub rationale: String,
}

/// Batch scorer. Candidates missing from the returned list count as
/// individually failed; an `Err` means the whole call failed.
#[async_trait]
pub trait SecondaryScorer: Send + Sync {
    fn name(&self) -> &str;

    async fn score(
        &self,
        profile: &str,
        candidates: &[RerankCandidate],
    ) -> Result<Vec<RerankVerdict>, RerankError>;
}

const SYSTEM_PROMPT: &str = "You evaluate research funding opportunities carefully and always answer with valid JSON.";

/// OpenAI-compatible chat-completions scorer, temperature 0, JSON output.
#[derive(Debug, Clone)]
pub struct LlmScorer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    summary_chars: usize,
    eligibility_chars: usize,
}

impl LlmScorer {
    /// `None` when scoring is disabled or no key is configured.
    pub fn from_config(config: &RerankConfig) -> Result<Option<Self>, RerankError> {
        if !config.enabled {
            return Ok(None);
        }
        let Some(api_key) = config.api_key.clone() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| RerankError::Unavailable(err.to_string()))?;
        Ok(Some(Self {
            client,
            url: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            summary_chars: config.summary_chars,
            eligibility_chars: config.eligibility_chars,
        }))
    }

    fn prompt(&self, profile: &str, candidates: &[RerankCandidate]) -> String {
        let mut prompt = format!(
            "Rank funding opportunities for this researcher.\n\nResearcher profile:\n---\n{}\n---\n\n\
             Give every opportunity a FIT score from 0 to 100 and one or two sentences on why it \
             fits or not. Penalize agency or mechanism constraints the researcher cannot meet and \
             off-topic scope. Mention missing or passed deadlines.\n\n\
             Answer only with JSON of the form \
             {{\"list\": [{{\"id\": <int>, \"fit\": <0-100 int>, \"why\": \"<short explanation>\"}}]}}\n\n\
             Opportunities:\n",
            profile.trim()
        );
        for (n, c) in candidates.iter().enumerate() {
            prompt.push_str(&format!(
                "- id:{}; title:{}; agency:{}; mechanism:{}; source:{}; close_date:{}; summary:{}; eligibility:{}\n",
                n + 1,
                c.title,
                c.agency.as_deref().unwrap_or_default(),
                c.mechanism.as_deref().unwrap_or_default(),
                c.source,
                c.close_date.map(|d| d.to_string()).unwrap_or_default(),
                clip(c.summary.as_deref().unwrap_or_default(), self.summary_chars),
                clip(c.eligibility.as_deref().unwrap_or_default(), self.eligibility_chars),
            ));
        }
        prompt
    }
}

fn clip(text: &str, max_chars: usize) -> &str {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

#[async_trait]
impl SecondaryScorer for LlmScorer {
    fn name(&self) -> &str {
        &self.model
    }

    async fn score(
        &self,
        profile: &str,
        candidates: &[RerankCandidate],
    ) -> Result<Vec<RerankVerdict>, RerankError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": self.prompt(profile, candidates) },
            ],
        });

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| RerankError::Unavailable(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RerankError::Unavailable(format!("http status {status}")));
        }
        let json: Value = resp
            .json()
            .await
            .map_err(|err| RerankError::InvalidResponse(err.to_string()))?;

        let verdicts = parse_verdicts(&json, candidates)?;
        debug!(
            scored = verdicts.len(),
            candidates = candidates.len(),
            "secondary scorer answered"
        );
        Ok(verdicts)
    }
}

/// Map the model's `{id, fit, why}` items (ids are 1-based prompt positions)
/// back to candidates. Items that cannot be mapped are dropped.
fn parse_verdicts(
    json: &Value,
    candidates: &[RerankCandidate],
) -> Result<Vec<RerankVerdict>, RerankError> {
    let content = json
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| RerankError::InvalidResponse("missing message content".to_string()))?;
    let parsed: Value = serde_json::from_str(content.trim())
        .map_err(|_| RerankError::InvalidResponse("content is not JSON".to_string()))?;

    let items = match &parsed {
        Value::Array(items) => items,
        Value::Object(map) => ["list", "results", "items", "opportunities"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .ok_or_else(|| RerankError::InvalidResponse("no verdict list".to_string()))?,
        _ => return Err(RerankError::InvalidResponse("unexpected JSON shape".to_string())),
    };

    let mut verdicts: HashMap<OpportunityId, RerankVerdict> = HashMap::new();
    for item in items {
        let Some(position) = item.get("id").and_then(as_index) else {
            continue;
        };
        let Some(candidate) = position.checked_sub(1).and_then(|p| candidates.get(p)) else {
            continue;
        };
        let Some(fit) = item.get("fit").or_else(|| item.get("score")).and_then(Value::as_f64) else {
            continue;
        };
        if !fit.is_finite() {
            continue;
        }
        let rationale = item
            .get("why")
            .or_else(|| item.get("rationale"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        verdicts.entry(candidate.id).or_insert(RerankVerdict {
            id: candidate.id,
            fit: fit.round().clamp(0.0, 100.0) as u8,
            rationale,
        });
    }

    Ok(candidates
        .iter()
        .filter_map(|c| verdicts.remove(&c.id))
        .collect())
}

fn as_index(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|v| v as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
