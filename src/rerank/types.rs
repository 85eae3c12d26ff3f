//! Request/response types for listwise reranking.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::gateway::{ChatModel, ErrorKind, InvocationRecord, ModelConfig};
use crate::prompts::PromptStyle;

// =============================================================================
// Inputs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Caller-owned identifier; numbers are accepted and kept as text.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub text: String,
}

impl Query {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// A document to be reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Opaque payload. Strings are used as-is; objects contribute their
    /// `title` and `text` (or `segment`, `contents`, `content`, `body`).
    #[serde(default)]
    pub content: serde_json::Value,
    /// Written by the engine; the input value is ignored.
    #[serde(default)]
    pub score: f64,
}

impl Candidate {
    pub fn new(id: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            content,
            score: 0.0,
        }
    }

    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, serde_json::json!({ "text": text.into() }))
    }
}

/// One query and the candidates to reorder. Input order is the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub query: Query,
    pub candidates: Vec<Candidate>,
}

impl Request {
    pub fn new(query: Query, candidates: Vec<Candidate>) -> Self {
        Self { query, candidates }
    }

    /// Reject duplicate candidate ids before any backend call.
    pub fn validate(&self) -> Result<(), RerankError> {
        let mut seen: HashSet<&str> = HashSet::with_capacity(self.candidates.len());
        for c in &self.candidates {
            if !seen.insert(c.id.as_str()) {
                return Err(RerankError::DuplicateCandidate {
                    query_id: self.query.id.clone(),
                    candidate_id: c.id.clone(),
                });
            }
        }
        Ok(())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Int(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Int(n) => n.to_string(),
    })
}

// =============================================================================
// Options
// =============================================================================

/// Engine options. Every field has a default, so `{}` is a valid options file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RerankOptions {
    /// Backend model id, e.g. "google/gemma-3-27b-it".
    #[serde(default = "default_model")]
    pub model: String,

    /// Total tokens the model accepts per call (prompt plus output).
    #[serde(default = "default_context_size")]
    pub context_size: usize,

    /// Tokens reserved for the model's answer.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Distance between consecutive window starts; must be below `window_size`.
    #[serde(default = "default_stride")]
    pub stride: usize,

    #[serde(default = "default_num_passes")]
    pub num_passes: usize,

    #[serde(default)]
    pub prompt_style: PromptStyle,

    /// Maximum requests in flight.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Attach every provider attempt to the result.
    #[serde(default)]
    pub capture_history: bool,

    /// Retries for network and rate-limit failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_per_attempt_timeout_ms")]
    pub per_attempt_timeout_ms: u64,

    /// Per-candidate token cap applied before budget truncation.
    #[serde(default = "default_max_passage_tokens")]
    pub max_passage_tokens: usize,

    /// Re-requests for a window whose output cannot be parsed.
    #[serde(default = "default_unparsable_retries")]
    pub unparsable_retries: u32,

    /// Fail a request once more windows than this have fallen back.
    #[serde(default)]
    pub max_window_failures: Option<usize>,

    /// Cancel the whole batch after this long.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

fn default_model() -> String {
    "google/gemma-3-27b-it".to_string()
}

fn default_context_size() -> usize {
    8192
}

fn default_max_output_tokens() -> u32 {
    256
}

fn default_window_size() -> usize {
    20
}

fn default_stride() -> usize {
    10
}

fn default_num_passes() -> usize {
    1
}

fn default_concurrency_limit() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_per_attempt_timeout_ms() -> u64 {
    60_000
}

fn default_max_passage_tokens() -> usize {
    300
}

fn default_unparsable_retries() -> u32 {
    1
}

impl Default for RerankOptions {
    fn default() -> Self {
        Self {
            model: default_model(),
            context_size: default_context_size(),
            max_output_tokens: default_max_output_tokens(),
            window_size: default_window_size(),
            stride: default_stride(),
            num_passes: default_num_passes(),
            prompt_style: PromptStyle::default(),
            concurrency_limit: default_concurrency_limit(),
            capture_history: false,
            max_retries: default_max_retries(),
            per_attempt_timeout_ms: default_per_attempt_timeout_ms(),
            max_passage_tokens: default_max_passage_tokens(),
            unparsable_retries: default_unparsable_retries(),
            max_window_failures: None,
            deadline_ms: None,
        }
    }
}

impl RerankOptions {
    pub fn validate(&self) -> Result<(), RerankError> {
        if self.model.trim().is_empty() {
            return Err(RerankError::InvalidOptions("model must not be empty".into()));
        }
        if self.window_size < 2 {
            return Err(RerankError::InvalidOptions("window_size must be >= 2".into()));
        }
        if self.stride == 0 || self.stride >= self.window_size {
            return Err(RerankError::InvalidOptions(format!(
                "stride must be in 1..window_size (stride={}, window_size={})",
                self.stride, self.window_size
            )));
        }
        if self.num_passes == 0 {
            return Err(RerankError::InvalidOptions("num_passes must be >= 1".into()));
        }
        if self.concurrency_limit == 0 {
            return Err(RerankError::InvalidOptions(
                "concurrency_limit must be >= 1".into(),
            ));
        }
        if self.max_output_tokens == 0 {
            return Err(RerankError::InvalidOptions(
                "max_output_tokens must be >= 1".into(),
            ));
        }
        if self.context_size <= self.max_output_tokens as usize {
            return Err(RerankError::InvalidOptions(format!(
                "context_size must exceed max_output_tokens (context_size={}, max_output_tokens={})",
                self.context_size, self.max_output_tokens
            )));
        }
        if self.per_attempt_timeout_ms == 0 {
            return Err(RerankError::InvalidOptions(
                "per_attempt_timeout_ms must be >= 1".into(),
            ));
        }
        if self.max_passage_tokens == 0 {
            return Err(RerankError::InvalidOptions(
                "max_passage_tokens must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Tokens available to the rendered prompt.
    pub fn prompt_budget(&self) -> usize {
        self.context_size
            .saturating_sub(self.max_output_tokens as usize)
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new(ChatModel::openrouter(&self.model))
            .max_output_tokens(self.max_output_tokens)
            .max_retries(self.max_retries)
            .per_attempt_timeout(self.per_attempt_timeout())
    }
}

// =============================================================================
// Outputs
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankStatus {
    /// Every window was ranked by the model.
    Complete,
    /// Some windows kept their incoming order after a failure.
    Degraded,
    /// Too many window failures, or the request was invalid.
    Failed,
    /// Stopped by the caller.
    Cancelled,
}

/// A window that kept its incoming order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowFailure {
    pub pass: usize,
    pub start: usize,
    pub end: usize,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankStats {
    pub windows: usize,
    pub model_calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub elapsed_ms: u64,
}

/// Result for one request. `candidates` always holds every input candidate once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankOutcome {
    pub query: Query,
    pub candidates: Vec<Candidate>,
    pub status: RerankStatus,
    /// First error that affected the request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    /// Human-readable reason for a failed or rejected request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub window_failures: Vec<WindowFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<InvocationRecord>>,
    #[serde(default)]
    pub stats: RerankStats,
}

impl RerankOutcome {
    /// The request returned untouched with a terminal status.
    pub fn unranked(request: Request, status: RerankStatus, error: Option<ErrorKind>) -> Self {
        Self {
            query: request.query,
            candidates: request.candidates,
            status,
            error,
            detail: None,
            window_failures: Vec::new(),
            history: None,
            stats: RerankStats::default(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn ids(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.id.as_str()).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RerankError {
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
    #[error("duplicate candidate id {candidate_id:?} in query {query_id:?}")]
    DuplicateCandidate {
        query_id: String,
        candidate_id: String,
    },
}
