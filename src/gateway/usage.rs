//! Usage tracking via the UsageSink trait.
//!
//! The completion client reports every provider attempt through a UsageSink,
//! which keeps it independent of where usage ends up:
//! - the CLI uses StderrUsageSink (structured tracing events)
//! - tests use NoopUsageSink or a collecting sink

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use super::error::ErrorKind;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
    Cancelled,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
            CallStatus::Cancelled => "cancelled",
        }
    }
}

/// Record of a single provider attempt.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    /// Provider name, e.g. "openrouter".
    pub provider: &'static str,
    /// Model used.
    pub model: String,
    /// Masked label of the credential the attempt ran under.
    pub credential: Option<String>,
    /// 1-based attempt number within one completion.
    pub attempt: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Batch the call belongs to, if any.
    pub batch_id: Option<Uuid>,
    /// Query being reranked, if any.
    pub query_id: Option<String>,
    pub latency_ms: u64,
    pub status: CallStatus,
    /// Failure class when status is Error.
    pub error_kind: Option<ErrorKind>,
    /// Which code path made this call.
    pub caller: &'static str,
    /// Provider request ID (for debugging).
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(provider: &'static str, model: impl Into<String>, caller: &'static str) -> Self {
        Self {
            provider,
            model: model.into(),
            credential: None,
            attempt: 1,
            input_tokens: 0,
            output_tokens: 0,
            batch_id: None,
            query_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_kind: None,
            caller,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn credential(mut self, label: impl Into<String>) -> Self {
        self.credential = Some(label.into());
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn batch(mut self, batch_id: Option<Uuid>) -> Self {
        self.batch_id = batch_id;
        self
    }

    pub fn query(mut self, query_id: Option<String>) -> Self {
        self.query_id = query_id;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, kind: ErrorKind) -> Self {
        self.status = if kind == ErrorKind::Cancelled {
            CallStatus::Cancelled
        } else {
            CallStatus::Error
        };
        self.error_kind = Some(kind);
        self
    }

    pub fn request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }
}

/// Trait for recording provider call usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. Fire-and-forget: failures are logged, never propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// Discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Emits each record as a structured tracing event on the `usage` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrUsageSink;

#[async_trait]
impl UsageSink for StderrUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        info!(
            target: "usage",
            provider = record.provider,
            model = %record.model,
            credential = record.credential.as_deref().unwrap_or("-"),
            attempt = record.attempt,
            tokens = record.input_tokens + record.output_tokens,
            latency_ms = record.latency_ms,
            status = record.status.as_str(),
            error = record.error_kind.map(|k| k.as_str()).unwrap_or("-"),
            query_id = record.query_id.as_deref().unwrap_or("-"),
            caller = record.caller,
            "provider call"
        );
    }
}
