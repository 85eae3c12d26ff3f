//! Completion gateway: one prompt in, text out, through a rotating credential pool.

pub mod credentials;
pub mod error;
pub mod openrouter;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use credentials::{CallOutcome, Credential};

pub use credentials::{CredentialError, CredentialPool, CredentialPoolConfig, CredentialStatus};
pub use error::{ErrorContext, ErrorKind, ProviderError};
pub use openrouter::{ChatProvider, OpenRouterAdapter};
pub use types::*;
pub use usage::{CallStatus, NoopUsageSink, ProviderCallRecord, StderrUsageSink, UsageSink};

// =============================================================================
// ERRORS
// =============================================================================

/// Terminal failure of one completion after the retry policy gave up.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Exhausted(#[from] CredentialError),
    #[error("completion cancelled")]
    Cancelled,
}

impl CompletionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompletionError::Provider(e) => e.kind(),
            CompletionError::Exhausted(e) => e.kind(),
            CompletionError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

// =============================================================================
// INVOCATION HISTORY
// =============================================================================

/// Outcome of one provider attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed { kind: ErrorKind, message: String },
    Cancelled,
}

/// Everything sent and received for a single provider attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub query_id: Option<String>,
    /// 1-based attempt number within the completion.
    pub attempt: u32,
    pub model: String,
    pub prompt: Vec<Message>,
    /// blake3 over the rendered prompt.
    pub prompt_hash: String,
    pub response: Option<String>,
    /// Masked credential label.
    pub credential: Option<String>,
    pub latency_ms: u64,
    pub outcome: AttemptOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Per-request collector of invocation records. Disabled logs drop everything.
#[derive(Debug, Default)]
pub struct InvocationLog {
    records: Option<Vec<InvocationRecord>>,
}

impl InvocationLog {
    pub fn enabled() -> Self {
        Self {
            records: Some(Vec::new()),
        }
    }

    pub fn disabled() -> Self {
        Self { records: None }
    }

    pub fn new(capture: bool) -> Self {
        if capture {
            Self::enabled()
        } else {
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.records.is_some()
    }

    pub fn len(&self) -> usize {
        self.records.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The record is only built when capture is on.
    pub fn push_with(&mut self, build: impl FnOnce() -> InvocationRecord) {
        if let Some(records) = self.records.as_mut() {
            records.push(build());
        }
    }

    pub fn into_records(self) -> Option<Vec<InvocationRecord>> {
        self.records
    }
}

pub fn prompt_hash(messages: &[Message]) -> String {
    let mut hasher = blake3::Hasher::new();
    for m in messages {
        hasher.update(m.role.as_str().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(m.content.as_bytes());
        hasher.update(b"\x1e");
    }
    hasher.finalize().to_hex().to_string()
}

// =============================================================================
// GATEWAY
// =============================================================================

/// The completion capability the reranker depends on.
#[async_trait::async_trait]
pub trait CompletionGateway: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        config: &ModelConfig,
        attribution: &Attribution,
        cancel: &CancelToken,
        log: &mut InvocationLog,
    ) -> Result<ChatResponse, CompletionError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Delay before the first transient retry.
    pub retry_base_delay: Duration,
    /// Upper bound on any single backoff sleep.
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the backoff (0.25 = up to +25%).
    pub jitter: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry_base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

/// Retrying completion client over a [`ChatProvider`] and a [`CredentialPool`].
pub struct CompletionClient<U: UsageSink> {
    provider: Arc<dyn ChatProvider>,
    pool: Arc<CredentialPool>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

impl<U: UsageSink> CompletionClient<U> {
    pub fn new(provider: Arc<dyn ChatProvider>, pool: Arc<CredentialPool>, usage_sink: Arc<U>) -> Self {
        Self::with_config(provider, pool, usage_sink, GatewayConfig::default())
    }

    pub fn with_config(
        provider: Arc<dyn ChatProvider>,
        pool: Arc<CredentialPool>,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            provider,
            pool,
            usage_sink,
            config,
        }
    }

    /// OpenRouter adapter and key pool built from the environment.
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let keys = api_keys_from_env()?;
        let pool = CredentialPool::new(keys, CredentialPoolConfig::default())
            .map_err(|e| ProviderError::config(e.to_string()))?;
        let provider = OpenRouterAdapter::from_env()?;
        Ok(Self::new(Arc::new(provider), Arc::new(pool), usage_sink))
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    fn backoff_delay(&self, retry: u32) -> Duration {
        let exp = self
            .config
            .retry_base_delay
            .saturating_mul(2u32.pow(retry.min(10)))
            .min(self.config.max_delay);
        if self.config.jitter <= 0.0 || exp.is_zero() {
            return exp;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..self.config.jitter);
        exp.mul_f64(factor).min(self.config.max_delay)
    }

    async fn attempt(
        &self,
        request: &ChatRequest,
        credential: &Credential,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Option<Result<ChatResponse, ProviderError>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = tokio::time::timeout(timeout, self.provider.chat(request, credential.key())) => {
                Some(res.unwrap_or_else(|_| Err(ProviderError::Timeout(timeout))))
            }
        }
    }

    async fn record_usage(
        &self,
        request: &ChatRequest,
        credential: &Credential,
        attempt: u32,
        latency: Duration,
        result: Result<&ChatResponse, (ErrorKind, Option<String>)>,
    ) {
        let record = ProviderCallRecord::new(
            request.model.provider(),
            request.model.model_id(),
            request.attribution.caller,
        )
        .credential(credential.label())
        .attempt(attempt)
        .batch(request.attribution.batch_id)
        .query(request.attribution.query_id.clone())
        .latency(latency.as_millis() as u64);

        let record = match result {
            Ok(resp) => record.tokens(resp.input_tokens, resp.output_tokens),
            Err((kind, request_id)) => record.error(kind).request_id(request_id),
        };
        self.usage_sink.record(record).await;
    }
}

#[async_trait::async_trait]
impl<U: UsageSink> CompletionGateway for CompletionClient<U> {
    async fn complete(
        &self,
        messages: &[Message],
        config: &ModelConfig,
        attribution: &Attribution,
        cancel: &CancelToken,
        log: &mut InvocationLog,
    ) -> Result<ChatResponse, CompletionError> {
        let request = config.to_request(messages.to_vec(), attribution.clone());
        let hash = prompt_hash(messages);
        let mut attempt: u32 = 0;
        let mut transient_retries: u32 = 0;
        let mut malformed_retried = false;

        loop {
            if cancel.is_cancelled() {
                return Err(CompletionError::Cancelled);
            }
            attempt += 1;

            let credential = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CompletionError::Cancelled),
                res = self.pool.acquire() => res?,
            };

            let started = Instant::now();
            let result = self
                .attempt(&request, &credential, config.per_attempt_timeout, cancel)
                .await;
            let latency = started.elapsed();

            let record = |response: Option<String>, outcome: AttemptOutcome| InvocationRecord {
                query_id: attribution.query_id.clone(),
                attempt,
                model: request.model.model_id().to_string(),
                prompt: request.messages.clone(),
                prompt_hash: hash.clone(),
                response,
                credential: Some(credential.label().to_string()),
                latency_ms: latency.as_millis() as u64,
                outcome,
                timestamp: Utc::now(),
            };

            let err = match result {
                None => {
                    log.push_with(|| record(None, AttemptOutcome::Cancelled));
                    self.record_usage(
                        &request,
                        &credential,
                        attempt,
                        latency,
                        Err((ErrorKind::Cancelled, None)),
                    )
                    .await;
                    self.pool.release(credential, CallOutcome::Failed);
                    return Err(CompletionError::Cancelled);
                }
                Some(Ok(resp)) => {
                    log.push_with(|| record(Some(resp.content.clone()), AttemptOutcome::Success));
                    self.record_usage(&request, &credential, attempt, latency, Ok(&resp))
                        .await;
                    self.pool.release(credential, CallOutcome::Success);
                    debug!(
                        attempt,
                        latency_ms = latency.as_millis() as u64,
                        caller = attribution.caller,
                        "Completion succeeded"
                    );
                    return Ok(resp);
                }
                Some(Err(err)) => err,
            };

            let kind = err.kind();
            log.push_with(|| {
                record(
                    None,
                    AttemptOutcome::Failed {
                        kind,
                        message: err.to_string(),
                    },
                )
            });
            self.record_usage(
                &request,
                &credential,
                attempt,
                latency,
                Err((kind, err.request_id().map(str::to_string))),
            )
            .await;

            let label = credential.label().to_string();
            let outcome = match kind {
                ErrorKind::RateLimit => CallOutcome::RateLimited {
                    retry_after: err.retry_after(),
                },
                ErrorKind::Auth => CallOutcome::Rejected,
                _ => CallOutcome::Failed,
            };
            self.pool.release(credential, outcome);

            let delay = match kind {
                ErrorKind::Network | ErrorKind::RateLimit
                    if transient_retries < config.max_retries =>
                {
                    transient_retries += 1;
                    self.backoff_delay(transient_retries - 1)
                }
                ErrorKind::MalformedResponse if !malformed_retried => {
                    malformed_retried = true;
                    Duration::ZERO
                }
                _ => {
                    warn!(
                        attempt,
                        credential = %label,
                        error = %err,
                        kind = %kind,
                        "Completion failed; giving up"
                    );
                    return Err(err.into());
                }
            };

            warn!(
                attempt,
                credential = %label,
                error = %err,
                kind = %kind,
                delay_ms = delay.as_millis() as u64,
                "Completion attempt failed; retrying"
            );

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(CompletionError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Keys from `OPENROUTER_API_KEYS` (comma separated) or `OPENROUTER_API_KEY`.
pub fn api_keys_from_env() -> Result<Vec<String>, ProviderError> {
    let raw = std::env::var("OPENROUTER_API_KEYS")
        .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
        .map_err(|_| ProviderError::config("OPENROUTER_API_KEYS or OPENROUTER_API_KEY not set"))?;
    let keys = split_keys(&raw);
    if keys.is_empty() {
        return Err(ProviderError::config("no API keys configured"));
    }
    Ok(keys)
}

fn split_keys(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}
