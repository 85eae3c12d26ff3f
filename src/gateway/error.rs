//! Error types for the provider gateway.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes surfaced by the engine.
///
/// The first four are backend classifications; the rest are raised by the
/// pool, the prompt builder, the parser, or the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimit,
    Auth,
    MalformedResponse,
    Unparsable,
    Truncation,
    Exhausted,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Auth => "auth",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::Unparsable => "unparsable",
            ErrorKind::Truncation => "truncation",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Transient kinds are retried inside the completion client.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::RateLimit)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Additional context from provider errors for debugging.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// HTTP status code from the provider.
    pub http_status: Option<u16>,
    /// Provider-specific error code (e.g. "rate_limit_exceeded").
    pub provider_code: Option<String>,
    /// Request ID from provider (x-request-id header).
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Errors that can occur when calling a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Provider returned 429. `retry_after` carries the Retry-After hint, if any.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Option<Duration>,
        context: Option<ErrorContext>,
    },

    /// Credential rejected (401/403) - permanent for this credential.
    #[error("authentication rejected: {message}")]
    Auth {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Transport or upstream failure (5xx, 408, connection reset).
    #[error("{provider} unavailable: {message}")]
    Network {
        provider: &'static str,
        message: String,
        context: Option<ErrorContext>,
    },

    /// Attempt did not complete within the per-attempt timeout.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Response arrived but could not be understood (bad JSON, no choices, empty content).
    #[error("malformed response: {message}")]
    Malformed {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Request rejected as invalid (other 4xx, oversized input).
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    /// HTTP/network error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error (missing API key, bad header value, etc.).
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn rate_limited(retry_after: Option<Duration>, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            context: Some(context),
        }
    }

    pub fn auth(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Auth {
            message: message.into(),
            context: Some(context),
        }
    }

    pub fn network(provider: &'static str, message: impl Into<String>) -> Self {
        Self::Network {
            provider,
            message: message.into(),
            context: None,
        }
    }

    pub fn network_with_context(
        provider: &'static str,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> Self {
        Self::Network {
            provider,
            message: message.into(),
            context: Some(context),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
            context: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: None,
        }
    }

    pub fn invalid_request_with_context(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: Some(context),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Map onto the engine's four backend failure kinds.
    ///
    /// Config problems are credential problems from the engine's view; invalid
    /// requests get the malformed treatment (one re-request, then give up).
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::Auth { .. } | Self::Config(_) => ErrorKind::Auth,
            Self::Network { .. } | Self::Timeout(_) => ErrorKind::Network,
            Self::Http(e) => {
                if e.is_decode() {
                    ErrorKind::MalformedResponse
                } else {
                    ErrorKind::Network
                }
            }
            Self::Malformed { .. } | Self::InvalidRequest { .. } => ErrorKind::MalformedResponse,
        }
    }

    /// Whether this error is retryable with backoff.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_transient()
    }

    /// Provider-requested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Get a short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Auth { .. } => "auth_rejected",
            Self::Network { .. } => "provider_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Malformed { .. } => "malformed_response",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Get the error context if available.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. } => context.as_ref(),
            Self::Auth { context, .. } => context.as_ref(),
            Self::Network { context, .. } => context.as_ref(),
            Self::Malformed { context, .. } => context.as_ref(),
            Self::InvalidRequest { context, .. } => context.as_ref(),
            Self::Timeout(_) => None,
            Self::Http(_) => None,
            Self::Config(_) => None,
        }
    }

    /// Get the request ID if available.
    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}
