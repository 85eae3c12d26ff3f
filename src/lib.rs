#![forbid(unsafe_code)]

//! # rankwise
//!
//! Listwise LLM reranking over context-bounded sliding windows.
//!
//! A long candidate list is cut into overlapping windows that each fit the
//! model's context. Windows are ranked from the bottom of the list to the top,
//! so relevant candidates move forward one stride per window. Model output is
//! parsed tolerantly into a permutation and spliced back in place.
//!
//! Calls go through a [`gateway::CompletionClient`] that rotates a pool of API
//! keys, cools down rate-limited keys, and retries transient failures.
//! [`rerank_batch`] runs many requests concurrently with per-request failure
//! isolation and cooperative cancellation.

pub mod cancel;
pub mod gateway;
pub mod prompts;
pub mod rerank;
pub mod tokens;

pub use cancel::CancelToken;
pub use gateway::{
    Attribution, CompletionClient, CompletionGateway, CredentialPool, ErrorKind, InvocationRecord,
    OpenRouterAdapter, UsageSink,
};
pub use prompts::{PromptBuilder, PromptStyle};
pub use rerank::{
    rerank_batch, rerank_batch_with_tokens, Candidate, JsonlTraceSink, Query, RerankError,
    RerankOptions, RerankOutcome, RerankStatus, Request, SlidingWindowReranker, TraceError,
    TraceSink, TraceWorker,
};
