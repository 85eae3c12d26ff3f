//! Listwise reranking.
//!
//! - `window`: sliding-window reranking of a single request
//! - `batch`: bounded-concurrency fan-out over many requests
//! - `parse`: decoding model output into permutations
//! - `trace`: JSONL export of captured invocation history

pub mod batch;
pub mod parse;
pub mod trace;
pub mod types;
pub mod window;

pub use batch::{rerank_batch, rerank_batch_with_tokens};
pub use parse::{decode, parse, ParseError, ParsedRanking, RankingResult};
pub use trace::{JsonlTraceSink, TraceError, TraceSink, TraceWorker};
pub use types::*;
pub use window::{plan_windows, Phase, SlidingWindowReranker, WindowError};
