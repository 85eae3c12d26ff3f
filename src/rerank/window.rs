//! Listwise sliding-window reranking of one request.
//!
//! Windows are visited from the end of the list toward the start, so strong
//! candidates found late in the list bubble forward one stride at a time. Each
//! window's permutation is spliced back in place before the next window is
//! built, and the whole traversal repeats `num_passes` times.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::gateway::{
    Attribution, CompletionError, CompletionGateway, ErrorKind, InvocationLog, ModelConfig,
};
use crate::prompts::{PromptBuilder, TruncationError};

use super::parse::{decode, ParseError, ParsedRanking, RankingResult};
use super::types::{
    Candidate, Query, RerankError, RerankOptions, RerankOutcome, RerankStats, RerankStatus,
    Request, WindowFailure,
};

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Windowing { pass: usize },
    Scoring { pass: usize, start: usize, end: usize },
    Merging { pass: usize, start: usize, end: usize },
    Done,
    Failed,
    Cancelled,
}

/// Why a single window kept its incoming order.
#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    #[error(transparent)]
    Truncation(#[from] TruncationError),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("model ranking does not match the window ids")]
    Mismatch,
}

impl WindowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WindowError::Truncation(e) => e.kind(),
            WindowError::Completion(e) => e.kind(),
            WindowError::Parse(e) => e.kind(),
            WindowError::Mismatch => ErrorKind::Unparsable,
        }
    }
}

/// `[start, end)` ranges for one pass, last window first.
///
/// The final window always starts at 0; lists no longer than `window_size`
/// get a single window.
pub fn plan_windows(len: usize, window_size: usize, stride: usize) -> Vec<(usize, usize)> {
    if len == 0 {
        return Vec::new();
    }
    let stride = stride.max(1);
    let mut windows = Vec::new();
    let mut end = len;
    loop {
        let start = end.saturating_sub(window_size);
        windows.push((start, end));
        if start == 0 {
            break;
        }
        end -= stride;
    }
    windows
}

pub struct SlidingWindowReranker<'a> {
    gateway: &'a dyn CompletionGateway,
    options: &'a RerankOptions,
    builder: PromptBuilder,
    model: ModelConfig,
    batch_id: Option<Uuid>,
}

impl<'a> SlidingWindowReranker<'a> {
    pub fn new(
        gateway: &'a dyn CompletionGateway,
        options: &'a RerankOptions,
    ) -> Result<Self, RerankError> {
        options.validate()?;
        Ok(Self {
            gateway,
            options,
            builder: PromptBuilder::new(options.prompt_style)
                .max_passage_tokens(options.max_passage_tokens),
            model: options.model_config(),
            batch_id: None,
        })
    }

    pub fn with_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    /// Rerank one request. Every input candidate comes back exactly once,
    /// whatever the terminal status.
    pub async fn rerank(&self, request: Request, cancel: &CancelToken) -> RerankOutcome {
        if let Err(e) = request.validate() {
            warn!(query_id = %request.query.id, error = %e, "Rejecting request");
            return RerankOutcome::unranked(request, RerankStatus::Failed, None)
                .with_detail(e.to_string());
        }

        let started = Instant::now();
        let mut run = Run::new(request.query, request.candidates, self.options.capture_history);

        self.drive(&mut run, cancel).await;

        run.finish(started)
    }

    async fn drive(&self, run: &mut Run, cancel: &CancelToken) {
        let mut attribution = Attribution::new("rerank::window").with_query(run.query.id.clone());
        if let Some(batch_id) = self.batch_id {
            attribution = attribution.with_batch(batch_id);
        }

        let n = run.candidates.len();
        for pass in 0..self.options.num_passes {
            run.enter(Phase::Windowing { pass });
            for (start, end) in plan_windows(n, self.options.window_size, self.options.stride) {
                if cancel.is_cancelled() {
                    run.enter(Phase::Cancelled);
                    return;
                }
                if end - start < 2 {
                    continue;
                }

                run.enter(Phase::Scoring { pass, start, end });
                run.stats.windows += 1;
                let result = self
                    .rank_window(run, start, end, &attribution, cancel)
                    .await;

                match result {
                    Ok(ranking) => {
                        run.enter(Phase::Merging { pass, start, end });
                        if let Err(e) = run.merge(start, end, &ranking) {
                            if self.record_failure(run, pass, start, end, e) {
                                return;
                            }
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Cancelled => {
                        run.error.get_or_insert(ErrorKind::Cancelled);
                        run.enter(Phase::Cancelled);
                        return;
                    }
                    Err(e) => {
                        if self.record_failure(run, pass, start, end, e) {
                            return;
                        }
                    }
                }
            }
        }
        run.enter(Phase::Done);
    }

    /// Record a passthrough window. Returns true when the request must stop.
    fn record_failure(
        &self,
        run: &mut Run,
        pass: usize,
        start: usize,
        end: usize,
        err: WindowError,
    ) -> bool {
        let kind = err.kind();
        warn!(
            query_id = %run.query.id,
            pass,
            start,
            end,
            kind = %kind,
            error = %err,
            "Window kept its incoming order"
        );
        run.error.get_or_insert(kind);
        run.failures.push(WindowFailure {
            pass,
            start,
            end,
            kind,
            message: err.to_string(),
        });

        match self.options.max_window_failures {
            Some(max) if run.failures.len() > max => {
                run.enter(Phase::Failed);
                true
            }
            _ => false,
        }
    }

    async fn rank_window(
        &self,
        run: &mut Run,
        start: usize,
        end: usize,
        attribution: &Attribution,
        cancel: &CancelToken,
    ) -> Result<RankingResult, WindowError> {
        let window = &run.candidates[start..end];
        let prompt = self
            .builder
            .build(&run.query.text, window, self.options.prompt_budget())?;
        let ids: Vec<String> = window.iter().map(|c| c.id.clone()).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let mut parse_retries = 0u32;
        loop {
            let response = self
                .gateway
                .complete(&prompt.messages, &self.model, attribution, cancel, &mut run.log)
                .await?;
            run.stats.model_calls += 1;
            run.stats.input_tokens += u64::from(response.input_tokens);
            run.stats.output_tokens += u64::from(response.output_tokens);

            match decode(&response.content, &id_refs, self.builder.style()) {
                ParsedRanking::Complete(ranking) => return Ok(ranking),
                ParsedRanking::PartialWithFallback { ranking, appended } => {
                    debug!(
                        query_id = %run.query.id,
                        start,
                        end,
                        appended = appended.len(),
                        "Model omitted candidates; appended in incoming order"
                    );
                    return Ok(ranking);
                }
                ParsedRanking::Unparsable { excerpt } => {
                    if parse_retries < self.options.unparsable_retries {
                        parse_retries += 1;
                        warn!(
                            query_id = %run.query.id,
                            start,
                            end,
                            retry = parse_retries,
                            excerpt = %excerpt,
                            "Unparsable ranking; asking again"
                        );
                        continue;
                    }
                    return Err(ParseError::Unparsable { excerpt }.into());
                }
            }
        }
    }
}

/// Mutable state of one request while its windows are processed.
struct Run {
    query: Query,
    candidates: Vec<Candidate>,
    model_scores: HashMap<String, f64>,
    failures: Vec<WindowFailure>,
    error: Option<ErrorKind>,
    log: InvocationLog,
    stats: RerankStats,
    phase: Phase,
}

impl Run {
    fn new(query: Query, candidates: Vec<Candidate>, capture_history: bool) -> Self {
        Self {
            query,
            candidates,
            model_scores: HashMap::new(),
            failures: Vec::new(),
            error: None,
            log: InvocationLog::new(capture_history),
            stats: RerankStats::default(),
            phase: Phase::Init,
        }
    }

    fn enter(&mut self, next: Phase) {
        debug!(query_id = %self.query.id, from = ?self.phase, to = ?next, "Phase");
        self.phase = next;
    }

    /// Splice the window's permutation back in place.
    fn merge(&mut self, start: usize, end: usize, ranking: &RankingResult) -> Result<(), WindowError> {
        let positions: HashMap<&str, usize> = self.candidates[start..end]
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.as_str(), i))
            .collect();

        let mut perm = Vec::with_capacity(end - start);
        let mut used = vec![false; end - start];
        for id in &ranking.order {
            let &i = positions.get(id.as_str()).ok_or(WindowError::Mismatch)?;
            if std::mem::replace(&mut used[i], true) {
                return Err(WindowError::Mismatch);
            }
            perm.push(i);
        }
        if perm.len() != end - start {
            return Err(WindowError::Mismatch);
        }

        let mut drained: Vec<Option<Candidate>> =
            self.candidates.drain(start..end).map(Some).collect();
        let reordered: Vec<Candidate> = perm.iter().filter_map(|&i| drained[i].take()).collect();
        self.candidates.splice(start..start, reordered);

        if let Some(scores) = &ranking.scores {
            for (id, score) in ranking.order.iter().zip(scores) {
                self.model_scores.insert(id.clone(), *score);
            }
        }
        Ok(())
    }

    fn finish(mut self, started: Instant) -> RerankOutcome {
        assign_scores(&mut self.candidates, &self.model_scores);

        let status = match self.phase {
            Phase::Cancelled => RerankStatus::Cancelled,
            Phase::Failed => RerankStatus::Failed,
            _ if self.failures.is_empty() => RerankStatus::Complete,
            _ => RerankStatus::Degraded,
        };
        if status == RerankStatus::Cancelled {
            self.error.get_or_insert(ErrorKind::Cancelled);
        }
        self.stats.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            query_id = %self.query.id,
            status = ?status,
            candidates = self.candidates.len(),
            windows = self.stats.windows,
            failed_windows = self.failures.len(),
            model_calls = self.stats.model_calls,
            elapsed_ms = self.stats.elapsed_ms,
            "Rerank finished"
        );

        RerankOutcome {
            query: self.query,
            candidates: self.candidates,
            status,
            error: self.error,
            detail: None,
            window_failures: self.failures,
            history: self.log.into_records(),
            stats: self.stats,
        }
    }
}

/// Keep model scores when every candidate has one and they agree with the
/// final order; otherwise score by rank as 1 / (rank + 1).
fn assign_scores(candidates: &mut [Candidate], model_scores: &HashMap<String, f64>) {
    let scores: Option<Vec<f64>> = candidates
        .iter()
        .map(|c| model_scores.get(&c.id).copied().filter(|s| s.is_finite()))
        .collect();

    match scores {
        Some(scores) if scores.windows(2).all(|w| w[0] >= w[1]) => {
            for (c, s) in candidates.iter_mut().zip(scores) {
                c.score = s;
            }
        }
        _ => {
            for (rank, c) in candidates.iter_mut().enumerate() {
                c.score = 1.0 / (rank as f64 + 1.0);
            }
        }
    }
}
