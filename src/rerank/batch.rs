//! Concurrent reranking of many requests.
//!
//! Each request gets its own reranker and its own invocation log; the only
//! state shared between requests is the credential pool behind the gateway.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::gateway::{CompletionGateway, ErrorKind};

use super::types::{RerankError, RerankOptions, RerankOutcome, RerankStatus, Request};
use super::window::SlidingWindowReranker;

enum Slot {
    Running {
        handle: JoinHandle<RerankOutcome>,
        fallback: Request,
    },
    Finished(RerankOutcome),
}

/// Rerank `requests` with at most `options.concurrency_limit` in flight.
///
/// Outcomes come back in input order. Requests are admitted FIFO. Cancelling
/// `cancel` (or reaching `options.deadline_ms`) stops in-flight requests
/// promptly and returns queued ones untouched as `Cancelled`; requests that
/// already finished are unaffected.
pub async fn rerank_batch(
    gateway: Arc<dyn CompletionGateway>,
    requests: Vec<Request>,
    options: &RerankOptions,
    cancel: &CancelToken,
) -> Result<Vec<RerankOutcome>, RerankError> {
    let items = requests.into_iter().map(|r| (r, None)).collect();
    rerank_batch_with_tokens(gateway, items, options, cancel).await
}

/// Like [`rerank_batch`], with an optional token per request.
///
/// A request's own token cancels that request alone; `cancel` and the
/// deadline still cancel everything.
pub async fn rerank_batch_with_tokens(
    gateway: Arc<dyn CompletionGateway>,
    requests: Vec<(Request, Option<CancelToken>)>,
    options: &RerankOptions,
    cancel: &CancelToken,
) -> Result<Vec<RerankOutcome>, RerankError> {
    options.validate()?;

    let batch_id = Uuid::new_v4();
    let started = Instant::now();
    let total = requests.len();
    let options = Arc::new(options.clone());
    let semaphore = Arc::new(Semaphore::new(options.concurrency_limit));

    // Batch-scoped token: fires on caller cancel or on the deadline.
    let batch_cancel = CancelToken::new();
    let watcher = {
        let caller = cancel.clone();
        let batch_cancel = batch_cancel.clone();
        let deadline = options.deadline();
        tokio::spawn(async move {
            match deadline {
                Some(limit) => {
                    tokio::select! {
                        _ = caller.cancelled() => {}
                        _ = tokio::time::sleep(limit) => {
                            warn!(%batch_id, deadline_ms = limit.as_millis() as u64, "Batch deadline reached; cancelling");
                        }
                    }
                }
                None => caller.cancelled().await,
            }
            batch_cancel.cancel();
        })
    };

    info!(
        %batch_id,
        requests = total,
        concurrency = options.concurrency_limit,
        style = %options.prompt_style,
        model = %options.model,
        "Batch started"
    );

    let mut slots: Vec<Slot> = Vec::with_capacity(total);
    for (request, own) in requests {
        let token = match own {
            Some(own) => CancelToken::child_of(&[&batch_cancel, &own]),
            None => batch_cancel.clone(),
        };
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            permit = semaphore.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            slots.push(Slot::Finished(RerankOutcome::unranked(
                request,
                RerankStatus::Cancelled,
                Some(ErrorKind::Cancelled),
            )));
            continue;
        };

        let fallback = request.clone();
        let gateway = gateway.clone();
        let options = options.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            match SlidingWindowReranker::new(gateway.as_ref(), &options) {
                Ok(reranker) => reranker.with_batch(batch_id).rerank(request, &token).await,
                Err(e) => RerankOutcome::unranked(request, RerankStatus::Failed, None)
                    .with_detail(e.to_string()),
            }
        });
        slots.push(Slot::Running { handle, fallback });
    }

    let mut outcomes = Vec::with_capacity(total);
    for slot in slots {
        let outcome = match slot {
            Slot::Finished(outcome) => outcome,
            Slot::Running { handle, fallback } => match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(%batch_id, query_id = %fallback.query.id, error = %e, "Rerank task failed");
                    RerankOutcome::unranked(fallback, RerankStatus::Failed, None)
                        .with_detail(format!("rerank task failed: {e}"))
                }
            },
        };
        outcomes.push(outcome);
    }
    watcher.abort();

    let count = |status: RerankStatus| outcomes.iter().filter(|o| o.status == status).count();
    info!(
        %batch_id,
        complete = count(RerankStatus::Complete),
        degraded = count(RerankStatus::Degraded),
        failed = count(RerankStatus::Failed),
        cancelled = count(RerankStatus::Cancelled),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Batch finished"
    );

    Ok(outcomes)
}
