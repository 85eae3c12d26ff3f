mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{client_with, france_request, graded_request, OracleResponder};
use rankwise::gateway::{AttemptOutcome, ErrorKind, OpenRouterAdapter};
use rankwise::rerank::{rerank_batch, RerankOptions, RerankStatus};
use rankwise::CancelToken;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn adapter(server: &MockServer) -> Arc<OpenRouterAdapter> {
    Arc::new(OpenRouterAdapter::with_config(server.uri(), Duration::from_secs(5), None, None).unwrap())
}

fn options() -> RerankOptions {
    RerankOptions {
        window_size: 4,
        stride: 2,
        concurrency_limit: 3,
        capture_history: true,
        ..RerankOptions::default()
    }
}

fn bearer(request: &Request) -> String {
    request
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn batch_reranks_over_http_and_rotates_keys() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(OracleResponder)
        .mount(&server)
        .await;

    let client = client_with(adapter(&server), &["sk-a", "sk-b"]);
    let requests = vec![
        france_request(),
        graded_request("q2", &[2, 7, 1, 8, 3, 6]),
        graded_request("q3", &[5, 4, 3, 2, 1]),
    ];

    let outcomes = rerank_batch(Arc::new(client), requests, &options(), &CancelToken::new())
        .await
        .unwrap();

    assert!(outcomes.iter().all(|o| o.status == RerankStatus::Complete));
    assert_eq!(outcomes[0].ids(), vec!["doc3", "doc2", "doc1"]);
    assert_eq!(outcomes[1].ids()[0], "c3");
    assert_eq!(outcomes[2].ids(), vec!["c0", "c1", "c2", "c3", "c4"]);

    let calls: usize = outcomes.iter().map(|o| o.stats.model_calls).sum();
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), calls);

    let mut keys: Vec<String> = received.iter().map(bearer).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys, vec!["Bearer sk-a", "Bearer sk-b"]);

    assert_eq!(outcomes[0].stats.input_tokens, 100);
    assert_eq!(outcomes[0].stats.output_tokens, 12);
}

#[tokio::test]
async fn rate_limited_key_is_skipped_for_the_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-a"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "2")
                .set_body_json(json!({ "error": { "message": "rate limited" } })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-b"))
        .respond_with(OracleResponder)
        .mount(&server)
        .await;

    let client = client_with(adapter(&server), &["sk-a", "sk-b"]);
    let opts = RerankOptions {
        concurrency_limit: 1,
        ..options()
    };

    let outcomes = rerank_batch(
        Arc::new(client),
        vec![france_request()],
        &opts,
        &CancelToken::new(),
    )
    .await
    .unwrap();

    let outcome = &outcomes[0];
    assert_eq!(outcome.status, RerankStatus::Complete);
    assert_eq!(outcome.ids(), vec!["doc3", "doc2", "doc1"]);

    let history = outcome.history.as_ref().unwrap();
    assert_eq!(history.len(), 2);
    assert!(matches!(
        history[0].outcome,
        AttemptOutcome::Failed {
            kind: ErrorKind::RateLimit,
            ..
        }
    ));
    assert_eq!(history[0].credential.as_deref(), Some("key#0"));
    assert_eq!(history[1].outcome, AttemptOutcome::Success);
    assert_eq!(history[1].credential.as_deref(), Some("key#1"));
    assert_eq!(history[0].prompt_hash, history[1].prompt_hash);
}

#[tokio::test]
async fn rejected_keys_degrade_the_request_without_reordering() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({ "error": { "message": "bad key" } })),
        )
        .mount(&server)
        .await;

    let client = client_with(adapter(&server), &["sk-a"]);
    let outcomes = rerank_batch(
        Arc::new(client),
        vec![france_request()],
        &options(),
        &CancelToken::new(),
    )
    .await
    .unwrap();

    let outcome = &outcomes[0];
    assert_eq!(outcome.status, RerankStatus::Degraded);
    assert_eq!(outcome.error, Some(ErrorKind::Auth));
    assert_eq!(outcome.ids(), vec!["doc1", "doc2", "doc3"]);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
