mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{client_with, ScriptedProvider, Step};
use rankwise::gateway::{
    AttemptOutcome, Attribution, ChatModel, CompletionClient, CompletionError, CompletionGateway,
    CredentialPool, CredentialPoolConfig, ErrorKind, InvocationLog, Message, ModelConfig,
    ProviderCallRecord, UsageSink,
};
use rankwise::CancelToken;

fn model(max_retries: u32) -> ModelConfig {
    ModelConfig::new(ChatModel::openrouter("google/gemma-3-27b-it"))
        .max_retries(max_retries)
        .per_attempt_timeout(Duration::from_secs(5))
}

fn prompt() -> Vec<Message> {
    vec![Message::system("rank"), Message::user("[1] a\n[2] b")]
}

async fn complete(
    client: &dyn CompletionGateway,
    config: &ModelConfig,
    log: &mut InvocationLog,
) -> Result<String, CompletionError> {
    client
        .complete(
            &prompt(),
            config,
            &Attribution::new("test").with_query("q1"),
            &CancelToken::new(),
            log,
        )
        .await
        .map(|r| r.content)
}

#[tokio::test(start_paused = true)]
async fn network_errors_are_retried_then_succeed() {
    let provider = ScriptedProvider::new(vec![Step::Network, Step::Network, Step::reply("[2] > [1]")]);
    let client = client_with(provider.clone(), &["k0", "k1"]);
    let mut log = InvocationLog::enabled();

    let text = complete(&client, &model(2), &mut log).await.unwrap();
    assert_eq!(text, "[2] > [1]");
    assert_eq!(provider.calls(), 3);

    let records = log.into_records().unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(
        records.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(matches!(
        records[0].outcome,
        AttemptOutcome::Failed {
            kind: ErrorKind::Network,
            ..
        }
    ));
    assert_eq!(records[2].outcome, AttemptOutcome::Success);
    assert_eq!(records[2].response.as_deref(), Some("[2] > [1]"));
    assert_eq!(records[0].prompt_hash, records[2].prompt_hash);
    assert_eq!(records[0].query_id.as_deref(), Some("q1"));
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_max_retries() {
    let provider = ScriptedProvider::new(vec![Step::Network]);
    let client = client_with(provider.clone(), &["k0"]);
    let mut log = InvocationLog::disabled();

    let err = complete(&client, &model(2), &mut log).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(provider.calls(), 3);
    assert!(log.into_records().is_none());
}

#[tokio::test(start_paused = true)]
async fn auth_failure_is_not_retried_and_disables_the_key() {
    let provider = ScriptedProvider::new(vec![Step::Auth, Step::reply("[1] > [2]")]);
    let client = client_with(provider.clone(), &["bad", "good"]);
    let mut log = InvocationLog::enabled();

    let err = complete(&client, &model(3), &mut log).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(provider.calls(), 1);

    let status = client.pool().snapshot();
    assert!(status[0].disabled);
    assert!(!status[1].disabled);

    // The next completion only ever sees the remaining key.
    let text = complete(&client, &model(3), &mut log).await.unwrap();
    assert_eq!(text, "[1] > [2]");
    assert_eq!(provider.keys_used(), vec!["bad", "good"]);
}

#[tokio::test(start_paused = true)]
async fn malformed_response_gets_exactly_one_re_request() {
    let provider = ScriptedProvider::new(vec![Step::Malformed]);
    let client = client_with(provider.clone(), &["k0"]);
    let mut log = InvocationLog::enabled();

    let err = complete(&client, &model(5), &mut log).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    assert_eq!(provider.calls(), 2);
    assert_eq!(log.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_key_cools_down_and_rotation_moves_on() {
    let provider = ScriptedProvider::new(vec![
        Step::RateLimited(Some(Duration::from_secs(2))),
        Step::reply("[1] > [2]"),
    ]);
    let client = client_with(provider.clone(), &["k0", "k1"]);
    let mut log = InvocationLog::enabled();

    let text = complete(&client, &model(2), &mut log).await.unwrap();
    assert_eq!(text, "[1] > [2]");
    assert_eq!(provider.keys_used(), vec!["k0", "k1"]);

    let status = client.pool().snapshot();
    assert_eq!(status[0].failures, 1);
    let remaining = status[0].cooldown_remaining.expect("k0 cooling down");
    assert!(remaining > Duration::from_secs(1));

    let records = log.into_records().unwrap();
    assert_eq!(records[0].credential.as_deref(), Some("key#0"));
    assert_eq!(records[1].credential.as_deref(), Some("key#1"));
}

#[tokio::test(start_paused = true)]
async fn every_key_cooling_surfaces_exhausted() {
    let provider = ScriptedProvider::new(vec![Step::RateLimited(Some(Duration::from_secs(60)))]);
    let pool = CredentialPool::new(
        ["k0"],
        CredentialPoolConfig {
            cooldown_base: Duration::from_secs(30),
            cooldown_cap: Duration::from_secs(120),
            max_wait: Duration::from_secs(1),
        },
    )
    .unwrap();
    let client = CompletionClient::with_config(
        provider.clone(),
        Arc::new(pool),
        Arc::new(rankwise::gateway::NoopUsageSink),
        common::fast_gateway(),
    );
    let mut log = InvocationLog::enabled();

    let err = complete(&client, &model(2), &mut log).await.unwrap_err();
    assert!(matches!(err, CompletionError::Exhausted(_)));
    assert_eq!(err.kind(), ErrorKind::Exhausted);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_attempt_times_out_and_is_retried() {
    let provider = ScriptedProvider::new(vec![
        Step::After(Duration::from_secs(30), Box::new(Step::reply("late"))),
        Step::reply("[1] > [2]"),
    ]);
    let client = client_with(provider.clone(), &["k0"]);
    let mut log = InvocationLog::enabled();

    let config = model(1).per_attempt_timeout(Duration::from_secs(2));
    let text = complete(&client, &config, &mut log).await.unwrap();
    assert_eq!(text, "[1] > [2]");

    let records = log.into_records().unwrap();
    assert!(matches!(
        records[0].outcome,
        AttemptOutcome::Failed {
            kind: ErrorKind::Network,
            ..
        }
    ));
    assert_eq!(records[1].outcome, AttemptOutcome::Success);
    assert_eq!(provider.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_an_in_flight_call() {
    let provider = ScriptedProvider::new(vec![Step::After(
        Duration::from_secs(3600),
        Box::new(Step::reply("[1] > [2]")),
    )]);
    let client = Arc::new(client_with(provider.clone(), &["k0"]));
    let cancel = CancelToken::new();

    let task = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut log = InvocationLog::enabled();
            let res = client
                .complete(
                    &prompt(),
                    &model(2).per_attempt_timeout(Duration::from_secs(7200)),
                    &Attribution::new("test"),
                    &cancel,
                    &mut log,
                )
                .await;
            (res, log)
        })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();

    let started = tokio::time::Instant::now();
    let (res, log) = task.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(res, Err(CompletionError::Cancelled)));

    let records = log.into_records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AttemptOutcome::Cancelled);
    assert_eq!(client.pool().snapshot()[0].leases, 0);
}

#[derive(Default)]
struct CollectingSink {
    records: Mutex<Vec<ProviderCallRecord>>,
}

#[async_trait]
impl UsageSink for CollectingSink {
    async fn record(&self, record: ProviderCallRecord) {
        self.records.lock().unwrap().push(record);
    }
}

#[tokio::test(start_paused = true)]
async fn every_attempt_is_reported_to_the_usage_sink() {
    let provider = ScriptedProvider::new(vec![Step::Network, Step::reply("[1]")]);
    let pool = CredentialPool::new(["k0"], CredentialPoolConfig::default()).unwrap();
    let sink = Arc::new(CollectingSink::default());
    let client = CompletionClient::with_config(
        provider,
        Arc::new(pool),
        sink.clone(),
        common::fast_gateway(),
    );
    let mut log = InvocationLog::disabled();

    complete(&client, &model(2), &mut log).await.unwrap();

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].error_kind, Some(ErrorKind::Network));
    assert_eq!(records[1].error_kind, None);
    assert_eq!(records[1].attempt, 2);
    assert_eq!(records[1].query_id.as_deref(), Some("q1"));
    assert_eq!(records[1].credential.as_deref(), Some("key#0"));
}
