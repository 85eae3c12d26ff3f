#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rankwise::gateway::{
    Attribution, ChatModel, ChatProvider, ChatRequest, ChatResponse, CompletionClient,
    CredentialPool, CredentialPoolConfig, ErrorContext, GatewayConfig, Message, NoopUsageSink,
    ProviderError,
};
use rankwise::rerank::{Candidate, Query, Request};
use regex::Regex;
use serde_json::{json, Value};
use wiremock::{Respond, ResponseTemplate};

/// One scripted provider reaction.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    RateLimited(Option<Duration>),
    Network,
    Auth,
    Malformed,
    /// Sleep, then react.
    After(Duration, Box<Step>),
}

impl Step {
    pub fn reply(text: impl Into<String>) -> Self {
        Step::Reply(text.into())
    }
}

/// Replays a fixed script; repeats the last step once the script runs out.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    pub keys: Mutex<Vec<String>>,
    pub prompts: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            keys: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    pub fn keys_used(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        match steps.pop_front() {
            Some(step) => {
                *last = Some(step.clone());
                step
            }
            None => last.clone().unwrap_or(Step::Network),
        }
    }
}

async fn react(mut step: Step) -> Result<ChatResponse, ProviderError> {
    loop {
        return match step {
            Step::After(delay, inner) => {
                tokio::time::sleep(delay).await;
                step = *inner;
                continue;
            }
            Step::Reply(text) => Ok(ChatResponse::text(text)),
            Step::RateLimited(retry_after) => Err(ProviderError::rate_limited(
                retry_after,
                ErrorContext::new().with_status(429),
            )),
            Step::Network => Err(ProviderError::network("test", "connection reset")),
            Step::Auth => Err(ProviderError::auth(
                "invalid key",
                ErrorContext::new().with_status(401),
            )),
            Step::Malformed => Err(ProviderError::malformed("no choices")),
        };
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(&self, req: &ChatRequest, api_key: &str) -> Result<ChatResponse, ProviderError> {
        self.keys.lock().unwrap().push(api_key.to_string());
        self.prompts.lock().unwrap().push(req.clone());
        let step = self.next_step();
        react(step).await
    }
}

/// Ranks passages by the `rel=N` tag embedded in their text, highest first.
///
/// Understands all three prompt styles. Queries containing any of `slow`
/// sleep for `slow_delay` before answering.
pub struct OracleProvider {
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub slow: Vec<String>,
    pub slow_delay: Duration,
    pub latency: Duration,
}

impl OracleProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            slow: Vec::new(),
            slow_delay: Duration::ZERO,
            latency: Duration::ZERO,
        })
    }

    pub fn with_slow(slow: &[&str], slow_delay: Duration, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            slow: slow.iter().map(|s| s.to_string()).collect(),
            slow_delay,
            latency,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn oracle_answer(req: &ChatRequest) -> String {
    let bracket = Regex::new(r"(?m)^\[(\d+)\] .*?rel=(\d+)").unwrap();
    let passage = Regex::new(r"(?m)^PASSAGE(\d+) = .*?rel=(\d+)").unwrap();
    let all: String = req
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let lrl = passage.is_match(&all);
    let re = if lrl { &passage } else { &bracket };
    let mut found: Vec<(usize, u32)> = re
        .captures_iter(&all)
        .map(|c| (c[1].parse().unwrap(), c[2].parse().unwrap()))
        .collect();
    found.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let pairwise = all.contains("[i] > [j]");
    if pairwise {
        let mut lines = Vec::new();
        for i in 0..found.len() {
            for j in i + 1..found.len() {
                lines.push(format!("[{}] > [{}]", found[i].0, found[j].0));
            }
        }
        lines.join("\n")
    } else if lrl {
        let ids: Vec<String> = found.iter().map(|(n, _)| format!("PASSAGE{n}")).collect();
        format!("{}]", ids.join(", "))
    } else {
        let ids: Vec<String> = found.iter().map(|(n, _)| format!("[{n}]")).collect();
        ids.join(" > ")
    }
}

#[async_trait]
impl ChatProvider for OracleProvider {
    async fn chat(&self, req: &ChatRequest, _api_key: &str) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let is_slow = req
            .messages
            .iter()
            .any(|m| self.slow.iter().any(|s| m.content.contains(s.as_str())));
        let delay = if is_slow { self.slow_delay } else { self.latency };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ChatResponse::text(oracle_answer(req)))
    }
}

/// Cycles through sloppy variants of the oracle answer: clean, repeated with
/// out-of-range identifiers, cut in half, and prose with no ranking at all.
pub struct MessyProvider {
    pub calls: AtomicUsize,
}

impl MessyProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for MessyProvider {
    async fn chat(&self, req: &ChatRequest, _api_key: &str) -> Result<ChatResponse, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = oracle_answer(req);
        let text = match n % 4 {
            0 => answer,
            1 => format!("{answer}\n{answer} > [99] > [0], PASSAGE99, PASSAGE0]"),
            2 => answer[..answer.len() / 2].to_string(),
            _ => "I am not able to rank these passages.".to_string(),
        };
        Ok(ChatResponse::text(text))
    }
}

/// Answers chat completions by ranking on the `rel=N` tags in the prompt.
pub struct OracleResponder;

impl Respond for OracleResponder {
    fn respond(&self, request: &wiremock::Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let messages: Vec<Message> = serde_json::from_value(body["messages"].clone()).unwrap();
        let model = body["model"].as_str().unwrap_or_default();
        let chat = ChatRequest::new(
            ChatModel::openrouter(model),
            messages,
            Attribution::new("mock"),
        );
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": oracle_answer(&chat) },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 100, "completion_tokens": 12 }
        }))
    }
}

pub fn fast_gateway() -> GatewayConfig {
    GatewayConfig {
        retry_base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        jitter: 0.0,
    }
}

pub fn client_with(
    provider: Arc<dyn ChatProvider>,
    keys: &[&str],
) -> CompletionClient<NoopUsageSink> {
    let pool = CredentialPool::new(
        keys.iter().copied(),
        CredentialPoolConfig {
            cooldown_base: Duration::from_millis(100),
            cooldown_cap: Duration::from_secs(5),
            max_wait: Duration::from_secs(10),
        },
    )
    .unwrap();
    CompletionClient::with_config(provider, Arc::new(pool), Arc::new(NoopUsageSink), fast_gateway())
}

/// Candidates `c0..cN` whose relevance is given by `rels` (higher is better).
pub fn graded_request(query_id: &str, rels: &[u32]) -> Request {
    let candidates = rels
        .iter()
        .enumerate()
        .map(|(i, rel)| Candidate::text(format!("c{i}"), format!("document {i} rel={rel}")))
        .collect();
    Request::new(Query::new(query_id, format!("query {query_id}")), candidates)
}

pub fn france_request() -> Request {
    Request::new(
        Query::new("1", "What is the capital of France?"),
        vec![
            Candidate::text("doc1", "Berlin is the capital of Germany. rel=1"),
            Candidate::text("doc2", "Beijing is the capital of China. rel=2"),
            Candidate::text("doc3", "Paris is the capital of France. rel=9"),
        ],
    )
}

pub fn sorted_ids(ids: &[&str]) -> Vec<String> {
    let mut v: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
    v.sort();
    v
}
