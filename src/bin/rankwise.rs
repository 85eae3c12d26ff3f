#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rankwise::gateway::{
    api_keys_from_env, CompletionClient, CredentialPool, CredentialPoolConfig, OpenRouterAdapter,
    StderrUsageSink,
};
use rankwise::prompts::{passage_text, PromptStyle};
use rankwise::rerank::{
    rerank_batch, Candidate, JsonlTraceSink, Query, RerankOptions, RerankOutcome, Request,
    TraceSink,
};
use rankwise::CancelToken;

#[derive(Parser)]
#[command(name = "rankwise", version, about = "Listwise LLM reranking CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rerank requests from a JSON file (LLM calls)
    Rerank {
        /// JSON array of requests, or a single request object
        #[arg(long)]
        requests: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Options file (.toml or .json); flags override its values
        #[arg(long)]
        options: Option<PathBuf>,
        /// Write captured invocation history as JSONL (implies capture)
        #[arg(long)]
        history: Option<PathBuf>,
        #[command(flatten)]
        overrides: OptionOverrides,
        #[command(flatten)]
        pool: PoolArgs,
    },
    /// Rank three capital-city passages for "What is the capital of France?"
    Demo {
        #[arg(long)]
        history: Option<PathBuf>,
        #[command(flatten)]
        overrides: OptionOverrides,
        #[command(flatten)]
        pool: PoolArgs,
    },
}

#[derive(Args)]
struct OptionOverrides {
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    context_size: Option<usize>,
    #[arg(long)]
    max_output_tokens: Option<u32>,
    #[arg(long)]
    window_size: Option<usize>,
    #[arg(long)]
    stride: Option<usize>,
    #[arg(long)]
    num_passes: Option<usize>,
    /// rank_gpt, lrl or pairwise
    #[arg(long)]
    prompt_style: Option<PromptStyle>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long)]
    max_window_failures: Option<usize>,
    #[arg(long)]
    deadline_ms: Option<u64>,
    #[arg(long)]
    capture_history: bool,
}

impl OptionOverrides {
    fn apply(self, opts: &mut RerankOptions) {
        if let Some(v) = self.model {
            opts.model = v;
        }
        if let Some(v) = self.context_size {
            opts.context_size = v;
        }
        if let Some(v) = self.max_output_tokens {
            opts.max_output_tokens = v;
        }
        if let Some(v) = self.window_size {
            opts.window_size = v;
        }
        if let Some(v) = self.stride {
            opts.stride = v;
        }
        if let Some(v) = self.num_passes {
            opts.num_passes = v;
        }
        if let Some(v) = self.prompt_style {
            opts.prompt_style = v;
        }
        if let Some(v) = self.concurrency {
            opts.concurrency_limit = v;
        }
        if let Some(v) = self.max_retries {
            opts.max_retries = v;
        }
        if let Some(v) = self.max_window_failures {
            opts.max_window_failures = Some(v);
        }
        if let Some(v) = self.deadline_ms {
            opts.deadline_ms = Some(v);
        }
        if self.capture_history {
            opts.capture_history = true;
        }
    }
}

#[derive(Args)]
struct PoolArgs {
    /// Cooldown after a key's first rate limit, in milliseconds
    #[arg(long, default_value_t = 1_000)]
    cooldown_base_ms: u64,
    /// Longest cooldown, in milliseconds
    #[arg(long, default_value_t = 60_000)]
    cooldown_cap_ms: u64,
    /// Longest wait for a cooled-down key, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    pool_max_wait_ms: u64,
}

impl PoolArgs {
    fn config(&self) -> CredentialPoolConfig {
        CredentialPoolConfig {
            cooldown_base: Duration::from_millis(self.cooldown_base_ms),
            cooldown_cap: Duration::from_millis(self.cooldown_cap_ms),
            max_wait: Duration::from_millis(self.pool_max_wait_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Rerank {
            requests,
            out,
            options,
            history,
            overrides,
            pool,
        } => {
            let mut opts = match options {
                Some(path) => load_options(&path)?,
                None => RerankOptions::default(),
            };
            overrides.apply(&mut opts);
            if history.is_some() {
                opts.capture_history = true;
            }

            let requests = read_requests(&requests)?;
            let outcomes = run_batch(requests, &opts, &pool).await?;

            write_json(&out, &outcomes)?;
            if let Some(path) = history {
                write_history(&path, &outcomes)?;
            }
            for outcome in &outcomes {
                print_summary(outcome);
            }
        }
        Commands::Demo {
            history,
            overrides,
            pool,
        } => {
            let mut opts = RerankOptions {
                capture_history: true,
                ..RerankOptions::default()
            };
            overrides.apply(&mut opts);

            let outcomes = run_batch(vec![demo_request()], &opts, &pool).await?;
            if let Some(path) = history {
                write_history(&path, &outcomes)?;
            }

            println!("Ranking results:");
            for outcome in &outcomes {
                println!("Query: {} ({:?})", outcome.query.text, outcome.status);
                for c in &outcome.candidates {
                    println!(
                        "  Candidate ID: {}, Score: {:.4}, Text: {}",
                        c.id,
                        c.score,
                        passage_text(&c.content)
                    );
                }
                let calls = outcome.history.as_ref().map_or(0, Vec::len);
                println!("  Model calls recorded: {calls}");
            }
            println!("Model: {}", opts.model);
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

async fn run_batch(
    requests: Vec<Request>,
    opts: &RerankOptions,
    pool: &PoolArgs,
) -> Result<Vec<RerankOutcome>, Box<dyn std::error::Error>> {
    opts.validate()?;

    let keys = api_keys_from_env()?;
    let pool = CredentialPool::new(keys, pool.config())?;
    info!(credentials = pool.len(), "Loaded API keys");
    let provider = OpenRouterAdapter::from_env()?;
    info!(base_url = provider.base_url(), "Using OpenRouter");
    let client = CompletionClient::new(
        Arc::new(provider),
        Arc::new(pool),
        Arc::new(StderrUsageSink),
    );

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling batch");
            on_interrupt.cancel();
        }
    });

    let outcomes = rerank_batch(Arc::new(client), requests, opts, &cancel).await?;
    interrupt.abort();
    Ok(outcomes)
}

fn demo_request() -> Request {
    Request::new(
        Query::new("1", "What is the capital of France?"),
        vec![
            Candidate::text("doc1", "Berlin is the capital of Germany."),
            Candidate::text("doc2", "Beijing is the capital of China."),
            Candidate::text("doc3", "Paris is the capital of France."),
        ],
    )
}

fn load_options(path: &Path) -> Result<RerankOptions, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    let opts = if is_toml {
        toml::from_str(&raw)?
    } else {
        serde_json::from_str(&raw)?
    };
    Ok(opts)
}

fn read_requests(path: &Path) -> Result<Vec<Request>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let requests = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(requests)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), std::io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}

fn write_history(path: &Path, outcomes: &[RerankOutcome]) -> Result<(), Box<dyn std::error::Error>> {
    let (sink, worker) = JsonlTraceSink::new(path)?;
    for outcome in outcomes {
        sink.record_outcome(outcome)?;
    }
    drop(sink);
    let written = worker.join()?;
    info!(records = written, path = %path.display(), "Wrote invocation history");
    Ok(())
}

fn print_summary(outcome: &RerankOutcome) {
    let top: Vec<&str> = outcome.ids().into_iter().take(5).collect();
    let failed_windows = outcome.window_failures.len();
    println!(
        "{}\t{:?}\tfailed_windows={}\ttop={}",
        outcome.query.id,
        outcome.status,
        failed_windows,
        top.join(",")
    );
}
