//! Prompt rendering for listwise ranking.
//!
//! Turns a query and one window of candidates into chat messages for a given
//! [`PromptStyle`], fitted to a token budget. Provider-agnostic.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::{ErrorKind, Message};
use crate::rerank::Candidate;
use crate::tokens::{count_tokens, truncate_to_tokens};

/// Chat formatting overhead charged per message.
const TOKENS_PER_MESSAGE: usize = 4;

/// Passes of the shrink loop before passages are dropped to empty.
const MAX_SHRINK_ROUNDS: usize = 8;

static BRACKET_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*(\d+)\s*\]").expect("valid bracket marker regex"));

static PASSAGE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(passage)\s*(\d+)").expect("valid passage marker regex"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

// =============================================================================
// Styles
// =============================================================================

/// How candidates are presented and how the model is asked to answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStyle {
    /// Multi-turn listwise prompt; markers `[n]`, answer `[2] > [1] > [3]`.
    #[default]
    RankGpt,
    /// Single-turn listwise prompt; markers `PASSAGEn`, answer `[PASSAGE2, PASSAGE1]`.
    Lrl,
    /// Preference lines `[i] > [j]`, ordered by wins.
    Pairwise,
}

impl PromptStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptStyle::RankGpt => "rank_gpt",
            PromptStyle::Lrl => "lrl",
            PromptStyle::Pairwise => "pairwise",
        }
    }

    /// Marker for the 1-based position `n`.
    pub fn marker(&self, n: usize) -> String {
        match self {
            PromptStyle::RankGpt | PromptStyle::Pairwise => format!("[{n}]"),
            PromptStyle::Lrl => format!("PASSAGE{n}"),
        }
    }
}

impl fmt::Display for PromptStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromptStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "rank_gpt" | "rankgpt" => Ok(PromptStyle::RankGpt),
            "lrl" => Ok(PromptStyle::Lrl),
            "pairwise" => Ok(PromptStyle::Pairwise),
            other => Err(format!(
                "unknown prompt style {other:?} (expected rank_gpt, lrl or pairwise)"
            )),
        }
    }
}

// =============================================================================
// Prompt
// =============================================================================

/// Rendered prompt ready for the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub style: PromptStyle,
    pub messages: Vec<Message>,
    /// Token count of the rendered messages, including per-message overhead.
    pub token_estimate: usize,
    /// Whether any candidate content was cut to fit.
    pub truncated: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TruncationError {
    #[error("prompt scaffold needs {required} tokens but the budget is {budget}")]
    ScaffoldTooLarge { required: usize, budget: usize },
    #[error("{passages} passages do not fit in the {available} tokens left after the scaffold")]
    ContentTooLarge { passages: usize, available: usize },
}

impl TruncationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Truncation
    }
}

/// Renders windows for one style under a per-candidate token cap.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    style: PromptStyle,
    max_passage_tokens: usize,
}

impl PromptBuilder {
    pub fn new(style: PromptStyle) -> Self {
        Self {
            style,
            max_passage_tokens: 300,
        }
    }

    pub fn max_passage_tokens(mut self, max: usize) -> Self {
        self.max_passage_tokens = max;
        self
    }

    pub fn style(&self) -> PromptStyle {
        self.style
    }

    /// Render `candidates` for `query` within `context_budget` tokens.
    ///
    /// Candidate text is capped per candidate first, then shrunk in proportion
    /// to its length until the whole prompt fits. The query and the scaffold
    /// are never cut, and no non-empty passage is cut to nothing.
    pub fn build(
        &self,
        query: &str,
        candidates: &[Candidate],
        context_budget: usize,
    ) -> Result<Prompt, TruncationError> {
        let query = collapse_whitespace(query);
        let full: Vec<String> = candidates
            .iter()
            .map(|c| sanitize(self.style, &passage_text(&c.content)))
            .collect();
        let passages: Vec<String> = full
            .iter()
            .map(|text| truncate_to_tokens(text, self.max_passage_tokens))
            .collect();
        let capped = full.iter().zip(&passages).any(|(f, p)| f.len() != p.len());

        let empty = vec![String::new(); passages.len()];
        let scaffold = self.render(&query, &empty);
        let scaffold_tokens = estimate(&scaffold);
        if scaffold_tokens > context_budget {
            return Err(TruncationError::ScaffoldTooLarge {
                required: scaffold_tokens,
                budget: context_budget,
            });
        }

        let messages = self.render(&query, &passages);
        let total = estimate(&messages);
        if total <= context_budget {
            return Ok(Prompt {
                style: self.style,
                messages,
                token_estimate: total,
                truncated: capped,
            });
        }

        let lengths: Vec<usize> = passages.iter().map(|p| count_tokens(p)).collect();
        let content_total: usize = lengths.iter().sum();
        let mut available = context_budget - scaffold_tokens;

        let too_large = TruncationError::ContentTooLarge {
            passages: passages.len(),
            available: context_budget - scaffold_tokens,
        };

        for _ in 0..MAX_SHRINK_ROUNDS {
            let shrunk: Vec<String> = passages
                .iter()
                .zip(&lengths)
                .map(|(p, &len)| {
                    let share = len.saturating_mul(available) / content_total.max(1);
                    truncate_to_tokens(p, share)
                })
                .collect();
            // Every non-empty passage keeps at least one token.
            if passages
                .iter()
                .zip(&shrunk)
                .any(|(p, s)| !p.trim().is_empty() && s.trim().is_empty())
            {
                return Err(too_large);
            }
            let messages = self.render(&query, &shrunk);
            let total = estimate(&messages);
            if total <= context_budget {
                return Ok(Prompt {
                    style: self.style,
                    messages,
                    token_estimate: total,
                    truncated: true,
                });
            }
            // Token counts are not additive across joins; give back the overshoot.
            let overshoot = total - context_budget + passages.len();
            available = available.saturating_sub(overshoot);
        }

        Err(too_large)
    }

    fn render(&self, query: &str, passages: &[String]) -> Vec<Message> {
        match self.style {
            PromptStyle::RankGpt => render_rank_gpt(query, passages),
            PromptStyle::Lrl => render_lrl(query, passages),
            PromptStyle::Pairwise => render_pairwise(query, passages),
        }
    }
}

fn estimate(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| count_tokens(&m.content) + TOKENS_PER_MESSAGE)
        .sum()
}

// =============================================================================
// Templates
// =============================================================================

fn render_rank_gpt(query: &str, passages: &[String]) -> Vec<Message> {
    let n = passages.len();
    let mut messages = Vec::with_capacity(3 + 2 * n + 1);
    messages.push(Message::system(
        "You are RankGPT, an intelligent assistant that can rank passages based on their relevancy to the query.",
    ));
    messages.push(Message::user(format!(
        "I will provide you with {n} passages, each indicated by number identifier []. \
         Rank the passages based on their relevance to query: {query}."
    )));
    messages.push(Message::assistant("Okay, please provide the passages."));
    for (i, passage) in passages.iter().enumerate() {
        let marker = PromptStyle::RankGpt.marker(i + 1);
        messages.push(Message::user(format!("{marker} {passage}")));
        messages.push(Message::assistant(format!("Received passage {marker}.")));
    }
    messages.push(Message::user(format!(
        "Search Query: {query}. \
         Rank the {n} passages above based on their relevance to the search query. \
         The passages should be listed in descending order using identifiers. \
         The most relevant passages should be listed first. \
         The output format should be [] > [], e.g., [1] > [2]. \
         Only respond with the ranking results, do not say any word or explain."
    )));
    messages
}

fn render_lrl(query: &str, passages: &[String]) -> Vec<Message> {
    let mut body = String::new();
    for (i, passage) in passages.iter().enumerate() {
        body.push_str(&format!("{} = {passage}\n", PromptStyle::Lrl.marker(i + 1)));
    }
    let ids: Vec<String> = (1..=passages.len())
        .map(|n| PromptStyle::Lrl.marker(n))
        .collect();
    body.push_str(&format!(
        "\nQuery = {query}\nPassages = [{}]\n\
         Sort the Passages by their relevance to the Query.\nSorted Passages = [",
        ids.join(", ")
    ));
    vec![Message::user(body)]
}

fn render_pairwise(query: &str, passages: &[String]) -> Vec<Message> {
    let n = passages.len();
    let mut body = format!("Query: {query}\n\n");
    for (i, passage) in passages.iter().enumerate() {
        body.push_str(&format!("{} {passage}\n", PromptStyle::Pairwise.marker(i + 1)));
    }
    body.push_str(&format!(
        "\nCompare the {n} passages above by relevance to the query. \
         Write one judgment per line in the form [i] > [j], meaning passage i is more relevant than passage j. \
         Chains such as [3] > [1] > [2] are allowed. Output only judgments."
    ));
    vec![
        Message::system(
            "You are a careful relevance judge. You compare passages and state which one better answers the query.",
        ),
        Message::user(body),
    ]
}

// =============================================================================
// Content
// =============================================================================

const BODY_FIELDS: &[&str] = &["text", "segment", "contents", "content", "body"];

/// Readable text of a candidate payload, whitespace collapsed.
pub fn passage_text(content: &Value) -> String {
    let raw = match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            let title = map
                .get("title")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty());
            let body = BODY_FIELDS
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str));
            match (title, body) {
                (Some(t), Some(b)) => format!("Title: {t} Content: {b}"),
                (None, Some(b)) => b.to_string(),
                (Some(t), None) => t.to_string(),
                (None, None) => content.to_string(),
            }
        }
        other => other.to_string(),
    };
    collapse_whitespace(&raw)
}

/// Rewrite anything in `text` that would read as a marker of `style`.
pub fn sanitize(style: PromptStyle, text: &str) -> String {
    match style {
        PromptStyle::RankGpt | PromptStyle::Pairwise => {
            BRACKET_MARKER.replace_all(text, "($1)").into_owned()
        }
        PromptStyle::Lrl => PASSAGE_MARKER.replace_all(text, "${1}-${2}").into_owned(),
    }
}

fn collapse_whitespace(s: &str) -> String {
    WHITESPACE.replace_all(s.trim(), " ").into_owned()
}
