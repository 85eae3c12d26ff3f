//! Decode free-form model output into a permutation of window ids.
//!
//! Parsing is tolerant: surrounding prose is ignored, repeated markers keep
//! their first occurrence, markers outside the window are dropped, and ids
//! the model never mentioned are appended in their incoming order.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::gateway::ErrorKind;
use crate::prompts::PromptStyle;

const EXCERPT_CHARS: usize = 200;

static RANK_GPT_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\s*(\d+)\s*\](?:\s*\(\s*(-?\d+(?:\.\d+)?)\s*\))?")
        .expect("valid rank_gpt marker regex")
});

static BARE_INTEGER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d+)\b").expect("valid integer regex"));

static LRL_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)PASSAGE\s*(\d+)").expect("valid lrl marker regex"));

static PAIRWISE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\s*(\d+)\s*\]|(>|<)|(\n)").expect("valid pairwise token regex")
});

/// A permutation of a window's ids, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingResult {
    pub order: Vec<String>,
    /// Model scores aligned with `order`, only when every id carried one.
    pub scores: Option<Vec<f64>>,
}

/// Tagged outcome of decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRanking {
    /// Every id was ranked by the model.
    Complete(RankingResult),
    /// Some ids were missing and were appended at the bottom.
    PartialWithFallback {
        ranking: RankingResult,
        appended: Vec<String>,
    },
    /// Nothing usable in the output.
    Unparsable { excerpt: String },
}

impl ParsedRanking {
    pub fn into_result(self) -> Result<RankingResult, ParseError> {
        match self {
            ParsedRanking::Complete(r) => Ok(r),
            ParsedRanking::PartialWithFallback { ranking, .. } => Ok(ranking),
            ParsedRanking::Unparsable { excerpt } => Err(ParseError::Unparsable { excerpt }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("no ranking found in model output: {excerpt:?}")]
    Unparsable { excerpt: String },
}

impl ParseError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Unparsable
    }
}

/// Parse `raw` against the window `ids` (in their incoming order).
pub fn parse(raw: &str, ids: &[&str], style: PromptStyle) -> Result<RankingResult, ParseError> {
    decode(raw, ids, style).into_result()
}

pub fn decode(raw: &str, ids: &[&str], style: PromptStyle) -> ParsedRanking {
    let n = ids.len();
    let mentions = match style {
        PromptStyle::RankGpt => {
            let found = rank_gpt_mentions(raw, n);
            if found.is_empty() {
                bare_integer_mentions(raw, n)
            } else {
                found
            }
        }
        PromptStyle::Lrl => marker_mentions(&LRL_MARKER, raw, n),
        PromptStyle::Pairwise => pairwise_mentions(raw, n),
    };

    if mentions.is_empty() {
        return ParsedRanking::Unparsable {
            excerpt: excerpt(raw),
        };
    }

    let mut seen = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut scores = Vec::with_capacity(n);
    for (pos, score) in mentions {
        if seen[pos] {
            continue;
        }
        seen[pos] = true;
        order.push(ids[pos].to_string());
        scores.push(score);
    }

    let appended: Vec<String> = ids
        .iter()
        .zip(&seen)
        .filter(|(_, seen)| !**seen)
        .map(|(id, _)| id.to_string())
        .collect();

    let scores = if appended.is_empty() {
        scores.into_iter().collect::<Option<Vec<f64>>>()
    } else {
        None
    };
    order.extend(appended.iter().cloned());

    let ranking = RankingResult { order, scores };
    if appended.is_empty() {
        ParsedRanking::Complete(ranking)
    } else {
        ParsedRanking::PartialWithFallback { ranking, appended }
    }
}

/// 0-based position for a 1-based marker, if it is inside the window.
fn position(marker: &str, n: usize) -> Option<usize> {
    marker
        .parse::<usize>()
        .ok()
        .filter(|m| (1..=n).contains(m))
        .map(|m| m - 1)
}

fn rank_gpt_mentions(raw: &str, n: usize) -> Vec<(usize, Option<f64>)> {
    RANK_GPT_MARKER
        .captures_iter(raw)
        .filter_map(|cap| {
            let pos = position(cap.get(1)?.as_str(), n)?;
            let score = cap.get(2).and_then(|s| s.as_str().parse::<f64>().ok());
            Some((pos, score))
        })
        .collect()
}

fn bare_integer_mentions(raw: &str, n: usize) -> Vec<(usize, Option<f64>)> {
    marker_mentions(&BARE_INTEGER, raw, n)
}

fn marker_mentions(re: &Regex, raw: &str, n: usize) -> Vec<(usize, Option<f64>)> {
    re.captures_iter(raw)
        .filter_map(|cap| position(cap.get(1)?.as_str(), n))
        .map(|pos| (pos, None))
        .collect()
}

/// Order by preference wins; ties by first mention in a judgment.
fn pairwise_mentions(raw: &str, n: usize) -> Vec<(usize, Option<f64>)> {
    let mut judged: HashMap<(usize, usize), usize> = HashMap::new();
    let mut first_seen: Vec<Option<usize>> = vec![None; n];
    let mut mention_counter = 0usize;
    let mut note = |pos: usize, first_seen: &mut Vec<Option<usize>>| {
        if first_seen[pos].is_none() {
            first_seen[pos] = Some(mention_counter);
            mention_counter += 1;
        }
    };

    let mut prev: Option<usize> = None;
    let mut op: Option<bool> = None;
    for cap in PAIRWISE_TOKEN.captures_iter(raw) {
        if let Some(marker) = cap.get(1) {
            let Some(pos) = position(marker.as_str(), n) else {
                prev = None;
                op = None;
                continue;
            };
            if let (Some(left), Some(left_wins)) = (prev, op) {
                if left != pos {
                    let key = (left.min(pos), left.max(pos));
                    if !judged.contains_key(&key) {
                        let winner = if left_wins { left } else { pos };
                        judged.insert(key, winner);
                        note(left, &mut first_seen);
                        note(pos, &mut first_seen);
                    }
                }
            }
            prev = Some(pos);
            op = None;
        } else if let Some(sym) = cap.get(2) {
            op = prev.map(|_| sym.as_str() == ">");
        } else {
            prev = None;
            op = None;
        }
    }

    if judged.is_empty() {
        return Vec::new();
    }

    let mut wins = vec![0usize; n];
    for winner in judged.values() {
        wins[*winner] += 1;
    }

    let mut ranked: Vec<usize> = (0..n).filter(|p| first_seen[*p].is_some()).collect();
    ranked.sort_by_key(|p| (std::cmp::Reverse(wins[*p]), first_seen[*p]));
    ranked.into_iter().map(|p| (p, None)).collect()
}

fn excerpt(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= EXCERPT_CHARS {
        trimmed.to_string()
    } else {
        let mut s: String = trimmed.chars().take(EXCERPT_CHARS).collect();
        s.push('…');
        s
    }
}
