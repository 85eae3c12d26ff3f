//! Token counting and truncation with the cl100k_base tokenizer.
//!
//! The tokenizer is loaded once. If it cannot be loaded every function falls
//! back to a characters/4 estimate, so budgets stay approximate but usable.

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::warn;

const CHARS_PER_TOKEN: usize = 4;

static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| match cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!(error = %e, "cl100k_base unavailable; estimating tokens from characters");
        None
    }
});

/// Count tokens in text.
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => estimate_tokens(text),
    }
}

/// Longest prefix of `text` that fits in `max_tokens`.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if max_tokens == 0 {
        return String::new();
    }
    let Some(bpe) = BPE.as_ref() else {
        return truncate_chars(text, max_tokens * CHARS_PER_TOKEN);
    };

    let tokens = bpe.encode_with_special_tokens(text);
    if tokens.len() <= max_tokens {
        return text.to_string();
    }

    // A cut can land inside a multi-byte character; back off until it decodes.
    let mut end = max_tokens;
    while end > 0 {
        if let Ok(s) = bpe.decode(tokens[..end].to_vec()) {
            return s;
        }
        end -= 1;
    }
    String::new()
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
