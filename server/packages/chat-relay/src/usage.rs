//! Token usage estimation.
//!
//! The chat page never reports token counts, so usage is approximated from
//! character counts. The estimator is a trait so a real tokenizer can be
//! swapped in without touching the response paths.

use crate::openai::{ChatMessage, Usage};

pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u32;
}

/// Character-ratio heuristic: CJK characters count 1.5 per token, everything
/// else 4 per token. Non-empty text is at least one token.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

const CJK_CHARS_PER_TOKEN: f64 = 1.5;
const OTHER_CHARS_PER_TOKEN: f64 = 4.0;

fn is_cjk(ch: char) -> bool {
    matches!(ch, '\u{4e00}'..='\u{9fff}' | '\u{3000}'..='\u{303f}' | '\u{ff00}'..='\u{ffef}')
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let (cjk, other) = text.chars().fold((0usize, 0usize), |(cjk, other), ch| {
            if is_cjk(ch) {
                (cjk + 1, other)
            } else {
                (cjk, other + 1)
            }
        });
        let tokens = cjk as f64 / CJK_CHARS_PER_TOKEN + other as f64 / OTHER_CHARS_PER_TOKEN;
        (tokens as u32).max(1)
    }
}

pub fn calculate_usage(
    estimator: &dyn TokenEstimator,
    messages: &[ChatMessage],
    body: &str,
    reasoning: &str,
) -> Usage {
    let prompt_text: String = messages
        .iter()
        .map(|message| format!("{}: {}\n", message.role, message.text_content()))
        .collect();
    let prompt_tokens = estimator.estimate(&prompt_text);
    let completion_tokens = estimator.estimate(&format!("{body}{reasoning}"));
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}
