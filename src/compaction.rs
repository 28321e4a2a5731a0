//! Context compaction: reduce accumulated run context to fit a token
//! budget while preserving recency.
//!
//! Two call sites share the same shape: the event-log variant flattens a
//! run's event history into a single prompt string, and the message-list
//! variant trims a conversation while keeping system content intact. Both
//! are pure; callers emit the `compaction` event and stamp `compacted_at`.

use serde::{Deserialize, Serialize};

use crate::events::{AgentEvent, MessageRole};

/// Fraction of the budget kept as headroom for the compaction notice and
/// subsequent growth. Expressed as a ratio to keep the math in integers.
const EFFECTIVE_BUDGET_NUM: u64 = 4;
const EFFECTIVE_BUDGET_DEN: u64 = 5;

/// Deterministic token cost heuristic: `ceil(chars / 4)`. Not a real
/// tokenizer; reproducibility matters more than accuracy here.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

fn effective_budget(max_tokens: u64) -> u64 {
    max_tokens * EFFECTIVE_BUDGET_NUM / EFFECTIVE_BUDGET_DEN
}

/// One conversational record in the message-list variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// What a compaction pass did, for the `compaction` event.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionReport {
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub dropped_count: usize,
}

impl CompactionReport {
    pub fn summary(&self) -> String {
        format!(
            "Compacted {} messages, reduced from ~{} to ~{} tokens",
            self.dropped_count, self.tokens_before, self.tokens_after
        )
    }
}

/// Flattened event history that fits the budget.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactedContext {
    pub prompt: String,
    pub tokens_before: u64,
    pub tokens_after: u64,
}

/// True when the event history exceeds the budget and a compaction pass
/// would change it.
pub fn should_compact(events: &[AgentEvent], max_tokens: u64) -> bool {
    let total: u64 = events
        .iter()
        .map(|e| estimate_tokens(e.content_text()))
        .sum();
    total > max_tokens
}

/// Flatten an ordered event history into a prompt no larger than the
/// budget. Under budget the input passes through joined verbatim; over
/// budget the result is a suffix of the most recent records behind a
/// synthetic notice naming how many were dropped.
pub fn compact_event_context(events: &[AgentEvent], max_tokens: u64) -> CompactedContext {
    let texts: Vec<&str> = events.iter().map(|e| e.content_text()).collect();
    let tokens_before: u64 = texts.iter().map(|t| estimate_tokens(t)).sum();

    if tokens_before <= max_tokens {
        return CompactedContext {
            prompt: texts.join("\n"),
            tokens_before,
            tokens_after: tokens_before,
        };
    }

    let kept = recency_suffix(&texts, effective_budget(max_tokens));
    let dropped_count = texts.len() - kept.len();
    let prompt = format!(
        "[Context compacted: {} earlier messages summarized to save tokens]\n\n{}",
        dropped_count,
        kept.join("\n")
    );
    let tokens_after = estimate_tokens(&prompt);

    CompactedContext {
        prompt,
        tokens_before,
        tokens_after,
    }
}

/// Trim a conversation to the budget. System messages are retained in full
/// and unconditionally, consuming budget before the recency walk over the
/// rest. Returns the input untouched when it already fits.
pub fn compact_messages(
    messages: Vec<ChatMessage>,
    max_tokens: u64,
) -> (Vec<ChatMessage>, Option<CompactionReport>) {
    let tokens_before: u64 = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
    if tokens_before <= max_tokens {
        return (messages, None);
    }

    let (system, rest): (Vec<ChatMessage>, Vec<ChatMessage>) = messages
        .into_iter()
        .partition(|m| m.role == MessageRole::System);
    let system_tokens: u64 = system.iter().map(|m| estimate_tokens(&m.content)).sum();

    let remaining = effective_budget(max_tokens).saturating_sub(system_tokens);
    let texts: Vec<&str> = rest.iter().map(|m| m.content.as_str()).collect();
    let kept_count = recency_suffix(&texts, remaining).len();
    let dropped_count = rest.len() - kept_count;

    let notice = ChatMessage::system(format!(
        "[Context compacted: {} earlier messages were summarized to stay within token budget]",
        dropped_count
    ));

    let kept: Vec<ChatMessage> = rest.into_iter().skip(dropped_count).collect();
    let kept_tokens: u64 = kept.iter().map(|m| estimate_tokens(&m.content)).sum();
    let tokens_after = system_tokens + estimate_tokens(&notice.content) + kept_tokens;

    let mut compacted = system;
    compacted.push(notice);
    compacted.extend(kept);

    (
        compacted,
        Some(CompactionReport {
            tokens_before,
            tokens_after,
            dropped_count,
        }),
    )
}

/// Walk records newest-first, keeping each while it fits the budget, and
/// return the resulting contiguous suffix in original order.
///
/// The first iteration starts from an empty accumulator, so the most recent
/// record is always kept even when it alone exceeds the budget. That keeps
/// the compactor total (it never returns an empty context for a non-empty
/// history) at the cost of occasionally overshooting the budget by one
/// oversized record.
fn recency_suffix<'a>(texts: &[&'a str], budget: u64) -> Vec<&'a str> {
    let mut kept_tokens = 0u64;
    let mut start = texts.len();

    for (i, text) in texts.iter().enumerate().rev() {
        let tokens = estimate_tokens(text);
        if kept_tokens + tokens > budget && start < texts.len() {
            break;
        }
        kept_tokens += tokens;
        start = i;
    }

    texts[start..].to_vec()
}
