/// Rolling conversation summary
///
/// Once more than `summarize_after` messages sit outside the summary, every
/// message older than the recent window is folded into it by the LLM.

use std::time::Instant;

use super::{ChatMessage, Session, SessionStore};
use crate::config::SessionConfig;
use crate::errors::RentqlError;
use crate::llm::{LlmProvider, LlmRequest};

const SUMMARY_SYSTEM_PROMPT: &str = "You maintain a running summary of a conversation between a user and a \
data assistant for a rental marketplace. Merge the previous summary with the new messages. Keep the facts \
that later questions may refer to: entities, filters, time ranges, numbers in answers. Write in the \
conversation's language. Reply with the summary text only.";

/// Seq through which messages should be folded, or None if no fold is due.
pub fn fold_boundary(session: &Session, config: &SessionConfig) -> Option<i64> {
    let unsummarized = session.message_count - session.summarized_count;
    if unsummarized <= config.summarize_after as i64 {
        return None;
    }
    let through = session.message_count - config.recent_window as i64;
    (through > session.summarized_count).then_some(through)
}

/// Cut `text` to at most `max_chars` characters without splitting one.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn build_summary_prompt(previous: &str, messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    prompt.push_str("Previous summary:\n");
    if previous.trim().is_empty() {
        prompt.push_str("(none)\n");
    } else {
        prompt.push_str(previous.trim());
        prompt.push('\n');
    }
    prompt.push_str("\nNew messages:\n");
    for message in messages {
        prompt.push_str(&format!("{}: {}\n", message.role, message.content.trim()));
    }
    prompt.push_str("\nUpdated summary:");
    prompt
}

/// Fold old messages into the session summary if a fold is due.
///
/// Returns the new `summarized_count` when a summary was written.
pub async fn summarize_if_needed(
    store: &dyn SessionStore,
    llm: &dyn LlmProvider,
    session_id: &str,
    config: &SessionConfig,
) -> Result<Option<i64>, RentqlError> {
    let session = store.get(session_id).await?;
    let Some(through) = fold_boundary(&session, config) else {
        return Ok(None);
    };

    let start = Instant::now();
    let messages: Vec<ChatMessage> = store
        .messages_after(session_id, session.summarized_count)
        .await?
        .into_iter()
        .filter(|m| m.seq <= through)
        .collect();

    let request = LlmRequest::text(
        SUMMARY_SYSTEM_PROMPT,
        &build_summary_prompt(&session.summary, &messages),
    );
    let raw = llm.complete(&request).await?;
    let summary = truncate_chars(raw.trim(), config.max_summary_chars);
    if summary.is_empty() {
        return Err(RentqlError::Llm("Summary model returned empty text".to_string()));
    }

    store.set_summary(session_id, summary, through).await?;

    tracing::info!(
        session_id = %session_id,
        step = "summary",
        folded = messages.len(),
        through_seq = through,
        latency_ms = start.elapsed().as_millis() as u64,
        "Rolled conversation summary"
    );
    Ok(Some(through))
}
