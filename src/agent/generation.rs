/// SQL generation with guard and execution feedback
///
/// Each attempt asks the model for `{sql, explanation}` or `{clarification}`.
/// Malformed output and guard rejections are fed back into the next attempt.
/// An execution error is fed back at most once; a second one ends the turn.

use serde::Deserialize;
use std::time::Instant;

use super::prompts::{build_generation_prompt, generation_schema, GenerationPrompt, GENERATION_SYSTEM_PROMPT};
use super::retrieval::RetrievedKnowledge;
use crate::llm::{parse_json_reply, strip_code_fences, LlmProvider, LlmRequest};
use crate::session::ConversationContext;
use crate::sql::{validate, QueryExecutor, QueryResult, Requester, SqlPolicy, ValidatedSql};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationReply {
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub clarification: Option<String>,
}

/// What went wrong in an earlier attempt.
#[derive(Debug, Clone)]
pub struct AttemptFeedback {
    pub sql: Option<String>,
    pub error: String,
}

#[derive(Debug)]
pub enum GenerationOutcome {
    Executed {
        sql: ValidatedSql,
        explanation: Option<String>,
        result: QueryResult,
        attempts: u8,
    },
    Clarification {
        text: String,
        attempts: u8,
    },
    Failed {
        reason: String,
        last_sql: Option<String>,
        attempts: u8,
    },
}

pub struct GenerationInput<'a> {
    pub session_id: &'a str,
    pub question: &'a str,
    pub context: &'a ConversationContext,
    pub knowledge: &'a RetrievedKnowledge,
    pub policy: &'a SqlPolicy,
    pub requester: &'a Requester,
    pub max_attempts: u8,
    pub current_date: &'a str,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub async fn generate_and_execute(
    llm: &dyn LlmProvider,
    executor: &dyn QueryExecutor,
    input: GenerationInput<'_>,
) -> GenerationOutcome {
    let max_attempts = input.max_attempts.max(1);
    let allowed_schema = input.policy.describe(Some(input.requester));
    let conversation = input.context.render();

    let mut feedback: Vec<AttemptFeedback> = Vec::new();
    let mut execution_retry_used = false;
    let mut last_sql: Option<String> = None;
    let mut last_error = String::from("no attempt was made");

    for attempt in 1..=max_attempts {
        let start = Instant::now();
        let prompt = build_generation_prompt(&GenerationPrompt {
            question: input.question,
            conversation: &conversation,
            allowed_schema: &allowed_schema,
            schema_chunks: &input.knowledge.schema,
            business_chunks: &input.knowledge.business,
            qa_chunks: &input.knowledge.qa,
            feedback: &feedback,
            current_date: input.current_date,
        });
        let request = LlmRequest::json(GENERATION_SYSTEM_PROMPT, prompt, generation_schema());

        let raw = match llm.complete(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                return GenerationOutcome::Failed {
                    reason: e.to_string(),
                    last_sql,
                    attempts: attempt,
                };
            }
        };

        let reply: GenerationReply = match parse_json_reply(&raw) {
            Ok(reply) => reply,
            Err(e) => {
                last_error = format!("output was not the expected JSON object: {}", e);
                tracing::warn!(session_id = %input.session_id, attempt, error = %e, "Unparseable SQL generation output");
                feedback.push(AttemptFeedback { sql: None, error: last_error.clone() });
                continue;
            }
        };

        let sql = non_blank(reply.sql).map(|s| strip_code_fences(&s).to_string());
        let Some(sql) = sql else {
            if let Some(text) = non_blank(reply.clarification) {
                return GenerationOutcome::Clarification { text, attempts: attempt };
            }
            last_error = "the reply contained neither sql nor clarification".to_string();
            feedback.push(AttemptFeedback { sql: None, error: last_error.clone() });
            continue;
        };
        last_sql = Some(sql.clone());

        let validated = match validate(&sql, input.policy, input.requester) {
            Ok(validated) => validated,
            Err(e) => {
                last_error = e.to_string();
                tracing::warn!(
                    session_id = %input.session_id,
                    step = "guard",
                    attempt,
                    reason = %e,
                    "Generated SQL rejected"
                );
                feedback.push(AttemptFeedback { sql: Some(sql), error: last_error.clone() });
                continue;
            }
        };

        tracing::info!(
            session_id = %input.session_id,
            step = "generation",
            attempt,
            tables = ?validated.tables,
            latency_ms = start.elapsed().as_millis() as u64,
            "SQL generated"
        );

        match executor.execute(&validated).await {
            Ok(result) => {
                tracing::info!(
                    session_id = %input.session_id,
                    step = "execution",
                    rows = result.row_count,
                    truncated = result.truncated,
                    latency_ms = result.elapsed_ms,
                    "SQL executed"
                );
                return GenerationOutcome::Executed {
                    sql: validated,
                    explanation: non_blank(reply.explanation),
                    result,
                    attempts: attempt,
                };
            }
            Err(e) => {
                last_error = e.to_string();
                tracing::warn!(
                    session_id = %input.session_id,
                    step = "execution",
                    attempt,
                    error = %e,
                    "SQL execution failed"
                );
                if execution_retry_used {
                    return GenerationOutcome::Failed {
                        reason: last_error,
                        last_sql,
                        attempts: attempt,
                    };
                }
                execution_retry_used = true;
                feedback.push(AttemptFeedback { sql: Some(sql), error: last_error.clone() });
            }
        }
    }

    GenerationOutcome::Failed {
        reason: last_error,
        last_sql,
        attempts: max_attempts,
    }
}
