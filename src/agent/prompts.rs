/// Prompt builders and output schemas for the pipeline's LLM steps

use crate::knowledge::ScoredChunk;
use crate::sql::QueryResult;

use super::generation::AttemptFeedback;

/// Rows shown to the response model; the rest are summarized by count.
pub const RESPONSE_ROW_LIMIT: usize = 20;

pub const EXPANSION_SYSTEM_PROMPT: &str = "You are the front desk of a data assistant for a rental \
marketplace (buildings, rooms, bookings, contracts, bills, payments, ratings). You rewrite the user's \
latest message into a standalone question and classify it. Output only valid JSON matching the provided \
schema. Do not add commentary.";

pub const GENERATION_SYSTEM_PROMPT: &str = "You write PostgreSQL for a rental marketplace database. \
Write exactly one read-only SELECT statement (CTEs allowed). Use only the tables and columns listed as \
allowed. Always apply the row restrictions given for the current user. Never select password, token or \
identity columns. If the question is ambiguous, ask for clarification instead of guessing. Output only \
valid JSON matching the provided schema.";

pub const RESPONSE_SYSTEM_PROMPT: &str = "You answer questions about a rental marketplace using the \
result of a database query. Answer in the same language as the question, briefly and concretely. Use \
only the numbers in the result; if the result is empty, say that nothing matched. Do not mention SQL \
unless asked.";

/// Build the expansion prompt.
///
/// The model resolves references to earlier turns ("còn tháng trước thì sao?")
/// into a question that can be answered without the conversation.
pub fn build_expansion_prompt(question: &str, conversation: &str, current_date: &str) -> String {
    format!(
        "Today's date: {current_date}\n\n\
         Conversation so far:\n{conversation}\n\
         Latest user message: {question}\n\n\
         1. Rewrite the latest message as a standalone question in its original language, \
            filling in anything it refers to from the conversation.\n\
         2. Classify the intent:\n\
            - data_query: needs data from the marketplace database\n\
            - chitchat: greetings, thanks, questions about the assistant itself\n\
            - out_of_scope: anything unrelated to the marketplace data\n\
         3. For chitchat or out_of_scope, write a short reply in the user's language."
    )
}

pub fn expansion_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "standalone_question": { "type": "string" },
            "intent": {
                "type": "string",
                "enum": ["data_query", "chitchat", "out_of_scope"]
            },
            "reply": {
                "type": "string",
                "description": "Direct reply for chitchat or out_of_scope"
            }
        },
        "required": ["standalone_question", "intent"]
    })
}

fn push_chunks(out: &mut String, heading: &str, chunks: &[ScoredChunk]) {
    if chunks.is_empty() {
        return;
    }
    out.push_str(heading);
    out.push('\n');
    for hit in chunks {
        if !hit.chunk.title.is_empty() {
            out.push_str(&format!("### {}\n", hit.chunk.title));
        }
        out.push_str(hit.chunk.content.trim());
        out.push_str("\n\n");
    }
}

pub struct GenerationPrompt<'a> {
    pub question: &'a str,
    pub conversation: &'a str,
    pub allowed_schema: &'a str,
    pub schema_chunks: &'a [ScoredChunk],
    pub business_chunks: &'a [ScoredChunk],
    pub qa_chunks: &'a [ScoredChunk],
    pub feedback: &'a [AttemptFeedback],
    pub current_date: &'a str,
}

pub fn build_generation_prompt(p: &GenerationPrompt<'_>) -> String {
    let mut out = String::new();
    out.push_str(&format!("Today's date: {}\n\n", p.current_date));
    out.push_str("Allowed tables:\n");
    out.push_str(p.allowed_schema);
    out.push('\n');

    push_chunks(&mut out, "Table details:", p.schema_chunks);
    push_chunks(&mut out, "Business rules:", p.business_chunks);
    push_chunks(&mut out, "Example questions with SQL:", p.qa_chunks);

    out.push_str("Conversation so far:\n");
    out.push_str(p.conversation);
    out.push('\n');

    if !p.feedback.is_empty() {
        out.push_str("Previous attempts failed:\n");
        for (i, attempt) in p.feedback.iter().enumerate() {
            match attempt.sql {
                Some(ref sql) => out.push_str(&format!("{}. SQL: {}\n   Error: {}\n", i + 1, sql, attempt.error)),
                None => out.push_str(&format!("{}. Error: {}\n", i + 1, attempt.error)),
            }
        }
        out.push_str("Fix the problem and try again.\n\n");
    }

    out.push_str(&format!("Question: {}", p.question));
    out
}

pub fn generation_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "sql": { "type": "string", "description": "One read-only SELECT statement" },
            "explanation": { "type": "string", "description": "One sentence on what the query does" },
            "clarification": {
                "type": "string",
                "description": "Question back to the user when the request is ambiguous; omit sql then"
            }
        }
    })
}

/// Build the prompt that turns a query result into an answer.
pub fn build_response_prompt(question: &str, sql: &str, result: &QueryResult) -> String {
    let shown: Vec<&serde_json::Value> = result.rows.iter().take(RESPONSE_ROW_LIMIT).collect();
    let rows_json = serde_json::to_string_pretty(&shown).unwrap_or_else(|_| "[]".to_string());

    let mut note = String::new();
    if result.row_count > shown.len() {
        note.push_str(&format!(
            "(showing {} of {} rows)\n",
            shown.len(),
            result.row_count
        ));
    }
    if result.truncated {
        note.push_str("(the query matched more rows than were returned)\n");
    }

    format!(
        "Question: {question}\n\n\
         SQL that was run:\n{sql}\n\n\
         Result ({count} rows):\n{rows_json}\n{note}\n\
         Answer the question.",
        count = result.row_count
    )
}
