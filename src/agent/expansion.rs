/// Question expansion and intent classification

use serde::{Deserialize, Serialize};

use super::prompts::{build_expansion_prompt, expansion_schema, EXPANSION_SYSTEM_PROMPT};
use crate::llm::{complete_json, LlmProvider, LlmRequest};
use crate::session::ConversationContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    DataQuery,
    Chitchat,
    OutOfScope,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::DataQuery => "data_query",
            Intent::Chitchat => "chitchat",
            Intent::OutOfScope => "out_of_scope",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Expansion {
    pub standalone_question: String,
    pub intent: Intent,
    #[serde(default)]
    pub reply: Option<String>,
}

impl Expansion {
    /// Treat the raw question as a standalone data query.
    pub fn passthrough(question: &str) -> Self {
        Expansion {
            standalone_question: question.to_string(),
            intent: Intent::DataQuery,
            reply: None,
        }
    }
}

/// Rewrite the question with conversation context and classify it.
///
/// Never fails: if the model cannot produce a usable expansion the raw
/// question is used as a data query. The bool is true when that fallback
/// was taken.
pub async fn expand(
    llm: &dyn LlmProvider,
    question: &str,
    context: &ConversationContext,
    current_date: &str,
) -> (Expansion, bool) {
    let request = LlmRequest::json(
        EXPANSION_SYSTEM_PROMPT,
        build_expansion_prompt(question, &context.render(), current_date),
        expansion_schema(),
    );

    match complete_json::<Expansion>(llm, request, 2).await {
        Ok(mut expansion) => {
            if expansion.standalone_question.trim().is_empty() {
                expansion.standalone_question = question.to_string();
            }
            (expansion, false)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Question expansion failed, using the raw question");
            (Expansion::passthrough(question), true)
        }
    }
}
