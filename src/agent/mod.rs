/// Conversational Text2SQL pipeline
///
/// One call to [`Text2SqlAgent::ask`] is one conversational turn:
/// session → expansion → retrieval → generation/guard/execution → response →
/// persistence and rolling summary.

pub mod expansion;
pub mod generation;
pub mod prompts;
pub mod response;
pub mod retrieval;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{RetrievalConfig, SessionConfig};
use crate::embedding::pipeline::EmbeddingPipeline;
use crate::embedding::EmbeddingProvider;
use crate::errors::RentqlError;
use crate::knowledge::{ChunkKind, KnowledgeStore, NewChunk};
use crate::llm::LlmProvider;
use crate::session::summary::summarize_if_needed;
use crate::session::{
    ConversationContext, MessageRole, OwnerFilter, Session, SessionFilter, SessionList,
    SessionStore,
};
use crate::sql::{QueryExecutor, Requester, SqlPolicy};

pub use expansion::Intent;
use generation::{generate_and_execute, GenerationInput, GenerationOutcome};

/// Longest accepted question, in characters.
pub const MAX_QUESTION_CHARS: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    pub session_id: Option<String>,
    pub requester: Requester,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub session_id: String,
    pub answer: String,
    pub intent: Intent,
    /// The question after context expansion
    pub standalone_question: String,
    /// SQL that was executed, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Value>,
    pub row_count: usize,
    pub truncated: bool,
    /// Set when the model asked the user to clarify
    pub needs_clarification: bool,
    /// Why no answer could be computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Knowledge chunks that informed generation
    pub knowledge_ids: Vec<String>,
    pub generation_attempts: u8,
    pub latency_ms: u64,
}

impl AskResponse {
    fn direct(session_id: String, answer: String, intent: Intent, standalone_question: String) -> Self {
        AskResponse {
            session_id,
            answer,
            intent,
            standalone_question,
            sql: None,
            explanation: None,
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
            needs_clarification: false,
            error: None,
            knowledge_ids: Vec::new(),
            generation_attempts: 0,
            latency_ms: 0,
        }
    }
}

/// Tunables the agent reads on every turn.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub retrieval: RetrievalConfig,
    pub session: SessionConfig,
    pub max_generation_attempts: u8,
}

pub struct Text2SqlAgent {
    llm: Arc<dyn LlmProvider>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    knowledge: Arc<dyn KnowledgeStore>,
    sessions: Arc<dyn SessionStore>,
    executor: Arc<dyn QueryExecutor>,
    policy: SqlPolicy,
    settings: AgentSettings,
    pipeline: Option<Arc<EmbeddingPipeline>>,
}

impl Text2SqlAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        knowledge: Arc<dyn KnowledgeStore>,
        sessions: Arc<dyn SessionStore>,
        executor: Arc<dyn QueryExecutor>,
        policy: SqlPolicy,
        settings: AgentSettings,
        pipeline: Option<Arc<EmbeddingPipeline>>,
    ) -> Self {
        Text2SqlAgent {
            llm,
            embedder,
            knowledge,
            sessions,
            executor,
            policy,
            settings,
            pipeline,
        }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn knowledge(&self) -> &Arc<dyn KnowledgeStore> {
        &self.knowledge
    }

    pub fn pipeline(&self) -> Option<&Arc<EmbeddingPipeline>> {
        self.pipeline.as_ref()
    }

    pub fn policy(&self) -> &SqlPolicy {
        &self.policy
    }

    /// Fetch a session the requester may see.
    ///
    /// Sessions owned by another user are reported as missing.
    pub async fn session_for(&self, id: &str, requester: &Requester) -> Result<Session, RentqlError> {
        let session = self.sessions.get(id).await?;
        let owned_by_other = match (&session.user_id, &requester.user_id) {
            (Some(owner), Some(user)) => owner != user,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if owned_by_other && !requester.is_admin() {
            return Err(RentqlError::NotFound { id: id.to_string() });
        }
        Ok(session)
    }

    /// List the sessions the requester may see, newest activity first.
    ///
    /// Admins see every session, or one user's when `user_id` is set. Anyone
    /// else sees only their own sessions, and a requester without a user id
    /// only the ownerless ones.
    pub async fn list_sessions(
        &self,
        requester: &Requester,
        limit: i64,
        cursor: Option<String>,
    ) -> Result<SessionList, RentqlError> {
        let owner = match (&requester.user_id, requester.is_admin()) {
            (Some(user), _) => OwnerFilter::User(user.clone()),
            (None, true) => OwnerFilter::Any,
            (None, false) => OwnerFilter::Unowned,
        };
        self.sessions
            .list(SessionFilter { owner, limit, cursor })
            .await
    }

    /// Run one conversational turn.
    pub async fn ask(&self, request: AskRequest) -> Result<AskResponse, RentqlError> {
        let turn_start = Instant::now();
        let question = request.question.trim().to_string();
        if question.is_empty() {
            return Err(RentqlError::validation("question", "Question cannot be empty"));
        }
        if question.chars().count() > MAX_QUESTION_CHARS {
            return Err(RentqlError::validation(
                "question",
                &format!("Question exceeds {} characters", MAX_QUESTION_CHARS),
            ));
        }

        let session = match request.session_id.as_deref() {
            Some(id) => self.session_for(id, &request.requester).await?,
            None => self.sessions.create(request.requester.user_id.clone()).await?,
        };
        let session_id = session.id.clone();
        let context =
            ConversationContext::load(self.sessions.as_ref(), &session, self.settings.session.recent_window)
                .await?;
        let today = Utc::now().format("%Y-%m-%d").to_string();

        // Expansion
        let step_start = Instant::now();
        let (expanded, fell_back) = expansion::expand(self.llm.as_ref(), &question, &context, &today).await;
        tracing::info!(
            session_id = %session_id,
            step = "expansion",
            intent = expanded.intent.as_str(),
            fallback = fell_back,
            latency_ms = step_start.elapsed().as_millis() as u64,
            "Question expanded"
        );

        if expanded.intent != Intent::DataQuery {
            let answer = expanded
                .reply
                .clone()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| {
                    response::default_direct_reply(&question, expanded.intent == Intent::OutOfScope)
                });
            let mut response =
                AskResponse::direct(session_id.clone(), answer, expanded.intent, expanded.standalone_question);
            self.persist_turn(&session_id, &question, &response.answer, None).await?;
            response.latency_ms = turn_start.elapsed().as_millis() as u64;
            return Ok(response);
        }

        let standalone = expanded.standalone_question;

        // Retrieval
        let step_start = Instant::now();
        let knowledge = retrieval::retrieve(
            self.knowledge.as_ref(),
            self.embedder.as_deref(),
            &standalone,
            &self.settings.retrieval,
        )
        .await?;
        tracing::info!(
            session_id = %session_id,
            step = "retrieval",
            schema = knowledge.schema.len(),
            business = knowledge.business.len(),
            qa = knowledge.qa.len(),
            latency_ms = step_start.elapsed().as_millis() as u64,
            "Knowledge retrieved"
        );

        // Generation, guard, execution
        let outcome = generate_and_execute(
            self.llm.as_ref(),
            self.executor.as_ref(),
            GenerationInput {
                session_id: &session_id,
                question: &standalone,
                context: &context,
                knowledge: &knowledge,
                policy: &self.policy,
                requester: &request.requester,
                max_attempts: self.settings.max_generation_attempts,
                current_date: &today,
            },
        )
        .await;

        let mut response = AskResponse::direct(
            session_id.clone(),
            String::new(),
            Intent::DataQuery,
            standalone.clone(),
        );
        response.knowledge_ids = knowledge.chunk_ids();

        match outcome {
            GenerationOutcome::Executed { sql, explanation, result, attempts } => {
                let step_start = Instant::now();
                let (answer, used_fallback) =
                    response::compose_answer(self.llm.as_ref(), &question, &sql.sql, &result).await;
                tracing::info!(
                    session_id = %session_id,
                    step = "response",
                    fallback = used_fallback,
                    latency_ms = step_start.elapsed().as_millis() as u64,
                    "Answer composed"
                );

                self.persist_turn(&session_id, &question, &answer, Some(&sql.sql)).await?;
                self.learn(&standalone, &sql.sql, &request.requester).await;

                response.answer = answer;
                response.sql = Some(sql.sql);
                response.explanation = explanation;
                response.columns = result.columns;
                response.row_count = result.row_count;
                response.rows = result.rows;
                response.truncated = result.truncated;
                response.generation_attempts = attempts;
            }
            GenerationOutcome::Clarification { text, attempts } => {
                self.persist_turn(&session_id, &question, &text, None).await?;
                response.answer = text;
                response.needs_clarification = true;
                response.generation_attempts = attempts;
            }
            GenerationOutcome::Failed { reason, last_sql, attempts } => {
                tracing::warn!(
                    session_id = %session_id,
                    step = "generation",
                    attempts,
                    reason = %reason,
                    last_sql = last_sql.as_deref().unwrap_or(""),
                    "No executable SQL for question"
                );
                let answer = response::failure_answer(&question);
                self.persist_turn(&session_id, &question, &answer, None).await?;
                response.answer = answer;
                response.error = Some(reason);
                response.generation_attempts = attempts;
            }
        }

        response.latency_ms = turn_start.elapsed().as_millis() as u64;
        tracing::info!(
            session_id = %session_id,
            step = "turn",
            rows = response.row_count,
            latency_ms = response.latency_ms,
            "Turn complete"
        );
        Ok(response)
    }

    /// Store both sides of a turn, then fold old messages into the summary
    /// if one is due. Summary failures never fail the turn.
    async fn persist_turn(
        &self,
        session_id: &str,
        question: &str,
        answer: &str,
        sql: Option<&str>,
    ) -> Result<(), RentqlError> {
        self.sessions.append(session_id, MessageRole::User, question, None).await?;
        self.sessions.append(session_id, MessageRole::Assistant, answer, sql).await?;

        if let Err(e) = summarize_if_needed(
            self.sessions.as_ref(),
            self.llm.as_ref(),
            session_id,
            &self.settings.session,
        )
        .await
        {
            tracing::warn!(session_id = %session_id, error = %e, "Rolling summary failed");
        }
        Ok(())
    }

    /// Store a successful question/SQL pair as a qa chunk.
    ///
    /// Only unscoped requesters contribute: scoped SQL embeds a user id.
    async fn learn(&self, question: &str, sql: &str, requester: &Requester) {
        if !self.settings.session.learn_from_success || self.policy.scopes_for(requester).next().is_some() {
            return;
        }
        let chunk = NewChunk {
            id: Some(learned_chunk_id(question)),
            kind: ChunkKind::Qa,
            title: question.to_string(),
            content: format!("Q: {}\nSQL: {}", question, sql),
            metadata: Some(serde_json::json!({ "source": "learned" })),
        };
        match self.knowledge.upsert(chunk).await {
            Ok(stored) => {
                if let Some(ref pipeline) = self.pipeline {
                    pipeline.enqueue_chunk(&stored);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to store learned example"),
        }
    }
}

/// Stable id for a learned example so re-asking the same question replaces it.
pub fn learned_chunk_id(question: &str) -> String {
    let slug: String = question
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let slug: String = slug.chars().take(120).collect();
    format!("qa:learned:{}", slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learned_chunk_id_normalizes_question() {
        assert_eq!(
            learned_chunk_id("  Có bao nhiêu phòng trống?  "),
            "qa:learned:có-bao-nhiêu-phòng-trống"
        );
        assert_eq!(learned_chunk_id("Rooms, please!"), learned_chunk_id("rooms please"));
    }
}
