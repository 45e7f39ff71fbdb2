//! End-to-end conversational turns against in-memory stores and a scripted LLM.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use rentql::agent::prompts::{EXPANSION_SYSTEM_PROMPT, GENERATION_SYSTEM_PROMPT, RESPONSE_SYSTEM_PROMPT};
use rentql::agent::{AgentSettings, AskRequest, Intent, Text2SqlAgent};
use rentql::config::{RetrievalConfig, SessionConfig, SqlConfig};
use rentql::embedding::EmbeddingStatus;
use rentql::errors::RentqlError;
use rentql::knowledge::{ChunkKind, KnowledgeChunk, KnowledgeStore, NewChunk, ScoredChunk, SearchQuery};
use rentql::llm::{LlmError, LlmProvider, LlmRequest};
use rentql::session::{
    decode_cursor, encode_cursor, ChatMessage, MessageRole, Session, SessionFilter, SessionList,
    SessionStore,
};
use rentql::sql::{QueryExecutor, QueryResult, Requester, SqlPolicy, ValidatedSql};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Replies are queued per pipeline step, keyed by system prompt.
#[derive(Default)]
struct ScriptedLlm {
    expansion: Mutex<VecDeque<String>>,
    generation: Mutex<VecDeque<String>>,
    response: Mutex<VecDeque<String>>,
    summary: Mutex<VecDeque<String>>,
    generation_prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    fn expansion(self, replies: &[&str]) -> Self {
        self.expansion.lock().unwrap().extend(replies.iter().map(|s| s.to_string()));
        self
    }
    fn generation(self, replies: &[&str]) -> Self {
        self.generation.lock().unwrap().extend(replies.iter().map(|s| s.to_string()));
        self
    }
    fn response(self, replies: &[&str]) -> Self {
        self.response.lock().unwrap().extend(replies.iter().map(|s| s.to_string()));
        self
    }
    fn summary(self, replies: &[&str]) -> Self {
        self.summary.lock().unwrap().extend(replies.iter().map(|s| s.to_string()));
        self
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let queue = if request.system == EXPANSION_SYSTEM_PROMPT {
            &self.expansion
        } else if request.system == GENERATION_SYSTEM_PROMPT {
            self.generation_prompts.lock().unwrap().push(request.prompt.clone());
            &self.generation
        } else if request.system == RESPONSE_SYSTEM_PROMPT {
            &self.response
        } else {
            &self.summary
        };
        queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Generation("script exhausted".to_string()))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[derive(Default)]
struct MemorySessions {
    sessions: Mutex<HashMap<String, Session>>,
    messages: Mutex<Vec<ChatMessage>>,
}

#[async_trait]
impl SessionStore for MemorySessions {
    async fn create(&self, user_id: Option<String>) -> Result<Session, RentqlError> {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            summary: String::new(),
            summarized_count: 0,
            message_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.sessions.lock().unwrap().insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Session, RentqlError> {
        self.sessions
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| RentqlError::NotFound { id: id.to_string() })
    }

    async fn list(&self, filter: SessionFilter) -> Result<SessionList, RentqlError> {
        let after = filter.cursor.as_deref().map(decode_cursor).transpose()?;
        let mut sessions: Vec<Session> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| filter.owner.matches(s.user_id.as_deref()))
            .filter(|s| match &after {
                Some((ts, id)) => s.updated_at < *ts || (s.updated_at == *ts && s.id > *id),
                None => true,
            })
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));

        let limit = filter.limit.clamp(1, 100) as usize;
        let has_more = sessions.len() > limit;
        sessions.truncate(limit);
        let next_cursor = if has_more {
            sessions.last().map(|s| encode_cursor(&s.updated_at, &s.id))
        } else {
            None
        };
        Ok(SessionList { sessions, next_cursor })
    }

    async fn delete(&self, id: &str) -> Result<(), RentqlError> {
        self.sessions
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RentqlError::NotFound { id: id.to_string() })?;
        self.messages.lock().unwrap().retain(|m| m.session_id != id);
        Ok(())
    }

    async fn append(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        sql: Option<&str>,
    ) -> Result<ChatMessage, RentqlError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RentqlError::NotFound { id: session_id.to_string() })?;
        session.message_count += 1;
        let message = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            seq: session.message_count,
            role,
            content: content.to_string(),
            sql: sql.map(|s| s.to_string()),
            created_at: Utc::now(),
        };
        self.messages.lock().unwrap().push(message.clone());
        Ok(message)
    }

    async fn messages_after(&self, session_id: &str, after_seq: i64) -> Result<Vec<ChatMessage>, RentqlError> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.session_id == session_id && m.seq > after_seq)
            .cloned()
            .collect())
    }

    async fn recent(&self, session_id: &str, n: i64) -> Result<Vec<ChatMessage>, RentqlError> {
        let all: Vec<ChatMessage> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        let skip = all.len().saturating_sub(n.max(0) as usize);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn set_summary(&self, session_id: &str, summary: &str, through_seq: i64) -> Result<(), RentqlError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RentqlError::NotFound { id: session_id.to_string() })?;
        assert!(through_seq >= session.summarized_count && through_seq <= session.message_count);
        session.summary = summary.to_string();
        session.summarized_count = through_seq;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryKnowledge {
    chunks: Mutex<Vec<KnowledgeChunk>>,
}

impl MemoryKnowledge {
    fn with(chunks: &[(ChunkKind, &str, &str)]) -> Self {
        let store = MemoryKnowledge::default();
        for (i, (kind, title, content)) in chunks.iter().enumerate() {
            store.chunks.lock().unwrap().push(KnowledgeChunk {
                id: format!("{}:{}", kind, i),
                kind: *kind,
                title: title.to_string(),
                content: content.to_string(),
                metadata: None,
                embedding_status: "complete".to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            });
        }
        store
    }
}

#[async_trait]
impl KnowledgeStore for MemoryKnowledge {
    async fn upsert(&self, input: NewChunk) -> Result<KnowledgeChunk, RentqlError> {
        let chunk = KnowledgeChunk {
            id: input.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            kind: input.kind,
            title: input.title,
            content: input.content,
            metadata: input.metadata,
            embedding_status: "pending".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mut chunks = self.chunks.lock().unwrap();
        chunks.retain(|c| c.id != chunk.id);
        chunks.push(chunk.clone());
        Ok(chunk)
    }

    async fn get(&self, id: &str) -> Result<KnowledgeChunk, RentqlError> {
        self.chunks
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| RentqlError::NotFound { id: id.to_string() })
    }

    async fn delete(&self, id: &str) -> Result<(), RentqlError> {
        self.chunks.lock().unwrap().retain(|c| c.id != id);
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>, RentqlError> {
        Ok(self
            .chunks
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.kind == query.kind)
            .take(query.limit as usize)
            .map(|c| ScoredChunk {
                chunk: c.clone(),
                score: 1.0,
                match_source: "text_only".to_string(),
            })
            .collect())
    }

    async fn pending(&self, _limit: i64) -> Result<Vec<KnowledgeChunk>, RentqlError> {
        Ok(Vec::new())
    }

    async fn store_embedding(&self, _chunk_id: &str, _model: &str, _embedding: Vec<f32>) -> Result<(), RentqlError> {
        Ok(())
    }

    async fn set_embedding_status(&self, _chunk_id: &str, _status: EmbeddingStatus) -> Result<(), RentqlError> {
        Ok(())
    }

    async fn stats(&self) -> Result<Value, RentqlError> {
        Ok(json!({ "total": self.chunks.lock().unwrap().len() }))
    }
}

/// Returns queued results in order, then a one-row count result.
#[derive(Default)]
struct FakeExecutor {
    results: Mutex<VecDeque<Result<QueryResult, String>>>,
    executed: Mutex<Vec<String>>,
}

impl FakeExecutor {
    fn failing_first(errors: &[&str]) -> Self {
        let executor = FakeExecutor::default();
        executor
            .results
            .lock()
            .unwrap()
            .extend(errors.iter().map(|e| Err(e.to_string())));
        executor
    }
}

fn count_result(n: i64) -> QueryResult {
    QueryResult {
        columns: vec!["total".to_string()],
        rows: vec![json!({ "total": n })],
        row_count: 1,
        truncated: false,
        elapsed_ms: 2,
    }
}

#[async_trait]
impl QueryExecutor for FakeExecutor {
    async fn execute(&self, sql: &ValidatedSql) -> Result<QueryResult, RentqlError> {
        self.executed.lock().unwrap().push(sql.sql.clone());
        match self.results.lock().unwrap().pop_front() {
            Some(Ok(result)) => Ok(result),
            Some(Err(e)) => Err(RentqlError::Execution(e)),
            None => Ok(count_result(12)),
        }
    }
}

struct Harness {
    agent: Text2SqlAgent,
    llm: Arc<ScriptedLlm>,
    sessions: Arc<MemorySessions>,
    knowledge: Arc<MemoryKnowledge>,
    executor: Arc<FakeExecutor>,
}

fn harness_with(llm: ScriptedLlm, executor: FakeExecutor, session: SessionConfig) -> Harness {
    let llm = Arc::new(llm);
    let sessions = Arc::new(MemorySessions::default());
    let knowledge = Arc::new(MemoryKnowledge::with(&[
        (ChunkKind::Schema, "rooms", "Table rooms\nColumns:\n- id integer\n- price numeric\n- status text"),
        (ChunkKind::Business, "Phòng trống", "Phòng trống là phòng có status = 'AVAILABLE'."),
    ]));
    let executor = Arc::new(executor);
    let agent = Text2SqlAgent::new(
        llm.clone(),
        None,
        knowledge.clone(),
        sessions.clone(),
        executor.clone(),
        SqlPolicy::from_config(&SqlConfig::default()),
        AgentSettings {
            retrieval: RetrievalConfig::default(),
            session,
            max_generation_attempts: 3,
        },
        None,
    );
    Harness { agent, llm, sessions, knowledge, executor }
}

fn harness(llm: ScriptedLlm) -> Harness {
    harness_with(llm, FakeExecutor::default(), SessionConfig::default())
}

fn data_query(question: &str) -> String {
    json!({ "standalone_question": question, "intent": "data_query" }).to_string()
}

fn sql_reply(sql: &str) -> String {
    json!({ "sql": sql, "explanation": "Counts rooms" }).to_string()
}

fn admin_ask(question: &str, session_id: Option<String>) -> AskRequest {
    AskRequest {
        question: question.to_string(),
        session_id,
        requester: Requester::admin(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_data_query_turn() {
    let q = "Có bao nhiêu phòng trống?";
    let h = harness(
        ScriptedLlm::default()
            .expansion(&[&data_query(q)])
            .generation(&[&sql_reply("SELECT COUNT(*) AS total FROM rooms WHERE status = 'AVAILABLE'")])
            .response(&["Hiện có 12 phòng trống."]),
    );

    let response = h.agent.ask(admin_ask(q, None)).await.unwrap();

    assert_eq!(response.intent, Intent::DataQuery);
    assert_eq!(response.answer, "Hiện có 12 phòng trống.");
    assert_eq!(
        response.sql.as_deref(),
        Some("SELECT COUNT(*) AS total FROM rooms WHERE status = 'AVAILABLE'")
    );
    assert_eq!(response.rows, vec![json!({ "total": 12 })]);
    assert_eq!(response.generation_attempts, 1);
    assert!(response.error.is_none());
    assert_eq!(response.knowledge_ids.len(), 2);

    // Retrieved knowledge reaches the generation prompt
    let prompts = h.llm.generation_prompts.lock().unwrap();
    assert!(prompts[0].contains("Business rules:\n### Phòng trống"));
    assert!(prompts[0].contains("Table rooms"));

    let session = h.sessions.get(&response.session_id).await.unwrap();
    assert_eq!(session.message_count, 2);
    let messages = h.sessions.messages_after(&response.session_id, 0).await.unwrap();
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, q);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert!(messages[1].sql.is_some());
}

#[tokio::test]
async fn test_guard_rejection_is_fed_back() {
    let h = harness(
        ScriptedLlm::default()
            .expansion(&[&data_query("How many rooms?")])
            .generation(&[
                &sql_reply("DELETE FROM rooms"),
                &sql_reply("SELECT COUNT(*) AS total FROM rooms"),
            ])
            .response(&["There are 12 rooms."]),
    );

    let response = h.agent.ask(admin_ask("How many rooms?", None)).await.unwrap();

    assert_eq!(response.generation_attempts, 2);
    assert_eq!(response.sql.as_deref(), Some("SELECT COUNT(*) AS total FROM rooms"));
    assert_eq!(h.executor.executed.lock().unwrap().len(), 1);

    let prompts = h.llm.generation_prompts.lock().unwrap();
    assert!(!prompts[0].contains("Previous attempts failed"));
    assert!(prompts[1].contains("1. SQL: DELETE FROM rooms"));
    assert!(prompts[1].contains("keyword `delete` is not allowed"));
}

#[tokio::test]
async fn test_tenant_queries_must_be_scoped() {
    let q = "Tôi có bao nhiêu đặt phòng?";
    let h = harness(
        ScriptedLlm::default()
            .expansion(&[&data_query(q)])
            .generation(&[
                &sql_reply("SELECT COUNT(*) AS total FROM bookings"),
                &sql_reply("SELECT COUNT(*) AS total FROM bookings b WHERE b.tenant_id = '42'"),
            ])
            .response(&["Bạn có 12 đặt phòng."]),
    );

    let response = h
        .agent
        .ask(AskRequest {
            question: q.to_string(),
            session_id: None,
            requester: Requester::new(Some("42".to_string()), Some("tenant".to_string())),
        })
        .await
        .unwrap();

    assert_eq!(response.generation_attempts, 2);
    let executed = h.executor.executed.lock().unwrap();
    assert_eq!(executed.as_slice(), ["SELECT COUNT(*) AS total FROM bookings b WHERE b.tenant_id = '42'"]);

    let prompts = h.llm.generation_prompts.lock().unwrap();
    assert!(prompts[0].contains("bookings.tenant_id = '42'"));
    assert!(prompts[1].contains("must filter `tenant_id`"));
}

#[tokio::test]
async fn test_chitchat_skips_sql() {
    let h = harness(ScriptedLlm::default().expansion(&[&json!({
        "standalone_question": "Xin chào",
        "intent": "chitchat",
        "reply": "Chào bạn! Bạn muốn tra cứu gì?"
    })
    .to_string()]));

    let response = h.agent.ask(admin_ask("Xin chào", None)).await.unwrap();

    assert_eq!(response.intent, Intent::Chitchat);
    assert_eq!(response.answer, "Chào bạn! Bạn muốn tra cứu gì?");
    assert!(response.sql.is_none());
    assert!(h.llm.generation_prompts.lock().unwrap().is_empty());
    assert!(h.executor.executed.lock().unwrap().is_empty());

    let session = h.sessions.get(&response.session_id).await.unwrap();
    assert_eq!(session.message_count, 2);
}

#[tokio::test]
async fn test_out_of_scope_without_reply_uses_default() {
    let h = harness(ScriptedLlm::default().expansion(&[&json!({
        "standalone_question": "What's the weather?",
        "intent": "out_of_scope"
    })
    .to_string()]));

    let response = h.agent.ask(admin_ask("What's the weather?", None)).await.unwrap();
    assert_eq!(response.intent, Intent::OutOfScope);
    assert!(response.answer.starts_with("I can only answer questions about rooms"));
}

#[tokio::test]
async fn test_failed_generation_still_persists_turn() {
    let h = harness(
        ScriptedLlm::default()
            .expansion(&[&data_query("Show me everything")])
            .generation(&["not json", "SELECT still not json", "{\"explanation\": \"no sql\"}"]),
    );

    let response = h.agent.ask(admin_ask("Show me everything", None)).await.unwrap();

    assert!(response.sql.is_none());
    assert_eq!(response.generation_attempts, 3);
    assert!(response.error.as_deref().unwrap().contains("neither sql nor clarification"));
    assert!(response.answer.starts_with("Sorry"));

    let session = h.sessions.get(&response.session_id).await.unwrap();
    assert_eq!(session.message_count, 2);
}

#[tokio::test]
async fn test_execution_error_is_fed_back_once() {
    let h = harness_with(
        ScriptedLlm::default()
            .expansion(&[&data_query("Average price?")])
            .generation(&[
                &sql_reply("SELECT AVG(cost) AS total FROM rooms"),
                &sql_reply("SELECT AVG(price) AS total FROM rooms"),
            ])
            .response(&["The average is 12."]),
        FakeExecutor::failing_first(&["column \"cost\" does not exist (SQLSTATE 42703)"]),
        SessionConfig::default(),
    );

    let response = h.agent.ask(admin_ask("Average price?", None)).await.unwrap();

    assert_eq!(response.generation_attempts, 2);
    assert_eq!(response.sql.as_deref(), Some("SELECT AVG(price) AS total FROM rooms"));
    let prompts = h.llm.generation_prompts.lock().unwrap();
    assert!(prompts[1].contains("column \"cost\" does not exist"));
}

#[tokio::test]
async fn test_second_execution_error_ends_turn() {
    let h = harness_with(
        ScriptedLlm::default()
            .expansion(&[&data_query("Average price?")])
            .generation(&[
                &sql_reply("SELECT AVG(cost) AS total FROM rooms"),
                &sql_reply("SELECT AVG(costs) AS total FROM rooms"),
                &sql_reply("SELECT AVG(price) AS total FROM rooms"),
            ]),
        FakeExecutor::failing_first(&["column \"cost\" does not exist", "column \"costs\" does not exist"]),
        SessionConfig::default(),
    );

    let response = h.agent.ask(admin_ask("Average price?", None)).await.unwrap();

    assert_eq!(response.generation_attempts, 2);
    assert!(response.sql.is_none());
    assert!(response.error.as_deref().unwrap().contains("costs"));
    assert_eq!(h.executor.executed.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_clarification_is_returned_as_answer() {
    let h = harness(
        ScriptedLlm::default()
            .expansion(&[&data_query("Doanh thu?")])
            .generation(&[&json!({ "clarification": "Bạn muốn xem doanh thu của tháng nào?" }).to_string()]),
    );

    let response = h.agent.ask(admin_ask("Doanh thu?", None)).await.unwrap();

    assert!(response.needs_clarification);
    assert_eq!(response.answer, "Bạn muốn xem doanh thu của tháng nào?");
    assert!(h.executor.executed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_expansion_failure_falls_back_to_raw_question() {
    let h = harness(
        ScriptedLlm::default()
            .expansion(&["garbage", "more garbage"])
            .generation(&[&sql_reply("SELECT COUNT(*) AS total FROM rooms")])
            .response(&["12 rooms."]),
    );

    let response = h.agent.ask(admin_ask("How many rooms?", None)).await.unwrap();

    assert_eq!(response.intent, Intent::DataQuery);
    assert_eq!(response.standalone_question, "How many rooms?");
    assert_eq!(response.answer, "12 rooms.");
}

#[tokio::test]
async fn test_response_failure_uses_fallback_answer() {
    let q = "Có bao nhiêu phòng?";
    let h = harness(
        ScriptedLlm::default()
            .expansion(&[&data_query(q)])
            .generation(&[&sql_reply("SELECT COUNT(*) AS total FROM rooms")]),
    );

    let response = h.agent.ask(admin_ask(q, None)).await.unwrap();
    assert_eq!(response.answer, "Kết quả: 12.");
}

#[tokio::test]
async fn test_question_validation() {
    let h = harness(ScriptedLlm::default());

    let empty = h.agent.ask(admin_ask("   ", None)).await;
    assert!(matches!(empty, Err(RentqlError::Validation { .. })));

    let long = "a".repeat(2001);
    let too_long = h.agent.ask(admin_ask(&long, None)).await;
    assert!(matches!(too_long, Err(RentqlError::Validation { .. })));

    assert!(h.sessions.sessions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let h = harness(ScriptedLlm::default());
    let result = h.agent.ask(admin_ask("Hello", Some("missing".to_string()))).await;
    assert!(matches!(result, Err(RentqlError::NotFound { .. })));
}

#[tokio::test]
async fn test_sessions_are_private_to_their_user() {
    let h = harness(ScriptedLlm::default());
    let session = h.sessions.create(Some("7".to_string())).await.unwrap();

    let other = Requester::new(Some("8".to_string()), Some("tenant".to_string()));
    assert!(matches!(
        h.agent.session_for(&session.id, &other).await,
        Err(RentqlError::NotFound { .. })
    ));

    let owner = Requester::new(Some("7".to_string()), Some("tenant".to_string()));
    assert!(h.agent.session_for(&session.id, &owner).await.is_ok());
    assert!(h.agent.session_for(&session.id, &Requester::admin()).await.is_ok());
}

fn owners(list: &SessionList) -> Vec<Option<String>> {
    list.sessions.iter().map(|s| s.user_id.clone()).collect()
}

#[tokio::test]
async fn test_listing_shows_only_the_requesters_sessions() {
    let h = harness(ScriptedLlm::default());
    h.sessions.create(Some("7".to_string())).await.unwrap();
    h.sessions.create(Some("7".to_string())).await.unwrap();
    h.sessions.create(Some("8".to_string())).await.unwrap();
    h.sessions.create(None).await.unwrap();

    let tenant = Requester::new(Some("7".to_string()), Some("tenant".to_string()));
    let list = h.agent.list_sessions(&tenant, 20, None).await.unwrap();
    assert_eq!(owners(&list), vec![Some("7".to_string()); 2]);

    let anonymous = Requester::new(None, Some("guest".to_string()));
    let list = h.agent.list_sessions(&anonymous, 20, None).await.unwrap();
    assert_eq!(owners(&list), vec![None]);

    let list = h.agent.list_sessions(&Requester::admin(), 20, None).await.unwrap();
    assert_eq!(list.sessions.len(), 4);

    let admin_for_8 = Requester::new(Some("8".to_string()), Some("admin".to_string()));
    let list = h.agent.list_sessions(&admin_for_8, 20, None).await.unwrap();
    assert_eq!(owners(&list), vec![Some("8".to_string())]);
}

#[tokio::test]
async fn test_listing_pages_with_cursor() {
    let h = harness(ScriptedLlm::default());
    for _ in 0..5 {
        h.sessions.create(Some("7".to_string())).await.unwrap();
    }
    h.sessions.create(Some("8".to_string())).await.unwrap();
    let tenant = Requester::new(Some("7".to_string()), Some("tenant".to_string()));

    let mut seen = Vec::new();
    let mut cursor = None;
    let mut pages = 0;
    loop {
        let page = h.agent.list_sessions(&tenant, 2, cursor).await.unwrap();
        assert!(page.sessions.len() <= 2);
        assert!(page.sessions.iter().all(|s| s.user_id.as_deref() == Some("7")));
        seen.extend(page.sessions.iter().map(|s| s.id.clone()));
        pages += 1;
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }

    assert_eq!(pages, 3);
    let mut unique = seen.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 5);
}

#[tokio::test]
async fn test_listing_rejects_malformed_cursor() {
    let h = harness(ScriptedLlm::default());
    let result = h
        .agent
        .list_sessions(&Requester::admin(), 20, Some("%%%".to_string()))
        .await;
    assert!(matches!(result, Err(RentqlError::Validation { .. })));
}

#[tokio::test]
async fn test_follow_up_sees_previous_turn_and_summary_rolls() {
    let session_config = SessionConfig {
        recent_window: 2,
        summarize_after: 2,
        ..SessionConfig::default()
    };
    let h = harness_with(
        ScriptedLlm::default()
            .expansion(&[
                &data_query("Có bao nhiêu phòng?"),
                &data_query("Có bao nhiêu phòng giá dưới 3 triệu?"),
            ])
            .generation(&[
                &sql_reply("SELECT COUNT(*) AS total FROM rooms"),
                &sql_reply("SELECT COUNT(*) AS total FROM rooms WHERE price < 3000000"),
            ])
            .response(&["Có 12 phòng.", "Có 5 phòng."])
            .summary(&["Người dùng hỏi tổng số phòng: 12."]),
        FakeExecutor::default(),
        session_config,
    );

    let first = h.agent.ask(admin_ask("Có bao nhiêu phòng?", None)).await.unwrap();
    let after_first = h.sessions.get(&first.session_id).await.unwrap();
    assert_eq!(after_first.summarized_count, 0);

    let second = h
        .agent
        .ask(admin_ask("Còn dưới 3 triệu thì sao?", Some(first.session_id.clone())))
        .await
        .unwrap();
    assert_eq!(second.session_id, first.session_id);
    assert_eq!(second.standalone_question, "Có bao nhiêu phòng giá dưới 3 triệu?");

    // The follow-up generation prompt carries the first turn
    let prompts = h.llm.generation_prompts.lock().unwrap();
    assert!(prompts[1].contains("assistant: Có 12 phòng."));

    // 4 messages, 4 unsummarized > 2: fold everything before the last 2
    let session = h.sessions.get(&first.session_id).await.unwrap();
    assert_eq!(session.message_count, 4);
    assert_eq!(session.summarized_count, 2);
    assert_eq!(session.summary, "Người dùng hỏi tổng số phòng: 12.");
}

#[tokio::test]
async fn test_summary_failure_leaves_session_unchanged() {
    let session_config = SessionConfig {
        recent_window: 0,
        summarize_after: 1,
        ..SessionConfig::default()
    };
    let h = harness_with(
        ScriptedLlm::default()
            .expansion(&[&data_query("How many rooms?")])
            .generation(&[&sql_reply("SELECT COUNT(*) AS total FROM rooms")])
            .response(&["12."]),
        FakeExecutor::default(),
        session_config,
    );

    let response = h.agent.ask(admin_ask("How many rooms?", None)).await.unwrap();
    let session = h.sessions.get(&response.session_id).await.unwrap();
    assert_eq!(session.message_count, 2);
    assert_eq!(session.summarized_count, 0);
    assert!(session.summary.is_empty());
}

#[tokio::test]
async fn test_learn_from_success_stores_qa_chunk() {
    let session_config = SessionConfig {
        learn_from_success: true,
        ..SessionConfig::default()
    };
    let h = harness_with(
        ScriptedLlm::default()
            .expansion(&[&data_query("How many rooms?")])
            .generation(&[&sql_reply("SELECT COUNT(*) AS total FROM rooms")])
            .response(&["12."]),
        FakeExecutor::default(),
        session_config,
    );

    h.agent.ask(admin_ask("How many rooms?", None)).await.unwrap();

    let learned = h.knowledge.get("qa:learned:how-many-rooms").await.unwrap();
    assert_eq!(learned.kind, ChunkKind::Qa);
    assert_eq!(learned.content, "Q: How many rooms?\nSQL: SELECT COUNT(*) AS total FROM rooms");
}
