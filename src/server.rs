use rmcp::{
    ServerHandler,
    tool,
    model::{
        ServerCapabilities, Implementation, ProtocolVersion, CallToolResult,
        RawResource, ListResourcesResult, ReadResourceResult, ResourceContents,
        ReadResourceRequestParams, AnnotateAble,
    },
    handler::server::wrapper::Parameters,
    service::{RequestContext, RoleServer},
    ErrorData as McpError,
};
use serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::agent::{AskRequest, Text2SqlAgent};
use crate::errors::RentqlError;
use crate::knowledge::{ChunkKind, NewChunk};
use crate::session::ChatMessage;
use crate::sql::Requester;

const ALLOWED_SCHEMA_URI: &str = "rentql://allowed-schema";

pub struct RentqlService {
    agent: Arc<Text2SqlAgent>,
    start_time: Instant,
}

impl RentqlService {
    pub fn new(agent: Arc<Text2SqlAgent>) -> Self {
        Self {
            agent,
            start_time: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

// Parameter structs

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct AskParams {
    /// The question in natural language, e.g. "Tháng này tôi còn hóa đơn nào chưa thanh toán?" (required)
    pub question: String,
    /// Session to continue; omit to start a new conversation
    pub session_id: Option<String>,
    /// Id of the signed-in user; required for per-user data
    pub user_id: Option<String>,
    /// Role of the user: "tenant", "landlord" or "admin" (default: "guest")
    pub role: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct GetSessionParams {
    /// Session ID (required)
    pub id: String,
    /// Id of the user asking; must own the session unless role is admin
    pub user_id: Option<String>,
    /// Role of the user asking
    pub role: Option<String>,
    /// Number of most recent messages to include (1-100, default: 20)
    pub messages: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct ListSessionsParams {
    /// Id of the user asking; only their sessions are listed. An admin may
    /// omit it to list every session.
    pub user_id: Option<String>,
    /// Role of the user asking
    pub role: Option<String>,
    /// Maximum results to return (1-100, default: 20)
    pub limit: Option<u32>,
    /// Cursor from previous page for pagination (optional)
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct DeleteSessionParams {
    /// Session ID to delete (required)
    pub id: String,
    /// Id of the user asking; must own the session unless role is admin
    pub user_id: Option<String>,
    /// Role of the user asking
    pub role: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct AddKnowledgeParams {
    /// "business" for a domain rule, "qa" for an example question with its SQL (required)
    pub kind: String,
    /// Short title used in prompts and full-text search
    pub title: Option<String>,
    /// The rule text, or "Q: ...\nSQL: ..." for an example (required)
    pub content: String,
    /// Stable id; reusing one replaces that chunk (optional)
    pub id: Option<String>,
}

// Helper: convert RentqlError to CallToolResult with isError: true
fn error_to_result(err: RentqlError) -> CallToolResult {
    match err {
        RentqlError::NotFound { id } => {
            CallToolResult::structured_error(json!({
                "isError": true,
                "error": format!("Session not found: {}", id),
                "hint": "Use list_sessions to find available session IDs, or omit session_id to start a new one"
            }))
        }
        RentqlError::Validation { message, field } => {
            let mut obj = json!({
                "isError": true,
                "error": message,
            });
            if let Some(f) = field {
                obj["field"] = json!(f);
            }
            CallToolResult::structured_error(obj)
        }
        RentqlError::Storage(msg) => {
            CallToolResult::structured_error(json!({
                "isError": true,
                "error": format!("Storage error: {}", msg)
            }))
        }
        RentqlError::Llm(msg) => {
            CallToolResult::structured_error(json!({
                "isError": true,
                "error": format!("LLM error: {}", msg),
                "hint": "Check that the configured LLM provider is reachable (llm.provider in rentql.toml)"
            }))
        }
        other => {
            CallToolResult::structured_error(json!({
                "isError": true,
                "error": other.to_string()
            }))
        }
    }
}

fn message_json(m: &ChatMessage) -> serde_json::Value {
    json!({
        "seq": m.seq,
        "role": m.role,
        "content": m.content,
        "sql": m.sql,
        "created_at": m.created_at.to_rfc3339(),
    })
}

// Tool implementations
#[rmcp::tool_router]
impl RentqlService {
    #[tool(description = "Ask a question about the rental marketplace data in natural language (Vietnamese or English). Runs one conversational turn: the question is resolved against the session, turned into a guarded read-only SQL query, executed, and answered. Returns the answer, the SQL, and the rows.")]
    async fn ask(
        &self,
        Parameters(params): Parameters<AskParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(
            tool = "ask",
            session_id = ?params.session_id,
            role = ?params.role,
            "Tool called"
        );

        if params.question.trim().is_empty() {
            return Ok(CallToolResult::structured_error(json!({
                "isError": true,
                "error": "Field 'question' is required and cannot be empty",
                "field": "question"
            })));
        }

        let request = AskRequest {
            question: params.question,
            session_id: params.session_id.filter(|s| !s.trim().is_empty()),
            requester: Requester::new(params.user_id, params.role),
        };

        match self.agent.ask(request).await {
            Ok(response) => {
                let mut body = serde_json::to_value(&response)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                body["hint"] = json!("Pass session_id to ask a follow-up question in the same conversation");
                Ok(CallToolResult::structured(body))
            }
            Err(e) => Ok(error_to_result(e)),
        }
    }

    #[tool(description = "Get a conversation session: its rolling summary and most recent messages.")]
    async fn get_session(
        &self,
        Parameters(params): Parameters<GetSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "get_session", id = %params.id, "Tool called");

        if params.id.trim().is_empty() {
            return Ok(CallToolResult::structured_error(json!({
                "isError": true,
                "error": "Field 'id' is required and cannot be empty",
                "field": "id"
            })));
        }

        let requester = Requester::new(params.user_id, params.role);
        let session = match self.agent.session_for(&params.id, &requester).await {
            Ok(session) => session,
            Err(e) => return Ok(error_to_result(e)),
        };
        let n = params.messages.unwrap_or(20).clamp(1, 100) as i64;
        let messages = match self.agent.sessions().recent(&session.id, n).await {
            Ok(messages) => messages,
            Err(e) => return Ok(error_to_result(e)),
        };

        Ok(CallToolResult::structured(json!({
            "id": session.id,
            "user_id": session.user_id,
            "summary": session.summary,
            "summarized_count": session.summarized_count,
            "message_count": session.message_count,
            "created_at": session.created_at.to_rfc3339(),
            "updated_at": session.updated_at.to_rfc3339(),
            "messages": messages.iter().map(message_json).collect::<Vec<_>>(),
        })))
    }

    #[tool(description = "List the requester's conversation sessions (all sessions for admins), most recently active first, with cursor-based pagination.")]
    async fn list_sessions(
        &self,
        Parameters(params): Parameters<ListSessionsParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(
            tool = "list_sessions",
            user_id = ?params.user_id,
            role = ?params.role,
            limit = ?params.limit,
            "Tool called"
        );

        let requester = Requester::new(params.user_id, params.role);
        let limit = params.limit.unwrap_or(20).clamp(1, 100) as i64;

        match self.agent.list_sessions(&requester, limit, params.cursor).await {
            Ok(result) => {
                let sessions: Vec<serde_json::Value> = result
                    .sessions
                    .iter()
                    .map(|s| {
                        json!({
                            "id": s.id,
                            "user_id": s.user_id,
                            "message_count": s.message_count,
                            "summary": s.summary,
                            "updated_at": s.updated_at.to_rfc3339(),
                        })
                    })
                    .collect();
                Ok(CallToolResult::structured(json!({
                    "sessions": sessions,
                    "count": sessions.len(),
                    "next_cursor": result.next_cursor,
                })))
            }
            Err(e) => Ok(error_to_result(e)),
        }
    }

    #[tool(description = "Delete a conversation session and all of its messages.")]
    async fn delete_session(
        &self,
        Parameters(params): Parameters<DeleteSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "delete_session", id = %params.id, "Tool called");

        if params.id.trim().is_empty() {
            return Ok(CallToolResult::structured_error(json!({
                "isError": true,
                "error": "Field 'id' is required and cannot be empty",
                "field": "id"
            })));
        }

        let requester = Requester::new(params.user_id, params.role);
        if let Err(e) = self.agent.session_for(&params.id, &requester).await {
            return Ok(error_to_result(e));
        }

        match self.agent.sessions().delete(&params.id).await {
            Ok(()) => Ok(CallToolResult::structured(json!({
                "deleted": true,
                "id": params.id,
            }))),
            Err(e) => Ok(error_to_result(e)),
        }
    }

    #[tool(description = "Add a business rule or an example question with its SQL to the knowledge base used for SQL generation. The chunk is embedded in the background.")]
    async fn add_knowledge(
        &self,
        Parameters(params): Parameters<AddKnowledgeParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "add_knowledge", kind = %params.kind, "Tool called");

        let kind = match params.kind.trim().to_lowercase().parse::<ChunkKind>() {
            Ok(ChunkKind::Schema) => {
                return Ok(CallToolResult::structured_error(json!({
                    "isError": true,
                    "error": "Schema chunks are generated from the database",
                    "field": "kind",
                    "hint": "Run `rentql knowledge sync-schema` to refresh table descriptions"
                })));
            }
            Ok(kind) => kind,
            Err(e) => {
                return Ok(CallToolResult::structured_error(json!({
                    "isError": true,
                    "error": e,
                    "field": "kind"
                })));
            }
        };

        if params.content.trim().is_empty() {
            return Ok(CallToolResult::structured_error(json!({
                "isError": true,
                "error": "Field 'content' is required and cannot be empty",
                "field": "content"
            })));
        }

        let input = NewChunk {
            id: params.id.filter(|id| !id.trim().is_empty()),
            kind,
            title: params.title.unwrap_or_default(),
            content: params.content,
            metadata: Some(json!({ "source": "mcp" })),
        };

        match self.agent.knowledge().upsert(input).await {
            Ok(chunk) => {
                if let Some(pipeline) = self.agent.pipeline() {
                    pipeline.enqueue_chunk(&chunk);
                }
                Ok(CallToolResult::structured(json!({
                    "id": chunk.id,
                    "kind": chunk.kind,
                    "title": chunk.title,
                    "embedding_status": chunk.embedding_status,
                    "created_at": chunk.created_at.to_rfc3339(),
                    "updated_at": chunk.updated_at.to_rfc3339(),
                    "hint": "Reuse this id with add_knowledge to replace the chunk"
                })))
            }
            Err(e) => Ok(error_to_result(e)),
        }
    }

    #[tool(description = "Knowledge base statistics: chunk counts by kind and embedding status, and embeddings per model.")]
    async fn knowledge_stats(
        &self,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "knowledge_stats", "Tool called");

        match self.agent.knowledge().stats().await {
            Ok(stats) => Ok(CallToolResult::structured(stats)),
            Err(e) => Ok(error_to_result(e)),
        }
    }

    #[tool(description = "Check server health and status")]
    async fn health_check(
        &self,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "health_check", "Tool called");

        let response = json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": self.uptime_seconds(),
        });

        Ok(CallToolResult::structured(response))
    }
}

// ServerHandler implementation
#[rmcp::tool_handler(router = Self::tool_router())]
impl ServerHandler for RentqlService {
    fn get_info(&self) -> rmcp::model::InitializeResult {
        rmcp::model::InitializeResult {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: "rentql".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: Some("Conversational Text2SQL over a rental marketplace database".to_string()),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Ask questions about buildings, rooms, bookings, contracts, bills, payments and ratings in natural language. Tools: ask, get_session, list_sessions, delete_session, add_knowledge, knowledge_stats, health_check. Resources: rentql://allowed-schema (tables and columns queries may use).".to_string()
            ),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<rmcp::model::PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult {
            meta: None,
            resources: vec![
                RawResource {
                    uri: ALLOWED_SCHEMA_URI.to_string(),
                    name: "allowed-schema".to_string(),
                    title: Some("Allowed Schema".to_string()),
                    description: Some("Tables and columns generated SQL may read".to_string()),
                    mime_type: Some("text/plain".to_string()),
                    size: None,
                    icons: None,
                    meta: None,
                }
                .no_annotation(),
            ],
            next_cursor: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        match request.uri.as_str() {
            ALLOWED_SCHEMA_URI => {
                let text = format!(
                    "Tables available to generated SQL:\n{}",
                    self.agent.policy().describe(None)
                );
                Ok(ReadResourceResult {
                    contents: vec![ResourceContents::text(text, request.uri)],
                })
            }
            uri => Err(McpError::resource_not_found(
                format!("Resource not found: {}", uri),
                None,
            )),
        }
    }
}
