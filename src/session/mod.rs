/// Persisted conversations
///
/// A session is an ordered log of user and assistant messages plus a rolling
/// summary. Messages with `seq <= summarized_count` are represented by the
/// summary; later ones are passed to prompts verbatim.

pub mod postgres;
pub mod summary;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::RentqlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("Unknown message role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: Option<String>,
    pub summary: String,
    /// Messages up to and including this seq are folded into `summary`
    pub summarized_count: i64,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    /// 1-based, dense within a session
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    /// SQL executed for this answer (assistant messages only)
    pub sql: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Whose sessions a listing returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerFilter {
    #[default]
    Any,
    User(String),
    /// Sessions started without a user id
    Unowned,
}

impl OwnerFilter {
    pub fn matches(&self, owner: Option<&str>) -> bool {
        match self {
            OwnerFilter::Any => true,
            OwnerFilter::User(user) => owner == Some(user.as_str()),
            OwnerFilter::Unowned => owner.is_none(),
        }
    }
}

/// Filter for listing sessions, newest activity first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    pub owner: OwnerFilter,
    pub limit: i64,
    pub cursor: Option<String>,
}

fn cursor_error(message: String) -> RentqlError {
    RentqlError::Validation {
        message,
        field: Some("cursor".to_string()),
    }
}

/// Encode a pagination cursor from updated_at and id.
pub fn encode_cursor(updated_at: &DateTime<Utc>, id: &str) -> String {
    let raw = format!("{}|{}", updated_at.to_rfc3339(), id);
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Position after which the next page starts: sessions older than
/// `updated_at`, or equally old with a greater id.
pub fn decode_cursor(cursor: &str) -> Result<(DateTime<Utc>, String), RentqlError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|e| cursor_error(format!("Invalid cursor encoding: {}", e)))?;
    let raw = String::from_utf8(bytes)
        .map_err(|e| cursor_error(format!("Invalid cursor content: {}", e)))?;
    let (ts, id) = raw
        .split_once('|')
        .ok_or_else(|| cursor_error("Cursor missing id".to_string()))?;
    let updated_at = ts
        .parse::<DateTime<Utc>>()
        .map_err(|e| cursor_error(format!("Cursor timestamp parse error: {}", e)))?;
    Ok((updated_at, id.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<Session>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, user_id: Option<String>) -> Result<Session, RentqlError>;

    async fn get(&self, id: &str) -> Result<Session, RentqlError>;

    async fn list(&self, filter: SessionFilter) -> Result<SessionList, RentqlError>;

    /// Delete a session and all of its messages.
    async fn delete(&self, id: &str) -> Result<(), RentqlError>;

    /// Append a message, assigning the next seq.
    async fn append(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        sql: Option<&str>,
    ) -> Result<ChatMessage, RentqlError>;

    /// Messages with seq > `after_seq`, oldest first.
    async fn messages_after(
        &self,
        session_id: &str,
        after_seq: i64,
    ) -> Result<Vec<ChatMessage>, RentqlError>;

    /// The last `n` messages, oldest first.
    async fn recent(&self, session_id: &str, n: i64) -> Result<Vec<ChatMessage>, RentqlError>;

    /// Replace the summary and mark messages through `through_seq` as folded.
    /// `through_seq` may not move backwards or pass `message_count`.
    async fn set_summary(
        &self,
        session_id: &str,
        summary: &str,
        through_seq: i64,
    ) -> Result<(), RentqlError>;
}

/// What the prompts see of a conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub summary: String,
    pub recent: Vec<ChatMessage>,
}

impl ConversationContext {
    pub async fn load(
        store: &dyn SessionStore,
        session: &Session,
        recent_window: usize,
    ) -> Result<Self, RentqlError> {
        let recent = if recent_window == 0 {
            Vec::new()
        } else {
            store.recent(&session.id, recent_window as i64).await?
        };
        Ok(ConversationContext {
            summary: session.summary.clone(),
            recent,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.summary.trim().is_empty() && self.recent.is_empty()
    }

    /// Plain-text transcript for prompts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.summary.trim().is_empty() {
            out.push_str("Summary of earlier conversation:\n");
            out.push_str(self.summary.trim());
            out.push_str("\n\n");
        }
        if !self.recent.is_empty() {
            out.push_str("Recent messages:\n");
            for message in &self.recent {
                out.push_str(&format!("{}: {}\n", message.role, message.content.trim()));
                if let Some(ref sql) = message.sql {
                    out.push_str(&format!("  (SQL: {})\n", sql.trim()));
                }
            }
        }
        if out.is_empty() {
            out.push_str("(no previous conversation)\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(seq: i64, role: MessageRole, content: &str, sql: Option<&str>) -> ChatMessage {
        ChatMessage {
            id: format!("m{}", seq),
            session_id: "s".to_string(),
            seq,
            role,
            content: content.to_string(),
            sql: sql.map(|s| s.to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_cursor_round_trip() {
        let ts = "2026-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let cursor = encode_cursor(&ts, "abc|def");
        let (decoded_ts, decoded_id) = decode_cursor(&cursor).unwrap();
        assert_eq!(decoded_ts, ts);
        assert_eq!(decoded_id, "abc|def");
    }

    #[test]
    fn test_bad_cursor_is_validation_error() {
        assert!(matches!(
            decode_cursor("not base64!!"),
            Err(RentqlError::Validation { .. })
        ));
        let no_sep = URL_SAFE_NO_PAD.encode("2026-03-01T10:00:00Z");
        assert!(matches!(decode_cursor(&no_sep), Err(RentqlError::Validation { .. })));
    }

    #[test]
    fn test_owner_filter_matches() {
        assert!(OwnerFilter::Any.matches(Some("7")));
        assert!(OwnerFilter::User("7".to_string()).matches(Some("7")));
        assert!(!OwnerFilter::User("7".to_string()).matches(None));
        assert!(OwnerFilter::Unowned.matches(None));
        assert!(!OwnerFilter::Unowned.matches(Some("7")));
    }

    #[test]
    fn test_role_round_trips_through_str() {
        assert_eq!("assistant".parse::<MessageRole>().unwrap(), MessageRole::Assistant);
        assert!("system".parse::<MessageRole>().is_err());
    }

    #[test]
    fn test_render_includes_summary_and_sql() {
        let ctx = ConversationContext {
            summary: "Người dùng hỏi về phòng ở quận 7.".to_string(),
            recent: vec![
                message(3, MessageRole::User, "Phòng nào rẻ nhất?", None),
                message(4, MessageRole::Assistant, "Phòng A1, 2.5 triệu.", Some("SELECT name FROM rooms ORDER BY price LIMIT 1")),
            ],
        };
        let text = ctx.render();
        assert!(text.starts_with("Summary of earlier conversation:\nNgười dùng"));
        assert!(text.contains("user: Phòng nào rẻ nhất?"));
        assert!(text.contains("(SQL: SELECT name FROM rooms ORDER BY price LIMIT 1)"));
    }

    #[test]
    fn test_render_empty_context() {
        let ctx = ConversationContext::default();
        assert!(ctx.is_empty());
        assert_eq!(ctx.render(), "(no previous conversation)\n");
    }
}
