/// PostgreSQL-backed implementation of SessionStore

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPool, PgRow},
    Row,
};
use uuid::Uuid;

use super::{
    decode_cursor, encode_cursor, ChatMessage, MessageRole, OwnerFilter, Session, SessionFilter,
    SessionList, SessionStore,
};
use crate::errors::RentqlError;

const SESSION_COLUMNS: &str =
    "id, user_id, summary, summarized_count, message_count, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, session_id, seq, role, content, sql, created_at";

pub struct PostgresSessionStore {
    pool: PgPool,
}

impl PostgresSessionStore {
    pub fn new(pool: PgPool) -> Self {
        PostgresSessionStore { pool }
    }
}

fn row_to_session(row: &PgRow) -> Result<Session, RentqlError> {
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        summary: row.try_get("summary")?,
        summarized_count: row.try_get("summarized_count")?,
        message_count: row.try_get("message_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_message(row: &PgRow) -> Result<ChatMessage, RentqlError> {
    let role: String = row.try_get("role")?;
    Ok(ChatMessage {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        seq: row.try_get("seq")?,
        role: role.parse().map_err(RentqlError::Storage)?,
        content: row.try_get("content")?,
        sql: row.try_get("sql")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn create(&self, user_id: Option<String>) -> Result<Session, RentqlError> {
        let id = Uuid::new_v4().to_string();
        let row = sqlx::query(&format!(
            "INSERT INTO chat_sessions (id, user_id) VALUES ($1, $2) RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(&id)
        .bind(&user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RentqlError::Storage(format!("Failed to create session: {}", e)))?;

        row_to_session(&row)
    }

    async fn get(&self, id: &str) -> Result<Session, RentqlError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM chat_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_session(&row),
            None => Err(RentqlError::NotFound { id: id.to_string() }),
        }
    }

    async fn list(&self, filter: SessionFilter) -> Result<SessionList, RentqlError> {
        let limit = filter.limit.clamp(1, 100);

        let mut conditions: Vec<String> = Vec::new();
        let mut param_idx: u32 = 1;
        let mut cursor: Option<(DateTime<Utc>, String)> = None;

        match filter.owner {
            OwnerFilter::Any => {}
            OwnerFilter::User(_) => {
                conditions.push(format!("user_id = ${}", param_idx));
                param_idx += 1;
            }
            OwnerFilter::Unowned => conditions.push("user_id IS NULL".to_string()),
        }
        if let Some(ref raw) = filter.cursor {
            cursor = Some(decode_cursor(raw)?);
            conditions.push(format!(
                "(updated_at < ${} OR (updated_at = ${} AND id > ${}))",
                param_idx,
                param_idx,
                param_idx + 1
            ));
            param_idx += 2;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT {} FROM chat_sessions {} ORDER BY updated_at DESC, id ASC LIMIT ${}",
            SESSION_COLUMNS, where_clause, param_idx
        );

        let mut q = sqlx::query(&sql);
        if let OwnerFilter::User(ref user_id) = filter.owner {
            q = q.bind(user_id);
        }
        if let Some((ref updated_at, ref id)) = cursor {
            q = q.bind(updated_at).bind(id);
        }
        // One extra row tells us whether another page exists
        q = q.bind(limit + 1);

        let rows = q.fetch_all(&self.pool).await?;
        let has_more = rows.len() as i64 > limit;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows.iter().take(limit as usize) {
            sessions.push(row_to_session(row)?);
        }

        let next_cursor = if has_more {
            sessions.last().map(|s| encode_cursor(&s.updated_at, &s.id))
        } else {
            None
        };

        Ok(SessionList { sessions, next_cursor })
    }

    async fn delete(&self, id: &str) -> Result<(), RentqlError> {
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RentqlError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn append(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        sql: Option<&str>,
    ) -> Result<ChatMessage, RentqlError> {
        let mut tx = self.pool.begin().await?;

        // The row lock taken by this UPDATE serializes concurrent appends, so
        // seq stays dense.
        let seq: Option<i64> = sqlx::query_scalar(
            "UPDATE chat_sessions SET message_count = message_count + 1, updated_at = NOW() \
             WHERE id = $1 RETURNING message_count",
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(seq) = seq else {
            return Err(RentqlError::NotFound { id: session_id.to_string() });
        };

        let row = sqlx::query(&format!(
            "INSERT INTO chat_messages (id, session_id, seq, role, content, sql) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
            MESSAGE_COLUMNS
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(seq)
        .bind(role.as_str())
        .bind(content)
        .bind(sql)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| RentqlError::Storage(format!("Failed to append message: {}", e)))?;

        tx.commit().await?;
        row_to_message(&row)
    }

    async fn messages_after(
        &self,
        session_id: &str,
        after_seq: i64,
    ) -> Result<Vec<ChatMessage>, RentqlError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chat_messages WHERE session_id = $1 AND seq > $2 ORDER BY seq ASC",
            MESSAGE_COLUMNS
        ))
        .bind(session_id)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    async fn recent(&self, session_id: &str, n: i64) -> Result<Vec<ChatMessage>, RentqlError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM (SELECT {} FROM chat_messages WHERE session_id = $1 \
             ORDER BY seq DESC LIMIT $2) latest ORDER BY seq ASC",
            MESSAGE_COLUMNS, MESSAGE_COLUMNS
        ))
        .bind(session_id)
        .bind(n.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    async fn set_summary(
        &self,
        session_id: &str,
        summary: &str,
        through_seq: i64,
    ) -> Result<(), RentqlError> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET summary = $2, summarized_count = $3, updated_at = NOW() \
             WHERE id = $1 AND $3 >= summarized_count AND $3 <= message_count",
        )
        .bind(session_id)
        .bind(summary)
        .bind(through_seq)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing session from an out-of-range seq
            self.get(session_id).await?;
            return Err(RentqlError::validation(
                "through_seq",
                &format!("Summary boundary {} is out of range", through_seq),
            ));
        }
        Ok(())
    }
}
