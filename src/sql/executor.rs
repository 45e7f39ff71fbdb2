/// Read-only execution of validated SQL
///
/// Every query runs inside its own transaction that is marked READ ONLY,
/// carries a local statement timeout and is always rolled back. Each row comes
/// back as `row_to_json` text so arbitrary result shapes need no type mapping.

use async_trait::async_trait;
use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::{Map, Value};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use super::{QueryExecutor, QueryResult, SqlPolicy, ValidatedSql};
use crate::errors::RentqlError;

pub struct PostgresQueryExecutor {
    pool: PgPool,
    max_rows: i64,
    statement_timeout_ms: u64,
    sensitive: HashSet<String>,
}

impl PostgresQueryExecutor {
    pub fn new(pool: PgPool, policy: &SqlPolicy, sensitive_columns: &[String]) -> Self {
        PostgresQueryExecutor {
            pool,
            max_rows: policy.max_rows,
            statement_timeout_ms: policy.statement_timeout_ms,
            sensitive: sensitive_columns.iter().map(|c| c.to_lowercase()).collect(),
        }
    }
}

/// Wrap a validated query so it yields at most `max_rows + 1` rows, each as
/// one JSON object. The extra row tells us the result was truncated. Rows are
/// streamed rather than aggregated so they keep the query's own order.
pub fn wrap_for_json(sql: &str, max_rows: i64) -> String {
    format!(
        "SELECT row_to_json(t)::text AS row \
         FROM (SELECT * FROM ({}) AS q LIMIT {}) AS t",
        sql,
        max_rows + 1
    )
}

/// One result row as `row_to_json` produced it: fields in select-list order,
/// duplicate names included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFields(pub Vec<(String, Value)>);

impl<'de> Deserialize<'de> for RowFields {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RowFieldsVisitor;

        impl<'de> Visitor<'de> for RowFieldsVisitor {
            type Value = RowFields;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a JSON object")
            }

            fn visit_map<V>(self, mut map: V) -> Result<RowFields, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut fields = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, serde_json::Value>()? {
                    fields.push((key, value));
                }
                Ok(RowFields(fields))
            }
        }

        deserializer.deserialize_map(RowFieldsVisitor)
    }
}

impl RowFields {
    pub fn parse(text: &str) -> Result<Self, RentqlError> {
        serde_json::from_str(text)
            .map_err(|e| RentqlError::Execution(format!("Unreadable result row: {}", e)))
    }
}

/// Give repeated names a positional suffix: `id`, `id_2`, `id_3`.
fn unique_names(names: &[&str]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut taken: HashSet<String> = names.iter().map(|n| n.to_string()).collect();
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let count = seen.entry(*name).or_insert(0);
        *count += 1;
        if *count == 1 {
            out.push(name.to_string());
            continue;
        }
        let mut n = *count;
        let mut candidate = format!("{}_{}", name, n);
        while taken.contains(&candidate) {
            n += 1;
            candidate = format!("{}_{}", name, n);
        }
        taken.insert(candidate.clone());
        out.push(candidate);
    }
    out
}

/// Turn streamed rows into a [`QueryResult`]: cap rows, make column names
/// unique, drop sensitive columns.
pub fn shape_rows(
    rows: Vec<RowFields>,
    max_rows: i64,
    sensitive: &HashSet<String>,
    elapsed_ms: u64,
) -> QueryResult {
    let limit = max_rows.max(0) as usize;
    let truncated = rows.len() > limit;

    // Every row of one result has the same fields in the same order
    let raw: Vec<&str> = rows
        .first()
        .map(|r| r.0.iter().map(|(k, _)| k.as_str()).collect())
        .unwrap_or_default();
    let names = unique_names(&raw);
    let keep: Vec<bool> = raw
        .iter()
        .map(|k| !sensitive.contains(&k.to_lowercase()))
        .collect();

    let shaped: Vec<Value> = rows
        .into_iter()
        .take(limit)
        .map(|row| {
            let mut map = Map::with_capacity(names.len());
            for (i, (_, value)) in row.0.into_iter().enumerate() {
                if let (Some(name), Some(true)) = (names.get(i), keep.get(i)) {
                    map.insert(name.clone(), value);
                }
            }
            Value::Object(map)
        })
        .collect();

    let columns = names
        .into_iter()
        .zip(keep)
        .filter_map(|(name, keep)| keep.then_some(name))
        .collect();

    QueryResult {
        columns,
        row_count: shaped.len(),
        rows: shaped,
        truncated,
        elapsed_ms,
    }
}

#[async_trait]
impl QueryExecutor for PostgresQueryExecutor {
    async fn execute(&self, sql: &ValidatedSql) -> Result<QueryResult, RentqlError> {
        let start = Instant::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RentqlError::Storage(format!("Failed to open query transaction: {}", e)))?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| RentqlError::Execution(e.to_string()))?;

        // SET does not accept bind parameters
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout_ms
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| RentqlError::Execution(e.to_string()))?;

        let wrapped = wrap_for_json(&sql.sql, self.max_rows);
        let outcome = sqlx::query(&wrapped).fetch_all(&mut *tx).await;

        if let Err(e) = tx.rollback().await {
            tracing::warn!(error = %e, "Rollback of read-only query transaction failed");
        }

        let db_rows = outcome.map_err(|e| RentqlError::Execution(describe_db_error(&e)))?;
        let mut rows = Vec::with_capacity(db_rows.len());
        for row in &db_rows {
            let text: String = row
                .try_get("row")
                .map_err(|e| RentqlError::Execution(format!("Unreadable result: {}", e)))?;
            rows.push(RowFields::parse(&text)?);
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let result = shape_rows(rows, self.max_rows, &self.sensitive, elapsed_ms);

        tracing::debug!(
            tables = ?sql.tables,
            rows = result.row_count,
            truncated = result.truncated,
            elapsed_ms,
            "Executed generated SQL"
        );

        Ok(result)
    }
}

/// Database errors are fed back to the generator, so keep only the message
/// and the SQLSTATE.
fn describe_db_error(e: &sqlx::Error) -> String {
    match e {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if code == "57014" => "statement timed out".to_string(),
            Some(code) => format!("{} (SQLSTATE {})", db.message(), code),
            None => db.message().to_string(),
        },
        other => other.to_string(),
    }
}
