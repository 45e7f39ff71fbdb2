/// Schema chunks from live database introspection
///
/// Reads `information_schema` for every allow-listed table and writes one
/// `schema` chunk per table with the stable id `schema:<table>`. Columns the
/// guard would reject never reach the chunk text, so the generator is not
/// shown what it cannot use.

use serde_json::json;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::BTreeMap;

use super::{ChunkKind, KnowledgeStore, NewChunk};
use crate::embedding::pipeline::EmbeddingPipeline;
use crate::errors::RentqlError;
use crate::sql::SqlPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKey>,
}

pub fn schema_chunk_id(table: &str) -> String {
    format!("schema:{}", table)
}

/// Render one table as a schema chunk, keeping only columns the policy
/// allows. Returns None when nothing usable is left.
pub fn render_schema_chunk(table: &TableInfo, policy: &SqlPolicy) -> Option<NewChunk> {
    let columns: Vec<&ColumnInfo> = table
        .columns
        .iter()
        .filter(|c| policy.is_column_allowed(&table.name, &c.name.to_lowercase()))
        .collect();
    if columns.is_empty() {
        return None;
    }

    let mut content = format!("Table {}\nColumns:\n", table.name);
    for column in &columns {
        content.push_str(&format!(
            "- {} {}{}\n",
            column.name,
            column.data_type,
            if column.nullable { "" } else { " NOT NULL" }
        ));
    }

    let relations: Vec<&ForeignKey> = table
        .foreign_keys
        .iter()
        .filter(|fk| {
            policy.is_column_allowed(&table.name, &fk.column.to_lowercase())
                && policy.is_table_allowed(&fk.references_table.to_lowercase())
        })
        .collect();
    if !relations.is_empty() {
        content.push_str("Relationships:\n");
        for fk in &relations {
            content.push_str(&format!(
                "- {}.{} -> {}.{}\n",
                table.name, fk.column, fk.references_table, fk.references_column
            ));
        }
    }

    Some(NewChunk {
        id: Some(schema_chunk_id(&table.name)),
        kind: ChunkKind::Schema,
        title: table.name.clone(),
        content,
        metadata: Some(json!({
            "table": table.name,
            "columns": columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "source": "information_schema",
        })),
    })
}

/// Introspect the allow-listed tables in the `public` schema.
pub async fn introspect(pool: &PgPool, tables: &[String]) -> Result<Vec<TableInfo>, RentqlError> {
    let column_rows = sqlx::query(
        "SELECT table_name::text AS table_name, column_name::text AS column_name, \
                data_type::text AS data_type, (is_nullable = 'YES') AS nullable \
         FROM information_schema.columns \
         WHERE table_schema = 'public' AND table_name = ANY($1) \
         ORDER BY table_name, ordinal_position",
    )
    .bind(tables)
    .fetch_all(pool)
    .await
    .map_err(|e| RentqlError::Storage(format!("Failed to read information_schema: {}", e)))?;

    let fk_rows = sqlx::query(
        "SELECT kcu.table_name::text AS table_name, kcu.column_name::text AS column_name, \
                ccu.table_name::text AS ref_table, ccu.column_name::text AS ref_column \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
           ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
         JOIN information_schema.constraint_column_usage ccu \
           ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema \
         WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = 'public' \
           AND kcu.table_name = ANY($1) \
         ORDER BY kcu.table_name, kcu.column_name",
    )
    .bind(tables)
    .fetch_all(pool)
    .await
    .map_err(|e| RentqlError::Storage(format!("Failed to read foreign keys: {}", e)))?;

    let mut by_table: BTreeMap<String, TableInfo> = BTreeMap::new();
    for row in &column_rows {
        let name: String = row.try_get("table_name")?;
        let info = by_table.entry(name.clone()).or_insert_with(|| TableInfo {
            name,
            ..Default::default()
        });
        info.columns.push(ColumnInfo {
            name: row.try_get("column_name")?,
            data_type: row.try_get("data_type")?,
            nullable: row.try_get("nullable")?,
        });
    }
    for row in &fk_rows {
        let name: String = row.try_get("table_name")?;
        if let Some(info) = by_table.get_mut(&name) {
            info.foreign_keys.push(ForeignKey {
                column: row.try_get("column_name")?,
                references_table: row.try_get("ref_table")?,
                references_column: row.try_get("ref_column")?,
            });
        }
    }

    Ok(by_table.into_values().collect())
}

/// Outcome of a schema sync.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct SchemaSyncReport {
    pub tables_synced: Vec<String>,
    /// Allow-listed tables that do not exist in the database
    pub missing_tables: Vec<String>,
}

/// Refresh schema chunks for all allow-listed tables.
pub async fn sync_schema(
    pool: &PgPool,
    policy: &SqlPolicy,
    store: &dyn KnowledgeStore,
    pipeline: Option<&EmbeddingPipeline>,
) -> Result<SchemaSyncReport, RentqlError> {
    let wanted = policy.table_names().to_vec();
    let tables = introspect(pool, &wanted).await?;
    let mut report = SchemaSyncReport::default();

    for table in &tables {
        let Some(chunk) = render_schema_chunk(table, policy) else {
            tracing::warn!(table = %table.name, "No allowed columns; schema chunk skipped");
            continue;
        };
        let stored = store.upsert(chunk).await?;
        if let Some(pipeline) = pipeline {
            pipeline.enqueue_chunk(&stored);
        }
        report.tables_synced.push(table.name.clone());
    }

    report.missing_tables = wanted
        .into_iter()
        .filter(|t| !tables.iter().any(|info| &info.name == t))
        .collect();
    if !report.missing_tables.is_empty() {
        tracing::warn!(missing = ?report.missing_tables, "Allow-listed tables not found in database");
    }

    tracing::info!(synced = report.tables_synced.len(), "Schema chunks refreshed");
    Ok(report)
}
