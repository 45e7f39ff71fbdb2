/// Guarded SQL execution
///
/// `guard` decides whether generated SQL may run for a given requester;
/// `executor` runs validated SQL read-only with a row cap and a timeout.

pub mod executor;
pub mod guard;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::config::{ScopeRule, SqlConfig};
use crate::errors::RentqlError;
pub use guard::{validate, SqlGuardError, ValidatedSql};

/// Role that bypasses row scoping.
pub const ADMIN_ROLE: &str = "admin";

/// Who is asking. Scope rules are keyed on `role`; `user_id` is the value
/// scoped columns must be constrained to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requester {
    pub user_id: Option<String>,
    pub role: String,
}

impl Requester {
    pub fn new(user_id: Option<String>, role: Option<String>) -> Self {
        Requester {
            user_id: user_id.filter(|u| !u.trim().is_empty()),
            role: role
                .map(|r| r.trim().to_lowercase())
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "guest".to_string()),
        }
    }

    pub fn admin() -> Self {
        Requester { user_id: None, role: ADMIN_ROLE.to_string() }
    }

    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }
}

/// Compiled allow-list derived from [`SqlConfig`]. All names are lowercase.
#[derive(Debug, Clone)]
pub struct SqlPolicy {
    /// table -> allowed columns (None = every non-sensitive column)
    tables: HashMap<String, Option<HashSet<String>>>,
    /// Keeps configuration order for prompts
    table_order: Vec<String>,
    sensitive: HashSet<String>,
    scopes: Vec<ScopeRule>,
    pub max_rows: i64,
    pub statement_timeout_ms: u64,
}

impl SqlPolicy {
    pub fn from_config(config: &SqlConfig) -> Self {
        let mut tables = HashMap::new();
        let mut table_order = Vec::new();
        for table in &config.allowed_tables {
            let name = table.name.to_lowercase();
            let columns = if table.columns.is_empty() {
                None
            } else {
                Some(table.columns.iter().map(|c| c.to_lowercase()).collect())
            };
            if tables.insert(name.clone(), columns).is_none() {
                table_order.push(name);
            }
        }

        SqlPolicy {
            tables,
            table_order,
            sensitive: config.sensitive_columns.iter().map(|c| c.to_lowercase()).collect(),
            scopes: config
                .scoped_tables
                .iter()
                .map(|s| ScopeRule {
                    table: s.table.to_lowercase(),
                    column: s.column.to_lowercase(),
                    role: s.role.to_lowercase(),
                })
                .collect(),
            max_rows: config.max_rows.max(1),
            statement_timeout_ms: config.statement_timeout_ms,
        }
    }

    pub fn is_table_allowed(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Column allow-list for a table, if it is column-restricted.
    pub fn column_allow_list(&self, table: &str) -> Option<&HashSet<String>> {
        self.tables.get(table).and_then(|c| c.as_ref())
    }

    pub fn is_column_allowed(&self, table: &str, column: &str) -> bool {
        if self.is_sensitive(column) {
            return false;
        }
        match self.tables.get(table) {
            Some(Some(columns)) => columns.contains(column),
            Some(None) => true,
            None => false,
        }
    }

    pub fn is_sensitive(&self, column: &str) -> bool {
        self.sensitive.contains(column)
    }

    pub fn table_names(&self) -> &[String] {
        &self.table_order
    }

    /// Scope rules that bind the given requester.
    pub fn scopes_for<'a>(&'a self, requester: &'a Requester) -> impl Iterator<Item = &'a ScopeRule> + 'a {
        self.scopes
            .iter()
            .filter(move |s| !requester.is_admin() && s.role == requester.role)
    }

    /// Plain-text description of the allow-list and the requester's row
    /// scoping, for prompts and the allowed-schema resource.
    pub fn describe(&self, requester: Option<&Requester>) -> String {
        let mut out = String::new();
        for name in &self.table_order {
            match self.tables.get(name) {
                Some(Some(columns)) => {
                    let mut cols: Vec<&str> = columns.iter().map(|c| c.as_str()).collect();
                    cols.sort_unstable();
                    out.push_str(&format!("- {} (only columns: {})\n", name, cols.join(", ")));
                }
                _ => out.push_str(&format!("- {}\n", name)),
            }
        }
        if let Some(requester) = requester {
            let rules: Vec<String> = self
                .scopes_for(requester)
                .map(|s| {
                    format!(
                        "- every use of {} must filter {}.{} = '{}'",
                        s.table,
                        s.table,
                        s.column,
                        requester.user_id.as_deref().unwrap_or("<unknown>")
                    )
                })
                .collect();
            if !rules.is_empty() {
                out.push_str("Row restrictions for this user:\n");
                out.push_str(&rules.join("\n"));
                out.push('\n');
            }
        }
        out
    }
}

/// Rows returned by an executed query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    /// One JSON object per row
    pub rows: Vec<serde_json::Value>,
    pub row_count: usize,
    /// True when more than `max_rows` rows matched
    pub truncated: bool,
    pub elapsed_ms: u64,
}

/// Runs validated SQL.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &ValidatedSql) -> Result<QueryResult, RentqlError>;
}
