/// Read-only SQL guard
///
/// Accepts exactly one SELECT (optionally with CTEs) that touches only
/// allow-listed tables and columns, never reads a sensitive column, and, for
/// scoped roles, constrains every scoped table to the requester's id.

use sqlparser::ast::{
    BinaryOperator, Expr, Ident, Join, JoinConstraint, JoinOperator, ObjectName, Query,
    SelectItem, SetExpr, Statement, TableFactor, TableWithJoins, Value, Visit, Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use thiserror::Error;

use super::{Requester, SqlPolicy};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SqlGuardError {
    #[error("SQL is empty")]
    Empty,

    #[error("SQL could not be parsed: {0}")]
    Parse(String),

    #[error("exactly one statement is allowed, found {0}")]
    MultipleStatements(usize),

    #[error("only SELECT queries are allowed, got {0}")]
    NotAQuery(String),

    #[error("keyword `{0}` is not allowed in a read-only query")]
    ForbiddenKeyword(String),

    #[error("SELECT ... INTO is not allowed")]
    SelectInto,

    #[error("row locking clauses (FOR UPDATE/SHARE) are not allowed")]
    LockingClause,

    #[error("table `{0}` is not in the allowed list")]
    TableNotAllowed(String),

    #[error("schema `{0}` is not allowed; use unqualified table names")]
    SchemaNotAllowed(String),

    #[error("column `{column}` of table `{table}` is not allowed")]
    ColumnNotAllowed { table: String, column: String },

    #[error("column `{0}` holds sensitive data and cannot be queried")]
    SensitiveColumn(String),

    #[error("wildcard select on `{0}` is not allowed; list the allowed columns explicitly")]
    RestrictedWildcard(String),

    #[error("column `{column}` must be qualified with its table alias when `{table}` is queried")]
    UnqualifiedColumn { table: String, column: String },

    #[error("column aliases on table `{0}` are not allowed; alias columns in the select list instead")]
    RenamedColumns(String),

    #[error("function `{0}` is not allowed")]
    ForbiddenFunction(String),

    #[error("queries on `{table}` must filter `{column}` to the current user's id")]
    MissingScope { table: String, column: String },

    #[error("`{0}` holds per-user data; a signed-in user is required")]
    AnonymousScoped(String),
}

/// SQL that passed the guard.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSql {
    /// Original text with trailing semicolons removed
    pub sql: String,
    /// Allow-listed tables the query reads, sorted
    pub tables: Vec<String>,
}

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "merge", "create", "alter", "drop", "truncate", "grant",
    "revoke", "copy", "into", "call", "execute", "vacuum", "reindex", "lock", "listen",
    "notify", "prepare",
];

const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "lo_import", "lo_export", "dblink", "dblink_exec", "set_config", "query_to_xml",
];

const ALLOWED_SCHEMAS: &[&str] = &["public"];

/// Check generated SQL against the policy for this requester.
pub fn validate(
    raw_sql: &str,
    policy: &SqlPolicy,
    requester: &Requester,
) -> Result<ValidatedSql, SqlGuardError> {
    let sql = strip_trailing_semicolons(raw_sql);
    if sql.is_empty() {
        return Err(SqlGuardError::Empty);
    }

    let dialect = PostgreSqlDialect {};

    // Token scan first: string literals and quoted identifiers are single
    // tokens, so `WHERE note ILIKE '%delete%'` is not a false positive.
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| SqlGuardError::Parse(e.to_string()))?;
    for token in &tokens {
        if let Token::Word(word) = token {
            if word.quote_style.is_none() {
                let lower = word.value.to_lowercase();
                if FORBIDDEN_KEYWORDS.contains(&lower.as_str()) {
                    return Err(SqlGuardError::ForbiddenKeyword(lower));
                }
            }
        }
    }

    let statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| SqlGuardError::Parse(e.to_string()))?;
    if statements.len() != 1 {
        return Err(SqlGuardError::MultipleStatements(statements.len()));
    }
    let statement = &statements[0];
    if !matches!(statement, Statement::Query(_)) {
        let kind = statement
            .to_string()
            .split_whitespace()
            .next()
            .unwrap_or("unknown")
            .to_uppercase();
        return Err(SqlGuardError::NotAQuery(kind));
    }

    let mut collector = Collector::new(policy, requester);
    if let ControlFlow::Break(err) = statement.visit(&mut collector) {
        return Err(err);
    }
    let tables = collector.finish()?;

    Ok(ValidatedSql {
        sql: sql.to_string(),
        tables,
    })
}

fn strip_trailing_semicolons(raw_sql: &str) -> &str {
    let mut candidate = raw_sql.trim();
    while let Some(stripped) = candidate.strip_suffix(';') {
        candidate = stripped.trim_end();
    }
    candidate
}

fn last_ident_lower(name: &ObjectName) -> String {
    name.0.last().map(|i| i.value.to_lowercase()).unwrap_or_default()
}

fn idents_lower(idents: &[Ident]) -> HashSet<String> {
    idents.iter().map(|i| i.value.to_lowercase()).collect()
}

/// What a name in a FROM clause refers to.
#[derive(Debug, Clone, PartialEq)]
enum Source {
    Table(String),
    /// A CTE or derived table; its body is checked at its own level
    Subquery,
}

/// Names and references of one query level.
#[derive(Debug, Default)]
struct Frame {
    /// Enclosing level that unresolved names fall through to
    parent: Option<usize>,
    /// CTEs visible to this level's FROM, with their output names
    ctes: HashMap<String, HashSet<String>>,
    /// qualifier -> source; set-operation branches may bind one qualifier twice
    sources: HashMap<String, Vec<Source>>,
    /// Real tables read at this level
    tables: Vec<String>,
    /// Output names of the CTEs and derived tables read at this level
    subquery_outputs: HashSet<String>,
    /// Bare ORDER BY references to select-list aliases, by name
    order_by_aliases: HashMap<String, usize>,
    /// None = bare `*`, Some(q) = `q.*`
    wildcards: Vec<Option<String>>,
    qualified_columns: Vec<(String, String)>,
    unqualified_columns: Vec<String>,
}

/// Scope prepared for a query before the walk reaches it.
struct PendingScope {
    query: *const Query,
    parent: Option<usize>,
    ctes: HashMap<String, HashSet<String>>,
}

/// Walks the AST once. Every query level gets a [`Frame`]; each FROM item is
/// classified as a real table or a visible CTE when it is visited.
struct Collector<'a> {
    policy: &'a SqlPolicy,
    requester: &'a Requester,
    frames: Vec<Frame>,
    stack: Vec<usize>,
    pending: Vec<PendingScope>,
}

impl<'a> Collector<'a> {
    fn new(policy: &'a SqlPolicy, requester: &'a Requester) -> Self {
        Collector {
            policy,
            requester,
            frames: Vec::new(),
            stack: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn current(&self) -> Option<usize> {
        self.stack.last().copied()
    }

    fn enter_query(&mut self, query: &Query) -> Result<(), SqlGuardError> {
        if !query.locks.is_empty() {
            return Err(SqlGuardError::LockingClause);
        }

        let current = self.current();
        let (parent, mut ctes) = match self
            .pending
            .iter()
            .position(|p| std::ptr::eq(p.query, query))
        {
            Some(pos) => {
                let scope = self.pending.swap_remove(pos);
                (scope.parent, scope.ctes)
            }
            None => (
                current,
                current.map(|i| self.frames[i].ctes.clone()).unwrap_or_default(),
            ),
        };

        // A non-recursive CTE body sees only the CTEs declared before it, so
        // `WITH rooms AS (SELECT * FROM rooms)` reads the real table inside.
        if let Some(ref with) = query.with {
            let declared: Vec<(String, HashSet<String>)> = with
                .cte_tables
                .iter()
                .map(|cte| {
                    let outputs = if cte.alias.columns.is_empty() {
                        query_outputs(&cte.query)
                    } else {
                        idents_lower(&cte.alias.columns)
                    };
                    (cte.alias.name.value.to_lowercase(), outputs)
                })
                .collect();
            for (cte, (name, outputs)) in with.cte_tables.iter().zip(&declared) {
                let mut body_ctes = ctes.clone();
                if with.recursive {
                    body_ctes.extend(declared.iter().cloned());
                }
                self.pending.push(PendingScope {
                    query: &*cte.query,
                    parent,
                    ctes: body_ctes,
                });
                ctes.insert(name.clone(), outputs.clone());
            }
        }

        let mut frame = Frame {
            parent,
            ctes,
            ..Frame::default()
        };
        let mut aliases = HashSet::new();
        collect_projection(&query.body, &mut aliases, &mut frame.wildcards);
        for item in &query.order_by {
            if let Expr::Identifier(ident) = &item.expr {
                let name = ident.value.to_lowercase();
                if aliases.contains(&name) {
                    *frame.order_by_aliases.entry(name).or_insert(0) += 1;
                }
            }
        }

        let idx = self.frames.len();
        self.frames.push(frame);
        self.stack.push(idx);
        self.check_scopes(&query.body, idx)
    }

    fn enter_table_factor(&mut self, factor: &TableFactor) -> Result<(), SqlGuardError> {
        let Some(idx) = self.current() else {
            return Ok(());
        };

        match factor {
            TableFactor::Table { name, alias, .. } => {
                if name.0.len() > 1 {
                    let schema = name.0[name.0.len() - 2].value.to_lowercase();
                    if !ALLOWED_SCHEMAS.contains(&schema.as_str()) {
                        return Err(SqlGuardError::SchemaNotAllowed(schema));
                    }
                }
                let table = last_ident_lower(name);
                let qualifier = alias
                    .as_ref()
                    .map(|a| a.name.value.to_lowercase())
                    .unwrap_or_else(|| table.clone());
                let cte_outputs = if name.0.len() == 1 {
                    self.frames[idx].ctes.get(&table).cloned()
                } else {
                    None
                };

                let frame = &mut self.frames[idx];
                match cte_outputs {
                    Some(outputs) => {
                        frame.subquery_outputs.extend(outputs);
                        if let Some(alias) = alias {
                            frame.subquery_outputs.extend(idents_lower(&alias.columns));
                        }
                        frame.sources.entry(qualifier).or_default().push(Source::Subquery);
                    }
                    None => {
                        if !self.policy.is_table_allowed(&table) {
                            return Err(SqlGuardError::TableNotAllowed(table));
                        }
                        if alias.as_ref().is_some_and(|a| !a.columns.is_empty()) {
                            return Err(SqlGuardError::RenamedColumns(table));
                        }
                        frame.tables.push(table.clone());
                        frame.sources.entry(qualifier).or_default().push(Source::Table(table));
                    }
                }
            }
            TableFactor::Derived { lateral, subquery, alias } => {
                let outputs = match alias {
                    Some(a) if !a.columns.is_empty() => idents_lower(&a.columns),
                    _ => query_outputs(subquery),
                };
                // Only LATERAL subqueries see the FROM items beside them
                let parent = if *lateral { Some(idx) } else { self.frames[idx].parent };
                self.pending.push(PendingScope {
                    query: &**subquery,
                    parent,
                    ctes: self.frames[idx].ctes.clone(),
                });

                let frame = &mut self.frames[idx];
                frame.subquery_outputs.extend(outputs);
                if let Some(alias) = alias {
                    frame
                        .sources
                        .entry(alias.name.value.to_lowercase())
                        .or_default()
                        .push(Source::Subquery);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Checks that need every level collected; returns the tables read.
    fn finish(self) -> Result<Vec<String>, SqlGuardError> {
        let mut tables: Vec<String> = self
            .frames
            .iter()
            .flat_map(|f| f.tables.iter().cloned())
            .collect();
        tables.sort();
        tables.dedup();

        for frame in &self.frames {
            for column in frame
                .unqualified_columns
                .iter()
                .chain(frame.qualified_columns.iter().map(|(_, c)| c))
            {
                if self.policy.is_sensitive(column) {
                    return Err(SqlGuardError::SensitiveColumn(column.clone()));
                }
            }
        }

        for (idx, frame) in self.frames.iter().enumerate() {
            for (qualifier, column) in &frame.qualified_columns {
                for table in self.tables_named(idx, qualifier) {
                    if !self.policy.is_column_allowed(table, column) {
                        return Err(SqlGuardError::ColumnNotAllowed {
                            table: table.clone(),
                            column: column.clone(),
                        });
                    }
                }
            }

            for wildcard in &frame.wildcards {
                let covered: Vec<&String> = match wildcard {
                    None => frame.tables.iter().collect(),
                    Some(q) => self.tables_named(idx, q),
                };
                if let Some(table) = covered
                    .into_iter()
                    .find(|t| self.policy.column_allow_list(t).is_some())
                {
                    return Err(SqlGuardError::RestrictedWildcard(table.clone()));
                }
            }

            let mut order_by_aliases = frame.order_by_aliases.clone();
            for column in &frame.unqualified_columns {
                self.check_unqualified(idx, column, &mut order_by_aliases)?;
            }
        }

        Ok(tables)
    }

    /// Real tables a qualifier names, resolved from `idx` outwards.
    fn tables_named(&self, idx: usize, qualifier: &str) -> Vec<&String> {
        let mut level = Some(idx);
        while let Some(i) = level {
            if let Some(sources) = self.frames[i].sources.get(qualifier) {
                return sources
                    .iter()
                    .filter_map(|s| match s {
                        Source::Table(t) => Some(t),
                        Source::Subquery => None,
                    })
                    .collect();
            }
            level = self.frames[i].parent;
        }
        Vec::new()
    }

    /// An unqualified name may resolve at any enclosing level. At every level
    /// that reads a column-restricted table it must be allowed there, name a
    /// subquery output (a clash with a table column is then ambiguous), or be
    /// a bare ORDER BY reference to a select-list alias.
    fn check_unqualified(
        &self,
        idx: usize,
        column: &str,
        order_by_aliases: &mut HashMap<String, usize>,
    ) -> Result<(), SqlGuardError> {
        let mut level = Some(idx);
        while let Some(i) = level {
            let frame = &self.frames[i];
            let restricted: Vec<&String> = frame
                .tables
                .iter()
                .filter(|t| self.policy.column_allow_list(t).is_some())
                .collect();

            if let Some(first) = restricted.first() {
                let allowed = restricted
                    .iter()
                    .any(|t| self.policy.is_column_allowed(t, column))
                    || frame.subquery_outputs.contains(column);
                if !allowed {
                    match order_by_aliases.get_mut(column) {
                        Some(remaining) if i == idx && *remaining > 0 => *remaining -= 1,
                        _ => {
                            return Err(SqlGuardError::UnqualifiedColumn {
                                table: (*first).clone(),
                                column: column.to_string(),
                            })
                        }
                    }
                }
            }
            level = frame.parent;
        }
        Ok(())
    }

    /// Per-SELECT scope check: every scoped table in a SELECT's FROM must be
    /// pinned to the requester by an equality conjunct.
    fn check_scopes(&self, body: &SetExpr, idx: usize) -> Result<(), SqlGuardError> {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    return Err(SqlGuardError::SelectInto);
                }
                let where_conjuncts = select
                    .selection
                    .as_ref()
                    .map(conjuncts)
                    .unwrap_or_default();
                for twj in &select.from {
                    self.check_join_tree(twj, &where_conjuncts, idx)?;
                }
                Ok(())
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.check_scopes(left, idx)?;
                self.check_scopes(right, idx)
            }
            // Parenthesized queries and subqueries are visited on their own
            _ => Ok(()),
        }
    }

    /// `outer` holds the conjuncts that filter every row of this join tree.
    fn check_join_tree(
        &self,
        twj: &TableWithJoins,
        outer: &[&Expr],
        idx: usize,
    ) -> Result<(), SqlGuardError> {
        let mut base = outer.to_vec();
        base.extend(
            twj.joins
                .iter()
                .filter(|j| matches!(j.join_operator, JoinOperator::Inner(_)))
                .flat_map(join_on_conjuncts),
        );
        self.check_factor(&twj.relation, &base, idx)?;

        for join in &twj.joins {
            let mut available = outer.to_vec();
            if matches!(
                join.join_operator,
                JoinOperator::Inner(_) | JoinOperator::LeftOuter(_)
            ) {
                available.extend(join_on_conjuncts(join));
            }
            self.check_factor(&join.relation, &available, idx)?;
        }
        Ok(())
    }

    fn check_factor(
        &self,
        factor: &TableFactor,
        conjuncts: &[&Expr],
        idx: usize,
    ) -> Result<(), SqlGuardError> {
        let (name, alias) = match factor {
            TableFactor::Table { name, alias, .. } => (name, alias),
            TableFactor::NestedJoin { table_with_joins, .. } => {
                return self.check_join_tree(table_with_joins, conjuncts, idx);
            }
            _ => return Ok(()),
        };
        let table = last_ident_lower(name);
        if name.0.len() == 1 && self.frames[idx].ctes.contains_key(&table) {
            return Ok(());
        }
        let qualifier = alias
            .as_ref()
            .map(|a| a.name.value.to_lowercase())
            .unwrap_or_else(|| table.clone());

        for rule in self.policy.scopes_for(self.requester) {
            if rule.table != table {
                continue;
            }
            let Some(ref user_id) = self.requester.user_id else {
                return Err(SqlGuardError::AnonymousScoped(table));
            };
            let pinned = conjuncts
                .iter()
                .any(|e| pins_column(e, &qualifier, &rule.column, user_id));
            if !pinned {
                return Err(SqlGuardError::MissingScope {
                    table,
                    column: rule.column.clone(),
                });
            }
        }
        Ok(())
    }
}

impl<'a> Visitor for Collector<'a> {
    type Break = SqlGuardError;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        match self.enter_query(query) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(e),
        }
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.stack.pop();
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        match self.enter_table_factor(factor) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(e),
        }
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        let Some(idx) = self.current() else {
            return ControlFlow::Continue(());
        };
        let frame = &mut self.frames[idx];
        match expr {
            Expr::Identifier(ident) => {
                frame.unqualified_columns.push(ident.value.to_lowercase());
            }
            Expr::CompoundIdentifier(idents) if idents.len() >= 2 => {
                let column = idents[idents.len() - 1].value.to_lowercase();
                let qualifier = idents[idents.len() - 2].value.to_lowercase();
                frame.qualified_columns.push((qualifier, column));
            }
            Expr::Function(function) => {
                let name = last_ident_lower(&function.name);
                if name.starts_with("pg_") || FORBIDDEN_FUNCTIONS.contains(&name.as_str()) {
                    return ControlFlow::Break(SqlGuardError::ForbiddenFunction(name));
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

fn collect_projection(
    body: &SetExpr,
    aliases: &mut HashSet<String>,
    wildcards: &mut Vec<Option<String>>,
) {
    match body {
        SetExpr::Select(select) => {
            for item in &select.projection {
                match item {
                    SelectItem::ExprWithAlias { alias, .. } => {
                        aliases.insert(alias.value.to_lowercase());
                    }
                    SelectItem::Wildcard(_) => wildcards.push(None),
                    SelectItem::QualifiedWildcard(name, _) => {
                        wildcards.push(Some(last_ident_lower(name)));
                    }
                    SelectItem::UnnamedExpr(_) => {}
                }
            }
        }
        SetExpr::SetOperation { left, right, .. } => {
            collect_projection(left, aliases, wildcards);
            collect_projection(right, aliases, wildcards);
        }
        _ => {}
    }
}

/// Column names a subquery is known to produce. Wildcards add nothing, so a
/// name that only a `*` would supply is treated as unknown.
fn query_outputs(query: &Query) -> HashSet<String> {
    fn walk(body: &SetExpr, out: &mut HashSet<String>) {
        match body {
            SetExpr::Select(select) => {
                for item in &select.projection {
                    match item {
                        SelectItem::ExprWithAlias { alias, .. } => {
                            out.insert(alias.value.to_lowercase());
                        }
                        SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                            out.insert(ident.value.to_lowercase());
                        }
                        SelectItem::UnnamedExpr(Expr::CompoundIdentifier(idents)) => {
                            if let Some(last) = idents.last() {
                                out.insert(last.value.to_lowercase());
                            }
                        }
                        _ => {}
                    }
                }
            }
            // Result columns are named by the first branch
            SetExpr::SetOperation { left, .. } => walk(left, out),
            SetExpr::Query(query) => walk(&query.body, out),
            _ => {}
        }
    }

    let mut out = HashSet::new();
    walk(&query.body, &mut out);
    out
}

/// Split an expression on top-level AND.
fn conjuncts(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            let mut out = conjuncts(left);
            out.extend(conjuncts(right));
            out
        }
        Expr::Nested(inner) => conjuncts(inner),
        other => vec![other],
    }
}

fn join_on_conjuncts(join: &Join) -> Vec<&Expr> {
    match &join.join_operator {
        JoinOperator::Inner(JoinConstraint::On(e))
        | JoinOperator::LeftOuter(JoinConstraint::On(e))
        | JoinOperator::RightOuter(JoinConstraint::On(e))
        | JoinOperator::FullOuter(JoinConstraint::On(e)) => conjuncts(e),
        _ => Vec::new(),
    }
}

/// Is `expr` an equality between `qualifier.column` (or bare `column`) and the
/// literal `user_id`?
fn pins_column(expr: &Expr, qualifier: &str, column: &str, user_id: &str) -> bool {
    let Expr::BinaryOp { left, op: BinaryOperator::Eq, right } = expr else {
        return false;
    };
    (refers_to(left, qualifier, column) && is_literal(right, user_id))
        || (refers_to(right, qualifier, column) && is_literal(left, user_id))
}

fn refers_to(expr: &Expr, qualifier: &str, column: &str) -> bool {
    match expr {
        Expr::Identifier(ident) => ident.value.to_lowercase() == column,
        Expr::CompoundIdentifier(idents) if idents.len() >= 2 => {
            idents[idents.len() - 1].value.to_lowercase() == column
                && idents[idents.len() - 2].value.to_lowercase() == qualifier
        }
        Expr::Nested(inner) => refers_to(inner, qualifier, column),
        _ => false,
    }
}

fn is_literal(expr: &Expr, expected: &str) -> bool {
    match expr {
        Expr::Value(Value::Number(n, _)) => n == expected,
        Expr::Value(Value::SingleQuotedString(s)) => s == expected,
        Expr::Nested(inner) => is_literal(inner, expected),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SqlConfig;

    fn policy() -> SqlPolicy {
        SqlPolicy::from_config(&SqlConfig::default())
    }

    fn admin() -> Requester {
        Requester::admin()
    }

    fn tenant(id: &str) -> Requester {
        Requester::new(Some(id.to_string()), Some("tenant".to_string()))
    }

    #[test]
    fn test_accepts_simple_select() {
        let v = validate("SELECT id, price FROM rooms WHERE price < 3000000;", &policy(), &admin()).unwrap();
        assert_eq!(v.sql, "SELECT id, price FROM rooms WHERE price < 3000000");
        assert_eq!(v.tables, vec!["rooms".to_string()]);
    }

    #[test]
    fn test_accepts_cte_and_join() {
        let sql = "WITH cheap AS (SELECT r.id, r.building_id FROM rooms r WHERE r.price < 2000000) \
                   SELECT b.name, COUNT(*) AS total FROM cheap c JOIN buildings b ON b.id = c.building_id \
                   GROUP BY b.name ORDER BY total DESC";
        let v = validate(sql, &policy(), &admin()).unwrap();
        assert_eq!(v.tables, vec!["buildings".to_string(), "rooms".to_string()]);
    }

    #[test]
    fn test_rejects_empty_and_multiple_statements() {
        assert_eq!(validate(" ;; ", &policy(), &admin()), Err(SqlGuardError::Empty));
        assert!(matches!(
            validate("SELECT 1; SELECT 2", &policy(), &admin()),
            Err(SqlGuardError::MultipleStatements(2))
        ));
    }

    #[test]
    fn test_rejects_mutations() {
        assert!(matches!(
            validate("DELETE FROM rooms", &policy(), &admin()),
            Err(SqlGuardError::ForbiddenKeyword(k)) if k == "delete"
        ));
        assert!(matches!(
            validate("SELECT * INTO rooms_copy FROM rooms", &policy(), &admin()),
            Err(SqlGuardError::ForbiddenKeyword(k)) if k == "into"
        ));
        assert!(matches!(
            validate("SELECT id FROM rooms FOR UPDATE", &policy(), &admin()),
            Err(SqlGuardError::ForbiddenKeyword(k)) if k == "update"
        ));
    }

    #[test]
    fn test_keywords_inside_literals_are_fine() {
        let sql = "SELECT id FROM ratings WHERE comment ILIKE '%delete%'";
        assert!(validate(sql, &policy(), &admin()).is_ok());
    }

    #[test]
    fn test_rejects_non_query_statement() {
        assert!(matches!(
            validate("SHOW search_path", &policy(), &admin()),
            Err(SqlGuardError::NotAQuery(_)) | Err(SqlGuardError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_tables_and_schemas() {
        assert_eq!(
            validate("SELECT * FROM secrets", &policy(), &admin()),
            Err(SqlGuardError::TableNotAllowed("secrets".to_string()))
        );
        assert_eq!(
            validate("SELECT * FROM pg_catalog.pg_user", &policy(), &admin()),
            Err(SqlGuardError::SchemaNotAllowed("pg_catalog".to_string()))
        );
        assert!(validate("SELECT id FROM public.rooms", &policy(), &admin()).is_ok());
    }

    #[test]
    fn test_rejects_sensitive_columns() {
        assert_eq!(
            validate("SELECT u.password FROM users u", &policy(), &admin()),
            Err(SqlGuardError::SensitiveColumn("password".to_string()))
        );
    }

    #[test]
    fn test_restricted_table_columns() {
        assert!(validate("SELECT u.full_name FROM users u", &policy(), &admin()).is_ok());
        assert_eq!(
            validate("SELECT u.email FROM users u", &policy(), &admin()),
            Err(SqlGuardError::ColumnNotAllowed {
                table: "users".to_string(),
                column: "email".to_string()
            })
        );
        assert_eq!(
            validate("SELECT * FROM users", &policy(), &admin()),
            Err(SqlGuardError::RestrictedWildcard("users".to_string()))
        );
        assert!(matches!(
            validate("SELECT phone FROM users", &policy(), &admin()),
            Err(SqlGuardError::UnqualifiedColumn { .. })
        ));
    }

    #[test]
    fn test_rejects_system_functions() {
        assert_eq!(
            validate("SELECT pg_sleep(10)", &policy(), &admin()),
            Err(SqlGuardError::ForbiddenFunction("pg_sleep".to_string()))
        );
    }

    #[test]
    fn test_tenant_scope_enforced() {
        let ok = "SELECT b.id, b.status FROM bookings b WHERE b.tenant_id = 42 AND b.status = 'PENDING'";
        assert!(validate(ok, &policy(), &tenant("42")).is_ok());

        let unscoped = "SELECT b.id FROM bookings b WHERE b.status = 'PENDING'";
        assert_eq!(
            validate(unscoped, &policy(), &tenant("42")),
            Err(SqlGuardError::MissingScope {
                table: "bookings".to_string(),
                column: "tenant_id".to_string()
            })
        );

        let other_user = "SELECT b.id FROM bookings b WHERE b.tenant_id = 43";
        assert!(validate(other_user, &policy(), &tenant("42")).is_err());

        // OR does not pin the row set
        let or_bypass = "SELECT b.id FROM bookings b WHERE b.tenant_id = 42 OR 1 = 1";
        assert!(validate(or_bypass, &policy(), &tenant("42")).is_err());
    }

    #[test]
    fn test_scope_via_inner_join_condition() {
        let sql = "SELECT r.name FROM rooms r JOIN bookings b ON b.room_id = r.id AND b.tenant_id = '42'";
        assert!(validate(sql, &policy(), &tenant("42")).is_ok());
    }

    #[test]
    fn test_scope_applies_inside_subqueries() {
        let sql = "SELECT r.name FROM rooms r WHERE r.id IN (SELECT b.room_id FROM bookings b)";
        assert!(matches!(
            validate(sql, &policy(), &tenant("42")),
            Err(SqlGuardError::MissingScope { .. })
        ));
    }

    #[test]
    fn test_anonymous_user_cannot_read_scoped_tables() {
        let guest_tenant = Requester::new(None, Some("tenant".to_string()));
        assert_eq!(
            validate("SELECT b.id FROM bookings b", &policy(), &guest_tenant),
            Err(SqlGuardError::AnonymousScoped("bookings".to_string()))
        );
        // Public tables stay readable
        assert!(validate("SELECT id FROM rooms", &policy(), &guest_tenant).is_ok());
    }

    #[test]
    fn test_admin_bypasses_scope() {
        assert!(validate("SELECT COUNT(*) FROM bookings", &policy(), &admin()).is_ok());
    }

    #[test]
    fn test_cte_named_like_a_table_reads_the_real_table_inside_its_body() {
        assert_eq!(
            validate("WITH secrets AS (SELECT * FROM secrets) SELECT * FROM secrets", &policy(), &admin()),
            Err(SqlGuardError::TableNotAllowed("secrets".to_string()))
        );
        assert_eq!(
            validate("WITH users AS (SELECT * FROM users) SELECT users.email FROM users", &policy(), &admin()),
            Err(SqlGuardError::RestrictedWildcard("users".to_string()))
        );
        assert_eq!(
            validate(
                "WITH bookings AS (SELECT * FROM bookings) SELECT b.id, b.tenant_id FROM bookings b",
                &policy(),
                &tenant("42")
            ),
            Err(SqlGuardError::MissingScope {
                table: "bookings".to_string(),
                column: "tenant_id".to_string()
            })
        );
    }

    #[test]
    fn test_cte_scoped_inside_its_body_is_accepted() {
        let sql = "WITH mine AS (SELECT b.id, b.room_id FROM bookings b WHERE b.tenant_id = '42') \
                   SELECT r.name, m.id FROM mine m JOIN rooms r ON r.id = m.room_id";
        let v = validate(sql, &policy(), &tenant("42")).unwrap();
        assert_eq!(v.tables, vec!["bookings".to_string(), "rooms".to_string()]);
    }

    #[test]
    fn test_later_cte_may_use_earlier_one() {
        let sql = "WITH a AS (SELECT r.id FROM rooms r), b AS (SELECT a.id FROM a) SELECT b.id FROM b";
        assert_eq!(validate(sql, &policy(), &admin()).unwrap().tables, vec!["rooms".to_string()]);
    }

    #[test]
    fn test_derived_alias_does_not_hide_a_table() {
        let sql = "SELECT t.* FROM (SELECT 1 AS one) secrets, (SELECT * FROM secrets) t";
        assert_eq!(
            validate(sql, &policy(), &admin()),
            Err(SqlGuardError::TableNotAllowed("secrets".to_string()))
        );
    }

    #[test]
    fn test_derived_table_over_restricted_columns() {
        let ok = "SELECT d.full_name FROM (SELECT u.full_name FROM users u) d";
        assert!(validate(ok, &policy(), &admin()).is_ok());

        let leaked = "SELECT d.email FROM (SELECT u.email FROM users u) d";
        assert!(matches!(
            validate(leaked, &policy(), &admin()),
            Err(SqlGuardError::ColumnNotAllowed { .. })
        ));
    }

    #[test]
    fn test_nested_join_is_scope_checked() {
        let unscoped = "SELECT b.id, b.tenant_id FROM (bookings b JOIN rooms r ON r.id = b.room_id)";
        assert!(matches!(
            validate(unscoped, &policy(), &tenant("42")),
            Err(SqlGuardError::MissingScope { .. })
        ));

        let scoped = "SELECT b.id FROM (bookings b JOIN rooms r ON r.id = b.room_id) WHERE b.tenant_id = 42";
        assert!(validate(scoped, &policy(), &tenant("42")).is_ok());
    }

    #[test]
    fn test_every_union_branch_is_scoped() {
        let sql = "SELECT b.id FROM bookings b WHERE b.tenant_id = 42 \
                   UNION SELECT b.id FROM bookings b";
        assert!(matches!(
            validate(sql, &policy(), &tenant("42")),
            Err(SqlGuardError::MissingScope { .. })
        ));
    }

    #[test]
    fn test_left_join_on_clause_scopes_only_the_joined_table() {
        let joined = "SELECT r.id, b.id FROM rooms r LEFT JOIN bookings b \
                      ON b.room_id = r.id AND b.tenant_id = 42";
        assert!(validate(joined, &policy(), &tenant("42")).is_ok());

        let base = "SELECT b.id FROM bookings b LEFT JOIN rooms r \
                    ON r.id = b.room_id AND b.tenant_id = 42";
        assert!(matches!(
            validate(base, &policy(), &tenant("42")),
            Err(SqlGuardError::MissingScope { .. })
        ));
    }

    #[test]
    fn test_rejects_for_share() {
        assert_eq!(
            validate("SELECT r.id FROM rooms r FOR SHARE", &policy(), &admin()),
            Err(SqlGuardError::LockingClause)
        );
    }

    #[test]
    fn test_rejects_renamed_table_columns() {
        assert_eq!(
            validate("SELECT u.full_name FROM users AS u(id, full_name)", &policy(), &admin()),
            Err(SqlGuardError::RenamedColumns("users".to_string()))
        );
    }

    #[test]
    fn test_order_by_alias_is_not_a_column_read() {
        let sorted = "SELECT u.full_name AS email FROM users u ORDER BY email";
        assert!(validate(sorted, &policy(), &admin()).is_ok());

        let filtered = "SELECT u.full_name AS email FROM users u WHERE email = 'a@b.vn'";
        assert!(matches!(
            validate(filtered, &policy(), &admin()),
            Err(SqlGuardError::UnqualifiedColumn { .. })
        ));
    }

    #[test]
    fn test_correlated_references_resolve_outwards() {
        let ok = "SELECT r.id FROM rooms r WHERE EXISTS \
                  (SELECT 1 FROM users u WHERE u.id = r.landlord_id)";
        assert!(validate(ok, &policy(), &admin()).is_ok());

        let outer_leak = "SELECT u.full_name FROM users u WHERE EXISTS \
                          (SELECT 1 FROM rooms r WHERE r.landlord_id = u.id AND email = 'x')";
        assert!(matches!(
            validate(outer_leak, &policy(), &admin()),
            Err(SqlGuardError::UnqualifiedColumn { .. })
        ));
    }
}
