//! Defensive SQL validation: prove a candidate statement is a safe, bounded
//! read before it reaches the engine, and shape it into canonical form.
//!
//! Checks run in a fixed order (comments, statement count, statement kind,
//! allowlists, pattern blocks, row limit, cost). The first failing category
//! short-circuits the rest, except that table and column allowlist
//! violations are enumerated together so a caller can fix all of them at
//! once.
//!
//! Comment detection is token-stream based: `--` or `/*` inside a string
//! literal is literal content and is accepted; an actual comment token
//! anywhere rejects the statement.

mod walk;

use std::collections::BTreeSet;

use aho_corasick::{AhoCorasick, Anchored, Input, MatchKind, StartKind};
use serde::Serialize;
use sqlparser::ast::{Expr, Query, SetExpr, Statement, Value as AstValue};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

use crate::catalog::SchemaCatalog;
use crate::config::ValidatorConfig;
use walk::StatementFacts;

/// Machine tag for one rejection reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    CommentPresent,
    InvalidSql,
    MultiStatement,
    StatementKindForbidden,
    TableNotAllowed,
    ColumnNotAllowed,
    SystemSchemaBlocked,
    ForbiddenFunction,
    QueryTooExpensive,
}

impl RejectCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CommentPresent => "COMMENT_PRESENT",
            Self::InvalidSql => "INVALID_SQL",
            Self::MultiStatement => "MULTI_STATEMENT",
            Self::StatementKindForbidden => "STATEMENT_KIND_FORBIDDEN",
            Self::TableNotAllowed => "TABLE_NOT_ALLOWED",
            Self::ColumnNotAllowed => "COLUMN_NOT_ALLOWED",
            Self::SystemSchemaBlocked => "SYSTEM_SCHEMA_BLOCKED",
            Self::ForbiddenFunction => "FORBIDDEN_FUNCTION",
            Self::QueryTooExpensive => "QUERY_TOO_EXPENSIVE",
        }
    }

    /// Human phrase paired with the machine tag on the wire.
    pub fn phrase(self) -> &'static str {
        match self {
            Self::CommentPresent => "SQL comments are not allowed",
            Self::InvalidSql => "the SQL could not be parsed",
            Self::MultiStatement => "only a single statement is allowed",
            Self::StatementKindForbidden => "this tool only reads data",
            Self::TableNotAllowed => "table is not in the permitted catalog",
            Self::ColumnNotAllowed => "column is not in the permitted catalog",
            Self::SystemSchemaBlocked => "system schemas cannot be queried",
            Self::ForbiddenFunction => "function is not permitted",
            Self::QueryTooExpensive => "query exceeds the cost ceiling",
        }
    }
}

/// One rejection: machine tag plus human phrase.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Rejection {
    pub code: RejectCode,
    pub message: String,
}

impl Rejection {
    fn new(code: RejectCode) -> Self {
        Self {
            code,
            message: code.phrase().to_string(),
        }
    }

    fn with_subject(code: RejectCode, subject: &str) -> Self {
        Self {
            code,
            message: format!("{}: {subject}", code.phrase()),
        }
    }
}

/// Validation verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accept,
    Reject,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
        }
    }
}

/// Output of validation.
///
/// With `verdict == Accept` the sanitized SQL is guaranteed to be a single
/// SELECT against allowlisted tables with `LIMIT <= max_limit` present.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedSql {
    pub original: String,
    pub sanitized: String,
    pub verdict: Verdict,
    pub reasons: Vec<Rejection>,
    /// Base tables the statement touches, deduplicated, lowercased.
    pub tables: Vec<String>,
    pub estimated_rows: u64,
    pub has_aggregation: bool,
}

impl ValidatedSql {
    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accept
    }

    pub fn reason_codes(&self) -> Vec<&'static str> {
        self.reasons.iter().map(|r| r.code.as_str()).collect()
    }

    fn rejected(original: &str, reasons: Vec<Rejection>) -> Self {
        Self {
            original: original.to_string(),
            sanitized: String::new(),
            verdict: Verdict::Reject,
            reasons,
            tables: Vec::new(),
            estimated_rows: 0,
            has_aggregation: false,
        }
    }
}

/// Function names and identifier prefixes that must never execute.
const BANNED_NAMES: &[&str] = &[
    "read_csv",
    "read_csv_auto",
    "read_parquet",
    "read_json",
    "read_json_auto",
    "read_text",
    "read_blob",
    "read_ndjson",
    "sniff_csv",
    "glob",
    "getenv",
    "current_setting",
    "set_config",
    "load",
    "install",
    "attach",
    "checkpoint",
    "force_checkpoint",
    "export_database",
    "import_database",
    "pg_",
    "duckdb_",
    "sqlite_",
    "information_schema",
];

/// Aggregate functions recognized for the `has_aggregation` flag.
const AGGREGATE_NAMES: &[&str] = &[
    "sum", "avg", "count", "min", "max", "median", "stddev", "var_pop", "var_samp", "stddev_pop",
    "stddev_samp",
];

pub struct SqlValidator {
    catalog: std::sync::Arc<SchemaCatalog>,
    config: ValidatorConfig,
    banned: AhoCorasick,
}

impl SqlValidator {
    pub fn new(catalog: std::sync::Arc<SchemaCatalog>, config: ValidatorConfig) -> Self {
        let banned = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostLongest)
            .start_kind(StartKind::Anchored)
            .ascii_case_insensitive(true)
            .build(BANNED_NAMES)
            .expect("banned-pattern automaton builds");
        Self {
            catalog,
            config,
            banned,
        }
    }

    /// Validate and canonicalize one candidate statement.
    ///
    /// Deterministic: identical input yields an identical verdict and reason
    /// list.
    pub fn validate(&self, sql: &str) -> ValidatedSql {
        // 1. Comment scrub, on the token stream.
        if let Some(rejection) = self.scan_comments(sql) {
            return ValidatedSql::rejected(sql, vec![rejection]);
        }

        // 2. Parse; a single top-level statement, trailing semicolon allowed.
        let dialect = DuckDbDialect {};
        let mut statements = match Parser::parse_sql(&dialect, sql) {
            Ok(statements) => statements,
            Err(e) => {
                return ValidatedSql::rejected(
                    sql,
                    vec![Rejection {
                        code: RejectCode::InvalidSql,
                        message: format!("{}: {e}", RejectCode::InvalidSql.phrase()),
                    }],
                );
            }
        };
        if statements.is_empty() {
            return ValidatedSql::rejected(sql, vec![Rejection::new(RejectCode::InvalidSql)]);
        }
        if statements.len() > 1 {
            return ValidatedSql::rejected(sql, vec![Rejection::new(RejectCode::MultiStatement)]);
        }
        let mut statement = statements.remove(0);

        // 3. Statement kind: the root must be a plain query.
        if let Some(rejection) = kind_check(&statement) {
            return ValidatedSql::rejected(sql, vec![rejection]);
        }

        // 4./5. Table and column allowlists, enumerated together.
        let facts = walk::collect(&statement);
        let mut violations = self.allowlist_violations(&facts);

        // 6. Pattern blocks: table functions, forbidden functions, system
        // schemas in any position.
        violations.extend(self.pattern_violations(&facts));
        if !violations.is_empty() {
            return ValidatedSql::rejected(sql, violations);
        }

        // 7. Row limit: inject or clamp at the top level, preserving OFFSET.
        let effective_limit = match &mut statement {
            Statement::Query(query) => enforce_limit(query, self.config.max_limit),
            _ => self.config.max_limit,
        };

        // Rewrite wildcards to explicit column lists.
        if let Statement::Query(query) = &mut statement {
            walk::expand_wildcards(query, &self.catalog);
        }

        // 8. Coarse cost proxy: base-table scans x row limit.
        let scans = facts.relation_count() as u64;
        let estimated_cost = scans.saturating_mul(effective_limit.max(1));
        if estimated_cost > self.config.cost_ceiling {
            return ValidatedSql::rejected(
                sql,
                vec![Rejection::with_subject(
                    RejectCode::QueryTooExpensive,
                    &format!("estimated cost {estimated_cost} > {}", self.config.cost_ceiling),
                )],
            );
        }

        let tables: Vec<String> = facts.base_tables().into_iter().collect();
        ValidatedSql {
            original: sql.to_string(),
            sanitized: statement.to_string(),
            verdict: Verdict::Accept,
            reasons: Vec::new(),
            tables,
            estimated_rows: effective_limit,
            has_aggregation: facts.has_group_by
                || facts
                    .functions
                    .iter()
                    .any(|f| AGGREGATE_NAMES.contains(&f.as_str())),
        }
    }

    fn scan_comments(&self, sql: &str) -> Option<Rejection> {
        let dialect = DuckDbDialect {};
        let tokens = Tokenizer::new(&dialect, sql).tokenize().ok()?;
        let has_comment = tokens.iter().any(|t| {
            matches!(
                t,
                Token::Whitespace(
                    Whitespace::SingleLineComment { .. } | Whitespace::MultiLineComment(_)
                )
            )
        });
        has_comment.then(|| Rejection::new(RejectCode::CommentPresent))
    }

    fn allowlist_violations(&self, facts: &StatementFacts) -> Vec<Rejection> {
        let mut violations = Vec::new();

        // Tables: every relation must be a CTE in scope or in the catalog.
        let mut bad_tables = BTreeSet::new();
        let mut system_tables = BTreeSet::new();
        for relation in &facts.relations {
            if facts.cte_names.contains(&relation.table)
                || facts.table_functions.contains(&relation.table)
            {
                continue;
            }
            if let Some(schema) = &relation.schema {
                if self.is_banned(schema) {
                    system_tables.insert(relation.render());
                    continue;
                }
            }
            if self.is_banned(&relation.table) {
                system_tables.insert(relation.render());
            } else if !self.catalog.is_table_allowed(&relation.table) {
                bad_tables.insert(relation.render());
            }
        }
        for table in &system_tables {
            violations.push(Rejection::with_subject(
                RejectCode::SystemSchemaBlocked,
                table,
            ));
        }
        for table in &bad_tables {
            violations.push(Rejection::with_subject(RejectCode::TableNotAllowed, table));
        }

        // Columns: resolve against the referenced tables plus local aliases.
        let referenced: Vec<String> = facts
            .relations
            .iter()
            .filter(|r| !facts.cte_names.contains(&r.table))
            .map(|r| r.table.clone())
            .collect();
        let mut bad_columns = BTreeSet::new();
        for column_ref in &facts.column_refs {
            if self.column_resolves(facts, &referenced, column_ref) {
                continue;
            }
            bad_columns.insert(column_ref.render());
        }
        for column in &bad_columns {
            violations.push(Rejection::with_subject(RejectCode::ColumnNotAllowed, column));
        }

        violations
    }

    fn column_resolves(
        &self,
        facts: &StatementFacts,
        referenced: &[String],
        column_ref: &walk::ColumnRef,
    ) -> bool {
        let column = column_ref.column.as_str();

        if let Some(qualifier) = &column_ref.qualifier {
            if let Some(table) = facts.alias_map.get(qualifier) {
                if facts.cte_names.contains(table) {
                    return self.catalog.is_column_known(column)
                        || facts.projection_aliases.contains(column);
                }
                return self
                    .catalog
                    .table(table)
                    .is_some_and(|t| t.column(column).is_some());
            }
            if facts.derived_aliases.contains(qualifier) || facts.cte_names.contains(qualifier) {
                // Derived scopes project catalog columns or declared aliases.
                return self.catalog.is_column_known(column)
                    || facts.projection_aliases.contains(column);
            }
            return false;
        }

        facts.projection_aliases.contains(column)
            || self.catalog.column_in_tables(column, referenced)
            || (referenced.is_empty() && self.catalog.is_column_known(column))
            || (!facts.cte_names.is_empty() && self.catalog.is_column_known(column))
    }

    fn pattern_violations(&self, facts: &StatementFacts) -> Vec<Rejection> {
        let mut violations = Vec::new();
        let mut seen = BTreeSet::new();

        for function in facts.functions.iter().chain(&facts.table_functions) {
            if self.is_banned(function) && seen.insert(function.clone()) {
                violations.push(Rejection::with_subject(
                    RejectCode::ForbiddenFunction,
                    function,
                ));
            }
        }
        for unsupported in &facts.unsupported_factors {
            violations.push(Rejection::with_subject(
                RejectCode::StatementKindForbidden,
                unsupported,
            ));
        }
        violations
    }

    fn is_banned(&self, name: &str) -> bool {
        let input = Input::new(name).anchored(Anchored::Yes);
        self.banned.find(input).is_some()
    }
}

impl std::fmt::Debug for SqlValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlValidator")
            .field("max_limit", &self.config.max_limit)
            .field("cost_ceiling", &self.config.cost_ceiling)
            .finish()
    }
}

/// The root must be a plain query: no data-changing or DDL statements, no
/// SELECT INTO, no row locks.
fn kind_check(statement: &Statement) -> Option<Rejection> {
    let query = match statement {
        Statement::Query(query) => query,
        _ => return Some(Rejection::new(RejectCode::StatementKindForbidden)),
    };
    if !query.locks.is_empty() {
        return Some(Rejection::new(RejectCode::StatementKindForbidden));
    }
    if body_is_readonly(&query.body) {
        None
    } else {
        Some(Rejection::new(RejectCode::StatementKindForbidden))
    }
}

fn body_is_readonly(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => body_is_readonly(&query.body),
        SetExpr::SetOperation { left, right, .. } => {
            body_is_readonly(left) && body_is_readonly(right)
        }
        SetExpr::Values(_) | SetExpr::Insert(_) | SetExpr::Update(_) | SetExpr::Table(_) => false,
    }
}

/// Inject `LIMIT max` when absent, clamp when above, keep smaller literals
/// (including zero). Returns the effective limit.
fn enforce_limit(query: &mut Query, max: u64) -> u64 {
    let effective = match &query.limit {
        Some(Expr::Value(AstValue::Number(raw, _))) => match raw.parse::<u64>() {
            Ok(value) if value <= max => return value,
            _ => max,
        },
        Some(_) | None => max,
    };
    query.limit = Some(Expr::Value(AstValue::Number(effective.to_string(), false)));
    effective
}

#[cfg(test)]
mod tests;
