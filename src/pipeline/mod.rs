//! The query execution pipeline: translate -> validate -> execute, with
//! per-stage timing, uniform response shaping, and exactly one audit record
//! per run.
//!
//! Stages are strictly sequential within a run; concurrent runs share only
//! the pool and the breaker. If the caller abandons a run mid-flight, the
//! armed audit guard still records the attempt with outcome `CANCELLED`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::audit::{AuditLog, AuditOutcome, AuditRecord};
use crate::db::{FreshnessTracker, QueryExecutor};
use crate::error::{Error, ErrorEnvelope, ErrorKind};
use crate::llm::{Analysis, AnalysisSummary, Translator};
use crate::observability::Observability;
use crate::session::SessionManager;
use crate::validator::{RejectCode, Rejection, SqlValidator, ValidatedSql};

/// Caller identity and conversational context for one run.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub session_summary: Option<AnalysisSummary>,
}

/// Result metadata attached to every successful run.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub row_count: u64,
    pub columns: Vec<String>,
    pub tables: Vec<String>,
    pub execution_time_ms: u64,
    pub freshness: BTreeMap<String, DateTime<Utc>>,
}

/// Uniform response shape for every pipeline outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub success: bool,
    pub correlation_id: String,
    pub rows: Vec<Map<String, Value>>,
    pub metadata: ResultMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// Validator rejections, surfaced verbatim so the caller can refine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejections: Option<Vec<Rejection>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
}

impl PipelineResult {
    fn failure(correlation_id: String, envelope: ErrorEnvelope) -> Self {
        Self {
            success: false,
            correlation_id,
            rows: Vec::new(),
            metadata: ResultMetadata::default(),
            analysis: None,
            explanation: None,
            rejections: None,
            error: Some(envelope),
        }
    }
}

pub struct QueryPipeline {
    translator: Arc<Translator>,
    validator: Arc<SqlValidator>,
    executor: QueryExecutor,
    freshness: Arc<FreshnessTracker>,
    audit: Arc<AuditLog>,
    observability: Arc<Observability>,
    sessions: Arc<SessionManager>,
}

impl QueryPipeline {
    pub fn new(
        translator: Arc<Translator>,
        validator: Arc<SqlValidator>,
        executor: QueryExecutor,
        freshness: Arc<FreshnessTracker>,
        audit: Arc<AuditLog>,
        observability: Arc<Observability>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            translator,
            validator,
            executor,
            freshness,
            audit,
            observability,
            sessions,
        }
    }

    pub fn validator(&self) -> &SqlValidator {
        &self.validator
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// Full pipeline: natural-language question in, shaped result out.
    pub async fn run_question(&self, question: &str, ctx: &RunContext) -> PipelineResult {
        let correlation_id = crate::observability::correlation_id();
        tracing::debug!(%correlation_id, "pipeline run started (natural language)");
        let started = Instant::now();

        let mut guard = AuditGuard::arm(
            Arc::clone(&self.audit),
            &correlation_id,
            ctx.user_id.clone(),
            Some(question.to_string()),
        );

        // Stage A: translate.
        let translate_started = Instant::now();
        let analysis = match self
            .translator
            .translate(question, ctx.session_summary.as_ref())
            .await
        {
            Ok(analysis) => {
                self.observability.record_operation(
                    "translate",
                    translate_started.elapsed(),
                    true,
                    None,
                );
                analysis
            }
            Err(err) => {
                self.observability.record_operation(
                    "translate",
                    translate_started.elapsed(),
                    false,
                    Some(err.kind().as_str()),
                );
                return self
                    .finish_failure(guard, correlation_id, started, err)
                    .await;
            }
        };
        guard.set_sql(&analysis.sql);

        self.run_validated(analysis.sql.clone(), Some(analysis), ctx, correlation_id, started, guard)
            .await
    }

    /// Pipeline starting at validation: caller supplies candidate SQL.
    pub async fn run_sql(&self, sql: &str, ctx: &RunContext) -> PipelineResult {
        let correlation_id = crate::observability::correlation_id();
        tracing::debug!(%correlation_id, "pipeline run started (sql)");
        let started = Instant::now();

        let mut guard = AuditGuard::arm(
            Arc::clone(&self.audit),
            &correlation_id,
            ctx.user_id.clone(),
            None,
        );
        guard.set_sql(sql);

        self.run_validated(sql.to_string(), None, ctx, correlation_id, started, guard)
            .await
    }

    async fn run_validated(
        &self,
        sql: String,
        analysis: Option<Analysis>,
        ctx: &RunContext,
        correlation_id: String,
        started: Instant,
        mut guard: AuditGuard,
    ) -> PipelineResult {
        // Stage B: validate. No execution is attempted on reject.
        let validate_started = Instant::now();
        let validated = self.validator.validate(&sql);
        self.observability.record_operation(
            "validate",
            validate_started.elapsed(),
            validated.is_accepted(),
            (!validated.is_accepted()).then_some("SQL_REJECTED"),
        );

        if !validated.is_accepted() {
            guard.set_verdict("reject");
            guard.set_rejections(&validated);
            let record = guard.complete(AuditOutcome::SqlRejected, started, None);
            self.append_audit(record).await;

            let refinements = suggestions_for(&validated);
            let envelope = ErrorEnvelope::new(
                ErrorKind::SqlRejected,
                "The SQL was rejected by the read-only policy.",
            )
            .with_details(serde_json::json!({ "rejections": validated.reasons }))
            .with_refinements(refinements);

            let mut result = PipelineResult::failure(correlation_id, envelope);
            result.rejections = Some(validated.reasons.clone());
            return result;
        }
        guard.set_verdict("accept");
        guard.set_sql(&validated.sanitized);

        // Stage C: execute on a pooled handle, bounded by the query budget.
        let execute_started = Instant::now();
        let outcome = self.executor.execute(&validated.sanitized).await;
        let pool_health = self.executor.pool().health();
        self.observability.set_pool_gauges(
            pool_health.total,
            pool_health.idle,
            pool_health.in_use,
            pool_health.waiting,
        );

        match outcome {
            Ok(rows) => {
                self.observability.record_operation(
                    "execute",
                    execute_started.elapsed(),
                    true,
                    None,
                );
                let record =
                    guard.complete(AuditOutcome::Success, started, Some(rows.row_count));
                self.append_audit(record).await;

                if let Some(session_id) = &ctx.session_id {
                    self.sessions
                        .record_query(session_id, analysis.as_ref().map(Analysis::summary));
                }

                let freshness = self.freshness.stamp_for(&validated.tables);
                let explanation = explain(&validated, rows.row_count);
                PipelineResult {
                    success: true,
                    correlation_id,
                    metadata: ResultMetadata {
                        row_count: rows.row_count,
                        columns: rows.columns,
                        tables: validated.tables.clone(),
                        execution_time_ms: rows.execution_time.as_millis() as u64,
                        freshness,
                    },
                    rows: rows.rows,
                    analysis,
                    explanation: Some(explanation),
                    rejections: None,
                    error: None,
                }
            }
            Err(err) => {
                let err = Error::from(err);
                self.observability.record_operation(
                    "execute",
                    execute_started.elapsed(),
                    false,
                    Some(err.kind().as_str()),
                );
                self.finish_failure(guard, correlation_id, started, err).await
            }
        }
    }

    async fn finish_failure(
        &self,
        guard: AuditGuard,
        correlation_id: String,
        started: Instant,
        err: Error,
    ) -> PipelineResult {
        let kind = err.kind();
        let record = guard.complete(AuditOutcome::Error(kind), started, None);
        self.append_audit(record).await;

        let mut envelope = err.to_envelope();
        if kind == ErrorKind::TranslationLowConfidence {
            envelope = envelope.with_refinements(vec![
                "Name a specific geography, like a state or county.".to_string(),
                "Name a measure such as population or median household income.".to_string(),
                "Example: \"Show me all counties in Texas\".".to_string(),
            ]);
        }
        PipelineResult::failure(correlation_id, envelope)
    }

    async fn append_audit(&self, record: AuditRecord) {
        if let Err(e) = self.audit.append(&record).await {
            tracing::error!("failed to append audit record: {e}");
        }
    }
}

impl std::fmt::Debug for QueryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPipeline").finish()
    }
}

/// Map rejection codes to user-facing refinement suggestions.
fn suggestions_for(validated: &ValidatedSql) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut suggestions = Vec::new();
    for rejection in &validated.reasons {
        let suggestion = match rejection.code {
            RejectCode::StatementKindForbidden => {
                "This tool only reads data; send a single SELECT statement."
            }
            RejectCode::TableNotAllowed => {
                "Ask about states, counties, or block groups; those are the available datasets."
            }
            RejectCode::ColumnNotAllowed => {
                "Stick to demographic measures like population, income, or Medicare eligibility."
            }
            RejectCode::CommentPresent => "Remove SQL comments from the statement.",
            RejectCode::MultiStatement => "Send exactly one statement.",
            RejectCode::SystemSchemaBlocked => "Query the demographic tables, not system schemas.",
            RejectCode::ForbiddenFunction => {
                "File, environment, and system functions are not available."
            }
            RejectCode::QueryTooExpensive => "Narrow the query with filters or fewer joins.",
            RejectCode::InvalidSql => "Check the SQL syntax.",
        };
        if seen.insert(rejection.code.as_str()) {
            suggestions.push(suggestion.to_string());
        }
    }
    suggestions
}

fn explain(validated: &ValidatedSql, row_count: u64) -> String {
    let tables = if validated.tables.is_empty() {
        "the catalog".to_string()
    } else {
        validated.tables.join(", ")
    };
    if validated.has_aggregation {
        format!("Computed an aggregate over {tables} ({row_count} row(s)).")
    } else {
        format!("Returned {row_count} row(s) from {tables}.")
    }
}

/// Armed audit record that survives caller cancellation.
///
/// If the run future is dropped before a terminal outcome, the guard appends
/// the record with outcome `CANCELLED` from a detached task.
struct AuditGuard {
    audit: Arc<AuditLog>,
    record: Option<AuditRecord>,
}

impl AuditGuard {
    fn arm(
        audit: Arc<AuditLog>,
        correlation_id: &str,
        user_id: Option<String>,
        question: Option<String>,
    ) -> Self {
        Self {
            audit,
            record: Some(AuditRecord {
                correlation_id: correlation_id.to_string(),
                timestamp: Utc::now(),
                user_id,
                question,
                sql: String::new(),
                verdict: "none",
                rejections: None,
                outcome: AuditOutcome::Cancelled,
                rows: None,
                duration_ms: 0,
                error_class: None,
            }),
        }
    }

    fn set_sql(&mut self, sql: &str) {
        if let Some(record) = &mut self.record {
            record.sql = sql.to_string();
        }
    }

    fn set_verdict(&mut self, verdict: &'static str) {
        if let Some(record) = &mut self.record {
            record.verdict = verdict;
        }
    }

    fn set_rejections(&mut self, validated: &ValidatedSql) {
        if let Some(record) = &mut self.record {
            record.rejections = Some(
                validated
                    .reason_codes()
                    .into_iter()
                    .map(String::from)
                    .collect(),
            );
        }
    }

    /// Disarm and return the finished record.
    fn complete(
        mut self,
        outcome: AuditOutcome,
        started: Instant,
        rows: Option<u64>,
    ) -> AuditRecord {
        let mut record = self.record.take().expect("audit guard completed twice");
        record.outcome = outcome;
        record.rows = rows;
        record.duration_ms = started.elapsed().as_millis() as u64;
        record.error_class = match outcome {
            AuditOutcome::Error(kind) => Some(kind.as_str()),
            _ => None,
        };
        record
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            let audit = Arc::clone(&self.audit);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = audit.append(&record).await {
                        tracing::error!("failed to append cancelled audit record: {e}");
                    }
                });
            }
        }
    }
}
