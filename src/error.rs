//! Error types for CensusGate.

use std::time::Duration;

use serde::Serialize;

/// Top-level error type for the gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Execution error: {0}")]
    Execute(#[from] ExecuteError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Translation error: {0}")]
    Translate(#[from] TranslateError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Circuit breaker error: {0}")]
    Breaker(#[from] BreakerError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No connection became available within {waited:?}")]
    Timeout { waited: Duration },

    #[error("Pool is shut down")]
    Closed,

    #[error("Failed to open analytical database: {0}")]
    Open(String),

    #[error("Database engine error: {0}")]
    Engine(String),
}

impl From<duckdb::Error> for PoolError {
    fn from(e: duckdb::Error) -> Self {
        Self::Engine(e.to_string())
    }
}

/// Query execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Query exceeded its {budget:?} execution budget")]
    Timeout { budget: Duration },

    #[error("Query was cancelled by the caller")]
    Cancelled,

    #[error("Database rejected the query: {0}")]
    Engine(String),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

/// LLM provider errors (transport level).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider request failed: {0}")]
    RequestFailed(String),

    #[error("Provider returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Provider request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Invalid response from provider: {0}")]
    InvalidResponse(String),

    #[error("Authentication failed for provider")]
    AuthFailed,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Translator errors (classified at the pipeline boundary).
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("Translator output could not be parsed into a valid analysis: {reason}")]
    LowConfidence { reason: String },

    #[error("Translator is unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Translation timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

/// Session lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Unknown session: {0}")]
    NotFound(String),

    #[error("Session expired: {0}")]
    Expired(String),

    #[error("Missing session id")]
    Missing,
}

/// Rate limiter errors.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded for {key}; resets in {reset_in:?}")]
    Exceeded { key: String, reset_in: Duration },
}

/// Circuit breaker errors.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("Circuit for {dependency} is open; next attempt in {retry_in:?}")]
    Open {
        dependency: String,
        retry_in: Duration,
    },
}

/// Audit sink errors.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Failed to append audit record: {0}")]
    Append(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Protocol server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

/// Stable machine classification surfaced on the wire.
///
/// Raw provider/database messages never leave the process; every fault is
/// mapped to one of these kinds plus a short human phrase.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    TranslationLowConfidence,
    TranslationUnavailable,
    SqlRejected,
    QueryTimeout,
    PoolTimeout,
    ExecutionError,
    RateLimited,
    SessionInvalid,
    ServiceUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TranslationLowConfidence => "TRANSLATION_LOW_CONFIDENCE",
            Self::TranslationUnavailable => "TRANSLATION_UNAVAILABLE",
            Self::SqlRejected => "SQL_REJECTED",
            Self::QueryTimeout => "QUERY_TIMEOUT",
            Self::PoolTimeout => "POOL_TIMEOUT",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::SessionInvalid => "SESSION_INVALID",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::TranslationUnavailable
                | Self::QueryTimeout
                | Self::PoolTimeout
                | Self::RateLimited
                | Self::ServiceUnavailable
        )
    }
}

/// Wire-facing error envelope: `{ kind, message, details?, suggestedRefinements? }`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_refinements: Option<Vec<String>>,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.retryable(),
            details: None,
            suggested_refinements: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_refinements(mut self, refinements: Vec<String>) -> Self {
        if !refinements.is_empty() {
            self.suggested_refinements = Some(refinements);
        }
        self
    }
}

impl Error {
    /// Classify this error into the stable wire taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Translate(TranslateError::LowConfidence { .. }) => {
                ErrorKind::TranslationLowConfidence
            }
            Self::Translate(_) => ErrorKind::TranslationUnavailable,
            Self::Llm(_) => ErrorKind::TranslationUnavailable,
            Self::Pool(PoolError::Timeout { .. }) => ErrorKind::PoolTimeout,
            Self::Pool(_) => ErrorKind::ServiceUnavailable,
            Self::Execute(ExecuteError::Timeout { .. }) => ErrorKind::QueryTimeout,
            Self::Execute(ExecuteError::Cancelled) => ErrorKind::QueryTimeout,
            Self::Execute(ExecuteError::Pool(PoolError::Timeout { .. })) => ErrorKind::PoolTimeout,
            Self::Execute(_) => ErrorKind::ExecutionError,
            Self::Session(_) => ErrorKind::SessionInvalid,
            Self::RateLimit(_) => ErrorKind::RateLimited,
            Self::Breaker(_) => ErrorKind::ServiceUnavailable,
            Self::Config(_) | Self::Audit(_) | Self::Server(_) => ErrorKind::Internal,
        }
    }

    /// Build the wire envelope for this error.
    ///
    /// Translator and database internals are summarized; validator rejection
    /// lists are carried verbatim elsewhere (they are verdicts, not errors).
    pub fn to_envelope(&self) -> ErrorEnvelope {
        let kind = self.kind();
        let message = match (kind, self) {
            (ErrorKind::TranslationLowConfidence, _) => {
                "The question could not be translated into a query. Try rephrasing with a \
                 specific geography and measure."
                    .to_string()
            }
            (ErrorKind::TranslationUnavailable, _) => {
                "The translation service is temporarily unavailable. Please retry shortly."
                    .to_string()
            }
            (ErrorKind::PoolTimeout, _) => {
                "The database is at capacity; no connection became available in time.".to_string()
            }
            (ErrorKind::QueryTimeout, _) => {
                "The query exceeded its execution budget and was cancelled.".to_string()
            }
            (_, err) => err.to_string(),
        };
        ErrorEnvelope::new(kind, message)
    }
}

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;
