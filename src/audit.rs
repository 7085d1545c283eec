//! Append-only audit log of every SQL execution attempt.
//!
//! One JSON object per line, fsynced per record so the trail survives a
//! worker crash up to the last append. Rotation/retention is external.

use std::fs::{File, OpenOptions};
use std::io::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::AuditConfig;
use crate::error::{AuditError, ErrorKind};

/// Terminal outcome of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    SqlRejected,
    Cancelled,
    Error(ErrorKind),
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::SqlRejected => "SQL_REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::Error(kind) => kind.as_str(),
        }
    }
}

impl Serialize for AuditOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One execution attempt, as written to the sink.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    pub sql: String,
    pub verdict: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejections: Option<Vec<String>>,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<&'static str>,
}

/// Relaxed shape for readers (tests, tooling).
#[derive(Debug, Clone, Deserialize)]
pub struct AuditRecordView {
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub question: Option<String>,
    pub sql: String,
    pub verdict: String,
    pub rejections: Option<Vec<String>>,
    pub outcome: String,
    pub rows: Option<u64>,
    pub duration_ms: u64,
    pub error_class: Option<String>,
}

/// Line-oriented audit sink.
pub struct AuditLog {
    redact_questions: bool,
    file: Mutex<File>,
}

impl AuditLog {
    /// Open (or create) the sink in append mode.
    pub fn open(config: &AuditConfig) -> Result<Self, AuditError> {
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .map_err(|e| AuditError::Append(format!("{}: {e}", config.path.display())))?;
        Ok(Self {
            redact_questions: config.redact_questions,
            file: Mutex::new(file),
        })
    }

    /// Append one record and fsync.
    pub async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = if self.redact_questions {
            let mut redacted = record.clone();
            redacted.question = None;
            serde_json::to_string(&redacted)?
        } else {
            serde_json::to_string(record)?
        };
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Flush any buffered state; called on graceful shutdown.
    pub async fn flush(&self) -> Result<(), AuditError> {
        let file = self.file.lock().await;
        file.sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("redact_questions", &self.redact_questions)
            .finish()
    }
}
