//! The intent-to-SQL translator: composes a schema-grounded prompt, calls the
//! provider through the circuit breaker, and parses the reply into a typed
//! [`Analysis`]. Parsing is strict: anything that does not resolve against
//! the catalog surfaces as a low-confidence failure, inviting the user to
//! rephrase.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use regex::Regex;

use crate::breaker::{CircuitBreaker, GuardedError};
use crate::catalog::{GeoLevel, SchemaCatalog};
use crate::config::LlmConfig;
use crate::error::{Error, LlmError, Result, TranslateError};
use crate::llm::{Analysis, AnalysisSummary, Intent, LlmClient, MAX_LIMIT};

/// Decides whether a question refers back to the previous analysis.
///
/// Detection is heuristic; the trait keeps it pluggable so both branches can
/// be exercised in tests.
pub trait FollowUpDetector: Send + Sync {
    fn is_follow_up(&self, question: &str) -> bool;
}

/// Default detector: pronouns and delta phrases.
pub struct RegexFollowUpDetector {
    pattern: Regex,
}

impl Default for RegexFollowUpDetector {
    fn default() -> Self {
        let pattern = Regex::new(
            r"(?i)\b(they|them|those|these|it|that one)\b|now (filter|show|narrow|limit)|only (the|those)|what about|how about|\binstead\b|of those|same but|and also|drill (down|into)",
        )
        .expect("follow-up pattern compiles");
        Self { pattern }
    }
}

impl FollowUpDetector for RegexFollowUpDetector {
    fn is_follow_up(&self, question: &str) -> bool {
        self.pattern.is_match(question)
    }
}

pub struct Translator {
    client: Arc<dyn LlmClient>,
    breaker: Arc<CircuitBreaker>,
    catalog: Arc<SchemaCatalog>,
    detector: Box<dyn FollowUpDetector>,
    timeout: Duration,
    max_retries: u32,
}

impl Translator {
    pub fn new(
        client: Arc<dyn LlmClient>,
        breaker: Arc<CircuitBreaker>,
        catalog: Arc<SchemaCatalog>,
        config: &LlmConfig,
    ) -> Self {
        Self {
            client,
            breaker,
            catalog,
            detector: Box::new(RegexFollowUpDetector::default()),
            timeout: config.timeout,
            max_retries: config.max_retries,
        }
    }

    pub fn with_detector(mut self, detector: Box<dyn FollowUpDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Translate a natural-language question into a typed analysis.
    pub async fn translate(
        &self,
        question: &str,
        session_context: Option<&AnalysisSummary>,
    ) -> Result<Analysis> {
        let system = self.system_prompt();
        let user = self.user_prompt(question, session_context);

        let mut last_error: Option<LlmError> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }

            let outcome = self
                .breaker
                .execute(|| async {
                    match tokio::time::timeout(self.timeout, self.client.complete(&system, &user))
                        .await
                    {
                        Ok(inner) => inner,
                        Err(_) => Err(LlmError::Timeout {
                            timeout: self.timeout,
                        }),
                    }
                })
                .await;

            match outcome {
                Ok(text) => return self.parse_analysis(&text),
                Err(GuardedError::Open(_)) => {
                    return Err(Error::Translate(TranslateError::Unavailable {
                        reason: "translation circuit is open".to_string(),
                    }));
                }
                Err(GuardedError::Inner(err)) => {
                    tracing::warn!(attempt, "translation attempt failed: {err}");
                    last_error = Some(err);
                }
            }
        }

        Err(match last_error {
            Some(LlmError::Timeout { timeout }) => {
                Error::Translate(TranslateError::Timeout { timeout })
            }
            Some(err) => Error::Translate(TranslateError::Unavailable {
                reason: err.to_string(),
            }),
            None => Error::Translate(TranslateError::Unavailable {
                reason: "no translation attempts were made".to_string(),
            }),
        })
    }

    fn system_prompt(&self) -> String {
        format!(
            "You translate questions about U.S. Census demographics into a JSON analysis \
             object. Reply with a single JSON object and nothing else, shaped as:\n\
             {{\"intent\": one of [medicare_eligibility, population_health, \
             facility_adequacy, general_demographic, error],\n \
             \"entities\": [{{\"level\": state|county|tract|block_group, \"name\": ..., \
             \"code\": ...}}],\n \"measures\": [column names],\n \
             \"filters\": [{{\"column\": ..., \"op\": one of [=, !=, <, <=, >, >=, in, between], \
             \"value\": ...}}],\n \"sort\": {{\"column\": ..., \"direction\": asc|desc}},\n \
             \"limit\": <= {MAX_LIMIT},\n \"sql\": a single SELECT statement}}\n\n\
             Only reference the tables and columns below. Use state FIPS codes in SQL, \
             never state names.\n\n{}",
            self.catalog.prompt_context()
        )
    }

    fn user_prompt(&self, question: &str, session_context: Option<&AnalysisSummary>) -> String {
        match session_context {
            Some(summary) if self.detector.is_follow_up(question) => {
                format!("{}\n\n{}", summary.render(), question)
            }
            _ => question.to_string(),
        }
    }

    /// Strict parse of the provider reply.
    fn parse_analysis(&self, text: &str) -> Result<Analysis> {
        let json = extract_json(text).ok_or_else(|| low_confidence("reply contained no JSON"))?;
        let mut analysis: Analysis = serde_json::from_str(json)
            .map_err(|e| low_confidence(&format!("reply did not parse as an analysis: {e}")))?;

        if matches!(analysis.intent, Intent::Unknown | Intent::Error) {
            return Err(low_confidence("intent was not recognized"));
        }
        if analysis.sql.trim().is_empty() {
            return Err(low_confidence("analysis carried no SQL"));
        }

        let mut unknown_columns = Vec::new();
        for filter in &analysis.filters {
            if !self.catalog.is_column_known(&filter.column) {
                unknown_columns.push(filter.column.clone());
            }
        }
        if let Some(sort) = &analysis.sort
            && !self.catalog.is_column_known(&sort.column)
        {
            unknown_columns.push(sort.column.clone());
        }
        for measure in &analysis.measures {
            if !self.catalog.is_column_known(measure) {
                unknown_columns.push(measure.clone());
            }
        }
        if !unknown_columns.is_empty() {
            return Err(low_confidence(&format!(
                "analysis referenced unknown columns: {}",
                unknown_columns.join(", ")
            )));
        }

        analysis.limit = analysis.limit.min(MAX_LIMIT);

        // Ground named geographies to canonical codes.
        for entity in &mut analysis.entities {
            if entity.code.is_none()
                && entity.level == GeoLevel::State
                && let Some(name) = &entity.name
            {
                entity.code = self.catalog.state_code(name).map(String::from);
            }
        }

        Ok(analysis)
    }
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

fn low_confidence(reason: &str) -> Error {
    Error::Translate(TranslateError::LowConfidence {
        reason: reason.to_string(),
    })
}

/// Providers wrap JSON in prose or code fences; take the outermost object.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Exponential backoff with jitter, capped well under the stage timeout.
fn backoff(attempt: u32) -> Duration {
    let base = 250u64.saturating_mul(1 << (attempt - 1).min(4));
    let jitter = rand::thread_rng().gen_range(0..100);
    Duration::from_millis(base + jitter)
}
