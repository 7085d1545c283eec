//! LLM-backed translation: provider client, typed analysis, and the
//! intent-to-SQL translator grounded in the schema catalog.

pub mod analysis;
pub mod anthropic;
pub mod translator;

use async_trait::async_trait;

use crate::error::LlmError;

pub use analysis::{
    Analysis, AnalysisSummary, Filter, FilterOp, GeoEntity, Intent, MAX_LIMIT, Sort, SortDirection,
};
pub use anthropic::AnthropicClient;
pub use translator::{FollowUpDetector, RegexFollowUpDetector, Translator};

/// Boundary to the external model provider.
///
/// The translator only needs one completion shape; tests substitute a
/// scripted implementation.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion and return the raw assistant text.
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError>;
}
