//! The translator's structured output: a typed analysis of one question.

use serde::{Deserialize, Serialize};

use crate::catalog::GeoLevel;

/// Closed set of recognized intents. Anything the provider invents lands in
/// `Unknown` and is routed to a low-confidence failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    MedicareEligibility,
    PopulationHealth,
    FacilityAdequacy,
    GeneralDemographic,
    Error,
    #[serde(other)]
    Unknown,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MedicareEligibility => "medicare_eligibility",
            Self::PopulationHealth => "population_health",
            Self::FacilityAdequacy => "facility_adequacy",
            Self::GeneralDemographic => "general_demographic",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// One geographic entity referenced by the question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoEntity {
    pub level: GeoLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Comparison operators the translator may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=", alias = "≠", alias = "<>")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=", alias = "≤")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=", alias = "≥")]
    Ge,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "between")]
    Between,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sort {
    pub column: String,
    pub direction: SortDirection,
}

/// Hard cap on rows any analysis may request.
pub const MAX_LIMIT: u64 = 1_000;

fn default_limit() -> u64 {
    MAX_LIMIT
}

/// Typed analysis: intent, grounded entities, and the generated SQL.
///
/// Invariant (enforced by the translator and re-proven by the validator):
/// every column referenced in `filters`, `sort`, and `sql` appears in the
/// schema catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub intent: Intent,
    #[serde(default)]
    pub entities: Vec<GeoEntity>,
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Sort>,
    #[serde(default = "default_limit")]
    pub limit: u64,
    pub sql: String,
}

impl Analysis {
    /// Compact rendering carried in the session for follow-up questions.
    pub fn summary(&self) -> AnalysisSummary {
        AnalysisSummary {
            intent: self.intent,
            entities: self
                .entities
                .iter()
                .map(|e| {
                    format!(
                        "{}:{}",
                        e.level.as_str(),
                        e.code
                            .as_deref()
                            .or(e.name.as_deref())
                            .unwrap_or("?")
                    )
                })
                .collect(),
            measures: self.measures.clone(),
            sql: self.sql.clone(),
        }
    }
}

/// What a follow-up question gets to see of the previous analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub intent: Intent,
    pub entities: Vec<String>,
    pub measures: Vec<String>,
    pub sql: String,
}

impl AnalysisSummary {
    pub fn render(&self) -> String {
        format!(
            "Previous analysis: intent={}, entities=[{}], measures=[{}], sql={}",
            self.intent.as_str(),
            self.entities.join(", "),
            self.measures.join(", "),
            self.sql
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_analysis() {
        let raw = serde_json::json!({
            "intent": "general_demographic",
            "entities": [{"level": "state", "name": "Texas", "code": "48"}],
            "measures": ["population"],
            "filters": [{"column": "state", "op": "=", "value": "48"}],
            "sort": {"column": "population", "direction": "desc"},
            "limit": 100,
            "sql": "SELECT county_name FROM county_data WHERE state = '48'"
        });
        let analysis: Analysis = serde_json::from_value(raw).expect("parses");
        assert_eq!(analysis.intent, Intent::GeneralDemographic);
        assert_eq!(analysis.entities[0].code.as_deref(), Some("48"));
        assert_eq!(analysis.filters[0].op, FilterOp::Eq);
        assert_eq!(analysis.limit, 100);
    }

    #[test]
    fn unknown_intents_fall_into_the_unknown_variant() {
        let raw = serde_json::json!({
            "intent": "astrology",
            "sql": "SELECT 1"
        });
        let analysis: Analysis = serde_json::from_value(raw).expect("parses");
        assert_eq!(analysis.intent, Intent::Unknown);
    }

    #[test]
    fn missing_limit_defaults_to_the_cap() {
        let raw = serde_json::json!({
            "intent": "population_health",
            "sql": "SELECT population FROM state_data"
        });
        let analysis: Analysis = serde_json::from_value(raw).expect("parses");
        assert_eq!(analysis.limit, MAX_LIMIT);
    }

    #[test]
    fn missing_sql_fails_parsing() {
        let raw = serde_json::json!({ "intent": "general_demographic" });
        assert!(serde_json::from_value::<Analysis>(raw).is_err());
    }

    #[test]
    fn unicode_operator_aliases_parse() {
        let raw = serde_json::json!({"column": "population", "op": "≥", "value": 65});
        let filter: Filter = serde_json::from_value(raw).expect("parses");
        assert_eq!(filter.op, FilterOp::Ge);
    }

    #[test]
    fn summary_prefers_codes_over_names() {
        let analysis = Analysis {
            intent: Intent::GeneralDemographic,
            entities: vec![GeoEntity {
                level: GeoLevel::State,
                name: Some("Texas".to_string()),
                code: Some("48".to_string()),
            }],
            measures: vec!["population".to_string()],
            filters: vec![],
            sort: None,
            limit: 1000,
            sql: "SELECT 1".to_string(),
        };
        let summary = analysis.summary();
        assert_eq!(summary.entities, vec!["state:48".to_string()]);
        assert!(summary.render().contains("general_demographic"));
    }
}
