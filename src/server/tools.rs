//! Tool registration and dispatch for the protocol server.
//!
//! Six tools: schema introspection, standalone validation, the two pipeline
//! entry points, cursor-based drill-down into block groups, and parallel
//! multi-region comparison.

use std::sync::Arc;

use futures::future::join_all;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::catalog::RegionSelector;
use crate::pipeline::RunContext;
use crate::server::AppState;
use crate::server::mcp::{JsonRpcResponse, error_codes};
use crate::session::Session;

/// Rows per drill-down page; one extra row is fetched to detect `has_more`.
const DRILL_PAGE: usize = 100;

/// Tool descriptors for `tools/list`.
pub fn list_tools() -> Value {
    json!({
        "tools": [
            {
                "name": "get_schema",
                "description": "Describe the queryable Census tables, columns, state FIPS codes, and metro areas.",
                "inputSchema": { "type": "object", "properties": {}, "additionalProperties": false },
                "_meta": { "ui": { "resourceUri": "ui://censusgate/table" } },
            },
            {
                "name": "validate_sql",
                "description": "Run the read-only SQL validator without executing anything.",
                "inputSchema": {
                    "type": "object",
                    "properties": { "sql": { "type": "string" } },
                    "required": ["sql"],
                },
            },
            {
                "name": "execute_query",
                "description": "Validate and execute a SELECT statement against the Census database.",
                "inputSchema": {
                    "type": "object",
                    "properties": { "sql": { "type": "string" } },
                    "required": ["sql"],
                },
                "_meta": { "ui": { "resourceUri": "ui://censusgate/table" } },
            },
            {
                "name": "execute_natural_language",
                "description": "Translate a question about U.S. demographics into SQL, validate it, and execute it.",
                "inputSchema": {
                    "type": "object",
                    "properties": { "question": { "type": "string" } },
                    "required": ["question"],
                },
                "_meta": { "ui": { "resourceUri": "ui://censusgate/table" } },
            },
            {
                "name": "execute_drill_down",
                "description": "Page through the block groups of one county, 100 rows at a time.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "countyFips": { "type": "string", "pattern": "^[0-9]{5}$" },
                        "cursor": { "type": "string", "pattern": "^[0-9]{12}$" },
                    },
                    "required": ["countyFips"],
                },
                "_meta": { "ui": { "resourceUri": "ui://censusgate/bar-chart" } },
            },
            {
                "name": "execute_comparison",
                "description": "Compare demographics across several states or metro areas in parallel.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "regions": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                    },
                    "required": ["regions"],
                },
                "_meta": { "ui": { "resourceUri": "ui://censusgate/bar-chart" } },
            },
        ]
    })
}

enum ToolFailure {
    InvalidParams(String),
}

fn run_context(session: &Session) -> RunContext {
    RunContext {
        session_id: Some(session.session_id.clone()),
        user_id: session.user_id.clone(),
        session_summary: session.context.clone(),
    }
}

/// Wrap a tool value in the MCP result shape.
fn tool_result(value: Value, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": value.to_string() }],
        "structuredContent": value,
        "isError": is_error,
    })
}

/// `tools/call` entry point.
pub async fn call_tool(
    state: &Arc<AppState>,
    session: &Session,
    id: Value,
    params: Value,
) -> JsonRpcResponse {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return JsonRpcResponse::error(
            id,
            error_codes::INVALID_PARAMS,
            "tools/call requires a tool name",
            None,
        );
    };
    let args = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    match dispatch(state, session, name, args).await {
        Ok((value, is_error)) => JsonRpcResponse::result(id, tool_result(value, is_error)),
        Err(ToolFailure::InvalidParams(message)) => {
            JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, message, None)
        }
    }
}

async fn dispatch(
    state: &Arc<AppState>,
    session: &Session,
    name: &str,
    args: Value,
) -> Result<(Value, bool), ToolFailure> {
    match name {
        "get_schema" => {
            let mut schema = state.catalog.to_wire();
            schema["freshness"] = serde_json::to_value(state.freshness.all())
                .unwrap_or(Value::Null);
            Ok((schema, false))
        }
        "validate_sql" => {
            let args: SqlArgs = parse_args(args)?;
            let validated = state.pipeline.validator().validate(&args.sql);
            let value = serde_json::to_value(&validated)
                .unwrap_or_else(|_| json!({ "verdict": "reject" }));
            Ok((value, false))
        }
        "execute_query" => {
            let args: SqlArgs = parse_args(args)?;
            let result = state.pipeline.run_sql(&args.sql, &run_context(session)).await;
            let is_error = !result.success;
            Ok((serde_json::to_value(&result).unwrap_or(Value::Null), is_error))
        }
        "execute_natural_language" => {
            let args: QuestionArgs = parse_args(args)?;
            let result = state
                .pipeline
                .run_question(&args.question, &run_context(session))
                .await;
            let is_error = !result.success;
            Ok((serde_json::to_value(&result).unwrap_or(Value::Null), is_error))
        }
        "execute_drill_down" => drill_down(state, session, args).await,
        "execute_comparison" => comparison(state, session, args).await,
        other => Err(ToolFailure::InvalidParams(format!("unknown tool: {other}"))),
    }
}

#[derive(Debug, Deserialize)]
struct SqlArgs {
    sql: String,
}

#[derive(Debug, Deserialize)]
struct QuestionArgs {
    question: String,
}

#[derive(Debug, Deserialize)]
struct DrillDownArgs {
    #[serde(alias = "county_fips")]
    #[serde(rename = "countyFips")]
    county_fips: String,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ComparisonArgs {
    regions: Vec<String>,
}

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ToolFailure> {
    serde_json::from_value(args)
        .map_err(|e| ToolFailure::InvalidParams(format!("invalid arguments: {e}")))
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Narrow a prior county-level result to its block groups, keyed by GEOID.
///
/// Fetches one row beyond the page to detect `has_more`; the cursor is the
/// last GEOID of the previous page.
async fn drill_down(
    state: &Arc<AppState>,
    session: &Session,
    args: Value,
) -> Result<(Value, bool), ToolFailure> {
    let args: DrillDownArgs = parse_args(args)?;
    if args.county_fips.len() != 5 || !all_digits(&args.county_fips) {
        return Err(ToolFailure::InvalidParams(
            "countyFips must be a 5-digit county FIPS code".to_string(),
        ));
    }
    if let Some(cursor) = &args.cursor
        && (cursor.len() != 12 || !all_digits(cursor))
    {
        return Err(ToolFailure::InvalidParams(
            "cursor must be a 12-digit block group GEOID".to_string(),
        ));
    }

    let cursor_clause = args
        .cursor
        .as_ref()
        .map(|cursor| format!(" AND geoid > '{cursor}'"))
        .unwrap_or_default();
    let sql = format!(
        "SELECT geoid, population, median_household_income, population_65_plus, \
         medicare_eligible_count, poverty_rate FROM block_group_data \
         WHERE county_fips = '{}'{cursor_clause} ORDER BY geoid LIMIT {}",
        args.county_fips,
        DRILL_PAGE + 1
    );

    let result = state.pipeline.run_sql(&sql, &run_context(session)).await;
    if !result.success {
        return Ok((serde_json::to_value(&result).unwrap_or(Value::Null), true));
    }

    let mut rows = result.rows;
    let has_more = rows.len() > DRILL_PAGE;
    rows.truncate(DRILL_PAGE);
    let next_cursor = has_more
        .then(|| {
            rows.last()
                .and_then(|row| row.get("geoid"))
                .and_then(Value::as_str)
                .map(String::from)
        })
        .flatten();

    Ok((
        json!({
            "success": true,
            "correlationId": result.correlation_id,
            "countyFips": args.county_fips,
            "rowCount": rows.len(),
            "rows": rows,
            "hasMore": has_more,
            "nextCursor": next_cursor,
            "freshness": result.metadata.freshness,
        }),
        false,
    ))
}

/// Run one pipeline invocation per region concurrently and join the results
/// into a single envelope. Partial success is allowed.
async fn comparison(
    state: &Arc<AppState>,
    session: &Session,
    args: Value,
) -> Result<(Value, bool), ToolFailure> {
    let args: ComparisonArgs = parse_args(args)?;
    if args.regions.is_empty() {
        return Err(ToolFailure::InvalidParams(
            "regions must name at least one state or metro area".to_string(),
        ));
    }

    let runs = args.regions.iter().map(|region| {
        let ctx = run_context(session);
        let state = Arc::clone(state);
        let region = region.clone();
        async move {
            let Some(selector) = state.catalog.resolve_region(&region) else {
                return json!({
                    "region": region,
                    "success": false,
                    "error": "unknown region; use a state name or a known metro area",
                });
            };
            let sql = region_sql(&selector);
            let result = state.pipeline.run_sql(&sql, &ctx).await;
            if result.success {
                json!({
                    "region": region,
                    "success": true,
                    "rows": result.rows,
                    "freshness": result.metadata.freshness,
                    "correlationId": result.correlation_id,
                })
            } else {
                json!({
                    "region": region,
                    "success": false,
                    "error": result.error.map(|e| e.message),
                    "correlationId": result.correlation_id,
                })
            }
        }
    });

    let regions = join_all(runs).await;
    Ok((json!({ "success": true, "regions": regions }), false))
}

fn region_sql(selector: &RegionSelector) -> String {
    match selector {
        RegionSelector::State(code) => format!(
            "SELECT state_name, population, median_household_income, population_65_plus, \
             medicare_eligible_count, poverty_rate, uninsured_rate \
             FROM state_data WHERE state = '{code}'"
        ),
        RegionSelector::Counties(counties) => {
            let list = counties
                .iter()
                .map(|fips| format!("'{fips}'"))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "SELECT SUM(population) AS population, \
                 SUM(population_65_plus) AS population_65_plus, \
                 SUM(medicare_eligible_count) AS medicare_eligible_count, \
                 SUM(hospital_count) AS hospital_count \
                 FROM county_data WHERE county_fips IN ({list})"
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_list_names_every_operation() {
        let listed = list_tools();
        let names: Vec<&str> = listed["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "get_schema",
                "validate_sql",
                "execute_query",
                "execute_natural_language",
                "execute_drill_down",
                "execute_comparison",
            ]
        );
    }

    #[test]
    fn drill_down_arguments_accept_both_key_styles() {
        let snake: DrillDownArgs =
            serde_json::from_value(json!({ "county_fips": "12086" })).expect("snake_case");
        assert_eq!(snake.county_fips, "12086");

        let camel: DrillDownArgs =
            serde_json::from_value(json!({ "countyFips": "12086", "cursor": "120860001001" }))
                .expect("camelCase");
        assert_eq!(camel.cursor.as_deref(), Some("120860001001"));
    }

    #[test]
    fn region_sql_aggregates_metro_counties() {
        let sql = region_sql(&RegionSelector::Counties(&["12057", "12103"]));
        assert!(sql.contains("SUM(population)"));
        assert!(sql.contains("'12057', '12103'"));

        let sql = region_sql(&RegionSelector::State("04"));
        assert!(sql.contains("state = '04'"));
    }

    #[test]
    fn digit_guards_reject_injection_shapes() {
        assert!(all_digits("12086"));
        assert!(!all_digits("12086'; DROP"));
        assert!(!all_digits(""));
    }
}
