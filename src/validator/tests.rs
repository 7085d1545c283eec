use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::*;
use crate::catalog::SchemaCatalog;

fn validator() -> SqlValidator {
    SqlValidator::new(Arc::new(SchemaCatalog::acs()), ValidatorConfig::default())
}

fn validator_with_ceiling(cost_ceiling: u64) -> SqlValidator {
    SqlValidator::new(
        Arc::new(SchemaCatalog::acs()),
        ValidatorConfig {
            max_limit: 1_000,
            cost_ceiling,
        },
    )
}

#[test]
fn accepts_single_select_and_injects_limit() {
    let result = validator().validate("SELECT county_name FROM county_data WHERE state = '48'");
    assert!(result.is_accepted(), "reasons: {:?}", result.reasons);
    assert!(result.sanitized.contains("LIMIT 1000"));
    assert_eq!(result.tables, vec!["county_data".to_string()]);
    assert_eq!(result.estimated_rows, 1_000);
}

#[test]
fn trailing_semicolon_is_accepted() {
    let result = validator().validate("SELECT county_name FROM county_data;");
    assert!(result.is_accepted(), "reasons: {:?}", result.reasons);
}

#[test]
fn two_statements_are_rejected_as_multi_statement() {
    let result =
        validator().validate("SELECT county_name FROM county_data; SELECT state FROM state_data");
    assert_eq!(result.verdict, Verdict::Reject);
    assert_eq!(result.reason_codes(), vec!["MULTI_STATEMENT"]);
}

#[test]
fn line_comment_is_rejected() {
    let result = validator().validate("SELECT county_name FROM county_data -- DROP TABLE county_data");
    assert_eq!(result.reason_codes(), vec!["COMMENT_PRESENT"]);
}

#[test]
fn block_comment_is_rejected() {
    let result = validator().validate("SELECT /* sneak */ county_name FROM county_data");
    assert_eq!(result.reason_codes(), vec!["COMMENT_PRESENT"]);
}

#[test]
fn comment_bytes_inside_string_literal_are_accepted() {
    let result = validator()
        .validate("SELECT county_name FROM county_data WHERE county_name = 'a -- /* b'");
    assert!(result.is_accepted(), "reasons: {:?}", result.reasons);
}

#[test]
fn drop_table_is_statement_kind_forbidden() {
    let result = validator().validate("DROP TABLE county_data");
    assert_eq!(result.verdict, Verdict::Reject);
    assert_eq!(result.reason_codes(), vec!["STATEMENT_KIND_FORBIDDEN"]);
}

#[test]
fn write_statements_are_rejected() {
    for sql in [
        "INSERT INTO county_data VALUES ('x')",
        "UPDATE county_data SET population = 0",
        "DELETE FROM county_data",
        "CREATE TABLE t (x INT)",
        "ALTER TABLE county_data ADD COLUMN x INT",
        "TRUNCATE TABLE county_data",
    ] {
        let result = validator().validate(sql);
        assert_eq!(result.verdict, Verdict::Reject, "{sql} must be rejected");
        assert!(
            result.reason_codes() == vec!["STATEMENT_KIND_FORBIDDEN"]
                || result.reason_codes() == vec!["INVALID_SQL"],
            "{sql}: {:?}",
            result.reasons
        );
    }
}

#[test]
fn select_into_is_rejected() {
    let result = validator().validate("SELECT county_name INTO outfile FROM county_data");
    assert_eq!(result.verdict, Verdict::Reject);
}

#[test]
fn unknown_tables_are_enumerated() {
    let result = validator()
        .validate("SELECT a.name FROM users a JOIN secrets b ON a.id = b.id");
    assert_eq!(result.verdict, Verdict::Reject);
    let codes = result.reason_codes();
    assert_eq!(codes.iter().filter(|c| **c == "TABLE_NOT_ALLOWED").count(), 2);
    let rendered = format!("{:?}", result.reasons);
    assert!(rendered.contains("users"));
    assert!(rendered.contains("secrets"));
}

#[test]
fn unknown_columns_are_enumerated() {
    let result = validator()
        .validate("SELECT ssn, favorite_color FROM county_data WHERE state = '48'");
    assert_eq!(result.verdict, Verdict::Reject);
    assert_eq!(
        result.reason_codes(),
        vec!["COLUMN_NOT_ALLOWED", "COLUMN_NOT_ALLOWED"]
    );
}

#[test]
fn table_and_column_violations_are_reported_together() {
    let result = validator().validate("SELECT ssn FROM users");
    let codes = result.reason_codes();
    assert!(codes.contains(&"TABLE_NOT_ALLOWED"));
    assert!(codes.contains(&"COLUMN_NOT_ALLOWED"));
}

#[test]
fn wildcard_is_rewritten_to_explicit_columns() {
    let result = validator().validate("SELECT * FROM county_data");
    assert!(result.is_accepted(), "reasons: {:?}", result.reasons);
    assert!(!result.sanitized.contains('*'));
    assert!(result.sanitized.contains("county_fips"));
    assert!(result.sanitized.contains("poverty_rate"));
}

#[test]
fn qualified_wildcard_expands_for_the_aliased_table() {
    let result = validator().validate(
        "SELECT c.* FROM county_data c JOIN state_data s ON c.state = s.state",
    );
    assert!(result.is_accepted(), "reasons: {:?}", result.reasons);
    assert!(result.sanitized.contains("c.county_fips"));
    assert!(!result.sanitized.contains("c.*"));
}

#[test]
fn oversized_limit_is_clamped_and_offset_preserved() {
    let result =
        validator().validate("SELECT county_name FROM county_data LIMIT 1000000 OFFSET 10");
    assert!(result.is_accepted(), "reasons: {:?}", result.reasons);
    assert!(result.sanitized.contains("LIMIT 1000"));
    assert!(result.sanitized.contains("OFFSET 10"));
    assert_eq!(result.estimated_rows, 1_000);
}

#[test]
fn limit_zero_is_preserved() {
    let result = validator().validate("SELECT county_name FROM county_data LIMIT 0");
    assert!(result.is_accepted(), "reasons: {:?}", result.reasons);
    assert!(result.sanitized.contains("LIMIT 0"));
    assert_eq!(result.estimated_rows, 0);
}

#[test]
fn smaller_limits_are_kept() {
    let result = validator().validate("SELECT county_name FROM county_data LIMIT 10");
    assert!(result.is_accepted(), "reasons: {:?}", result.reasons);
    assert!(result.sanitized.contains("LIMIT 10"));
    assert_eq!(result.estimated_rows, 10);
}

#[test]
fn system_schema_is_blocked() {
    let result = validator().validate("SELECT table_name FROM information_schema.tables");
    assert_eq!(result.verdict, Verdict::Reject);
    assert!(result.reason_codes().contains(&"SYSTEM_SCHEMA_BLOCKED"));
}

#[test]
fn filesystem_table_functions_are_forbidden() {
    let result = validator().validate("SELECT * FROM read_csv('/etc/passwd')");
    assert_eq!(result.verdict, Verdict::Reject);
    assert!(result.reason_codes().contains(&"FORBIDDEN_FUNCTION"));
}

#[test]
fn getenv_is_forbidden() {
    let result = validator().validate("SELECT getenv('HOME') FROM county_data");
    assert_eq!(result.verdict, Verdict::Reject);
    assert!(result.reason_codes().contains(&"FORBIDDEN_FUNCTION"));
}

#[test]
fn aggregates_are_flagged() {
    let result = validator()
        .validate("SELECT SUM(population) AS total FROM county_data WHERE state = '12'");
    assert!(result.is_accepted(), "reasons: {:?}", result.reasons);
    assert!(result.has_aggregation);
}

#[test]
fn group_by_is_flagged_as_aggregation() {
    let result = validator()
        .validate("SELECT state, COUNT(county_fips) AS n FROM county_data GROUP BY state");
    assert!(result.is_accepted(), "reasons: {:?}", result.reasons);
    assert!(result.has_aggregation);
}

#[test]
fn cte_names_are_scoped_not_allowlisted() {
    let result = validator().validate(
        "WITH texas AS (SELECT county_fips, population FROM county_data WHERE state = '48') \
         SELECT county_fips FROM texas ORDER BY population DESC",
    );
    assert!(result.is_accepted(), "reasons: {:?}", result.reasons);
    assert_eq!(result.tables, vec!["county_data".to_string()]);
}

#[test]
fn joins_resolve_aliased_columns() {
    let result = validator().validate(
        "SELECT c.county_name, s.state_name FROM county_data c \
         JOIN state_data s ON c.state = s.state WHERE s.state = '48'",
    );
    assert!(result.is_accepted(), "reasons: {:?}", result.reasons);
    let mut tables = result.tables.clone();
    tables.sort();
    assert_eq!(tables, vec!["county_data", "state_data"]);
}

#[test]
fn misqualified_columns_are_rejected() {
    let result = validator().validate("SELECT c.geoid FROM county_data c");
    assert_eq!(result.verdict, Verdict::Reject);
    assert!(result.reason_codes().contains(&"COLUMN_NOT_ALLOWED"));
}

#[test]
fn cost_ceiling_rejects_wide_scans() {
    let result = validator_with_ceiling(2_000).validate(
        "SELECT a.county_name FROM county_data a, county_data b, county_data c",
    );
    assert_eq!(result.verdict, Verdict::Reject);
    assert_eq!(result.reason_codes(), vec!["QUERY_TOO_EXPENSIVE"]);
}

#[test]
fn validation_is_idempotent() {
    let sql = "SELECT ssn FROM users";
    let first = validator().validate(sql);
    let second = validator().validate(sql);
    assert_eq!(first.verdict, second.verdict);
    assert_eq!(first.reasons, second.reasons);
}

#[test]
fn sanitized_sql_revalidates_cleanly() {
    let first = validator().validate("SELECT * FROM county_data WHERE state = '12' LIMIT 2000");
    assert!(first.is_accepted(), "reasons: {:?}", first.reasons);

    let second = validator().validate(&first.sanitized);
    assert!(second.is_accepted(), "reasons: {:?}", second.reasons);
    assert_eq!(second.sanitized, first.sanitized);
}

#[test]
fn select_without_tables_is_accepted() {
    let result = validator().validate("SELECT 1");
    assert!(result.is_accepted(), "reasons: {:?}", result.reasons);
    assert!(result.tables.is_empty());
}
