//! Query execution over the pool: blocking engine calls isolated on the
//! blocking thread pool, bounded by a query-level timeout, rows materialized
//! into JSON scalars.

use std::time::{Duration, Instant};

use duckdb::types::ValueRef;
use serde_json::{Map, Number, Value};

use crate::db::pool::{ConnectionPool, Handle};
use crate::error::ExecuteError;

/// Materialized result of one statement.
#[derive(Debug, Clone)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    pub row_count: u64,
    pub execution_time: Duration,
}

#[derive(Clone)]
pub struct QueryExecutor {
    pool: ConnectionPool,
    query_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(pool: ConnectionPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Execute sanitized SQL and materialize the rows.
    ///
    /// On timeout the blocking task is abandoned and the handle is replaced
    /// by the pool; the engine has no further effect on observable state.
    pub async fn execute(&self, sql: &str) -> Result<QueryRows, ExecuteError> {
        let started = Instant::now();
        let mut pooled = self.pool.acquire().await?;
        let handle = pooled.take().ok_or(ExecuteError::Pool(
            crate::error::PoolError::Closed,
        ))?;

        let sql_owned = sql.to_string();
        let work =
            tokio::task::spawn_blocking(move || -> (Handle, Result<RawResult, String>) {
                let result = run_statement(&handle.conn, &sql_owned);
                (handle, result)
            });

        match tokio::time::timeout(self.query_timeout, work).await {
            Err(_) => {
                // Handle is stranded in the abandoned task; replacement is the
                // cancel primitive for an embedded engine.
                pooled.mark_broken();
                Err(ExecuteError::Timeout {
                    budget: self.query_timeout,
                })
            }
            Ok(Err(join_err)) => {
                pooled.mark_broken();
                Err(ExecuteError::Engine(format!("executor task failed: {join_err}")))
            }
            Ok(Ok((handle, result))) => {
                pooled.give_back(handle);
                match result {
                    Ok(raw) => Ok(QueryRows {
                        columns: raw.columns,
                        row_count: raw.rows.len() as u64,
                        rows: raw.rows,
                        execution_time: started.elapsed(),
                    }),
                    Err(message) => {
                        // The statement failed; the handle itself is fine.
                        Err(ExecuteError::Engine(message))
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

struct RawResult {
    columns: Vec<String>,
    rows: Vec<Map<String, Value>>,
}

fn run_statement(conn: &duckdb::Connection, sql: &str) -> Result<RawResult, String> {
    let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
    let mut rows = stmt.query([]).map_err(|e| e.to_string())?;

    let mut columns: Option<Vec<String>> = None;
    let mut materialized = Vec::new();
    loop {
        match rows.next() {
            Ok(Some(row)) => {
                let names = columns.get_or_insert_with(|| {
                    row.as_ref()
                        .column_names()
                        .into_iter()
                        .map(|name| name.to_string())
                        .collect()
                });
                let mut record = Map::with_capacity(names.len());
                for (idx, name) in names.iter().enumerate() {
                    let value = row
                        .get_ref(idx)
                        .map(scalar_from)
                        .map_err(|e| e.to_string())?;
                    record.insert(name.clone(), value);
                }
                materialized.push(record);
            }
            Ok(None) => break,
            Err(e) => return Err(e.to_string()),
        }
    }
    drop(rows);

    let columns = columns.unwrap_or_else(|| {
        stmt.column_names()
            .into_iter()
            .map(|name| name.to_string())
            .collect()
    });

    Ok(RawResult {
        columns,
        rows: materialized,
    })
}

/// Widen engine scalars to JSON values. Integers widen to i64 so 64-bit
/// magnitudes survive; wider integers fall back to their decimal string.
fn scalar_from(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::from(i as i64),
        ValueRef::SmallInt(i) => Value::from(i as i64),
        ValueRef::Int(i) => Value::from(i as i64),
        ValueRef::BigInt(i) => Value::from(i),
        ValueRef::UTinyInt(i) => Value::from(i as u64),
        ValueRef::USmallInt(i) => Value::from(i as u64),
        ValueRef::UInt(i) => Value::from(i as u64),
        ValueRef::UBigInt(i) => i64::try_from(i)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(i.to_string())),
        ValueRef::HugeInt(i) => i64::try_from(i)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(i.to_string())),
        ValueRef::Float(f) => Number::from_f64(f as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Double(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(d.to_string())),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        other => Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::pool::ensure_database_file;
    use std::path::Path;

    fn test_config(path: &Path) -> DatabaseConfig {
        DatabaseConfig {
            path: path.to_path_buf(),
            pool_min: 1,
            pool_max: 2,
            acquire_timeout: Duration::from_millis(500),
            query_timeout: Duration::from_secs(5),
            memory_limit: "512MB".to_string(),
            threads: 2,
            health_interval: Duration::from_secs(60),
        }
    }

    async fn seeded_executor() -> (tempfile::TempDir, QueryExecutor) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("exec.duckdb");
        ensure_database_file(&path).expect("database file");

        // Seed through a direct connection before the pool reads it.
        let conn = duckdb::Connection::open(&path).expect("open for seeding");
        conn.execute_batch(
            "CREATE TABLE county_data (
                 county_fips VARCHAR, county_name VARCHAR, state VARCHAR,
                 population BIGINT, poverty_rate DOUBLE
             );
             INSERT INTO county_data VALUES
                 ('48201', 'Harris County', '48', 4731145, 16.4),
                 ('48113', 'Dallas County', '48', 2613539, 14.2),
                 ('12086', 'Miami-Dade County', '12', 2701767, 15.1);",
        )
        .expect("seed");
        drop(conn);

        let config = test_config(&path);
        let timeout = config.query_timeout;
        let pool = ConnectionPool::open(config).await.expect("pool opens");
        (dir, QueryExecutor::new(pool, timeout))
    }

    #[tokio::test]
    async fn materializes_rows_with_named_scalars() {
        let (_dir, executor) = seeded_executor().await;
        let result = executor
            .execute(
                "SELECT county_name, population FROM county_data WHERE state = '48' \
                 ORDER BY population DESC LIMIT 1000",
            )
            .await
            .expect("query runs");

        assert_eq!(result.columns, vec!["county_name", "population"]);
        assert_eq!(result.row_count, 2);
        assert_eq!(
            result.rows[0].get("county_name"),
            Some(&Value::String("Harris County".to_string()))
        );
        assert_eq!(result.rows[0].get("population"), Some(&Value::from(4731145)));
    }

    #[tokio::test]
    async fn empty_results_still_report_columns() {
        let (_dir, executor) = seeded_executor().await;
        let result = executor
            .execute("SELECT county_name FROM county_data WHERE state = '99' LIMIT 10")
            .await
            .expect("query runs");
        assert_eq!(result.row_count, 0);
        assert_eq!(result.columns, vec!["county_name"]);
    }

    #[tokio::test]
    async fn aggregates_widen_to_64_bit() {
        let (_dir, executor) = seeded_executor().await;
        let result = executor
            .execute("SELECT SUM(population) AS total FROM county_data")
            .await
            .expect("query runs");
        assert_eq!(result.row_count, 1);
        let total = result.rows[0].get("total").expect("total present");
        assert_eq!(total.as_i64(), Some(4731145 + 2613539 + 2701767));
    }

    #[tokio::test]
    async fn runtime_errors_are_reported_not_fatal() {
        let (_dir, executor) = seeded_executor().await;
        let err = executor
            .execute("SELECT no_such_column FROM county_data")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Engine(_)));

        // The handle survives a statement error and serves the next query.
        let result = executor
            .execute("SELECT COUNT(*) AS n FROM county_data")
            .await
            .expect("pool still serves");
        assert_eq!(result.rows[0].get("n").and_then(Value::as_i64), Some(3));
    }

    #[tokio::test]
    async fn nulls_and_doubles_round_trip() {
        let (_dir, executor) = seeded_executor().await;
        let result = executor
            .execute("SELECT NULL AS missing, poverty_rate FROM county_data LIMIT 1")
            .await
            .expect("query runs");
        assert_eq!(result.rows[0].get("missing"), Some(&Value::Null));
        assert!(result.rows[0]
            .get("poverty_rate")
            .and_then(Value::as_f64)
            .is_some());
    }
}
