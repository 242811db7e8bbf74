//! `query`: run SQL against a SQLite database.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Map, Number, Value};

use crate::error::{OrchestratorError, Result};

use super::{require_str, Primitive, StepContext};

/// Runs one statement against `input.database` (a file path, or
/// `:memory:`).
///
/// Input: `database`, `sql` and optional positional `params`.
/// Output: `rows` as a list of column maps, `columns`, `rows_affected`
/// (for statements that return no columns), `started_at` and `finished_at`.
pub struct Query;

struct QueryResult {
    columns: Vec<String>,
    rows: Vec<Value>,
    rows_affected: usize,
}

impl Query {
    fn params(input: &Value) -> Result<Vec<SqlValue>> {
        match input.get("params") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items.iter().map(to_sql).collect(),
            Some(_) => Err(OrchestratorError::bad_request(
                "query input field 'params' must be a list",
            )),
        }
    }
}

#[async_trait]
impl Primitive for Query {
    fn name(&self) -> &str {
        "query"
    }

    fn validate_input(&self, input: &Value) -> Result<()> {
        require_str(input, "database", "query")?;
        require_str(input, "sql", "query")?;
        Self::params(input)?;
        Ok(())
    }

    async fn run(&self, _ctx: &StepContext, input: &Value) -> Result<Value> {
        let database = require_str(input, "database", "query")?.to_string();
        let sql = require_str(input, "sql", "query")?.to_string();
        let params = Self::params(input)?;

        let started_at = Utc::now();
        let result = tokio::task::spawn_blocking(move || execute(&database, &sql, params))
            .await
            .map_err(|e| OrchestratorError::internal(format!("Query task panicked: {}", e)))??;
        let finished_at = Utc::now();

        Ok(json!({
            "columns": result.columns,
            "rows": result.rows,
            "rows_affected": result.rows_affected,
            "started_at": started_at,
            "finished_at": finished_at,
        }))
    }
}

fn execute(database: &str, sql: &str, params: Vec<SqlValue>) -> Result<QueryResult> {
    let fail = |e: rusqlite::Error| OrchestratorError::primitive(format!("Query failed: {}", e));

    let conn = Connection::open(database).map_err(|e| {
        OrchestratorError::primitive(format!("Failed to open database {}: {}", database, e))
    })?;
    let mut stmt = conn.prepare(sql).map_err(fail)?;

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    if columns.is_empty() {
        let rows_affected = stmt.execute(params_from_iter(params)).map_err(fail)?;
        return Ok(QueryResult {
            columns,
            rows: Vec::new(),
            rows_affected,
        });
    }

    let mut rows = Vec::new();
    let mut cursor = stmt.query(params_from_iter(params)).map_err(fail)?;
    while let Some(row) = cursor.next().map_err(fail)? {
        let mut record = Map::new();
        for (i, column) in columns.iter().enumerate() {
            record.insert(column.clone(), from_sql(row.get_ref(i).map_err(fail)?));
        }
        rows.push(Value::Object(record));
    }

    Ok(QueryResult {
        columns,
        rows,
        rows_affected: 0,
    })
}

fn to_sql(value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    })
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::test_context;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_insert_select() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        let db = db.to_str().unwrap();
        let ctx = test_context();

        Query
            .run(&ctx, &json!({ "database": db, "sql": "CREATE TABLE t (id INTEGER, name TEXT, score REAL)" }))
            .await
            .unwrap();

        let inserted = Query
            .run(
                &ctx,
                &json!({
                    "database": db,
                    "sql": "INSERT INTO t VALUES (?1, ?2, ?3), (?4, ?5, ?6)",
                    "params": [1, "ada", 9.5, 2, "grace", null]
                }),
            )
            .await
            .unwrap();
        assert_eq!(inserted["rows_affected"], json!(2));

        let output = Query
            .run(&ctx, &json!({ "database": db, "sql": "SELECT id, name, score FROM t ORDER BY id" }))
            .await
            .unwrap();

        assert_eq!(output["columns"], json!(["id", "name", "score"]));
        assert_eq!(
            output["rows"],
            json!([
                { "id": 1, "name": "ada", "score": 9.5 },
                { "id": 2, "name": "grace", "score": null }
            ])
        );
    }

    #[tokio::test]
    async fn test_bad_sql_is_primitive_failure() {
        let err = Query
            .run(&test_context(), &json!({ "database": ":memory:", "sql": "SELEKT 1" }))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::PrimitiveFailure(_)));
    }

    #[test]
    fn test_validate_input() {
        assert!(Query.validate_input(&json!({ "database": ":memory:", "sql": "SELECT 1" })).is_ok());
        assert!(Query.validate_input(&json!({ "sql": "SELECT 1" })).is_err());
        assert!(Query
            .validate_input(&json!({ "database": ":memory:", "sql": "SELECT 1", "params": "x" }))
            .is_err());
    }
}
