//! Relational connector over a single SQLite connection.
//!
//! Rows travel as JSON objects keyed by column name. Identifiers are quoted,
//! values are always bound as parameters, and an empty `where` map is
//! refused for `update_row` and `delete_row`.
//!
//! BLOB values are written as `{"$blob": "<hex>"}` so that a captured row
//! binds back as a BLOB rather than as its hex text.

use super::detected;
use crate::connector::{parse_args, unknown_action, Allowlist, Connector};
use crate::error::{EnactError, Result};
use crate::models::{fields, ActionResult};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const SYSTEM: &str = "sqlite";

pub const DEFAULT_ACTIONS: &[&str] = &["select_rows", "insert_row", "update_row"];

pub const ACTIONS: &[&str] = &["select_rows", "insert_row", "update_row", "delete_row"];

pub type Row = Map<String, Value>;

/// Key of the tagged object carrying a BLOB value.
pub const BLOB_TAG: &str = "$blob";

#[derive(Debug, Error)]
enum SqlError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Refused(String),
}

type SqlResult<T> = std::result::Result<T, SqlError>;

pub struct SqliteConnector {
    conn: Mutex<Connection>,
    allowlist: Allowlist,
}

impl SqliteConnector {
    pub fn open(path: impl AsRef<Path>, allowed_actions: Option<Vec<String>>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| EnactError::ConnectorSetup {
            system: SYSTEM.to_string(),
            reason: format!("{}: {e}", path.display()),
        })?;
        Ok(Self::from_connection(conn, allowed_actions))
    }

    pub fn open_in_memory(allowed_actions: Option<Vec<String>>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| EnactError::ConnectorSetup {
            system: SYSTEM.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_connection(conn, allowed_actions))
    }

    pub fn from_connection(conn: Connection, allowed_actions: Option<Vec<String>>) -> Self {
        Self {
            conn: Mutex::new(conn),
            allowlist: Allowlist::or_defaults(allowed_actions, DEFAULT_ACTIONS),
        }
    }

    /// Run raw SQL outside the allowlist. Meant for schema setup, not for
    /// workflows.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.lock().execute_batch(sql).map_err(|e| EnactError::ConnectorSetup {
            system: SYSTEM.to_string(),
            reason: e.to_string(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // every mutation runs in its own transaction, so a poisoned lock holds no partial write
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn select_rows(&self, table: &str, filter: &Row) -> Result<ActionResult> {
        const ACTION: &str = "select_rows";
        self.check_allowed(ACTION)?;
        let conn = self.lock();
        let result = match select(&conn, table, filter) {
            Ok(rows) => ActionResult::read(
                SYSTEM,
                ACTION,
                fields(json!({"count": rows.len(), "rows": rows})),
            ),
            Err(e) => ActionResult::failure(SYSTEM, ACTION, e),
        };
        Ok(result)
    }

    pub fn insert_row(&self, table: &str, data: &Row) -> Result<ActionResult> {
        const ACTION: &str = "insert_row";
        self.check_allowed(ACTION)?;
        let mut conn = self.lock();
        let run = |conn: &mut Connection| -> SqlResult<ActionResult> {
            if data.is_empty() {
                return Err(SqlError::Refused("insert_row needs at least one column".into()));
            }
            let tx = conn.transaction()?;
            let pk = primary_key(&tx, table)?;

            if let Some(existing) = detected(SYSTEM, ACTION, existing_by_key(&tx, table, &pk, data)) {
                return Ok(ActionResult::already(
                    SYSTEM,
                    ACTION,
                    "inserted",
                    fields(json!({"table": table, "row": existing})),
                ));
            }

            let columns: Vec<String> = data.keys().map(|c| quote(c)).collect();
            let placeholders: Vec<String> = (1..=data.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                quote(table),
                columns.join(", "),
                placeholders.join(", ")
            );
            let params: Vec<SqlValue> = data.values().map(to_sql).collect();
            let inserted = query_rows(&tx, &sql, &params)?
                .into_iter()
                .next()
                .ok_or_else(|| SqlError::Refused("insert returned no row".into()))?;
            tx.commit()?;

            let key = row_key(&pk, &inserted);
            Ok(ActionResult::mutated(
                SYSTEM,
                ACTION,
                fields(json!({"table": table, "row": inserted})),
                fields(json!({"table": table, "key": key})),
            ))
        };
        Ok(run(&mut *conn).unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }

    pub fn update_row(&self, table: &str, data: &Row, filter: &Row) -> Result<ActionResult> {
        const ACTION: &str = "update_row";
        self.check_allowed(ACTION)?;
        let mut conn = self.lock();
        let run = |conn: &mut Connection| -> SqlResult<ActionResult> {
            require_filter(ACTION, filter)?;
            if data.is_empty() {
                return Err(SqlError::Refused("update_row needs at least one column".into()));
            }
            let tx = conn.transaction()?;
            let matched = select(&tx, table, filter)?;

            if !matched.is_empty() && matched.iter().all(|row| holds(row, data)) {
                return Ok(ActionResult::already(
                    SYSTEM,
                    ACTION,
                    "updated",
                    fields(json!({"table": table, "rows_affected": 0})),
                ));
            }

            let pk = primary_key(&tx, table)?;
            let restore: Vec<Value> = matched
                .iter()
                .map(|row| {
                    // the key must identify the row after the update lands
                    let mut key = row_key(&pk, row);
                    for (column, value) in key.iter_mut() {
                        if let Some(new) = data.get(column) {
                            *value = new.clone();
                        }
                    }
                    let previous: Row = data
                        .keys()
                        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                        .collect();
                    json!({"key": key, "previous": previous})
                })
                .collect();

            let (set_sql, mut params) = assignments(data);
            let (where_sql, where_params) = where_clause(filter, params.len());
            params.extend(where_params);
            let sql = format!("UPDATE {} SET {set_sql}{where_sql}", quote(table));
            let affected = tx.execute(&sql, params_from_iter(params.iter()))?;
            tx.commit()?;

            let rollback = if restore.is_empty() {
                Map::new()
            } else {
                fields(json!({"table": table, "rows": restore}))
            };
            Ok(ActionResult::mutated(
                SYSTEM,
                ACTION,
                fields(json!({"table": table, "rows_affected": affected})),
                rollback,
            ))
        };
        Ok(run(&mut *conn).unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }

    pub fn delete_row(&self, table: &str, filter: &Row) -> Result<ActionResult> {
        const ACTION: &str = "delete_row";
        self.check_allowed(ACTION)?;
        let mut conn = self.lock();
        let run = |conn: &mut Connection| -> SqlResult<ActionResult> {
            require_filter(ACTION, filter)?;
            let tx = conn.transaction()?;
            let doomed = select(&tx, table, filter)?;
            if doomed.is_empty() {
                return Ok(ActionResult::already(
                    SYSTEM,
                    ACTION,
                    "deleted",
                    fields(json!({"table": table, "rows_affected": 0})),
                ));
            }

            let (where_sql, params) = where_clause(filter, 0);
            let sql = format!("DELETE FROM {}{where_sql}", quote(table));
            let affected = tx.execute(&sql, params_from_iter(params.iter()))?;
            tx.commit()?;

            Ok(ActionResult::mutated(
                SYSTEM,
                ACTION,
                fields(json!({"table": table, "rows_affected": affected})),
                fields(json!({"table": table, "deleted_rows": doomed})),
            ))
        };
        Ok(run(&mut *conn).unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }
}

// ---------------------------------------------------------------------------
// SQL helpers
// ---------------------------------------------------------------------------

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn require_filter(action: &str, filter: &Row) -> SqlResult<()> {
    if filter.is_empty() {
        Err(SqlError::Refused(format!("{action} refuses an empty where clause")))
    } else {
        Ok(())
    }
}

/// `WHERE "a" = ?n AND "b" IS NULL`, numbering placeholders after `offset`.
fn where_clause(filter: &Row, offset: usize) -> (String, Vec<SqlValue>) {
    if filter.is_empty() {
        return (String::new(), Vec::new());
    }
    let mut terms = Vec::with_capacity(filter.len());
    let mut params = Vec::new();
    for (column, value) in filter {
        if value.is_null() {
            terms.push(format!("{} IS NULL", quote(column)));
        } else {
            params.push(to_sql(value));
            terms.push(format!("{} = ?{}", quote(column), offset + params.len()));
        }
    }
    (format!(" WHERE {}", terms.join(" AND ")), params)
}

fn assignments(data: &Row) -> (String, Vec<SqlValue>) {
    let sql = data
        .keys()
        .enumerate()
        .map(|(i, column)| format!("{} = ?{}", quote(column), i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    (sql, data.values().map(to_sql).collect())
}

fn select(conn: &Connection, table: &str, filter: &Row) -> SqlResult<Vec<Row>> {
    let (where_sql, params) = where_clause(filter, 0);
    let sql = format!("SELECT * FROM {}{where_sql}", quote(table));
    query_rows(conn, &sql, &params)
}

fn query_rows(conn: &Connection, sql: &str, params: &[SqlValue]) -> SqlResult<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Map::new();
        for (i, column) in columns.iter().enumerate() {
            map.insert(column.clone(), from_sql(row.get_ref(i)?));
        }
        out.push(map);
    }
    Ok(out)
}

/// Primary-key columns in key order. Empty for tables without a declared key.
fn primary_key(conn: &Connection, table: &str) -> SqlResult<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk")?;
    let names = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

fn existing_by_key(conn: &Connection, table: &str, pk: &[String], data: &Row) -> SqlResult<Option<Row>> {
    if pk.is_empty() || !pk.iter().all(|c| data.get(c).is_some_and(|v| !v.is_null())) {
        return Ok(None);
    }
    let key: Row = pk.iter().map(|c| (c.clone(), data[c.as_str()].clone())).collect();
    Ok(select(conn, table, &key)?.into_iter().next())
}

/// Columns that identify `row`: the primary key when there is one, every
/// non-null column otherwise.
fn row_key(pk: &[String], row: &Row) -> Row {
    if pk.is_empty() {
        row.iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(c, v)| (c.clone(), v.clone()))
            .collect()
    } else {
        pk.iter()
            .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
            .collect()
    }
}

fn holds(row: &Row, data: &Row) -> bool {
    data.iter()
        .all(|(column, want)| row.get(column).map(to_sql) == Some(to_sql(want)))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Object(map) => match blob_bytes(map) {
            Some(bytes) => SqlValue::Blob(bytes),
            None => SqlValue::Text(value.to_string()),
        },
        other => SqlValue::Text(other.to_string()),
    }
}

fn blob_bytes(map: &Map<String, Value>) -> Option<Vec<u8>> {
    if map.len() != 1 {
        return None;
    }
    hex::decode(map.get(BLOB_TAG)?.as_str()?).ok()
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            let mut tagged = Map::new();
            tagged.insert(BLOB_TAG.to_string(), Value::String(hex::encode(bytes)));
            Value::Object(tagged)
        }
    }
}

// ---------------------------------------------------------------------------
// Dynamic dispatch
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SelectArgs {
    table: String,
    #[serde(default, rename = "where")]
    filter: Row,
}

#[derive(Deserialize)]
struct InsertArgs {
    table: String,
    data: Row,
}

#[derive(Deserialize)]
struct UpdateArgs {
    table: String,
    data: Row,
    #[serde(default, rename = "where")]
    filter: Row,
}

#[derive(Deserialize)]
struct DeleteArgs {
    table: String,
    #[serde(default, rename = "where")]
    filter: Row,
}

impl Connector for SqliteConnector {
    fn system(&self) -> &'static str {
        SYSTEM
    }

    fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    fn is_read_only(&self, action: &str) -> bool {
        action == "select_rows"
    }

    fn invoke(&self, action: &str, args: &Value) -> Result<ActionResult> {
        self.check_allowed(action)?;
        match action {
            "select_rows" => {
                let a: SelectArgs = parse_args(SYSTEM, action, args)?;
                self.select_rows(&a.table, &a.filter)
            }
            "insert_row" => {
                let a: InsertArgs = parse_args(SYSTEM, action, args)?;
                self.insert_row(&a.table, &a.data)
            }
            "update_row" => {
                let a: UpdateArgs = parse_args(SYSTEM, action, args)?;
                self.update_row(&a.table, &a.data, &a.filter)
            }
            "delete_row" => {
                let a: DeleteArgs = parse_args(SYSTEM, action, args)?;
                self.delete_row(&a.table, &a.filter)
            }
            other => Err(unknown_action(SYSTEM, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ALREADY_DONE, NOT_DONE};

    fn db() -> SqliteConnector {
        let db = SqliteConnector::open_in_memory(Some(ACTIONS.iter().map(|a| a.to_string()).collect())).unwrap();
        db.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL, role TEXT);
             INSERT INTO users (id, email, role) VALUES (1, 'a@example.com', 'viewer');
             INSERT INTO users (id, email, role) VALUES (2, 'b@example.com', 'viewer');
             CREATE TABLE notes (body TEXT, author TEXT);",
        )
        .unwrap();
        db
    }

    fn row(value: Value) -> Row {
        fields(value)
    }

    fn count(db: &SqliteConnector, table: &str) -> usize {
        let result = db.select_rows(table, &Row::new()).unwrap();
        result.output["count"].as_u64().unwrap() as usize
    }

    #[test]
    fn insert_twice_inserts_once() {
        let db = db();
        let data = row(json!({"id": 3, "email": "c@example.com"}));

        let first = db.insert_row("users", &data).unwrap();
        assert!(first.success);
        assert_eq!(first.output[ALREADY_DONE], NOT_DONE);
        assert_eq!(first.rollback_data["key"], json!({"id": 3}));

        let second = db.insert_row("users", &data).unwrap();
        assert_eq!(second.already_done(), Some("inserted"));
        assert!(second.rollback_data.is_empty());
        assert_eq!(count(&db, "users"), 3);
    }

    #[test]
    fn generated_key_is_resolved_from_returning() {
        let db = db();
        let result = db
            .insert_row("users", &row(json!({"email": "new@example.com"})))
            .unwrap();
        assert!(result.success);
        assert_eq!(result.rollback_data["key"], json!({"id": 3}));
        assert_eq!(result.output["row"]["email"], "new@example.com");
    }

    #[test]
    fn keyless_table_keys_on_non_null_columns() {
        let db = db();
        let result = db.insert_row("notes", &row(json!({"body": "hello"}))).unwrap();
        assert_eq!(result.rollback_data["key"], json!({"body": "hello"}));
    }

    #[test]
    fn update_captures_previous_values() {
        let db = db();
        let result = db
            .update_row("users", &row(json!({"role": "admin"})), &row(json!({"id": 1})))
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output["rows_affected"], 1);
        assert_eq!(
            result.rollback_data["rows"],
            json!([{"key": {"id": 1}, "previous": {"role": "viewer"}}])
        );

        let again = db
            .update_row("users", &row(json!({"role": "admin"})), &row(json!({"id": 1})))
            .unwrap();
        assert_eq!(again.already_done(), Some("updated"));
    }

    #[test]
    fn update_key_follows_changed_primary_key() {
        let db = db();
        let result = db
            .update_row("users", &row(json!({"id": 10})), &row(json!({"id": 2})))
            .unwrap();
        assert_eq!(
            result.rollback_data["rows"],
            json!([{"key": {"id": 10}, "previous": {"id": 2}}])
        );
    }

    #[test]
    fn empty_where_is_refused() {
        let db = db();
        let update = db.update_row("users", &row(json!({"role": "x"})), &Row::new()).unwrap();
        assert!(!update.success);
        assert!(update.error().unwrap().contains("where"));

        let delete = db.delete_row("users", &Row::new()).unwrap();
        assert!(!delete.success);
        assert_eq!(count(&db, "users"), 2);
    }

    #[test]
    fn delete_absent_row_is_already_deleted() {
        let db = db();
        let result = db.delete_row("users", &row(json!({"id": 99}))).unwrap();
        assert!(result.success);
        assert_eq!(result.already_done(), Some("deleted"));
    }

    #[test]
    fn delete_captures_full_rows() {
        let db = db();
        let result = db.delete_row("users", &row(json!({"role": "viewer"}))).unwrap();
        assert_eq!(result.output["rows_affected"], 2);
        let deleted = result.rollback_data["deleted_rows"].as_array().unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(deleted[0]["email"], "a@example.com");
        assert_eq!(count(&db, "users"), 0);
    }

    #[test]
    fn null_filter_uses_is_null() {
        let db = db();
        db.execute_batch("INSERT INTO users (id, email) VALUES (5, 'n@example.com');")
            .unwrap();
        let result = db.select_rows("users", &row(json!({"role": null}))).unwrap();
        assert_eq!(result.output["count"], 1);
        assert!(!result.output.contains_key(ALREADY_DONE));
    }

    #[test]
    fn identifiers_are_quoted() {
        let db = db();
        db.execute_batch(r#"CREATE TABLE "odd ""name""" ("select" TEXT);"#).unwrap();
        let result = db
            .insert_row(r#"odd "name""#, &row(json!({"select": "x"})))
            .unwrap();
        assert!(result.success, "{:?}", result.error());
    }

    #[test]
    fn missing_table_is_a_failure_result() {
        let db = db();
        let result = db.insert_row("nope", &row(json!({"a": 1}))).unwrap();
        assert!(!result.success);
        assert!(result.error().unwrap().contains("nope"));
    }

    #[test]
    fn blobs_are_tagged_and_bind_back_as_blobs() {
        let db = db();
        db.execute_batch(
            "CREATE TABLE files (id INTEGER PRIMARY KEY, body BLOB);
             INSERT INTO files VALUES (1, x'00ff');",
        )
        .unwrap();

        let found = db.select_rows("files", &row(json!({"id": 1}))).unwrap();
        assert_eq!(found.output["rows"][0]["body"], json!({"$blob": "00ff"}));

        // a tagged filter matches the stored BLOB; the hex text does not
        let by_blob = db.select_rows("files", &row(json!({"body": {"$blob": "00ff"}}))).unwrap();
        assert_eq!(by_blob.output["count"], 1);
        let by_text = db.select_rows("files", &row(json!({"body": "00ff"}))).unwrap();
        assert_eq!(by_text.output["count"], 0);
    }

    #[test]
    fn delete_is_not_allowed_by_default() {
        let db = SqliteConnector::open_in_memory(None).unwrap();
        let err = db.invoke("delete_row", &json!({"table": "users", "where": {"id": 1}})).unwrap_err();
        assert!(err.is_not_allowed());
    }
}
