use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

/// Handler bodies return the error envelope as `Err` so they can use `?`.
pub type HandlerResult = Result<Value, Value>;

pub fn finish(req: &Request, result: HandlerResult) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e,
    }
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn bad_params(req: &Request, message: impl Into<String>) -> Value {
    err(&req.id, "bad_params", message, None)
}

pub fn db_error(req: &Request, code: &str, e: impl std::fmt::Display, table: &str) -> Value {
    err(&req.id, code, e.to_string(), Some(json!({ "table": table })))
}

pub fn not_found(req: &Request, what: &str) -> Value {
    err(&req.id, "not_found", format!("{} not found", what), None)
}

/// Non-empty trimmed string param.
pub fn required_str(req: &Request, key: &str) -> Result<String, Value> {
    let Some(raw) = req.params.get(key).and_then(|v| v.as_str()) else {
        return Err(bad_params(req, format!("missing {}", key)));
    };
    let t = raw.trim();
    if t.is_empty() {
        return Err(bad_params(req, format!("{} must not be empty", key)));
    }
    Ok(t.to_string())
}

/// Absent, null and blank all read as `None`.
pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(bad_params(req, format!("{} must be string or null", key)));
            };
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
    }
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, Value> {
    match req.params.get(key) {
        None => Err(bad_params(req, format!("missing {}", key))),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| bad_params(req, format!("{} must be a number", key))),
    }
}

pub fn optional_bool(req: &Request, key: &str) -> Result<Option<bool>, Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| bad_params(req, format!("{} must be boolean", key))),
    }
}

pub fn require_row(
    conn: &Connection,
    req: &Request,
    table: &str,
    id: &str,
    what: &str,
) -> Result<(), Value> {
    match crate::db::row_exists(conn, table, id) {
        Ok(true) => Ok(()),
        Ok(false) => Err(not_found(req, what)),
        Err(e) => Err(db_error(req, "db_query_failed", e, table)),
    }
}

pub fn count(conn: &Connection, req: &Request, sql: &str, id: &str) -> Result<i64, Value> {
    conn.query_row(sql, [id], |r| r.get(0))
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}
