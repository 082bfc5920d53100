use crate::db;
use crate::ipc::error::err;
use crate::ipc::helpers::{
    bad_params, count, db_conn, db_error, finish, not_found, optional_str, require_row,
    required_str, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STUDENT_SELECT: &str = "SELECT s.id, s.person_id, s.name, s.class_label, s.department_id,
        d.code, d.name, s.created_at,
        (SELECT COUNT(*) FROM scores sc WHERE sc.student_id = s.id)
 FROM students s
 JOIN departments d ON d.id = s.department_id";

fn student_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "personId": r.get::<_, String>(1)?,
        "name": r.get::<_, String>(2)?,
        "classLabel": r.get::<_, String>(3)?,
        "departmentId": r.get::<_, String>(4)?,
        "department": { "code": r.get::<_, String>(5)?, "name": r.get::<_, String>(6)? },
        "createdAt": r.get::<_, String>(7)?,
        "scoreCount": r.get::<_, i64>(8)?,
    }))
}

fn load_student(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let sql = format!("{} WHERE s.id = ?", STUDENT_SELECT);
    conn.query_row(&sql, [student_id], student_row).optional()
}

fn students_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "students": [] }));
    };
    let department_id = optional_str(req, "departmentId")?;

    let mut binds: Vec<Value> = Vec::new();
    let mut sql = STUDENT_SELECT.to_string();
    if let Some(d) = department_id {
        sql.push_str(" WHERE s.department_id = ?");
        binds.push(Value::Text(d));
    }
    sql.push_str(" ORDER BY s.name COLLATE NOCASE, s.person_id");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| db_error(req, "db_query_failed", e, "students"))?;
    let students = stmt
        .query_map(params_from_iter(binds), student_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_error(req, "db_query_failed", e, "students"))?;
    let total = students.len();
    Ok(json!({ "students": students, "total": total }))
}

fn students_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let person_id = required_str(req, "personId")?;
    let name = required_str(req, "name")?;
    let class_label = required_str(req, "classLabel")?;
    let department_id = required_str(req, "departmentId")?;
    require_row(conn, req, "departments", &department_id, "department")?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, person_id, name, class_label, department_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &person_id,
            &name,
            &class_label,
            &department_id,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| db_error(req, "db_insert_failed", e, "students"))?;
    tracing::info!(student_id = %student_id, "student created");

    let student = load_student(conn, &student_id)
        .map_err(|e| db_error(req, "db_query_failed", e, "students"))?;
    Ok(json!({ "studentId": student_id, "student": student }))
}

fn students_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(bad_params(req, "patch must be an object"));
    };
    require_row(conn, req, "students", &student_id, "student")?;

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (k, v) in patch {
        let column = match k.as_str() {
            "personId" => "person_id = ?",
            "name" => "name = ?",
            "classLabel" => "class_label = ?",
            "departmentId" => "department_id = ?",
            _ => return Err(bad_params(req, format!("unknown student field: {}", k))),
        };
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(bad_params(req, format!("{} must be a non-empty string", k)));
        };
        if k == "departmentId" {
            require_row(conn, req, "departments", s, "department")?;
            let scored = count(
                conn,
                req,
                "SELECT COUNT(*) FROM scores WHERE student_id = ?",
                &student_id,
            )?;
            if scored > 0 {
                return Err(err(
                    &req.id,
                    "has_scores",
                    "cannot move a scored student to another department",
                    None,
                ));
            }
        }
        sets.push(column);
        binds.push(Value::Text(s.to_string()));
    }
    if sets.is_empty() {
        return Err(bad_params(req, "patch must not be empty"));
    }
    binds.push(Value::Text(student_id.clone()));

    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, params_from_iter(binds))
        .map_err(|e| db_error(req, "db_update_failed", e, "students"))?;

    let student = load_student(conn, &student_id)
        .map_err(|e| db_error(req, "db_query_failed", e, "students"))?;
    Ok(json!({ "student": student }))
}

fn students_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let exists = load_student(conn, &student_id)
        .map_err(|e| db_error(req, "db_query_failed", e, "students"))?;
    if exists.is_none() {
        return Err(not_found(req, "student"));
    }
    let scored = count(
        conn,
        req,
        "SELECT COUNT(*) FROM scores WHERE student_id = ?",
        &student_id,
    )?;
    if scored > 0 {
        return Err(err(
            &req.id,
            "has_scores",
            format!("student has {} recorded scores", scored),
            Some(json!({ "scoreCount": scored })),
        ));
    }
    conn.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| db_error(req, "db_delete_failed", e, "students"))?;
    tracing::info!(student_id = %student_id, "student deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, req),
        "students.create" => students_create(state, req),
        "students.update" => students_update(state, req),
        "students.delete" => students_delete(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
