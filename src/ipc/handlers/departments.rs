use crate::db::{self, is_constraint_violation};
use crate::ipc::error::err;
use crate::ipc::helpers::{
    db_conn, db_error, finish, require_row, required_str, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn duplicate(req: &Request) -> serde_json::Value {
    err(
        &req.id,
        "conflict",
        "department code or name already exists",
        None,
    )
}

fn departments_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "departments": [] }));
    };

    let mut stmt = conn
        .prepare(
            "SELECT
               d.id,
               d.code,
               d.name,
               d.created_at,
               (SELECT COUNT(*) FROM students s WHERE s.department_id = d.id),
               (SELECT COUNT(*) FROM evaluators e WHERE e.department_id = d.id),
               (SELECT COUNT(*) FROM aspects a WHERE a.department_id = d.id)
             FROM departments d
             ORDER BY d.created_at DESC, d.code",
        )
        .map_err(|e| db_error(req, "db_query_failed", e, "departments"))?;
    let departments = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "createdAt": r.get::<_, String>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
                "evaluatorCount": r.get::<_, i64>(5)?,
                "aspectCount": r.get::<_, i64>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_error(req, "db_query_failed", e, "departments"))?;

    let total = departments.len();
    Ok(json!({ "departments": departments, "total": total }))
}

fn departments_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let name = required_str(req, "name")?;
    let code = required_str(req, "code")?.to_uppercase();

    let id = Uuid::new_v4().to_string();
    let created_at = db::now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO departments(id, code, name, created_at) VALUES(?, ?, ?, ?)",
        (&id, &code, &name, &created_at),
    ) {
        if is_constraint_violation(&e) {
            return Err(duplicate(req));
        }
        return Err(db_error(req, "db_insert_failed", e, "departments"));
    }
    tracing::info!(department_id = %id, %code, "department created");

    Ok(json!({
        "department": { "id": id, "code": code, "name": name, "createdAt": created_at }
    }))
}

fn departments_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let department_id = required_str(req, "departmentId")?;
    let name = required_str(req, "name")?;
    let code = required_str(req, "code")?.to_uppercase();
    require_row(conn, req, "departments", &department_id, "department")?;

    if let Err(e) = conn.execute(
        "UPDATE departments SET code = ?, name = ? WHERE id = ?",
        (&code, &name, &department_id),
    ) {
        if is_constraint_violation(&e) {
            return Err(duplicate(req));
        }
        return Err(db_error(req, "db_update_failed", e, "departments"));
    }

    Ok(json!({
        "department": { "id": department_id, "code": code, "name": name }
    }))
}

fn departments_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let department_id = required_str(req, "departmentId")?;
    require_row(conn, req, "departments", &department_id, "department")?;

    let refs: (i64, i64, i64, i64) = conn
        .query_row(
            "SELECT
               (SELECT COUNT(*) FROM students WHERE department_id = ?1),
               (SELECT COUNT(*) FROM evaluators WHERE department_id = ?1),
               (SELECT COUNT(*) FROM department_admins WHERE department_id = ?1),
               (SELECT COUNT(*) FROM aspects WHERE department_id = ?1)",
            [&department_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .map_err(|e| db_error(req, "db_query_failed", e, "departments"))?;
    let (students, evaluators, admins, aspects) = refs;
    if students + evaluators + admins + aspects > 0 {
        return Err(err(
            &req.id,
            "conflict",
            "department still has linked students, evaluators, admins or aspects",
            Some(json!({
                "students": students,
                "evaluators": evaluators,
                "admins": admins,
                "aspects": aspects,
            })),
        ));
    }

    conn.execute("DELETE FROM departments WHERE id = ?", [&department_id])
        .map_err(|e| db_error(req, "db_delete_failed", e, "departments"))?;
    tracing::info!(department_id = %department_id, "department deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "departments.list" => departments_list(state, req),
        "departments.create" => departments_create(state, req),
        "departments.update" => departments_update(state, req),
        "departments.delete" => departments_delete(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
