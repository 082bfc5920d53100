use crate::auth::{self, Role};
use crate::db::{self, is_constraint_violation};
use crate::ipc::error::err;
use crate::ipc::helpers::{
    db_conn, db_error, finish, not_found, optional_str, require_row, required_str, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ADMIN_SELECT: &str = "SELECT da.id, da.department_id, d.code, d.name,
        u.id, u.name, u.email, da.created_at
 FROM department_admins da
 JOIN users u ON u.id = da.user_id
 JOIN departments d ON d.id = da.department_id";

fn admin_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "departmentId": r.get::<_, String>(1)?,
        "department": { "code": r.get::<_, String>(2)?, "name": r.get::<_, String>(3)? },
        "user": {
            "id": r.get::<_, String>(4)?,
            "name": r.get::<_, String>(5)?,
            "email": r.get::<_, String>(6)?,
        },
        "createdAt": r.get::<_, String>(7)?,
    }))
}

fn load_admin(conn: &Connection, admin_id: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let sql = format!("{} WHERE da.id = ?", ADMIN_SELECT);
    conn.query_row(&sql, [admin_id], admin_row).optional()
}

fn admins_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "admins": [] }));
    };
    let sql = format!("{} ORDER BY da.created_at DESC", ADMIN_SELECT);
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| db_error(req, "db_query_failed", e, "department_admins"))?;
    let admins = stmt
        .query_map([], admin_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_error(req, "db_query_failed", e, "department_admins"))?;
    let total = admins.len();
    Ok(json!({ "admins": admins, "total": total }))
}

fn admins_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let name = required_str(req, "name")?;
    let email = required_str(req, "email")?;
    let password = required_str(req, "password")?;
    let department_id = required_str(req, "departmentId")?;
    require_row(conn, req, "departments", &department_id, "department")?;

    let taken = auth::email_taken(conn, &email, None)
        .map_err(|e| db_error(req, "db_query_failed", e, "users"))?;
    if taken {
        return Err(err(&req.id, "conflict", "email already registered", None));
    }

    let password_hash = auth::hash_password(&password)
        .map_err(|e| err(&req.id, "hash_failed", e.to_string(), None))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    let user_id = auth::create_user(&tx, &name, &email, &password_hash, Role::DepartmentAdmin)
        .map_err(|e| db_error(req, "db_insert_failed", e, "users"))?;
    let admin_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO department_admins(id, user_id, department_id, created_at)
         VALUES(?, ?, ?, ?)",
        (&admin_id, &user_id, &department_id, db::now_rfc3339()),
    )
    .map_err(|e| db_error(req, "db_insert_failed", e, "department_admins"))?;
    tx.commit()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    tracing::info!(admin_id = %admin_id, user_id = %user_id, "department admin created");

    let admin = load_admin(conn, &admin_id)
        .map_err(|e| db_error(req, "db_query_failed", e, "department_admins"))?;
    Ok(json!({ "admin": admin }))
}

fn admins_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let admin_id = required_str(req, "adminId")?;
    let user_id: Option<String> = conn
        .query_row(
            "SELECT user_id FROM department_admins WHERE id = ?",
            [&admin_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_error(req, "db_query_failed", e, "department_admins"))?;
    let Some(user_id) = user_id else {
        return Err(not_found(req, "admin"));
    };

    let name = optional_str(req, "name")?;
    let email = optional_str(req, "email")?;
    // Blank password leaves the current one in place.
    let password = optional_str(req, "password")?;
    let department_id = optional_str(req, "departmentId")?;
    if let Some(d) = &department_id {
        require_row(conn, req, "departments", d, "department")?;
    }
    if let Some(e) = &email {
        let taken = auth::email_taken(conn, e, Some(&user_id))
            .map_err(|e| db_error(req, "db_query_failed", e, "users"))?;
        if taken {
            return Err(err(&req.id, "conflict", "email already in use", None));
        }
    }

    let password_hash = password
        .as_deref()
        .map(auth::hash_password)
        .transpose()
        .map_err(|e| err(&req.id, "hash_failed", e.to_string(), None))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    let now = db::now_rfc3339();
    let result = (|| -> rusqlite::Result<()> {
        if let Some(n) = &name {
            tx.execute(
                "UPDATE users SET name = ?, updated_at = ? WHERE id = ?",
                (n, &now, &user_id),
            )?;
        }
        if let Some(e) = &email {
            tx.execute(
                "UPDATE users SET email = ?, updated_at = ? WHERE id = ?",
                (e, &now, &user_id),
            )?;
        }
        if let Some(h) = &password_hash {
            tx.execute(
                "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?",
                (h, &now, &user_id),
            )?;
        }
        if let Some(d) = &department_id {
            tx.execute(
                "UPDATE department_admins SET department_id = ? WHERE id = ?",
                (d, &admin_id),
            )?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        let _ = tx.rollback();
        if is_constraint_violation(&e) {
            return Err(err(&req.id, "conflict", "email already in use", None));
        }
        return Err(db_error(req, "db_update_failed", e, "users"));
    }
    tx.commit()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;

    let admin = load_admin(conn, &admin_id)
        .map_err(|e| db_error(req, "db_query_failed", e, "department_admins"))?;
    Ok(json!({ "admin": admin }))
}

fn admins_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let admin_id = required_str(req, "adminId")?;
    let user_id: Option<String> = conn
        .query_row(
            "SELECT user_id FROM department_admins WHERE id = ?",
            [&admin_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_error(req, "db_query_failed", e, "department_admins"))?;
    let Some(user_id) = user_id else {
        return Err(not_found(req, "admin"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    if let Err(e) = tx.execute("DELETE FROM department_admins WHERE id = ?", [&admin_id]) {
        let _ = tx.rollback();
        return Err(db_error(req, "db_delete_failed", e, "department_admins"));
    }
    if let Err(e) = tx.execute("DELETE FROM users WHERE id = ?", [&user_id]) {
        let _ = tx.rollback();
        return Err(db_error(req, "db_delete_failed", e, "users"));
    }
    tx.commit()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    tracing::info!(admin_id = %admin_id, "department admin deleted");
    Ok(json!({ "deleted": true }))
}

fn admins_mine(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let user_id = required_str(req, "userId")?;
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT d.id, d.code, d.name
             FROM department_admins da
             JOIN departments d ON d.id = da.department_id
             WHERE da.user_id = ?",
            [&user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| db_error(req, "db_query_failed", e, "department_admins"))?;
    let Some((id, code, name)) = row else {
        return Err(not_found(req, "department admin"));
    };
    Ok(json!({
        "departmentId": id,
        "department": { "id": id, "code": code, "name": name },
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "departmentAdmins.list" => admins_list(state, req),
        "departmentAdmins.create" => admins_create(state, req),
        "departmentAdmins.update" => admins_update(state, req),
        "departmentAdmins.delete" => admins_delete(state, req),
        "departmentAdmins.mine" => admins_mine(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
