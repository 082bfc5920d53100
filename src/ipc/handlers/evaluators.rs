use crate::auth::{self, Role};
use crate::db::{self, is_constraint_violation};
use crate::ipc::error::err;
use crate::ipc::helpers::{
    bad_params, count, db_conn, db_error, finish, not_found, optional_bool, optional_str,
    require_row, required_str, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvaluatorKind {
    Internal,
    External,
}

impl EvaluatorKind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "internal" => Some(Self::Internal),
            "external" => Some(Self::External),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
        }
    }
}

const EVALUATOR_SELECT: &str = "SELECT ev.id, ev.name, ev.kind, ev.institution, ev.department_id,
        d.code, d.name, ev.user_id, u.email, ev.created_at,
        (SELECT COUNT(*) FROM scores sc WHERE sc.evaluator_id = ev.id)
 FROM evaluators ev
 JOIN departments d ON d.id = ev.department_id
 LEFT JOIN users u ON u.id = ev.user_id";

fn evaluator_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let user_id: Option<String> = r.get(7)?;
    let email: Option<String> = r.get(8)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "kind": r.get::<_, String>(2)?,
        "institution": r.get::<_, Option<String>>(3)?,
        "departmentId": r.get::<_, String>(4)?,
        "department": { "code": r.get::<_, String>(5)?, "name": r.get::<_, String>(6)? },
        "user": user_id.map(|id| json!({ "id": id, "email": email })),
        "createdAt": r.get::<_, String>(9)?,
        "scoreCount": r.get::<_, i64>(10)?,
    }))
}

fn load_evaluator(conn: &Connection, evaluator_id: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let sql = format!("{} WHERE ev.id = ?", EVALUATOR_SELECT);
    conn.query_row(&sql, [evaluator_id], evaluator_row).optional()
}

struct EvaluatorInput {
    name: String,
    kind: EvaluatorKind,
    institution: Option<String>,
    department_id: String,
}

fn parse_input(conn: &Connection, req: &Request) -> Result<EvaluatorInput, serde_json::Value> {
    let name = required_str(req, "name")?;
    let kind_raw = required_str(req, "kind")?;
    let Some(kind) = EvaluatorKind::parse(&kind_raw) else {
        return Err(bad_params(req, "kind must be one of: internal, external"));
    };
    let institution = optional_str(req, "institution")?;
    if kind == EvaluatorKind::External && institution.is_none() {
        return Err(bad_params(req, "institution is required for external evaluators"));
    }
    let department_id = required_str(req, "departmentId")?;
    require_row(conn, req, "departments", &department_id, "department")?;
    Ok(EvaluatorInput {
        name,
        kind,
        // Internal evaluators never carry an institution.
        institution: if kind == EvaluatorKind::External {
            institution
        } else {
            None
        },
        department_id,
    })
}

fn evaluators_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "evaluators": [] }));
    };
    let department_id = optional_str(req, "departmentId")?;

    let mut binds: Vec<Value> = Vec::new();
    let mut sql = EVALUATOR_SELECT.to_string();
    if let Some(d) = department_id {
        sql.push_str(" WHERE ev.department_id = ?");
        binds.push(Value::Text(d));
    }
    sql.push_str(" ORDER BY ev.created_at DESC");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| db_error(req, "db_query_failed", e, "evaluators"))?;
    let evaluators = stmt
        .query_map(params_from_iter(binds), evaluator_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_error(req, "db_query_failed", e, "evaluators"))?;
    tracing::debug!(count = evaluators.len(), "evaluators listed");
    let total = evaluators.len();
    Ok(json!({ "evaluators": evaluators, "total": total }))
}

fn evaluators_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let input = parse_input(conn, req)?;
    let email = required_str(req, "email")?;
    let password = required_str(req, "password")?;

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
    let user_id = auth::create_user(&tx, &input.name, &email, &password_hash, Role::Evaluator)
        .map_err(|e| db_error(req, "db_insert_failed", e, "users"))?;
    let evaluator_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO evaluators(id, name, kind, institution, department_id, user_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &evaluator_id,
            &input.name,
            input.kind.as_str(),
            &input.institution,
            &input.department_id,
            &user_id,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| db_error(req, "db_insert_failed", e, "evaluators"))?;
    tx.commit()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    tracing::info!(evaluator_id = %evaluator_id, kind = input.kind.as_str(), "evaluator created");

    let evaluator = load_evaluator(conn, &evaluator_id)
        .map_err(|e| db_error(req, "db_query_failed", e, "evaluators"))?;
    Ok(json!({ "evaluator": evaluator }))
}

fn evaluators_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let evaluator_id = required_str(req, "evaluatorId")?;
    let user_id: Option<Option<String>> = conn
        .query_row(
            "SELECT user_id FROM evaluators WHERE id = ?",
            [&evaluator_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_error(req, "db_query_failed", e, "evaluators"))?;
    let Some(user_id) = user_id else {
        return Err(not_found(req, "evaluator"));
    };
    let input = parse_input(conn, req)?;
    let email = optional_str(req, "email")?;
    let password = optional_str(req, "password")?;

    if let Some(e) = &email {
        let taken = auth::email_taken(conn, e, user_id.as_deref())
            .map_err(|e| db_error(req, "db_query_failed", e, "users"))?;
        if taken {
            return Err(err(&req.id, "conflict", "email already registered", None));
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
    let result = (|| -> rusqlite::Result<Option<String>> {
        let mut linked = user_id.clone();
        match (&user_id, &email, &password_hash) {
            (Some(uid), e, p) => {
                if let Some(e) = e {
                    tx.execute(
                        "UPDATE users SET email = ?, updated_at = ? WHERE id = ?",
                        (e, &now, uid),
                    )?;
                }
                if let Some(p) = p {
                    tx.execute(
                        "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?",
                        (p, &now, uid),
                    )?;
                }
                tx.execute(
                    "UPDATE users SET name = ?, updated_at = ? WHERE id = ?",
                    (&input.name, &now, uid),
                )?;
            }
            // No account yet: create one only when both credentials are supplied.
            (None, Some(e), Some(p)) => {
                linked = Some(auth::create_user(&tx, &input.name, e, p, Role::Evaluator)?);
            }
            (None, _, _) => {}
        }
        tx.execute(
            "UPDATE evaluators
             SET name = ?, kind = ?, institution = ?, department_id = ?, user_id = ?
             WHERE id = ?",
            (
                &input.name,
                input.kind.as_str(),
                &input.institution,
                &input.department_id,
                &linked,
                &evaluator_id,
            ),
        )?;
        Ok(linked)
    })();
    if let Err(e) = result {
        let _ = tx.rollback();
        if is_constraint_violation(&e) {
            return Err(err(&req.id, "conflict", "email already registered", None));
        }
        return Err(db_error(req, "db_update_failed", e, "evaluators"));
    }
    tx.commit()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;

    let evaluator = load_evaluator(conn, &evaluator_id)
        .map_err(|e| db_error(req, "db_query_failed", e, "evaluators"))?;
    Ok(json!({ "evaluator": evaluator }))
}

fn evaluators_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let evaluator_id = required_str(req, "evaluatorId")?;
    let force = optional_bool(req, "force")?.unwrap_or(false);

    let user_id: Option<Option<String>> = conn
        .query_row(
            "SELECT user_id FROM evaluators WHERE id = ?",
            [&evaluator_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_error(req, "db_query_failed", e, "evaluators"))?;
    let Some(user_id) = user_id else {
        return Err(not_found(req, "evaluator"));
    };

    let score_count = count(
        conn,
        req,
        "SELECT COUNT(*) FROM scores WHERE evaluator_id = ?",
        &evaluator_id,
    )?;
    if score_count > 0 && !force {
        return Err(err(
            &req.id,
            "has_scores",
            format!("evaluator has {} recorded scores", score_count),
            Some(json!({ "scoreCount": score_count })),
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    if let Err(e) = tx.execute("DELETE FROM scores WHERE evaluator_id = ?", [&evaluator_id]) {
        let _ = tx.rollback();
        return Err(db_error(req, "db_delete_failed", e, "scores"));
    }
    if let Err(e) = tx.execute("DELETE FROM evaluators WHERE id = ?", [&evaluator_id]) {
        let _ = tx.rollback();
        return Err(db_error(req, "db_delete_failed", e, "evaluators"));
    }
    if let Some(uid) = &user_id {
        if let Err(e) = tx.execute("DELETE FROM users WHERE id = ?", [uid]) {
            let _ = tx.rollback();
            return Err(db_error(req, "db_delete_failed", e, "users"));
        }
    }
    tx.commit()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    tracing::info!(evaluator_id = %evaluator_id, score_count, force, "evaluator deleted");

    Ok(json!({
        "deleted": true,
        "scoresDeleted": score_count,
        "userDeleted": user_id.is_some(),
    }))
}

fn evaluators_mine(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let user_id = required_str(req, "userId")?;
    let sql = format!("{} WHERE ev.user_id = ?", EVALUATOR_SELECT);
    let evaluator = conn
        .query_row(&sql, [&user_id], evaluator_row)
        .optional()
        .map_err(|e| db_error(req, "db_query_failed", e, "evaluators"))?;
    let Some(evaluator) = evaluator else {
        return Err(not_found(req, "evaluator"));
    };
    Ok(json!({ "evaluator": evaluator }))
}

fn evaluators_dashboard(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let evaluator_id = required_str(req, "evaluatorId")?;
    let department_id: Option<String> = conn
        .query_row(
            "SELECT department_id FROM evaluators WHERE id = ?",
            [&evaluator_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_error(req, "db_query_failed", e, "evaluators"))?;
    let Some(department_id) = department_id else {
        return Err(not_found(req, "evaluator"));
    };

    let total_scores = count(
        conn,
        req,
        "SELECT COUNT(*) FROM scores WHERE evaluator_id = ?",
        &evaluator_id,
    )?;
    let assessed = count(
        conn,
        req,
        "SELECT COUNT(DISTINCT student_id) FROM scores WHERE evaluator_id = ?",
        &evaluator_id,
    )?;
    let department_students = count(
        conn,
        req,
        "SELECT COUNT(*) FROM students WHERE department_id = ?",
        &department_id,
    )?;

    Ok(json!({
        "studentsPending": (department_students - assessed).max(0),
        "studentsAssessed": assessed,
        "totalScores": total_scores,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "evaluators.list" => evaluators_list(state, req),
        "evaluators.create" => evaluators_create(state, req),
        "evaluators.update" => evaluators_update(state, req),
        "evaluators.delete" => evaluators_delete(state, req),
        "evaluators.mine" => evaluators_mine(state, req),
        "evaluators.dashboard" => evaluators_dashboard(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
