use crate::auth::{self, Role};
use crate::db;
use crate::ipc::error::err;
use crate::ipc::helpers::{bad_params, db_conn, db_error, finish, optional_str, HandlerResult};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

const SEED_ADMIN_EMAIL: &str = "superadmin@ukk.id";
const SEED_ADMIN_PASSWORD: &str = "demo123";

/// Default qualitative bands: (name, min, max, description).
const SEED_CRITERIA: [(&str, f64, f64, &str); 5] = [
    (
        "Sangat Baik",
        85.0,
        100.0,
        "Memenuhi semua kriteria dengan sangat baik",
    ),
    (
        "Baik",
        70.0,
        84.0,
        "Memenuhi sebagian besar kriteria dengan baik",
    ),
    ("Cukup", 55.0, 69.0, "Memenuhi kriteria dengan cukup"),
    ("Kurang", 40.0, 54.0, "Memenuhi kriteria dengan kurang"),
    ("Sangat Kurang", 0.0, 39.0, "Tidak memenuhi kriteria"),
];

fn health(state: &mut AppState, _req: &Request) -> HandlerResult {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
    }))
}

fn workspace_select(state: &mut AppState, req: &Request) -> HandlerResult {
    let Some(path) = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
    else {
        return Err(bad_params(req, "missing params.path"));
    };

    let conn = db::open_db(&path)
        .map_err(|e| err(&req.id, "db_open_failed", format!("{e:?}"), None))?;
    tracing::info!(workspace = %path.display(), "workspace opened");
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

fn seed(conn: &Connection, admin_password: &str) -> anyhow::Result<(usize, bool)> {
    let tx = conn.unchecked_transaction()?;

    let mut criteria_inserted = 0;
    for (name, min, max, description) in SEED_CRITERIA {
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM criteria WHERE lower(name) = lower(?)",
            [name],
            |r| r.get(0),
        )?;
        if exists > 0 {
            continue;
        }
        tx.execute(
            "INSERT INTO criteria(id, name, min_score, max_score, description)
             VALUES(?, ?, ?, ?, ?)",
            (Uuid::new_v4().to_string(), name, min, max, description),
        )?;
        criteria_inserted += 1;
    }

    let admin_created = if auth::email_taken(&tx, SEED_ADMIN_EMAIL, None)? {
        false
    } else {
        let password_hash = auth::hash_password(admin_password)?;
        auth::create_user(
            &tx,
            "Superadmin",
            SEED_ADMIN_EMAIL,
            &password_hash,
            Role::Superadmin,
        )?;
        true
    };

    tx.commit()?;
    Ok((criteria_inserted, admin_created))
}

fn workspace_seed(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let password =
        optional_str(req, "adminPassword")?.unwrap_or_else(|| SEED_ADMIN_PASSWORD.to_string());
    let (criteria_inserted, admin_created) =
        seed(conn, &password).map_err(|e| db_error(req, "db_insert_failed", e, "criteria"))?;
    tracing::info!(criteria_inserted, admin_created, "workspace seeded");
    Ok(json!({
        "criteriaInserted": criteria_inserted,
        "adminCreated": admin_created,
        "adminEmail": SEED_ADMIN_EMAIL,
    }))
}

fn dashboard_summary(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let row = conn
        .query_row(
            "SELECT
               (SELECT COUNT(*) FROM departments),
               (SELECT COUNT(*) FROM students),
               (SELECT COUNT(*) FROM evaluators),
               (SELECT COUNT(*) FROM aspects),
               (SELECT COUNT(*) FROM criteria),
               (SELECT COUNT(DISTINCT student_id) FROM scores)",
            [],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            },
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let (departments, students, evaluators, aspects, criteria, assessed) = row;
    Ok(json!({
        "departmentCount": departments,
        "studentCount": students,
        "evaluatorCount": evaluators,
        "aspectCount": aspects,
        "criterionCount": criteria,
        "assessedStudentCount": assessed,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "health" => health(state, req),
        "workspace.select" => workspace_select(state, req),
        "workspace.seed" => workspace_seed(state, req),
        "dashboard.summary" => dashboard_summary(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
