use crate::ipc::error::err;
use crate::ipc::helpers::{
    bad_params, db_conn, db_error, finish, not_found, require_row, required_f64, required_str,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

struct CriterionInput {
    name: String,
    min_score: f64,
    max_score: f64,
    description: String,
}

fn parse_criterion(req: &Request) -> Result<CriterionInput, serde_json::Value> {
    let name = required_str(req, "name")?;
    let min_score = required_f64(req, "minScore")?;
    let max_score = required_f64(req, "maxScore")?;
    let description = required_str(req, "description")?;
    if !(0.0..=100.0).contains(&min_score) || !(0.0..=100.0).contains(&max_score) {
        return Err(bad_params(req, "minScore and maxScore must be in 0..=100"));
    }
    if min_score > max_score {
        return Err(bad_params(req, "minScore must not exceed maxScore"));
    }
    Ok(CriterionInput {
        name,
        min_score,
        max_score,
        description,
    })
}

fn criteria_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "criteria": [] }));
    };
    let mut stmt = conn
        .prepare(
            "SELECT id, name, min_score, max_score, description
             FROM criteria
             ORDER BY min_score, max_score, name",
        )
        .map_err(|e| db_error(req, "db_query_failed", e, "criteria"))?;
    let criteria = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "minScore": r.get::<_, f64>(2)?,
                "maxScore": r.get::<_, f64>(3)?,
                "description": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_error(req, "db_query_failed", e, "criteria"))?;
    Ok(json!({ "criteria": criteria }))
}

fn criteria_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let c = parse_criterion(req)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO criteria(id, name, min_score, max_score, description) VALUES(?, ?, ?, ?, ?)",
        (&id, &c.name, c.min_score, c.max_score, &c.description),
    )
    .map_err(|e| db_error(req, "db_insert_failed", e, "criteria"))?;
    tracing::info!(criterion_id = %id, name = %c.name, "criterion created");
    Ok(json!({
        "criterion": {
            "id": id,
            "name": c.name,
            "minScore": c.min_score,
            "maxScore": c.max_score,
            "description": c.description,
        }
    }))
}

fn criteria_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let criterion_id = required_str(req, "criterionId")?;
    let c = parse_criterion(req)?;
    let changed = conn
        .execute(
            "UPDATE criteria SET name = ?, min_score = ?, max_score = ?, description = ?
             WHERE id = ?",
            (&c.name, c.min_score, c.max_score, &c.description, &criterion_id),
        )
        .map_err(|e| db_error(req, "db_update_failed", e, "criteria"))?;
    if changed == 0 {
        return Err(not_found(req, "criterion"));
    }
    Ok(json!({
        "criterion": {
            "id": criterion_id,
            "name": c.name,
            "minScore": c.min_score,
            "maxScore": c.max_score,
            "description": c.description,
        }
    }))
}

fn criteria_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let criterion_id = required_str(req, "criterionId")?;
    require_row(conn, req, "criteria", &criterion_id, "criterion")?;
    conn.execute("DELETE FROM criteria WHERE id = ?", [&criterion_id])
        .map_err(|e| err(&req.id, "db_delete_failed", e.to_string(), None))?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "criteria.list" => criteria_list(state, req),
        "criteria.create" => criteria_create(state, req),
        "criteria.update" => criteria_update(state, req),
        "criteria.delete" => criteria_delete(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
