use crate::calc::{self, AggregateMode, CriterionRange, ScoreEntry};
use crate::config;
use crate::db;
use crate::ipc::error::{calc_err, err};
use crate::ipc::helpers::{
    bad_params, db_conn, db_error, finish, not_found, optional_bool, optional_str, require_row,
    required_str, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// `{ elementId: number | null }`
fn parse_score_map(raw: Option<&serde_json::Value>) -> Result<Vec<(String, Option<f64>)>, String> {
    let Some(obj) = raw.and_then(|v| v.as_object()) else {
        return Err("scores must be an object".into());
    };
    let mut out = Vec::with_capacity(obj.len());
    for (element_id, v) in obj {
        let value = if v.is_null() {
            None
        } else {
            let n = v
                .as_f64()
                .ok_or_else(|| format!("scores.{} must be a number or null", element_id))?;
            if !n.is_finite() {
                return Err(format!("scores.{} must be finite", element_id));
            }
            Some(n)
        };
        out.push((element_id.clone(), value));
    }
    Ok(out)
}

fn department_of(
    conn: &Connection,
    req: &Request,
    table: &str,
    id: &str,
    what: &str,
) -> Result<String, serde_json::Value> {
    let sql = format!("SELECT department_id FROM {} WHERE id = ?", table);
    conn.query_row(&sql, [id], |r| r.get::<_, String>(0))
        .optional()
        .map_err(|e| db_error(req, "db_query_failed", e, table))?
        .ok_or_else(|| not_found(req, what))
}

fn assessment_rows(
    conn: &Connection,
    student_id: &str,
    evaluator_id: &str,
) -> rusqlite::Result<Vec<(String, Option<f64>)>> {
    let mut stmt = conn.prepare(
        "SELECT element_id, value FROM scores
         WHERE student_id = ? AND evaluator_id = ?
         ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([student_id, evaluator_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn assessments_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let evaluator_id = required_str(req, "evaluatorId")?;
    department_of(conn, req, "students", &student_id, "student")?;
    department_of(conn, req, "evaluators", &evaluator_id, "evaluator")?;

    let rows = assessment_rows(conn, &student_id, &evaluator_id)
        .map_err(|e| db_error(req, "db_query_failed", e, "scores"))?;
    let mut scores = serde_json::Map::new();
    for (element_id, value) in &rows {
        scores.insert(element_id.clone(), json!(value));
    }
    Ok(json!({
        "studentId": student_id,
        "evaluatorId": evaluator_id,
        "exists": !rows.is_empty(),
        "scores": scores,
    }))
}

fn assessments_submit(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let evaluator_id = required_str(req, "evaluatorId")?;
    let submitted = parse_score_map(req.params.get("scores")).map_err(|m| bad_params(req, m))?;

    let student_department = department_of(conn, req, "students", &student_id, "student")?;
    let evaluator_department = department_of(conn, req, "evaluators", &evaluator_id, "evaluator")?;
    if student_department != evaluator_department {
        return Err(err(
            &req.id,
            "department_mismatch",
            "student and evaluator belong to different departments",
            Some(json!({
                "studentDepartmentId": student_department,
                "evaluatorDepartmentId": evaluator_department,
            })),
        ));
    }

    let form = calc::load_form_aspects(conn, &student_department).map_err(|e| calc_err(&req.id, e))?;
    let elements: Vec<(String, f64)> = form
        .iter()
        .flat_map(|a| a.elements.iter().map(|e| (e.id.clone(), e.weight)))
        .collect();
    if elements.is_empty() {
        return Err(bad_params(req, "department has no elements to assess"));
    }
    let known: HashSet<&str> = elements.iter().map(|(id, _)| id.as_str()).collect();

    let limits = config::assessment_settings(conn)
        .map_err(|e| err(&req.id, "db_query_failed", format!("{e:#}"), None))?;
    let mut values: HashMap<String, Option<f64>> = HashMap::new();
    for (element_id, value) in submitted {
        if !known.contains(element_id.as_str()) {
            return Err(err(
                &req.id,
                "bad_params",
                "element does not belong to the student's department",
                Some(json!({ "elementId": element_id })),
            ));
        }
        if let Some(v) = value {
            if v < limits.score_min || v > limits.score_max {
                return Err(err(
                    &req.id,
                    "bad_params",
                    format!(
                        "score must be between {} and {}",
                        limits.score_min, limits.score_max
                    ),
                    Some(json!({ "elementId": element_id, "value": v })),
                ));
            }
        }
        values.insert(element_id, value);
    }

    let existing: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM scores WHERE student_id = ? AND evaluator_id = ?",
            [&student_id, &evaluator_id],
            |r| r.get(0),
        )
        .map_err(|e| db_error(req, "db_query_failed", e, "scores"))?;
    if existing > 0 && !limits.allow_reassess {
        return Err(err(
            &req.id,
            "already_assessed",
            "this evaluator has already assessed the student",
            Some(json!({ "scoreCount": existing })),
        ));
    }

    // Elements left off the form are stored unscored so they still count as 0.
    let now = db::now_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    let result = (|| -> rusqlite::Result<()> {
        tx.execute(
            "DELETE FROM scores WHERE student_id = ? AND evaluator_id = ?",
            [&student_id, &evaluator_id],
        )?;
        let mut stmt = tx.prepare(
            "INSERT INTO scores(id, student_id, evaluator_id, element_id, value, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
        )?;
        for (element_id, _) in &elements {
            let value = values.get(element_id).copied().flatten();
            stmt.execute((
                Uuid::new_v4().to_string(),
                &student_id,
                &evaluator_id,
                element_id,
                value,
                &now,
            ))?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        let _ = tx.rollback();
        return Err(db_error(req, "db_insert_failed", e, "scores"));
    }
    tx.commit()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    tracing::info!(
        student_id = %student_id,
        evaluator_id = %evaluator_id,
        elements = elements.len(),
        replaced = existing > 0,
        "assessment submitted"
    );

    let scoring = config::scoring_settings(conn)
        .map_err(|e| err(&req.id, "db_query_failed", format!("{e:#}"), None))?;
    let ranges = calc::load_criteria(conn).map_err(|e| calc_err(&req.id, e))?;
    let entries: Vec<ScoreEntry> = elements
        .iter()
        .map(|(id, weight)| ScoreEntry {
            element_id: id.clone(),
            weight: *weight,
            raw_score: values.get(id).copied().flatten(),
        })
        .collect();
    let result = calc::evaluate(&entries, &ranges, scoring.report_mode);

    Ok(json!({
        "studentId": student_id,
        "evaluatorId": evaluator_id,
        "scoreCount": entries.len(),
        "replaced": existing > 0,
        "finalScore": result.final_score,
        "criterion": result.matched_label,
    }))
}

fn assessments_preview(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let department_id = required_str(req, "departmentId")?;
    require_row(conn, req, "departments", &department_id, "department")?;
    let scores = match req.params.get("scores") {
        None => Vec::new(),
        Some(v) if v.is_null() => Vec::new(),
        Some(v) => parse_score_map(Some(v)).map_err(|m| bad_params(req, m))?,
    };
    let mode = AggregateMode {
        weighted: optional_bool(req, "weighted")?.unwrap_or(false),
    };

    let form = calc::load_form_aspects(conn, &department_id).map_err(|e| calc_err(&req.id, e))?;
    let ranges = calc::load_criteria(conn).map_err(|e| calc_err(&req.id, e))?;
    let scores: HashMap<String, Option<f64>> = scores.into_iter().collect();
    let preview = calc::compute_form_preview(&form, &scores, &ranges, mode);
    serde_json::to_value(preview).map_err(|e| err(&req.id, "internal", e.to_string(), None))
}

fn assessments_score_from_criterion(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let criterion_id = required_str(req, "criterionId")?;
    let range: Option<CriterionRange> = conn
        .query_row(
            "SELECT name, min_score, max_score FROM criteria WHERE id = ?",
            [&criterion_id],
            |r| {
                Ok(CriterionRange {
                    label: r.get(0)?,
                    min_score: r.get(1)?,
                    max_score: r.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| db_error(req, "db_query_failed", e, "criteria"))?;
    let Some(range) = range else {
        return Err(not_found(req, "criterion"));
    };
    Ok(json!({
        "score": calc::score_from_criterion(&range),
        "criterion": range,
    }))
}

fn assessments_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "assessments": [] }));
    };
    let department_id = optional_str(req, "departmentId")?;
    let evaluator_id = optional_str(req, "evaluatorId")?;

    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(d) = department_id {
        clauses.push("s.department_id = ?");
        binds.push(Value::Text(d));
    }
    if let Some(ev) = evaluator_id {
        clauses.push("sc.evaluator_id = ?");
        binds.push(Value::Text(ev));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let sql = format!(
        "SELECT s.id, s.person_id, s.name, s.class_label, d.code, d.name,
                GROUP_CONCAT(DISTINCT ev.name),
                COUNT(*),
                SUM(CASE WHEN sc.value IS NULL THEN 0 ELSE 1 END),
                MAX(sc.created_at)
         FROM scores sc
         JOIN students s ON s.id = sc.student_id
         JOIN departments d ON d.id = s.department_id
         JOIN evaluators ev ON ev.id = sc.evaluator_id
         {}
         GROUP BY s.id
         ORDER BY MAX(sc.created_at) DESC, s.name COLLATE NOCASE",
        where_sql
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| db_error(req, "db_query_failed", e, "scores"))?;
    let assessments = stmt
        .query_map(params_from_iter(binds), |r| {
            let evaluators: Option<String> = r.get(6)?;
            Ok(json!({
                "student": {
                    "id": r.get::<_, String>(0)?,
                    "personId": r.get::<_, String>(1)?,
                    "name": r.get::<_, String>(2)?,
                    "classLabel": r.get::<_, String>(3)?,
                },
                "department": { "code": r.get::<_, String>(4)?, "name": r.get::<_, String>(5)? },
                "evaluators": evaluators
                    .map(|s| s.split(',').map(str::to_string).collect::<Vec<_>>())
                    .unwrap_or_default(),
                "scoreCount": r.get::<_, i64>(7)?,
                "scoredCount": r.get::<_, i64>(8)?,
                "assessedAt": r.get::<_, String>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_error(req, "db_query_failed", e, "scores"))?;
    let total = assessments.len();
    Ok(json!({ "assessments": assessments, "total": total }))
}

fn assessments_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let evaluator_id = required_str(req, "evaluatorId")?;
    let removed = conn
        .execute(
            "DELETE FROM scores WHERE student_id = ? AND evaluator_id = ?",
            [&student_id, &evaluator_id],
        )
        .map_err(|e| db_error(req, "db_delete_failed", e, "scores"))?;
    if removed == 0 {
        return Err(not_found(req, "assessment"));
    }
    tracing::info!(student_id = %student_id, evaluator_id = %evaluator_id, removed, "assessment deleted");
    Ok(json!({ "deleted": true, "scoreCount": removed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "assessments.get" => assessments_get(state, req),
        "assessments.submit" => assessments_submit(state, req),
        "assessments.preview" => assessments_preview(state, req),
        "assessments.scoreFromCriterion" => assessments_score_from_criterion(state, req),
        "assessments.list" => assessments_list(state, req),
        "assessments.delete" => assessments_delete(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_map_accepts_numbers_and_nulls() {
        let raw = json!({ "e1": 80, "e2": null, "e3": 72.5 });
        let mut parsed = parse_score_map(Some(&raw)).expect("parse");
        parsed.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            parsed,
            vec![
                ("e1".to_string(), Some(80.0)),
                ("e2".to_string(), None),
                ("e3".to_string(), Some(72.5)),
            ]
        );
    }

    #[test]
    fn score_map_rejects_strings_and_non_objects() {
        assert!(parse_score_map(Some(&json!({ "e1": "80" }))).is_err());
        assert!(parse_score_map(Some(&json!([80]))).is_err());
        assert!(parse_score_map(None).is_err());
    }
}
