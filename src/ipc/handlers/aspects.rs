use crate::config;
use crate::db;
use crate::ipc::error::err;
use crate::ipc::helpers::{
    bad_params, count, db_conn, db_error, finish, optional_str, require_row, required_str,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ElementInput {
    pub name: String,
    pub weight: f64,
    pub sub_elements: Vec<String>,
}

/// `elements: [{ name, weight?, subElements: [string | { name }] }]`
pub fn parse_elements(
    raw: Option<&serde_json::Value>,
    default_weight: f64,
) -> Result<Vec<ElementInput>, String> {
    let Some(arr) = raw.and_then(|v| v.as_array()) else {
        return Err("elements must be an array".into());
    };
    let mut out = Vec::with_capacity(arr.len());
    for (i, e) in arr.iter().enumerate() {
        let name = e
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("elements[{}].name must be a non-empty string", i))?;
        let weight = match e.get("weight") {
            None => default_weight,
            Some(v) if v.is_null() => default_weight,
            Some(v) => {
                let w = v
                    .as_f64()
                    .ok_or_else(|| format!("elements[{}].weight must be a number", i))?;
                if !w.is_finite() || w < 0.0 {
                    return Err(format!("elements[{}].weight must be >= 0", i));
                }
                w
            }
        };
        let mut sub_elements = Vec::new();
        if let Some(subs) = e.get("subElements").filter(|v| !v.is_null()) {
            let Some(subs) = subs.as_array() else {
                return Err(format!("elements[{}].subElements must be an array", i));
            };
            for (j, s) in subs.iter().enumerate() {
                let n = s
                    .as_str()
                    .or_else(|| s.get("name").and_then(|v| v.as_str()))
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| {
                        format!("elements[{}].subElements[{}] must have a name", i, j)
                    })?;
                sub_elements.push(n.to_string());
            }
        }
        out.push(ElementInput {
            name: name.to_string(),
            weight,
            sub_elements,
        });
    }
    Ok(out)
}

fn insert_elements(conn: &Connection, aspect_id: &str, elements: &[ElementInput]) -> rusqlite::Result<()> {
    for (i, e) in elements.iter().enumerate() {
        let element_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO elements(id, aspect_id, name, weight, sort_order) VALUES(?, ?, ?, ?, ?)",
            (&element_id, aspect_id, &e.name, e.weight, i as i64),
        )?;
        for (j, s) in e.sub_elements.iter().enumerate() {
            conn.execute(
                "INSERT INTO sub_elements(id, element_id, name, sort_order) VALUES(?, ?, ?, ?)",
                (Uuid::new_v4().to_string(), &element_id, s, j as i64),
            )?;
        }
    }
    Ok(())
}

/// Aspects with their element trees, newest first.
pub fn load_aspect_tree(
    conn: &Connection,
    department_id: Option<&str>,
    aspect_id: Option<&str>,
) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut binds: Vec<Value> = Vec::new();
    let mut clauses: Vec<&str> = Vec::new();
    if let Some(d) = department_id {
        clauses.push("a.department_id = ?");
        binds.push(Value::Text(d.to_string()));
    }
    if let Some(a) = aspect_id {
        clauses.push("a.id = ?");
        binds.push(Value::Text(a.to_string()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let sql = format!(
        "SELECT a.id, a.name, a.department_id, d.code, d.name, a.created_at
         FROM aspects a
         JOIN departments d ON d.id = a.department_id
         {}
         ORDER BY a.created_at DESC, a.rowid DESC",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let aspects = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut elem_stmt = conn.prepare(
        "SELECT id, name, weight FROM elements WHERE aspect_id = ? ORDER BY sort_order",
    )?;
    let mut sub_stmt = conn.prepare(
        "SELECT se.element_id, se.id, se.name
         FROM sub_elements se
         JOIN elements e ON e.id = se.element_id
         WHERE e.aspect_id = ?
         ORDER BY se.sort_order",
    )?;

    let mut out = Vec::with_capacity(aspects.len());
    for (id, name, dept_id, dept_code, dept_name, created_at) in aspects {
        let mut subs_by_element: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
        let subs = sub_stmt
            .query_map([&id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (element_id, sub_id, sub_name) in subs {
            subs_by_element
                .entry(element_id)
                .or_default()
                .push(json!({ "id": sub_id, "name": sub_name }));
        }

        let elements = elem_stmt
            .query_map([&id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, f64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(eid, ename, weight)| {
                let subs = subs_by_element.remove(&eid).unwrap_or_default();
                json!({ "id": eid, "name": ename, "weight": weight, "subElements": subs })
            })
            .collect::<Vec<_>>();

        out.push(json!({
            "id": id,
            "name": name,
            "departmentId": dept_id,
            "department": { "code": dept_code, "name": dept_name },
            "createdAt": created_at,
            "elements": elements,
        }));
    }
    Ok(out)
}

fn aspect_score_count(conn: &Connection, req: &Request, aspect_id: &str) -> Result<i64, serde_json::Value> {
    count(
        conn,
        req,
        "SELECT COUNT(*)
         FROM scores sc
         JOIN elements e ON e.id = sc.element_id
         WHERE e.aspect_id = ?",
        aspect_id,
    )
}

fn has_scores(req: &Request, n: i64) -> serde_json::Value {
    err(
        &req.id,
        "has_scores",
        "aspect already has recorded scores",
        Some(json!({ "scoreCount": n })),
    )
}

fn delete_tree(conn: &Connection, aspect_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM sub_elements
         WHERE element_id IN (SELECT id FROM elements WHERE aspect_id = ?)",
        [aspect_id],
    )?;
    conn.execute("DELETE FROM elements WHERE aspect_id = ?", [aspect_id])?;
    Ok(())
}

fn aspects_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "aspects": [], "total": 0 }));
    };
    let department_id = optional_str(req, "departmentId")?;
    let aspects = load_aspect_tree(conn, department_id.as_deref(), None)
        .map_err(|e| db_error(req, "db_query_failed", e, "aspects"))?;
    let total = aspects.len();
    Ok(json!({ "aspects": aspects, "total": total }))
}

fn aspects_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let name = required_str(req, "name")?;
    let department_id = required_str(req, "departmentId")?;
    require_row(conn, req, "departments", &department_id, "department")?;
    let scoring = config::scoring_settings(conn)
        .map_err(|e| err(&req.id, "db_query_failed", format!("{e:#}"), None))?;
    let elements = parse_elements(req.params.get("elements"), scoring.default_element_weight)
        .map_err(|m| bad_params(req, m))?;

    let aspect_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    let result = tx
        .execute(
            "INSERT INTO aspects(id, name, department_id, created_at) VALUES(?, ?, ?, ?)",
            (&aspect_id, &name, &department_id, db::now_rfc3339()),
        )
        .and_then(|_| insert_elements(&tx, &aspect_id, &elements));
    if let Err(e) = result {
        let _ = tx.rollback();
        return Err(db_error(req, "db_insert_failed", e, "aspects"));
    }
    tx.commit()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    tracing::info!(aspect_id = %aspect_id, elements = elements.len(), "aspect created");

    let aspect = load_aspect_tree(conn, None, Some(&aspect_id))
        .map_err(|e| db_error(req, "db_query_failed", e, "aspects"))?
        .into_iter()
        .next();
    Ok(json!({ "aspect": aspect }))
}

fn aspects_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let aspect_id = required_str(req, "aspectId")?;
    let current_department: Option<String> = conn
        .query_row(
            "SELECT department_id FROM aspects WHERE id = ?",
            [&aspect_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_error(req, "db_query_failed", e, "aspects"))?;
    let Some(current_department) = current_department else {
        return Err(crate::ipc::helpers::not_found(req, "aspect"));
    };
    let name = required_str(req, "name")?;
    let department_id = optional_str(req, "departmentId")?.unwrap_or(current_department);
    require_row(conn, req, "departments", &department_id, "department")?;
    let scoring = config::scoring_settings(conn)
        .map_err(|e| err(&req.id, "db_query_failed", format!("{e:#}"), None))?;
    let elements = parse_elements(req.params.get("elements"), scoring.default_element_weight)
        .map_err(|m| bad_params(req, m))?;

    let scored = aspect_score_count(conn, req, &aspect_id)?;
    if scored > 0 {
        return Err(has_scores(req, scored));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    let result = tx
        .execute(
            "UPDATE aspects SET name = ?, department_id = ? WHERE id = ?",
            (&name, &department_id, &aspect_id),
        )
        .and_then(|_| delete_tree(&tx, &aspect_id))
        .and_then(|_| insert_elements(&tx, &aspect_id, &elements));
    if let Err(e) = result {
        let _ = tx.rollback();
        return Err(db_error(req, "db_update_failed", e, "aspects"));
    }
    tx.commit()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;

    let aspect = load_aspect_tree(conn, None, Some(&aspect_id))
        .map_err(|e| db_error(req, "db_query_failed", e, "aspects"))?
        .into_iter()
        .next();
    Ok(json!({ "aspect": aspect }))
}

fn aspects_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let aspect_id = required_str(req, "aspectId")?;
    require_row(conn, req, "aspects", &aspect_id, "aspect")?;
    let scored = aspect_score_count(conn, req, &aspect_id)?;
    if scored > 0 {
        return Err(has_scores(req, scored));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    let result = delete_tree(&tx, &aspect_id)
        .and_then(|_| tx.execute("DELETE FROM aspects WHERE id = ?", [&aspect_id]));
    if let Err(e) = result {
        let _ = tx.rollback();
        return Err(db_error(req, "db_delete_failed", e, "aspects"));
    }
    tx.commit()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    tracing::info!(aspect_id = %aspect_id, "aspect deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "aspects.list" => aspects_list(state, req),
        "aspects.create" => aspects_create(state, req),
        "aspects.update" => aspects_update(state, req),
        "aspects.delete" => aspects_delete(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elements_accept_string_and_object_sub_elements() {
        let raw = json!([
            { "name": "Persiapan kerja", "weight": 2, "subElements": ["Alat", { "name": "Bahan" }] },
            { "name": "Hasil", "subElements": null }
        ]);
        let parsed = parse_elements(Some(&raw), 1.0).expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].weight, 2.0);
        assert_eq!(parsed[0].sub_elements, vec!["Alat".to_string(), "Bahan".to_string()]);
        assert_eq!(parsed[1].weight, 1.0);
        assert!(parsed[1].sub_elements.is_empty());
    }

    #[test]
    fn negative_weights_and_blank_names_are_rejected() {
        let neg = json!([{ "name": "A", "weight": -1 }]);
        assert!(parse_elements(Some(&neg), 1.0).is_err());
        let blank = json!([{ "name": "  " }]);
        assert!(parse_elements(Some(&blank), 1.0).is_err());
        assert!(parse_elements(None, 1.0).is_err());
    }
}
