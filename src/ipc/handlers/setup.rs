use crate::config::{self, SetupSection};
use crate::ipc::error::err;
use crate::ipc::helpers::{bad_params, db_conn, finish, HandlerResult};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

fn setup_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let mut out = Map::new();
    for section in SetupSection::ALL {
        let v = config::load_section(conn, section)
            .map_err(|e| err(&req.id, "db_query_failed", format!("{e:#}"), None))?;
        out.insert(section.name().to_string(), v);
    }
    Ok(Value::Object(out))
}

fn setup_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return Err(bad_params(req, "missing section"));
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return Err(bad_params(req, "unknown section"));
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(bad_params(req, "patch must be an object"));
    };

    let current = config::update_section(conn, section, patch_obj)
        .map_err(|e| err(&req.id, "db_update_failed", format!("{e:#}"), None))?
        .map_err(|msg| bad_params(req, msg))?;
    tracing::info!(section = section.name(), "settings updated");
    Ok(json!({ "section": section.name(), "settings": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "setup.get" => setup_get(state, req),
        "setup.update" => setup_update(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
