use crate::auth;
use crate::ipc::error::err;
use crate::ipc::helpers::{bad_params, db_conn, finish, required_str, HandlerResult};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn auth_login(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let email = required_str(req, "email")?;
    let Some(password) = req.params.get("password").and_then(|v| v.as_str()) else {
        return Err(bad_params(req, "missing password"));
    };
    if password.is_empty() {
        return Err(bad_params(req, "password must not be empty"));
    }

    let user = auth::authenticate(conn, &email, password)
        .map_err(|e| err(&req.id, "db_query_failed", format!("{e:#}"), None))?;
    let Some(user) = user else {
        // Same message for unknown email and wrong password.
        return Err(err(
            &req.id,
            "invalid_credentials",
            "email or password is incorrect",
            None,
        ));
    };
    tracing::info!(user_id = %user.id, role = user.role.as_str(), "login succeeded");
    Ok(json!({ "user": user }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(finish(req, auth_login(state, req))),
        _ => None,
    }
}
