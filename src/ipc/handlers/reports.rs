use crate::calc::{self, AggregateMode, ReportOptions};
use crate::config;
use crate::ipc::error::{calc_err, err};
use crate::ipc::helpers::{bad_params, db_conn, finish, optional_bool, HandlerResult};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

/// Stored settings, overridden per request by `weighted`, `sortBy` and `includeDetails`.
fn report_options(conn: &Connection, req: &Request) -> Result<ReportOptions, serde_json::Value> {
    let scoring = config::scoring_settings(conn)
        .map_err(|e| err(&req.id, "db_query_failed", format!("{e:#}"), None))?;
    let reports = config::report_settings(conn)
        .map_err(|e| err(&req.id, "db_query_failed", format!("{e:#}"), None))?;

    let mut options = ReportOptions {
        mode: scoring.report_mode,
        sort_by: reports.sort_by,
        include_details: reports.include_details,
    };
    if let Some(weighted) = optional_bool(req, "weighted")? {
        options.mode = AggregateMode { weighted };
    }
    if let Some(v) = req.params.get("sortBy").filter(|v| !v.is_null()) {
        options.sort_by = config::parse_report_sort(v).map_err(|m| bad_params(req, m))?;
    }
    if let Some(include) = optional_bool(req, "includeDetails")? {
        options.include_details = include;
    }
    Ok(options)
}

fn reports_summary(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let filters = calc::parse_report_filters(&req.params).map_err(|e| calc_err(&req.id, e))?;
    let options = report_options(conn, req)?;

    let model = calc::compute_report(conn, &filters, &options).map_err(|e| calc_err(&req.id, e))?;
    tracing::debug!(
        rows = model.rows.len(),
        weighted = model.weighted,
        "report computed"
    );
    Ok(json!(model))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.summary" => reports_summary(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
