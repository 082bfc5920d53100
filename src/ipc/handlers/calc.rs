use crate::calc::{self, AggregateMode, CriterionRange, ScoreEntry};
use crate::ipc::error::{calc_err, err};
use crate::ipc::helpers::{bad_params, finish, optional_bool, HandlerResult};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

/// `weight >= 0`, `rawScore` null or within 0..=100.
fn parse_entries(req: &Request) -> Result<Vec<ScoreEntry>, serde_json::Value> {
    let Some(raw) = req.params.get("entries") else {
        return Err(bad_params(req, "missing entries"));
    };
    let entries: Vec<ScoreEntry> = serde_json::from_value(raw.clone()).map_err(|e| {
        bad_params(
            req,
            format!("entries must be [{{ elementId, weight, rawScore }}]: {}", e),
        )
    })?;

    for (index, e) in entries.iter().enumerate() {
        if !e.weight.is_finite() || e.weight < 0.0 {
            return Err(err(
                &req.id,
                "bad_params",
                format!("entries[{}].weight must be >= 0", index),
                Some(json!({ "index": index, "weight": e.weight })),
            ));
        }
        if let Some(score) = e.raw_score {
            if !(0.0..=100.0).contains(&score) {
                return Err(err(
                    &req.id,
                    "bad_params",
                    format!("entries[{}].rawScore must be between 0 and 100", index),
                    Some(json!({ "index": index, "rawScore": score })),
                ));
            }
        }
    }
    Ok(entries)
}

/// Explicit `ranges` win; otherwise the workspace criteria table is used.
fn resolve_ranges(
    state: &AppState,
    req: &Request,
) -> Result<Option<Vec<CriterionRange>>, serde_json::Value> {
    match req.params.get("ranges") {
        Some(raw) if !raw.is_null() => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| {
                bad_params(
                    req,
                    format!("ranges must be [{{ label, minScore, maxScore }}]: {}", e),
                )
            }),
        _ => match state.db.as_ref() {
            Some(conn) => calc::load_criteria(conn)
                .map(Some)
                .map_err(|e| calc_err(&req.id, e)),
            None => Ok(None),
        },
    }
}

fn calc_aggregate(state: &mut AppState, req: &Request) -> HandlerResult {
    let entries = parse_entries(req)?;
    let weighted = optional_bool(req, "weighted")?.unwrap_or(false);
    let ranges = resolve_ranges(state, req)?;

    let final_score = calc::aggregate(&entries, AggregateMode { weighted });
    let matched_label = ranges
        .as_deref()
        .map(|r| calc::classify(final_score, r).to_string());
    Ok(json!({
        "finalScore": final_score,
        "matchedLabel": matched_label,
        "weighted": weighted,
        "entryCount": entries.len(),
    }))
}

fn calc_classify(state: &mut AppState, req: &Request) -> HandlerResult {
    let final_score = req
        .params
        .get("finalScore")
        .and_then(|v| v.as_f64())
        .filter(|v| v.is_finite())
        .ok_or_else(|| bad_params(req, "finalScore must be a number"))?;
    let Some(ranges) = resolve_ranges(state, req)? else {
        return Err(bad_params(req, "ranges required when no workspace is open"));
    };
    Ok(json!({ "label": calc::classify(final_score, &ranges) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "calc.aggregate" => calc_aggregate(state, req),
        "calc.classify" => calc_classify(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
