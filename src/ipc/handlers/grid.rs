use crate::config::{self, CommitPolicy, MAX_EXPERIMENT_MARKS, MAX_GRAND_TOTAL, MAX_INDICATOR_MARKS};
use crate::grid::{apply_edit, EditTarget, StudentMarks, ThreadRandom};
use crate::ipc::error::{reply, HandlerErr};
use crate::ipc::helpers::{grid_row_json, load_grid, opt_str, require_db, require_str, wait_for_commits};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::time::Duration;

const FLUSH_DEFAULT_TIMEOUT_MS: u64 = 5000;
const FLUSH_MAX_TIMEOUT_MS: u64 = 60_000;

/// Runs one edit event through the grid: validate, propagate, update the
/// cache, then queue the write. Returns the new record and its commit number.
pub(crate) fn edit_cell(
    state: &mut AppState,
    class_id: &str,
    student_id: &str,
    target: EditTarget,
    raw_value: &str,
) -> Result<(StudentMarks, u64), HandlerErr> {
    let AppState {
        db,
        grids,
        committer,
        policy,
        ..
    } = state;
    let conn = db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let grid = load_grid(grids, conn, class_id)?;
    let Some(current) = grid.records.get_mut(student_id) else {
        return Err(HandlerErr::new("not_found", "student is not in this class")
            .with_details(json!({ "studentId": student_id })));
    };

    let next = apply_edit(current, target, raw_value, &mut ThreadRandom);
    let previous = std::mem::replace(current, next.clone());

    let Some(committer) = committer.as_mut() else {
        *current = previous;
        return Err(HandlerErr::new("commit_failed", "commit worker is not running"));
    };
    match committer.dispatch(
        class_id,
        student_id,
        previous.clone(),
        next.clone(),
        policy.attempts(),
    ) {
        Ok(seq) => Ok((next, seq)),
        Err(e) => {
            *current = previous;
            log::error!("could not queue commit for student {student_id}: {e:#}");
            Err(HandlerErr::new("commit_failed", format!("{e:#}")))
        }
    }
}

fn raw_value_param(params: &serde_json::Value) -> Result<String, HandlerErr> {
    match params.get("rawValue") {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        Some(serde_json::Value::Null) => Ok(String::new()),
        Some(other) => Err(HandlerErr::new("bad_params", "rawValue must be a string")
            .with_details(json!({ "rawValue": other }))),
        None => Err(HandlerErr::new("bad_params", "missing rawValue")),
    }
}

fn handle_grid_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_str(&req.params, "classId")?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let grid = load_grid(&mut state.grids, conn, class_id)?;

    let rows: Vec<serde_json::Value> = grid
        .roster
        .iter()
        .map(|s| grid_row_json(grid, s))
        .collect();
    Ok(json!({
        "classId": class_id,
        "indicators": grid.shape.indicators,
        "numExperiments": grid.shape.num_experiments,
        "limits": {
            "maxIndicatorMarks": MAX_INDICATOR_MARKS,
            "maxExperimentMarks": MAX_EXPERIMENT_MARKS,
            "maxGrandTotal": MAX_GRAND_TOTAL,
        },
        "rows": rows,
    }))
}

fn handle_grid_edit(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_str(&req.params, "classId")?;
    let student_id = require_str(&req.params, "studentId")?;
    let field = require_str(&req.params, "field")?;
    let indicator = opt_str(&req.params, "indicator");
    let raw_value = raw_value_param(&req.params)?;

    let target = {
        let conn = state
            .db
            .as_ref()
            .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
        let grid = load_grid(&mut state.grids, conn, class_id)?;
        EditTarget::resolve(&grid.shape, field, indicator).map_err(|e| {
            HandlerErr::new(e.code(), e.to_string())
                .with_details(json!({ "field": field, "indicator": indicator }))
        })?
    };

    let (record, seq) = edit_cell(state, class_id, student_id, target, &raw_value)?;
    let grid = state
        .grids
        .get_mut(class_id)
        .ok_or_else(|| HandlerErr::new("not_found", "class not found"))?;
    Ok(json!({
        "studentId": student_id,
        "marks": record.to_wire(&grid.shape),
        "display": record.display(&grid.shape),
        "commitSeq": seq,
    }))
}

fn handle_commits_flush(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let timeout_ms = match req.params.get("timeoutMs") {
        None | Some(serde_json::Value::Null) => FLUSH_DEFAULT_TIMEOUT_MS,
        Some(v) => v
            .as_u64()
            .filter(|ms| *ms <= FLUSH_MAX_TIMEOUT_MS)
            .ok_or_else(|| {
                HandlerErr::new(
                    "bad_params",
                    format!("timeoutMs must be between 0 and {FLUSH_MAX_TIMEOUT_MS}"),
                )
            })?,
    };

    let pending = wait_for_commits(state, Duration::from_millis(timeout_ms));
    let reports: Vec<serde_json::Value> = state
        .committer
        .as_mut()
        .map(|c| c.take_log())
        .unwrap_or_default()
        .iter()
        .map(|r| r.to_json())
        .collect();
    let failed = reports
        .iter()
        .filter(|r| r.get("ok").and_then(|v| v.as_bool()) == Some(false))
        .count();

    Ok(json!({
        "settled": pending == 0,
        "pending": pending,
        "failed": failed,
        "reports": reports,
    }))
}

fn handle_settings_get(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_db(state)?;
    Ok(json!({ "commitPolicy": state.policy.to_json() }))
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let Some(raw) = req.params.get("commitPolicy") else {
        return Err(HandlerErr::new("bad_params", "missing commitPolicy"));
    };
    let policy = CommitPolicy::from_json(raw).map_err(|msg| HandlerErr::new("bad_params", msg))?;
    config::save_commit_policy(conn, policy).map_err(|e| {
        HandlerErr::new("db_insert_failed", format!("{e:#}"))
            .with_details(json!({ "table": "settings" }))
    })?;
    state.policy = policy;
    log::info!("commit policy set to {}", policy.to_json());
    Ok(json!({ "commitPolicy": policy.to_json() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grid.get" => handle_grid_get(state, req),
        "grid.edit" => handle_grid_edit(state, req),
        "grid.commits.flush" => handle_commits_flush(state, req),
        "grid.settings.get" => handle_settings_get(state, req),
        "grid.settings.update" => handle_settings_update(state, req),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
