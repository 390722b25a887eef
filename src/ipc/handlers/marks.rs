use crate::db;
use crate::grid::{MarksRecord, StudentMarks};
use crate::ipc::error::{reply, HandlerErr};
use crate::ipc::helpers::{load_grid, opt_str, require_str, wait_for_commits};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::time::Duration;

fn handle_marks_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_str(&req.params, "classId")?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let grid = load_grid(&mut state.grids, conn, class_id)?;

    if let Some(student_id) = opt_str(&req.params, "studentId") {
        let Some(record) = grid.records.get(student_id) else {
            return Err(HandlerErr::new("not_found", "student is not in this class")
                .with_details(json!({ "studentId": student_id })));
        };
        return Ok(json!({
            "studentId": student_id,
            "marks": record.to_wire(&grid.shape),
        }));
    }

    let records: Vec<serde_json::Value> = grid
        .roster
        .iter()
        .filter_map(|s| {
            grid.records.get(&s.id).map(|r| {
                json!({
                    "studentId": s.id,
                    "marks": r.to_wire(&grid.shape),
                })
            })
        })
        .collect();
    Ok(json!({ "records": records }))
}

fn handle_marks_save(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_str(&req.params, "classId")?;
    let student_id = require_str(&req.params, "studentId")?;
    let Some(raw) = req.params.get("marks") else {
        return Err(HandlerErr::new("bad_params", "missing marks"));
    };
    let wire: MarksRecord = serde_json::from_value(raw.clone()).map_err(|e| {
        HandlerErr::new("bad_params", format!("marks must be {{experiments, experimentTotals, totalMarks}}: {e}"))
    })?;

    // A queued edit for the same student must not land after this write.
    wait_for_commits(state, Duration::from_secs(5));

    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let grid = load_grid(&mut state.grids, conn, class_id)?;
    if !grid.records.contains_key(student_id) {
        return Err(HandlerErr::new("not_found", "student is not in this class")
            .with_details(json!({ "studentId": student_id })));
    }
    let record = StudentMarks::from_wire(&grid.shape, &wire)
        .map_err(|msg| HandlerErr::new("bad_params", msg))?;

    db::upsert_marks(conn, class_id, student_id, &record).map_err(|e| {
        HandlerErr::new("db_insert_failed", format!("{e:#}"))
            .with_details(json!({ "table": "student_marks" }))
    })?;

    let wire = record.to_wire(&grid.shape);
    grid.records.insert(student_id.to_string(), record);
    Ok(json!({ "studentId": student_id, "marks": wire }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.get" => Some(reply(&req.id, handle_marks_get(state, req))),
        "marks.save" => Some(reply(&req.id, handle_marks_save(state, req))),
        _ => None,
    }
}
