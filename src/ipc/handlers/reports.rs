use crate::config::{MAX_EXPERIMENT_MARKS, MAX_INDICATOR_MARKS};
use crate::grid::record::{format_score, format_total_marks};
use crate::grid::GridShape;
use crate::ipc::error::{reply, HandlerErr};
use crate::ipc::helpers::{load_grid, opt_str, query_err, require_str, student_json};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

/// SAP ids shorter than this are rejected before any lookup.
const MIN_SAP_ID_LEN: usize = 5;

fn class_header(conn: &rusqlite::Connection, class_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT course_name, course_code, faculty_name, department, batch, year,
                semester, academic_year
         FROM classes WHERE id = ?",
        [class_id],
        |r| {
            Ok(json!({
                "id": class_id,
                "courseName": r.get::<_, String>(0)?,
                "courseCode": r.get::<_, String>(1)?,
                "facultyName": r.get::<_, Option<String>>(2)?,
                "department": r.get::<_, Option<String>>(3)?,
                "batch": r.get::<_, Option<String>>(4)?,
                "year": r.get::<_, Option<String>>(5)?,
                "semester": r.get::<_, Option<String>>(6)?,
                "academicYear": r.get::<_, Option<String>>(7)?,
            }))
        },
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| HandlerErr::new("not_found", "class not found"))
}

fn handle_student_rubric(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_str(&req.params, "classId")?;
    let student_id = opt_str(&req.params, "studentId");
    let sap_id = opt_str(&req.params, "sapId").map(str::trim);
    if student_id.is_none() && sap_id.is_none() {
        return Err(HandlerErr::new("bad_params", "missing studentId or sapId"));
    }
    if let Some(sap) = sap_id {
        if sap.len() < MIN_SAP_ID_LEN {
            return Err(HandlerErr::new("bad_params", "sapId is not a valid SAP ID")
                .with_details(json!({ "sapId": sap })));
        }
    }

    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let class = class_header(conn, class_id)?;
    let grid = load_grid(&mut state.grids, conn, class_id)?;

    let Some(student) = grid.roster.iter().find(|s| match student_id {
        Some(id) => s.id == id,
        None => Some(s.sap_id.as_str()) == sap_id,
    }) else {
        return Err(HandlerErr::new("not_found", "student is not in this class")
            .with_details(json!({ "studentId": student_id, "sapId": sap_id })));
    };
    let record = grid
        .records
        .get(&student.id)
        .cloned()
        .unwrap_or_else(|| grid.shape.empty_record());

    // Indicator rows down, experiments across, as on the printed rubric.
    let rows: Vec<serde_json::Value> = grid
        .shape
        .indicators
        .iter()
        .enumerate()
        .map(|(i_idx, label)| {
            let cells: Vec<String> = record
                .experiments
                .iter()
                .map(|e| format_score(e.scores.get(i_idx).copied().flatten()))
                .collect();
            json!({ "indicator": label, "maxMarks": MAX_INDICATOR_MARKS, "cells": cells })
        })
        .collect();
    let totals: Vec<String> = record
        .experiments
        .iter()
        .map(|e| format_score(e.total))
        .collect();
    let columns: Vec<String> = (0..grid.shape.num_experiments)
        .map(GridShape::experiment_key)
        .collect();

    Ok(json!({
        "class": class,
        "student": student_json(student),
        "columns": columns,
        "rows": rows,
        "experimentTotals": { "maxMarks": MAX_EXPERIMENT_MARKS, "cells": totals },
        "totalMarks": record.total_marks,
        "totalMarksDisplay": format_total_marks(record.total_marks),
        "marks": record.to_wire(&grid.shape),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.studentRubric" => Some(reply(&req.id, handle_student_rubric(state, req))),
        _ => None,
    }
}
