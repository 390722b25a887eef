use crate::db::{self, RosterEntry};
use crate::grid::record::format_total_marks;
use crate::ipc::error::{reply, HandlerErr};
use crate::ipc::helpers::{
    load_grid, opt_str, query_err, require_db, require_str, student_json, wait_for_commits,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RosterFilter {
    All,
    Incomplete,
    Complete,
    Highest,
    Lowest,
}

impl RosterFilter {
    fn parse(s: &str) -> Option<RosterFilter> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Some(RosterFilter::All),
            "incomplete" => Some(RosterFilter::Incomplete),
            "complete" => Some(RosterFilter::Complete),
            "highest" => Some(RosterFilter::Highest),
            "lowest" => Some(RosterFilter::Lowest),
            _ => None,
        }
    }
}

/// Indices of the rows matching `search` (name or roll number) and `filter`.
/// Highest and lowest are taken over the whole roster, not just the matches.
fn filter_rows(
    rows: &[(&RosterEntry, Option<f64>)],
    search: &str,
    filter: RosterFilter,
) -> Vec<usize> {
    let needle = search.trim().to_lowercase();
    let highest = rows
        .iter()
        .filter_map(|(_, t)| *t)
        .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))));
    let lowest = rows
        .iter()
        .filter_map(|(_, t)| *t)
        .filter(|t| *t > 0.0)
        .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.min(t))));

    rows.iter()
        .enumerate()
        .filter(|(_, (s, total))| {
            let matches_search = needle.is_empty()
                || s.name.to_lowercase().contains(&needle)
                || s.roll_no.to_lowercase().contains(&needle);
            let matches_filter = match filter {
                RosterFilter::All => true,
                RosterFilter::Incomplete => total.map_or(true, |t| t == 0.0),
                RosterFilter::Complete => total.map_or(false, |t| t > 0.0),
                RosterFilter::Highest => total.is_some() && *total == highest,
                RosterFilter::Lowest => total.is_some() && *total == lowest,
            };
            matches_search && matches_filter
        })
        .map(|(i, _)| i)
        .collect()
}

fn handle_students_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_str(&req.params, "classId")?;
    let search = opt_str(&req.params, "search").unwrap_or("");
    let filter = match opt_str(&req.params, "filter") {
        None => RosterFilter::All,
        Some(f) => RosterFilter::parse(f).ok_or_else(|| {
            HandlerErr::new(
                "bad_params",
                "filter must be one of: all, incomplete, complete, highest, lowest",
            )
            .with_details(json!({ "filter": f }))
        })?,
    };

    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let grid = load_grid(&mut state.grids, conn, class_id)?;

    let rows: Vec<(&RosterEntry, Option<f64>)> = grid
        .roster
        .iter()
        .map(|s| (s, grid.records.get(&s.id).and_then(|r| r.total_marks)))
        .collect();
    let students: Vec<serde_json::Value> = filter_rows(&rows, search, filter)
        .into_iter()
        .map(|i| {
            let (s, total) = rows[i];
            let mut v = student_json(s);
            v["totalMarks"] = json!(total);
            v["totalMarksDisplay"] = json!(format_total_marks(total));
            v
        })
        .collect();

    Ok(json!({ "students": students, "totalRows": rows.len() }))
}

struct ImportRow {
    name: String,
    sap_id: String,
    roll_no: String,
    batch: String,
}

fn parse_import_row(v: &serde_json::Value, default_batch: &str) -> Result<ImportRow, String> {
    let text = |key: &str| {
        v.get(key)
            .and_then(|x| x.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    let row = ImportRow {
        name: text("name"),
        sap_id: text("sapId"),
        roll_no: text("rollNo"),
        batch: {
            let b = text("batch");
            if b.is_empty() {
                default_batch.to_string()
            } else {
                b
            }
        },
    };
    if row.name.is_empty() || row.sap_id.is_empty() || row.roll_no.is_empty() {
        return Err("name, sapId and rollNo are required".to_string());
    }
    Ok(row)
}

/// Finds the student by SAP id or creates them, then enrols them in the class.
fn link_student(conn: &Connection, class_id: &str, row: &ImportRow) -> anyhow::Result<String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE sap_id = ?",
            [&row.sap_id],
            |r| r.get(0),
        )
        .optional()?;
    let student_id = match existing {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO students(id, name, sap_id, roll_no, batch) VALUES(?, ?, ?, ?, ?)",
                (&id, &row.name, &row.sap_id, &row.roll_no, &row.batch),
            )?;
            id
        }
    };
    conn.execute(
        "INSERT OR IGNORE INTO class_students(class_id, student_id) VALUES(?, ?)",
        (class_id, &student_id),
    )?;
    db::ensure_marks_row(conn, class_id, &student_id)?;
    Ok(student_id)
}

fn handle_students_import(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_str(&req.params, "classId")?.to_string();
    let Some(rows) = req.params.get("students").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing students"));
    };
    if rows.is_empty() {
        return Err(HandlerErr::new("bad_params", "no student records to import"));
    }

    // The cached grid is reloaded below, so queued edits must be stored first.
    let pending = wait_for_commits(state, Duration::from_secs(5));
    if pending > 0 {
        log::warn!("roster import into class {class_id} with {pending} commit(s) still pending");
    }

    let conn = require_db(state)?;
    let class_batch: Option<Option<String>> = conn
        .query_row("SELECT batch FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(query_err)?;
    let Some(class_batch) = class_batch else {
        return Err(HandlerErr::new("not_found", "class not found")
            .with_details(json!({ "classId": class_id })));
    };
    let default_batch = class_batch.unwrap_or_default();

    let mut linked = Vec::new();
    let mut errors = Vec::new();
    for (idx, v) in rows.iter().enumerate() {
        let result = parse_import_row(v, &default_batch).and_then(|row| {
            link_student(conn, &class_id, &row).map_err(|e| format!("{e:#}"))
        });
        match result {
            Ok(id) => linked.push(id),
            Err(message) => {
                log::warn!("roster import row {idx} skipped: {message}");
                errors.push(json!({ "row": idx, "student": v, "error": message }));
            }
        }
    }

    state.grids.invalidate(&class_id);
    if state.cursor.as_ref().map(|c| c.class_id == class_id).unwrap_or(false) {
        state.cursor = None;
    }

    log::info!(
        "imported {}/{} students into class {class_id}",
        linked.len(),
        rows.len()
    );
    Ok(json!({
        "linkedCount": linked.len(),
        "totalRows": rows.len(),
        "studentIds": linked,
        "errors": errors,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.import" => Some(reply(&req.id, handle_students_import(state, req))),
        "students.list" => Some(reply(&req.id, handle_students_list(state, req))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitPolicy;
    use crate::grid::EditTarget;
    use crate::ipc::handlers::grid::edit_cell;
    use crate::ipc::test_fixtures::{
        cached_record, request, scripted_state, stored_record, CLASS_ID, STUDENT_ID,
    };

    fn entry(name: &str, roll: &str) -> RosterEntry {
        RosterEntry {
            id: format!("id-{roll}"),
            name: name.to_string(),
            sap_id: format!("sap-{roll}"),
            roll_no: roll.to_string(),
            batch: "B1".to_string(),
        }
    }

    #[test]
    fn filters_follow_grand_totals() {
        let a = entry("Asha", "R1");
        let b = entry("Bilal", "R2");
        let c = entry("Chen", "R3");
        let d = entry("Dev", "R4");
        let rows = vec![(&a, Some(18.0)), (&b, None), (&c, Some(0.0)), (&d, Some(7.5))];

        assert_eq!(filter_rows(&rows, "", RosterFilter::All), vec![0, 1, 2, 3]);
        assert_eq!(filter_rows(&rows, "", RosterFilter::Incomplete), vec![1, 2]);
        assert_eq!(filter_rows(&rows, "", RosterFilter::Complete), vec![0, 3]);
        assert_eq!(filter_rows(&rows, "", RosterFilter::Highest), vec![0]);
        assert_eq!(filter_rows(&rows, "", RosterFilter::Lowest), vec![3]);
    }

    #[test]
    fn search_matches_name_or_roll_number() {
        let a = entry("Asha Rao", "R10");
        let b = entry("Bilal", "R2");
        let rows = vec![(&a, None), (&b, Some(3.0))];
        assert_eq!(filter_rows(&rows, "rao", RosterFilter::All), vec![0]);
        assert_eq!(filter_rows(&rows, " r2 ", RosterFilter::All), vec![1]);
        // The highest total belongs to a row the search excludes.
        assert!(filter_rows(&rows, "asha", RosterFilter::Highest).is_empty());
    }

    #[test]
    fn import_row_requires_identity_fields() {
        let row = parse_import_row(
            &json!({ "name": " Asha ", "sapId": "60004", "rollNo": "R1" }),
            "B2",
        )
        .expect("row");
        assert_eq!(row.name, "Asha");
        assert_eq!(row.batch, "B2");
        assert!(parse_import_row(&json!({ "name": "Asha", "sapId": "" , "rollNo": "R1" }), "").is_err());
    }

    #[test]
    fn import_stores_queued_edits_before_reloading_the_grid() {
        let mut state = scripted_state(
            "rubricd-import-pending",
            Duration::from_millis(300),
            0,
            CommitPolicy::LogOnly,
        );
        edit_cell(
            &mut state,
            CLASS_ID,
            STUDENT_ID,
            EditTarget::ExperimentTotal { experiment: 0 },
            "20",
        )
        .expect("first edit");

        let out = handle_students_import(
            &mut state,
            &request(
                "students.import",
                json!({
                    "classId": CLASS_ID,
                    "students": [{ "name": "Bilal", "sapId": "60002", "rollNo": "R02" }],
                }),
            ),
        )
        .expect("import");
        assert_eq!(out["linkedCount"], 1);

        let _ = load_grid(
            &mut state.grids,
            state.db.as_ref().expect("db"),
            CLASS_ID,
        )
        .expect("reload");
        assert_eq!(cached_record(&state).experiments[0].total, Some(20));

        edit_cell(
            &mut state,
            CLASS_ID,
            STUDENT_ID,
            EditTarget::ExperimentTotal { experiment: 1 },
            "10",
        )
        .expect("second edit");
        assert_eq!(wait_for_commits(&mut state, Duration::from_secs(5)), 0);

        let stored = stored_record(&state);
        assert_eq!(stored.experiments[0].total, Some(20));
        assert_eq!(stored.experiments[1].total, Some(10));
    }
}
