use crate::config::{DEFAULT_NUM_EXPERIMENTS, MAX_NUM_EXPERIMENTS, NUM_INDICATORS};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{student_json, wait_for_commits};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

const OPTIONAL_HEADER_FIELDS: [(&str, &str); 6] = [
    ("facultyName", "faculty_name"),
    ("department", "department"),
    ("batch", "batch"),
    ("year", "year"),
    ("semester", "semester"),
    ("academicYear", "academic_year"),
];

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.course_name,
           c.course_code,
           c.num_experiments,
           (SELECT COUNT(*) FROM class_students cs WHERE cs.class_id = c.id) AS student_count
         FROM classes c
         ORDER BY c.created_at, c.course_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let course_name: String = row.get(1)?;
            let course_code: String = row.get(2)?;
            let num_experiments: i64 = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "courseName": course_name,
                "courseCode": course_code,
                "numExperiments": num_experiments,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn required_text(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    let Some(v) = req.params.get(key).and_then(|v| v.as_str()) else {
        return Err(err(&req.id, "bad_params", format!("missing {key}"), None));
    };
    let v = v.trim();
    if v.is_empty() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{key} must not be empty"),
            None,
        ));
    }
    Ok(v.to_string())
}

fn parse_indicators(req: &Request) -> Result<Vec<String>, serde_json::Value> {
    let Some(arr) = req.params.get("indicators").and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", "missing indicators", None));
    };
    let labels: Vec<String> = arr
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .collect();
    if labels.len() != arr.len() || labels.len() != NUM_INDICATORS {
        return Err(err(
            &req.id,
            "bad_params",
            format!("indicators must be {NUM_INDICATORS} strings"),
            Some(json!({ "count": arr.len() })),
        ));
    }
    if labels.iter().any(|l| l.is_empty()) {
        return Err(err(&req.id, "bad_params", "indicator labels must not be empty", None));
    }
    for (i, l) in labels.iter().enumerate() {
        if labels[..i].contains(l) {
            return Err(err(
                &req.id,
                "bad_params",
                "indicator labels must be distinct",
                Some(json!({ "label": l })),
            ));
        }
    }
    Ok(labels)
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_name = match required_text(req, "courseName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let course_code = match required_text(req, "courseCode") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let indicators = match parse_indicators(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let num_experiments = match req.params.get("numExperiments") {
        None | Some(serde_json::Value::Null) => DEFAULT_NUM_EXPERIMENTS as i64,
        Some(v) => match v.as_i64() {
            Some(n) if (1..=MAX_NUM_EXPERIMENTS as i64).contains(&n) => n,
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("numExperiments must be between 1 and {MAX_NUM_EXPERIMENTS}"),
                    Some(json!({ "numExperiments": v })),
                )
            }
        },
    };

    let class_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "INSERT INTO classes(id, course_name, course_code, num_experiments, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &class_id,
            &course_name,
            &course_code,
            num_experiments,
            chrono::Utc::now().to_rfc3339(),
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    for (key, column) in OPTIONAL_HEADER_FIELDS {
        let Some(v) = req.params.get(key).and_then(|v| v.as_str()) else {
            continue;
        };
        let sql = format!("UPDATE classes SET {column} = ? WHERE id = ?");
        if let Err(e) = tx.execute(&sql, (v.trim(), &class_id)) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "classes", "field": key })),
            );
        }
    }

    for (idx, label) in indicators.iter().enumerate() {
        if let Err(e) = tx.execute(
            "INSERT INTO class_indicators(class_id, idx, label) VALUES(?, ?, ?)",
            (&class_id, idx as i64, label),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "class_indicators" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    log::info!("created class {class_id} ({course_code})");
    ok(
        &req.id,
        json!({
            "classId": class_id,
            "courseName": course_name,
            "courseCode": course_code,
            "indicators": indicators,
            "numExperiments": num_experiments
        }),
    )
}

fn handle_classes_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let header = match conn
        .query_row(
            "SELECT course_name, course_code, faculty_name, department, batch, year,
                    semester, academic_year, num_experiments
             FROM classes WHERE id = ?",
            [&class_id],
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
                    "numExperiments": r.get::<_, i64>(8)?,
                }))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let shape = match db::load_shape(conn, &class_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
    };
    let roster = match db::load_roster(conn, &class_id) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
    };

    ok(
        &req.id,
        json!({
            "class": header,
            "indicators": shape.indicators,
            "students": roster.iter().map(student_json).collect::<Vec<_>>(),
        }),
    )
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    // Queued writes for this class must land before its rows go.
    wait_for_commits(state, Duration::from_secs(5));

    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Dependency order; there is no ON DELETE CASCADE.
    for table in [
        "indicator_scores",
        "experiment_totals",
        "student_marks",
        "class_students",
        "class_indicators",
    ] {
        let sql = format!("DELETE FROM {table} WHERE class_id = ?");
        if let Err(e) = tx.execute(&sql, [&class_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    // Students not enrolled anywhere else go with the class.
    if let Err(e) = tx.execute(
        "DELETE FROM students WHERE id NOT IN (SELECT student_id FROM class_students)",
        [],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    state.grids.invalidate(&class_id);
    if state.cursor.as_ref().map(|c| c.class_id == class_id).unwrap_or(false) {
        state.cursor = None;
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.get" => Some(handle_classes_get(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
