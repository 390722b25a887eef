use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

use crate::grid::{GridShape, StudentMarks};

pub const DB_FILE: &str = "rubric.sqlite3";

#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub id: String,
    pub name: String,
    pub sap_id: String,
    pub roll_no: String,
    pub batch: String,
}

/// Opens an existing workspace database without touching the schema.
pub fn open_connection(workspace: &Path) -> anyhow::Result<Connection> {
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = open_connection(workspace)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            course_name TEXT NOT NULL,
            course_code TEXT NOT NULL,
            faculty_name TEXT,
            department TEXT,
            batch TEXT,
            year TEXT,
            semester TEXT,
            academic_year TEXT,
            num_experiments INTEGER NOT NULL DEFAULT 10,
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_indicators(
            class_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            label TEXT NOT NULL,
            PRIMARY KEY(class_id, idx),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sap_id TEXT NOT NULL UNIQUE,
            roll_no TEXT NOT NULL,
            batch TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_students(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_students_student ON class_students(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_marks(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            total_marks REAL,
            updated_at TEXT,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS experiment_totals(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            experiment INTEGER NOT NULL,
            total INTEGER NOT NULL,
            PRIMARY KEY(class_id, student_id, experiment),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS indicator_scores(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            experiment INTEGER NOT NULL,
            indicator INTEGER NOT NULL,
            score INTEGER NOT NULL,
            PRIMARY KEY(class_id, student_id, experiment, indicator),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(
            serde_json::from_str(&text).with_context(|| format!("bad json in setting {key}"))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn load_shape(conn: &Connection, class_id: &str) -> anyhow::Result<Option<GridShape>> {
    let num_experiments: Option<i64> = conn
        .query_row(
            "SELECT num_experiments FROM classes WHERE id = ?",
            [class_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(num_experiments) = num_experiments else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT label FROM class_indicators WHERE class_id = ? ORDER BY idx")?;
    let indicators = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(GridShape::new(
        indicators,
        num_experiments.max(0) as usize,
    )))
}

/// Roster of a class in roll-number order.
pub fn load_roster(conn: &Connection, class_id: &str) -> anyhow::Result<Vec<RosterEntry>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.sap_id, s.roll_no, s.batch
         FROM class_students cs
         JOIN students s ON s.id = cs.student_id
         WHERE cs.class_id = ?
         ORDER BY s.roll_no, s.id",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok(RosterEntry {
                id: r.get(0)?,
                name: r.get(1)?,
                sap_id: r.get(2)?,
                roll_no: r.get(3)?,
                batch: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Marks of every rostered student, empty records for students without rows.
pub fn load_marks(
    conn: &Connection,
    class_id: &str,
    shape: &GridShape,
    roster: &[RosterEntry],
) -> anyhow::Result<HashMap<String, StudentMarks>> {
    let mut out: HashMap<String, StudentMarks> = roster
        .iter()
        .map(|s| (s.id.clone(), shape.empty_record()))
        .collect();

    let mut stmt =
        conn.prepare("SELECT student_id, total_marks FROM student_marks WHERE class_id = ?")?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<f64>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (student_id, total) in rows {
        if let Some(rec) = out.get_mut(&student_id) {
            rec.total_marks = total;
        }
    }

    let mut stmt = conn.prepare(
        "SELECT student_id, experiment, total FROM experiment_totals WHERE class_id = ?",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (student_id, experiment, total) in rows {
        let Some(rec) = out.get_mut(&student_id) else {
            continue;
        };
        if let Some(exp) = usize::try_from(experiment)
            .ok()
            .and_then(|e| rec.experiments.get_mut(e))
        {
            exp.total = Some(total);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT student_id, experiment, indicator, score FROM indicator_scores WHERE class_id = ?",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (student_id, experiment, indicator, score) in rows {
        let Some(rec) = out.get_mut(&student_id) else {
            continue;
        };
        let slot = usize::try_from(experiment)
            .ok()
            .and_then(|e| rec.experiments.get_mut(e))
            .and_then(|exp| {
                usize::try_from(indicator)
                    .ok()
                    .and_then(|i| exp.scores.get_mut(i))
            });
        if let Some(slot) = slot {
            *slot = Some(score);
        }
    }

    Ok(out)
}

/// Replaces a student's stored marks with `record`. Unset values are not stored.
pub fn upsert_marks(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
    record: &StudentMarks,
) -> anyhow::Result<()> {
    let tx = conn.unchecked_transaction()?;
    let now = chrono::Utc::now().to_rfc3339();

    tx.execute(
        "INSERT INTO student_marks(class_id, student_id, total_marks, updated_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(class_id, student_id) DO UPDATE SET
           total_marks = excluded.total_marks,
           updated_at = excluded.updated_at",
        (class_id, student_id, record.total_marks, &now),
    )
    .context("failed to upsert student_marks")?;

    tx.execute(
        "DELETE FROM experiment_totals WHERE class_id = ? AND student_id = ?",
        (class_id, student_id),
    )?;
    tx.execute(
        "DELETE FROM indicator_scores WHERE class_id = ? AND student_id = ?",
        (class_id, student_id),
    )?;

    {
        let mut total_stmt = tx.prepare(
            "INSERT INTO experiment_totals(class_id, student_id, experiment, total)
             VALUES(?, ?, ?, ?)",
        )?;
        let mut score_stmt = tx.prepare(
            "INSERT INTO indicator_scores(class_id, student_id, experiment, indicator, score)
             VALUES(?, ?, ?, ?, ?)",
        )?;
        for (e_idx, exp) in record.experiments.iter().enumerate() {
            if let Some(total) = exp.total {
                total_stmt
                    .execute((class_id, student_id, e_idx as i64, total))
                    .context("failed to insert experiment_totals")?;
            }
            for (i_idx, score) in exp.scores.iter().enumerate() {
                if let Some(score) = score {
                    score_stmt
                        .execute((class_id, student_id, e_idx as i64, i_idx as i64, *score))
                        .context("failed to insert indicator_scores")?;
                }
            }
        }
    }

    tx.commit()?;
    Ok(())
}

/// Creates the empty marks row for a newly rostered student.
pub fn ensure_marks_row(conn: &Connection, class_id: &str, student_id: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO student_marks(class_id, student_id, total_marks, updated_at)
         VALUES(?, ?, NULL, ?)",
        (class_id, student_id, chrono::Utc::now().to_rfc3339()),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn seed_class(conn: &Connection) -> GridShape {
        conn.execute(
            "INSERT INTO classes(id, course_name, course_code, num_experiments) VALUES('c1', 'Physics', 'PH101', 3)",
            [],
        )
        .expect("class");
        for (i, label) in ["K", "S", "A", "C", "P"].iter().enumerate() {
            conn.execute(
                "INSERT INTO class_indicators(class_id, idx, label) VALUES('c1', ?, ?)",
                (i as i64, label),
            )
            .expect("indicator");
        }
        conn.execute(
            "INSERT INTO students(id, name, sap_id, roll_no, batch) VALUES('s1', 'Asha', '600', 'R2', 'B1')",
            [],
        )
        .expect("student");
        conn.execute(
            "INSERT INTO class_students(class_id, student_id) VALUES('c1', 's1')",
            [],
        )
        .expect("link");
        load_shape(conn, "c1").expect("shape").expect("class exists")
    }

    #[test]
    fn marks_upsert_replaces_previous_rows() {
        let ws = temp_dir("rubricd-db-upsert");
        let conn = open_db(&ws).expect("open");
        let shape = seed_class(&conn);
        assert_eq!(shape.num_experiments, 3);
        assert_eq!(shape.indicators.len(), 5);

        let mut rec = shape.empty_record();
        rec.experiments[0].scores = vec![Some(5), Some(4), None, None, Some(1)];
        rec.experiments[0].total = Some(10);
        rec.total_marks = Some(10.0);
        upsert_marks(&conn, "c1", "s1", &rec).expect("upsert");

        let roster = load_roster(&conn, "c1").expect("roster");
        let loaded = load_marks(&conn, "c1", &shape, &roster).expect("load");
        assert_eq!(loaded.get("s1"), Some(&rec));

        let cleared = shape.empty_record();
        upsert_marks(&conn, "c1", "s1", &cleared).expect("upsert cleared");
        let loaded = load_marks(&conn, "c1", &shape, &roster).expect("load");
        assert_eq!(loaded.get("s1"), Some(&cleared));
    }

    #[test]
    fn settings_roundtrip_json() {
        let ws = temp_dir("rubricd-db-settings");
        let conn = open_db(&ws).expect("open");
        assert_eq!(settings_get_json(&conn, "k").expect("get"), None);
        settings_set_json(&conn, "k", &serde_json::json!({ "a": 1 })).expect("set");
        settings_set_json(&conn, "k", &serde_json::json!({ "a": 2 })).expect("set again");
        assert_eq!(
            settings_get_json(&conn, "k").expect("get"),
            Some(serde_json::json!({ "a": 2 }))
        );
    }
}
