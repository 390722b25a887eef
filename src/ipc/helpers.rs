use rusqlite::Connection;
use serde_json::json;
use std::time::Duration;

use crate::cache::{ClassGrid, GridCache};
use crate::commit::Settled;
use crate::config::CommitPolicy;
use crate::db::RosterEntry;
use crate::ipc::error::HandlerErr;
use crate::ipc::types::AppState;

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {key}")))
}

pub fn opt_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub fn query_err(e: impl std::fmt::Display) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn load_grid<'a>(
    grids: &'a mut GridCache,
    conn: &Connection,
    class_id: &str,
) -> Result<&'a mut ClassGrid, HandlerErr> {
    grids
        .get_or_load(conn, class_id)
        .map_err(|e| query_err(format!("{e:#}")))?
        .ok_or_else(|| {
            HandlerErr::new("not_found", "class not found")
                .with_details(json!({ "classId": class_id }))
        })
}

pub fn student_json(s: &RosterEntry) -> serde_json::Value {
    json!({
        "id": s.id,
        "name": s.name,
        "sapId": s.sap_id,
        "rollNo": s.roll_no,
        "batch": s.batch,
    })
}

/// A roster row with its record in wire form and as display strings.
pub fn grid_row_json(grid: &ClassGrid, s: &RosterEntry) -> serde_json::Value {
    let record = grid
        .records
        .get(&s.id)
        .cloned()
        .unwrap_or_else(|| grid.shape.empty_record());
    json!({
        "student": student_json(s),
        "marks": record.to_wire(&grid.shape),
        "display": record.display(&grid.shape),
    })
}

/// Logs failed commits and applies the rollback policy to the cache.
pub fn apply_settled(state: &mut AppState, settled: Vec<Settled>) {
    for s in settled {
        let r = &s.report;
        let Some(error) = r.error.as_deref() else {
            log::debug!("commit #{} for student {} stored", r.seq, r.student_id);
            continue;
        };
        log::warn!(
            "commit #{} for student {} in class {} failed after {} attempt(s): {}",
            r.seq,
            r.student_id,
            r.class_id,
            r.attempts,
            error
        );
        if state.policy != CommitPolicy::Rollback {
            continue;
        }
        let Some(grid) = state.grids.get_mut(&r.class_id) else {
            continue;
        };
        if let Some(current) = grid.records.get_mut(&r.student_id) {
            // A later edit owns the record now.
            if *current == s.written {
                *current = s.previous;
                log::info!("rolled back student {} after commit #{}", r.student_id, r.seq);
            }
        }
    }
}

pub fn drain_commit_reports(state: &mut AppState) {
    let settled = match state.committer.as_mut() {
        Some(c) => c.poll(),
        None => return,
    };
    apply_settled(state, settled);
}

/// Waits for in-flight commits. Returns the number still pending.
pub fn wait_for_commits(state: &mut AppState, timeout: Duration) -> usize {
    let (settled, pending) = match state.committer.as_mut() {
        Some(c) => {
            let settled = c.wait(timeout);
            (settled, c.pending())
        }
        None => return 0,
    };
    apply_settled(state, settled);
    pending
}
