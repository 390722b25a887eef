use crate::grid::{
    initial_buffer, Cell, CellState, Direction, EditTarget, GridShape, NavError, Navigator, Step,
};
use crate::ipc::error::{reply, HandlerErr};
use crate::ipc::handlers::grid::edit_cell;
use crate::ipc::helpers::{load_grid, opt_str, require_str};
use crate::ipc::types::{AppState, CursorSession, Request};
use serde_json::json;

fn nav_err(e: NavError) -> HandlerErr {
    let code = match e {
        NavError::NotEditing => "not_editing",
        NavError::UnknownStudent(_) => "not_found",
        NavError::OutOfGrid => "bad_params",
    };
    HandlerErr::new(code, e.to_string())
}

fn no_cursor() -> HandlerErr {
    HandlerErr::new("no_cursor", "open a cursor with grid.cursor.open first")
}

/// Class of the open session and its (possibly reloaded) layout.
fn session_shape(state: &mut AppState) -> Result<(String, GridShape), HandlerErr> {
    let class_id = state
        .cursor
        .as_ref()
        .map(|c| c.class_id.clone())
        .ok_or_else(no_cursor)?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let grid = load_grid(&mut state.grids, conn, &class_id)?;
    Ok((class_id, grid.shape.clone()))
}

fn session_nav(state: &mut AppState) -> Result<&mut Navigator, HandlerErr> {
    state
        .cursor
        .as_mut()
        .map(|c| &mut c.nav)
        .ok_or_else(no_cursor)
}

fn cell_json(cell: &Cell, shape: &GridShape) -> serde_json::Value {
    let (field, indicator) = match cell.target() {
        Some(t) => t.field_names(shape),
        None => (String::new(), None),
    };
    json!({
        "studentId": cell.student_id,
        "field": field,
        "indicator": indicator,
    })
}

fn cursor_json(nav: &Navigator, class_id: &str, shape: &GridShape) -> serde_json::Value {
    let (mode, cell, buffer) = match nav.state() {
        CellState::Viewing => ("viewing", serde_json::Value::Null, serde_json::Value::Null),
        CellState::Editing { cell, buffer } => ("editing", cell_json(cell, shape), json!(buffer)),
    };
    json!({
        "classId": class_id,
        "state": mode,
        "cell": cell,
        "buffer": buffer,
        "expandedStudentId": nav.expanded(),
    })
}

fn current_json(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let (class_id, shape) = session_shape(state)?;
    let nav = session_nav(state)?;
    Ok(cursor_json(nav, &class_id, &shape))
}

/// Enters edit mode on `cell`, seeding the buffer from the cached record.
fn activate(state: &mut AppState, cell: Cell) -> Result<(), HandlerErr> {
    let (class_id, _) = session_shape(state)?;
    let target = cell
        .target()
        .ok_or_else(|| nav_err(NavError::OutOfGrid))?;
    let initial = state
        .grids
        .get(&class_id)
        .and_then(|g| g.records.get(&cell.student_id))
        .map(|r| initial_buffer(r, target))
        .unwrap_or_default();
    session_nav(state)?.start_edit(cell, initial).map_err(nav_err)
}

/// Writes an edited cell through the same path as `grid.edit`.
fn commit_cell(state: &mut AppState, cell: &Cell, raw: &str) -> Result<serde_json::Value, HandlerErr> {
    let (class_id, shape) = session_shape(state)?;
    let target = cell
        .target()
        .ok_or_else(|| nav_err(NavError::OutOfGrid))?;
    let (record, seq) = edit_cell(state, &class_id, &cell.student_id, target, raw)?;
    Ok(json!({
        "cell": cell_json(cell, &shape),
        "marks": record.to_wire(&shape),
        "display": record.display(&shape),
        "commitSeq": seq,
    }))
}

fn handle_open(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = require_str(&req.params, "classId")?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let grid = load_grid(&mut state.grids, conn, class_id)?;
    let nav = Navigator::new(
        grid.student_ids(),
        grid.shape.num_experiments,
        grid.shape.indicators.len(),
    );
    state.cursor = Some(CursorSession {
        class_id: class_id.to_string(),
        nav,
    });
    current_json(state)
}

fn handle_start_edit(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = require_str(&req.params, "studentId")?;
    let field = require_str(&req.params, "field")?;
    let indicator = opt_str(&req.params, "indicator");
    let (_, shape) = session_shape(state)?;
    let target = EditTarget::resolve(&shape, field, indicator)
        .map_err(|e| HandlerErr::new(e.code(), e.to_string()))?;
    activate(state, Cell::from_target(student_id, target))?;
    current_json(state)
}

fn handle_input(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let text = require_str(&req.params, "text")?;
    session_nav(state)?.set_buffer(text).map_err(nav_err)?;
    current_json(state)
}

fn handle_commit(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let (cell, raw) = session_nav(state)?.commit().map_err(nav_err)?;
    let committed = commit_cell(state, &cell, &raw)?;
    Ok(json!({ "committed": committed, "cursor": current_json(state)? }))
}

fn handle_cancel(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    session_nav(state)?.cancel().map_err(nav_err)?;
    current_json(state)
}

fn handle_move(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let raw_dir = require_str(&req.params, "direction")?;
    let direction = Direction::parse(raw_dir).ok_or_else(|| {
        HandlerErr::new("bad_params", "direction must be one of: left, right, up, down, enter")
            .with_details(json!({ "direction": raw_dir }))
    })?;
    let (_, shape) = session_shape(state)?;
    let steps = session_nav(state)?.plan_move(direction).map_err(nav_err)?;

    let mut committed = serde_json::Value::Null;
    let mut trace = Vec::new();
    for step in steps {
        match step {
            Step::ClearEdit => trace.push(json!({ "step": "clearEdit" })),
            Step::Commit { cell, raw } => match commit_cell(state, &cell, &raw) {
                Ok(v) => {
                    committed = v;
                    trace.push(json!({ "step": "commit", "cell": cell_json(&cell, &shape) }));
                }
                Err(e) => {
                    // The cursor stays on the cell with the typed text.
                    session_nav(state)?.resume(cell, raw);
                    return Err(e);
                }
            },
            Step::Activate { cell, after_ms } => {
                trace.push(json!({
                    "step": "activate",
                    "cell": cell_json(&cell, &shape),
                    "afterMs": after_ms,
                }));
                activate(state, cell)?;
            }
        }
    }

    Ok(json!({
        "steps": trace,
        "committed": committed,
        "cursor": current_json(state)?,
    }))
}

fn handle_toggle_expand(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = require_str(&req.params, "studentId")?;
    session_nav(state)?.toggle_expand(student_id).map_err(nav_err)?;
    current_json(state)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grid.cursor.open" => handle_open(state, req),
        "grid.cursor.get" => current_json(state),
        "grid.cursor.startEdit" => handle_start_edit(state, req),
        "grid.cursor.input" => handle_input(state, req),
        "grid.cursor.commit" => handle_commit(state, req),
        "grid.cursor.cancel" => handle_cancel(state, req),
        "grid.cursor.move" => handle_move(state, req),
        "grid.cursor.toggleExpand" => handle_toggle_expand(state, req),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
