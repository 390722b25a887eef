mod test_support;

use serde_json::json;
use std::io::{BufRead, Write};
use test_support::{request, request_err_code, request_ok, spawn_sidecar, temp_dir};

#[test]
fn health_and_workspace_select_roundtrip() {
    let workspace = temp_dir("rubricd-router-smoke");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));

    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(
        selected.get("workspacePath").and_then(|v| v.as_str()),
        Some(workspace.to_string_lossy().as_ref())
    );
    assert!(workspace.join("rubric.sqlite3").is_file());

    let health = request_ok(&mut stdin, &mut reader, "3", "health", json!({}));
    assert_eq!(health.get("pendingCommits").and_then(|v| v.as_u64()), Some(0));
}

#[test]
fn unknown_methods_and_missing_workspace_are_reported() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let resp = request(&mut stdin, &mut reader, "1", "grid.explode", json!({}));
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "2", "workspace.select", json!({})),
        "bad_params"
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "3",
            "grid.get",
            json!({ "classId": "nope" })
        ),
        "no_workspace"
    );
    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "4", "grid.cursor.get", json!({})),
        "no_cursor"
    );

    let listed = request_ok(&mut stdin, &mut reader, "5", "classes.list", json!({}));
    assert_eq!(listed.get("classes"), Some(&json!([])));
}

#[test]
fn malformed_lines_get_bad_json_without_id() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "{{not json").expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        value.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_json")
    );
    assert!(value.get("id").is_none());

    // The stream keeps working afterwards.
    let _ = request_ok(&mut stdin, &mut reader, "after", "health", json!({}));
}
