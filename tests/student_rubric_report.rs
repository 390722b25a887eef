mod test_support;

use serde_json::json;
use test_support::{request_err_code, request_ok, select_workspace, setup_class, spawn_sidecar, temp_dir};

#[test]
fn student_rubric_lays_out_indicators_by_experiment() {
    let workspace = temp_dir("rubricd-student-rubric");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let (class_id, s) = setup_class(&mut stdin, &mut reader, &[("Asha", "60001234", "R01")]);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grid.edit",
        json!({ "classId": class_id, "studentId": s[0], "field": "Exp2", "indicator": "Skill", "rawValue": "4" }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.studentRubric",
        json!({ "classId": class_id, "sapId": "60001234" }),
    );
    assert_eq!(
        report.pointer("/student/name").and_then(|v| v.as_str()),
        Some("Asha")
    );
    assert_eq!(
        report.pointer("/class/courseCode").and_then(|v| v.as_str()),
        Some("PHY101")
    );
    let rows = report.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[1].get("indicator").and_then(|v| v.as_str()), Some("Skill"));
    let cells = rows[1].get("cells").and_then(|v| v.as_array()).expect("cells");
    assert_eq!(cells.len(), 10);
    assert_eq!(cells[1].as_str(), Some("4"));
    assert_eq!(cells[0].as_str(), Some("\u{2014}"));
    assert_eq!(
        report.pointer("/experimentTotals/cells/1").and_then(|v| v.as_str()),
        Some("4")
    );
    assert_eq!(
        report.get("totalMarksDisplay").and_then(|v| v.as_str()),
        Some("4.00")
    );
    assert_eq!(
        report.pointer("/columns/9").and_then(|v| v.as_str()),
        Some("Exp10")
    );

    let by_id = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.studentRubric",
        json!({ "classId": class_id, "studentId": s[0] }),
    );
    assert_eq!(by_id.get("rows"), report.get("rows"));

    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "4",
            "reports.studentRubric",
            json!({ "classId": class_id, "sapId": "123" }),
        ),
        "bad_params"
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "5",
            "reports.studentRubric",
            json!({ "classId": class_id, "sapId": "99999999" }),
        ),
        "not_found"
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "6",
            "reports.studentRubric",
            json!({ "classId": class_id }),
        ),
        "bad_params"
    );
}
