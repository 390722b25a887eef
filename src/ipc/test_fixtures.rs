use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::commit::{Committer, MarksStore, SqliteMarksStore};
use crate::config::CommitPolicy;
use crate::db;
use crate::grid::StudentMarks;
use crate::ipc::types::{AppState, Request};

pub const CLASS_ID: &str = "c1";
pub const STUDENT_ID: &str = "s1";

fn temp_dir(prefix: &str) -> PathBuf {
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

/// Stores into the workspace after `delay`. The first `failures` saves fail.
struct ScriptedStore {
    inner: SqliteMarksStore,
    delay: Duration,
    failures: Arc<AtomicUsize>,
}

impl MarksStore for ScriptedStore {
    fn save(&mut self, class_id: &str, student_id: &str, record: &StudentMarks) -> anyhow::Result<()> {
        std::thread::sleep(self.delay);
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("disk full");
        }
        self.inner.save(class_id, student_id, record)
    }
}

/// Workspace with class `c1` (3 experiments, 5 indicators) and student `s1`,
/// wired to a commit worker that is slowed down by `delay` and fails its
/// first `failures` writes.
pub fn scripted_state(prefix: &str, delay: Duration, failures: usize, policy: CommitPolicy) -> AppState {
    let ws = temp_dir(prefix);
    let conn = db::open_db(&ws).expect("open");
    conn.execute(
        "INSERT INTO classes(id, course_name, course_code, batch, num_experiments)
         VALUES(?, 'Physics', 'PH101', 'B1', 3)",
        [CLASS_ID],
    )
    .expect("class");
    for (i, label) in ["K", "S", "A", "C", "P"].iter().enumerate() {
        conn.execute(
            "INSERT INTO class_indicators(class_id, idx, label) VALUES(?, ?, ?)",
            (CLASS_ID, i as i64, label),
        )
        .expect("indicator");
    }
    conn.execute(
        "INSERT INTO students(id, name, sap_id, roll_no, batch) VALUES(?, 'Asha', '60001', 'R01', 'B1')",
        [STUDENT_ID],
    )
    .expect("student");
    conn.execute(
        "INSERT INTO class_students(class_id, student_id) VALUES(?, ?)",
        (CLASS_ID, STUDENT_ID),
    )
    .expect("link");
    db::ensure_marks_row(&conn, CLASS_ID, STUDENT_ID).expect("marks row");

    let store = ScriptedStore {
        inner: SqliteMarksStore::open(&ws).expect("store"),
        delay,
        failures: Arc::new(AtomicUsize::new(failures)),
    };
    let mut state = AppState::new();
    state.workspace = Some(ws);
    state.db = Some(conn);
    state.committer = Some(Committer::with_store(Box::new(store)).expect("spawn"));
    state.policy = policy;
    state
}

pub fn request(method: &str, params: serde_json::Value) -> Request {
    Request {
        id: "1".to_string(),
        method: method.to_string(),
        params,
    }
}

/// What SQLite holds for `s1`, bypassing the grid cache.
pub fn stored_record(state: &AppState) -> StudentMarks {
    let conn = state.db.as_ref().expect("db");
    let shape = db::load_shape(conn, CLASS_ID).expect("shape").expect("class");
    let roster = db::load_roster(conn, CLASS_ID).expect("roster");
    let mut marks = db::load_marks(conn, CLASS_ID, &shape, &roster).expect("marks");
    marks.remove(STUDENT_ID).expect("student row")
}

/// What the grid cache holds for `s1`.
pub fn cached_record(state: &AppState) -> StudentMarks {
    state
        .grids
        .get(CLASS_ID)
        .and_then(|g| g.records.get(STUDENT_ID))
        .cloned()
        .expect("cached record")
}
