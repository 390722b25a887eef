use anyhow::Context;
use rusqlite::Connection;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::db;
use crate::grid::StudentMarks;

/// Settled reports kept until the next `grid.commits.flush`.
const REPORT_LOG_CAP: usize = 256;
const RETRY_BACKOFF_MS: u64 = 20;

/// Where committed records end up.
pub trait MarksStore: Send {
    fn save(&mut self, class_id: &str, student_id: &str, record: &StudentMarks) -> anyhow::Result<()>;
}

pub struct SqliteMarksStore {
    conn: Connection,
}

impl SqliteMarksStore {
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        let conn = db::open_connection(workspace).context("commit worker connection")?;
        Ok(Self { conn })
    }
}

impl MarksStore for SqliteMarksStore {
    fn save(&mut self, class_id: &str, student_id: &str, record: &StudentMarks) -> anyhow::Result<()> {
        db::upsert_marks(&self.conn, class_id, student_id, record)
    }
}

struct CommitJob {
    seq: u64,
    class_id: String,
    student_id: String,
    record: StudentMarks,
    attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitReport {
    pub seq: u64,
    pub class_id: String,
    pub student_id: String,
    pub attempts: u32,
    pub error: Option<String>,
}

impl CommitReport {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "seq": self.seq,
            "classId": self.class_id,
            "studentId": self.student_id,
            "attempts": self.attempts,
            "ok": self.error.is_none(),
            "error": self.error,
        })
    }
}

/// A report together with the records on either side of the write.
#[derive(Debug, Clone)]
pub struct Settled {
    pub report: CommitReport,
    pub previous: StudentMarks,
    pub written: StudentMarks,
}

struct Inflight {
    previous: StudentMarks,
    written: StudentMarks,
}

/// Background writer. Jobs are applied in dispatch order by one worker thread.
pub struct Committer {
    jobs: Option<Sender<CommitJob>>,
    reports: Receiver<CommitReport>,
    worker: Option<JoinHandle<()>>,
    next_seq: u64,
    inflight: HashMap<u64, Inflight>,
    log: VecDeque<CommitReport>,
}

impl Committer {
    pub fn spawn(workspace: &Path) -> anyhow::Result<Self> {
        let store = SqliteMarksStore::open(workspace)?;
        Self::with_store(Box::new(store))
    }

    pub fn with_store(mut store: Box<dyn MarksStore>) -> anyhow::Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<CommitJob>();
        let (report_tx, report_rx) = mpsc::channel::<CommitReport>();

        let worker = std::thread::Builder::new()
            .name("rubricd-commit".to_string())
            .spawn(move || {
                for job in job_rx {
                    let report = run_job(store.as_mut(), job);
                    if report_tx.send(report).is_err() {
                        break;
                    }
                }
            })
            .context("failed to spawn commit worker")?;

        Ok(Self {
            jobs: Some(job_tx),
            reports: report_rx,
            worker: Some(worker),
            next_seq: 1,
            inflight: HashMap::new(),
            log: VecDeque::new(),
        })
    }

    /// Queues a write and returns its sequence number.
    pub fn dispatch(
        &mut self,
        class_id: &str,
        student_id: &str,
        previous: StudentMarks,
        written: StudentMarks,
        attempts: u32,
    ) -> anyhow::Result<u64> {
        let seq = self.next_seq;
        let job = CommitJob {
            seq,
            class_id: class_id.to_string(),
            student_id: student_id.to_string(),
            record: written.clone(),
            attempts: attempts.max(1),
        };
        let Some(jobs) = self.jobs.as_ref() else {
            anyhow::bail!("commit worker is stopped");
        };
        jobs.send(job)
            .map_err(|_| anyhow::anyhow!("commit worker is gone"))?;
        self.next_seq += 1;
        self.inflight.insert(seq, Inflight { previous, written });
        Ok(seq)
    }

    pub fn pending(&self) -> usize {
        self.inflight.len()
    }

    /// Collects whatever the worker has finished without blocking.
    pub fn poll(&mut self) -> Vec<Settled> {
        let mut out = Vec::new();
        while let Ok(report) = self.reports.try_recv() {
            if let Some(s) = self.settle(report) {
                out.push(s);
            }
        }
        out
    }

    /// Blocks until every dispatched job has a report or `timeout` elapses.
    pub fn wait(&mut self, timeout: Duration) -> Vec<Settled> {
        let deadline = Instant::now() + timeout;
        let mut out = self.poll();
        while !self.inflight.is_empty() {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.reports.recv_timeout(left) {
                Ok(report) => {
                    if let Some(s) = self.settle(report) {
                        out.push(s);
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    log::error!("commit worker exited with {} jobs pending", self.inflight.len());
                    break;
                }
            }
        }
        out
    }

    /// Hands back the logged reports and empties the log.
    pub fn take_log(&mut self) -> Vec<CommitReport> {
        self.log.drain(..).collect()
    }

    fn settle(&mut self, report: CommitReport) -> Option<Settled> {
        if self.log.len() == REPORT_LOG_CAP {
            self.log.pop_front();
        }
        self.log.push_back(report.clone());
        let inflight = self.inflight.remove(&report.seq)?;
        Some(Settled {
            report,
            previous: inflight.previous,
            written: inflight.written,
        })
    }
}

impl Drop for Committer {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish the queue and exit.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_job(store: &mut dyn MarksStore, job: CommitJob) -> CommitReport {
    let mut attempts = 0;
    let mut error = None;
    while attempts < job.attempts {
        attempts += 1;
        match store.save(&job.class_id, &job.student_id, &job.record) {
            Ok(()) => {
                error = None;
                break;
            }
            Err(e) => {
                log::debug!(
                    "commit #{} attempt {attempts}/{} failed: {e:#}",
                    job.seq,
                    job.attempts
                );
                error = Some(format!("{e:#}"));
                if attempts < job.attempts {
                    std::thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempts as u64));
                }
            }
        }
    }
    CommitReport {
        seq: job.seq,
        class_id: job.class_id,
        student_id: job.student_id,
        attempts,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridShape;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Fails the first `failures` saves, then records what it is given.
    struct FlakyStore {
        failures: Arc<AtomicUsize>,
        saved: Arc<Mutex<Vec<(String, Option<f64>)>>>,
    }

    impl MarksStore for FlakyStore {
        fn save(&mut self, _class_id: &str, student_id: &str, record: &StudentMarks) -> anyhow::Result<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("disk full");
            }
            self.saved
                .lock()
                .expect("lock")
                .push((student_id.to_string(), record.total_marks));
            Ok(())
        }
    }

    fn committer(failures: usize) -> (Committer, Arc<Mutex<Vec<(String, Option<f64>)>>>) {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let store = FlakyStore {
            failures: Arc::new(AtomicUsize::new(failures)),
            saved: saved.clone(),
        };
        (Committer::with_store(Box::new(store)).expect("spawn"), saved)
    }

    fn record(total: f64) -> StudentMarks {
        let mut r = GridShape::new(vec!["K".into()], 1).empty_record();
        r.total_marks = Some(total);
        r
    }

    #[test]
    fn jobs_apply_in_dispatch_order() {
        let (mut c, saved) = committer(0);
        for t in [1.0, 2.0, 3.0] {
            c.dispatch("c1", "s1", record(0.0), record(t), 1).expect("dispatch");
        }
        let settled = c.wait(Duration::from_secs(5));
        assert_eq!(settled.len(), 3);
        assert!(settled.iter().all(|s| s.report.error.is_none()));
        assert_eq!(c.pending(), 0);
        let saved = saved.lock().expect("lock").clone();
        assert_eq!(
            saved.iter().map(|(_, t)| *t).collect::<Vec<_>>(),
            vec![Some(1.0), Some(2.0), Some(3.0)]
        );
    }

    #[test]
    fn failure_is_reported_once_without_retry() {
        let (mut c, saved) = committer(1);
        let seq = c.dispatch("c1", "s1", record(1.0), record(2.0), 1).expect("dispatch");
        let settled = c.wait(Duration::from_secs(5));
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].report.seq, seq);
        assert_eq!(settled[0].report.attempts, 1);
        assert_eq!(settled[0].report.error.as_deref(), Some("disk full"));
        assert_eq!(settled[0].previous.total_marks, Some(1.0));
        assert!(saved.lock().expect("lock").is_empty());

        let log = c.take_log();
        assert_eq!(log.len(), 1);
        assert!(c.take_log().is_empty());
    }

    #[test]
    fn retry_attempts_absorb_transient_failures() {
        let (mut c, saved) = committer(2);
        c.dispatch("c1", "s1", record(0.0), record(9.0), 3).expect("dispatch");
        let settled = c.wait(Duration::from_secs(5));
        assert_eq!(settled[0].report.attempts, 3);
        assert_eq!(settled[0].report.error, None);
        assert_eq!(saved.lock().expect("lock").len(), 1);
    }

    #[test]
    fn report_json_carries_outcome() {
        let r = CommitReport {
            seq: 7,
            class_id: "c".into(),
            student_id: "s".into(),
            attempts: 2,
            error: Some("boom".into()),
        };
        let v = r.to_json();
        assert_eq!(v["seq"], 7);
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"], "boom");
    }
}
