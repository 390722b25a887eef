use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db;

pub const MAX_INDICATOR_MARKS: i64 = 5;
pub const NUM_INDICATORS: usize = 5;
pub const MAX_EXPERIMENT_MARKS: i64 = 25;
pub const DEFAULT_NUM_EXPERIMENTS: usize = 10;
pub const MAX_NUM_EXPERIMENTS: usize = 50;

/// Upper bound of the grand total; it is the average of experiment totals.
pub const MAX_GRAND_TOTAL: f64 = MAX_EXPERIMENT_MARKS as f64;

const COMMIT_POLICY_KEY: &str = "grid.commit_policy";
const MAX_RETRY_ATTEMPTS: u32 = 10;

/// What happens to the optimistic grid state when a background commit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Keep the local state and log the failure.
    #[default]
    LogOnly,
    /// Try the write up to `attempts` times in total before logging.
    Retry { attempts: u32 },
    /// Restore the pre-edit record if no later edit replaced it.
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitPolicyJson {
    mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry_attempts: Option<u32>,
}

impl CommitPolicy {
    /// Total write attempts the worker makes for one job.
    pub fn attempts(self) -> u32 {
        match self {
            CommitPolicy::Retry { attempts } => attempts.max(1),
            _ => 1,
        }
    }

    pub fn to_json(self) -> serde_json::Value {
        match self {
            CommitPolicy::LogOnly => json!({ "mode": "log" }),
            CommitPolicy::Retry { attempts } => json!({ "mode": "retry", "retryAttempts": attempts }),
            CommitPolicy::Rollback => json!({ "mode": "rollback" }),
        }
    }

    pub fn from_json(v: &serde_json::Value) -> Result<Self, String> {
        let parsed: CommitPolicyJson = serde_json::from_value(v.clone())
            .map_err(|e| format!("commitPolicy must be {{mode, retryAttempts?}}: {e}"))?;
        match parsed.mode.to_ascii_lowercase().as_str() {
            "log" => Ok(CommitPolicy::LogOnly),
            "rollback" => Ok(CommitPolicy::Rollback),
            "retry" => {
                let attempts = parsed.retry_attempts.unwrap_or(3);
                if attempts == 0 || attempts > MAX_RETRY_ATTEMPTS {
                    return Err(format!(
                        "retryAttempts must be between 1 and {}",
                        MAX_RETRY_ATTEMPTS
                    ));
                }
                Ok(CommitPolicy::Retry { attempts })
            }
            other => Err(format!(
                "commitPolicy.mode must be one of: log, retry, rollback (got {other})"
            )),
        }
    }
}

pub fn load_commit_policy(conn: &Connection) -> anyhow::Result<CommitPolicy> {
    let Some(saved) = db::settings_get_json(conn, COMMIT_POLICY_KEY)? else {
        return Ok(CommitPolicy::default());
    };
    match CommitPolicy::from_json(&saved) {
        Ok(p) => Ok(p),
        Err(msg) => {
            log::warn!("ignoring stored commit policy: {msg}");
            Ok(CommitPolicy::default())
        }
    }
}

pub fn save_commit_policy(conn: &Connection, policy: CommitPolicy) -> anyhow::Result<()> {
    db::settings_set_json(conn, COMMIT_POLICY_KEY, &policy.to_json())
}
