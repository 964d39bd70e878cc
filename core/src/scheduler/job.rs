//! Job identity and canonical scheduler state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};


// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Canonical job state, normalized from the scheduler's own vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    NodeFail,
    Unknown,
}

impl JobState {
    /// Normalize a scheduler state word. Accepts long names (`RUNNING`),
    /// short codes (`R`), and decorated forms such as `CANCELLED by 1234` or
    /// `CANCELLED+`.
    pub fn from_scheduler(raw: &str) -> JobState {
        let word = raw
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_end_matches('+')
            .to_ascii_uppercase();
        match word.as_str() {
            "PENDING" | "PD" | "CONFIGURING" | "CF" | "REQUEUED" | "RQ" => JobState::Pending,
            "RUNNING" | "R" => JobState::Running,
            "COMPLETED" | "CD" | "COMPLETING" | "CG" => JobState::Completed,
            "FAILED" | "F" | "OUT_OF_MEMORY" | "OOM" | "BOOT_FAIL" | "BF" | "DEADLINE"
            | "DL" | "PREEMPTED" | "PR" => JobState::Failed,
            "CANCELLED" | "CA" => JobState::Cancelled,
            "TIMEOUT" | "TO" => JobState::Timeout,
            "NODE_FAIL" | "NF" => JobState::NodeFail,
            _ => JobState::Unknown,
        }
    }

    /// Terminal states are sinks: polling must stop once one is seen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Failed
                | JobState::Cancelled
                | JobState::Timeout
                | JobState::NodeFail
        )
    }

    /// Terminal and not a normal completion.
    pub fn is_failure(&self) -> bool {
        self.is_terminal() && *self != JobState::Completed
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Timeout => "timeout",
            JobState::NodeFail => "node_fail",
            JobState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


// ---------------------------------------------------------------------------
// JobStatus / Job
// ---------------------------------------------------------------------------

/// One normalized answer from the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    /// Assigned node, absent until the scheduler reports one.
    pub node: Option<String>,
}

impl JobStatus {
    pub fn new(state: JobState, node: Option<&str>) -> Self {
        JobStatus {
            state,
            node: node.map(|n| n.to_string()),
        }
    }
}

/// A submitted job as the session tracks it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Scheduler-assigned identifier.
    pub id: String,
    /// Scheduler job name (used for named cancellation).
    pub name: String,
    pub state: JobState,
    /// Last node the scheduler reported for this job.
    pub node: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: &str, name: &str) -> Self {
        Job {
            id: id.to_string(),
            name: name.to_string(),
            state: JobState::Pending,
            node: None,
            created_at: Utc::now(),
        }
    }

    /// Fold a poll result into the job. A missing node never erases one
    /// already observed.
    pub fn apply(&mut self, status: &JobStatus) {
        self.state = status.state;
        if let Some(ref node) = status.node {
            self.node = Some(node.clone());
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_long_names() {
        assert_eq!(JobState::from_scheduler("PENDING"), JobState::Pending);
        assert_eq!(JobState::from_scheduler("RUNNING"), JobState::Running);
        assert_eq!(JobState::from_scheduler("COMPLETED"), JobState::Completed);
        assert_eq!(JobState::from_scheduler("FAILED"), JobState::Failed);
        assert_eq!(JobState::from_scheduler("TIMEOUT"), JobState::Timeout);
        assert_eq!(JobState::from_scheduler("NODE_FAIL"), JobState::NodeFail);
        assert_eq!(JobState::from_scheduler("OUT_OF_MEMORY"), JobState::Failed);
    }

    #[test]
    fn normalizes_short_codes_and_decorations() {
        assert_eq!(JobState::from_scheduler("PD"), JobState::Pending);
        assert_eq!(JobState::from_scheduler("r"), JobState::Running);
        assert_eq!(JobState::from_scheduler("CANCELLED by 1234"), JobState::Cancelled);
        assert_eq!(JobState::from_scheduler("CANCELLED+"), JobState::Cancelled);
        assert_eq!(JobState::from_scheduler("  COMPLETED  "), JobState::Completed);
    }

    #[test]
    fn unrecognized_is_unknown() {
        assert_eq!(JobState::from_scheduler("SUSPENDED"), JobState::Unknown);
        assert_eq!(JobState::from_scheduler(""), JobState::Unknown);
    }

    #[test]
    fn terminal_states_are_sinks() {
        for s in [
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
            JobState::Timeout,
            JobState::NodeFail,
        ] {
            assert!(s.is_terminal(), "{} should be terminal", s);
        }
        for s in [JobState::Pending, JobState::Running, JobState::Unknown] {
            assert!(!s.is_terminal(), "{} should not be terminal", s);
        }
        assert!(!JobState::Completed.is_failure());
        assert!(JobState::NodeFail.is_failure());
    }

    #[test]
    fn apply_keeps_observed_node() {
        let mut job = Job::new("123456", "notebook_llm");
        job.apply(&JobStatus::new(JobState::Running, Some("node42")));
        assert_eq!(job.node.as_deref(), Some("node42"));
        job.apply(&JobStatus::new(JobState::Completed, None));
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.node.as_deref(), Some("node42"));
    }
}
