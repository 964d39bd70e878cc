//! Job status polling.
//!
//! `JobStatusPoller::get_status` asks the live queue first (`<state> <node>`
//! lines) and falls back to the accounting record (`<state>` lines) when the
//! live query fails or has nothing. It has no timer of its own; the
//! orchestrator calls it on its poll tick and never overlaps two calls.

use std::sync::Arc;

use super::is_valid_job_id;
use super::job::{JobState, JobStatus};
use crate::error::{HpcError, Result};
use crate::remote::{Credentials, RemoteExecutor};

/// Node values the scheduler prints while no node is assigned.
const NODE_PLACEHOLDERS: &[&str] = &["(null)", "(none)", "none", "n/a", "unassigned"];

pub fn live_query(job_id: &str) -> String {
    format!("squeue -h -j {} -o '%T %N'", job_id)
}

pub fn history_query(job_id: &str) -> String {
    format!("sacct -n -X -j {} -o State", job_id)
}

/// Normalize a node field: placeholders become `None`, and a compressed node
/// list (`gpu[12-13]`, `a01,a02`) yields its first host.
pub fn normalize_node(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || NODE_PLACEHOLDERS.contains(&raw.to_ascii_lowercase().as_str()) {
        return None;
    }
    let first = match raw.find('[') {
        Some(open) => {
            let prefix = &raw[..open];
            let rest = &raw[open + 1..];
            let first_range = rest
                .split(|c| c == ',' || c == ']')
                .next()
                .unwrap_or("");
            let first_index = first_range.split('-').next().unwrap_or("");
            format!("{}{}", prefix, first_index)
        }
        None => raw.split(',').next().unwrap_or(raw).to_string(),
    };
    if first.is_empty() {
        None
    } else {
        Some(first)
    }
}

/// First `<state> <node>` line of live-queue output.
pub fn parse_live(stdout: &str) -> Option<JobStatus> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut parts = line.splitn(2, char::is_whitespace);
    let state = JobState::from_scheduler(parts.next()?);
    let node = parts.next().and_then(normalize_node);
    Some(JobStatus { state, node })
}

/// First `<state>` line of accounting output.
pub fn parse_history(stdout: &str) -> Option<JobState> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(JobState::from_scheduler)
}


/// Queries scheduler state for one job at a time.
#[derive(Clone)]
pub struct JobStatusPoller {
    executor: Arc<dyn RemoteExecutor>,
}

impl JobStatusPoller {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        JobStatusPoller { executor }
    }

    /// Current status of `job_id`.
    ///
    /// Live-absent and history-present yields the historical state; both
    /// absent yields `NotFound`. A job missing from the live queue is never
    /// assumed to have completed.
    pub async fn get_status(&self, credentials: &Credentials, job_id: &str) -> Result<JobStatus> {
        if !is_valid_job_id(job_id) {
            return Err(HpcError::NotFound(format!("invalid job id '{}'", job_id)));
        }

        let live = self
            .executor
            .execute_command(credentials, &live_query(job_id))
            .await?;
        if live.success() {
            if let Some(status) = parse_live(&live.stdout) {
                tracing::debug!(job_id, state = %status.state, node = ?status.node, "live status");
                return Ok(status);
            }
        } else {
            tracing::debug!(
                job_id,
                exit_code = live.exit_code,
                stderr = %live.stderr.trim(),
                "live query rejected, checking accounting"
            );
        }

        let history = self
            .executor
            .execute_command(credentials, &history_query(job_id))
            .await?
            .into_stdout()?;
        match parse_history(&history) {
            Some(state) => {
                tracing::debug!(job_id, state = %state, "historical status");
                Ok(JobStatus { state, node: None })
            }
            None => Err(HpcError::NotFound(format!(
                "job {} is in neither the live queue nor accounting",
                job_id
            ))),
        }
    }
}
