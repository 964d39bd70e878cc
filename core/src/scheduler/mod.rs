//! Batch scheduler interaction: the "scheduler" subsystem.
//!
//! Everything here talks to the cluster through a `RemoteExecutor`:
//! `script` renders the submission script for a job kind, `submit` writes and
//! submits it, and `status` normalizes live-queue and accounting answers into
//! a canonical `JobState`.

pub mod job;
pub mod script;
pub mod status;
pub mod submit;

pub use job::{Job, JobState, JobStatus};
pub use script::{JobKind, ResourceRequest};
pub use status::JobStatusPoller;
pub use submit::JobSubmitter;

/// Quote `s` for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Scheduler job ids: digits, optionally `<id>_<task>` for array jobs.
pub(crate) fn is_valid_job_id(id: &str) -> bool {
    let mut parts = id.splitn(2, '_');
    let head = parts.next().unwrap_or("");
    let head_ok = !head.is_empty() && head.chars().all(|c| c.is_ascii_digit());
    let tail_ok = parts
        .next()
        .map(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(true);
    head_ok && tail_ok
}
