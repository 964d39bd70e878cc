//! Job submission and named cancellation.
//!
//! `JobSubmitter::submit` frees the kind's reserved port by cancelling any
//! same-named job for the user, writes the rendered script to a timestamped
//! remote path, runs `sbatch`, removes the file, and parses the job id out of
//! the acknowledgement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;

use super::job::Job;
use super::script::{self, JobKind, ResourceRequest};
use super::{is_valid_job_id, shell_quote};
use crate::error::{HpcError, Result};
use crate::remote::{Credentials, RemoteExecutor};

/// Remote directory holding submission scripts while `sbatch` reads them.
pub const SCRIPT_DIR: &str = "$HOME/.hpcserve";

const HEREDOC_TAG: &str = "HPCSERVE_SCRIPT_EOF";

static SCRIPT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Extract the job id from an `sbatch` acknowledgement.
pub fn parse_job_id(ack: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let re = PATTERN
        .get_or_init(|| Regex::new(r"Submitted batch job (\d+)").ok())
        .as_ref()?;
    re.captures(ack).map(|c| c[1].to_string())
}

/// `scancel` every job named `job_name` owned by `user`.
pub fn cancel_by_name_command(job_name: &str, user: &str) -> String {
    format!(
        "scancel --name={} --user={}",
        shell_quote(job_name),
        shell_quote(user)
    )
}

/// Unique remote path for one submission script.
pub fn script_path(job_name: &str, now: DateTime<Utc>) -> String {
    let seq = SCRIPT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}/submit_{}_{}_{}.sh",
        SCRIPT_DIR,
        job_name,
        now.format("%Y%m%d%H%M%S%3f"),
        seq
    )
}

/// One remote round-trip: write the script through a quoted here-document,
/// submit it, delete it, and exit with sbatch's status.
pub fn submit_command(script: &str, path: &str) -> Result<String> {
    if script.lines().any(|l| l.trim() == HEREDOC_TAG) {
        return Err(HpcError::Submission(format!(
            "script contains the reserved line '{}'",
            HEREDOC_TAG
        )));
    }
    let mut body = script.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    Ok(format!(
        "mkdir -p \"{dir}\"\n\
         cat > \"{path}\" <<'{tag}'\n\
         {body}{tag}\n\
         sbatch \"{path}\"\n\
         rc=$?\n\
         rm -f \"{path}\"\n\
         exit $rc\n",
        dir = SCRIPT_DIR,
        path = path,
        tag = HEREDOC_TAG,
        body = body,
    ))
}


/// Submits and cancels scheduler jobs through a `RemoteExecutor`.
#[derive(Clone)]
pub struct JobSubmitter {
    executor: Arc<dyn RemoteExecutor>,
}

impl JobSubmitter {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        JobSubmitter { executor }
    }

    /// Submit one job of `kind`. Returns exactly one of a job or an error.
    pub async fn submit(
        &self,
        credentials: &Credentials,
        kind: &JobKind,
        resources: &ResourceRequest,
    ) -> Result<Job> {
        kind.validate()?;

        // Free the reserved port: one job of this name per user.
        match self.cancel_by_name(credentials, &kind.job_name).await {
            Ok(()) => {}
            Err(HpcError::Command { exit_code, stderr }) => {
                tracing::warn!(
                    job_name = %kind.job_name,
                    exit_code,
                    stderr = %stderr,
                    "pre-submit cancel failed, continuing"
                );
            }
            Err(e) => return Err(e),
        }

        let rendered = script::render(kind, resources);
        let path = script_path(&kind.job_name, Utc::now());
        let command = submit_command(&rendered, &path)?;

        let output = self.executor.execute_command(credentials, &command).await?;
        if !output.success() {
            return Err(HpcError::Submission(format!(
                "sbatch exited with status {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let id = parse_job_id(&output.stdout).ok_or_else(|| {
            HpcError::Submission(format!(
                "no job id in scheduler reply: {:?}",
                output.stdout.trim()
            ))
        })?;
        tracing::info!(job_id = %id, job_name = %kind.job_name, "job submitted");
        Ok(Job::new(&id, &kind.job_name))
    }

    /// Cancel every job named `job_name` for the credentials' user.
    pub async fn cancel_by_name(&self, credentials: &Credentials, job_name: &str) -> Result<()> {
        let command = cancel_by_name_command(job_name, &credentials.username);
        self.executor
            .execute_command(credentials, &command)
            .await?
            .into_stdout()?;
        tracing::debug!(job_name, "named cancel issued");
        Ok(())
    }

    /// Cancel one job by id.
    pub async fn cancel_by_id(&self, credentials: &Credentials, job_id: &str) -> Result<()> {
        if !is_valid_job_id(job_id) {
            return Err(HpcError::NotFound(format!("invalid job id '{}'", job_id)));
        }
        self.executor
            .execute_command(credentials, &format!("scancel {}", job_id))
            .await?
            .into_stdout()?;
        tracing::debug!(job_id, "cancel by id issued");
        Ok(())
    }
}
