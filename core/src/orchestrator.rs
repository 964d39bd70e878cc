//! Job orchestration: one session's job and tunnel driven as a state machine.
//!
//! ```text
//! Idle -start-> Submitting -ok-> Queued -running+node-> StartingTunnel -ok-> Ready
//!                   |               |  \-completed-> Finished            |
//!                   +-err-> Error <-+--failed/timeout/not-found <--------+
//! any active state -stop/cancel-> Stopped
//! ```
//!
//! Session fields live behind a std `Mutex` that is never held across an
//! await. Remote calls and poll ticks are serialized by the `op` mutex.
//! Teardown bumps the session generation, and a result whose generation is
//! stale is discarded (a stale submission is cancelled by id).

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{HpcError, Result};
use crate::remote::{Credentials, RemoteExecutor};
use crate::scheduler::{Job, JobKind, JobState, JobStatusPoller, JobSubmitter, ResourceRequest};
use crate::session::{next_session_id, LeaseKey, ResourceLeases, SessionSnapshot, SessionState};
use crate::tunnel::{TunnelManager, TunnelState};


// ---------------------------------------------------------------------------
// Configuration and requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Period of the poll loop in `run_until_settled`.
    pub poll_interval: Duration,
    /// Give up waiting for the queue after this long.
    pub queue_timeout: Option<Duration>,
    /// Consecutive NotFound answers tolerated while Queued.
    pub max_not_found_polls: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            poll_interval: Duration::from_secs(5),
            queue_timeout: None,
            max_not_found_polls: 3,
        }
    }
}

/// Everything one `start()` needs.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub credentials: Credentials,
    pub kind: JobKind,
    pub resources: ResourceRequest,
    /// Local forwarding port on 127.0.0.1.
    pub local_port: u16,
}

impl SessionRequest {
    /// Request with the kind's default resources, forwarding the kind's
    /// service port to the same local port.
    pub fn new(credentials: Credentials, kind: JobKind) -> Self {
        SessionRequest {
            resources: kind.resources.clone(),
            local_port: kind.service_port,
            credentials,
            kind,
        }
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_local_port(mut self, local_port: u16) -> Self {
        self.local_port = local_port;
        self
    }

    fn leases(&self) -> Vec<LeaseKey> {
        vec![
            LeaseKey::LocalPort(self.local_port),
            LeaseKey::NamedJob {
                host: self.credentials.host.clone(),
                user: self.credentials.username.clone(),
                job_name: self.kind.job_name.clone(),
            },
        ]
    }
}


// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Session {
    state: SessionState,
    generation: u64,
    /// Request behind the current (or orphaned) remote job. Teardown takes it.
    request: Option<SessionRequest>,
    job: Option<Job>,
    not_found_polls: u32,
    cancel: CancellationToken,
}

impl Session {
    fn fail(&mut self, reason: String) {
        tracing::error!(reason = %reason, "session failed");
        self.state = SessionState::Error { reason };
    }
}

/// What a Queued tick decided to do next.
enum QueuedNext {
    Wait,
    StartTunnel(String),
    Settled,
}


// ---------------------------------------------------------------------------
// JobOrchestrator
// ---------------------------------------------------------------------------

/// Drives one session: submit, poll until a node is assigned, bring up the
/// tunnel, and tear everything down on stop or cancel.
pub struct JobOrchestrator {
    id: u64,
    submitter: JobSubmitter,
    poller: JobStatusPoller,
    tunnels: TunnelManager,
    leases: Arc<ResourceLeases>,
    config: OrchestratorConfig,
    session: Mutex<Session>,
    op: tokio::sync::Mutex<()>,
}

impl JobOrchestrator {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        tunnels: TunnelManager,
        leases: Arc<ResourceLeases>,
        config: OrchestratorConfig,
    ) -> Self {
        JobOrchestrator {
            id: next_session_id(),
            submitter: JobSubmitter::new(Arc::clone(&executor)),
            poller: JobStatusPoller::new(executor),
            tunnels,
            leases,
            config,
            session: Mutex::new(Session {
                state: SessionState::Idle,
                generation: 0,
                request: None,
                job: None,
                not_found_polls: 0,
                cancel: CancellationToken::new(),
            }),
            op: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` on the session only if no teardown or restart happened since
    /// `generation` was captured.
    fn if_current<R>(&self, generation: u64, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut session = self.lock();
        if session.generation == generation {
            Some(f(&mut session))
        } else {
            tracing::debug!(session = self.id, generation, "discarding stale result");
            None
        }
    }

    pub fn state(&self) -> SessionSnapshot {
        let (state, kind, local_port, job) = {
            let s = self.lock();
            (
                s.state.clone(),
                s.request.as_ref().map(|r| r.kind.name.clone()),
                s.request.as_ref().map(|r| r.local_port),
                s.job.clone(),
            )
        };
        SessionSnapshot {
            id: self.id,
            state,
            kind,
            local_port,
            job,
            tunnel: self.tunnels.tunnel(),
        }
    }

    // -- start --

    /// Submit a job for `request`. Accepted only from Idle, Error, Stopped or
    /// Finished; the switch to Submitting happens before any await, so a
    /// concurrent second call is rejected.
    pub async fn start(&self, request: SessionRequest) -> Result<Job> {
        request.kind.validate()?;

        let (generation, remnant) = {
            let mut s = self.lock();
            if !s.state.can_start() {
                return Err(HpcError::InvalidState(format!(
                    "session {} cannot start while {}",
                    self.id, s.state
                )));
            }
            let remnant = s.request.take();
            s.generation += 1;
            s.state = SessionState::Submitting;
            s.job = None;
            s.not_found_polls = 0;
            s.cancel = CancellationToken::new();
            s.request = Some(request.clone());
            (s.generation, remnant)
        };
        tracing::info!(session = self.id, kind = %request.kind.name, "starting session");

        let _op = self.op.lock().await;

        if let Some(old) = remnant {
            self.teardown_remote(&old).await;
        }
        self.leases.release_all(self.id);

        if self.lock().generation != generation {
            return Err(HpcError::Cancelled("session torn down before submission".into()));
        }
        if let Err(e) = self.leases.acquire(self.id, &request.leases()) {
            self.if_current(generation, |s| {
                s.request = None;
                s.fail(e.to_string());
            });
            return Err(e);
        }

        let submitted = self
            .submitter
            .submit(&request.credentials, &request.kind, &request.resources)
            .await;

        let applied = self.if_current(generation, |s| match &submitted {
            Ok(job) => {
                s.state = SessionState::Queued;
                s.job = Some(job.clone());
            }
            Err(e) => {
                s.request = None;
                s.fail(format!("submission failed: {}", e));
            }
        });

        match (applied, submitted) {
            (Some(()), Ok(job)) => {
                tracing::info!(session = self.id, job_id = %job.id, "job queued");
                Ok(job)
            }
            (Some(()), Err(e)) => {
                self.leases.release_all(self.id);
                Err(e)
            }
            (None, Ok(job)) => {
                tracing::warn!(job_id = %job.id, "submission landed after teardown, cancelling");
                if let Err(e) = self.submitter.cancel_by_id(&request.credentials, &job.id).await {
                    tracing::warn!(job_id = %job.id, error = %e, "cancel of orphaned job failed");
                }
                Err(HpcError::Cancelled("session torn down during submission".into()))
            }
            (None, Err(e)) => {
                tracing::debug!(error = %e, "stale submission failure");
                Err(HpcError::Cancelled("session torn down during submission".into()))
            }
        }
    }

    // -- polling --

    /// One poll tick. Overlapping ticks return the current snapshot without
    /// querying the scheduler.
    pub async fn poll_once(&self) -> Result<SessionSnapshot> {
        let Ok(_op) = self.op.try_lock() else {
            tracing::debug!(session = self.id, "poll tick overlaps, skipping");
            return Ok(self.state());
        };

        let (generation, state, request, job) = {
            let s = self.lock();
            (s.generation, s.state.clone(), s.request.clone(), s.job.clone())
        };
        if let (Some(request), Some(job)) = (request, job) {
            match state {
                SessionState::Queued => self.poll_queued(generation, &request, &job).await?,
                SessionState::Ready => self.poll_ready(generation, &request, &job).await?,
                _ => {}
            }
        }
        Ok(self.state())
    }

    async fn poll_queued(&self, generation: u64, request: &SessionRequest, job: &Job) -> Result<()> {
        let status = match self.poller.get_status(&request.credentials, &job.id).await {
            Ok(status) => status,
            Err(HpcError::NotFound(msg)) => {
                let limit = self.config.max_not_found_polls;
                self.if_current(generation, |s| {
                    s.not_found_polls += 1;
                    tracing::warn!(job_id = %job.id, misses = s.not_found_polls, "job not found");
                    if s.not_found_polls >= limit {
                        s.fail(format!("job {} not found after {} polls", job.id, s.not_found_polls));
                    }
                });
                return Err(HpcError::NotFound(msg));
            }
            Err(e) => {
                self.if_current(generation, |s| s.fail(format!("status poll failed: {}", e)));
                return Err(e);
            }
        };

        let next = self.if_current(generation, |s| {
            s.not_found_polls = 0;
            let Some(job) = s.job.as_mut() else {
                return QueuedNext::Wait;
            };
            job.apply(&status);
            let job_id = job.id.clone();
            let node = job.node.clone();
            match (status.state, node) {
                (JobState::Running, Some(node)) => {
                    s.state = SessionState::StartingTunnel;
                    QueuedNext::StartTunnel(node)
                }
                (JobState::Completed, _) => {
                    tracing::info!(job_id = %job_id, "job finished before it was served");
                    s.state = SessionState::Finished;
                    s.request = None;
                    QueuedNext::Settled
                }
                (state, _) if state.is_failure() => {
                    s.fail(format!("job {} ended {}", job_id, state));
                    QueuedNext::Wait
                }
                (state, _) => {
                    tracing::debug!(job_id = %job_id, %state, "still queued");
                    QueuedNext::Wait
                }
            }
        });

        match next {
            Some(QueuedNext::StartTunnel(node)) => {
                tracing::info!(job_id = %job.id, node = %node, "node assigned");
                self.bring_up_tunnel(generation, request, &node).await
            }
            Some(QueuedNext::Settled) => {
                self.leases.release_all(self.id);
                Ok(())
            }
            Some(QueuedNext::Wait) | None => Ok(()),
        }
    }

    async fn bring_up_tunnel(&self, generation: u64, request: &SessionRequest, node: &str) -> Result<()> {
        let cancel = self.lock().cancel.clone();
        let started = self
            .tunnels
            .start_tunnel(
                &request.credentials,
                node,
                request.kind.service_port,
                request.local_port,
                &cancel,
            )
            .await;

        let applied = self.if_current(generation, |s| match &started {
            Ok(_) => s.state = SessionState::Ready,
            Err(e) => s.fail(format!("tunnel start failed: {}", e)),
        });

        match (applied, started) {
            (Some(()), Ok(tunnel)) => {
                tracing::info!(
                    session = self.id,
                    local_port = tunnel.local_port,
                    node = %tunnel.target_host,
                    "session ready"
                );
                Ok(())
            }
            (Some(()), Err(e)) => Err(e),
            (None, Ok(_)) => self.tunnels.stop_tunnel().await,
            (None, Err(_)) => Ok(()),
        }
    }

    async fn poll_ready(&self, generation: u64, request: &SessionRequest, job: &Job) -> Result<()> {
        if let TunnelState::Errored { reason } = self.tunnels.status() {
            self.if_current(generation, |s| s.fail(format!("tunnel exited: {}", reason)));
            return Ok(());
        }

        let status = match self.poller.get_status(&request.credentials, &job.id).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "status poll failed while ready");
                return Ok(());
            }
        };

        if !status.state.is_terminal() {
            self.if_current(generation, |s| {
                if let Some(job) = s.job.as_mut() {
                    job.apply(&status);
                }
            });
            return Ok(());
        }

        tracing::info!(job_id = %job.id, state = %status.state, "job ended while serving");
        self.tunnels.stop_tunnel().await?;
        let finished = self.if_current(generation, |s| {
            if let Some(job) = s.job.as_mut() {
                job.apply(&status);
            }
            if status.state == JobState::Completed {
                s.state = SessionState::Finished;
                s.request = None;
                true
            } else {
                s.fail(format!("job {} ended {}", job.id, status.state));
                false
            }
        });
        if finished == Some(true) {
            self.leases.release_all(self.id);
        }
        Ok(())
    }

    /// Poll every `poll_interval` until the session settles (Ready, Error,
    /// Finished, Stopped), `cancel` fires, or `queue_timeout` elapses.
    pub async fn run_until_settled(&self, cancel: &CancellationToken) -> Result<SessionSnapshot> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = self.config.queue_timeout.map(|t| (Instant::now() + t, t));
        let expired = async {
            match deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        loop {
            let snapshot = self.state();
            if snapshot.state.is_settled() || snapshot.state == SessionState::Idle {
                return Ok(snapshot);
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => {
                    return Err(HpcError::Cancelled("wait for session cancelled".into()));
                }
                _ = &mut expired => {
                    let after = deadline.map(|(_, t)| t).unwrap_or_default();
                    {
                        let mut s = self.lock();
                        if !s.state.is_settled() {
                            s.fail(format!("job still queued after {:?}", after));
                        }
                    }
                    return Err(HpcError::timeout("job to start", after));
                }
            }

            if let Err(e) = self.poll_once().await {
                tracing::warn!(session = self.id, error = %e, "poll failed");
            }
        }
    }

    // -- teardown --

    /// Stop the session: tunnel first, then the remote job by name. Also
    /// cancels a job orphaned by a failed tunnel start. A no-op from Idle,
    /// Stopped and Finished.
    pub async fn stop(&self) -> Result<SessionSnapshot> {
        self.teardown("stop").await
    }

    /// Cancel from any non-terminal state, tearing down tunnel and job
    /// unconditionally. A no-op from Idle.
    pub async fn cancel(&self) -> Result<SessionSnapshot> {
        self.teardown("cancel").await
    }

    async fn teardown(&self, why: &str) -> Result<SessionSnapshot> {
        let request = {
            let mut s = self.lock();
            if matches!(
                s.state,
                SessionState::Idle | SessionState::Stopped | SessionState::Finished
            ) {
                tracing::debug!(session = self.id, state = %s.state, "{} is a no-op", why);
                None
            } else {
                tracing::info!(session = self.id, from = %s.state, "{}", why);
                s.generation += 1;
                s.state = SessionState::Stopped;
                s.not_found_polls = 0;
                s.cancel.cancel();
                Some(s.request.take())
            }
        };
        let Some(request) = request else {
            return Ok(self.state());
        };

        let tunnel_stopped = self.tunnels.stop_tunnel().await;

        let _op = self.op.lock().await;
        let job_cancelled = match request {
            Some(request) => self
                .submitter
                .cancel_by_name(&request.credentials, &request.kind.job_name)
                .await,
            None => Ok(()),
        };
        self.leases.release_all(self.id);

        tunnel_stopped?;
        job_cancelled?;
        Ok(self.state())
    }

    /// Best-effort teardown of a previous pair before a restart.
    async fn teardown_remote(&self, old: &SessionRequest) {
        if let Err(e) = self.tunnels.stop_tunnel().await {
            tracing::warn!(error = %e, "stopping previous tunnel failed");
        }
        if let Err(e) = self
            .submitter
            .cancel_by_name(&old.credentials, &old.kind.job_name)
            .await
        {
            tracing::warn!(job_name = %old.kind.job_name, error = %e, "cancelling previous job failed");
        }
    }
}
