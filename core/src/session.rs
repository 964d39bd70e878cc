//! Session state and the process-wide resource lease table.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use crate::error::{HpcError, Result};
use crate::scheduler::Job;
use crate::tunnel::Tunnel;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Fresh process-unique session id.
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}


// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Submitting,
    Queued,
    StartingTunnel,
    Ready,
    Error { reason: String },
    Stopped,
    /// The job completed normally, whether it ended while queued or after
    /// it was served.
    Finished,
}

impl SessionState {
    /// States from which `start()` is accepted.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            SessionState::Idle
                | SessionState::Error { .. }
                | SessionState::Stopped
                | SessionState::Finished
        )
    }

    /// States the poll loop stops at.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            SessionState::Ready
                | SessionState::Error { .. }
                | SessionState::Stopped
                | SessionState::Finished
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Submitting => "submitting",
            SessionState::Queued => "queued",
            SessionState::StartingTunnel => "starting_tunnel",
            SessionState::Ready => "ready",
            SessionState::Error { .. } => "error",
            SessionState::Stopped => "stopped",
            SessionState::Finished => "finished",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Error { reason } => write!(f, "error ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: u64,
    pub state: SessionState,
    pub kind: Option<String>,
    pub local_port: Option<u16>,
    pub job: Option<Job>,
    pub tunnel: Option<Tunnel>,
}


// ---------------------------------------------------------------------------
// ResourceLeases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LeaseKey {
    /// A local forwarding port on 127.0.0.1.
    LocalPort(u16),
    /// The single job of a given name a user may run on a cluster.
    NamedJob {
        host: String,
        user: String,
        job_name: String,
    },
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseKey::LocalPort(port) => write!(f, "local port {}", port),
            LeaseKey::NamedJob {
                host,
                user,
                job_name,
            } => write!(f, "job '{}' for {}@{}", job_name, user, host),
        }
    }
}

/// Which session holds each shared resource. One table per process, shared
/// by every orchestrator through an `Arc`.
#[derive(Debug, Default)]
pub struct ResourceLeases {
    held: Mutex<HashMap<LeaseKey, u64>>,
}

impl ResourceLeases {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<LeaseKey, u64>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take every key for `owner`, or none of them. Keys `owner` already
    /// holds are fine.
    pub fn acquire(&self, owner: u64, keys: &[LeaseKey]) -> Result<()> {
        let mut held = self.lock();
        if let Some((key, holder)) = keys
            .iter()
            .find_map(|k| held.get(k).filter(|h| **h != owner).map(|h| (k, *h)))
        {
            return Err(HpcError::ResourceBusy(format!(
                "{} is held by session {}",
                key, holder
            )));
        }
        for key in keys {
            held.insert(key.clone(), owner);
        }
        Ok(())
    }

    pub fn release_all(&self, owner: u64) {
        self.lock().retain(|_, holder| *holder != owner);
    }

    pub fn holder(&self, key: &LeaseKey) -> Option<u64> {
        self.lock().get(key).copied()
    }
}
