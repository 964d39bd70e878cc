//! hpcserve core: provision an inference service on a batch-scheduled
//! cluster and expose it on a local port.
//!
//! Layers, bottom up: `remote` runs commands on the login host, `scheduler`
//! submits and polls jobs, `tunnel` forwards a local port to the compute
//! node, and `orchestrator` drives one session through all of it.

pub mod config;
pub mod error;
pub mod inference;
pub mod orchestrator;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod tunnel;

pub use error::{HpcError, Result};
pub use orchestrator::{JobOrchestrator, OrchestratorConfig, SessionRequest};
pub use session::{ResourceLeases, SessionSnapshot, SessionState};
