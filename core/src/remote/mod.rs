//! Remote command execution over an authenticated shell session.
//!
//! `RemoteExecutor` is the trait every scheduler interaction goes through.
//! `SshExecutor` is the production implementation that drives the system
//! OpenSSH client. `MockExecutor` is the test double that records commands and
//! replays pre-configured results.

pub mod askpass;
pub mod mock;
pub mod ssh;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{HpcError, Result};

pub use mock::MockExecutor;
pub use ssh::SshExecutor;


// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// Authentication material for the login host. Never serialized, and the
/// `Debug` form is redacted.
#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    Password(String),
    /// Path to a private key file on the local machine.
    KeyFile(PathBuf),
    /// PEM-encoded private key text.
    KeyMaterial(String),
}

impl Secret {
    /// Classify a raw secret string: an existing file is a key file, PEM
    /// text is key material, anything else is a password.
    pub fn parse(raw: &str) -> Secret {
        if raw.trim_start().starts_with("-----BEGIN") {
            return Secret::KeyMaterial(raw.to_string());
        }
        let path = Path::new(raw);
        if !raw.is_empty() && path.is_file() {
            return Secret::KeyFile(path.to_path_buf());
        }
        Secret::Password(raw.to_string())
    }

    /// The raw string form, as handed to the tunnel subprocess.
    pub fn as_arg(&self) -> String {
        match self {
            Secret::Password(p) => p.clone(),
            Secret::KeyFile(p) => p.display().to_string(),
            Secret::KeyMaterial(m) => m.clone(),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Password(_) => write!(f, "Password(<redacted>)"),
            Secret::KeyFile(p) => write!(f, "KeyFile({})", p.display()),
            Secret::KeyMaterial(_) => write!(f, "KeyMaterial(<redacted>)"),
        }
    }
}


// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Login coordinates for the cluster. Held only while a session needs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Login host name or address.
    pub host: String,
    /// SSH port on the login host.
    pub port: u16,
    pub username: String,
    pub secret: Secret,
}

impl Credentials {
    pub fn new(host: &str, username: &str, secret: Secret) -> Self {
        Credentials {
            host: host.to_string(),
            port: 22,
            username: username.to_string(),
            secret,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// The `user@host` destination used by ssh.
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}


// ---------------------------------------------------------------------------
// CommandOutput
// ---------------------------------------------------------------------------

/// Captured result of one remote command. A non-zero exit code is a normal
/// value here; callers decide what it means.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// A zero-exit result with the given stdout.
    pub fn ok(stdout: &str) -> Self {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// A non-zero result with the given stderr.
    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into `HpcError::Command`.
    pub fn into_stdout(self) -> Result<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(HpcError::Command {
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}


/// Runs a command string on a remote host under the supplied credentials.
///
/// Implementations must transmit the command text unchanged (multi-line
/// here-documents included) and must not retry.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute_command(
        &self,
        credentials: &Credentials,
        command: &str,
    ) -> Result<CommandOutput>;
}
