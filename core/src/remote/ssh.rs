//! OpenSSH-backed remote execution.
//!
//! `prepare` builds an `ssh` invocation for a set of credentials: base options,
//! identity handling, and the askpass hook for passwords. It is shared by
//! `SshExecutor` and by the tunnel data plane, which opens one `ssh -W`
//! channel per forwarded connection.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::askpass;
use super::{CommandOutput, Credentials, RemoteExecutor, Secret};
use crate::error::{HpcError, Result};

/// OpenSSH reserves exit status 255 for its own failures (auth, network).
const SSH_FAILURE_EXIT: i32 = 255;


// ---------------------------------------------------------------------------
// Invocation building
// ---------------------------------------------------------------------------

/// A prepared `ssh` command. Owns the temporary identity file, if any, for as
/// long as the child process needs it.
pub struct SshInvocation {
    pub command: Command,
    _identity: Option<NamedTempFile>,
}

/// Base ssh options (port, host-key policy, timeouts) for `credentials`.
pub fn ssh_base_args(credentials: &Credentials) -> Vec<String> {
    vec![
        "-p".to_string(),
        credentials.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        "ConnectTimeout=10".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=30".to_string(),
    ]
}

/// The ssh client to run: a program plus any leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshClient {
    pub program: String,
    pub args: Vec<String>,
}

impl SshClient {
    pub fn new(program: &str) -> Self {
        SshClient {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl Default for SshClient {
    fn default() -> Self {
        SshClient::new("ssh")
    }
}

/// Build an ssh invocation: `ssh <base> <auth> <extra_opts> user@host <remote_command>`.
pub fn prepare(
    client: &SshClient,
    askpass_program: &Path,
    credentials: &Credentials,
    extra_opts: &[String],
    remote_command: &[&str],
) -> Result<SshInvocation> {
    let mut command = Command::new(&client.program);
    command.args(&client.args);
    command.args(ssh_base_args(credentials));

    let mut identity = None;
    match &credentials.secret {
        Secret::Password(password) => {
            command.args([
                "-o",
                "PreferredAuthentications=keyboard-interactive,password",
                "-o",
                "PubkeyAuthentication=no",
                "-o",
                "NumberOfPasswordPrompts=1",
            ]);
            askpass::apply(&mut command, askpass_program, password);
        }
        Secret::KeyFile(path) => {
            command.args(key_args(path));
        }
        Secret::KeyMaterial(material) => {
            let file = write_identity(material)?;
            command.args(key_args(file.path()));
            identity = Some(file);
        }
    }

    command.args(extra_opts);
    command.arg(credentials.user_at_host());
    command.args(remote_command);
    Ok(SshInvocation {
        command,
        _identity: identity,
    })
}

fn key_args(path: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        path.display().to_string(),
        "-o".to_string(),
        "IdentitiesOnly=yes".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ]
}

/// Write PEM key material to a private temp file (created 0600).
fn write_identity(material: &str) -> Result<NamedTempFile> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix("hpcserve-key-")
        .tempfile()?;
    file.write_all(material.as_bytes())?;
    if !material.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(file)
}


// ---------------------------------------------------------------------------
// SshExecutor
// ---------------------------------------------------------------------------

/// Production executor. The command text is written to a remote `bash -s` on
/// stdin, so it reaches the remote shell byte-for-byte.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    client: SshClient,
    askpass_program: PathBuf,
    timeout: Duration,
}

impl SshExecutor {
    pub fn new(askpass_program: impl Into<PathBuf>, timeout: Duration) -> Self {
        SshExecutor {
            client: SshClient::default(),
            askpass_program: askpass_program.into(),
            timeout,
        }
    }

    /// Override the ssh client.
    pub fn with_client(mut self, client: SshClient) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute_command(
        &self,
        credentials: &Credentials,
        command: &str,
    ) -> Result<CommandOutput> {
        let mut invocation = prepare(
            &self.client,
            &self.askpass_program,
            credentials,
            &[],
            &["bash", "-s"],
        )?;
        invocation
            .command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = invocation.command.spawn().map_err(|e| {
            HpcError::connection(&credentials.host, format!("failed to launch ssh: {}", e))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| HpcError::connection(&credentials.host, "ssh stdin unavailable"))?;
        let script = command.to_string();
        let feeder = tokio::spawn(async move {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await
        });

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                feeder.abort();
                return Err(HpcError::timeout(
                    format!("remote command on {}", credentials.host),
                    self.timeout,
                ));
            }
        };
        if let Ok(Err(e)) = feeder.await {
            tracing::debug!(error = %e, "remote shell closed stdin early");
        }

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if exit_code == SSH_FAILURE_EXIT || output.status.code().is_none() {
            tracing::warn!(host = %credentials.host, exit_code, "ssh session failed");
            return Err(HpcError::connection(&credentials.host, stderr.trim()));
        }

        tracing::debug!(host = %credentials.host, exit_code, "remote command finished");
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(inv: &SshInvocation) -> Vec<String> {
        inv.command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    fn password_creds() -> Credentials {
        Credentials::new("login.hpc", "alice", Secret::Password("pw".into()))
    }

    #[test]
    fn prepare_password_uses_askpass_and_ends_with_remote_command() {
        let inv = prepare(
            &SshClient::default(),
            Path::new("/bin/hpcserve"),
            &password_creds(),
            &[],
            &["bash", "-s"],
        )
        .unwrap();
        let args = args_of(&inv);
        assert!(args.contains(&"PubkeyAuthentication=no".to_string()));
        let dest = args.iter().position(|a| a == "alice@login.hpc").unwrap();
        assert_eq!(&args[dest + 1..], &["bash".to_string(), "-s".to_string()]);
    }

    #[test]
    fn prepare_places_extra_opts_before_destination() {
        let inv = prepare(
            &SshClient::default(),
            Path::new("/bin/hpcserve"),
            &password_creds(),
            &["-W".to_string(), "node42:5001".to_string()],
            &[],
        )
        .unwrap();
        let args = args_of(&inv);
        let w = args.iter().position(|a| a == "-W").unwrap();
        let dest = args.iter().position(|a| a == "alice@login.hpc").unwrap();
        assert!(w < dest);
        assert_eq!(args.last().unwrap(), "alice@login.hpc");
    }

    #[test]
    fn prepare_key_material_writes_identity_file() {
        let creds = Credentials::new(
            "login.hpc",
            "alice",
            Secret::KeyMaterial("-----BEGIN KEY-----\nabc\n-----END KEY-----".into()),
        );
        let inv = prepare(&SshClient::default(), Path::new("/bin/hpcserve"), &creds, &[], &["true"]).unwrap();
        let args = args_of(&inv);
        let i = args.iter().position(|a| a == "-i").unwrap();
        let key_path = PathBuf::from(&args[i + 1]);
        let written = std::fs::read_to_string(&key_path).unwrap();
        assert!(written.ends_with("-----END KEY-----\n"));
        drop(inv);
        assert!(!key_path.exists());
    }

    #[test]
    fn base_args_include_port() {
        let creds = password_creds().with_port(2222);
        let args = ssh_base_args(&creds);
        assert_eq!(&args[..2], &["-p".to_string(), "2222".to_string()]);
    }

    /// A stand-in ssh: a shell script that ignores the ssh arguments.
    fn fake_ssh(dir: &Path, body: &str) -> SshClient {
        let path = dir.join("fake-ssh.sh");
        std::fs::write(&path, format!("{}\n", body)).unwrap();
        SshClient::new("sh").with_args(vec![path.display().to_string()])
    }

    #[tokio::test]
    async fn executor_transmits_heredoc_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = fake_ssh(dir.path(), "exec sh -s");
        let exec = SshExecutor::new("/bin/true", Duration::from_secs(10)).with_client(ssh);
        let cmd = "cat <<'EOF'\nline $HOME \"quoted\"\n  indented\nEOF\n";
        let out = exec.execute_command(&password_creds(), cmd).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "line $HOME \"quoted\"\n  indented\n");
    }

    #[tokio::test]
    async fn executor_reports_nonzero_exit_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = fake_ssh(dir.path(), "exec sh -s");
        let exec = SshExecutor::new("/bin/true", Duration::from_secs(10)).with_client(ssh);
        let out = exec
            .execute_command(&password_creds(), "echo nope >&2; exit 3")
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr, "nope\n");
    }

    #[tokio::test]
    async fn executor_maps_255_to_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = fake_ssh(dir.path(), "echo 'Permission denied' >&2; exit 255");
        let exec = SshExecutor::new("/bin/true", Duration::from_secs(10)).with_client(ssh);
        let err = exec
            .execute_command(&password_creds(), "true")
            .await
            .unwrap_err();
        match err {
            HpcError::Connection { host, reason } => {
                assert_eq!(host, "login.hpc");
                assert!(reason.contains("Permission denied"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn executor_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = fake_ssh(dir.path(), "exec sleep 5");
        let exec =
            SshExecutor::new("/bin/true", Duration::from_millis(200)).with_client(ssh);
        let err = exec
            .execute_command(&password_creds(), "true")
            .await
            .unwrap_err();
        assert!(matches!(err, HpcError::Timeout { .. }));
    }

    #[tokio::test]
    async fn executor_missing_binary_is_connection_error() {
        let exec = SshExecutor::new("/bin/true", Duration::from_secs(1))
            .with_client(SshClient::new("/nonexistent/ssh-binary"));
        let err = exec
            .execute_command(&password_creds(), "true")
            .await
            .unwrap_err();
        assert!(matches!(err, HpcError::Connection { .. }));
    }
}
