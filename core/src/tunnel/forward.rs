//! Tunnel data plane, run inside the `hpcserve-tunnel` subprocess.
//!
//! Lifecycle: authenticate once against the login host, bind the local
//! listener, print the ready marker on stdout, then serve. Every accepted
//! connection gets its own `ssh -W <target>` channel; there is no shared
//! channel between connections.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::marker::{ReadyMarker, LISTEN_HOST};
use crate::error::{HpcError, Result};
use crate::remote::ssh::{self, SshClient};
use crate::remote::Credentials;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const CHANNEL_EXIT_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("authentication failed: {0}")]
    Auth(HpcError),

    #[error("cannot listen on 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] HpcError),
}

impl ForwardError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ForwardError::Auth(_) => 2,
            ForwardError::Bind { .. } | ForwardError::Other(_) => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub credentials: Credentials,
    pub target_host: String,
    pub target_port: u16,
    pub local_port: u16,
    pub client: SshClient,
    /// Program ssh runs as askpass for password secrets.
    pub askpass_program: PathBuf,
    pub auth_timeout: Duration,
}

impl ForwardConfig {
    pub fn new(
        credentials: Credentials,
        target_host: &str,
        target_port: u16,
        local_port: u16,
        askpass_program: impl Into<PathBuf>,
    ) -> Self {
        ForwardConfig {
            credentials,
            target_host: target_host.to_string(),
            target_port,
            local_port,
            client: SshClient::default(),
            askpass_program: askpass_program.into(),
            auth_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_client(mut self, client: SshClient) -> Self {
        self.client = client;
        self
    }

    fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}


/// Run the whole subprocess lifecycle until `shutdown` fires.
pub async fn run(config: ForwardConfig, shutdown: CancellationToken) -> std::result::Result<(), ForwardError> {
    tokio::select! {
        auth = authenticate(&config) => auth.map_err(ForwardError::Auth)?,
        _ = shutdown.cancelled() => return Ok(()),
    }

    let listener = TcpListener::bind((LISTEN_HOST, config.local_port))
        .await
        .map_err(|source| ForwardError::Bind {
            port: config.local_port,
            source,
        })?;

    let marker = ready_marker(&listener, &config).map_err(HpcError::from)?;
    announce(&marker).map_err(HpcError::from)?;

    serve(listener, Arc::new(config), shutdown).await?;
    Ok(())
}

/// Check the credentials with one `ssh … true` round-trip.
pub async fn authenticate(config: &ForwardConfig) -> Result<()> {
    let credentials = &config.credentials;
    let mut invocation = ssh::prepare(
        &config.client,
        &config.askpass_program,
        credentials,
        &[],
        &["true"],
    )?;
    invocation
        .command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = invocation.command.spawn().map_err(|e| {
        HpcError::connection(&credentials.host, format!("failed to launch ssh: {}", e))
    })?;
    let output = tokio::time::timeout(config.auth_timeout, child.wait_with_output())
        .await
        .map_err(|_| HpcError::timeout("ssh authentication", config.auth_timeout))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HpcError::connection(&credentials.host, stderr.trim()));
    }
    tracing::info!(host = %credentials.host, user = %credentials.username, "authenticated");
    Ok(())
}

/// The marker for the port the listener actually holds.
fn ready_marker(listener: &TcpListener, config: &ForwardConfig) -> std::io::Result<ReadyMarker> {
    let port = listener.local_addr()?.port();
    Ok(ReadyMarker::new(port, &config.target_host, config.target_port))
}

/// Write the ready marker to stdout. Stdout carries nothing else.
fn announce(marker: &ReadyMarker) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", marker)?;
    out.flush()
}

/// Accept connections until `shutdown` fires, forwarding each on its own
/// channel. In-flight connections are aborted on shutdown.
pub async fn serve(
    listener: TcpListener,
    config: Arc<ForwardConfig>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut connections = JoinSet::new();
    tracing::info!(
        local = ?listener.local_addr().ok(),
        target = %config.target(),
        "forwarding"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let config = Arc::clone(&config);
                    connections.spawn(async move {
                        if let Err(e) = splice(stream, peer, &config).await {
                            tracing::warn!(%peer, error = %e, "connection failed");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    tracing::info!(open = connections.len(), "shutting down");
    connections.shutdown().await;
    Ok(())
}

/// Copy bytes both ways between one client and a fresh `ssh -W` channel.
/// EOF on either side half-closes the other.
async fn splice(stream: TcpStream, peer: SocketAddr, config: &ForwardConfig) -> Result<()> {
    let mut invocation = ssh::prepare(
        &config.client,
        &config.askpass_program,
        &config.credentials,
        &["-W".to_string(), config.target()],
        &[],
    )?;
    invocation
        .command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = invocation.command.spawn().map_err(|e| {
        HpcError::connection(&config.credentials.host, format!("failed to launch ssh: {}", e))
    })?;
    let mut channel_in = child
        .stdin
        .take()
        .ok_or_else(|| HpcError::Tunnel("channel stdin unavailable".into()))?;
    let mut channel_out = child
        .stdout
        .take()
        .ok_or_else(|| HpcError::Tunnel("channel stdout unavailable".into()))?;
    tracing::debug!(%peer, pid = ?child.id(), "channel opened");

    let (mut client_read, mut client_write) = stream.into_split();
    let upstream = async {
        let n = tokio::io::copy(&mut client_read, &mut channel_in).await?;
        channel_in.shutdown().await?;
        Ok::<u64, std::io::Error>(n)
    };
    let downstream = async {
        let n = tokio::io::copy(&mut channel_out, &mut client_write).await?;
        client_write.shutdown().await?;
        Ok::<u64, std::io::Error>(n)
    };
    let copied = tokio::try_join!(upstream, downstream);

    drop(channel_in);
    if tokio::time::timeout(CHANNEL_EXIT_WAIT, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }

    let (sent, received) = copied?;
    tracing::debug!(%peer, sent, received, "connection closed");
    Ok(())
}
