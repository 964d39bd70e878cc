//! hpcserve CLI: provision an inference service on the cluster and reach it
//! on a local port.
//!
//! # Usage
//!
//! ```text
//! hpcserve up --kind llm --gpus 2
//! hpcserve status 123456
//! hpcserve query "What is a GPU?"
//! hpcserve cancel --kind llm
//! hpcserve render --kind notebook
//! ```

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::{self, Stdio};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hpcserve_core::config::Settings;
use hpcserve_core::inference::InferenceClient;
use hpcserve_core::remote::{askpass, RemoteExecutor, Secret, SshExecutor};
use hpcserve_core::scheduler::{script, JobStatusPoller, JobSubmitter, ResourceRequest};
use hpcserve_core::shutdown::install_shutdown_handler;
use hpcserve_core::tunnel::TunnelManager;
use hpcserve_core::{
    HpcError, JobOrchestrator, ResourceLeases, Result, SessionRequest, SessionSnapshot,
    SessionState,
};

/// Environment variable holding the SSH secret (password, key path, or PEM).
const SECRET_ENV: &str = "HPCSERVE_SSH_SECRET";

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);


#[derive(Parser, Debug)]
#[command(name = "hpcserve")]
#[command(version)]
#[command(about = "Run an inference service on a batch cluster and tunnel it to localhost")]
struct Cli {
    /// Config file (default: $HPCSERVE_CONFIG or ~/.config/hpcserve/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job, wait for its node, open the tunnel, and hold until Ctrl-C
    Up(UpArgs),

    /// Show the scheduler state of one job
    Status { job_id: String },

    /// Cancel the kind's named job for the configured user
    Cancel {
        #[arg(long, default_value = "llm")]
        kind: String,
    },

    /// Send one prompt to the inference server
    Query {
        prompt: String,

        /// Local port of the tunnel (default: config, else the llm service port)
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        port: Option<u16>,

        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },

    /// Print the submission script without submitting it
    Render(KindArgs),
}

#[derive(Args, Debug)]
struct KindArgs {
    /// Job kind (built-in: llm, notebook)
    #[arg(long, default_value = "llm")]
    kind: String,

    #[arg(long)]
    nodes: Option<u32>,

    #[arg(long)]
    cpus: Option<u32>,

    /// Memory per node, e.g. 32G
    #[arg(long)]
    mem: Option<String>,

    #[arg(long)]
    gpus: Option<u32>,

    /// Wall-clock limit, e.g. 02:00:00
    #[arg(long)]
    time: Option<String>,

    #[arg(long)]
    partition: Option<String>,
}

impl KindArgs {
    /// Overlay the flags that were given on `base`.
    fn apply(&self, base: ResourceRequest) -> ResourceRequest {
        ResourceRequest {
            nodes: self.nodes.unwrap_or(base.nodes),
            cpus: self.cpus.unwrap_or(base.cpus),
            memory: self.mem.clone().unwrap_or(base.memory),
            gpus: self.gpus.unwrap_or(base.gpus),
            time_limit: self.time.clone().unwrap_or(base.time_limit),
            partition: self.partition.clone().or(base.partition),
            ..base
        }
    }
}

#[derive(Args, Debug)]
struct UpArgs {
    #[command(flatten)]
    kind: KindArgs,

    /// Local forwarding port (default: config, else the kind's service port)
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    local_port: Option<u16>,

    /// How long to wait for the server's /health after the tunnel is up
    #[arg(long, default_value = "600")]
    health_timeout_secs: u64,
}


fn main() {
    if askpass::run_if_invoked() {
        return;
    }

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("hpcserve: cannot start runtime: {}", e);
            process::exit(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(0) => {}
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("hpcserve: {}", e);
            process::exit(1);
        }
    }
}


async fn run(cli: Cli) -> Result<i32> {
    let settings = match cli.config {
        Some(ref path) => Settings::load(path)?,
        None => Settings::load_or_default(&Settings::default_path())?,
    };

    match cli.command {
        Commands::Up(args) => up(&settings, args, cli.json).await,
        Commands::Status { job_id } => status(&settings, &job_id, cli.json).await,
        Commands::Cancel { kind } => cancel(&settings, &kind).await,
        Commands::Query {
            prompt,
            port,
            timeout_secs,
        } => query(&settings, &prompt, port, timeout_secs).await,
        Commands::Render(args) => {
            let kind = settings.kind(&args.kind)?;
            let resources = args.apply(kind.resources.clone());
            print!("{}", script::render(&kind, &resources));
            Ok(0)
        }
    }
}


// ---------------------------------------------------------------------------
// up
// ---------------------------------------------------------------------------

async fn up(settings: &Settings, args: UpArgs, json: bool) -> Result<i32> {
    let kind = settings.kind(&args.kind.kind)?;
    let resources = args.kind.apply(kind.resources.clone());
    let local_port = args
        .local_port
        .or(settings.local_port)
        .unwrap_or(kind.service_port);
    let credentials = settings.credentials(read_secret(settings)?)?;

    let orchestrator = JobOrchestrator::new(
        ssh_executor(settings)?,
        TunnelManager::new(settings.tunnel_program()?, settings.tunnel_options()),
        Arc::new(ResourceLeases::new()),
        settings.orchestrator_config(),
    );
    let shutdown = install_shutdown_handler()?;

    let request = SessionRequest::new(credentials, kind)
        .with_resources(resources)
        .with_local_port(local_port);
    let job = orchestrator.start(request).await?;
    println!("submitted job {}", job.id);

    let settled = match orchestrator.run_until_settled(&shutdown).await {
        Ok(snapshot) => snapshot,
        Err(HpcError::Cancelled(_)) => {
            let snapshot = orchestrator.cancel().await?;
            report(&snapshot, json)?;
            return Ok(130);
        }
        Err(e) => {
            if let Err(stop_err) = orchestrator.stop().await {
                tracing::warn!(error = %stop_err, "teardown after failure incomplete");
            }
            return Err(e);
        }
    };

    if settled.state != SessionState::Ready {
        report(&settled, json)?;
        orchestrator.stop().await?;
        return Ok(1);
    }

    let client = InferenceClient::new(local_port, Duration::from_secs(10))?;
    println!("tunnel ready at {}", client.base_url());
    let limit = Duration::from_secs(args.health_timeout_secs);
    match client.wait_healthy(HEALTH_INTERVAL, limit, &shutdown).await {
        Ok(()) => println!("inference server healthy; Ctrl-C to stop"),
        Err(HpcError::Cancelled(_)) => {}
        Err(e) => tracing::warn!(error = %e, "inference server not healthy; keeping the session up"),
    }

    let healthy_exit = hold(&orchestrator, &shutdown, settings).await;
    let stopped = orchestrator.stop().await?;
    report(&stopped, json)?;
    Ok(if healthy_exit { 0 } else { 1 })
}

/// Keep polling while Ready. Returns true when the operator asked to stop,
/// false when the session left Ready on its own.
async fn hold(orchestrator: &JobOrchestrator, shutdown: &CancellationToken, settings: &Settings) -> bool {
    let interval = settings.orchestrator_config().poll_interval;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return true,
            _ = tokio::time::sleep(interval) => {}
        }
        match orchestrator.poll_once().await {
            Ok(snapshot) if snapshot.state == SessionState::Ready => {}
            Ok(snapshot) => {
                eprintln!("hpcserve: session left ready: {}", snapshot.state);
                return false;
            }
            Err(e) => tracing::warn!(error = %e, "poll failed"),
        }
    }
}

fn report(snapshot: &SessionSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }
    match snapshot.job {
        Some(ref job) => println!(
            "session {}: {} (job {} {}{})",
            snapshot.id,
            snapshot.state,
            job.id,
            job.state,
            job.node
                .as_deref()
                .map(|n| format!(" on {}", n))
                .unwrap_or_default()
        ),
        None => println!("session {}: {}", snapshot.id, snapshot.state),
    }
    Ok(())
}


// ---------------------------------------------------------------------------
// status / cancel / query
// ---------------------------------------------------------------------------

async fn status(settings: &Settings, job_id: &str, json: bool) -> Result<i32> {
    let credentials = settings.credentials(read_secret(settings)?)?;
    let poller = JobStatusPoller::new(ssh_executor(settings)?);
    let status = poller.get_status(&credentials, job_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!(
            "{} {} {}",
            job_id,
            status.state,
            status.node.as_deref().unwrap_or("-")
        );
    }
    Ok(0)
}

async fn cancel(settings: &Settings, kind_name: &str) -> Result<i32> {
    let kind = settings.kind(kind_name)?;
    let credentials = settings.credentials(read_secret(settings)?)?;
    let submitter = JobSubmitter::new(ssh_executor(settings)?);
    submitter.cancel_by_name(&credentials, &kind.job_name).await?;
    println!("cancelled {} jobs for {}", kind.job_name, credentials.username);
    Ok(0)
}

async fn query(settings: &Settings, prompt: &str, port: Option<u16>, timeout_secs: u64) -> Result<i32> {
    let port = match port.or(settings.local_port) {
        Some(port) => port,
        None => settings.kind("llm")?.service_port,
    };
    let client = InferenceClient::new(port, Duration::from_secs(timeout_secs))?;
    println!("{}", client.query(prompt).await?);
    Ok(0)
}


// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ssh_executor(settings: &Settings) -> Result<Arc<dyn RemoteExecutor>> {
    let askpass_program = std::env::current_exe()?;
    Ok(Arc::new(SshExecutor::new(
        askpass_program,
        settings.command_timeout(),
    )))
}

/// `$HPCSERVE_SSH_SECRET`, else a prompt on the terminal.
fn read_secret(settings: &Settings) -> Result<Secret> {
    if let Ok(raw) = std::env::var(SECRET_ENV) {
        return Ok(Secret::parse(&raw));
    }

    eprint!(
        "Password or key file for {}@{}: ",
        settings.cluster.username, settings.cluster.host
    );
    std::io::stderr().flush()?;
    let silenced = set_echo(false);
    let mut line = String::new();
    let read = std::io::stdin().lock().read_line(&mut line);
    if silenced {
        set_echo(true);
        eprintln!();
    }
    read?;

    let raw = line.trim_end_matches(|c| c == '\r' || c == '\n');
    if raw.is_empty() {
        return Err(HpcError::Config(format!(
            "no SSH secret given (set {} or type one at the prompt)",
            SECRET_ENV
        )));
    }
    Ok(Secret::parse(raw))
}

/// Toggle terminal echo with `stty`. False when stdin is not a terminal.
fn set_echo(on: bool) -> bool {
    process::Command::new("stty")
        .arg(if on { "echo" } else { "-echo" })
        .stdin(Stdio::inherit())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
