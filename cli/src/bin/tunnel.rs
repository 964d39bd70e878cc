//! hpcserve-tunnel: forward 127.0.0.1:<local_port> to <target_host>:<target_port>
//! through the login host.
//!
//! Prints exactly one line on stdout once listening:
//! `Tunnel listening on 127.0.0.1:<local_port> -> <target_host>:<target_port>`.
//! Logs go to stderr. Exit status: 0 on SIGTERM/SIGINT, 2 when authentication
//! fails, 1 on any other failure.

use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use hpcserve_core::remote::{askpass, Credentials, Secret};
use hpcserve_core::shutdown::install_shutdown_handler;
use hpcserve_core::tunnel::forward::{self, ForwardConfig};

#[derive(Parser, Debug)]
#[command(name = "hpcserve-tunnel")]
#[command(version)]
#[command(about = "Forward a local port to a compute node through the login host")]
struct TunnelArgs {
    /// Login host
    ssh_host: String,

    ssh_username: String,

    /// Password, private key path, or PEM key text
    #[arg(allow_hyphen_values = true)]
    ssh_secret: String,

    /// Compute node running the service
    target_host: String,

    target_port: u16,

    /// Local listening port on 127.0.0.1 (1-65535)
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    local_port: u16,

    /// SSH port on the login host
    #[arg(long, default_value_t = 22)]
    ssh_port: u16,
}


fn main() {
    if askpass::run_if_invoked() {
        return;
    }

    let args = TunnelArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let askpass_program = match std::env::current_exe() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("hpcserve-tunnel: cannot locate own executable: {}", e);
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("hpcserve-tunnel: cannot start runtime: {}", e);
            process::exit(1);
        }
    };

    let credentials = Credentials::new(
        &args.ssh_host,
        &args.ssh_username,
        Secret::parse(&args.ssh_secret),
    )
    .with_port(args.ssh_port);
    let config = ForwardConfig::new(
        credentials,
        &args.target_host,
        args.target_port,
        args.local_port,
        askpass_program,
    );

    let code = runtime.block_on(async move {
        let shutdown = match install_shutdown_handler() {
            Ok(token) => token,
            Err(e) => {
                eprintln!("hpcserve-tunnel: cannot install signal handlers: {}", e);
                return 1;
            }
        };
        match forward::run(config, shutdown).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("hpcserve-tunnel: {}", e);
                e.exit_code()
            }
        }
    });
    process::exit(code);
}
