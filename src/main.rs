//! PIM - private instance manager
//!
//! Runs one role per invocation: the token directory, the registration
//! server that launches instances, the tunnel that relays to them, or a
//! standalone directory + registration pair in one process.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use pim_directory::{DirectoryClient, DirectoryServer, DirectoryServerConfig};
use pim_launcher::{InstanceLauncher, LauncherConfig, LauncherKind};
use pim_registry::Registry;
use pim_server_registration::{ConnectionHint, RegistrationServer, RegistrationServerConfig};
use pim_server_tunnel::{TunnelServer, TunnelServerConfig, TunnelSettings};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PIM - Private instances behind a single tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "pim")]
#[command(about = "PIM - Private instances behind a single tunnel endpoint")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Worker threads (0 = one per available core)
    #[arg(long, env = "THREADS", default_value_t = 0, global = true)]
    threads: usize,

    /// Token and instance lifetime in seconds
    #[arg(long, env = "TIMEOUT", default_value_t = 30, global = true)]
    timeout: u64,

    /// Directory address used by the registration and tunnel servers
    #[arg(long, env = "API_ADDRESS", default_value = "127.0.0.1", global = true)]
    api_address: String,

    /// Directory port
    #[arg(long, env = "API_PORT", default_value_t = 4001, global = true)]
    api_port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the token directory
    Directory(DirectoryArgs),

    /// Run the registration server that launches private instances
    #[command(long_about = r#"
Run the registration server. Every client that connects gets a private
instance, registered in the directory under a fresh token, and stopped
again once TIMEOUT (or INSTANCE_TIMEOUT) seconds have passed.

Exactly one of DOCKER_COMMAND or BASH_COMMAND must be set; DOCKER_COMMAND
wins if both are. Placeholders: %d / {port} for the allocated port,
%s / {name} for the container name.

EXAMPLES:
  DOCKER_COMMAND="docker run -d --rm --name %s -p %d:1337 challenge" pim instances
  BASH_COMMAND="/srv/challenge --port %d" USER_UID=1000 USER_GID=1000 pim instances
    "#)]
    Instances(InstancesArgs),

    /// Run the tunnel that relays token holders to their instance
    Tunnel(TunnelArgs),

    /// Run the directory and the registration server in one process
    Standalone {
        #[command(flatten)]
        directory: DirectoryArgs,

        #[command(flatten)]
        instances: InstancesArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct DirectoryArgs {
    /// Address the directory listens on
    #[arg(long, env = "API_BIND_ADDRESS", default_value = "0.0.0.0")]
    api_bind_address: IpAddr,

    /// Seconds between sweeps of expired tokens
    #[arg(long, env = "CLEANUP_INTERVAL", default_value_t = 10)]
    cleanup_interval: u64,
}

#[derive(Args, Debug, Clone)]
struct InstancesArgs {
    /// Registration port
    #[arg(long, env = "SERVER_PORT", default_value_t = 4000)]
    server_port: u16,

    /// Container launch command
    #[arg(long, env = "DOCKER_COMMAND")]
    docker_command: Option<String>,

    /// Process launch command
    #[arg(long, env = "BASH_COMMAND")]
    bash_command: Option<String>,

    /// Process launch command, older name of BASH_COMMAND
    #[arg(long = "command", env = "COMMAND", hide = true)]
    legacy_command: Option<String>,

    /// Address registered in the directory for launched instances
    #[arg(long, env = "INSTANCES_ADDRESS", default_value = "127.0.0.1")]
    instances_address: String,

    /// Address shown to clients in the connection hint [default: 127.0.0.1]
    #[arg(long, env = "CHALLENGE_ADDRESS")]
    challenge_address: Option<String>,

    /// Older name of CHALLENGE_ADDRESS
    #[arg(long, env = "CHALLENGE_ENDPOINT", hide = true)]
    challenge_endpoint: Option<String>,

    /// Port shown to clients in the connection hint
    #[arg(long, env = "CHALLENGE_PORT", default_value = "8080")]
    challenge_port: String,

    /// Tell clients to connect with TLS
    #[arg(long, env = "SSL")]
    ssl: bool,

    /// Run bash instances as this user id
    #[arg(long, env = "USER_UID")]
    user_uid: Option<u32>,

    /// Run bash instances as this group id
    #[arg(long, env = "USER_GID")]
    user_gid: Option<u32>,

    /// Instance lifetime in seconds, if different from TIMEOUT
    #[arg(long, env = "INSTANCE_TIMEOUT")]
    instance_timeout: Option<u64>,

    /// Seconds a bash instance may take to announce its port
    #[arg(long, env = "LAUNCH_TIMEOUT", default_value_t = 10)]
    launch_timeout: u64,

    /// Stop the instance as soon as its client disconnects
    #[arg(long, env = "TERMINATE_ON_DISCONNECT")]
    terminate_on_disconnect: bool,
}

#[derive(Args, Debug, Clone)]
struct TunnelArgs {
    /// Directory host for this role; overrides API_ADDRESS
    #[arg(long, env = "API_ENDPOINT")]
    api_endpoint: Option<String>,

    /// Tunnel port
    #[arg(long, env = "TUNNEL_PORT", default_value_t = 4002)]
    tunnel_port: u16,

    /// Dial this host instead of the service name stored in the directory
    #[arg(long, env = "INSTANCE_ENDPOINT")]
    instance_endpoint: Option<String>,

    /// Seconds a client may take to send its token (unset = no limit)
    #[arg(long, env = "TOKEN_TIMEOUT")]
    token_timeout: Option<u64>,
}

/// Setup logging; RUST_LOG overrides the level picked by --verbose
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn build_runtime(threads: usize) -> Result<tokio::runtime::Runtime> {
    let workers = if threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        threads
    };
    info!("Using {} worker threads", workers);

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .context("Failed to build async runtime")
}

/// Resolves on Ctrl+C; never resolves if the handler cannot be installed
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down...");
}

fn directory_endpoint(cli: &Cli) -> String {
    format!("{}:{}", cli.api_address, cli.api_port)
}

fn tunnel_directory_endpoint(cli: &Cli, args: &TunnelArgs) -> String {
    match &args.api_endpoint {
        Some(host) => format!("{}:{}", host, cli.api_port),
        None => directory_endpoint(cli),
    }
}

/// Address to dial a directory bound at `bound`; wildcard binds are reached over loopback
fn dial_address(bound: SocketAddr) -> SocketAddr {
    match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), bound.port())
        }
        _ => bound,
    }
}

fn launcher_config(args: &InstancesArgs) -> Result<LauncherConfig> {
    let set = |command: &Option<String>| {
        command
            .as_ref()
            .filter(|c| !c.trim().is_empty())
            .cloned()
    };
    let (kind, command) = if let Some(command) = set(&args.docker_command) {
        (LauncherKind::Docker, command)
    } else if let Some(command) = set(&args.bash_command).or_else(|| set(&args.legacy_command)) {
        (LauncherKind::Bash, command)
    } else {
        bail!("No command provided: set DOCKER_COMMAND or BASH_COMMAND")
    };

    let mut config = LauncherConfig::new(kind, command);
    config.instance_address = args.instances_address.clone();
    config.uid = args.user_uid;
    config.gid = args.user_gid;
    config.launch_timeout = Duration::from_secs(args.launch_timeout);
    Ok(config)
}

fn registration_config(
    cli: &Cli,
    args: &InstancesArgs,
    directory_addr: String,
) -> RegistrationServerConfig {
    RegistrationServerConfig {
        bind_addr: SocketAddr::from(([0, 0, 0, 0], args.server_port)),
        directory_addr,
        directory_timeout: DirectoryClient::DEFAULT_TIMEOUT,
        instance_ttl: Duration::from_secs(args.instance_timeout.unwrap_or(cli.timeout)),
        hint: ConnectionHint {
            address: args
                .challenge_address
                .clone()
                .or_else(|| args.challenge_endpoint.clone())
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port: args.challenge_port.clone(),
            ssl: args.ssl,
        },
        terminate_on_disconnect: args.terminate_on_disconnect,
    }
}

async fn bind_directory(cli: &Cli, args: &DirectoryArgs) -> Result<DirectoryServer> {
    let config = DirectoryServerConfig {
        bind_addr: SocketAddr::new(args.api_bind_address, cli.api_port),
        sweep_interval: Duration::from_secs(args.cleanup_interval),
        ..Default::default()
    };
    let registry = Arc::new(Registry::new(Duration::from_secs(cli.timeout)));

    DirectoryServer::bind(config, registry)
        .await
        .context("Failed to start directory")
}

async fn bind_registration(
    cli: &Cli,
    args: &InstancesArgs,
    directory_addr: String,
) -> Result<RegistrationServer> {
    let launcher_config = launcher_config(args)?;
    info!(
        "Launching {} instances with: {}",
        launcher_config.kind, launcher_config.command
    );
    let launcher = InstanceLauncher::from_config(launcher_config)
        .context("Invalid instance launch command")?;

    RegistrationServer::bind(
        registration_config(cli, args, directory_addr),
        Arc::new(launcher),
    )
    .await
    .context("Failed to start registration server")
}

async fn run_directory(cli: &Cli, args: &DirectoryArgs) -> Result<()> {
    let server = bind_directory(cli, args).await?;

    tokio::select! {
        result = server.run() => result.context("Directory stopped")?,
        _ = shutdown_signal() => {}
    }
    Ok(())
}

async fn run_instances(cli: &Cli, args: &InstancesArgs) -> Result<()> {
    let server = bind_registration(cli, args, directory_endpoint(cli)).await?;

    tokio::select! {
        result = server.run() => result.context("Registration server stopped")?,
        _ = shutdown_signal() => {}
    }
    Ok(())
}

async fn run_tunnel(cli: &Cli, args: &TunnelArgs) -> Result<()> {
    let config = TunnelServerConfig {
        bind_addr: SocketAddr::from(([0, 0, 0, 0], args.tunnel_port)),
        directory_addr: tunnel_directory_endpoint(cli, args),
        directory_timeout: DirectoryClient::DEFAULT_TIMEOUT,
        settings: TunnelSettings {
            token_timeout: args.token_timeout.map(Duration::from_secs),
            instance_host: args.instance_endpoint.clone(),
            ..Default::default()
        },
    };
    let server = TunnelServer::bind(config)
        .await
        .context("Failed to start tunnel server")?;

    tokio::select! {
        result = server.run() => result.context("Tunnel server stopped")?,
        _ = shutdown_signal() => {}
    }
    Ok(())
}

async fn run_standalone(
    cli: &Cli,
    directory_args: &DirectoryArgs,
    instances_args: &InstancesArgs,
) -> Result<()> {
    let directory = bind_directory(cli, directory_args).await?;
    let local_directory = dial_address(directory.local_addr()?).to_string();
    let directory_task = tokio::spawn(directory.run());

    // Registration only starts once the directory answers
    DirectoryClient::new(local_directory.clone())
        .wait_until_ready(Duration::from_secs(1), Some(30))
        .await
        .context("Directory did not come up")?;

    let registration = bind_registration(cli, instances_args, local_directory).await?;

    tokio::select! {
        result = directory_task => {
            result.context("Directory task panicked")?.context("Directory stopped")?;
        }
        result = registration.run() => result.context("Registration server stopped")?,
        _ = shutdown_signal() => {}
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    let runtime = build_runtime(cli.threads)?;
    runtime.block_on(async {
        match &cli.command {
            Commands::Directory(args) => run_directory(&cli, args).await,
            Commands::Instances(args) => run_instances(&cli, args).await,
            Commands::Tunnel(args) => run_tunnel(&cli, args).await,
            Commands::Standalone {
                directory,
                instances,
            } => run_standalone(&cli, directory, instances).await,
        }
    })?;

    info!("PIM stopped");
    Ok(())
}
