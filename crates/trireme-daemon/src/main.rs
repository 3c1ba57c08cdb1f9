//! trireme-daemon - zero-trust network segmentation agent.
//!
//! `run` starts the host agent: supervisor, datapath, port-set
//! tracker, and the remote-datapath RPC socket. `remote` is the far
//! side of that socket: it joins a PU's network namespace and runs an
//! identical datapath there, driven over RPC by the host agent's proxy
//! enforcer.
//!
//! The kernel queue binding that feeds intercepted packets to the
//! datapath workers is a collaborator linked at deployment time; this
//! binary owns everything on the control plane.

mod config;
mod remote;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use rand::RngCore as _;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

use trireme_core::collector::LogCollector;
use trireme_core::datapath::{Datapath, DatapathConfig};
use trireme_core::enforcer::{Enforcer, Mode};
use trireme_core::net::CidrV4;
use trireme_core::portset::{PortSetTracker, REFRESH_INTERVAL};
use trireme_core::secrets::SecretsSpec;
use trireme_core::supervisor::{CommandProvider, RuleProvider, SetProvider, Supervisor};

use crate::config::AgentConfig;
use crate::remote::{enter_network_namespace, RemoteServer};

/// trireme - host agent for zero-trust network segmentation.
#[derive(Parser, Debug)]
#[command(name = "trireme-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the agent configuration file.
    #[arg(short, long, default_value = "trireme.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the host agent.
    Run {
        /// Override the enforcer mode from the config file.
        #[arg(long)]
        mode: Option<Mode>,

        /// Override the target networks from the config file.
        #[arg(long, value_delimiter = ',')]
        target_networks: Option<Vec<CidrV4>>,
    },

    /// Run a remote datapath inside a PU's network namespace.
    Remote {
        /// Network namespace to join before starting.
        #[arg(long)]
        ns_path: Option<PathBuf>,

        /// Command socket to serve.
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let agent_config = if args.config.exists() {
        AgentConfig::from_file(&args.config)?
    } else {
        info!(config = %args.config.display(), "no config file, using defaults");
        AgentConfig::default()
    };

    match args.command {
        Command::Run {
            mode,
            target_networks,
        } => run(agent_config, mode, target_networks),
        Command::Remote { ns_path, socket } => run_remote(agent_config, ns_path, socket),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).context("invalid log level")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();
    Ok(())
}

/// Builds the datapath + supervisor pair shared by both subcommands.
fn build_stack(
    config: &AgentConfig,
    mode: Mode,
    target_networks: Vec<CidrV4>,
) -> Result<(Arc<Datapath>, Arc<Supervisor>, Arc<PortSetTracker>)> {
    let secrets_spec = match &config.secrets {
        Some(spec) => spec.clone(),
        None => {
            warn!("no signing material configured, generating a per-run PSK");
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            SecretsSpec::Psk {
                key_base64: base64::engine::general_purpose::STANDARD.encode(key),
            }
        },
    };
    let secrets = secrets_spec
        .build()
        .context("building signing material")?;

    let mut datapath_config = DatapathConfig::new(config.server_id.clone(), mode);
    datapath_config.mutual_auth = config.mutual_auth;
    datapath_config.packet_logs = config.packet_logs;

    let datapath = Arc::new(Datapath::new(
        datapath_config,
        secrets,
        Arc::new(LogCollector),
    ));

    let provider = Arc::new(CommandProvider);
    let portset = Arc::new(PortSetTracker::new(
        Arc::clone(&provider) as Arc<dyn SetProvider>
    ));
    let supervisor = Arc::new(
        Supervisor::new(
            Arc::clone(&datapath) as Arc<dyn Enforcer>,
            mode,
            target_networks,
            Arc::clone(&provider) as Arc<dyn RuleProvider>,
            provider as Arc<dyn SetProvider>,
            Some(Arc::clone(&portset)),
        )
        .context("building supervisor")?,
    );

    Ok((datapath, supervisor, portset))
}

fn parse_networks(config: &AgentConfig) -> Result<Vec<CidrV4>> {
    config
        .target_networks
        .iter()
        .map(|n| {
            n.parse()
                .map_err(|e| anyhow::anyhow!("target network {n}: {e}"))
        })
        .collect()
}

fn run(
    config: AgentConfig,
    mode_override: Option<Mode>,
    networks_override: Option<Vec<CidrV4>>,
) -> Result<()> {
    let mode = match mode_override {
        Some(mode) => mode,
        None => config
            .mode
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?,
    };
    let target_networks = match networks_override {
        Some(networks) => networks,
        None => parse_networks(&config)?,
    };

    let (datapath, supervisor, portset) = build_stack(&config, mode, target_networks)?;

    supervisor.start().context("starting supervisor")?;
    datapath
        .start()
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let portset_handle = portset.spawn(REFRESH_INTERVAL);

    // Remote enforcers in PU namespaces are driven through this socket.
    let server = RemoteServer::bind(
        &config.remote_socket,
        Arc::clone(&datapath),
        Arc::clone(&supervisor),
    )?;
    let server_thread = std::thread::Builder::new()
        .name("trireme-rpc".to_string())
        .spawn(move || server.serve())?;

    info!(mode = %mode, "agent running");
    wait_for_shutdown()?;

    portset_handle.stop();
    supervisor.stop();
    if let Err(err) = datapath.stop() {
        warn!(%err, "datapath stop failed");
    }
    drop(server_thread);

    info!("agent stopped");
    Ok(())
}

fn run_remote(
    config: AgentConfig,
    ns_path: Option<PathBuf>,
    socket: Option<PathBuf>,
) -> Result<()> {
    if let Some(ns_path) = ns_path {
        enter_network_namespace(&ns_path)?;
    }

    let target_networks = parse_networks(&config)?;
    let (datapath, supervisor, portset) =
        build_stack(&config, Mode::RemoteContainer, target_networks)?;
    let portset_handle = portset.spawn(REFRESH_INTERVAL);

    let socket = socket.unwrap_or_else(|| config.remote_socket.clone());
    let server = RemoteServer::bind(&socket, datapath, supervisor)?;

    // The host agent drives everything else over the socket.
    server.serve();

    portset_handle.stop();
    bail!("remote command socket closed")
}

fn wait_for_shutdown() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("building signal runtime")?;

    runtime.block_on(async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        Ok::<_, std::io::Error>(())
    })?;
    Ok(())
}
