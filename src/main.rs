//! netferry - single-host overlay network agent
//!
//! Provisions namespace-backed VXLAN networks, allocates endpoint
//! addresses and tunnels TCP connections into those namespaces.

mod cli;
mod error;
mod manifest;
mod names;
mod network;
mod server;
mod store;
mod tunnel;
mod warden;

use cli::{Cli, Commands, EndpointAction, NetworkAction};
use error::Result;
use manifest::AgentConfig;
use names::NameGenerator;
use network::{
    EndpointCreate, EndpointRepository, LinuxDriver, NamespaceManager, Network, NetworkCreate,
    NetworkLocks, NetworkRepository,
};
use server::Agent;
use std::net::SocketAddrV4;
use std::sync::Arc;
use store::{FileStore, Store};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tunnel::{ProcessLauncher, TunnelBroker, TunnelClient, TunnelRequest, WorkerArgs};
use warden::{Warden, WardenHandle};

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Logs go to stderr so command output stays clean on stdout
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| error::Error::Io(std::io::Error::other(e)))
}

/// Repositories over the configured state file and the host kernel
struct Context {
    names: Arc<NameGenerator>,
    networks: Arc<NetworkRepository<LinuxDriver>>,
    endpoints: Arc<EndpointRepository<LinuxDriver>>,
}

impl Context {
    fn open(config: &AgentConfig) -> Result<Self> {
        let store: Arc<dyn Store> = Arc::new(FileStore::open(&config.state_file)?);
        let driver = Arc::new(LinuxDriver::new(NamespaceManager::new(&config.netns_dir)));
        let names = Arc::new(NameGenerator::new());

        // Shared with every other netferry process using this state file
        let locks = Arc::new(NetworkLocks::with_dir(config.lock_dir()));

        let networks = Arc::new(
            NetworkRepository::new(
                Arc::clone(&store),
                Arc::clone(&driver),
                Arc::clone(&names),
                config.default_ip_range.clone(),
            )
            .with_locks(Arc::clone(&locks)),
        );
        let endpoints = Arc::new(EndpointRepository::new(
            store,
            driver,
            Arc::clone(&names),
            locks,
            config.public_hostname.clone(),
            config.public_ip.clone(),
        ));

        Ok(Self {
            names,
            networks,
            endpoints,
        })
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        // Commands that don't require config
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            Ok(())
        }
        Commands::NetnsPipeSocket {
            ns_path,
            ip,
            port,
            rendezvous,
        } => {
            let args = WorkerArgs {
                ns_path,
                target: SocketAddrV4::new(ip, port),
                rendezvous,
            };
            let stats = runtime()?.block_on(tunnel::worker::run(args))?;
            tracing::debug!(sent = stats.forward, received = stats.backward, "worker done");
            Ok(())
        }

        command => {
            let config = manifest::load(&cli.config)?;
            let rt = runtime()?;
            match command {
                Commands::Agent => rt.block_on(run_agent(config)),
                Commands::Network { action } => rt.block_on(network_command(&config, action)),
                Commands::Endpoint { action } => rt.block_on(endpoint_command(&config, action)),
                Commands::Connect {
                    agent,
                    network,
                    ip,
                    port,
                    bind,
                } => {
                    let agent = agent.unwrap_or_else(|| config.listen.to_string());
                    let request = TunnelRequest {
                        network_id: network,
                        ip,
                        port,
                    };
                    rt.block_on(connect(agent, request, bind))
                }
                Commands::Completion { .. } | Commands::NetnsPipeSocket { .. } => unreachable!(),
            }
        }
    }
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    let ctx = Context::open(&config)?;
    let broker = Arc::new(TunnelBroker::new(
        config.runtime_dir(),
        Arc::clone(&ctx.names),
        Arc::new(ProcessLauncher::current()?),
    ));

    // Converge what is already stored before serving requests
    let failures = ctx.networks.ensure_all().await?;
    if !failures.is_empty() {
        warn!(count = failures.len(), "some networks failed to converge at startup");
    }

    let mut warden = Warden::new(Arc::clone(&ctx.networks), config.reconcile.clone());
    let warden_handle = WardenHandle::new(&warden);
    let warden_task = tokio::spawn(async move {
        warden.run().await;
    });

    let listener = TcpListener::bind(config.listen).await?;
    let agent = Arc::new(Agent::new(ctx.networks, ctx.endpoints, broker));
    agent.serve(listener, shutdown_signal()).await?;

    warden_handle.shutdown().await;
    warden_task.await?;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot watch SIGTERM, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    info!("shutdown requested");
}

fn print_network(network: &Network) {
    println!("Network:   {}", network.id);
    println!("  Name:      {}", network.name);
    println!("  VNI:       {}", network.vxlan_vni);
    println!("  Range:     {}", network.ip_range);
    println!(
        "  Namespace: {}",
        if network.is_provisioned() {
            network.ns_handle_path.as_str()
        } else {
            "(not created)"
        }
    );
    println!("  Created:   {}", network.created_at.to_rfc3339());
}

async fn network_command(config: &AgentConfig, action: NetworkAction) -> Result<()> {
    let ctx = Context::open(config)?;

    match action {
        NetworkAction::Create { name, vni, range } => {
            let network = ctx
                .networks
                .create(NetworkCreate {
                    name,
                    vxlan_vni: vni,
                    ip_range: range,
                })
                .await?;
            println!("Created network {}", network);
            print_network(&network);
        }
        NetworkAction::Ensure { id } => {
            let network = ctx.networks.get(&id).await?;
            let network = ctx.networks.ensure(&network).await?;
            println!("Network {} is converged", network);
        }
        NetworkAction::List { json } => {
            let networks = ctx.networks.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&networks)?);
            } else if networks.is_empty() {
                println!("No networks defined.");
            } else {
                println!("{:<34} {:<16} {:>8} {:<18} NAMESPACE", "ID", "NAME", "VNI", "RANGE");
                for network in networks {
                    println!(
                        "{:<34} {:<16} {:>8} {:<18} {}",
                        network.id,
                        network.name,
                        network.vxlan_vni,
                        network.ip_range,
                        network.ns_handle_path
                    );
                }
            }
        }
        NetworkAction::Show { id } => {
            let network = ctx.networks.get(&id).await?;
            print_network(&network);
            let endpoints = ctx.endpoints.list(&network).await?;
            println!("  Endpoints: {}", endpoints.len());
        }
        NetworkAction::Delete { id } => {
            let network = ctx.networks.delete(&id).await?;
            println!("Deleted network {}", network);
        }
    }

    Ok(())
}

async fn endpoint_command(config: &AgentConfig, action: EndpointAction) -> Result<()> {
    let ctx = Context::open(config)?;

    match action {
        EndpointAction::Create {
            network,
            ip,
            mac,
            activate,
            target_netns,
        } => {
            let network = ctx.networks.get(&network).await?;
            let endpoint = ctx
                .endpoints
                .create(
                    &network,
                    EndpointCreate {
                        ipv4_address: ip,
                        mac_address: mac,
                        activate,
                        target_netns,
                    },
                )
                .await?;
            println!("Created endpoint {}", endpoint);
            println!("  MAC:    {}", endpoint.target_veth_mac);
            println!("  Active: {}", endpoint.active);
        }
        EndpointAction::List { network, json } => {
            let network = ctx.networks.get(&network).await?;
            let endpoints = ctx.endpoints.list(&network).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&endpoints)?);
            } else if endpoints.is_empty() {
                println!("No endpoints in network '{}'.", network.id);
            } else {
                println!("{:<34} {:<18} {:<18} ACTIVE", "ID", "ADDRESS", "MAC");
                for endpoint in endpoints {
                    println!(
                        "{:<34} {:<18} {:<18} {}",
                        endpoint.id,
                        endpoint.target_veth_ip,
                        endpoint.target_veth_mac,
                        if endpoint.active { "yes" } else { "no" }
                    );
                }
            }
        }
        EndpointAction::Delete { network, id } => {
            let network = ctx.networks.get(&network).await?;
            let endpoint = ctx.endpoints.delete(&network, &id).await?;
            println!("Deleted endpoint {}", endpoint);
        }
    }

    Ok(())
}

async fn connect(agent: String, request: TunnelRequest, bind: std::net::SocketAddr) -> Result<()> {
    let client = TunnelClient::new(agent);
    let tunnel = client.connect(&request, bind).await?;

    println!(
        "Tunnel to {}:{} in network {} listening on {}",
        request.ip,
        request.port,
        request.network_id,
        tunnel.local_addr()?
    );

    let stats = tunnel.serve().await?;
    println!(
        "Tunnel closed ({} bytes sent, {} bytes received)",
        stats.forward, stats.backward
    );
    Ok(())
}
