//! Command-line interface for netferry
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// netferry - single-host overlay network agent
#[derive(Parser)]
#[command(name = "netferry")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/netferry/netferry.toml")]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent API and the overlay reconciler
    Agent,

    /// Manage networks
    Network {
        #[command(subcommand)]
        action: NetworkAction,
    },

    /// Manage endpoints of a network
    Endpoint {
        #[command(subcommand)]
        action: EndpointAction,
    },

    /// Open a tunnel to an address inside a network
    Connect {
        /// Agent API address (defaults to the configured listen address)
        #[arg(short, long)]
        agent: Option<String>,

        /// Network ID
        #[arg(short, long)]
        network: String,

        /// Target address inside the network
        #[arg(long)]
        ip: Ipv4Addr,

        /// Target port
        #[arg(short, long)]
        port: u16,

        /// Local address to expose the tunnel on
        #[arg(short, long, default_value = "127.0.0.1:0")]
        bind: SocketAddr,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Dial a target from inside a namespace and hand it to a rendezvous socket
    #[command(name = "netns-pipe-socket", hide = true)]
    NetnsPipeSocket {
        /// Namespace handle file
        ns_path: PathBuf,

        ip: Ipv4Addr,

        port: u16,

        /// Unix socket the agent is waiting on
        rendezvous: PathBuf,
    },
}

/// Actions for the network command
#[derive(Subcommand)]
pub enum NetworkAction {
    /// Create a network with its namespace, bridge and VXLAN
    Create {
        /// Network name
        name: String,

        /// VXLAN network identifier (lowest free one if not specified)
        #[arg(long)]
        vni: Option<u32>,

        /// Address range in CIDR notation (e.g., 10.0.1.0/24)
        #[arg(short, long)]
        range: Option<String>,
    },

    /// Re-provision a network's namespace and overlay
    Ensure {
        /// Network ID
        id: String,
    },

    /// List all networks
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show one network
    Show {
        /// Network ID
        id: String,
    },

    /// Delete a network without endpoints
    Delete {
        /// Network ID
        id: String,
    },
}

/// Actions for the endpoint command
#[derive(Subcommand)]
pub enum EndpointAction {
    /// Allocate an address and create an endpoint
    Create {
        /// Network ID
        network: String,

        /// IP address (lowest free one if not specified)
        #[arg(short, long)]
        ip: Option<Ipv4Addr>,

        /// MAC address (derived from the IP if not specified)
        #[arg(short, long)]
        mac: Option<String>,

        /// Wire the endpoint into a namespace right away
        #[arg(long, requires = "target_netns")]
        activate: bool,

        /// Namespace that receives the endpoint's interface
        #[arg(long)]
        target_netns: Option<PathBuf>,
    },

    /// List endpoints of a network
    List {
        /// Network ID
        network: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Delete an endpoint and release its address
    Delete {
        /// Network ID
        network: String,

        /// Endpoint ID
        id: String,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "netferry", &mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_worker_positional_contract() {
        let cli = Cli::try_parse_from([
            "netferry",
            "netns-pipe-socket",
            "/var/run/netferry/netns/abc",
            "10.0.0.5",
            "8080",
            "/tmp/netferry-connect-00.sock",
        ])
        .unwrap();

        match cli.command {
            Commands::NetnsPipeSocket {
                ns_path,
                ip,
                port,
                rendezvous,
            } => {
                assert_eq!(ns_path, PathBuf::from("/var/run/netferry/netns/abc"));
                assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 5));
                assert_eq!(port, 8080);
                assert_eq!(rendezvous, PathBuf::from("/tmp/netferry-connect-00.sock"));
            }
            _ => panic!("expected worker command"),
        }
    }

    #[test]
    fn test_activate_needs_target() {
        let parsed = Cli::try_parse_from(["netferry", "endpoint", "create", "net1", "--activate"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from([
            "netferry",
            "endpoint",
            "create",
            "net1",
            "--activate",
            "--target-netns",
            "/proc/42/ns/net",
        ]);
        assert!(parsed.is_ok());
    }
}
