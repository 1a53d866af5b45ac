//! Command-line interface for NATlab.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// NATlab - testbed for NAT traversal software
#[derive(Parser, Debug)]
#[command(
    name = "natlab",
    author,
    version,
    about = "Testbed for studying NAT gateway behavior",
    long_about = r#"
NATlab runs the three sides of a NAT traversal experiment:

  - A configurable NAT box that intercepts and mangles packets between a
    LAN and a WAN interface, reproducing the full RFC 4787 taxonomy of
    mapping, filtering, pooling and port-assignment behaviors.
  - A probe server that reflects UDP requests from multiple endpoints.
  - A probe client that characterizes the NAT in front of it.

QUICK START:
  NAT box:  natlab nat --lan-interface eth0 --wan-interface eth1
  Server:   natlab probe-server
  Client:   natlab probe
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Intercept and mangle packets, acting as a NAT box
    Nat(NatArgs),

    /// Reflect UDP probes from every public address on this host
    ProbeServer(ProbeServerArgs),

    /// Characterize the NAT between this host and the probe servers
    Probe(ProbeArgs),
}

/// NAT box arguments
#[derive(Args, Debug)]
pub struct NatArgs {
    /// Name of the LAN interface
    #[arg(long)]
    pub lan_interface: String,

    /// Name of the WAN interface
    #[arg(long)]
    pub wan_interface: String,
}

/// Probe server arguments
#[derive(Args, Debug)]
pub struct ProbeServerArgs {
    /// UDP listener ports
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "80,443,500,1194,1701,1723,3478,4500,5060,5061,51820,60000"
    )]
    pub ports: Vec<u16>,
}

/// Probe client arguments
#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Probe server hostnames (defaults from config)
    #[arg(long, value_delimiter = ',')]
    pub servers: Vec<String>,

    /// Destination ports to probe (defaults from config)
    #[arg(long, value_delimiter = ',')]
    pub ports: Vec<u16>,

    /// Replace observed IPs with generated ones in the output
    #[arg(long)]
    pub anonymize: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nat_requires_both_interfaces() {
        assert!(Cli::try_parse_from(["natlab", "nat", "--lan-interface", "eth0"]).is_err());
        let cli = Cli::try_parse_from([
            "natlab",
            "nat",
            "--lan-interface",
            "eth0",
            "--wan-interface",
            "eth1",
        ])
        .unwrap();
        match cli.command {
            Commands::Nat(args) => {
                assert_eq!(args.lan_interface, "eth0");
                assert_eq!(args.wan_interface, "eth1");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn probe_server_default_ports() {
        let cli = Cli::try_parse_from(["natlab", "probe-server"]).unwrap();
        match cli.command {
            Commands::ProbeServer(args) => {
                assert_eq!(args.ports.len(), 12);
                assert!(args.ports.contains(&3478));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn probe_server_port_list_parses() {
        let cli = Cli::try_parse_from(["natlab", "probe-server", "--ports", "1000,2000"]).unwrap();
        match cli.command {
            Commands::ProbeServer(args) => assert_eq!(args.ports, vec![1000, 2000]),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
