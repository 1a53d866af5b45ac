//! NATlab CLI - NAT behavior testbed.

use std::collections::HashMap;

use clap::Parser;
use colored::Colorize;
use tracing::info;

use natlab::cli::{Cli, Commands, NatArgs, ProbeArgs, ProbeServerArgs};
use natlab::config::{self, Config};
use natlab::error::{Error, Result};
use natlab::nat::{NatRunner, TweakableNat};
use natlab::probe::{self, ProbeServer};
use natlab::types::InterfaceRole;
use natlab::util;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = config::LoggingConfig {
        level: cli.log_level.clone(),
        color: !cli.no_color,
        ..Default::default()
    };
    config::init_logging(&log_config)?;

    if cli.no_color {
        colored::control::set_override(false);
    }

    let config = match cli.config {
        Some(ref path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        // The datapath loop is synchronous; keep it off the async runtime.
        Commands::Nat(args) => tokio::task::spawn_blocking(move || run_nat(args, config))
            .await
            .map_err(|e| Error::Internal(format!("datapath thread failed: {e}")))?,
        Commands::ProbeServer(args) => run_probe_server(args).await,
        Commands::Probe(args) => run_probe(args, config).await,
    }
}

/// Run the NAT datapath between the two named interfaces.
fn run_nat(args: NatArgs, config: Config) -> Result<()> {
    info!(version = natlab::VERSION, "starting NAT box");

    let lan_index = util::interface_index(&args.lan_interface)
        .ok_or_else(|| Error::InterfaceNotFound(args.lan_interface.clone()))?;
    let wan_index = util::interface_index(&args.wan_interface)
        .ok_or_else(|| Error::InterfaceNotFound(args.wan_interface.clone()))?;

    let wan_ips = util::interface_wan_ips(&args.wan_interface);
    if wan_ips.is_empty() {
        return Err(Error::Config(format!(
            "no usable IPv4 addresses on WAN interface {}",
            args.wan_interface
        )));
    }
    info!(
        lan = %args.lan_interface,
        wan = %args.wan_interface,
        wan_ips = wan_ips.len(),
        "interfaces resolved"
    );

    let translator = TweakableNat::new(config.nat, wan_ips)?;
    let roles = HashMap::from([
        (lan_index, InterfaceRole::Lan),
        (wan_index, InterfaceRole::Wan),
    ]);

    let mut runner = NatRunner::new(Box::new(translator), roles);
    runner.run()
}

/// Run the probe reflector on every public IPv4 this host owns.
async fn run_probe_server(args: ProbeServerArgs) -> Result<()> {
    let ips = util::public_ipv4s();
    if ips.is_empty() {
        return Err(Error::Config(
            "no public IPv4 addresses available to listen on".into(),
        ));
    }

    let server = ProbeServer::bind(&ips, &args.ports).await?;
    server.run().await
}

/// Run the probe client and print the report.
async fn run_probe(args: ProbeArgs, mut config: Config) -> Result<()> {
    if !args.servers.is_empty() {
        config.probe.servers = args.servers;
    }
    if !args.ports.is_empty() {
        config.probe.ports = args.ports;
    }

    let mut report = probe::probe(&config.probe).await?;
    if args.anonymize {
        report.anonymize();
    }
    let analysis = report.analyze();

    println!("{}", "Raw observations".bold());
    println!("{report}");
    println!();
    println!("{}", "What this means".bold());
    println!("{}", analysis.narrative());

    Ok(())
}
