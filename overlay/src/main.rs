//! Intersection overlay CLI

use clap::{Arg, ArgAction, Command};
use intersect_overlay::{
    client::Client,
    coordinator::deploy,
    mocks,
    node::{Config, Node},
    server,
    topology::{Planner, Topology},
    Address, Error,
};
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Flag for JSON output
const JSON_FLAG: &str = "json";

const PLAN_CMD: &str = "plan";
const SIMULATE_CMD: &str = "simulate";

fn topology_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("committees")
                .long("committees")
                .required(true)
                .help("Number of committees")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("intersections")
                .long("intersections")
                .required(true)
                .help("Peers bridging each pair of committees")
                .value_parser(clap::value_parser!(usize)),
        )
}

fn planned(matches: &clap::ArgMatches) -> Result<Topology, Error> {
    let committees = *matches.get_one::<usize>("committees").unwrap();
    let intersections = *matches.get_one::<usize>("intersections").unwrap();
    Planner::new(committees, intersections).plan()
}

/// Write the planned assignment as YAML.
fn plan(topology: &Topology, output: Option<&PathBuf>) -> Result<(), Error> {
    let yaml = serde_yaml::to_string(topology).map_err(|e| Error::InvalidTopology(e.to_string()))?;
    match output {
        Some(path) => {
            std::fs::write(path, yaml)?;
            info!(path = ?path, peers = topology.peers.len(), "wrote topology");
        }
        None => print!("{yaml}"),
    }
    Ok(())
}

/// Run one node per planned peer on localhost and deploy the topology across them.
async fn simulate(topology: &Topology, base_port: u16) -> Result<(), Error> {
    let config = Config::default();
    let runtime = mocks::Runtime::default();
    let mut hosts = Vec::with_capacity(topology.peers.len());
    for peer in &topology.peers {
        let port = u16::try_from(peer.index)
            .ok()
            .and_then(|offset| base_port.checked_add(offset))
            .ok_or_else(|| Error::InvalidTopology("port range exhausted".into()))?;
        let address = Address::new("127.0.0.1", port);
        let listener = TcpListener::bind((address.ip.as_str(), port)).await?;
        let node = Arc::new(Node::new(config.clone(), address.clone(), runtime.clone())?);
        tokio::spawn(async move {
            if let Err(e) = server::serve(node, listener).await {
                error!(error = ?e, "node stopped");
            }
        });
        hosts.push(address);
    }

    let client = Client::new(&config)?;
    deploy(&client, topology, &hosts).await?;
    info!(
        committees = topology.committees,
        nodes = hosts.len(),
        first = %hosts[0],
        "simulation running"
    );
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Entrypoint for the intersection overlay CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("intersect")
        .version(crate_version())
        .about("Plan and simulate committees bridged by intersection peers.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(JSON_FLAG)
                .long(JSON_FLAG)
                .help("Emit logs as JSON")
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            topology_args(Command::new(PLAN_CMD).about("Assign committee pairs to peers."))
                .arg(
                    Arg::new("output")
                        .long("output")
                        .help("Path to write the YAML assignment to (stdout if omitted)")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            topology_args(
                Command::new(SIMULATE_CMD)
                    .about("Run every planned peer on localhost against in-memory consensus."),
            )
            .arg(
                Arg::new("base-port")
                    .long("base-port")
                    .default_value("5000")
                    .help("Port of the first node (node i listens on base-port + i)")
                    .value_parser(clap::value_parser!(u16)),
            ),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    if matches.get_flag(JSON_FLAG) {
        tracing_subscriber::fmt().json().with_max_level(level).init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }

    // Parse subcommands
    match matches.subcommand() {
        Some((PLAN_CMD, matches)) => {
            let output = matches.get_one::<PathBuf>("output");
            match planned(matches).and_then(|topology| plan(&topology, output)) {
                Ok(()) => return std::process::ExitCode::SUCCESS,
                Err(e) => error!(error = ?e, "failed to plan topology"),
            }
        }
        Some((SIMULATE_CMD, matches)) => {
            let base_port = *matches.get_one::<u16>("base-port").unwrap();
            let result = match planned(matches) {
                Ok(topology) => simulate(&topology, base_port).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return std::process::ExitCode::SUCCESS,
                Err(e) => error!(error = ?e, "simulation failed"),
            }
        }
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
        }
        None => {
            error!("no subcommand provided");
        }
    }
    std::process::ExitCode::FAILURE
}
