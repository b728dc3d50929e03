// ABOUTME: CLI argument parsing and command routing for portmapper
//
// Provides command-line interface for:
// - Running the reconciler in the foreground (run)
// - Listing listening ports (scan)
// - Previewing the frpc configuration (render)
// - Checking for the frpc executable (locate)

pub mod locate;
pub mod render;
pub mod run;
pub mod scan;

use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Keep selected local ports reachable through an frp tunnel
#[derive(Parser)]
#[command(name = "portmapper")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Base directory for config, mappings and logs (default ~/.portmapper)
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,
}

/// Output format for commands
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Watch ports and keep frpc in sync until Ctrl-C
    Run(RunArgs),

    /// List listening ports once
    Scan(ScanArgs),

    /// Print the frpc configuration for a set of mappings
    Render(RenderArgs),

    /// Look for the frpc executable
    Locate,
}

/// A `LOCAL[:REMOTE]` mapping argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingArg {
    /// Port on this host
    pub local_port: u16,
    /// Port on the tunnel server
    pub remote_port: u16,
}

/// Parse `LOCAL[:REMOTE]`; the remote port defaults to the local port
pub fn parse_mapping(value: &str) -> Result<MappingArg, String> {
    let parse_port = |s: &str| -> Result<u16, String> {
        match s.trim().parse::<u16>() {
            Ok(0) | Err(_) => Err(format!("'{s}' is not a port between 1 and 65535")),
            Ok(port) => Ok(port),
        }
    };

    let (local, remote) = match value.split_once(':') {
        Some((local, remote)) => (parse_port(local)?, parse_port(remote)?),
        None => {
            let port = parse_port(value)?;
            (port, port)
        }
    };

    Ok(MappingArg {
        local_port: local,
        remote_port: remote,
    })
}

/// Collapse mapping arguments into a local -> remote map; later ones win
pub fn mapping_set(args: &[MappingArg]) -> BTreeMap<u16, u16> {
    args.iter().map(|m| (m.local_port, m.remote_port)).collect()
}

/// Arguments for the run command
#[derive(clap::Args)]
pub struct RunArgs {
    /// Map a port on startup, as LOCAL or LOCAL:REMOTE (repeatable)
    #[arg(long = "map", value_name = "LOCAL[:REMOTE]", value_parser = parse_mapping)]
    pub map: Vec<MappingArg>,
}

/// Arguments for the scan command
#[derive(clap::Args)]
pub struct ScanArgs {
    /// Include ports below 1024
    #[arg(long, short)]
    pub all: bool,
}

/// Arguments for the render command
#[derive(clap::Args)]
pub struct RenderArgs {
    /// Mapping to include, as LOCAL or LOCAL:REMOTE (repeatable)
    #[arg(long = "map", value_name = "LOCAL[:REMOTE]", value_parser = parse_mapping, required = true)]
    pub map: Vec<MappingArg>,
}
