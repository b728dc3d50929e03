// ABOUTME: CLI scan command - list listening ports once

use anyhow::{Context, Result};

use super::{OutputFormat, ScanArgs};
use portmapper::config::{AppConfig, Paths};
use portmapper::observer::{PortSnapshot, PortSource, SocketScanner};

/// Execute the scan command
pub async fn execute(args: ScanArgs, format: OutputFormat, paths: &Paths) -> Result<()> {
    let config = AppConfig::load(paths)?;
    let scanner = SocketScanner::new(args.all || config.scan.show_system_ports);

    let snapshot = tokio::task::spawn_blocking(move || scanner.scan())
        .await
        .context("Port scan task failed")?
        .context("Failed to read listening ports")?;

    match format {
        OutputFormat::Json => output_json(&snapshot)?,
        OutputFormat::Text => print!("{}", port_table(&snapshot)),
    }
    Ok(())
}

fn output_json(snapshot: &PortSnapshot) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(snapshot)?);
    Ok(())
}

fn port_table(snapshot: &PortSnapshot) -> String {
    let scanned = snapshot.taken_at().format("%Y-%m-%d %H:%M:%S UTC");
    if snapshot.is_empty() {
        return format!("No listening ports found (scanned {scanned}).\n");
    }

    let mut out = format!("Scanned at {scanned}\n\n");
    out.push_str(&format!("{:<8} PROCESS\n", "PORT"));
    out.push_str(&"-".repeat(40));
    out.push('\n');
    for port in snapshot.ports() {
        out.push_str(&format!("{:<8} {}\n", port.port, port.process_name));
    }
    out
}
