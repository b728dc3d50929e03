// ABOUTME: CLI run command - foreground reconciler
//
// Loads settings, starts the reconciler loop with the socket scanner and a real
// frpc process, queues any --map requests, then prints events until Ctrl-C.
// On exit frpc is stopped; the requested mappings stay persisted.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::info;

use super::{OutputFormat, RunArgs};
use portmapper::config::{AppConfig, Paths};
use portmapper::observer::SocketScanner;
use portmapper::persist::MappingStore;
use portmapper::reconciler::{driver, DriverSettings, Intent, Reconciler, ReconcilerEvent};
use portmapper::supervisor::{ClientSupervisor, FrpcProcess};

/// Execute the run command
pub async fn execute(args: RunArgs, format: OutputFormat, paths: &Paths) -> Result<()> {
    let config = AppConfig::load(paths)?;
    if !config.server.is_complete() {
        if write_starter_config(paths)? {
            info!(path = %paths.config_file().display(), "Wrote default settings");
        }
        bail!(
            "Server settings are incomplete; fill in [server] in {}",
            paths.config_file().display()
        );
    }

    std::fs::create_dir_all(paths.base_dir())
        .with_context(|| format!("Failed to create {}", paths.base_dir().display()))?;
    let cwd = std::env::current_dir().context("Failed to read working directory")?;

    let process = FrpcProcess::new(config.client.clone(), cwd);
    let supervisor = ClientSupervisor::new(process, &config.client);
    let reconciler = Reconciler::new(supervisor, config.server.clone(), paths.client_config())
        .with_store(MappingStore::new(paths.mappings_file()));
    let source = Arc::new(SocketScanner::new(config.scan.show_system_ports));

    let mut handle = driver::spawn(source, reconciler, DriverSettings::from_config(&config));
    info!(
        interval_secs = config.scan.interval().as_secs(),
        config = %paths.client_config().display(),
        "Reconciler started"
    );

    for mapping in args.map {
        handle.send(Intent::MapPort {
            local_port: mapping.local_port,
            remote_port: mapping.remote_port,
        })?;
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(event) => print_event(&event, format)?,
                None => break,
            },
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

/// Write a default `config.toml` for the user to fill in. Returns false and
/// leaves the file alone when one already exists.
fn write_starter_config(paths: &Paths) -> Result<bool> {
    if paths.config_file().exists() {
        return Ok(false);
    }
    AppConfig::default().save(paths)?;
    Ok(true)
}

fn print_event(event: &ReconcilerEvent, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
        OutputFormat::Text => println!("{}", describe(event)),
    }
    Ok(())
}

/// One-line human description of an event
pub fn describe(event: &ReconcilerEvent) -> String {
    match event {
        ReconcilerEvent::PortsUpdated { added, removed } => {
            let added: Vec<String> = added
                .iter()
                .map(|p| format!("{} ({})", p.port, p.process_name))
                .collect();
            let removed: Vec<String> = removed.iter().map(u16::to_string).collect();
            format!(
                "ports: +[{}] -[{}]",
                added.join(", "),
                removed.join(", ")
            )
        }
        ReconcilerEvent::MappingActivated {
            local_port,
            remote_port,
        } => format!("mapped {local_port} -> {remote_port}"),
        ReconcilerEvent::MappingRemoved { local_port } => format!("unmapped {local_port}"),
        ReconcilerEvent::MappingFailed { local_port, reason } => {
            format!("mapping {local_port} failed: {reason}")
        }
        ReconcilerEvent::IntentRejected { local_port, reason } => {
            format!("request for {local_port} rejected: {reason}")
        }
        ReconcilerEvent::ClientAvailabilityChanged { availability } => {
            match (&availability.executable_path, &availability.version) {
                (Some(path), Some(version)) => {
                    format!("frpc found at {} ({version})", path.display())
                }
                (Some(path), None) => format!("frpc found at {}", path.display()),
                (None, _) => "frpc not found".to_string(),
            }
        }
        ReconcilerEvent::ClientStateChanged { state } => format!("frpc {state}"),
        ReconcilerEvent::ObservationFailed { reason } => format!("port scan failed: {reason}"),
    }
}
