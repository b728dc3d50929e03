// ABOUTME: CLI locate command - report whether frpc can be found and its version

use anyhow::{Context, Result};

use super::OutputFormat;
use portmapper::config::{AppConfig, Paths};
use portmapper::supervisor::locate::check_availability;

/// Execute the locate command
pub async fn execute(format: OutputFormat, paths: &Paths) -> Result<()> {
    let config = AppConfig::load(paths)?;
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    let availability = check_availability(&config.client, &cwd).await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&availability)?),
        OutputFormat::Text => match &availability.executable_path {
            Some(path) => {
                println!("frpc: {}", path.display());
                println!(
                    "version: {}",
                    availability.version.as_deref().unwrap_or("unknown")
                );
            }
            None => {
                println!("frpc not found.");
                println!("Put frpc in the working directory, on PATH, or set [client] executable.");
            }
        },
    }
    Ok(())
}
