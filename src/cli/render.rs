// ABOUTME: CLI render command - print the frpc configuration for given mappings
//
// Nothing is written; this shows exactly what the reconciler would put on disk
// for the same mapping set and server settings.

use anyhow::{Context, Result};
use serde::Serialize;

use super::{mapping_set, OutputFormat, RenderArgs};
use portmapper::config::{AppConfig, Paths};
use portmapper::synth;

#[derive(Serialize)]
struct RenderOutput<'a> {
    path: String,
    proxies: Vec<String>,
    config: &'a str,
}

/// Execute the render command
#[allow(clippy::unused_async)] // Async for consistency with other CLI commands
pub async fn execute(args: RenderArgs, format: OutputFormat, paths: &Paths) -> Result<()> {
    let config = AppConfig::load(paths)?;
    let mappings = mapping_set(&args.map);
    let rendered = synth::render(&mappings, &config.server).context("Failed to render config")?;

    match format {
        OutputFormat::Text => print!("{}", rendered.as_str()),
        OutputFormat::Json => {
            let output = RenderOutput {
                path: paths.client_config().display().to_string(),
                proxies: mappings
                    .iter()
                    .map(|(&local, &remote)| synth::proxy_name(local, remote))
                    .collect(),
                config: rendered.as_str(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}
